//! # In-Memory Remote Store
//!
//! A process-local [`RemoteStore`] used by the demo binary and the test
//! suites. It behaves like the real document store where the sync service
//! can observe it (idempotent delivery tokens, server timestamps, live
//! snapshots filtered by unit) and adds fault injection:
//!
//! - [`set_online`](MemoryRemote::set_online): every call fails `unavailable`
//! - [`fail_next`](MemoryRemote::fail_next): queue errors for upcoming writes
//! - [`deny`](MemoryRemote::deny): reject writes to a collection with
//!   `permission-denied`, as security rules would
//! - [`break_subscriptions`](MemoryRemote::break_subscriptions): push an
//!   error into every live subscription and drop it

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RemoteQuery, RemoteStore, RemoteSubscription, RemoteWrite, WriteKind};
use crate::error::{RemoteError, RemoteResult};
use ward_core::{Collection, Payload, Record};

struct Subscriber {
    query: RemoteQuery,
    tx: mpsc::UnboundedSender<RemoteResult<Vec<Record>>>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<Collection, BTreeMap<String, Payload>>,
    applied: HashSet<String>,
    offline: bool,
    fail_next: VecDeque<RemoteError>,
    denied: HashSet<Collection>,
    write_log: Vec<RemoteWrite>,
    subscribers: Vec<Subscriber>,
}

impl Inner {
    fn snapshot(&self, query: &RemoteQuery) -> Vec<Record> {
        let Some(docs) = self.docs.get(&query.collection) else {
            return Vec::new();
        };

        docs.iter()
            .filter_map(|(id, doc)| match Record::from_document(id, doc.clone()) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(collection = %query.collection, id = %id, error = %e, "Skipping malformed document");
                    None
                }
            })
            .filter(|record| query.matches(record))
            .collect()
    }

    fn notify(&mut self, collection: Collection) {
        self.subscribers.retain(|s| !s.tx.is_closed());

        let snapshots: Vec<_> = self
            .subscribers
            .iter()
            .filter(|s| s.query.collection == collection)
            .map(|s| (s.tx.clone(), self.snapshot(&s.query)))
            .collect();

        for (tx, snapshot) in snapshots {
            let _ = tx.send(Ok(snapshot));
        }
    }

    fn apply(&mut self, write: &RemoteWrite) {
        let now = Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let docs = self.docs.entry(write.collection).or_default();

        match &write.kind {
            WriteKind::Create(fields) => {
                let mut doc = fields.clone();
                doc.remove("id");
                if write.stamps.created {
                    doc.insert("createdAt".to_string(), now.clone());
                }
                if write.stamps.updated {
                    doc.insert("updatedAt".to_string(), now);
                }
                docs.insert(write.doc_id.clone(), doc);
            }
            WriteKind::Merge(fields) => {
                let doc = docs.entry(write.doc_id.clone()).or_default();
                for (key, value) in fields {
                    if key != "id" {
                        doc.insert(key.clone(), value.clone());
                    }
                }
                if write.stamps.updated {
                    doc.insert("updatedAt".to_string(), now);
                }
            }
            WriteKind::Delete => {
                docs.remove(&write.doc_id);
            }
        }
    }
}

/// In-process remote document store with fault injection.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Makes the store reachable or unreachable.
    pub fn set_online(&self, online: bool) {
        self.lock().offline = !online;
    }

    /// Fails the next write with `error` (queued, first in first out).
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().fail_next.push_back(error);
    }

    /// Rejects every write to `collection` with `permission-denied`.
    pub fn deny(&self, collection: Collection) {
        self.lock().denied.insert(collection);
    }

    /// Lifts a [`deny`](Self::deny).
    pub fn allow(&self, collection: Collection) {
        self.lock().denied.remove(&collection);
    }

    /// Sends `error` to every live subscription and closes them.
    pub fn break_subscriptions(&self, error: RemoteError) {
        let subscribers = std::mem::take(&mut self.lock().subscribers);
        for subscriber in subscribers {
            let _ = subscriber.tx.send(Err(error.clone()));
        }
    }

    // =========================================================================
    // Direct Access
    // =========================================================================

    /// Writes a document as another client would, notifying subscribers.
    pub fn seed(&self, collection: Collection, id: &str, document: Payload) {
        let mut inner = self.lock();
        inner
            .docs
            .entry(collection)
            .or_default()
            .insert(id.to_string(), document);
        inner.notify(collection);
    }

    /// Returns a stored document.
    pub fn document(&self, collection: Collection, id: &str) -> Option<Payload> {
        self.lock()
            .docs
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Returns the number of stored documents in a collection.
    pub fn document_count(&self, collection: Collection) -> usize {
        self.lock().docs.get(&collection).map_or(0, BTreeMap::len)
    }

    /// Returns every applied write, in order. Repeated tokens are not logged twice.
    pub fn write_log(&self) -> Vec<RemoteWrite> {
        self.lock().write_log.clone()
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn write(&self, write: RemoteWrite) -> RemoteResult<()> {
        let mut inner = self.lock();

        if inner.offline {
            return Err(RemoteError::unavailable("remote store unreachable"));
        }
        if let Some(error) = inner.fail_next.pop_front() {
            return Err(error);
        }
        if inner.denied.contains(&write.collection) {
            return Err(RemoteError::permission_denied(format!(
                "write to {}/{} denied",
                write.collection, write.doc_id
            )));
        }
        if inner.applied.contains(&write.mutation_id) {
            debug!(mutation_id = %write.mutation_id, "Duplicate delivery acknowledged");
            return Ok(());
        }

        inner.apply(&write);
        inner.applied.insert(write.mutation_id.clone());
        let collection = write.collection;
        inner.write_log.push(write);
        inner.notify(collection);
        Ok(())
    }

    async fn subscribe(&self, query: RemoteQuery) -> RemoteResult<RemoteSubscription> {
        let mut inner = self.lock();

        if inner.offline {
            return Err(RemoteError::unavailable("remote store unreachable"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(inner.snapshot(&query)));
        inner.subscribers.push(Subscriber { query, tx });

        Ok(RemoteSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ServerStamps;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn create(mutation_id: &str, doc_id: &str, fields: Value) -> RemoteWrite {
        RemoteWrite {
            mutation_id: mutation_id.to_string(),
            origin: "test".to_string(),
            collection: Collection::Patients,
            doc_id: doc_id.to_string(),
            kind: WriteKind::Create(payload(fields)),
            stamps: ServerStamps {
                created: true,
                updated: true,
            },
        }
    }

    #[tokio::test]
    async fn test_create_stamps_timestamps() {
        let remote = MemoryRemote::new();
        remote
            .write(create("m-1", "p-1", json!({"name": "Doe", "unitId": "icu"})))
            .await
            .unwrap();

        let doc = remote.document(Collection::Patients, "p-1").unwrap();
        assert_eq!(doc.get("name"), Some(&json!("Doe")));
        assert!(doc.contains_key("createdAt"));
        assert!(doc.contains_key("updatedAt"));
    }

    #[tokio::test]
    async fn test_repeated_token_is_noop() {
        let remote = MemoryRemote::new();
        remote
            .write(create("m-1", "p-1", json!({"name": "Doe"})))
            .await
            .unwrap();
        remote.seed(Collection::Patients, "p-1", payload(json!({"name": "Changed"})));

        // same token again: acknowledged, not applied
        remote
            .write(create("m-1", "p-1", json!({"name": "Doe"})))
            .await
            .unwrap();

        let doc = remote.document(Collection::Patients, "p-1").unwrap();
        assert_eq!(doc.get("name"), Some(&json!("Changed")));
        assert_eq!(remote.write_log().len(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemote::new();

        remote.set_online(false);
        let err = remote.write(create("m-1", "p-1", json!({}))).await.unwrap_err();
        assert!(err.is_transient());

        remote.set_online(true);
        remote.deny(Collection::Patients);
        let err = remote.write(create("m-2", "p-1", json!({}))).await.unwrap_err();
        assert!(err.is_fatal());

        remote.allow(Collection::Patients);
        remote.fail_next(RemoteError::invalid_argument("bad"));
        assert!(remote.write(create("m-3", "p-1", json!({}))).await.is_err());
        assert!(remote.write(create("m-3", "p-1", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_snapshots_filtered_by_unit() {
        let remote = MemoryRemote::new();
        remote.seed(Collection::Patients, "p-1", payload(json!({"unitId": "icu", "name": "A"})));
        remote.seed(Collection::Patients, "p-2", payload(json!({"unitId": "ward-b", "name": "B"})));

        let mut sub = remote
            .subscribe(RemoteQuery::for_unit(Collection::Patients, "icu"))
            .await
            .unwrap();

        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "p-1");

        remote
            .write(create("m-1", "p-3", json!({"unitId": "icu", "name": "C"})))
            .await
            .unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.len(), 2);

        remote.break_subscriptions(RemoteError::unavailable("gone"));
        assert!(sub.next().await.unwrap().is_err());
        assert!(sub.next().await.is_none());
        assert_eq!(remote.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_merge_and_delete() {
        let remote = MemoryRemote::new();
        remote
            .write(create("m-1", "p-1", json!({"name": "Doe", "bed": 1})))
            .await
            .unwrap();

        remote
            .write(RemoteWrite {
                kind: WriteKind::Merge(payload(json!({"bed": 2}))),
                stamps: ServerStamps {
                    created: false,
                    updated: true,
                },
                ..create("m-2", "p-1", json!({}))
            })
            .await
            .unwrap();
        let doc = remote.document(Collection::Patients, "p-1").unwrap();
        assert_eq!(doc.get("bed"), Some(&json!(2)));
        assert_eq!(doc.get("name"), Some(&json!("Doe")));

        remote
            .write(RemoteWrite {
                kind: WriteKind::Delete,
                stamps: ServerStamps::default(),
                ..create("m-3", "p-1", json!({}))
            })
            .await
            .unwrap();
        assert!(remote.document(Collection::Patients, "p-1").is_none());
    }
}
