//! The coordination-store client.
//!
//! Every cross-node signal in this protocol flows through a durable,
//! replicated key-value store with change notification. The store itself
//! (etcd, Zookeeper, or Kimberlite's own metadata service) is an external
//! collaborator; this module defines the seam the rest of the crate is
//! written against, plus an in-memory double used by every test in this
//! crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Errors a coordination-store client can raise.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The store was unreachable. Callers that must not lose the write
    /// retry this through [`crate::retry::retry_write`].
    #[error("coordination store transient error: {0}")]
    Transient(String),
}

/// One change-notification delivered to a `watch_children` callback.
///
/// `value: None` signals a deletion. Delivery is at-least-once; ordering
/// between independent paths is not guaranteed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub value: Option<String>,
    pub revision: u64,
}

/// Durable set/get/delete plus a watch-children subscription.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Durable write. Fails with [`StoreError::Transient`] if the
    /// underlying store is unreachable; callers that must not lose the
    /// write wrap this with the retry helper.
    async fn put(&self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Point read; `Ok(None)` if the key does not exist.
    async fn get(&self, path: &str) -> Result<Option<String>, StoreError>;

    /// Idempotent delete. Deleting a non-existent key is not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Registers a long-running subscription under `prefix`. Returns a
    /// [`WatchHandle`] whose `stop()` ends the subscription: after it
    /// returns, no further callbacks start, and any in-flight callback has
    /// already been awaited.
    async fn watch_children(
        &self,
        prefix: &str,
        callback: WatchCallback,
    ) -> Result<WatchHandle, StoreError>;
}

/// A boxed callback invoked for every create/update/delete under a
/// watched prefix.
pub type WatchCallback = Box<dyn Fn(WatchEvent) + Send + Sync>;

/// Handle to a live `watch_children` subscription.
pub struct WatchHandle {
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WatchHandle {
    fn new(stop_tx: tokio::sync::oneshot::Sender<()>, task: tokio::task::JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stops the subscription. Blocks until the dispatch task has
    /// observed the stop signal and exited, guaranteeing no further
    /// callbacks fire after this returns.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    revision: u64,
}

/// An in-memory [`CoordinationStore`] used by every test in this crate,
/// including the monotonicity and idempotence property tests. Backed by a
/// mutex-protected map and a broadcast channel.
pub struct InMemoryCoordinationStore {
    data: Mutex<HashMap<String, Entry>>,
    next_revision: Mutex<u64>,
    events: broadcast::Sender<WatchEvent>,
    /// When set, every event is delivered twice to exercise idempotent
    /// notification handling.
    duplicate_deliveries: bool,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            data: Mutex::new(HashMap::new()),
            next_revision: Mutex::new(1),
            events,
            duplicate_deliveries: false,
        })
    }

    /// A store that redelivers every change twice, for at-least-once delivery idempotence
    /// tests.
    pub fn new_with_duplicate_deliveries() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            data: Mutex::new(HashMap::new()),
            next_revision: Mutex::new(1),
            events,
            duplicate_deliveries: true,
        })
    }

    async fn next_revision(&self) -> u64 {
        let mut rev = self.next_revision.lock().await;
        let current = *rev;
        *rev += 1;
        current
    }
}

impl Default for Arc<InMemoryCoordinationStore> {
    fn default() -> Self {
        InMemoryCoordinationStore::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn put(&self, path: &str, value: &str) -> Result<(), StoreError> {
        let revision = self.next_revision().await;
        self.data.lock().await.insert(
            path.to_string(),
            Entry {
                value: value.to_string(),
                revision,
            },
        );
        let event = WatchEvent {
            path: path.to_string(),
            value: Some(value.to_string()),
            revision,
        };
        let _ = self.events.send(event.clone());
        if self.duplicate_deliveries {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.lock().await.get(path).map(|e| e.value.clone()))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let revision = self.next_revision().await;
        self.data.lock().await.remove(path);
        let event = WatchEvent {
            path: path.to_string(),
            value: None,
            revision,
        };
        let _ = self.events.send(event.clone());
        if self.duplicate_deliveries {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn watch_children(
        &self,
        prefix: &str,
        callback: WatchCallback,
    ) -> Result<WatchHandle, StoreError> {
        let mut rx = self.events.subscribe();
        let prefix = prefix.to_string();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        break;
                    }
                    event = rx.recv() => {
                        match event {
                            Ok(event) if event.path.starts_with(&prefix) => callback(event),
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        Ok(WatchHandle::new(stop_tx, task))
    }
}
