use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::message::Message;

/// A handler failure, caught per candidate and logged; it never aborts the
/// poll cycle and never reaches the sender.
#[derive(Clone, Debug, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(String);

impl ListenerError {
    /// Creates a new listener error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Context handed to listeners alongside the incoming record.
#[derive(Clone, Debug)]
pub struct ListenerContext {
    /// Node id of the engine dispatching the record.
    pub node_id: String,
}

/// A trait representing a handler for incoming messages.
///
/// Returning `Ok(Some(answer))` sends the answer back to the original
/// sender with the back-reference id stamped by the engine.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    /// Handles an incoming record.
    async fn on_message(
        &self,
        context: &ListenerContext,
        message: Message,
    ) -> Result<Option<Message>, ListenerError>;
}

/// Handle for removing a registered listener.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

struct RegisteredListener {
    id: ListenerId,
    name: Option<String>,
    handler: Arc<dyn MessageListener>,
}

/// Listener registry shared between the poll loop and caller contexts.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<RegisteredListener>>,
}

impl ListenerRegistry {
    /// Registers `handler`, optionally restricted to one topic name.
    pub async fn add(
        &self,
        name: Option<String>,
        handler: Arc<dyn MessageListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .await
            .push(RegisteredListener { id, name, handler });
        id
    }

    /// Removes a listener; returns whether it was present.
    pub async fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Snapshot of the handlers whose name filter matches `name`.
    pub async fn matching(&self, name: &str) -> Vec<Arc<dyn MessageListener>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.name.as_deref().is_none_or(|filter| filter == name))
            .map(|entry| Arc::clone(&entry.handler))
            .collect()
    }

    /// Topic names the poll scan may restrict itself to: `None` when a
    /// generic (unfiltered) listener is registered.
    pub async fn name_filter(&self) -> Option<Vec<String>> {
        let entries = self.entries.read().await;
        let mut names = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            match &entry.name {
                Some(name) => {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                None => return None,
            }
        }
        Some(names)
    }
}

impl Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry").finish_non_exhaustive()
    }
}
