use dashmap::DashMap;
use sfr_telemetry::record_gauge;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{CorrelationToken, VisitorFrame};

/// Frames buffered per visitor before deliveries start failing.
pub const VISITOR_QUEUE_CAPACITY: usize = 32;

const CONNECTED_GAUGE: &str = "relay_visitors_connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("visitor connection is closed")]
    Closed,
    #[error("visitor outbound queue is full")]
    Full,
}

/// Sending side of one live visitor connection.
///
/// The connection task owns the matching receiver; once it drops it the handle is
/// no longer open.
#[derive(Debug, Clone)]
pub struct VisitorHandle {
    id: Uuid,
    tx: mpsc::Sender<VisitorFrame>,
}

impl VisitorHandle {
    pub fn channel() -> (Self, mpsc::Receiver<VisitorFrame>) {
        Self::with_capacity(VISITOR_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<VisitorFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    /// Identifier of the underlying connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues a frame for the connection task without waiting.
    pub fn deliver(&self, frame: VisitorFrame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub token: CorrelationToken,
    pub handle: VisitorHandle,
    pub registered_at: OffsetDateTime,
}

/// Live mapping from correlation token to visitor connection.
///
/// Last write wins: registering a token that is already present replaces the entry
/// and leaves the displaced connection open but unreachable.
///
/// ```
/// use sfr_core::{ConnectionRegistry, CorrelationToken, VisitorHandle};
///
/// let registry = ConnectionRegistry::new();
/// let token = CorrelationToken::parse("abc123").unwrap();
/// let (handle, _rx) = VisitorHandle::channel();
/// registry.register(token.clone(), handle.clone());
/// assert_eq!(registry.lookup(&token).unwrap().id(), handle.id());
/// ```
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: DashMap<CorrelationToken, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `token`, returning the displaced entry.
    pub fn register(
        &self,
        token: CorrelationToken,
        handle: VisitorHandle,
    ) -> Option<ConnectionEntry> {
        let entry = ConnectionEntry {
            token: token.clone(),
            handle,
            registered_at: OffsetDateTime::now_utc(),
        };
        let previous = self.inner.insert(token, entry);
        self.publish_size();
        previous
    }

    /// Removes the entry for `token`. Returns whether anything was removed.
    pub fn unregister(&self, token: &CorrelationToken) -> bool {
        let removed = self.inner.remove(token).is_some();
        if removed {
            self.publish_size();
        }
        removed
    }

    /// Removes the entry only while it still belongs to `connection_id`.
    pub fn release(&self, token: &CorrelationToken, connection_id: Uuid) -> bool {
        let removed = self
            .inner
            .remove_if(token, |_, entry| entry.handle.id() == connection_id)
            .is_some();
        if removed {
            self.publish_size();
        }
        removed
    }

    pub fn lookup(&self, token: &CorrelationToken) -> Option<VisitorHandle> {
        self.inner.get(token).map(|entry| entry.handle.clone())
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }

    /// Registered tokens ordered by registration time.
    pub fn entries(&self) -> Vec<(CorrelationToken, OffsetDateTime)> {
        let mut entries: Vec<_> = self
            .inner
            .iter()
            .map(|entry| (entry.token.clone(), entry.registered_at))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn publish_size(&self) {
        record_gauge(CONNECTED_GAUGE, self.inner.len() as f64);
    }
}
