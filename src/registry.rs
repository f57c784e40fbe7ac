use crate::{Metrics, Notification, TicketQueueError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Sending half of a client's push channel. The transport task owns the
/// receiving half; when it goes away the sender reports closed.
pub type ConnectionSender = mpsc::UnboundedSender<Notification>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NoSuchConnection,
}

/// Maps request ids to live push channels behind a single lock.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionSender>>,
    metrics: Metrics,
}

impl ConnectionRegistry {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, ConnectionSender>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Associate a request with a channel, replacing any earlier one.
    pub fn register(&self, request_id: impl Into<String>, channel: ConnectionSender) {
        let mut connections = self.connections();
        connections.insert(request_id.into(), channel);
        self.metrics.active_connections.set(connections.len() as i64);
    }

    pub fn unregister(&self, request_id: &str) {
        let mut connections = self.connections();
        if connections.remove(request_id).is_some() {
            self.metrics.active_connections.set(connections.len() as i64);
        }
    }

    /// Drop every registration that points at `channel`, used when a
    /// transport closes.
    pub fn unregister_channel(&self, channel: &ConnectionSender) {
        let mut connections = self.connections();
        connections.retain(|_, sender| !sender.same_channel(channel));
        self.metrics.active_connections.set(connections.len() as i64);
    }

    /// Push a notification. Unknown or closed connections are dropped
    /// silently; closed ones are removed.
    pub fn send(&self, request_id: &str, payload: Notification) -> Delivery {
        let mut connections = self.connections();
        let Some(sender) = connections.get(request_id) else {
            let unknown = TicketQueueError::UnknownConnection(request_id.to_string());
            debug!("{}, dropping notification", unknown);
            return Delivery::NoSuchConnection;
        };

        if sender.send(payload).is_ok() {
            return Delivery::Delivered;
        }

        debug!(request_id, "Connection closed, dropping notification");
        connections.remove(request_id);
        self.metrics.active_connections.set(connections.len() as i64);
        Delivery::NoSuchConnection
    }

    pub fn is_registered(&self, request_id: &str) -> bool {
        self.connections().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections().is_empty()
    }
}
