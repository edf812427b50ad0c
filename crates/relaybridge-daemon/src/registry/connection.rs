//! In-memory registry of observer and controller connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity assigned to a connection when it is accepted.
pub type ConnectionId = Uuid;

/// Smallest outbound queue, so the greeting always fits.
const MIN_QUEUE_CAPACITY: usize = 2;

/// Role chosen at connect time via the `type` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Observer,
    Controller,
}

impl Role {
    /// `type=controller` (or the legacy `type=cpp`) selects the controller role.
    pub fn from_client_type(client_type: Option<&str>) -> Self {
        match client_type {
            Some("controller" | "cpp") => Self::Controller,
            _ => Self::Observer,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observer => "observer",
            Self::Controller => "controller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a message could not be handed to a connection.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("Connection {id} is lagging (outbound queue full)")]
    Full { id: ConnectionId },

    #[error("Connection {id} is closed")]
    Closed { id: ConnectionId },
}

/// One accepted connection.
///
/// Messages are queued on a bounded channel drained by the connection's own
/// socket task; the registry never writes to the socket directly.
#[derive(Debug)]
pub struct ObserverConnection {
    id: ConnectionId,
    role: Role,
    tx: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
}

impl ObserverConnection {
    /// Create a connection and the receiving end its socket task drains.
    pub fn new(role: Role, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(MIN_QUEUE_CAPACITY));
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            tx,
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    /// Queue a message without waiting.
    pub fn try_deliver(&self, text: &Arc<str>) -> Result<(), DeliveryFailure> {
        if self.is_closed() {
            return Err(DeliveryFailure::Closed { id: self.id });
        }
        self.tx.try_send(Arc::clone(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::Full { id: self.id },
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed { id: self.id },
        })
    }

    /// Ask the socket task to close the connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Token the socket task watches to learn it has been force-closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[derive(Default)]
struct Members {
    connections: HashMap<ConnectionId, Arc<ObserverConnection>>,
    controller: Option<ConnectionId>,
}

/// Thread-safe registry of open connections with a single controller slot.
///
/// Membership changes happen under one write lock, so a broadcast (which
/// snapshots under the read lock) never sees a half-registered connection.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    members: Arc<RwLock<Members>>,
    observer_count: Arc<AtomicUsize>,
    controller_present: Arc<AtomicBool>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// A new controller force-closes and replaces the previous one, which is
    /// returned.
    pub async fn register(&self, conn: Arc<ObserverConnection>) -> Option<Arc<ObserverConnection>> {
        let id = conn.id();
        let role = conn.role();
        let mut members = self.members.write().await;

        let mut evicted = None;
        if role == Role::Controller {
            if let Some(prev_id) = members.controller.take()
                && let Some(previous) = members.connections.remove(&prev_id)
            {
                previous.close();
                warn!(conn_id = %previous.id(), "Replacing existing controller connection");
                evicted = Some(previous);
            }
            members.controller = Some(id);
        }
        members.connections.insert(id, conn);
        self.refresh_counts(&members);
        drop(members);

        info!(conn_id = %id, role = %role, "Connection registered");
        evicted
    }

    /// Remove a connection from every set and close it. Idempotent.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<ObserverConnection>> {
        let mut members = self.members.write().await;
        let conn = members.connections.remove(&id);
        if members.controller == Some(id) {
            members.controller = None;
        }
        self.refresh_counts(&members);
        drop(members);

        if let Some(conn) = &conn {
            conn.close();
            info!(conn_id = %id, role = %conn.role(), "Connection unregistered");
        } else {
            debug!(conn_id = %id, "Connection already unregistered");
        }
        conn
    }

    /// Current controller, if one is connected.
    pub async fn controller(&self) -> Option<Arc<ObserverConnection>> {
        let members = self.members.read().await;
        members
            .controller
            .and_then(|id| members.connections.get(&id).cloned())
    }

    /// Snapshot of connections holding `role`.
    pub async fn snapshot(&self, role: Role) -> Vec<Arc<ObserverConnection>> {
        self.members
            .read()
            .await
            .connections
            .values()
            .filter(|c| c.role() == role)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub async fn is_registered(&self, id: ConnectionId) -> bool {
        self.members.read().await.connections.contains_key(&id)
    }

    /// Number of plain observers. Lock-free, safe to poll.
    pub fn observer_count(&self) -> usize {
        self.observer_count.load(Ordering::Acquire)
    }

    /// Whether the controller slot is occupied. Lock-free, safe to poll.
    pub fn has_controller(&self) -> bool {
        self.controller_present.load(Ordering::Acquire)
    }

    /// Force-close and drop every connection.
    pub async fn close_all(&self) {
        let mut members = self.members.write().await;
        let drained: Vec<_> = members.connections.drain().map(|(_, c)| c).collect();
        members.controller = None;
        self.refresh_counts(&members);
        drop(members);

        for conn in &drained {
            conn.close();
        }
        info!(closed = drained.len(), "Closed all connections");
    }

    fn refresh_counts(&self, members: &Members) {
        let observers = members
            .connections
            .values()
            .filter(|c| c.role() == Role::Observer)
            .count();
        self.observer_count.store(observers, Ordering::Release);
        self.controller_present
            .store(members.controller.is_some(), Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn role_from_client_type() {
        assert_eq!(Role::from_client_type(Some("controller")), Role::Controller);
        assert_eq!(Role::from_client_type(Some("cpp")), Role::Controller);
        assert_eq!(Role::from_client_type(Some("frontend")), Role::Observer);
        assert_eq!(Role::from_client_type(None), Role::Observer);
    }

    #[tokio::test]
    async fn register_and_unregister_observer() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = ObserverConnection::new(Role::Observer, 8);
        let id = conn.id();

        assert!(registry.register(Arc::clone(&conn)).await.is_none());
        assert!(registry.is_registered(id).await);
        assert_eq!(registry.observer_count(), 1);
        assert!(!registry.has_controller());

        assert!(registry.unregister(id).await.is_some());
        assert!(conn.is_closed());
        assert_eq!(registry.observer_count(), 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = ObserverConnection::new(Role::Observer, 8);
        registry.register(Arc::clone(&conn)).await;

        assert!(registry.unregister(conn.id()).await.is_some());
        assert!(registry.unregister(conn.id()).await.is_none());
        assert_eq!(registry.observer_count(), 0);
    }

    #[tokio::test]
    async fn new_controller_evicts_previous() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ObserverConnection::new(Role::Controller, 8);
        let (second, _rx2) = ObserverConnection::new(Role::Controller, 8);

        registry.register(Arc::clone(&first)).await;
        let evicted = registry.register(Arc::clone(&second)).await.unwrap();

        assert_eq!(evicted.id(), first.id());
        assert!(first.is_closed());
        assert!(first.closed_token().is_cancelled());
        assert!(!second.is_closed());
        assert!(!registry.is_registered(first.id()).await);
        assert_eq!(registry.controller().await.unwrap().id(), second.id());
        assert!(registry.has_controller());
        assert_eq!(registry.observer_count(), 0);
    }

    #[tokio::test]
    async fn controller_slot_clears_on_unregister() {
        let registry = ConnectionRegistry::new();
        let (ctrl, _rx) = ObserverConnection::new(Role::Controller, 8);
        registry.register(Arc::clone(&ctrl)).await;

        registry.unregister(ctrl.id()).await;
        assert!(registry.controller().await.is_none());
        assert!(!registry.has_controller());
    }

    #[tokio::test]
    async fn stale_unregister_keeps_new_controller() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ObserverConnection::new(Role::Controller, 8);
        let (second, _rx2) = ObserverConnection::new(Role::Controller, 8);
        registry.register(Arc::clone(&first)).await;
        registry.register(Arc::clone(&second)).await;

        // The evicted socket task unregisters itself on the way out.
        assert!(registry.unregister(first.id()).await.is_none());
        assert_eq!(registry.controller().await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (obs, _rx1) = ObserverConnection::new(Role::Observer, 8);
        let (ctrl, _rx2) = ObserverConnection::new(Role::Controller, 8);
        registry.register(Arc::clone(&obs)).await;
        registry.register(Arc::clone(&ctrl)).await;

        registry.close_all().await;
        assert!(obs.is_closed());
        assert!(ctrl.is_closed());
        assert_eq!(registry.observer_count(), 0);
        assert!(!registry.has_controller());
    }

    #[test]
    fn delivery_to_full_queue_fails() {
        let (conn, _rx) = ObserverConnection::new(Role::Observer, 2);
        let text: Arc<str> = Arc::from("x");
        conn.try_deliver(&text).unwrap();
        conn.try_deliver(&text).unwrap();
        assert!(matches!(
            conn.try_deliver(&text),
            Err(DeliveryFailure::Full { .. })
        ));
    }

    #[test]
    fn delivery_after_receiver_drop_fails() {
        let (conn, rx) = ObserverConnection::new(Role::Observer, 2);
        drop(rx);
        assert!(conn.is_closed());
        assert!(matches!(
            conn.try_deliver(&Arc::from("x")),
            Err(DeliveryFailure::Closed { .. })
        ));
    }
}
