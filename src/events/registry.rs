use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration as StdDuration,
};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    events::event::{Event, EventType},
    models::UserId,
    periodic::run_periodically,
};

pub const DEFAULT_PER_USER_CAP: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(30);
pub const DEFAULT_CONNECTION_TIMEOUT: StdDuration = StdDuration::from_secs(60 * 60);

/// One live SSE stream. `sender` is the per-connection buffer the registry
/// writes events into; the SSEHandler loop reads from the matching receiver.
pub struct Connection {
    pub id: Uuid,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    last_ping: RwLock<DateTime<Utc>>,
    closed: AtomicBool,
    sender: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl Connection {
    pub fn new(user_id: UserId, sender: tokio::sync::mpsc::UnboundedSender<Event>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            created_at: now,
            last_ping: RwLock::new(now),
            closed: AtomicBool::new(false),
            sender,
        }
    }

    pub fn last_ping(&self) -> DateTime<Utc> {
        *self.last_ping.read().unwrap()
    }

    pub fn touch(&self) {
        *self.last_ping.write().unwrap() = Utc::now();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn send(&self, event: Event) {
        // The SSE loop owns the receiver; a closed/dropped connection just
        // means the send is dead weight, cleaned up on the next sweep.
        let _ = self.sender.send(event);
    }
}

/// Tracks live SSE connections per user, enforcing a per-user cap by
/// evicting the oldest connection, and sweeping dead/expired ones.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<UserId, Vec<Arc<Connection>>>>>,
    total: Arc<AtomicUsize>,
    per_user_cap: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_PER_USER_CAP)
    }

    pub fn with_cap(per_user_cap: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            total: Arc::new(AtomicUsize::new(0)),
            per_user_cap,
        }
    }

    /// Registers `conn`, evicting the oldest existing connection for the
    /// same user first if already at the cap, so the net count never
    /// exceeds it.
    pub fn add(&self, conn: Arc<Connection>) {
        let mut connections = self.connections.write().unwrap();
        let bucket = connections.entry(conn.user_id).or_default();

        if bucket.len() >= self.per_user_cap {
            if let Some((oldest_index, oldest)) = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.created_at)
                .map(|(i, c)| (i, c.clone()))
            {
                // Synthetic, connection-scoped notice: not appended to the
                // user's event ring since there is no replay audience left.
                oldest.send(Event::new(
                    crate::models::EventId::new(0),
                    EventType::ConnectionLimit,
                    conn.user_id,
                    serde_json::json!({ "reason": "per_user_connection_cap_reached" }),
                ));
                oldest.close();
                bucket.remove(oldest_index);
                self.total.fetch_sub(1, Ordering::SeqCst);
            }
        }

        bucket.push(conn);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove(&self, user_id: UserId, conn_id: Uuid) {
        let mut connections = self.connections.write().unwrap();
        if let Some(bucket) = connections.get_mut(&user_id) {
            let before = bucket.len();
            bucket.retain(|c| {
                if c.id == conn_id {
                    c.close();
                    false
                } else {
                    true
                }
            });
            self.total.fetch_sub(before - bucket.len(), Ordering::SeqCst);

            if bucket.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    pub fn get(&self, user_id: UserId, conn_id: Uuid) -> Option<Arc<Connection>> {
        let connections = self.connections.read().unwrap();
        connections
            .get(&user_id)?
            .iter()
            .find(|c| c.id == conn_id)
            .cloned()
    }

    pub fn list(&self, user_id: UserId) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().unwrap();
        connections.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn count(&self, user_id: UserId) -> usize {
        let connections = self.connections.read().unwrap();
        connections.get(&user_id).map(Vec::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn update_last_ping(&self, user_id: UserId, conn_id: Uuid) {
        if let Some(conn) = self.get(user_id, conn_id) {
            conn.touch();
        }
    }

    /// Writes `event` to every active connection for `user_id`. Individual
    /// send failures are swallowed; the next cleanup sweep reaps them.
    pub fn broadcast(&self, user_id: UserId, event: Event) {
        for conn in self.list(user_id) {
            if !conn.is_closed() {
                conn.send(event.clone());
            }
        }
    }

    pub fn cleanup_dead(&self, heartbeat_interval: StdDuration) {
        let threshold = chrono::Duration::from_std(heartbeat_interval * 3).unwrap();
        let now = Utc::now();
        self.retain(|conn| !conn.is_closed() && now - conn.last_ping() <= threshold);
    }

    pub fn cleanup_timed_out(&self, connection_timeout: StdDuration) {
        let threshold = chrono::Duration::from_std(connection_timeout).unwrap();
        let now = Utc::now();
        self.retain(|conn| now - conn.created_at <= threshold);
    }

    fn retain(&self, keep: impl Fn(&Connection) -> bool) {
        let mut connections = self.connections.write().unwrap();
        let mut removed = 0;

        connections.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|conn| {
                let keep_it = keep(conn);
                if !keep_it {
                    conn.close();
                }
                keep_it
            });
            removed += before - bucket.len();
            !bucket.is_empty()
        });

        if removed > 0 {
            debug!(removed, "connection registry swept stale connections");
            self.total.fetch_sub(removed, Ordering::SeqCst);
        }
    }

    /// Runs `CleanupDead` and `CleanupTimedOut` every `interval` until the
    /// returned token is cancelled.
    pub fn start_cleanup_routine(
        &self,
        interval: StdDuration,
        heartbeat_interval: StdDuration,
        connection_timeout: StdDuration,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let registry = self.clone();

        run_periodically(
            move || {
                let registry = registry.clone();
                async move {
                    registry.cleanup_dead(heartbeat_interval);
                    registry.cleanup_timed_out(connection_timeout);
                    Ok::<(), std::convert::Infallible>(())
                }
            },
            interval,
            stop.clone(),
        );

        stop
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn connection(user_id: UserId) -> Arc<Connection> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Connection::new(user_id, tx))
    }

    #[test]
    fn add_evicts_oldest_at_cap() {
        let registry = ConnectionRegistry::with_cap(2);
        let user_id = user();

        let first = connection(user_id);
        let first_id = first.id;
        registry.add(first);
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.add(connection(user_id));
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.add(connection(user_id));

        assert_eq!(registry.count(user_id), 2);
        assert!(registry.get(user_id, first_id).is_none());
    }

    #[test]
    fn remove_reclaims_empty_bucket() {
        let registry = ConnectionRegistry::new();
        let user_id = user();
        let conn = connection(user_id);
        let conn_id = conn.id;

        registry.add(conn);
        assert_eq!(registry.total(), 1);

        registry.remove(user_id, conn_id);
        assert_eq!(registry.total(), 0);
        assert_eq!(registry.count(user_id), 0);
    }

    #[test]
    fn cleanup_timed_out_removes_stale_connections() {
        let registry = ConnectionRegistry::new();
        let user_id = user();
        registry.add(connection(user_id));

        registry.cleanup_timed_out(StdDuration::from_secs(0));
        assert_eq!(registry.total(), 0);
    }
}
