use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;

use crate::{
    events::event::{Event, EventType},
    models::{EventId, UserId},
};

pub const DEFAULT_CAPACITY: usize = 100;

/// A bounded ring per user. Ids are a single process-wide monotonic counter,
/// so ordering is preserved even though each user's ring is independent.
#[derive(Clone)]
pub struct EventStore {
    rings: Arc<RwLock<HashMap<UserId, VecDeque<Event>>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl EventStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rings: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Builds and appends a new event for `user_id`, evicting the oldest
    /// entry in that user's ring if it's already at capacity.
    pub fn append(&self, event_type: EventType, user_id: UserId, payload: Value) -> Event {
        let id = EventId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let event = Event::new(id, event_type, user_id, payload);

        let mut rings = self.rings.write().unwrap();
        let ring = rings.entry(user_id).or_insert_with(VecDeque::new);

        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(event.clone());

        event
    }

    /// Events strictly after `last_id` for `user_id`, oldest first. Unknown
    /// users (no ring yet, or `last_id` long evicted) yield an empty replay
    /// rather than an error.
    pub fn since(&self, user_id: UserId, last_id: EventId) -> Vec<Event> {
        let rings = self.rings.read().unwrap();
        let Some(ring) = rings.get(&user_id) else {
            return Vec::new();
        };

        ring.iter()
            .filter(|event| event.id > last_id)
            .cloned()
            .collect()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[test]
    fn since_returns_only_newer_events() {
        let store = EventStore::new();
        let user_id = user();

        let first = store.append(EventType::NewEmail, user_id, json!({"n": 1}));
        store.append(EventType::NewEmail, user_id, json!({"n": 2}));
        store.append(EventType::NewEmail, user_id, json!({"n": 3}));

        let replay = store.since(user_id, first.id);
        assert_eq!(replay.len(), 2);
    }

    #[test]
    fn unknown_user_replays_empty() {
        let store = EventStore::new();
        assert!(store.since(user(), EventId::new(0)).is_empty());
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let store = EventStore::with_capacity(2);
        let user_id = user();

        let first = store.append(EventType::Heartbeat, user_id, json!(null));
        store.append(EventType::Heartbeat, user_id, json!(null));
        store.append(EventType::Heartbeat, user_id, json!(null));

        // The first event was evicted, so replaying from it returns
        // whatever remains in the ring, not a gap-aware count.
        let replay = store.since(user_id, EventId::new(first.id.as_u64() - 1));
        assert_eq!(replay.len(), 2);
    }
}
