use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;

use crate::{
    events::{
        event::{Event, EventType},
        store::EventStore,
    },
    models::UserId,
};

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Publishes events to the store and fans them out to live subscribers for
/// the target user. Publish is synchronous: it returns only after every
/// registered callback for that user has run, so callbacks must not block.
#[derive(Clone)]
pub struct EventBus {
    store: EventStore,
    subscribers: Arc<RwLock<HashMap<UserId, Vec<(u64, Callback)>>>>,
    next_subscription_id: Arc<AtomicU64>,
}

pub struct Subscription {
    bus: EventBus,
    user_id: UserId,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.bus.unsubscribe(self.user_id, self.id);
    }
}

impl EventBus {
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscription_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn publish(&self, event_type: EventType, user_id: UserId, payload: Value) -> Event {
        let event = self.store.append(event_type, user_id, payload);

        let subscribers = self.subscribers.read().unwrap();
        if let Some(callbacks) = subscribers.get(&user_id) {
            for (_, callback) in callbacks {
                callback(&event);
            }
        }

        event
    }

    pub fn subscribe(
        &self,
        user_id: UserId,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);

        self.subscribers
            .write()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            bus: self.clone(),
            user_id,
            id,
        }
    }

    fn unsubscribe(&self, user_id: UserId, id: u64) {
        let mut subscribers = self.subscribers.write().unwrap();
        if let Some(callbacks) = subscribers.get_mut(&user_id) {
            callbacks.retain(|(sub_id, _)| *sub_id != id);
            if callbacks.is_empty() {
                subscribers.remove(&user_id);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use uuid::Uuid;

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new(EventStore::new());
        let user_id = UserId::from(Uuid::new_v4());
        let received = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        let subscription = bus.subscribe(user_id, move |_event| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        bus.publish(EventType::NewEmail, user_id, json!({"subject": "hi"}));
        assert_eq!(received.load(AtomicOrdering::SeqCst), 1);

        subscription.unsubscribe();
        bus.publish(EventType::NewEmail, user_id, json!({"subject": "bye"}));
        assert_eq!(received.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn other_users_do_not_receive_events() {
        let bus = EventBus::new(EventStore::new());
        let user_a = UserId::from(Uuid::new_v4());
        let user_b = UserId::from(Uuid::new_v4());
        let received = Arc::new(AtomicUsize::new(0));

        let counter = received.clone();
        let _subscription = bus.subscribe(user_b, move |_event| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        bus.publish(EventType::NewEmail, user_a, json!({}));
        assert_eq!(received.load(AtomicOrdering::SeqCst), 0);
    }
}
