//! Topic fan-out registry
//!
//! A [`Topic`] holds the live subscriptions for one topic name. Each subscription is a
//! delivery callback, the visitor that owns it and an optional cancellation handle.
//!
//! Concurrency notes:
//! - all state sits behind one mutex whose critical sections only touch the map and
//!   timestamps, never a callback
//! - [`Topic::publish`] snapshots the subscriptions, drops the lock and spawns one task
//!   per subscriber, so a slow subscriber cannot hold up the publisher or its peers
//! - cancellation handles are invoked after the lock is released
//! - keepalives go through the same per-subscriber tasks as messages

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::broker::visitor::Visitor;
use crate::utils::error::Result;

pub type SubscriberId = u64;

/// Delivery callback. Receives the publishing visitor and the message.
pub type SubscriberFn =
    Arc<dyn Fn(Arc<Visitor>, Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Tears down the connection behind a subscription.
pub type CancelFn = Arc<dyn Fn() + Send + Sync>;

/// Default time an idle, subscriber-less topic is kept around.
pub const TOPIC_EXPUNGE_AFTER: Duration = Duration::from_secs(16 * 3600);

const RECENT_UNSUBSCRIBERS_MAX: usize = 16;

#[derive(Clone)]
struct TopicSubscriber {
    owner: Arc<Visitor>,
    subscriber: SubscriberFn,
    cancel: Option<CancelFn>,
}

impl TopicSubscriber {
    fn user_id(&self) -> &str {
        self.owner.user_id().unwrap_or("")
    }
}

struct TopicState {
    subscribers: HashMap<SubscriberId, TopicSubscriber>,
    last_access: Instant,
    recent_unsubscribers: VecDeque<(Arc<Visitor>, Instant)>,
}

pub struct Topic {
    pub name: String,
    expunge_after: Duration,
    state: Mutex<TopicState>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self::with_expunge_after(name, TOPIC_EXPUNGE_AFTER)
    }

    pub fn with_expunge_after(name: &str, expunge_after: Duration) -> Self {
        Self {
            name: name.to_string(),
            expunge_after,
            state: Mutex::new(TopicState {
                subscribers: HashMap::new(),
                last_access: Instant::now(),
                recent_unsubscribers: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscription and returns its ID. Never blocks on delivery.
    pub fn subscribe(
        &self,
        subscriber: SubscriberFn,
        owner: Arc<Visitor>,
        cancel: Option<CancelFn>,
    ) -> SubscriberId {
        let mut state = self.lock();
        let mut id: SubscriberId = rand::random();
        while state.subscribers.contains_key(&id) {
            id = rand::random();
        }
        state.subscribers.insert(
            id,
            TopicSubscriber {
                owner,
                subscriber,
                cancel,
            },
        );
        state.last_access = Instant::now();
        id
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.lock();
        let Some(removed) = state.subscribers.remove(&id) else {
            return false;
        };
        let now = Instant::now();
        state.last_access = now;
        let expunge_after = self.expunge_after;
        state
            .recent_unsubscribers
            .retain(|(visitor, at)| at.elapsed() < expunge_after && !Arc::ptr_eq(visitor, &removed.owner));
        state.recent_unsubscribers.push_front((removed.owner, now));
        state.recent_unsubscribers.truncate(RECENT_UNSUBSCRIBERS_MAX);
        true
    }

    /// Dispatches `message` to every current subscriber on its own task and returns the
    /// number of subscribers it was handed to. Delivery failures are logged only.
    pub fn publish(&self, visitor: &Arc<Visitor>, message: &Message) -> usize {
        let subscribers = {
            let mut state = self.lock();
            state.last_access = Instant::now();
            snapshot(&state)
        };
        if subscribers.is_empty() {
            debug!(topic = %self.name, message_id = %message.id, "No subscribers, not forwarding");
            return 0;
        }
        debug!(
            topic = %self.name,
            message_id = %message.id,
            subscribers = subscribers.len(),
            "Forwarding message"
        );
        self.dispatch(subscribers, message, Some(visitor))
    }

    /// Sends a keepalive event to every subscriber, each on behalf of its own owner.
    /// Does not count as topic activity.
    pub fn send_keepalive(&self) -> usize {
        let subscribers = snapshot(&self.lock());
        if subscribers.is_empty() {
            return 0;
        }
        self.dispatch(subscribers, &Message::keepalive(&self.name), None)
    }

    fn dispatch(
        &self,
        subscribers: Vec<(SubscriberId, TopicSubscriber)>,
        message: &Message,
        visitor: Option<&Arc<Visitor>>,
    ) -> usize {
        let count = subscribers.len();
        for (id, s) in subscribers {
            let visitor = visitor.cloned().unwrap_or_else(|| s.owner.clone());
            let message = message.clone();
            let topic = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = (s.subscriber)(visitor, message).await {
                    warn!(topic = %topic, subscriber = id, error = %e, "Error forwarding to subscriber");
                }
            });
        }
        count
    }

    /// Cancels every subscription not owned by `user_id` ("" for anonymous).
    pub fn cancel_subscribers_except_user(&self, user_id: &str) -> usize {
        self.cancel_where(|s| s.user_id() != user_id)
    }

    /// Cancels every subscription owned by `user_id`.
    pub fn cancel_subscriber_user(&self, user_id: &str) -> usize {
        self.cancel_where(|s| s.user_id() == user_id)
    }

    fn cancel_where(&self, matches: impl Fn(&TopicSubscriber) -> bool) -> usize {
        let cancelled: Vec<TopicSubscriber> = {
            let mut state = self.lock();
            let ids: Vec<SubscriberId> = state
                .subscribers
                .iter()
                .filter(|(_, s)| matches(s))
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| state.subscribers.remove(id))
                .collect()
        };
        for s in &cancelled {
            debug!(topic = %self.name, user = s.user_id(), "Cancelling subscriber");
            if let Some(cancel) = &s.cancel {
                cancel();
            }
        }
        cancelled.len()
    }

    pub fn subscribers_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn keepalive(&self) {
        self.lock().last_access = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        self.lock().last_access
    }

    /// No subscribers and untouched for the retention window.
    pub fn stale(&self) -> bool {
        let state = self.lock();
        state.subscribers.is_empty() && state.last_access.elapsed() >= self.expunge_after
    }

    /// Visitor accountable for this topic: the first live subscriber's owner, else the
    /// most recent unsubscriber still within the retention window.
    pub fn rate_visitor(&self) -> Option<Arc<Visitor>> {
        let state = self.lock();
        if let Some(s) = state.subscribers.values().next() {
            return Some(s.owner.clone());
        }
        state
            .recent_unsubscribers
            .iter()
            .find(|(_, at)| at.elapsed() < self.expunge_after)
            .map(|(visitor, _)| visitor.clone())
    }
}

fn snapshot(state: &TopicState) -> Vec<(SubscriberId, TopicSubscriber)> {
    state
        .subscribers
        .iter()
        .map(|(id, s)| (*id, s.clone()))
        .collect()
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("subscribers", &self.subscribers_count())
            .finish()
    }
}
