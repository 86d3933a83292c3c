//! Server engine
//!
//! [`Server`] owns everything that lives for the whole process: the topic registry,
//! the visitor registry, the message cache and the attachment store. Nothing here is
//! global, so several servers can run side by side (tests do).
//!
//! Request flow:
//! - publish: rate check, daily message quota, topic lookup, durable write (or batch
//!   enqueue), then fan-out to live subscribers on independent tasks unless the message
//!   is scheduled
//! - subscribe: subscription quota, registration on every topic, then optional replay
//!   from the cache. Registering first means a replaying client may see a message twice
//!   but never misses one.
//! - attachment download: charged to the uploader's daily bandwidth budget
//! - keepalive: every live subscription periodically receives a keepalive event
//!
//! Locking: the topic map and the visitor map each have their own mutex, held only for
//! map lookups and mutations, never across an await, dispatch or I/O.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::broker::manager::UserManager;
use crate::broker::message::{Attachment, Event, Message, SinceMarker};
use crate::broker::topic::{CancelFn, SubscriberFn, SubscriberId, Topic};
use crate::broker::visitor::{Visitor, VisitorLimits};
use crate::config::Settings;
use crate::persistence::file_cache::FileCache;
use crate::persistence::{MessageCache, create_message_cache};
use crate::utils::error::{Error, Result};
use crate::utils::limiter::FixedLimiter;

const TOPIC_NAME_MAX_LENGTH: usize = 64;

/// Returns true if `name` may be used as a topic name.
pub fn valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= TOPIC_NAME_MAX_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Handle for one subscribe call, spanning one or more topics.
#[derive(Debug)]
pub struct Subscription {
    visitor: Arc<Visitor>,
    entries: Vec<(Arc<Topic>, SubscriberId)>,
}

impl Subscription {
    pub fn visitor(&self) -> &Arc<Visitor> {
        &self.visitor
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|(t, _)| t.name.clone()).collect()
    }
}

pub struct Server {
    pub(crate) settings: Settings,
    visitor_limits: VisitorLimits,
    pub(crate) topics: Mutex<HashMap<String, Arc<Topic>>>,
    pub(crate) visitors: Mutex<HashMap<String, Arc<Visitor>>>,
    pub(crate) message_cache: Arc<dyn MessageCache>,
    pub(crate) file_cache: Option<Arc<FileCache>>,
    pub(crate) user_manager: Option<Arc<dyn UserManager>>,
    pub(crate) messages: AtomicI64,
}

impl Server {
    /// Builds a server with the stores selected by `settings`.
    pub async fn new(settings: Settings) -> Result<Self> {
        let message_cache = create_message_cache(&settings.cache).await?;
        let file_cache = if settings.attachment.cache_dir.is_empty() {
            None
        } else {
            Some(
                FileCache::new(
                    &settings.attachment.cache_dir,
                    settings.attachment.total_size_limit,
                )
                .await?,
            )
        };
        Self::with_caches(settings, message_cache, file_cache).await
    }

    /// Builds a server around existing stores. Topics with cached messages and the
    /// lifetime message counter are restored from the message cache.
    pub async fn with_caches(
        settings: Settings,
        message_cache: Arc<dyn MessageCache>,
        file_cache: Option<FileCache>,
    ) -> Result<Self> {
        let expunge_after = settings.broker.topic_expunge_after();
        let topics: HashMap<String, Arc<Topic>> = message_cache
            .topics()
            .await?
            .into_iter()
            .map(|name| {
                let topic = Arc::new(Topic::with_expunge_after(&name, expunge_after));
                (name, topic)
            })
            .collect();
        let messages = message_cache.stats().await?;
        info!(topics = topics.len(), messages, "Server state restored");
        Ok(Self {
            visitor_limits: VisitorLimits::from(&settings.visitor),
            settings,
            topics: Mutex::new(topics),
            visitors: Mutex::new(HashMap::new()),
            message_cache,
            file_cache: file_cache.map(Arc::new),
            user_manager: None,
            messages: AtomicI64::new(messages),
        })
    }

    pub fn with_user_manager(mut self, user_manager: Arc<dyn UserManager>) -> Self {
        self.user_manager = Some(user_manager);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn message_cache(&self) -> &Arc<dyn MessageCache> {
        &self.message_cache
    }

    pub fn file_cache(&self) -> Option<&Arc<FileCache>> {
        self.file_cache.as_ref()
    }

    /// Lifetime number of published messages.
    pub fn messages_published(&self) -> i64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub(crate) fn lock_topics(&self) -> MutexGuard<'_, HashMap<String, Arc<Topic>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_visitors(&self) -> MutexGuard<'_, HashMap<String, Arc<Visitor>>> {
        self.visitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the visitor for this address or account, creating it if needed, and
    /// marks it as seen.
    pub fn visitor(&self, ip: IpAddr, user_id: Option<&str>) -> Arc<Visitor> {
        let key = Visitor::key(ip, user_id);
        let visitor = self
            .lock_visitors()
            .entry(key)
            .or_insert_with(|| Arc::new(Visitor::new(&self.visitor_limits, ip, user_id)))
            .clone();
        visitor.keepalive();
        visitor
    }

    /// Returns the named topic, creating it if it does not exist yet.
    pub fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        let mut topics = self.lock_topics();
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        if !valid_topic_name(name) {
            return Err(Error::InvalidTopic(name.to_string()));
        }
        if self
            .settings
            .broker
            .disallowed_topics
            .iter()
            .any(|t| t == name)
        {
            return Err(Error::DisallowedTopic(name.to_string()));
        }
        if topics.len() >= self.settings.broker.total_topic_limit {
            return Err(Error::TopicLimitReached);
        }
        let topic = Arc::new(Topic::with_expunge_after(
            name,
            self.settings.broker.topic_expunge_after(),
        ));
        topics.insert(name.to_string(), topic.clone());
        debug!(topic = name, "Created topic");
        Ok(topic)
    }

    /// Resolves several topic names at once.
    pub fn topics_from_ids(&self, names: &[&str]) -> Result<Vec<Arc<Topic>>> {
        names.iter().map(|name| self.topic(name)).collect()
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.lock_topics().contains_key(name)
    }

    pub fn topics_count(&self) -> usize {
        self.lock_topics().len()
    }

    pub fn visitors_count(&self) -> usize {
        self.lock_visitors().len()
    }

    /// Publishes `message` on behalf of `visitor`.
    ///
    /// Returns once the message is stored (or queued for a batched write). Live
    /// subscribers receive it afterwards on their own tasks; scheduled messages are left
    /// to the delayed sender.
    pub async fn publish(&self, visitor: &Arc<Visitor>, mut message: Message) -> Result<Message> {
        if message.event != Event::Message {
            return Err(Error::UnexpectedMessageType);
        }
        visitor.request_allowed()?;
        visitor.message_allowed()?;
        visitor.keepalive();
        let topic = self.topic(&message.topic)?;

        if message.sender.is_none() {
            message.sender = Some(visitor.ip());
        }
        if message.user.is_empty() {
            if let Some(user) = visitor.user_id() {
                message.user = user.to_string();
            }
        }
        let cache_secs = i64::try_from(self.settings.cache.duration_secs).unwrap_or(i64::MAX);
        message.expires = message.time.saturating_add(cache_secs);

        self.message_cache.add_message(&message).await?;
        let now = Utc::now().timestamp();
        if !message.is_scheduled(now) {
            topic.publish(visitor, &message);
        }
        self.messages.fetch_add(1, Ordering::Relaxed);
        debug!(
            topic = %message.topic,
            message_id = %message.id,
            scheduled = message.is_scheduled(now),
            "Published message"
        );
        Ok(message)
    }

    /// Stores `data` as the attachment of `message`, charging the visitor's attachment
    /// quota, the per-file limit and the attachment store's total size.
    pub async fn attach(
        &self,
        visitor: &Arc<Visitor>,
        message: &mut Message,
        name: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<()> {
        let file_cache = self
            .file_cache
            .as_ref()
            .ok_or_else(|| Error::Storage("attachments are disabled".to_string()))?;
        let file_limiter = FixedLimiter::new(self.settings.attachment.file_size_limit);
        let visitor_limiter = visitor.attachment_limiter(self.message_cache.as_ref()).await?;
        let size = file_cache
            .write(&message.id, data, &[&file_limiter, &visitor_limiter])
            .await?;
        let expiry = i64::try_from(self.settings.attachment.expiry_duration_secs).unwrap_or(i64::MAX);
        message.attachment = Some(Attachment {
            name: name.to_string(),
            content_type: content_type.to_string(),
            size,
            expires: Utc::now().timestamp().saturating_add(expiry),
            url: format!("/file/{}", message.id),
        });
        Ok(())
    }

    /// Reads the attachment of message `id` on behalf of `visitor`.
    ///
    /// The download counts against the bandwidth of whoever uploaded the file: the
    /// account if there is one, else the sending address, else the requester.
    pub async fn attachment(&self, visitor: &Arc<Visitor>, id: &str) -> Result<Vec<u8>> {
        let file_cache = self
            .file_cache
            .as_ref()
            .ok_or_else(|| Error::Storage("attachments are disabled".to_string()))?;
        visitor.request_allowed()?;
        let data = file_cache.read(id).await?;
        let message = self.message_cache.message(id).await?;
        let uploader = if !message.user.is_empty() {
            self.visitor(visitor.ip(), Some(message.user.as_str()))
        } else if let Some(sender) = message.sender {
            self.visitor(sender, None)
        } else {
            visitor.clone()
        };
        let size = i64::try_from(data.len()).unwrap_or(i64::MAX);
        uploader.bandwidth_allowed(size)?;
        debug!(message_id = id, size, uploader = %uploader.id(), "Serving attachment");
        Ok(data)
    }

    /// Subscribes `subscriber` to every topic in `topics`, then replays history
    /// according to `since`.
    ///
    /// At least one topic is required. A failed replay unregisters the subscription
    /// again and returns the error.
    pub async fn subscribe(
        &self,
        visitor: &Arc<Visitor>,
        topics: &[&str],
        since: &SinceMarker,
        include_scheduled: bool,
        subscriber: SubscriberFn,
        cancel: Option<CancelFn>,
    ) -> Result<Subscription> {
        if topics.is_empty() {
            return Err(Error::InvalidTopic(String::new()));
        }
        visitor.request_allowed()?;
        visitor.add_subscription()?;
        let resolved = match self.topics_from_ids(topics) {
            Ok(resolved) => resolved,
            Err(e) => {
                visitor.remove_subscription();
                return Err(e);
            }
        };
        let entries = resolved
            .into_iter()
            .map(|topic| {
                let id = topic.subscribe(subscriber.clone(), visitor.clone(), cancel.clone());
                (topic, id)
            })
            .collect();
        let subscription = Subscription {
            visitor: visitor.clone(),
            entries,
        };

        if let Err(e) = self
            .send_old_messages(&subscription, since, include_scheduled, &subscriber)
            .await
        {
            self.unsubscribe(subscription);
            return Err(e);
        }
        Ok(subscription)
    }

    async fn send_old_messages(
        &self,
        subscription: &Subscription,
        since: &SinceMarker,
        include_scheduled: bool,
        subscriber: &SubscriberFn,
    ) -> Result<()> {
        if since.is_none() {
            return Ok(());
        }
        let mut messages = Vec::new();
        for (topic, _) in &subscription.entries {
            messages.extend(
                self.message_cache
                    .messages(&topic.name, since, include_scheduled)
                    .await?,
            );
        }
        if subscription.entries.len() > 1 {
            messages.sort_by_key(|m| m.time);
        }
        for message in messages {
            subscriber(subscription.visitor.clone(), message).await?;
        }
        Ok(())
    }

    /// Removes the subscription from all its topics and releases the visitor's slot.
    pub fn unsubscribe(&self, subscription: Subscription) {
        for (topic, id) in &subscription.entries {
            topic.unsubscribe(*id);
        }
        subscription.visitor.remove_subscription();
    }

    /// Marks the subscription's visitor and topics as active.
    pub fn keepalive(&self, subscription: &Subscription) {
        subscription.visitor.keepalive();
        for (topic, _) in &subscription.entries {
            topic.keepalive();
        }
    }

    /// Reads the history of one or more topics without subscribing.
    pub async fn poll(
        &self,
        visitor: &Arc<Visitor>,
        topics: &[&str],
        since: &SinceMarker,
        include_scheduled: bool,
    ) -> Result<Vec<Message>> {
        visitor.request_allowed()?;
        let mut messages = Vec::new();
        for topic in topics {
            messages.extend(
                self.message_cache
                    .messages(topic, since, include_scheduled)
                    .await?,
            );
        }
        if topics.len() > 1 {
            messages.sort_by_key(|m| m.time);
        }
        Ok(messages)
    }

    /// Publishes every scheduled message that is now due and marks it published.
    /// Returns the number of messages handled.
    pub async fn send_delayed_messages(&self) -> Result<usize> {
        let due = self.message_cache.messages_due().await?;
        let count = due.len();
        for message in due {
            let topic = self.lock_topics().get(&message.topic).cloned();
            if let Some(topic) = topic {
                let ip = message
                    .sender
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                let user = (!message.user.is_empty()).then_some(message.user.as_str());
                let visitor = self.visitor(ip, user);
                topic.publish(&visitor, &message);
            }
            self.message_cache.mark_published(&message).await?;
            debug!(topic = %message.topic, message_id = %message.id, "Sent delayed message");
        }
        Ok(count)
    }

    /// Runs [`Server::send_delayed_messages`] every `interval` until the task is dropped.
    pub async fn run_delayed_sender(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = self.send_delayed_messages().await {
                warn!(error = %e, "Error sending delayed messages");
            }
        }
    }

    /// Sends a keepalive event to every live subscription. Returns the number of
    /// subscriptions reached.
    pub fn send_keepalives(&self) -> usize {
        self.snapshot_topics()
            .iter()
            .map(|topic| topic.send_keepalive())
            .sum()
    }

    /// Runs [`Server::send_keepalives`] every `interval` until the task is dropped.
    pub async fn run_keepalive_sender(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sent = self.send_keepalives();
            debug!(subscribers = sent, "Sent keepalives");
        }
    }

    /// Cancels, on every topic, the subscriptions of users other than `user_id`.
    pub fn cancel_subscribers_except_user(&self, user_id: &str) -> usize {
        self.snapshot_topics()
            .iter()
            .map(|t| t.cancel_subscribers_except_user(user_id))
            .sum()
    }

    /// Cancels, on every topic, the subscriptions owned by `user_id`.
    pub fn cancel_subscriber_user(&self, user_id: &str) -> usize {
        self.snapshot_topics()
            .iter()
            .map(|t| t.cancel_subscriber_user(user_id))
            .sum()
    }

    pub(crate) fn snapshot_topics(&self) -> Vec<Arc<Topic>> {
        self.lock_topics().values().cloned().collect()
    }

    /// Persists the message counter and closes the stores.
    pub async fn close(&self) -> Result<()> {
        self.message_cache
            .update_stats(self.messages_published())
            .await?;
        self.message_cache.close().await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("topics", &self.topics_count())
            .field("visitors", &self.visitors_count())
            .field("messages", &self.messages_published())
            .finish()
    }
}
