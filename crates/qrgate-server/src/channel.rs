//! Per-token publish/subscribe for session events
//!
//! Publishing never blocks: every physical connection owns an unbounded
//! outbound queue and closed queues are pruned on the next publish. Events
//! published before anyone joins are held for a grace period and flushed to
//! the first connection that subscribes.

use qrgate_core::{ChannelEvent, ChannelFrame, EventSink};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Outbound queue of one physical connection
pub type Outbound = mpsc::UnboundedSender<ChannelFrame>;

#[derive(Default)]
struct Topic {
    /// Connections joined to this token, by subscription id
    subscribers: HashMap<u64, Outbound>,
    /// Events published while nobody was listening
    backlog: VecDeque<(Instant, ChannelEvent)>,
}

impl Topic {
    fn drop_stale(&mut self, grace: Duration) {
        let now = Instant::now();
        while let Some((at, _)) = self.backlog.front() {
            if now.duration_since(*at) > grace {
                self.backlog.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.backlog.is_empty()
    }
}

struct ChannelInner {
    topics: Mutex<HashMap<String, Topic>>,
    next_id: AtomicU64,
    grace: Duration,
}

impl ChannelInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, token: &str, id: u64) {
        let mut topics = self.topics();
        if let Some(topic) = topics.get_mut(token) {
            topic.subscribers.remove(&id);
            if topic.is_idle() {
                topics.remove(token);
            }
        }
    }
}

/// Realtime delivery of issuer transitions to joined connections
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    /// Create a channel that buffers unclaimed events for `grace`
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                grace,
            }),
        }
    }

    /// Join `connection` to the events of `token`
    ///
    /// Buffered events still within the grace period are delivered to this
    /// connection before any later event.
    pub fn subscribe(&self, token: &str, connection: Outbound) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.inner.topics();
        let topic = topics.entry(token.to_string()).or_default();

        topic.drop_stale(self.inner.grace);
        let flushed = topic.backlog.len();
        for (_, event) in topic.backlog.drain(..) {
            let _ = connection.send(ChannelFrame::for_token(token, event));
        }
        topic.subscribers.insert(id, connection);

        debug!(
            "Subscriber {} joined ({} connections, {} buffered events flushed)",
            id,
            topic.subscribers.len(),
            flushed
        );

        Subscription {
            id,
            token: token.to_string(),
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every connection joined to `token`
    pub fn publish(&self, token: &str, event: ChannelEvent) {
        let mut topics = self.inner.topics();
        let topic = topics.entry(token.to_string()).or_default();

        let frame = ChannelFrame::for_token(token, event.clone());
        topic.subscribers.retain(|id, tx| {
            let alive = tx.send(frame.clone()).is_ok();
            if !alive {
                trace!("Pruned closed subscriber {}", id);
            }
            alive
        });

        if topic.subscribers.is_empty() {
            topic.drop_stale(self.inner.grace);
            topic.backlog.push_back((Instant::now(), event));
            debug!("Buffered event for a token without subscribers");
        }
    }

    /// Release a subscription; equivalent to dropping it
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Number of live connections joined to `token`
    pub fn subscriber_count(&self, token: &str) -> usize {
        self.inner
            .topics()
            .get(token)
            .map(|t| t.subscribers.values().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drop stale backlogs, closed connections and idle topics
    pub fn prune(&self) -> usize {
        let grace = self.inner.grace;
        let mut topics = self.inner.topics();
        let before = topics.len();
        for topic in topics.values_mut() {
            topic.subscribers.retain(|_, tx| !tx.is_closed());
            topic.drop_stale(grace);
        }
        topics.retain(|_, t| !t.is_idle());
        before - topics.len()
    }
}

impl EventSink for RealtimeChannel {
    fn publish(&self, token: &str, event: ChannelEvent) {
        RealtimeChannel::publish(self, token, event);
    }
}

/// Owned membership of one connection in one token's topic
///
/// Dropping the handle releases the membership.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    token: String,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove(&self.token, self.id);
            debug!("Subscriber {} released", self.id);
        }
    }
}
