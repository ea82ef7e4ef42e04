//! Topic subscriptions and fan-out.
//!
//! Each topic maps connection ids to a subscriber: the connection handle plus
//! the identity cached when it subscribed. Fan-out authorizes every recipient
//! against that cached identity and evicts subscribers whose send fails.

use crate::auth::{Authorizer, SessionStore};
use crate::connection::{Connection, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use rtd_core::Identity;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Prefix marking a trader subscription.
pub const TRADER_PREFIX: char = '$';

/// A subscribed connection and the identity it subscribed with.
#[derive(Clone)]
pub struct Subscriber {
    pub connection: Arc<Connection>,
    pub identity: Identity,
    /// When `identity` was last resolved.
    pub cached_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Topic name with any trader prefix stripped.
    pub topic: String,
    /// `false` when the connection was already subscribed.
    pub newly_added: bool,
    /// The connection became the topic's trader.
    pub trader_granted: bool,
}

/// Re-validates cached identities older than `ttl`.
struct IdentityRefresh {
    ttl: Duration,
    sessions: Arc<dyn SessionStore>,
}

/// Topic → subscribers, plus the trader holding each `$` topic.
#[derive(Default)]
pub struct SubscriptionTable {
    topics: DashMap<String, DashMap<ConnectionId, Subscriber>>,
    traders: DashMap<String, ConnectionId>,
    refresh: Option<IdentityRefresh>,
}

impl SubscriptionTable {
    /// Empty table without identity refresh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached identities older than `ttl` are re-checked with `sessions`
    /// before a fan-out uses them.
    pub fn with_identity_refresh(mut self, ttl: Duration, sessions: Arc<dyn SessionStore>) -> Self {
        self.refresh = Some(IdentityRefresh { ttl, sessions });
        self
    }

    /// Subscribe `conn` to `raw_topic`. Subscribing twice is a no-op.
    ///
    /// A `$`-prefixed topic subscribes to the stripped name and makes the
    /// connection its trader if the topic has none yet.
    pub fn subscribe(
        &self,
        raw_topic: &str,
        conn: &Arc<Connection>,
        identity: &Identity,
    ) -> SubscribeOutcome {
        let (topic, wants_trader) = match raw_topic.strip_prefix(TRADER_PREFIX) {
            Some(stripped) => (stripped, true),
            None => (raw_topic, false),
        };

        let trader_granted = wants_trader
            && match self.traders.entry(topic.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(conn.id().clone());
                    true
                }
                Entry::Occupied(_) => false,
            };
        if trader_granted {
            info!(conn_id = %conn.id(), topic = %topic, "trader registered");
        }

        let subscribers = self.topics.entry(topic.to_string()).or_default();
        let newly_added = match subscribers.entry(conn.id().clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Subscriber {
                    connection: conn.clone(),
                    identity: identity.clone(),
                    cached_at: Instant::now(),
                });
                true
            }
            Entry::Occupied(_) => false,
        };
        drop(subscribers);

        if newly_added {
            debug!(conn_id = %conn.id(), topic = %topic, "subscribed");
        }
        SubscribeOutcome {
            topic: topic.to_string(),
            newly_added,
            trader_granted,
        }
    }

    /// Deliver `raw` to every authorized subscriber of `topic` except `sender`.
    ///
    /// Returns the ids evicted because their send failed.
    pub async fn share(
        &self,
        sender: Option<&ConnectionId>,
        topic: &str,
        raw: &str,
        authorizer: &dyn Authorizer,
    ) -> Vec<ConnectionId> {
        let recipients: Vec<Subscriber> = match self.topics.get(topic) {
            Some(subscribers) => subscribers
                .iter()
                .filter(|s| Some(s.key()) != sender)
                .map(|s| s.value().clone())
                .collect(),
            None => return Vec::new(),
        };

        let authorized: Vec<Arc<Connection>> = recipients
            .into_iter()
            .filter_map(|subscriber| {
                let identity = self.current_identity(topic, &subscriber)?;
                if !authorizer.authorize(topic, &identity).can_receive() {
                    debug!(
                        conn_id = %subscriber.connection.id(),
                        topic = %topic,
                        user = %identity.id,
                        "delivery denied"
                    );
                    return None;
                }
                Some(subscriber.connection)
            })
            .collect();

        // Every write is bounded by its connection's send timeout, so one
        // stalled peer delays this fan-out by at most that long.
        let results = join_all(authorized.iter().map(|conn| conn.send(raw))).await;

        let mut evicted = Vec::new();
        for (conn, result) in authorized.iter().zip(results) {
            if let Err(e) = result {
                let id = conn.id().clone();
                warn!(
                    conn_id = %id,
                    topic = %topic,
                    error = %e,
                    "send failed, evicting subscriber"
                );
                self.evict(topic, &id);
                evicted.push(id);
            }
        }
        evicted
    }

    /// The identity to authorize with, refreshing it when it has expired.
    /// `None` drops the subscriber from the topic.
    fn current_identity(&self, topic: &str, subscriber: &Subscriber) -> Option<Identity> {
        let Some(refresh) = &self.refresh else {
            return Some(subscriber.identity.clone());
        };
        if subscriber.cached_at.elapsed() < refresh.ttl {
            return Some(subscriber.identity.clone());
        }
        let id = subscriber.connection.id();
        match refresh.sessions.refresh(&subscriber.identity) {
            Some(identity) => {
                if let Some(subscribers) = self.topics.get(topic) {
                    if let Some(mut entry) = subscribers.get_mut(id) {
                        entry.identity = identity.clone();
                        entry.cached_at = Instant::now();
                    }
                }
                Some(identity)
            }
            None => {
                info!(conn_id = %id, topic = %topic, "cached identity revoked, unsubscribing");
                self.evict(topic, id);
                None
            }
        }
    }

    /// Remove `id` from `topic` and from the topic's trader slot.
    /// Topics left without subscribers are dropped.
    pub fn evict(&self, topic: &str, id: &ConnectionId) {
        if let Some(subscribers) = self.topics.get(topic) {
            subscribers.remove(id);
        }
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
        self.traders.remove_if(topic, |_, trader| trader == id);
    }

    /// Remove `id` from every topic and trader slot.
    pub fn unsubscribe_all(&self, id: &ConnectionId) {
        for subscribers in self.topics.iter() {
            subscribers.remove(id);
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
        self.traders.retain(|_, trader| trader != id);
    }

    pub fn is_subscribed(&self, topic: &str, id: &ConnectionId) -> bool {
        self.topics
            .get(topic)
            .map(|s| s.contains_key(id))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn trader(&self, topic: &str) -> Option<ConnectionId> {
        self.traders.get(topic).map(|t| t.value().clone())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
