//! Subscription engine
//!
//! Indexes subscriptions by exact topic and by wildcard filter, stores
//! retained publications keyed by concrete topic, and answers "who
//! subscribes to T?" and "which retained publications match F?".
//!
//! Two separate namespaces are kept: *user* topics and *system* topics
//! (`$SYS/...`). System filters never match user topics and vice versa,
//! and system retained entries cannot be cleared by clients.

pub mod validation;

pub use validation::{
    has_wildcards, specificity, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// Prefix of the system topic namespace
pub const SYS_PREFIX: &str = "$SYS/";

/// Delivery priority of a subscription's queued messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

/// Number of distinct priorities (sizes the per-client queued lists)
pub const PRIORITY_COUNT: usize = 3;

impl Priority {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            _ => None,
        }
    }
}

/// A subscription entry
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribing client
    pub client_id: Arc<str>,
    /// Topic filter (may be a concrete name)
    pub filter: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
    /// Don't echo the client's own publications back to it
    pub no_local: bool,
    /// Survives disconnect and is written to the persistence image
    pub durable: bool,
    /// Queueing priority for deliveries through this subscription
    pub priority: Priority,
    /// Cached: filter contains wildcards
    pub wildcards: bool,
}

/// One matched subscriber for a concrete topic
#[derive(Debug, Clone)]
pub struct MatchedSubscription {
    pub client_id: Arc<str>,
    pub qos: QoS,
    pub priority: Priority,
    /// The filter that produced the match (the most specific one when the
    /// client subscribed through several matching filters)
    pub filter: Arc<str>,
}

/// Retained publication: at most one per concrete topic
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub qos: QoS,
    pub payload: Bytes,
}

#[derive(Default)]
struct Namespace {
    /// Exact-topic index
    exact: AHashMap<Arc<str>, Vec<Subscription>>,
    /// Flat list of wildcard subscriptions
    wildcard: Vec<Subscription>,
    /// Retained publications keyed by concrete topic
    retained: AHashMap<Arc<str>, RetainedMessage>,
}

impl Namespace {
    /// Returns (changed, durable image affected)
    fn upsert(&mut self, sub: Subscription) -> (bool, bool) {
        let durable = sub.durable;
        let list = if sub.wildcards {
            &mut self.wildcard
        } else {
            self.exact.entry(sub.filter.clone()).or_default()
        };

        if let Some(existing) = list
            .iter_mut()
            .find(|s| s.client_id == sub.client_id && s.filter == sub.filter)
        {
            let changed = existing.qos != sub.qos
                || existing.no_local != sub.no_local
                || existing.durable != sub.durable
                || existing.priority != sub.priority;
            let was_durable = existing.durable;
            *existing = sub;
            (changed, changed && (durable || was_durable))
        } else {
            list.push(sub);
            (true, durable)
        }
    }

    fn remove(&mut self, client_id: &str, filter: &str) -> bool {
        if has_wildcards(filter) {
            let before = self.wildcard.len();
            self.wildcard
                .retain(|s| !(s.client_id.as_ref() == client_id && s.filter.as_ref() == filter));
            self.wildcard.len() != before
        } else if let Some(list) = self.exact.get_mut(filter) {
            let before = list.len();
            list.retain(|s| s.client_id.as_ref() != client_id);
            let removed = list.len() != before;
            if list.is_empty() {
                self.exact.remove(filter);
            }
            removed
        } else {
            false
        }
    }

    fn remove_client(&mut self, client_id: &str, durable_too: bool) {
        let keep =
            |s: &Subscription| s.client_id.as_ref() != client_id || (s.durable && !durable_too);
        self.wildcard.retain(|s| keep(s));
        self.exact.retain(|_, list| {
            list.retain(|s| keep(s));
            !list.is_empty()
        });
    }

    fn subscription_count(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }
}

/// The subscription engine
pub struct SubscriptionEngine {
    user: RwLock<Namespace>,
    system: RwLock<Namespace>,
    /// Set when durable subscriptions or retained publications changed
    /// since the last persistence save
    dirty: AtomicBool,
}

fn is_system(topic: &str) -> bool {
    topic.starts_with(SYS_PREFIX) || topic == "$SYS"
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self {
            user: RwLock::new(Namespace::default()),
            system: RwLock::new(Namespace::default()),
            dirty: AtomicBool::new(false),
        }
    }

    fn namespace(&self, topic: &str) -> &RwLock<Namespace> {
        if is_system(topic) {
            &self.system
        } else {
            &self.user
        }
    }

    /// Add or update a subscription.
    ///
    /// Returns true iff the tuple was newly added or any attribute changed;
    /// callers use this to decide whether to replay retained publications.
    pub fn subscribe(
        &self,
        client_id: &Arc<str>,
        filter: &str,
        qos: QoS,
        no_local: bool,
        durable: bool,
        priority: Priority,
    ) -> bool {
        let sub = Subscription {
            client_id: client_id.clone(),
            filter: Arc::from(filter),
            qos,
            no_local,
            durable,
            priority,
            wildcards: has_wildcards(filter),
        };
        let (changed, durable_changed) = self.namespace(filter).write().upsert(sub);
        if durable_changed {
            self.dirty.store(true, Ordering::Release);
        }
        changed
    }

    /// Remove one subscription. The universal wildcard for a namespace
    /// (`#`, or `$SYS/#` for the system namespace) removes every
    /// subscription the client holds in that namespace.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let removed = if filter == "#" {
            self.user.write().remove_client(client_id, true);
            true
        } else if filter == "$SYS/#" {
            self.system.write().remove_client(client_id, true);
            true
        } else {
            self.namespace(filter).write().remove(client_id, filter)
        };
        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Remove every subscription for a client in both namespaces.
    /// With `durable_too=false`, durable subscriptions are kept (session
    /// going to the disconnected store).
    pub fn unsubscribe_all(&self, client_id: &str, durable_too: bool) {
        self.user.write().remove_client(client_id, durable_too);
        self.system.write().remove_client(client_id, durable_too);
        if durable_too {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// All subscribers whose filter matches the concrete `topic`.
    ///
    /// A client subscribed through several matching filters appears once,
    /// through the most specific filter. Subscriptions with no_local set
    /// are skipped when the client is the originator.
    pub fn get_subscribers(
        &self,
        topic: &str,
        originator: Option<&str>,
    ) -> SmallVec<[MatchedSubscription; 16]> {
        let ns = self.namespace(topic).read();
        let mut best: AHashMap<Arc<str>, MatchedSubscription> = AHashMap::new();

        let mut consider = |sub: &Subscription| {
            if sub.no_local && Some(sub.client_id.as_ref()) == originator {
                return;
            }
            if let Some(kept) = best.get(&sub.client_id) {
                if specificity(&kept.filter) >= specificity(&sub.filter) {
                    return;
                }
            }
            best.insert(
                sub.client_id.clone(),
                MatchedSubscription {
                    client_id: sub.client_id.clone(),
                    qos: sub.qos,
                    priority: sub.priority,
                    filter: sub.filter.clone(),
                },
            );
        };

        if let Some(list) = ns.exact.get(topic) {
            for sub in list {
                consider(sub);
            }
        }
        for sub in &ns.wildcard {
            if topic_matches_filter(topic, &sub.filter) {
                consider(sub);
            }
        }

        best.into_values().collect()
    }

    /// Store, replace or remove a retained publication. A wildcard topic is
    /// a no-op; an empty payload removes the entry, so a zero-length
    /// retained publication is never stored.
    pub fn set_retained(&self, topic: &str, qos: QoS, payload: Bytes) {
        if has_wildcards(topic) {
            return;
        }
        let mut ns = self.namespace(topic).write();
        if payload.is_empty() {
            ns.retained.remove(topic);
        } else {
            let topic: Arc<str> = Arc::from(topic);
            ns.retained.insert(
                topic.clone(),
                RetainedMessage {
                    topic,
                    qos,
                    payload,
                },
            );
        }
        drop(ns);
        self.dirty.store(true, Ordering::Release);
    }

    /// All retained publications whose topic matches `filter`.
    pub fn get_retained(&self, filter: &str) -> Vec<RetainedMessage> {
        let ns = self.namespace(filter).read();
        ns.retained
            .values()
            .filter(|r| topic_matches_filter(&r.topic, filter))
            .cloned()
            .collect()
    }

    /// Remove retained publications matching `filter`. System-namespace
    /// entries are never cleared.
    pub fn clear_retained(&self, filter: &str) {
        if is_system(filter) {
            return;
        }
        let mut ns = self.user.write();
        ns.retained
            .retain(|topic, _| !topic_matches_filter(topic, filter));
        drop(ns);
        self.dirty.store(true, Ordering::Release);
    }

    /// Total subscription count across both namespaces (for `$SYS` stats)
    pub fn subscription_count(&self) -> usize {
        self.user.read().subscription_count() + self.system.read().subscription_count()
    }

    /// Retained publication count in the user namespace (for `$SYS` stats)
    pub fn retained_count(&self) -> usize {
        self.user.read().retained.len()
    }

    /// Snapshot of user-namespace retained publications for persistence
    pub fn retained_snapshot(&self) -> Vec<RetainedMessage> {
        self.user.read().retained.values().cloned().collect()
    }

    /// Snapshot of durable subscriptions for persistence
    pub fn durable_snapshot(&self) -> Vec<Subscription> {
        let ns = self.user.read();
        ns.exact
            .values()
            .flatten()
            .chain(ns.wildcard.iter())
            .filter(|s| s.durable)
            .cloned()
            .collect()
    }

    /// True when durable subscriptions or retained publications changed
    /// since the flag was last cleared. Cleared only on successful save so
    /// a failed autosave retries.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

impl Default for SubscriptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    fn engine_with(subs: &[(&str, &str, QoS)]) -> SubscriptionEngine {
        let engine = SubscriptionEngine::new();
        for (client, filter, qos) in subs {
            engine.subscribe(&cid(client), filter, *qos, false, false, Priority::Normal);
        }
        engine
    }

    #[test]
    fn test_exact_and_wildcard_match() {
        let engine = engine_with(&[
            ("a", "sensor/1", QoS::AtLeastOnce),
            ("b", "sensor/+", QoS::AtMostOnce),
            ("c", "other/#", QoS::AtMostOnce),
        ]);

        let subs = engine.get_subscribers("sensor/1", None);
        let mut ids: Vec<_> = subs.iter().map(|s| s.client_id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_most_specific_filter_wins() {
        let engine = engine_with(&[
            ("a", "sensor/#", QoS::AtMostOnce),
            ("a", "sensor/+", QoS::AtLeastOnce),
            ("a", "sensor/1", QoS::ExactlyOnce),
        ]);

        let subs = engine.get_subscribers("sensor/1", None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].filter.as_ref(), "sensor/1");
        assert_eq!(subs[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_plus_more_specific_than_hash() {
        let engine = engine_with(&[
            ("a", "sensor/#", QoS::AtMostOnce),
            ("a", "sensor/+", QoS::AtLeastOnce),
        ]);

        let subs = engine.get_subscribers("sensor/1", None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].filter.as_ref(), "sensor/+");
    }

    #[test]
    fn test_no_local_skips_originator() {
        let engine = SubscriptionEngine::new();
        engine.subscribe(&cid("a"), "a/#", QoS::AtMostOnce, true, false, Priority::Normal);
        engine.subscribe(&cid("b"), "a/#", QoS::AtMostOnce, false, false, Priority::Normal);

        let subs = engine.get_subscribers("a/b", Some("a"));
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].client_id.as_ref(), "b");
    }

    #[test]
    fn test_subscribe_idempotent_changed_flag() {
        let engine = SubscriptionEngine::new();
        assert!(engine.subscribe(&cid("a"), "x", QoS::AtMostOnce, false, false, Priority::Normal));
        assert!(!engine.subscribe(&cid("a"), "x", QoS::AtMostOnce, false, false, Priority::Normal));
        // Attribute change reports changed again
        assert!(engine.subscribe(&cid("a"), "x", QoS::AtLeastOnce, false, false, Priority::Normal));
        assert_eq!(engine.subscription_count(), 1);
    }

    #[test]
    fn test_universal_unsubscribe() {
        let engine = engine_with(&[
            ("a", "x", QoS::AtMostOnce),
            ("a", "y/#", QoS::AtMostOnce),
            ("b", "x", QoS::AtMostOnce),
        ]);
        engine.unsubscribe("a", "#");
        assert_eq!(engine.subscription_count(), 1);
        let subs = engine.get_subscribers("x", None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].client_id.as_ref(), "b");
    }

    #[test]
    fn test_system_namespace_separate() {
        let engine = engine_with(&[
            ("a", "#", QoS::AtMostOnce),
            ("b", "$SYS/#", QoS::AtMostOnce),
        ]);

        // The user-namespace # does not see system topics
        let subs = engine.get_subscribers("$SYS/broker/uptime", None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].client_id.as_ref(), "b");

        let subs = engine.get_subscribers("some/topic", None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].client_id.as_ref(), "a");
    }

    #[test]
    fn test_retained_set_get_clear() {
        let engine = SubscriptionEngine::new();
        engine.set_retained("sensor/1", QoS::AtLeastOnce, Bytes::from_static(b"42"));
        engine.set_retained("sensor/2", QoS::AtMostOnce, Bytes::from_static(b"43"));

        let matched = engine.get_retained("sensor/+");
        assert_eq!(matched.len(), 2);

        // Empty payload clears
        engine.set_retained("sensor/1", QoS::AtMostOnce, Bytes::new());
        let matched = engine.get_retained("sensor/+");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].topic.as_ref(), "sensor/2");

        engine.clear_retained("#");
        assert_eq!(engine.retained_count(), 0);
    }

    #[test]
    fn test_retained_wildcard_topic_noop() {
        let engine = SubscriptionEngine::new();
        engine.set_retained("sensor/+", QoS::AtMostOnce, Bytes::from_static(b"x"));
        assert_eq!(engine.retained_count(), 0);
    }

    #[test]
    fn test_system_retained_not_cleared() {
        let engine = SubscriptionEngine::new();
        engine.set_retained("$SYS/broker/version", QoS::AtMostOnce, Bytes::from_static(b"1"));
        engine.clear_retained("$SYS/broker/version");
        assert_eq!(engine.get_retained("$SYS/broker/version").len(), 1);
    }

    #[test]
    fn test_durable_survives_nondurable_sweep() {
        let engine = SubscriptionEngine::new();
        engine.subscribe(&cid("a"), "keep", QoS::AtLeastOnce, false, true, Priority::Normal);
        engine.subscribe(&cid("a"), "drop", QoS::AtMostOnce, false, false, Priority::Normal);

        engine.unsubscribe_all("a", false);
        assert_eq!(engine.subscription_count(), 1);
        assert_eq!(engine.durable_snapshot().len(), 1);

        engine.unsubscribe_all("a", true);
        assert_eq!(engine.subscription_count(), 0);
    }
}
