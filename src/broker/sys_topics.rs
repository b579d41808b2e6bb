//! $SYS topics publisher
//!
//! Publishes broker statistics as retained messages under `$SYS/broker/...`
//! at the housekeeping cadence. Static topics (version, timestamp,
//! settings) are published once at startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;

use super::Shared;
use crate::protocol::{Publish, QoS};

/// Version string for $SYS/broker/version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Traffic counters, updated by the connection handlers
#[derive(Default)]
pub struct Stats {
    msgs_received: AtomicU64,
    msgs_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    rates: Mutex<Option<RateSnapshot>>,
}

struct RateSnapshot {
    at: Instant,
    msgs_received: u64,
    msgs_sent: u64,
    bytes_received: u64,
    bytes_sent: u64,
}

impl Stats {
    pub fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_publish_received(&self) {
        self.msgs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_publish_sent(&self) {
        self.msgs_sent.fetch_add(1, Ordering::Relaxed);
    }
}

fn publish(shared: &Shared, topic: &str, value: String) {
    shared.broker_publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: true,
        topic: Arc::from(topic),
        msg_id: None,
        payload: Bytes::from(value),
    });
}

/// Topics published once at startup
pub fn publish_static(shared: &Shared) {
    publish(shared, "$SYS/broker/version", format!("wrenmq {}", VERSION));
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    publish(shared, "$SYS/broker/timestamp", timestamp.to_string());
    publish(
        shared,
        "$SYS/broker/settings/max_queued_messages",
        shared.config.max_queued_messages.to_string(),
    );
    publish(
        shared,
        "$SYS/broker/settings/max_inflight_messages",
        shared.config.max_inflight_messages.to_string(),
    );
}

/// Dynamic statistics, refreshed on the housekeeping tick
pub fn publish_stats(shared: &Shared) {
    let uptime = shared.start_time.elapsed().as_secs();
    publish(shared, "$SYS/broker/uptime", format!("{} seconds", uptime));

    let msgs_received = shared.stats.msgs_received.load(Ordering::Relaxed);
    let msgs_sent = shared.stats.msgs_sent.load(Ordering::Relaxed);
    let bytes_received = shared.stats.bytes_received.load(Ordering::Relaxed);
    let bytes_sent = shared.stats.bytes_sent.load(Ordering::Relaxed);

    publish(
        shared,
        "$SYS/broker/messages/received",
        msgs_received.to_string(),
    );
    publish(shared, "$SYS/broker/messages/sent", msgs_sent.to_string());
    publish(
        shared,
        "$SYS/broker/bytes/received",
        bytes_received.to_string(),
    );
    publish(shared, "$SYS/broker/bytes/sent", bytes_sent.to_string());

    // Per-second rates over the last housekeeping interval
    let now = Instant::now();
    let mut rates = shared.stats.rates.lock();
    if let Some(prev) = rates.as_ref() {
        let elapsed = now.duration_since(prev.at).as_secs_f64();
        if elapsed > 0.0 {
            let rate = |cur: u64, prev: u64| ((cur - prev) as f64 / elapsed).round() as u64;
            publish(
                shared,
                "$SYS/broker/messages/per second/received",
                rate(msgs_received, prev.msgs_received).to_string(),
            );
            publish(
                shared,
                "$SYS/broker/messages/per second/sent",
                rate(msgs_sent, prev.msgs_sent).to_string(),
            );
            publish(
                shared,
                "$SYS/broker/bytes/per second/received",
                rate(bytes_received, prev.bytes_received).to_string(),
            );
            publish(
                shared,
                "$SYS/broker/bytes/per second/sent",
                rate(bytes_sent, prev.bytes_sent).to_string(),
            );
        }
    }
    *rates = Some(RateSnapshot {
        at: now,
        msgs_received,
        msgs_sent,
        bytes_received,
        bytes_sent,
    });
    drop(rates);

    publish(
        shared,
        "$SYS/broker/client count/connected",
        shared.sessions.connected_count().to_string(),
    );
    publish(
        shared,
        "$SYS/broker/client count/disconnected",
        shared.sessions.disconnected_count().to_string(),
    );
    publish(
        shared,
        "$SYS/broker/subscriptions/count",
        shared.subscriptions.subscription_count().to_string(),
    );
    publish(
        shared,
        "$SYS/broker/retained messages/count",
        shared.subscriptions.retained_count().to_string(),
    );
}
