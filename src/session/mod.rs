//! Client session management
//!
//! Holds per-client state for both protocol variants: inflight windows,
//! queued-by-priority lists, will, keepalive, and (for MQTT-SN) the
//! topic-id registration table. Sessions live in exactly one of two
//! indexes: *connected* or *disconnected-but-persistent*.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{Publish, QoS, Will};
use crate::topic::{Priority, PRIORITY_COUNT};

/// Protocol variant a session speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    #[default]
    Mqtt,
    MqttSn,
}

/// Connect handshake progress. MQTT sessions go straight to ConnAckSent;
/// MQTT-SN sessions with a will pass through the two will substates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    Idle,
    /// MQTT-SN: WILLTOPICREQ sent, waiting for WILLTOPIC
    AwaitingWillTopic,
    /// MQTT-SN: WILLMSGREQ sent, waiting for WILLMSG
    AwaitingWillMsg,
    /// CONNACK sent, session fully connected
    ConnAckSent,
}

/// The acknowledgement an inflight exchange is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextExpected {
    /// Outbound QoS 1: waiting for PUBACK
    PubAck,
    /// Outbound QoS 2: waiting for PUBREC
    PubRec,
    /// Inbound QoS 2: waiting for PUBREL
    PubRel,
    /// Outbound QoS 2: PUBREL sent, waiting for PUBCOMP
    PubComp,
}

/// An outbound message inside the inflight window
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub msg_id: u16,
    pub qos: QoS,
    pub retain: bool,
    /// Shared publication (topic and payload are reference-counted)
    pub publish: Publish,
    pub next_expected: NextExpected,
    /// None forces an immediate resend on the next retry sweep
    pub last_touch: Option<Instant>,
}

/// A message waiting for inflight-window capacity
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub qos: QoS,
    pub retain: bool,
    pub publish: Publish,
}

/// MQTT-SN topic-id registration table
#[derive(Debug, Default)]
pub struct Registrations {
    by_id: HashMap<u16, Arc<str>>,
    by_name: HashMap<Arc<str>, u16>,
    next_id: u16,
}

impl Registrations {
    /// Register a topic name, reusing an existing id when present.
    pub fn register(&mut self, topic: &str) -> u16 {
        if let Some(&id) = self.by_name.get(topic) {
            return id;
        }
        // Ids are nonzero; wrap is far beyond any constrained device's table
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = self.next_id;
        let name: Arc<str> = Arc::from(topic);
        self.by_id.insert(id, name.clone());
        self.by_name.insert(name, id);
        id
    }

    /// Install a registration under a fixed (pre-defined) id.
    pub fn register_predefined(&mut self, id: u16, topic: &str) {
        let name: Arc<str> = Arc::from(topic);
        self.by_id.insert(id, name.clone());
        self.by_name.insert(name, id);
    }

    pub fn name_of(&self, id: u16) -> Option<&Arc<str>> {
        self.by_id.get(&id)
    }

    pub fn id_of(&self, topic: &str) -> Option<u16> {
        self.by_name.get(topic).copied()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
        self.next_id = 0;
    }
}

/// An outbound REGISTER waiting for its REGACK; the held message is
/// released into the inflight window once the registration completes.
#[derive(Debug, Clone)]
pub struct PendingRegistration {
    pub topic_id: u16,
    pub msg_id: u16,
    pub topic: Arc<str>,
    pub held: QueuedMessage,
    pub last_touch: Instant,
}

/// An outbound MQTT-SN SUBSCRIBE waiting for its SUBACK. One is
/// outstanding at a time; a bridge link works through its remote filters
/// in sequence.
#[derive(Debug, Clone)]
pub struct PendingSubscription {
    pub msg_id: u16,
    pub filter: Arc<str>,
    pub qos: QoS,
    pub last_touch: Instant,
}

/// Client session
pub struct Session {
    // identity
    pub client_id: Arc<str>,
    pub remote_addr: Option<SocketAddr>,
    pub username: Option<String>,

    // link
    pub variant: Variant,
    pub connect_state: ConnectState,
    /// Mount point of the listener this client connected through
    pub mount_point: Option<Arc<str>>,

    // flags
    pub connected: bool,
    /// Cleared on I/O error or queue exhaustion; a not-good session is
    /// swept instead of written to
    pub good: bool,
    /// True iff this session was initiated by a bridge connection
    pub outbound: bool,
    pub clean_session: bool,
    /// Private-bridge extension: suppress echoing own publications
    pub no_local: bool,
    pub ping_outstanding: bool,
    /// Reentrancy guard for close_session
    pub closing: bool,

    // windows
    pub inflight_in: HashMap<u16, InflightMessage>,
    pub inflight_out: HashMap<u16, InflightMessage>,
    pub queued: [VecDeque<QueuedMessage>; PRIORITY_COUNT],

    // misc
    next_msg_id: u16,
    pub keep_alive: u16,
    pub last_contact: Instant,
    pub will: Option<Will>,
    /// Messages dropped because the queue was full
    pub discarded: usize,

    // MQTT-SN only
    pub registrations: Registrations,
    pub pending_registration: Option<PendingRegistration>,
    pub pending_subscription: Option<PendingSubscription>,

    // bridge only: name of the owning bridge connection
    pub bridge_name: Option<Arc<str>>,
}

impl Session {
    pub fn new(client_id: Arc<str>, variant: Variant) -> Self {
        Self {
            client_id,
            remote_addr: None,
            username: None,
            variant,
            connect_state: ConnectState::Idle,
            mount_point: None,
            connected: false,
            good: true,
            outbound: false,
            clean_session: true,
            no_local: false,
            ping_outstanding: false,
            closing: false,
            inflight_in: HashMap::new(),
            inflight_out: HashMap::new(),
            queued: Default::default(),
            next_msg_id: 0,
            keep_alive: 60,
            last_contact: Instant::now(),
            will: None,
            discarded: 0,
            registrations: Registrations::default(),
            pending_registration: None,
            pending_subscription: None,
            bridge_name: None,
        }
    }

    /// Next free message id: increments modulo 65535, never 0, skipping
    /// ids still present in the inflight window.
    pub fn next_msg_id(&mut self) -> u16 {
        loop {
            self.next_msg_id = self.next_msg_id.wrapping_add(1);
            if self.next_msg_id == 0 {
                self.next_msg_id = 1;
            }
            if !self.inflight_out.contains_key(&self.next_msg_id) {
                return self.next_msg_id;
            }
        }
    }

    /// Update the last-contact timestamp
    pub fn touch(&mut self) {
        self.last_contact = Instant::now();
    }

    /// Total queued messages across all priorities
    pub fn queued_len(&self) -> usize {
        self.queued.iter().map(VecDeque::len).sum()
    }

    /// Append a message to the queue for its priority
    pub fn enqueue(&mut self, priority: Priority, msg: QueuedMessage) {
        self.queued[priority as usize].push_back(msg);
    }

    /// Pop the next queued message, highest priority first
    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        for queue in self.queued.iter_mut().rev() {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
        }
        None
    }

    /// Drop QoS-0 messages from the queued lists; they do not survive a
    /// disconnect.
    pub fn purge_qos0_queued(&mut self) {
        for queue in self.queued.iter_mut() {
            queue.retain(|m| m.qos != QoS::AtMostOnce);
        }
    }

    /// Reset volatile protocol state for a clean-session connect or a
    /// bridge reconnect: message lists, counters and ping state.
    pub fn reset(&mut self) {
        self.inflight_in.clear();
        self.inflight_out.clear();
        for queue in self.queued.iter_mut() {
            queue.clear();
        }
        self.next_msg_id = 0;
        self.ping_outstanding = false;
        self.discarded = 0;
        self.pending_registration = None;
        self.pending_subscription = None;
        self.registrations.clear();
    }

    /// Mark every inflight outbound message for immediate retransmission
    /// (used when a persistent session reattaches).
    pub fn mark_inflight_for_resend(&mut self) {
        for msg in self.inflight_out.values_mut() {
            msg.last_touch = None;
        }
    }
}

/// Session store: connected and disconnected-but-persistent indexes.
/// A client id is present in at most one of the two.
pub struct SessionStore {
    connected: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    disconnected: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            connected: DashMap::new(),
            disconnected: DashMap::new(),
        }
    }

    pub fn get_connected(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.connected.get(client_id).map(|r| r.clone())
    }

    pub fn get_disconnected(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.disconnected.get(client_id).map(|r| r.clone())
    }

    /// Look up a session in either index
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.get_connected(client_id)
            .or_else(|| self.get_disconnected(client_id))
    }

    /// Insert into the connected index, removing any disconnected entry
    pub fn insert_connected(&self, client_id: Arc<str>, session: Arc<RwLock<Session>>) {
        self.disconnected.remove(&client_id);
        self.connected.insert(client_id, session);
    }

    /// Detach a persistent session: move it from connected to disconnected
    pub fn move_to_disconnected(&self, client_id: &str) {
        if let Some((id, session)) = self.connected.remove(client_id) {
            self.disconnected.insert(id, session);
        }
    }

    /// Insert directly into the disconnected index (used when restoring
    /// durable subscriptions at startup)
    pub fn insert_disconnected(&self, client_id: Arc<str>, session: Arc<RwLock<Session>>) {
        if self.connected.contains_key(&client_id) {
            return;
        }
        self.disconnected.insert(client_id, session);
    }

    /// Remove a session from both indexes
    pub fn remove(&self, client_id: &str) {
        self.connected.remove(client_id);
        self.disconnected.remove(client_id);
    }

    /// Reattach a disconnected session, if one exists, into the connected
    /// index and return it.
    pub fn reattach(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        let (id, session) = self.disconnected.remove(client_id)?;
        self.connected.insert(id, session.clone());
        Some(session)
    }

    /// Visit every connected session
    pub fn for_each_connected<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<str>, &Arc<RwLock<Session>>),
    {
        for entry in self.connected.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn disconnected_count(&self) -> usize {
        self.disconnected.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
