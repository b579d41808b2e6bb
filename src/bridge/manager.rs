//! Bridge connection state machines
//!
//! Each bridge connection cycles STOPPED -> RUNNING -> STOPPING ->
//! STOPPED (or deleted), swept on the housekeeping boundary. The
//! reconnect schedule is geometric with a per-connection random offset,
//! doubling the window each failure up to the third, then saturating.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info};

use crate::broker::{Outbound, Shared};
use crate::config::{BridgeConfig, StartType};

use super::client;
use super::topic_mapper::TopicMapper;

/// Default reconnect interval when none is configured
const DEFAULT_RECONNECT_SECS: u64 = 20;

/// Bridge connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Running,
    Stopping,
    StoppingThenDelete,
    Delete,
    Switching,
}

/// Outcome of the most recent connect attempt on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectResult {
    #[default]
    NoneReceived,
    Accepted,
    UnacceptableVersion,
}

/// Reconnect interval schedule.
///
/// With equal start and max intervals the interval is `start * 2^(n-1)`
/// capped at the third failure. Otherwise a random offset inside
/// [start, max] is chosen on the first attempt and subsequent failures
/// follow a geometric schedule that doubles the window each time, again
/// saturating after the third failure.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    start: u64,
    max: u64,
    chosen: u64,
    pub current: u64,
    count: u32,
}

fn pow2(exp: u32) -> u64 {
    1u64 << exp.min(62)
}

fn end_interval(count: u32, start: u64, max: u64) -> u64 {
    if count == 0 {
        start
    } else if count == 1 {
        max
    } else {
        end_interval(count - 1, start, max) + (max - start) * pow2(count - 1)
    }
}

impl ReconnectSchedule {
    pub fn new(start: Option<u64>, max: Option<u64>) -> Self {
        let start = start.unwrap_or(DEFAULT_RECONNECT_SECS);
        let max = max.unwrap_or(start);
        let (current, chosen) = if max > start {
            let current = rand::thread_rng().gen_range(start..=max);
            (current, current - start)
        } else {
            (start, 0)
        };
        Self {
            start,
            max,
            chosen,
            current,
            count: 0,
        }
    }

    /// Advance the schedule after a failed attempt
    pub fn next_retry(&mut self) {
        self.count += 1;
        if self.max > self.start {
            let count = self.count.min(3);
            self.current = end_interval(count - 1, self.start, self.max)
                + self.chosen * pow2(count - 1);
        } else {
            self.current = self.start * pow2(self.count.min(3) - 1);
        }
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.count = 0;
        self.current = if self.max > self.start {
            self.start + self.chosen
        } else {
            self.start
        };
    }
}

/// Mutable state of one remote link (the primary, or the backup probe)
pub(super) struct Link {
    pub connected: AtomicBool,
    pub connecting: AtomicBool,
    /// Address index currently in use (the backup always probes index 0)
    pub cur_address: AtomicUsize,
    /// Private-protocol trial state for the next attempt
    pub no_local: AtomicBool,
    pub last_result: Mutex<ConnectResult>,
    /// When the link last went down (paces the retry schedule)
    pub last_attempt: Mutex<Option<Instant>>,
    /// Last inbound or outbound traffic (drives the lazy idle timeout)
    pub last_traffic: Mutex<Instant>,
}

impl Link {
    fn new(try_private: bool) -> Self {
        Self {
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            cur_address: AtomicUsize::new(0),
            no_local: AtomicBool::new(try_private),
            last_result: Mutex::new(ConnectResult::NoneReceived),
            last_attempt: Mutex::new(None),
            last_traffic: Mutex::new(Instant::now()),
        }
    }
}

/// One configured bridge connection
pub struct BridgeConnection {
    pub cfg: BridgeConfig,
    pub mapper: TopicMapper,
    pub client_id: Arc<str>,
    state: Mutex<BridgeState>,
    manually_stopped: AtomicBool,
    ever_succeeded: AtomicBool,
    /// Set when the backup probe saw a CONNACK on the main address
    backup_ready: AtomicBool,
    pub(super) reconnect: Mutex<ReconnectSchedule>,
    pub(super) primary: Link,
    pub(super) backup: Link,
}

impl BridgeConnection {
    pub fn new(cfg: BridgeConfig) -> Arc<Self> {
        let mapper = TopicMapper::new(&cfg.topics);
        let client_id: Arc<str> = Arc::from(cfg.effective_client_id().as_str());
        let reconnect = ReconnectSchedule::new(cfg.start_interval, cfg.max_interval);
        let try_private = cfg.try_private;
        Arc::new(Self {
            cfg,
            mapper,
            client_id,
            state: Mutex::new(BridgeState::Stopped),
            manually_stopped: AtomicBool::new(false),
            ever_succeeded: AtomicBool::new(false),
            backup_ready: AtomicBool::new(false),
            reconnect: Mutex::new(reconnect),
            primary: Link::new(try_private),
            backup: Link::new(try_private),
        })
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: BridgeState) {
        *self.state.lock() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.primary.connected.load(Ordering::Acquire)
    }

    pub(super) fn mark_succeeded(&self) {
        self.ever_succeeded.store(true, Ordering::Release);
    }

    pub(super) fn note_backup_ready(&self) {
        self.backup_ready.store(true, Ordering::Release);
    }

    pub(super) fn note_traffic(&self) {
        *self.primary.last_traffic.lock() = Instant::now();
    }

    /// Clean-session setting: explicit, or clean iff more than one
    /// address is configured.
    pub fn effective_clean_session(&self) -> bool {
        self.cfg
            .clean_session
            .unwrap_or(self.cfg.addresses.len() > 1)
    }

    /// Stop this connection from the admin side
    pub fn stop(&self) {
        self.manually_stopped.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if *state == BridgeState::Running || *state == BridgeState::Switching {
            *state = BridgeState::Stopping;
        }
    }

    /// Request start (clears a manual stop)
    pub fn start(&self) {
        self.manually_stopped.store(false, Ordering::Release);
        let mut state = self.state.lock();
        if *state == BridgeState::Stopped {
            *state = BridgeState::Running;
        }
    }

    /// Mark for deletion; the connection drains first
    pub fn delete(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            BridgeState::Stopped => BridgeState::Delete,
            _ => BridgeState::StoppingThenDelete,
        };
    }
}

/// The bridge manager: sweeps every connection on the housekeeping tick
pub struct BridgeManager {
    shared: Arc<Shared>,
    connections: RwLock<Vec<Arc<BridgeConnection>>>,
}

impl BridgeManager {
    pub fn new(shared: Arc<Shared>, configs: Vec<BridgeConfig>) -> Arc<Self> {
        let connections = configs.into_iter().map(BridgeConnection::new).collect();
        Arc::new(Self {
            shared,
            connections: RwLock::new(connections),
        })
    }

    pub fn find(&self, name: &str) -> Option<Arc<BridgeConnection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.cfg.name == name)
            .cloned()
    }

    /// Bring up automatically-started connections
    pub fn start(&self) {
        for bc in self.connections.read().iter() {
            match bc.cfg.start_type {
                StartType::Automatic | StartType::Once => bc.set_state(BridgeState::Running),
                StartType::Manual | StartType::Lazy => {}
            }
            info!(
                "Bridge connection {} configured ({} addresses)",
                bc.cfg.name,
                bc.cfg.addresses.len()
            );
        }
    }

    /// Begin stopping every connection (broker shutdown)
    pub fn stop(&self) {
        for bc in self.connections.read().iter() {
            match bc.state() {
                BridgeState::Stopped | BridgeState::Delete => {}
                BridgeState::StoppingThenDelete => {}
                _ => bc.set_state(BridgeState::Stopping),
            }
        }
        // Kick the close path straight away rather than waiting a tick
        self.timeslice();
    }

    /// Housekeeping entry point: transmission control for every
    /// connection, then one step for each non-stopped link.
    pub fn timeslice(&self) {
        let connections: Vec<_> = self.connections.read().clone();
        for bc in &connections {
            self.transmission_control(bc);
        }
        for bc in &connections {
            if bc.state() != BridgeState::Stopped {
                self.run_connection(bc);
            }
        }
        // Drained deleted connections disappear
        self.connections
            .write()
            .retain(|c| c.state() != BridgeState::Delete);
    }

    fn queued_on_primary(&self, bc: &BridgeConnection) -> usize {
        self.shared
            .sessions
            .get(&bc.client_id)
            .map(|s| s.read().queued_len())
            .unwrap_or(0)
    }

    fn transmission_control(&self, bc: &Arc<BridgeConnection>) {
        let state = bc.state();
        match state {
            BridgeState::Stopped => {
                let run = match bc.cfg.start_type {
                    StartType::Lazy => self.queued_on_primary(bc) > bc.cfg.threshold,
                    StartType::Automatic => !bc.manually_stopped.load(Ordering::Acquire),
                    StartType::Once => !bc.ever_succeeded.load(Ordering::Acquire),
                    StartType::Manual => false,
                };
                if run {
                    info!("Starting bridge connection {}", bc.cfg.name);
                    bc.set_state(BridgeState::Running);
                }
            }
            BridgeState::Running => {
                if bc.cfg.start_type == StartType::Lazy
                    && bc.is_connected()
                    && bc.primary.last_traffic.lock().elapsed()
                        > Duration::from_secs(bc.cfg.idle_timeout)
                {
                    info!("Bridge connection {} idle; stopping", bc.cfg.name);
                    bc.set_state(BridgeState::Stopping);
                    return;
                }
                // Primary connected on a fallback address while the main
                // address answers again: switch back.
                if bc.is_connected()
                    && bc.primary.cur_address.load(Ordering::Acquire) != 0
                    && bc.backup_ready.swap(false, Ordering::AcqRel)
                {
                    info!(
                        "Bridge connection {} main address available; switching",
                        bc.cfg.name
                    );
                    bc.set_state(BridgeState::Switching);
                    if let Some(handle) = self.shared.connections.get(bc.client_id.as_ref()) {
                        handle.send(Outbound::Close { send_will: false });
                    }
                }
            }
            BridgeState::Switching => {
                if !bc.is_connected() {
                    bc.primary.cur_address.store(0, Ordering::Release);
                    bc.primary
                        .no_local
                        .store(bc.cfg.try_private, Ordering::Release);
                    bc.set_state(BridgeState::Running);
                }
            }
            BridgeState::Stopping | BridgeState::StoppingThenDelete => {
                if bc.is_connected() || bc.backup.connected.load(Ordering::Acquire) {
                    if let Some(handle) = self.shared.connections.get(bc.client_id.as_ref()) {
                        handle.send(Outbound::Close { send_will: false });
                    }
                } else if !bc.primary.connecting.load(Ordering::Acquire)
                    && !bc.backup.connecting.load(Ordering::Acquire)
                {
                    let next = if state == BridgeState::StoppingThenDelete {
                        BridgeState::Delete
                    } else {
                        BridgeState::Stopped
                    };
                    info!("Bridge connection {} stopped", bc.cfg.name);
                    bc.set_state(next);
                }
            }
            BridgeState::Delete => {}
        }
    }

    fn run_connection(&self, bc: &Arc<BridgeConnection>) {
        if bc.state() != BridgeState::Running {
            return;
        }

        let primary = &bc.primary;
        if !primary.connected.load(Ordering::Acquire)
            && !primary.connecting.load(Ordering::Acquire)
        {
            let due = {
                let last = primary.last_attempt.lock();
                match *last {
                    None => true,
                    Some(at) => {
                        // A failed private-protocol trial falls back to the
                        // public protocol immediately on the same address
                        let fallback = bc.cfg.try_private
                            && primary.no_local.load(Ordering::Acquire)
                            && matches!(
                                *primary.last_result.lock(),
                                ConnectResult::NoneReceived | ConnectResult::UnacceptableVersion
                            );
                        if fallback {
                            true
                        } else {
                            at.elapsed() >= Duration::from_secs(bc.reconnect.lock().current)
                        }
                    }
                }
            };
            if due {
                self.prepare_attempt(bc);
                client::spawn_primary(self.shared.clone(), bc.clone());
            }
        }

        // Backup probe of the main address while the primary runs on a
        // fallback address (round_robin disabled).
        if !bc.cfg.round_robin
            && bc.cfg.addresses.len() > 1
            && primary.connected.load(Ordering::Acquire)
            && primary.cur_address.load(Ordering::Acquire) != 0
            && !bc.backup.connecting.load(Ordering::Acquire)
            && !bc.backup_ready.load(Ordering::Acquire)
        {
            client::spawn_backup(bc.clone());
        }
    }

    /// Address rotation and private-protocol bookkeeping for the attempt
    /// about to be spawned.
    fn prepare_attempt(&self, bc: &BridgeConnection) {
        let primary = &bc.primary;
        let mut last = primary.last_attempt.lock();

        let fallback = bc.cfg.try_private
            && primary.no_local.load(Ordering::Acquire)
            && last.is_some()
            && matches!(
                *primary.last_result.lock(),
                ConnectResult::NoneReceived | ConnectResult::UnacceptableVersion
            );

        if fallback {
            // Same address, public protocol
            debug!(
                "Bridge connection {} retrying with public protocol",
                bc.cfg.name
            );
            primary.no_local.store(false, Ordering::Release);
        } else {
            if last.is_some() {
                let next =
                    (primary.cur_address.load(Ordering::Acquire) + 1) % bc.cfg.addresses.len();
                primary.cur_address.store(next, Ordering::Release);
            }
            if bc.cfg.try_private {
                primary.no_local.store(true, Ordering::Release);
            }
        }
        *primary.last_result.lock() = ConnectResult::NoneReceived;
        *last = Some(Instant::now());
    }
}
