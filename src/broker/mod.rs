//! Broker core
//!
//! Owns the listeners, the session store, the subscription engine and the
//! housekeeping tick, and coordinates the MQTT and MQTT-SN front ends.
//!
//! The broker is cooperatively single-threaded: it is driven by a
//! current-thread runtime, so every handler interleaves on one thread and
//! the only suspension points are awaits against the readiness reactor.

mod connection;
mod delivery;
mod sn;
mod sys_topics;

pub use connection::Connection;
pub use sn::SnGateway;
pub use sys_topics::Stats;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeManager;
use crate::hooks::Hooks;
use crate::persistence::PersistenceManager;
use crate::protocol::{Packet, Publish};
use crate::session::SessionStore;
use crate::topic::SubscriptionEngine;

/// Seconds a freshly accepted socket may sit idle before sending CONNECT
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Housekeeping cadence: keepalive, retries, stats, bridge sweep, autosave
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// Broker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BrokerState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

/// A TCP listener definition
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address
    pub bind: SocketAddr,
    /// Prefix transparently prepended to all topics from clients on this
    /// listener
    pub mount_point: Option<Arc<str>>,
    /// Per-listener connection cap (0 = unlimited)
    pub max_connections: usize,
}

/// A UDP (MQTT-SN) listener definition
#[derive(Debug, Clone)]
pub struct SnListenerConfig {
    /// Bind address
    pub bind: SocketAddr,
    /// Gateway id announced in ADVERTISE/GWINFO
    pub gateway_id: u8,
    /// Pre-defined topic ids available to every client on this listener
    pub predefined_topics: Vec<(u16, String)>,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// MQTT/TCP listeners
    pub listeners: Vec<ListenerConfig>,
    /// MQTT-SN/UDP listeners
    pub sn_listeners: Vec<SnListenerConfig>,
    /// Maximum accepted packet size
    pub max_packet_size: usize,
    /// Per-client cap on concurrent QoS>=1 outbound exchanges
    pub max_inflight_messages: usize,
    /// Per-client cap on queued messages awaiting the inflight window
    pub max_queued_messages: usize,
    /// Retransmission interval for unacknowledged QoS>=1 messages
    pub retry_interval: Duration,
    /// Client id prefixes accepted on connect (empty = all)
    pub clientid_prefixes: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig {
                bind: "0.0.0.0:1883".parse().unwrap(),
                mount_point: None,
                max_connections: 0,
            }],
            sn_listeners: Vec::new(),
            max_packet_size: 1024 * 1024,
            max_inflight_messages: 20,
            max_queued_messages: 1000,
            retry_interval: Duration::from_secs(20),
            clientid_prefixes: Vec::new(),
        }
    }
}

/// Events delivered to a client's connection task
#[derive(Debug)]
pub enum Outbound {
    /// Write a packet to the client (translated for MQTT-SN links)
    Packet(Packet),
    /// MQTT-SN only: issue a REGISTER for a topic about to be published
    Register {
        topic_id: u16,
        msg_id: u16,
        topic: Arc<str>,
    },
    /// Inflight capacity freed; move queued messages into flight
    ProcessQueued,
    /// Another CONNECT took over this client id; close without will
    Takeover,
    /// Close the session
    Close { send_will: bool },
}

/// Handle through which the router reaches a connected client's task.
///
/// MQTT connections each own a channel; the MQTT-SN gateway shares one
/// channel for all its clients, keyed by the client id in the event.
#[derive(Clone)]
pub struct ClientHandle {
    client_id: Arc<str>,
    tx: mpsc::UnboundedSender<(Arc<str>, Outbound)>,
}

impl ClientHandle {
    pub fn new(client_id: Arc<str>, tx: mpsc::UnboundedSender<(Arc<str>, Outbound)>) -> Self {
        Self { client_id, tx }
    }

    pub fn send(&self, event: Outbound) -> bool {
        self.tx.send((self.client_id.clone(), event)).is_ok()
    }

    /// True when this handle feeds the given channel (used to tell a
    /// same-gateway takeover apart from a cross-listener one)
    pub fn same_channel(&self, tx: &mpsc::UnboundedSender<(Arc<str>, Outbound)>) -> bool {
        self.tx.same_channel(tx)
    }
}

/// State shared by every handler: the single `Broker` value of the design.
pub struct Shared {
    pub config: BrokerConfig,
    pub sessions: SessionStore,
    pub subscriptions: SubscriptionEngine,
    pub connections: DashMap<Arc<str>, ClientHandle>,
    pub hooks: Arc<dyn Hooks>,
    pub stats: Stats,
    state: AtomicU8,
    /// Set by SIGHUP; consumed at the next housekeeping boundary
    save_requested: AtomicBool,
    pub start_time: Instant,
}

impl Shared {
    pub fn state(&self) -> BrokerState {
        match self.state.load(Ordering::Acquire) {
            0 => BrokerState::Running,
            1 => BrokerState::Stopping,
            _ => BrokerState::Stopped,
        }
    }

    pub fn set_state(&self, state: BrokerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Request a persistence save at the next housekeeping tick
    pub fn request_save(&self) {
        self.save_requested.store(true, Ordering::Release);
    }

    fn take_save_request(&self) -> bool {
        self.save_requested.swap(false, Ordering::AcqRel)
    }

    /// Publish originating inside the broker ($SYS stats, bridge state
    /// notifications): retained side effect plus fan-out.
    pub fn broker_publish(&self, publish: Publish) {
        self.process_publish(None, publish);
    }
}

/// The broker
pub struct Broker {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    bridges: Option<Arc<BridgeManager>>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                config,
                sessions: SessionStore::new(),
                subscriptions: SubscriptionEngine::new(),
                connections: DashMap::new(),
                hooks,
                stats: Stats::default(),
                state: AtomicU8::new(BrokerState::Running as u8),
                save_requested: AtomicBool::new(false),
                start_time: Instant::now(),
            }),
            shutdown,
            bridges: None,
            persistence: None,
        }
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn set_bridge_manager(&mut self, bridges: Arc<BridgeManager>) {
        self.bridges = Some(bridges);
    }

    pub fn set_persistence(&mut self, persistence: Arc<PersistenceManager>) {
        self.persistence = Some(persistence);
    }

    /// Request a graceful stop
    pub fn shutdown(&self) {
        self.shared.set_state(BrokerState::Stopping);
        let _ = self.shutdown.send(());
    }

    /// Run the broker until every session has quiesced after a stop request
    pub async fn run(&self) -> Result<(), std::io::Error> {
        // Subscribe before anything can request a stop
        let mut stop_rx = self.shutdown.subscribe();

        for listener_cfg in &self.shared.config.listeners {
            let listener = bind_tcp(listener_cfg.bind)?;
            info!("MQTT/TCP listening on {}", listener_cfg.bind);
            self.spawn_accept_loop(listener, listener_cfg.clone());
        }

        for sn_cfg in &self.shared.config.sn_listeners {
            let gateway = SnGateway::bind(self.shared.clone(), sn_cfg.clone()).await?;
            info!("MQTT-SN/UDP listening on {}", sn_cfg.bind);
            let mut shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = gateway.run() => {}
                    _ = shutdown_rx.recv() => {}
                }
            });
        }

        if let Some(ref bridges) = self.bridges {
            bridges.start();
        }

        sys_topics::publish_static(&self.shared);

        // Housekeeping runs on the 5-second boundary
        let shared = self.shared.clone();
        let bridges = self.bridges.clone();
        let persistence = self.persistence.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let (quiesced_tx, mut quiesced_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        shared.keepalive_sweep();
                        shared.retry_sweep();
                        sys_topics::publish_stats(&shared);
                        if let Some(ref bridges) = bridges {
                            bridges.timeslice();
                        }
                        if let Some(ref persistence) = persistence {
                            let forced = shared.take_save_request();
                            if forced || persistence.autosave_due(shared.subscriptions.is_dirty()) {
                                match persistence.save(&shared.subscriptions) {
                                    Ok(()) => shared.subscriptions.clear_dirty(),
                                    Err(e) => warn!("Persistence save failed: {}", e),
                                }
                            }
                        }
                        if shared.state() == BrokerState::Stopping {
                            shared.sweep_quiescent();
                            if shared.sessions.connected_count() == 0 {
                                shared.set_state(BrokerState::Stopped);
                                let _ = quiesced_tx.send(()).await;
                                break;
                            }
                        }
                    }
                    result = shutdown_rx.recv() => {
                        if matches!(result, Err(broadcast::error::RecvError::Lagged(_))) {
                            continue;
                        }
                        // Keep ticking so sessions can quiesce; a closed
                        // channel means the broker value is gone
                        if matches!(result, Err(broadcast::error::RecvError::Closed)) {
                            break;
                        }
                    }
                }
            }
        });

        // Wait for the stop request, then for quiescence
        if self.shared.state() == BrokerState::Running {
            let _ = stop_rx.recv().await;
        }
        info!("Broker stopping; waiting for sessions to quiesce");

        if let Some(ref bridges) = self.bridges {
            bridges.stop();
        }

        // Sessions with no inflight work close immediately; the rest drain
        // on the housekeeping boundary.
        self.shared.sweep_quiescent();
        if self.shared.sessions.connected_count() > 0 {
            let _ = quiesced_rx.recv().await;
        } else {
            self.shared.set_state(BrokerState::Stopped);
        }

        if let Some(ref persistence) = self.persistence {
            if let Err(e) = persistence.save(&self.shared.subscriptions) {
                warn!("Final persistence save failed: {}", e);
            } else {
                self.shared.subscriptions.clear_dirty();
            }
        }

        info!("Broker stopped");
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: TcpListener, listener_cfg: ListenerConfig) {
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let connection_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                if shared.state() != BrokerState::Running {
                                    continue;
                                }
                                debug!("New TCP connection from {}", addr);
                                spawn_connection(
                                    shared.clone(),
                                    stream,
                                    addr,
                                    listener_cfg.clone(),
                                    connection_count.clone(),
                                );
                            }
                            Err(e) => {
                                error!("Failed to accept TCP connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

fn spawn_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    listener_cfg: ListenerConfig,
    connection_count: Arc<std::sync::atomic::AtomicUsize>,
) {
    connection_count.fetch_add(1, Ordering::AcqRel);
    let count = connection_count.clone();
    tokio::spawn(async move {
        let mut conn = Connection::new(shared, stream, addr, listener_cfg, count.clone());
        // Sockets that never send CONNECT are timed out
        match tokio::time::timeout(CONNECT_TIMEOUT, conn.read_connect()).await {
            Ok(Ok(true)) => {
                if let Err(e) = conn.run().await {
                    debug!("Connection {} ended: {}", addr, e);
                }
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => debug!("Connect from {} failed: {}", addr, e),
            Err(_) => debug!("Connect timeout from {}", addr),
        }
        count.fetch_sub(1, Ordering::AcqRel);
    });
}

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, std::io::Error> {
    // Bound through socket2 so listener options (reuse-addr, ipv6-only)
    // are set before the listen call.
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}
