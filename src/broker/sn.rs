//! MQTT-SN gateway
//!
//! Dispatches MQTT-SN datagrams for one UDP listener. Clients are mapped to
//! sessions in the shared store; deliveries arrive as MQTT packets through
//! the gateway's shared channel and are translated to MQTT-SN on the way
//! out, registering topic ids as needed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::codec::sn::{decode_datagram, encode_reply};
use crate::protocol::sn::{
    SnEncapsulation, SnFlags, SnPacket, SnReturnCode, SnTopic, TopicIdType,
};
use crate::protocol::{Packet, Publish, QoS, Will};
use crate::session::{ConnectState, InflightMessage, NextExpected, Session, Variant};
use crate::topic::{has_wildcards, validate_topic_filter, validate_topic_name, Priority};

use super::{BrokerState, ClientHandle, Outbound, Shared, SnListenerConfig};

/// Route back to a client: its datagram source address plus the forwarder
/// encapsulation to echo, when the client sits behind a forwarder.
#[derive(Clone)]
struct ReplyPath {
    addr: SocketAddr,
    encapsulation: Option<SnEncapsulation>,
}

/// MQTT-SN gateway bound to one UDP socket
pub struct SnGateway {
    shared: Arc<Shared>,
    cfg: SnListenerConfig,
    socket: UdpSocket,
    /// Datagram source address -> client id
    by_addr: HashMap<SocketAddr, Arc<str>>,
    /// Client id -> reply path
    paths: HashMap<Arc<str>, ReplyPath>,
    rx: mpsc::UnboundedReceiver<(Arc<str>, Outbound)>,
    tx: mpsc::UnboundedSender<(Arc<str>, Outbound)>,
}

impl SnGateway {
    pub async fn bind(shared: Arc<Shared>, cfg: SnListenerConfig) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(cfg.bind).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared,
            cfg,
            socket,
            by_addr: HashMap::new(),
            paths: HashMap::new(),
            rx,
            tx,
        })
    }

    pub async fn run(mut self) {
        // Datagrams above the configured cap are dropped by the size of
        // this buffer.
        let mut buf = vec![0u8; self.shared.config.max_packet_size.min(65535)];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, addr)) => {
                            self.shared.stats.add_received(n);
                            match decode_datagram(&buf[..n]) {
                                Ok(frame) => {
                                    let path = ReplyPath {
                                        addr,
                                        encapsulation: frame.encapsulation.clone(),
                                    };
                                    self.handle_packet(addr, path, frame.packet).await;
                                }
                                Err(e) => {
                                    // A malformed datagram costs the sender its session
                                    debug!("Bad MQTT-SN packet from {}: {}", addr, e);
                                    if let Some(client_id) = self.by_addr.get(&addr).cloned() {
                                        self.drop_client(&client_id, true);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!("UDP read error: {}", e);
                        }
                    }
                }

                Some((client_id, event)) = self.rx.recv() => {
                    self.handle_outbound(client_id, event).await;
                }
            }
        }
    }

    async fn send(&self, path: &ReplyPath, packet: &SnPacket) {
        let mut out = BytesMut::with_capacity(64);
        if encode_reply(path.encapsulation.as_ref(), packet, &mut out).is_ok() {
            if let Err(e) = self.socket.send_to(&out, path.addr).await {
                debug!("UDP send to {} failed: {}", path.addr, e);
            } else {
                self.shared.stats.add_sent(out.len());
            }
        }
    }

    fn session_for(&self, addr: &SocketAddr) -> Option<(Arc<str>, Arc<RwLock<Session>>)> {
        let client_id = self.by_addr.get(addr)?.clone();
        let session = self.shared.sessions.get_connected(&client_id)?;
        Some((client_id, session))
    }

    /// Remove a client from the gateway tables and finalize its session
    fn drop_client(&mut self, client_id: &str, send_will: bool) {
        if let Some(path) = self.paths.remove(client_id) {
            self.by_addr.remove(&path.addr);
        }
        self.shared.finalize_disconnect(client_id, send_will);
    }

    async fn handle_packet(&mut self, addr: SocketAddr, path: ReplyPath, packet: SnPacket) {
        match packet {
            SnPacket::SearchGw { .. } => {
                self.send(
                    &path,
                    &SnPacket::GwInfo {
                        gw_id: self.cfg.gateway_id,
                        gw_addr: Bytes::new(),
                    },
                )
                .await;
            }
            SnPacket::Advertise { .. } | SnPacket::GwInfo { .. } => {
                // Gateway-to-client traffic; nothing for a gateway to do
            }
            SnPacket::Connect {
                flags,
                duration,
                client_id,
            } => {
                self.handle_connect(addr, path, flags, duration, client_id)
                    .await;
            }
            SnPacket::WillTopic { flags, topic } => {
                self.handle_will_topic(addr, path, flags, topic).await;
            }
            SnPacket::WillMsg { message } => {
                self.handle_will_msg(addr, path, message).await;
            }
            SnPacket::Register {
                topic_id: _,
                msg_id,
                topic,
            } => {
                if let Some((_, session)) = self.session_for(&addr) {
                    let id = {
                        let mut s = session.write();
                        s.touch();
                        s.registrations.register(&topic)
                    };
                    self.send(
                        &path,
                        &SnPacket::RegAck {
                            topic_id: id,
                            msg_id,
                            return_code: SnReturnCode::Accepted,
                        },
                    )
                    .await;
                }
            }
            SnPacket::RegAck {
                msg_id,
                return_code,
                ..
            } => {
                if let Some((_, session)) = self.session_for(&addr) {
                    if return_code == SnReturnCode::Accepted {
                        self.shared.complete_registration(&session, msg_id);
                    } else {
                        warn!("REGACK rejected by {}: {:?}", addr, return_code);
                        let mut s = session.write();
                        s.pending_registration = None;
                    }
                }
            }
            SnPacket::Publish {
                flags,
                topic_id,
                msg_id,
                topic_name,
                payload,
            } => {
                self.handle_publish(addr, path, flags, topic_id, msg_id, topic_name, payload)
                    .await;
            }
            SnPacket::PubAck {
                topic_id,
                msg_id,
                return_code,
            } => {
                if let Some((client_id, session)) = self.session_for(&addr) {
                    let removed = {
                        let mut s = session.write();
                        s.touch();
                        if return_code == SnReturnCode::InvalidTopicId {
                            // The client lost the registration; a later
                            // delivery will re-register
                            warn!("{} rejected topic id {}", client_id, topic_id);
                        }
                        matches!(
                            s.inflight_out.get(&msg_id),
                            Some(m) if m.next_expected == NextExpected::PubAck
                        ) && s.inflight_out.remove(&msg_id).is_some()
                    };
                    if removed {
                        self.shared.process_queued(&client_id);
                    } else {
                        warn!("PUBACK for unknown msg id {} from {}", msg_id, client_id);
                    }
                }
            }
            SnPacket::PubRec { msg_id } => {
                if let Some((_, session)) = self.session_for(&addr) {
                    let respond = {
                        let mut s = session.write();
                        s.touch();
                        match s.inflight_out.get_mut(&msg_id) {
                            Some(m) if m.next_expected == NextExpected::PubRec => {
                                m.next_expected = NextExpected::PubComp;
                                m.last_touch = Some(std::time::Instant::now());
                                true
                            }
                            Some(m) if m.next_expected == NextExpected::PubComp => true,
                            _ => {
                                warn!("PUBREC for unknown msg id {} from {}", msg_id, addr);
                                false
                            }
                        }
                    };
                    if respond {
                        self.send(&path, &SnPacket::PubRel { msg_id }).await;
                    }
                }
            }
            SnPacket::PubRel { msg_id } => {
                if let Some((client_id, session)) = self.session_for(&addr) {
                    let stored = {
                        let mut s = session.write();
                        s.touch();
                        s.inflight_in.remove(&msg_id)
                    };
                    if let Some(msg) = stored {
                        self.send(&path, &SnPacket::PubComp { msg_id }).await;
                        self.shared.process_publish(Some(&client_id), msg.publish);
                    } else {
                        warn!("PUBREL for unknown msg id {} from {}", msg_id, client_id);
                    }
                }
            }
            SnPacket::PubComp { msg_id } => {
                if let Some((client_id, session)) = self.session_for(&addr) {
                    let removed = {
                        let mut s = session.write();
                        s.touch();
                        matches!(
                            s.inflight_out.get(&msg_id),
                            Some(m) if m.next_expected == NextExpected::PubComp
                        ) && s.inflight_out.remove(&msg_id).is_some()
                    };
                    if removed {
                        self.shared.process_queued(&client_id);
                    }
                }
            }
            SnPacket::Subscribe {
                flags,
                msg_id,
                topic,
            } => {
                self.handle_subscribe(addr, path, flags, msg_id, topic).await;
            }
            SnPacket::Unsubscribe {
                flags: _,
                msg_id,
                topic,
            } => {
                if let Some((client_id, session)) = self.session_for(&addr) {
                    let filter = {
                        let mut s = session.write();
                        s.touch();
                        resolve_topic(&s, &topic)
                    };
                    if let Some(filter) = filter {
                        self.shared.subscriptions.unsubscribe(&client_id, &filter);
                    }
                    self.send(&path, &SnPacket::UnsubAck { msg_id }).await;
                }
            }
            SnPacket::PingReq { .. } => {
                if let Some((_, session)) = self.session_for(&addr) {
                    let mut s = session.write();
                    s.touch();
                }
                self.send(&path, &SnPacket::PingResp).await;
            }
            SnPacket::PingResp => {
                if let Some((_, session)) = self.session_for(&addr) {
                    let mut s = session.write();
                    s.ping_outstanding = false;
                }
            }
            SnPacket::Disconnect { .. } => {
                if let Some(client_id) = self.by_addr.get(&addr).cloned() {
                    info!("MQTT-SN client {} disconnected", client_id);
                    {
                        if let Some(session) = self.shared.sessions.get_connected(&client_id) {
                            let mut s = session.write();
                            s.good = false;
                        }
                    }
                    self.send(&path, &SnPacket::Disconnect { duration: None })
                        .await;
                    self.drop_client(&client_id, false);
                }
            }
            SnPacket::WillTopicUpd { flags, topic } => {
                if let Some((_, session)) = self.session_for(&addr) {
                    {
                        let mut s = session.write();
                        s.touch();
                        match flags {
                            Some(flags) => {
                                let payload = s
                                    .will
                                    .as_ref()
                                    .map(|w| w.payload.clone())
                                    .unwrap_or_default();
                                s.will = Some(Will {
                                    topic,
                                    payload,
                                    qos: QoS::from_u8(flags.qos).unwrap_or(QoS::AtMostOnce),
                                    retain: flags.retain,
                                });
                            }
                            None => s.will = None,
                        }
                    }
                    self.send(
                        &path,
                        &SnPacket::WillTopicResp {
                            return_code: SnReturnCode::Accepted,
                        },
                    )
                    .await;
                }
            }
            SnPacket::WillMsgUpd { message } => {
                if let Some((_, session)) = self.session_for(&addr) {
                    {
                        let mut s = session.write();
                        s.touch();
                        if let Some(ref mut will) = s.will {
                            will.payload = message;
                        }
                    }
                    self.send(
                        &path,
                        &SnPacket::WillMsgResp {
                            return_code: SnReturnCode::Accepted,
                        },
                    )
                    .await;
                }
            }
            // Gateway-to-client packets arriving inbound are discarded
            _ => {
                trace!("Ignoring unexpected MQTT-SN packet from {}", addr);
            }
        }
    }

    async fn handle_connect(
        &mut self,
        addr: SocketAddr,
        path: ReplyPath,
        flags: SnFlags,
        duration: u16,
        client_id: String,
    ) {
        if self.shared.state() != BrokerState::Running || client_id.is_empty() {
            self.send(
                &path,
                &SnPacket::ConnAck {
                    return_code: SnReturnCode::NotSupported,
                },
            )
            .await;
            return;
        }

        let client_id: Arc<str> = Arc::from(client_id.as_str());
        debug!("MQTT-SN CONNECT from {} (client id {})", addr, client_id);

        let session = if let Some(existing) = self.shared.sessions.get_connected(&client_id) {
            // Reconnect through this gateway drops the old address mapping
            // directly; a session on another listener is told to close.
            let same_gateway = self
                .shared
                .connections
                .get(client_id.as_ref())
                .map(|old| old.same_channel(&self.tx))
                .unwrap_or(false);
            if same_gateway {
                if let Some(old_path) = self.paths.remove(&client_id) {
                    self.by_addr.remove(&old_path.addr);
                }
            } else if let Some(old) = self.shared.connections.get(client_id.as_ref()) {
                info!("Client {} reconnecting; closing old connection", client_id);
                old.send(Outbound::Takeover);
            }
            existing
        } else if let Some(reattached) = self.shared.sessions.reattach(&client_id) {
            reattached
        } else {
            Arc::new(RwLock::new(Session::new(client_id.clone(), Variant::MqttSn)))
        };

        {
            let mut s = session.write();
            if flags.clean_session {
                s.reset();
                self.shared.subscriptions.unsubscribe_all(&client_id, true);
            }
            s.remote_addr = Some(addr);
            s.variant = Variant::MqttSn;
            s.clean_session = flags.clean_session;
            s.keep_alive = duration;
            s.good = true;
            s.closing = false;
            s.will = None;
            s.touch();
            for (id, topic) in &self.cfg.predefined_topics {
                s.registrations.register_predefined(*id, topic);
            }
            s.connect_state = if flags.will {
                ConnectState::AwaitingWillTopic
            } else {
                s.connected = true;
                ConnectState::ConnAckSent
            };
        }

        self.shared
            .sessions
            .insert_connected(client_id.clone(), session.clone());
        let handle = ClientHandle::new(client_id.clone(), self.tx.clone());
        self.shared.connections.insert(client_id.clone(), handle);
        self.by_addr.insert(addr, client_id.clone());
        self.paths.insert(client_id.clone(), path.clone());

        if flags.will {
            // Will handshake: WILLTOPICREQ -> WILLTOPIC -> WILLMSGREQ ->
            // WILLMSG -> CONNACK
            self.send(&path, &SnPacket::WillTopicReq).await;
        } else {
            self.send(
                &path,
                &SnPacket::ConnAck {
                    return_code: SnReturnCode::Accepted,
                },
            )
            .await;
            if !flags.clean_session {
                {
                    let mut s = session.write();
                    s.mark_inflight_for_resend();
                }
                self.shared.retry_sweep_for(&client_id);
                self.shared.process_queued(&client_id);
            }
        }
    }

    async fn handle_will_topic(
        &mut self,
        addr: SocketAddr,
        path: ReplyPath,
        flags: Option<SnFlags>,
        topic: String,
    ) {
        let Some((_, session)) = self.session_for(&addr) else {
            return;
        };
        let proceed = {
            let mut s = session.write();
            if s.connect_state != ConnectState::AwaitingWillTopic {
                warn!("WILLTOPIC out of sequence from {}", addr);
                false
            } else {
                match flags {
                    Some(flags) => {
                        s.will = Some(Will {
                            topic,
                            payload: Bytes::new(),
                            qos: QoS::from_u8(flags.qos).unwrap_or(QoS::AtMostOnce),
                            retain: flags.retain,
                        });
                        s.connect_state = ConnectState::AwaitingWillMsg;
                        true
                    }
                    None => {
                        // Empty WILLTOPIC: no will; complete the handshake
                        s.will = None;
                        s.connected = true;
                        s.connect_state = ConnectState::ConnAckSent;
                        false
                    }
                }
            }
        };
        if proceed {
            self.send(&path, &SnPacket::WillMsgReq).await;
        } else {
            self.send(
                &path,
                &SnPacket::ConnAck {
                    return_code: SnReturnCode::Accepted,
                },
            )
            .await;
        }
    }

    async fn handle_will_msg(&mut self, addr: SocketAddr, path: ReplyPath, message: Bytes) {
        let Some((client_id, session)) = self.session_for(&addr) else {
            return;
        };
        {
            let mut s = session.write();
            if s.connect_state != ConnectState::AwaitingWillMsg {
                warn!("WILLMSG out of sequence from {}", addr);
                return;
            }
            if let Some(ref mut will) = s.will {
                will.payload = message;
            }
            s.connected = true;
            s.connect_state = ConnectState::ConnAckSent;
        }
        self.send(
            &path,
            &SnPacket::ConnAck {
                return_code: SnReturnCode::Accepted,
            },
        )
        .await;
        let clean_session = session.read().clean_session;
        if !clean_session {
            {
                let mut s = session.write();
                s.mark_inflight_for_resend();
            }
            self.shared.retry_sweep_for(&client_id);
            self.shared.process_queued(&client_id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_publish(
        &mut self,
        addr: SocketAddr,
        path: ReplyPath,
        flags: SnFlags,
        topic_id: u16,
        msg_id: u16,
        topic_name: Option<String>,
        payload: Bytes,
    ) {
        // QoS 3 is a connectionless one-shot publish from an anonymous
        // sender; it is routed at QoS 0 with no session and no ack.
        if flags.qos == 3 {
            let topic = match flags.topic_id_type {
                // NORMAL type carries the topic name inside the frame
                TopicIdType::Normal => topic_name,
                TopicIdType::Short => short_topic_name(topic_id),
                TopicIdType::Predefined => self
                    .cfg
                    .predefined_topics
                    .iter()
                    .find(|(id, _)| *id == topic_id)
                    .map(|(_, t)| t.clone()),
            };
            if let Some(topic) = topic.filter(|t| validate_topic_name(t).is_ok()) {
                self.shared.stats.add_publish_received();
                self.shared.process_publish(
                    None,
                    Publish {
                        dup: false,
                        qos: QoS::AtMostOnce,
                        retain: flags.retain,
                        topic: Arc::from(topic.as_str()),
                        msg_id: None,
                        payload,
                    },
                );
            }
            return;
        }

        let Some((client_id, session)) = self.session_for(&addr) else {
            return;
        };

        let qos = match QoS::from_u8(flags.qos) {
            Some(q) => q,
            None => return,
        };

        let topic = {
            let mut s = session.write();
            s.touch();
            match flags.topic_id_type {
                TopicIdType::Normal | TopicIdType::Predefined => {
                    s.registrations.name_of(topic_id).map(|t| t.to_string())
                }
                TopicIdType::Short => short_topic_name(topic_id),
            }
        };

        let Some(topic) = topic else {
            // Unknown topic id: refuse so the client re-registers
            self.send(
                &path,
                &SnPacket::PubAck {
                    topic_id,
                    msg_id,
                    return_code: SnReturnCode::InvalidTopicId,
                },
            )
            .await;
            return;
        };

        if validate_topic_name(&topic).is_err() {
            warn!("Invalid topic in MQTT-SN PUBLISH from {}", client_id);
            self.drop_client(&client_id, true);
            return;
        }

        self.shared.stats.add_publish_received();
        let allowed = self
            .shared
            .hooks
            .on_publish_check(&client_id, None, &topic)
            .await
            .unwrap_or(false);
        if !allowed {
            info!("PUBLISH denied for {} to {}", client_id, topic);
            return;
        }

        let publish = Publish {
            dup: flags.dup,
            qos,
            retain: flags.retain,
            topic: Arc::from(topic.as_str()),
            msg_id: if qos == QoS::AtMostOnce {
                None
            } else {
                Some(msg_id)
            },
            payload,
        };

        match qos {
            QoS::AtMostOnce => {
                self.shared.process_publish(Some(&client_id), publish);
            }
            QoS::AtLeastOnce => {
                self.shared.process_publish(Some(&client_id), publish);
                self.send(
                    &path,
                    &SnPacket::PubAck {
                        topic_id,
                        msg_id,
                        return_code: SnReturnCode::Accepted,
                    },
                )
                .await;
            }
            QoS::ExactlyOnce => {
                {
                    let mut s = session.write();
                    s.inflight_in.insert(
                        msg_id,
                        InflightMessage {
                            msg_id,
                            qos,
                            retain: flags.retain,
                            publish,
                            next_expected: NextExpected::PubRel,
                            last_touch: Some(std::time::Instant::now()),
                        },
                    );
                }
                self.send(&path, &SnPacket::PubRec { msg_id }).await;
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        addr: SocketAddr,
        path: ReplyPath,
        flags: SnFlags,
        msg_id: u16,
        topic: SnTopic,
    ) {
        let Some((client_id, session)) = self.session_for(&addr) else {
            return;
        };
        let qos = QoS::from_u8(flags.qos.min(2)).unwrap_or(QoS::AtMostOnce);

        let filter = {
            let mut s = session.write();
            s.touch();
            match &topic {
                SnTopic::Name(name) => Some(name.clone()),
                SnTopic::Predefined(id) => s.registrations.name_of(*id).map(|t| t.to_string()),
                SnTopic::Short(chars) => std::str::from_utf8(chars).ok().map(str::to_string),
            }
        };

        let Some(filter) = filter.filter(|f| validate_topic_filter(f).is_ok()) else {
            self.send(
                &path,
                &SnPacket::SubAck {
                    flags: SnFlags::default(),
                    topic_id: 0,
                    msg_id,
                    return_code: SnReturnCode::InvalidTopicId,
                },
            )
            .await;
            return;
        };

        let allowed = self
            .shared
            .hooks
            .on_subscribe_check(&client_id, None, &filter)
            .await
            .unwrap_or(false);
        if !allowed {
            info!("SUBSCRIBE denied for {} to {}", client_id, filter);
            self.send(
                &path,
                &SnPacket::SubAck {
                    flags: SnFlags::default(),
                    topic_id: 0,
                    msg_id,
                    return_code: SnReturnCode::NotSupported,
                },
            )
            .await;
            return;
        }

        let clean_session = {
            let s = session.read();
            s.clean_session
        };
        let isnew = self.shared.subscriptions.subscribe(
            &client_id,
            &filter,
            qos,
            false,
            !clean_session,
            Priority::Normal,
        );

        // A concrete NORMAL-type filter gets a topic id the client can
        // publish with straight away
        let topic_id = if matches!(topic, SnTopic::Name(_)) && !has_wildcards(&filter) {
            let mut s = session.write();
            s.registrations.register(&filter)
        } else if let SnTopic::Predefined(id) = topic {
            id
        } else {
            0
        };

        let granted = SnFlags {
            qos: qos as u8,
            ..Default::default()
        };
        self.send(
            &path,
            &SnPacket::SubAck {
                flags: granted,
                topic_id,
                msg_id,
                return_code: SnReturnCode::Accepted,
            },
        )
        .await;

        let _ = isnew;
        self.shared
            .replay_retained(&session, &filter, qos, Priority::Normal);
    }

    /// Translate an outbound event into MQTT-SN datagrams
    async fn handle_outbound(&mut self, client_id: Arc<str>, event: Outbound) {
        let path = match self.paths.get(&client_id).cloned() {
            Some(path) => path,
            None => {
                // Mapping already gone; only lifecycle events still matter
                match event {
                    Outbound::ProcessQueued => self.shared.process_queued(&client_id),
                    Outbound::Close { send_will } => {
                        self.shared.finalize_disconnect(&client_id, send_will)
                    }
                    _ => {}
                }
                return;
            }
        };

        match event {
            Outbound::Packet(Packet::Publish(publish)) => {
                let Some(session) = self.shared.sessions.get_connected(&client_id) else {
                    return;
                };
                let (topic_id, id_type) = {
                    let s = session.read();
                    resolve_topic_id(&s, &publish.topic)
                };
                let Some(topic_id) = topic_id else {
                    // Delivery raced a lost registration; the retry sweep
                    // re-issues the REGISTER
                    debug!("No topic id for {} on {}", publish.topic, client_id);
                    return;
                };
                let flags = SnFlags {
                    dup: publish.dup,
                    qos: publish.qos as u8,
                    retain: publish.retain,
                    will: false,
                    clean_session: false,
                    topic_id_type: id_type,
                };
                self.shared.stats.add_publish_sent();
                self.send(
                    &path,
                    &SnPacket::Publish {
                        flags,
                        topic_id,
                        msg_id: publish.msg_id.unwrap_or(0),
                        topic_name: None,
                        payload: publish.payload.clone(),
                    },
                )
                .await;
            }
            Outbound::Packet(Packet::PubRel(pubrel)) => {
                self.send(&path, &SnPacket::PubRel { msg_id: pubrel.msg_id })
                    .await;
            }
            Outbound::Packet(Packet::PingReq) => {
                self.send(&path, &SnPacket::PingReq { client_id: None }).await;
            }
            Outbound::Packet(_) => {}
            Outbound::Register {
                topic_id,
                msg_id,
                topic,
            } => {
                self.send(
                    &path,
                    &SnPacket::Register {
                        topic_id,
                        msg_id,
                        topic: topic.to_string(),
                    },
                )
                .await;
            }
            Outbound::ProcessQueued => {
                self.shared.process_queued(&client_id);
            }
            Outbound::Takeover => {
                if let Some(path) = self.paths.remove(&client_id) {
                    self.by_addr.remove(&path.addr);
                }
            }
            Outbound::Close { send_will } => {
                self.send(&path, &SnPacket::Disconnect { duration: None })
                    .await;
                self.drop_client(&client_id, send_will);
            }
        }
    }
}

/// Interpret a topic id field as a two-character short topic name
fn short_topic_name(topic_id: u16) -> Option<String> {
    let bytes = topic_id.to_be_bytes();
    std::str::from_utf8(&bytes).ok().map(str::to_string)
}

/// Resolve a concrete topic to the id/type pair for an outbound publish
fn resolve_topic_id(s: &Session, topic: &str) -> (Option<u16>, TopicIdType) {
    if topic.len() == 2 {
        let bytes = topic.as_bytes();
        return (
            Some(u16::from_be_bytes([bytes[0], bytes[1]])),
            TopicIdType::Short,
        );
    }
    (s.registrations.id_of(topic), TopicIdType::Normal)
}

/// Resolve a SUBSCRIBE/UNSUBSCRIBE topic reference to a filter string
fn resolve_topic(s: &Session, topic: &SnTopic) -> Option<String> {
    match topic {
        SnTopic::Name(name) => Some(name.clone()),
        SnTopic::Predefined(id) => s.registrations.name_of(*id).map(|t| t.to_string()),
        SnTopic::Short(chars) => std::str::from_utf8(chars).ok().map(str::to_string),
    }
}
