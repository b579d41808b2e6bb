//! MQTT connection handler
//!
//! Drives one TCP client: the connect handshake (takeover, reattach,
//! clean-session reset), subscribe/unsubscribe with mount-point
//! transformation and retained replay, publish QoS 0/1/2 in both
//! directions, ping and disconnect.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    protocol_supported, ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe, Will,
    PRIVATE_PROTOCOL_VERSION, PROTOCOL_VERSION_V3,
};
use crate::session::{ConnectState, InflightMessage, NextExpected, Session, Variant};
use crate::topic::{validate_topic_filter, validate_topic_name, Priority};

use super::{BrokerState, ClientHandle, ListenerConfig, Outbound, Shared};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<crate::protocol::DecodeError> for ConnectionError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

/// What a packet handler tells the read loop to do next
enum Dispatch {
    Complete,
    /// Clean DISCONNECT received; session already finalized
    Closed,
}

/// Connection handler for one MQTT/TCP client
pub struct Connection {
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    listener: ListenerConfig,
    /// Live connection count on this listener (this connection included)
    listener_connections: Arc<std::sync::atomic::AtomicUsize>,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    session: Option<Arc<RwLock<Session>>>,
    client_id: Option<Arc<str>>,
    rx: mpsc::UnboundedReceiver<(Arc<str>, Outbound)>,
    tx: mpsc::UnboundedSender<(Arc<str>, Outbound)>,
}

impl Connection {
    pub fn new(
        shared: Arc<Shared>,
        stream: TcpStream,
        addr: SocketAddr,
        listener: ListenerConfig,
        listener_connections: Arc<std::sync::atomic::AtomicUsize>,
    ) -> Self {
        let max_packet_size = shared.config.max_packet_size;
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared,
            stream,
            addr,
            listener,
            listener_connections,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            session: None,
            client_id: None,
            rx,
            tx,
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        self.shared.stats.add_sent(self.write_buf.len());
        if matches!(packet, Packet::Publish(_)) {
            self.shared.stats.add_publish_sent();
        }
        Ok(())
    }

    /// Read and process the CONNECT packet. Returns true when the session
    /// was accepted and the main loop should run.
    pub async fn read_connect(&mut self) -> Result<bool, ConnectionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                self.shared.stats.add_received(consumed);

                return match packet {
                    Packet::Connect(connect) => self.handle_connect(*connect).await,
                    _ => {
                        debug!("First packet from {} was not CONNECT", self.addr);
                        Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                            "first packet must be CONNECT",
                        )))
                    }
                };
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// Connect handshake
    async fn handle_connect(&mut self, connect: Connect) -> Result<bool, ConnectionError> {
        if self.shared.state() != BrokerState::Running
            || !protocol_supported(&connect.protocol_name, connect.protocol_version)
        {
            self.write_packet(&Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::UnacceptableProtocolVersion,
            )))
            .await?;
            return Ok(false);
        }

        if connect.client_id.is_empty()
            || (connect.protocol_version == PROTOCOL_VERSION_V3 && connect.client_id.len() > 23)
        {
            self.write_packet(&Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::IdentifierRejected,
            )))
            .await?;
            return Ok(false);
        }

        let client_id: Arc<str> = Arc::from(connect.client_id.as_str());
        debug!("CONNECT from {} (client id {})", self.addr, client_id);

        let authenticated = self
            .shared
            .hooks
            .on_authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;
        match authenticated {
            Ok(true) => {}
            Ok(false) => {
                info!("Authentication failed for {}", client_id);
                self.write_packet(&Packet::ConnAck(ConnAck::new(
                    ConnectReturnCode::BadUsernameOrPassword,
                )))
                .await?;
                return Ok(false);
            }
            Err(_) => {
                self.write_packet(&Packet::ConnAck(ConnAck::new(
                    ConnectReturnCode::BrokerUnavailable,
                )))
                .await?;
                return Ok(false);
            }
        }

        // Listener connection limit
        if self.listener.max_connections > 0
            && self
                .listener_connections
                .load(std::sync::atomic::Ordering::Acquire)
                > self.listener.max_connections
        {
            info!("Listener {} is full; refusing {}", self.listener.bind, client_id);
            self.write_packet(&Packet::ConnAck(ConnAck::new(
                ConnectReturnCode::BrokerUnavailable,
            )))
            .await?;
            return Ok(false);
        }

        // Client id prefix filtering closes the socket without a CONNACK
        if !self.shared.config.clientid_prefixes.is_empty()
            && !self
                .shared
                .config
                .clientid_prefixes
                .iter()
                .any(|p| client_id.starts_with(p.as_str()))
        {
            info!("Client id {} does not match any allowed prefix", client_id);
            return Ok(false);
        }

        // Takeover: an existing connected session with the same id has its
        // socket closed; the session record is reused with the new link.
        let session = if let Some(existing) = self.shared.sessions.get_connected(&client_id) {
            if let Some(old) = self.shared.connections.get(client_id.as_ref()) {
                info!("Client {} reconnecting; closing old connection", client_id);
                old.send(Outbound::Takeover);
            }
            existing
        } else if let Some(reattached) = self.shared.sessions.reattach(&client_id) {
            reattached
        } else {
            Arc::new(RwLock::new(Session::new(client_id.clone(), Variant::Mqtt)))
        };

        {
            let mut s = session.write();
            if connect.clean_session {
                s.reset();
                self.shared.subscriptions.unsubscribe_all(&client_id, true);
            }

            s.remote_addr = Some(self.addr);
            s.username = connect.username.clone();
            s.variant = Variant::Mqtt;
            s.mount_point = self.listener.mount_point.clone();
            s.connected = true;
            s.good = true;
            s.closing = false;
            s.clean_session = connect.clean_session;
            s.no_local = connect.protocol_version == PRIVATE_PROTOCOL_VERSION;
            s.keep_alive = connect.keep_alive;
            s.connect_state = ConnectState::ConnAckSent;
            s.touch();

            // Install the will from this CONNECT, clearing any prior one
            s.will = connect.will.map(|w| Will {
                topic: self.mount_topic(&w.topic),
                payload: w.payload,
                qos: w.qos,
                retain: w.retain,
            });
        }

        self.shared
            .sessions
            .insert_connected(client_id.clone(), session.clone());
        let handle = ClientHandle::new(client_id.clone(), self.tx.clone());
        self.shared.connections.insert(client_id.clone(), handle);

        self.write_packet(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
            .await?;

        self.session = Some(session.clone());
        self.client_id = Some(client_id.clone());

        // A persistent reattach resends inflight messages immediately and
        // drains the queue subject to the inflight window.
        if !connect.clean_session {
            {
                let mut s = session.write();
                s.mark_inflight_for_resend();
            }
            self.shared.retry_sweep_for(&client_id);
            self.shared.process_queued(&client_id);
        }

        Ok(true)
    }

    /// Prefix the listener's mount point, if any
    fn mount_topic(&self, topic: &str) -> String {
        match &self.listener.mount_point {
            Some(prefix) => format!("{}{}", prefix, topic),
            None => topic.to_string(),
        }
    }

    /// Main connected loop
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let client_id = self.client_id.clone().expect("connect must complete first");
        let session = self.session.clone().expect("connect must complete first");

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed by {}", self.addr);
                            self.shared.finalize_disconnect(&client_id, true);
                            return Ok(());
                        }
                        Ok(n) => {
                            self.shared.stats.add_received(n);
                            {
                                let mut s = session.write();
                                s.touch();
                            }
                            loop {
                                let decoded = match self.decoder.decode(&self.read_buf) {
                                    Ok(d) => d,
                                    Err(e) => {
                                        // Parse errors terminate the session
                                        warn!("Bad packet from {}: {}", client_id, e);
                                        self.shared.finalize_disconnect(&client_id, true);
                                        return Err(e.into());
                                    }
                                };
                                let Some((packet, consumed)) = decoded else { break };
                                self.read_buf.advance(consumed);

                                match self.handle_packet(&client_id, &session, packet).await {
                                    Ok(Dispatch::Complete) => {}
                                    Ok(Dispatch::Closed) => return Ok(()),
                                    Err(e) => {
                                        self.shared.finalize_disconnect(&client_id, true);
                                        return Err(e);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!("Read error from {}: {}", self.addr, e);
                            self.shared.finalize_disconnect(&client_id, true);
                            return Err(e.into());
                        }
                    }
                }

                Some((_, event)) = self.rx.recv() => {
                    match event {
                        Outbound::Packet(packet) => {
                            self.write_packet(&packet).await?;
                        }
                        Outbound::Register { .. } => {
                            // Only meaningful for MQTT-SN links
                            debug!("Ignoring REGISTER event on MQTT link {}", client_id);
                        }
                        Outbound::ProcessQueued => {
                            self.shared.process_queued(&client_id);
                        }
                        Outbound::Takeover => {
                            // The new connection owns the session; just
                            // drop the socket.
                            return Ok(());
                        }
                        Outbound::Close { send_will } => {
                            self.shared.finalize_disconnect(&client_id, send_will);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one inbound packet
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<Dispatch, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(
                ProtocolError::ProtocolViolation("duplicate CONNECT"),
            )),
            Packet::Publish(publish) => {
                self.handle_publish(client_id, session, publish).await?;
                Ok(Dispatch::Complete)
            }
            Packet::PubAck(puback) => {
                self.handle_puback(client_id, session, puback);
                Ok(Dispatch::Complete)
            }
            Packet::PubRec(pubrec) => {
                self.handle_pubrec(client_id, session, pubrec).await?;
                Ok(Dispatch::Complete)
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(client_id, session, pubrel).await?;
                Ok(Dispatch::Complete)
            }
            Packet::PubComp(pubcomp) => {
                self.handle_pubcomp(client_id, session, pubcomp);
                Ok(Dispatch::Complete)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await?;
                Ok(Dispatch::Complete)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, unsubscribe).await?;
                Ok(Dispatch::Complete)
            }
            Packet::PingReq => {
                self.write_packet(&Packet::PingResp).await?;
                Ok(Dispatch::Complete)
            }
            Packet::PingResp => {
                let mut s = session.write();
                s.ping_outstanding = false;
                Ok(Dispatch::Complete)
            }
            Packet::Disconnect => {
                info!("Client {} disconnected cleanly", client_id);
                {
                    let mut s = session.write();
                    s.good = false;
                }
                // A clean disconnect never publishes the will
                self.shared.finalize_disconnect(client_id, false);
                Ok(Dispatch::Closed)
            }
            _ => {
                warn!(
                    "Unexpected packet type {} from {}",
                    packet.packet_type(),
                    client_id
                );
                Ok(Dispatch::Complete)
            }
        }
    }

    async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        // Mount point applies before anything else sees the topic
        if self.listener.mount_point.is_some() {
            publish.topic = Arc::from(self.mount_topic(&publish.topic).as_str());
        }

        if validate_topic_name(&publish.topic).is_err() {
            warn!("Invalid topic in PUBLISH from {}", client_id);
            return Err(ConnectionError::Protocol(
                ProtocolError::ProtocolViolation("wildcard or empty topic in PUBLISH"),
            ));
        }

        trace!(
            "PUBLISH from {} to {} (qos {:?})",
            client_id,
            publish.topic,
            publish.qos
        );
        self.shared.stats.add_publish_received();

        let username = {
            let s = session.read();
            s.username.clone()
        };
        let allowed = self
            .shared
            .hooks
            .on_publish_check(client_id, username.as_deref(), &publish.topic)
            .await
            .unwrap_or(false);
        if !allowed {
            // Authorization failures drop the publish but keep the session
            info!("PUBLISH denied for {} to {}", client_id, publish.topic);
            match publish.qos {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => {
                    let msg_id = publish.msg_id.unwrap_or(0);
                    self.write_packet(&Packet::PubAck(PubAck { msg_id })).await?;
                }
                QoS::ExactlyOnce => {
                    let msg_id = publish.msg_id.unwrap_or(0);
                    self.write_packet(&Packet::PubRec(PubRec { msg_id })).await?;
                }
            }
            return Ok(());
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.shared.process_publish(Some(client_id), publish);
            }
            QoS::AtLeastOnce => {
                let msg_id = publish.msg_id.unwrap_or(0);
                self.shared.process_publish(Some(client_id), publish);
                self.write_packet(&Packet::PubAck(PubAck { msg_id })).await?;
            }
            QoS::ExactlyOnce => {
                let msg_id = publish.msg_id.unwrap_or(0);
                {
                    let mut s = session.write();
                    // A duplicate PUBLISH replaces the stored publication
                    // but keeps the inflight entry
                    s.inflight_in.insert(
                        msg_id,
                        InflightMessage {
                            msg_id,
                            qos: publish.qos,
                            retain: publish.retain,
                            publish,
                            next_expected: NextExpected::PubRel,
                            last_touch: Some(std::time::Instant::now()),
                        },
                    );
                }
                self.write_packet(&Packet::PubRec(PubRec { msg_id })).await?;
            }
        }

        Ok(())
    }

    fn handle_puback(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        puback: PubAck,
    ) {
        let removed = {
            let mut s = session.write();
            match s.inflight_out.get(&puback.msg_id).map(|m| m.next_expected) {
                Some(NextExpected::PubAck) => {
                    s.inflight_out.remove(&puback.msg_id);
                    true
                }
                Some(_) => {
                    warn!("PUBACK for {} in wrong state from {}", puback.msg_id, client_id);
                    false
                }
                None => {
                    warn!("PUBACK for unknown msg id {} from {}", puback.msg_id, client_id);
                    false
                }
            }
        };
        if removed {
            self.shared.process_queued(client_id);
        }
    }

    async fn handle_pubrec(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        let respond = {
            let mut s = session.write();
            match s.inflight_out.get_mut(&pubrec.msg_id) {
                Some(msg) if msg.next_expected == NextExpected::PubRec => {
                    msg.next_expected = NextExpected::PubComp;
                    msg.last_touch = Some(std::time::Instant::now());
                    true
                }
                // A retransmitted PUBREC in the PUBCOMP state is answered
                // again without complaint
                Some(msg) if msg.next_expected == NextExpected::PubComp => true,
                Some(_) => {
                    warn!("PUBREC for {} in wrong state from {}", pubrec.msg_id, client_id);
                    false
                }
                None => {
                    warn!("PUBREC for unknown msg id {} from {}", pubrec.msg_id, client_id);
                    false
                }
            }
        };
        if respond {
            self.write_packet(&Packet::PubRel(PubRel {
                msg_id: pubrec.msg_id,
                dup: false,
            }))
            .await?;
        }
        Ok(())
    }

    async fn handle_pubrel(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        let stored = {
            let mut s = session.write();
            s.inflight_in.remove(&pubrel.msg_id)
        };

        match stored {
            Some(msg) => {
                self.write_packet(&Packet::PubComp(PubComp {
                    msg_id: pubrel.msg_id,
                }))
                .await?;
                // Exactly-once delivery completes here
                self.shared.process_publish(Some(client_id), msg.publish);
            }
            None => {
                warn!("PUBREL for unknown msg id {} from {}", pubrel.msg_id, client_id);
            }
        }
        Ok(())
    }

    fn handle_pubcomp(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubcomp: PubComp,
    ) {
        let removed = {
            let mut s = session.write();
            match s.inflight_out.get(&pubcomp.msg_id).map(|m| m.next_expected) {
                Some(NextExpected::PubComp) => {
                    s.inflight_out.remove(&pubcomp.msg_id);
                    true
                }
                Some(_) => {
                    warn!("PUBCOMP for {} in wrong state from {}", pubcomp.msg_id, client_id);
                    false
                }
                None => {
                    warn!("PUBCOMP for unknown msg id {} from {}", pubcomp.msg_id, client_id);
                    false
                }
            }
        };
        if removed {
            self.shared.process_queued(client_id);
        }
    }

    async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let (username, clean_session, no_local) = {
            let s = session.read();
            (s.username.clone(), s.clean_session, s.no_local)
        };

        // Accepted entries: (filter, granted qos, replay retained?)
        let mut accepted: Vec<(String, QoS, bool)> = Vec::new();
        let mut granted: Vec<QoS> = Vec::new();

        for (filter, qos) in &subscribe.filters {
            let filter = self.mount_topic(filter);

            // An invalid filter is dropped individually; the batch continues
            if validate_topic_filter(&filter).is_err() {
                debug!("Invalid filter in SUBSCRIBE from {}", client_id);
                continue;
            }

            let allowed = self
                .shared
                .hooks
                .on_subscribe_check(client_id, username.as_deref(), &filter)
                .await
                .unwrap_or(false);
            if !allowed {
                info!("SUBSCRIBE denied for {} to {}", client_id, filter);
                continue;
            }

            // De-duplicate within the packet; the later entry wins
            if let Some(existing) = accepted.iter_mut().find(|(f, _, _)| *f == filter) {
                existing.1 = *qos;
                self.shared.subscriptions.subscribe(
                    client_id,
                    &filter,
                    *qos,
                    no_local,
                    !clean_session,
                    Priority::Normal,
                );
                continue;
            }

            let isnew = self.shared.subscriptions.subscribe(
                client_id,
                &filter,
                *qos,
                no_local,
                !clean_session,
                Priority::Normal,
            );

            debug!("SUBSCRIBE {} to {} (qos {:?})", client_id, filter, qos);
            granted.push(*qos);
            accepted.push((filter, *qos, !no_local || isnew));
        }

        // SUBACK goes out before the retained fan-out: the replay may fill
        // the socket buffer.
        self.write_packet(&Packet::SubAck(SubAck {
            msg_id: subscribe.msg_id,
            granted,
        }))
        .await?;

        for (filter, qos, replay) in accepted {
            if replay {
                self.shared
                    .replay_retained(session, &filter, qos, Priority::Normal);
            }
        }

        Ok(())
    }

    async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            let filter = self.mount_topic(filter);
            self.shared.subscriptions.unsubscribe(client_id, &filter);
            debug!("UNSUBSCRIBE {} from {}", client_id, filter);
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            msg_id: unsubscribe.msg_id,
        }))
        .await?;
        Ok(())
    }
}
