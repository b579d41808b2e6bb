//! Bridge remote link
//!
//! One task per connection attempt: connect, CONNECT/CONNACK (with the
//! private-protocol trial), subscription setup, then pump packets between
//! the remote broker and the local delivery pipeline until the link drops.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::{ClientHandle, Outbound, Shared};
use crate::codec::{Decoder, Encoder};
use crate::config::BridgeProtocol;
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe,
    Will, PRIVATE_PROTOCOL_VERSION, PROTOCOL_NAME_V3, PROTOCOL_VERSION_V3,
};
use crate::session::{ConnectState, InflightMessage, NextExpected, Session, Variant};

use super::manager::{BridgeConnection, ConnectResult};
use super::NOTIFICATION_TOPIC;

/// Bridge links never advertise a keepalive below this
pub(super) const MIN_KEEPALIVE: u16 = 5;

pub(super) fn notification_topic(bc: &BridgeConnection) -> String {
    let template = bc
        .cfg
        .notification_topic
        .as_deref()
        .unwrap_or(NOTIFICATION_TOPIC);
    template.replace("%s", &bc.client_id)
}

pub(super) fn spawn_primary(shared: Arc<Shared>, bc: Arc<BridgeConnection>) {
    if bc.primary.connecting.swap(true, Ordering::AcqRel) {
        return;
    }
    tokio::spawn(async move {
        match bc.cfg.protocol {
            BridgeProtocol::Mqtt => run_primary(&shared, &bc).await,
            BridgeProtocol::MqttSn => super::sn::run_primary(&shared, &bc).await,
        }
        bc.primary.connecting.store(false, Ordering::Release);
        bc.primary.connected.store(false, Ordering::Release);
        *bc.primary.last_attempt.lock() = Some(std::time::Instant::now());
    });
}

pub(super) fn spawn_backup(bc: Arc<BridgeConnection>) {
    if bc.backup.connecting.swap(true, Ordering::AcqRel) {
        return;
    }
    tokio::spawn(async move {
        match bc.cfg.protocol {
            BridgeProtocol::Mqtt => run_backup(&bc).await,
            BridgeProtocol::MqttSn => super::sn::run_backup(&bc).await,
        }
        bc.backup.connecting.store(false, Ordering::Release);
    });
}

/// Advance the retry schedule after a failure, unless a private-protocol
/// fallback to the same address is about to happen.
pub(super) fn next_retry(bc: &BridgeConnection) {
    let fallback = bc.cfg.try_private
        && bc.primary.no_local.load(Ordering::Acquire)
        && matches!(
            *bc.primary.last_result.lock(),
            ConnectResult::NoneReceived | ConnectResult::UnacceptableVersion
        );
    if fallback {
        return;
    }
    let mut schedule = bc.reconnect.lock();
    schedule.next_retry();
    info!(
        "Bridge connection {} will be retried in {} seconds",
        bc.cfg.name, schedule.current
    );
}

/// Attach the bridge session (the client record is reused between
/// reconnections) and register its delivery handle.
pub(super) fn attach_session(
    shared: &Arc<Shared>,
    bc: &Arc<BridgeConnection>,
    clean_session: bool,
    variant: Variant,
) -> (
    Arc<RwLock<Session>>,
    mpsc::UnboundedReceiver<(Arc<str>, Outbound)>,
) {
    let session = shared
        .sessions
        .get(&bc.client_id)
        .unwrap_or_else(|| Arc::new(RwLock::new(Session::new(bc.client_id.clone(), variant))));
    {
        let mut s = session.write();
        s.variant = variant;
        s.outbound = true;
        s.bridge_name = Some(Arc::from(bc.cfg.name.as_str()));
        s.clean_session = clean_session;
        s.connected = true;
        s.good = true;
        s.closing = false;
        s.keep_alive = bc.cfg.keepalive.max(MIN_KEEPALIVE);
        s.connect_state = ConnectState::ConnAckSent;
        s.pending_subscription = None;
        s.touch();
        if clean_session {
            s.reset();
        } else {
            s.mark_inflight_for_resend();
        }
    }
    shared
        .sessions
        .insert_connected(bc.client_id.clone(), session.clone());

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ClientHandle::new(bc.client_id.clone(), tx);
    shared.connections.insert(bc.client_id.clone(), handle);
    (session, rx)
}

/// Install the local subscriptions for the outbound rules. Retained
/// publications are replayed only for subscriptions that are actually
/// new, to avoid retained storms on reconnect.
pub(super) fn setup_local_subscriptions(
    shared: &Arc<Shared>,
    bc: &Arc<BridgeConnection>,
    session: &Arc<RwLock<Session>>,
    clean_session: bool,
) {
    for (filter, priority) in bc.mapper.local_filters() {
        let isnew = shared.subscriptions.subscribe(
            &bc.client_id,
            filter,
            QoS::ExactlyOnce,
            true,
            !clean_session,
            priority,
        );
        if isnew {
            shared.replay_retained(session, filter, QoS::ExactlyOnce, priority);
        }
    }
}

async fn run_primary(shared: &Arc<Shared>, bc: &Arc<BridgeConnection>) {
    let addr_index = bc.primary.cur_address.load(Ordering::Acquire);
    let address = match bc.cfg.addresses.get(addr_index) {
        Some(a) => a.clone(),
        None => return,
    };
    let connect_timeout = Duration::from_secs(bc.cfg.connect_timeout);
    let no_local = bc.primary.no_local.load(Ordering::Acquire);

    debug!(
        "Bridge connection {} connecting to {} ({} protocol)",
        bc.cfg.name,
        address,
        if no_local { "private" } else { "public" }
    );

    let mut stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            info!("Bridge connection {} to {} failed: {}", bc.cfg.name, address, e);
            next_retry(bc);
            return;
        }
        Err(_) => {
            info!("Bridge connection {} to {} timed out", bc.cfg.name, address);
            next_retry(bc);
            return;
        }
    };

    let encoder = Encoder::new();
    let mut decoder = Decoder::new().with_max_packet_size(shared.config.max_packet_size);
    let mut write_buf = BytesMut::with_capacity(4096);
    let mut read_buf = BytesMut::with_capacity(4096);

    let clean_session = bc.effective_clean_session();
    let will = bc.cfg.notifications.then(|| Will {
        topic: notification_topic(bc),
        payload: Bytes::from_static(b"0"),
        qos: QoS::AtMostOnce,
        retain: false,
    });

    let connect = Packet::Connect(Box::new(Connect {
        protocol_name: PROTOCOL_NAME_V3.to_string(),
        protocol_version: if no_local {
            PRIVATE_PROTOCOL_VERSION
        } else {
            PROTOCOL_VERSION_V3
        },
        client_id: bc.client_id.to_string(),
        clean_session,
        keep_alive: bc.cfg.keepalive.max(MIN_KEEPALIVE),
        will,
        username: bc.cfg.username.clone(),
        password: bc.cfg.password.as_ref().map(|p| Bytes::from(p.clone())),
    }));

    write_buf.clear();
    if encoder.encode(&connect, &mut write_buf).is_err() {
        return;
    }
    if stream.write_all(&write_buf).await.is_err() {
        next_retry(bc);
        return;
    }

    // Wait for CONNACK
    let connack = timeout(connect_timeout, async {
        loop {
            if let Ok(Some((packet, consumed))) = decoder.decode(&read_buf) {
                read_buf.advance(consumed);
                return Some(packet);
            }
            match stream.read_buf(&mut read_buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    })
    .await;

    match connack {
        Ok(Some(Packet::ConnAck(connack))) => match connack.return_code {
            ConnectReturnCode::Accepted => {}
            ConnectReturnCode::UnacceptableProtocolVersion => {
                info!(
                    "Bridge connection {} protocol rejected by {}",
                    bc.cfg.name, address
                );
                *bc.primary.last_result.lock() = ConnectResult::UnacceptableVersion;
                return;
            }
            other => {
                info!(
                    "Bridge connection {} refused by {}: {:?}",
                    bc.cfg.name, address, other
                );
                next_retry(bc);
                return;
            }
        },
        _ => {
            info!("Bridge connection {} got no CONNACK from {}", bc.cfg.name, address);
            next_retry(bc);
            return;
        }
    }

    info!("Bridge connection {} established to {}", bc.cfg.name, address);
    *bc.primary.last_result.lock() = ConnectResult::Accepted;
    bc.primary.connected.store(true, Ordering::Release);
    bc.mark_succeeded();
    bc.reconnect.lock().reset();
    bc.note_traffic();

    let (session, mut rx) = attach_session(shared, bc, clean_session, Variant::Mqtt);
    setup_local_subscriptions(shared, bc, &session, clean_session);

    // Remote subscriptions for inbound rules, all at QoS 2
    let remote_filters = bc.mapper.remote_filters();
    if !remote_filters.is_empty() {
        let msg_id = {
            let mut s = session.write();
            s.next_msg_id()
        };
        let subscribe = Packet::Subscribe(Subscribe {
            msg_id,
            filters: remote_filters
                .iter()
                .map(|f| (f.to_string(), QoS::ExactlyOnce))
                .collect(),
        });
        write_buf.clear();
        if encoder.encode(&subscribe, &mut write_buf).is_ok()
            && stream.write_all(&write_buf).await.is_err()
        {
            finish(shared, bc, false).await;
            return;
        }
    }

    // Connection-up notification
    if bc.cfg.notifications {
        let notify = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(notification_topic(bc).as_str()),
            msg_id: None,
            payload: Bytes::from_static(b"1"),
        });
        write_buf.clear();
        if encoder.encode(&notify, &mut write_buf).is_ok() {
            let _ = stream.write_all(&write_buf).await;
        }
    }

    shared.process_queued(&bc.client_id);

    // Pump until the link drops or the manager closes us
    let mut deliberate_close = false;
    'pump: loop {
        tokio::select! {
            result = stream.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        shared.stats.add_received(n);
                        loop {
                            let decoded = match decoder.decode(&read_buf) {
                                Ok(d) => d,
                                Err(e) => {
                                    warn!("Bad packet on bridge {}: {}", bc.cfg.name, e);
                                    break 'pump;
                                }
                            };
                            let Some((packet, consumed)) = decoded else { break };
                            read_buf.advance(consumed);
                            {
                                let mut s = session.write();
                                s.touch();
                            }
                            if !handle_remote_packet(
                                shared, bc, &session, &encoder, &mut stream, &mut write_buf, packet,
                            )
                            .await
                            {
                                break 'pump;
                            }
                        }
                    }
                }
            }

            Some((_, event)) = rx.recv() => {
                match event {
                    Outbound::Packet(Packet::Publish(mut publish)) => {
                        // Outbound prefix rewrite
                        let Some(remote_topic) = bc.mapper.map_outbound(&publish.topic) else {
                            continue;
                        };
                        publish.topic = Arc::from(remote_topic.as_str());
                        bc.note_traffic();
                        shared.stats.add_publish_sent();
                        write_buf.clear();
                        if encoder.encode(&Packet::Publish(publish), &mut write_buf).is_err()
                            || stream.write_all(&write_buf).await.is_err()
                        {
                            break;
                        }
                        shared.stats.add_sent(write_buf.len());
                    }
                    Outbound::Packet(packet) => {
                        write_buf.clear();
                        if encoder.encode(&packet, &mut write_buf).is_err()
                            || stream.write_all(&write_buf).await.is_err()
                        {
                            break;
                        }
                        shared.stats.add_sent(write_buf.len());
                    }
                    Outbound::Register { .. } => {}
                    Outbound::ProcessQueued => {
                        shared.process_queued(&bc.client_id);
                    }
                    Outbound::Takeover => {
                        deliberate_close = true;
                        break;
                    }
                    Outbound::Close { .. } => {
                        deliberate_close = true;
                        // Down notification, then a clean protocol-level
                        // DISCONNECT
                        if bc.cfg.notifications {
                            let notify = Packet::Publish(Publish {
                                dup: false,
                                qos: QoS::AtMostOnce,
                                retain: false,
                                topic: Arc::from(notification_topic(bc).as_str()),
                                msg_id: None,
                                payload: Bytes::from_static(b"0"),
                            });
                            write_buf.clear();
                            if encoder.encode(&notify, &mut write_buf).is_ok() {
                                let _ = stream.write_all(&write_buf).await;
                            }
                        }
                        write_buf.clear();
                        if encoder.encode(&Packet::Disconnect, &mut write_buf).is_ok() {
                            let _ = stream.write_all(&write_buf).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    finish(shared, bc, deliberate_close).await;
}

async fn finish(shared: &Arc<Shared>, bc: &Arc<BridgeConnection>, deliberate: bool) {
    bc.primary.connected.store(false, Ordering::Release);
    shared.finalize_disconnect(&bc.client_id, false);
    if !deliberate {
        info!("Bridge connection {} lost", bc.cfg.name);
        next_retry(bc);
    }
}

/// Handle one packet from the remote broker. Returns false on a fatal
/// protocol condition.
#[allow(clippy::too_many_arguments)]
async fn handle_remote_packet(
    shared: &Arc<Shared>,
    bc: &Arc<BridgeConnection>,
    session: &Arc<RwLock<Session>>,
    encoder: &Encoder,
    stream: &mut TcpStream,
    write_buf: &mut BytesMut,
    packet: Packet,
) -> bool {
    let mut reply: Option<Packet> = None;

    match packet {
        Packet::Publish(publish) => {
            bc.note_traffic();
            shared.stats.add_publish_received();
            // Inbound prefix rewrite; unmatched topics are dropped
            let mapped = bc.mapper.map_inbound(&publish.topic);
            match publish.qos {
                QoS::AtMostOnce => {
                    if let Some(topic) = mapped {
                        let mut publish = publish;
                        publish.topic = Arc::from(topic.as_str());
                        shared.process_publish(Some(&bc.client_id), publish);
                    }
                }
                QoS::AtLeastOnce => {
                    let msg_id = publish.msg_id.unwrap_or(0);
                    if let Some(topic) = mapped {
                        let mut publish = publish;
                        publish.topic = Arc::from(topic.as_str());
                        shared.process_publish(Some(&bc.client_id), publish);
                    }
                    reply = Some(Packet::PubAck(PubAck { msg_id }));
                }
                QoS::ExactlyOnce => {
                    let msg_id = publish.msg_id.unwrap_or(0);
                    if let Some(topic) = mapped {
                        let mut publish = publish;
                        publish.topic = Arc::from(topic.as_str());
                        let mut s = session.write();
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
                    reply = Some(Packet::PubRec(PubRec { msg_id }));
                }
            }
        }
        Packet::PubAck(puback) => {
            let removed = {
                let mut s = session.write();
                matches!(
                    s.inflight_out.get(&puback.msg_id),
                    Some(m) if m.next_expected == NextExpected::PubAck
                ) && s.inflight_out.remove(&puback.msg_id).is_some()
            };
            if removed {
                shared.process_queued(&bc.client_id);
            }
        }
        Packet::PubRec(pubrec) => {
            let respond = {
                let mut s = session.write();
                match s.inflight_out.get_mut(&pubrec.msg_id) {
                    Some(m) if m.next_expected == NextExpected::PubRec => {
                        m.next_expected = NextExpected::PubComp;
                        m.last_touch = Some(std::time::Instant::now());
                        true
                    }
                    Some(m) if m.next_expected == NextExpected::PubComp => true,
                    _ => {
                        warn!(
                            "PUBREC for unknown msg id {} on bridge {}",
                            pubrec.msg_id, bc.cfg.name
                        );
                        false
                    }
                }
            };
            if respond {
                reply = Some(Packet::PubRel(PubRel {
                    msg_id: pubrec.msg_id,
                    dup: false,
                }));
            }
        }
        Packet::PubRel(pubrel) => {
            let stored = {
                let mut s = session.write();
                s.inflight_in.remove(&pubrel.msg_id)
            };
            reply = Some(Packet::PubComp(PubComp {
                msg_id: pubrel.msg_id,
            }));
            if let Some(msg) = stored {
                shared.process_publish(Some(&bc.client_id), msg.publish);
            }
        }
        Packet::PubComp(pubcomp) => {
            let removed = {
                let mut s = session.write();
                matches!(
                    s.inflight_out.get(&pubcomp.msg_id),
                    Some(m) if m.next_expected == NextExpected::PubComp
                ) && s.inflight_out.remove(&pubcomp.msg_id).is_some()
            };
            if removed {
                shared.process_queued(&bc.client_id);
            }
        }
        Packet::SubAck(_) => {}
        Packet::PingResp => {
            let mut s = session.write();
            s.ping_outstanding = false;
        }
        Packet::Disconnect => return false,
        other => {
            warn!(
                "Unexpected packet type {} on bridge {}",
                other.packet_type(),
                bc.cfg.name
            );
        }
    }

    if let Some(reply) = reply {
        write_buf.clear();
        if encoder.encode(&reply, write_buf).is_err() || stream.write_all(write_buf).await.is_err()
        {
            return false;
        }
        shared.stats.add_sent(write_buf.len());
    }
    true
}

/// Probe the main address while the primary runs on a fallback: a
/// successful CONNACK arms the switch back.
async fn run_backup(bc: &Arc<BridgeConnection>) {
    let address = match bc.cfg.addresses.first() {
        Some(a) => a.clone(),
        None => return,
    };
    let connect_timeout = Duration::from_secs(bc.cfg.connect_timeout);

    let mut stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        _ => return,
    };

    let encoder = Encoder::new();
    let mut decoder = Decoder::new();
    let mut buf = BytesMut::with_capacity(256);

    let connect = Packet::Connect(Box::new(Connect {
        protocol_name: PROTOCOL_NAME_V3.to_string(),
        protocol_version: PROTOCOL_VERSION_V3,
        client_id: bc.client_id.to_string(),
        clean_session: true,
        keep_alive: bc.cfg.keepalive.max(MIN_KEEPALIVE),
        will: None,
        username: bc.cfg.username.clone(),
        password: bc.cfg.password.as_ref().map(|p| Bytes::from(p.clone())),
    }));
    buf.clear();
    if encoder.encode(&connect, &mut buf).is_err() || stream.write_all(&buf).await.is_err() {
        return;
    }

    let mut read_buf = BytesMut::with_capacity(256);
    let connack = timeout(connect_timeout, async {
        loop {
            if let Ok(Some((packet, consumed))) = decoder.decode(&read_buf) {
                read_buf.advance(consumed);
                return Some(packet);
            }
            match stream.read_buf(&mut read_buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    })
    .await;

    if let Ok(Some(Packet::ConnAck(connack))) = connack {
        if connack.return_code == ConnectReturnCode::Accepted {
            debug!(
                "Bridge connection {} backup probe succeeded on {}",
                bc.cfg.name, address
            );
            bc.note_backup_ready();
        }
    }

    buf.clear();
    if encoder.encode(&Packet::Disconnect, &mut buf).is_ok() {
        let _ = stream.write_all(&buf).await;
    }
}
