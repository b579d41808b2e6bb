//! MQTT-SN bridge remote link
//!
//! Connects to a remote MQTT-SN gateway over UDP: CONNECT (with the
//! notification will delivered through the WILLTOPIC/WILLMSG substeps),
//! then remote subscriptions issued one at a time and tracked through the
//! session's pending_subscription slot, topic-id registration for
//! outbound publishes, and datagram pumping until the link drops.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::{Outbound, Shared};
use crate::codec::sn::{decode_datagram, encode_datagram};
use crate::protocol::sn::{SnFlags, SnPacket, SnReturnCode, SnTopic, TopicIdType};
use crate::protocol::{Packet, Publish, QoS};
use crate::session::{NextExpected, PendingSubscription, Session, Variant};
use crate::topic::Priority;

use super::client::{
    attach_session, next_retry, notification_topic, setup_local_subscriptions, MIN_KEEPALIVE,
};
use super::manager::{BridgeConnection, ConnectResult};

async fn send_packet(socket: &UdpSocket, packet: &SnPacket) -> bool {
    let mut buf = BytesMut::with_capacity(64);
    if encode_datagram(packet, &mut buf).is_err() {
        return false;
    }
    socket.send(&buf).await.is_ok()
}

async fn recv_packet(socket: &UdpSocket, buf: &mut [u8]) -> Option<SnPacket> {
    loop {
        match socket.recv(buf).await {
            Ok(n) => match decode_datagram(&buf[..n]) {
                Ok(frame) => return Some(frame.packet),
                Err(e) => {
                    debug!("Bad MQTT-SN packet on bridge link: {}", e);
                    continue;
                }
            },
            Err(_) => return None,
        }
    }
}

/// CONNECT handshake as an MQTT-SN client, walking the will substeps when
/// a notification will is configured. Returns the CONNACK return code,
/// or None when the link died or the handshake timed out.
async fn connect_handshake(
    socket: &UdpSocket,
    bc: &Arc<BridgeConnection>,
    clean_session: bool,
    buf: &mut [u8],
) -> Option<SnReturnCode> {
    let connect = SnPacket::Connect {
        flags: SnFlags {
            will: bc.cfg.notifications,
            clean_session,
            ..Default::default()
        },
        duration: bc.cfg.keepalive.max(MIN_KEEPALIVE),
        client_id: bc.client_id.to_string(),
    };
    if !send_packet(socket, &connect).await {
        return None;
    }

    let deadline = Duration::from_secs(bc.cfg.connect_timeout);
    let handshake = timeout(deadline, async {
        loop {
            match recv_packet(socket, buf).await? {
                SnPacket::WillTopicReq => {
                    let will_topic = SnPacket::WillTopic {
                        flags: Some(SnFlags::default()),
                        topic: notification_topic(bc),
                    };
                    if !send_packet(socket, &will_topic).await {
                        return None;
                    }
                }
                SnPacket::WillMsgReq => {
                    let will_msg = SnPacket::WillMsg {
                        message: Bytes::from_static(b"0"),
                    };
                    if !send_packet(socket, &will_msg).await {
                        return None;
                    }
                }
                SnPacket::ConnAck { return_code } => return Some(return_code),
                _ => {}
            }
        }
    })
    .await;

    handshake.ok().flatten()
}

/// Rewrite a local topic for the remote gateway. The connection-state
/// notification topic passes through unmapped.
fn map_remote(bc: &BridgeConnection, topic: &str) -> Option<String> {
    bc.mapper
        .map_outbound(topic)
        .or_else(|| (topic == notification_topic(bc)).then(|| topic.to_string()))
}

/// Issue the next remote SUBSCRIBE, tracked in pending_subscription.
async fn start_remote_subscription(
    socket: &UdpSocket,
    session: &Arc<RwLock<Session>>,
    filter: String,
) {
    let msg_id = {
        let mut s = session.write();
        let msg_id = s.next_msg_id();
        s.pending_subscription = Some(PendingSubscription {
            msg_id,
            filter: Arc::from(filter.as_str()),
            qos: QoS::ExactlyOnce,
            last_touch: Instant::now(),
        });
        msg_id
    };
    send_packet(
        socket,
        &SnPacket::Subscribe {
            flags: SnFlags {
                qos: QoS::ExactlyOnce as u8,
                topic_id_type: TopicIdType::Normal,
                ..Default::default()
            },
            msg_id,
            topic: SnTopic::Name(filter),
        },
    )
    .await;
}

pub(super) async fn run_primary(shared: &Arc<Shared>, bc: &Arc<BridgeConnection>) {
    let addr_index = bc.primary.cur_address.load(Ordering::Acquire);
    let address = match bc.cfg.addresses.get(addr_index) {
        Some(a) => a.clone(),
        None => return,
    };

    debug!(
        "Bridge connection {} connecting to {} (MQTT-SN)",
        bc.cfg.name, address
    );

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(_) => return,
    };
    if socket.connect(&address).await.is_err() {
        info!("Bridge connection {} to {} failed", bc.cfg.name, address);
        next_retry(bc);
        return;
    }

    let mut buf = vec![0u8; shared.config.max_packet_size.min(65535)];
    let clean_session = bc.effective_clean_session();

    match connect_handshake(&socket, bc, clean_session, &mut buf).await {
        Some(SnReturnCode::Accepted) => {}
        Some(other) => {
            info!(
                "Bridge connection {} refused by {}: {:?}",
                bc.cfg.name, address, other
            );
            next_retry(bc);
            return;
        }
        None => {
            info!(
                "Bridge connection {} got no CONNACK from {}",
                bc.cfg.name, address
            );
            next_retry(bc);
            return;
        }
    }

    info!(
        "Bridge connection {} established to {} (MQTT-SN)",
        bc.cfg.name, address
    );
    *bc.primary.last_result.lock() = ConnectResult::Accepted;
    bc.primary.connected.store(true, Ordering::Release);
    bc.mark_succeeded();
    bc.reconnect.lock().reset();
    bc.note_traffic();

    let (session, mut rx) = attach_session(shared, bc, clean_session, Variant::MqttSn);
    setup_local_subscriptions(shared, bc, &session, clean_session);

    // Remote subscriptions go out one at a time; the rest wait for the
    // SUBACK of the one in flight.
    let mut remote_subs: VecDeque<String> = bc
        .mapper
        .remote_filters()
        .into_iter()
        .map(str::to_string)
        .collect();
    if let Some(filter) = remote_subs.pop_front() {
        start_remote_subscription(&socket, &session, filter).await;
    }

    // Connection-up notification, routed through the delivery pipeline so
    // the topic registration happens like any other publish
    if bc.cfg.notifications {
        let notify = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(notification_topic(bc).as_str()),
            msg_id: None,
            payload: Bytes::from_static(b"1"),
        };
        shared.start_or_queue(&session, &notify, QoS::AtMostOnce, false, Priority::Normal);
    }

    shared.process_queued(&bc.client_id);

    // Pump until the link drops or the manager closes us
    let mut deliberate_close = false;
    'pump: loop {
        tokio::select! {
            result = socket.recv(&mut buf) => {
                let n = match result {
                    Ok(n) => n,
                    Err(_) => break 'pump,
                };
                shared.stats.add_received(n);
                let packet = match decode_datagram(&buf[..n]) {
                    Ok(frame) => frame.packet,
                    Err(e) => {
                        warn!("Bad packet on bridge {}: {}", bc.cfg.name, e);
                        break 'pump;
                    }
                };
                {
                    let mut s = session.write();
                    s.touch();
                }
                if !handle_remote_packet(shared, bc, &session, &socket, &mut remote_subs, packet)
                    .await
                {
                    break 'pump;
                }
            }

            Some((_, event)) = rx.recv() => {
                match event {
                    Outbound::Packet(Packet::Publish(publish)) => {
                        if !send_remote_publish(shared, bc, &session, &socket, publish).await {
                            break 'pump;
                        }
                    }
                    Outbound::Packet(Packet::PubRel(pubrel)) => {
                        send_packet(&socket, &SnPacket::PubRel { msg_id: pubrel.msg_id }).await;
                    }
                    Outbound::Packet(Packet::PingReq) => {
                        if !send_packet(&socket, &SnPacket::PingReq { client_id: None }).await {
                            break 'pump;
                        }
                    }
                    Outbound::Packet(Packet::Subscribe(subscribe)) => {
                        // Retry of the outstanding remote SUBSCRIBE
                        if let Some((filter, qos)) = subscribe.filters.into_iter().next() {
                            send_packet(&socket, &SnPacket::Subscribe {
                                flags: SnFlags {
                                    qos: qos as u8,
                                    topic_id_type: TopicIdType::Normal,
                                    ..Default::default()
                                },
                                msg_id: subscribe.msg_id,
                                topic: SnTopic::Name(filter),
                            }).await;
                        }
                    }
                    Outbound::Packet(_) => {}
                    Outbound::Register { msg_id, topic, .. } => {
                        // Client-side REGISTER proposes no id; the gateway
                        // assigns one in the REGACK. The remote learns the
                        // rewritten name.
                        if let Some(mapped) = map_remote(bc, &topic) {
                            send_packet(&socket, &SnPacket::Register {
                                topic_id: 0,
                                msg_id,
                                topic: mapped,
                            }).await;
                        }
                    }
                    Outbound::ProcessQueued => {
                        shared.process_queued(&bc.client_id);
                    }
                    Outbound::Takeover => {
                        deliberate_close = true;
                        break 'pump;
                    }
                    Outbound::Close { .. } => {
                        deliberate_close = true;
                        // Down notification when the topic is already
                        // registered, then a clean DISCONNECT
                        if bc.cfg.notifications {
                            let notif = notification_topic(bc);
                            let id = {
                                let s = session.read();
                                s.registrations.id_of(&notif)
                            };
                            if let Some(topic_id) = id {
                                send_packet(&socket, &SnPacket::Publish {
                                    flags: SnFlags {
                                        topic_id_type: TopicIdType::Normal,
                                        ..Default::default()
                                    },
                                    topic_id,
                                    msg_id: 0,
                                    topic_name: None,
                                    payload: Bytes::from_static(b"0"),
                                }).await;
                            }
                        }
                        send_packet(&socket, &SnPacket::Disconnect { duration: None }).await;
                        break 'pump;
                    }
                }
            }
        }
    }

    bc.primary.connected.store(false, Ordering::Release);
    shared.finalize_disconnect(&bc.client_id, false);
    if !deliberate_close {
        info!("Bridge connection {} lost", bc.cfg.name);
        next_retry(bc);
    }
}

/// Translate one delivery into a remote MQTT-SN PUBLISH. The topic id was
/// registered through the REGISTER interlock before the message entered
/// flight; two-character rewritten names use the short-topic form.
async fn send_remote_publish(
    shared: &Arc<Shared>,
    bc: &Arc<BridgeConnection>,
    session: &Arc<RwLock<Session>>,
    socket: &UdpSocket,
    publish: Publish,
) -> bool {
    let Some(mapped) = map_remote(bc, &publish.topic) else {
        return true;
    };

    let (topic_id, id_type) = if mapped.len() == 2 {
        let bytes = mapped.as_bytes();
        (
            Some(u16::from_be_bytes([bytes[0], bytes[1]])),
            TopicIdType::Short,
        )
    } else {
        let s = session.read();
        (s.registrations.id_of(&publish.topic), TopicIdType::Normal)
    };
    let Some(topic_id) = topic_id else {
        // Delivery raced a lost registration; the retry sweep re-issues
        // the REGISTER
        debug!("No topic id for {} on bridge {}", publish.topic, bc.cfg.name);
        return true;
    };

    bc.note_traffic();
    shared.stats.add_publish_sent();
    send_packet(
        socket,
        &SnPacket::Publish {
            flags: SnFlags {
                dup: publish.dup,
                qos: publish.qos as u8,
                retain: publish.retain,
                will: false,
                clean_session: false,
                topic_id_type: id_type,
            },
            topic_id,
            msg_id: publish.msg_id.unwrap_or(0),
            topic_name: None,
            payload: publish.payload,
        },
    )
    .await
}

/// Handle one packet from the remote gateway. Returns false on a fatal
/// condition.
async fn handle_remote_packet(
    shared: &Arc<Shared>,
    bc: &Arc<BridgeConnection>,
    session: &Arc<RwLock<Session>>,
    socket: &UdpSocket,
    remote_subs: &mut VecDeque<String>,
    packet: SnPacket,
) -> bool {
    match packet {
        SnPacket::Register {
            topic_id,
            msg_id,
            topic,
        } => {
            // The gateway announces the id it will publish under
            {
                let mut s = session.write();
                s.registrations.register_predefined(topic_id, &topic);
            }
            send_packet(
                socket,
                &SnPacket::RegAck {
                    topic_id,
                    msg_id,
                    return_code: SnReturnCode::Accepted,
                },
            )
            .await;
        }
        SnPacket::RegAck {
            topic_id,
            msg_id,
            return_code,
        } => {
            if return_code == SnReturnCode::Accepted {
                // Adopt the gateway-assigned id. The local name binding
                // serves the outbound lookups; the rewritten name is
                // bound last so inbound publishes under this id resolve
                // to the remote-side name.
                {
                    let mut s = session.write();
                    let pending_topic = s
                        .pending_registration
                        .as_ref()
                        .filter(|p| p.msg_id == msg_id)
                        .map(|p| p.topic.clone());
                    if let Some(local) = pending_topic {
                        if topic_id != 0 {
                            s.registrations.register_predefined(topic_id, &local);
                            if let Some(mapped) = map_remote(bc, &local) {
                                if mapped != *local {
                                    s.registrations.register_predefined(topic_id, &mapped);
                                }
                            }
                        }
                    }
                }
                shared.complete_registration(session, msg_id);
            } else {
                warn!(
                    "REGACK rejected on bridge {}: {:?}",
                    bc.cfg.name, return_code
                );
                let mut s = session.write();
                s.pending_registration = None;
            }
        }
        SnPacket::Publish {
            flags,
            topic_id,
            msg_id,
            topic_name,
            payload,
        } => {
            bc.note_traffic();
            shared.stats.add_publish_received();
            let qos = match QoS::from_u8(flags.qos) {
                Some(q) => q,
                // Connectionless publishes are not expected on a bridge link
                None => return true,
            };
            let name = {
                let s = session.read();
                match flags.topic_id_type {
                    TopicIdType::Normal | TopicIdType::Predefined => {
                        s.registrations.name_of(topic_id).map(|t| t.to_string())
                    }
                    TopicIdType::Short => short_topic_name(topic_id),
                }
            };
            let _ = topic_name;

            let Some(name) = name else {
                send_packet(
                    socket,
                    &SnPacket::PubAck {
                        topic_id,
                        msg_id,
                        return_code: SnReturnCode::InvalidTopicId,
                    },
                )
                .await;
                return true;
            };

            // Inbound prefix rewrite; unmatched topics are dropped
            let mapped = bc.mapper.map_inbound(&name);
            match qos {
                QoS::AtMostOnce => {
                    if let Some(topic) = mapped {
                        shared.process_publish(
                            Some(&bc.client_id),
                            Publish {
                                dup: flags.dup,
                                qos,
                                retain: flags.retain,
                                topic: Arc::from(topic.as_str()),
                                msg_id: None,
                                payload,
                            },
                        );
                    }
                }
                QoS::AtLeastOnce => {
                    if let Some(topic) = mapped {
                        shared.process_publish(
                            Some(&bc.client_id),
                            Publish {
                                dup: flags.dup,
                                qos,
                                retain: flags.retain,
                                topic: Arc::from(topic.as_str()),
                                msg_id: Some(msg_id),
                                payload,
                            },
                        );
                    }
                    send_packet(
                        socket,
                        &SnPacket::PubAck {
                            topic_id,
                            msg_id,
                            return_code: SnReturnCode::Accepted,
                        },
                    )
                    .await;
                }
                QoS::ExactlyOnce => {
                    if let Some(topic) = mapped {
                        let mut s = session.write();
                        s.inflight_in.insert(
                            msg_id,
                            crate::session::InflightMessage {
                                msg_id,
                                qos,
                                retain: flags.retain,
                                publish: Publish {
                                    dup: flags.dup,
                                    qos,
                                    retain: flags.retain,
                                    topic: Arc::from(topic.as_str()),
                                    msg_id: Some(msg_id),
                                    payload,
                                },
                                next_expected: NextExpected::PubRel,
                                last_touch: Some(Instant::now()),
                            },
                        );
                    }
                    send_packet(socket, &SnPacket::PubRec { msg_id }).await;
                }
            }
        }
        SnPacket::PubAck { msg_id, .. } => {
            let removed = {
                let mut s = session.write();
                matches!(
                    s.inflight_out.get(&msg_id),
                    Some(m) if m.next_expected == NextExpected::PubAck
                ) && s.inflight_out.remove(&msg_id).is_some()
            };
            if removed {
                shared.process_queued(&bc.client_id);
            }
        }
        SnPacket::PubRec { msg_id } => {
            let respond = {
                let mut s = session.write();
                match s.inflight_out.get_mut(&msg_id) {
                    Some(m) if m.next_expected == NextExpected::PubRec => {
                        m.next_expected = NextExpected::PubComp;
                        m.last_touch = Some(Instant::now());
                        true
                    }
                    Some(m) if m.next_expected == NextExpected::PubComp => true,
                    _ => {
                        warn!(
                            "PUBREC for unknown msg id {} on bridge {}",
                            msg_id, bc.cfg.name
                        );
                        false
                    }
                }
            };
            if respond {
                send_packet(socket, &SnPacket::PubRel { msg_id }).await;
            }
        }
        SnPacket::PubRel { msg_id } => {
            let stored = {
                let mut s = session.write();
                s.inflight_in.remove(&msg_id)
            };
            send_packet(socket, &SnPacket::PubComp { msg_id }).await;
            if let Some(msg) = stored {
                shared.process_publish(Some(&bc.client_id), msg.publish);
            }
        }
        SnPacket::PubComp { msg_id } => {
            let removed = {
                let mut s = session.write();
                matches!(
                    s.inflight_out.get(&msg_id),
                    Some(m) if m.next_expected == NextExpected::PubComp
                ) && s.inflight_out.remove(&msg_id).is_some()
            };
            if removed {
                shared.process_queued(&bc.client_id);
            }
        }
        SnPacket::SubAck {
            topic_id,
            msg_id,
            return_code,
            ..
        } => {
            let next = {
                let mut s = session.write();
                match s.pending_subscription.take() {
                    Some(pending) if pending.msg_id == msg_id => {
                        if return_code == SnReturnCode::Accepted {
                            // A concrete filter comes back with a usable
                            // topic id
                            if topic_id > 0 {
                                let filter = pending.filter.clone();
                                s.registrations.register_predefined(topic_id, &filter);
                            }
                        } else {
                            warn!(
                                "Remote SUBSCRIBE to {} rejected on bridge {}: {:?}",
                                pending.filter, bc.cfg.name, return_code
                            );
                        }
                        remote_subs.pop_front()
                    }
                    Some(pending) => {
                        warn!(
                            "SUBACK msg id {} does not match pending {}",
                            msg_id, pending.msg_id
                        );
                        s.pending_subscription = Some(pending);
                        None
                    }
                    None => None,
                }
            };
            if let Some(filter) = next {
                start_remote_subscription(socket, session, filter).await;
            }
        }
        SnPacket::PingReq { .. } => {
            send_packet(socket, &SnPacket::PingResp).await;
        }
        SnPacket::PingResp => {
            let mut s = session.write();
            s.ping_outstanding = false;
        }
        SnPacket::Disconnect { .. } => return false,
        _ => {}
    }
    true
}

/// Probe the main address while the primary runs on a fallback: a
/// successful CONNACK arms the switch back.
pub(super) async fn run_backup(bc: &Arc<BridgeConnection>) {
    let address = match bc.cfg.addresses.first() {
        Some(a) => a.clone(),
        None => return,
    };

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(_) => return,
    };
    if socket.connect(&address).await.is_err() {
        return;
    }

    let connect = SnPacket::Connect {
        flags: SnFlags {
            clean_session: true,
            ..Default::default()
        },
        duration: bc.cfg.keepalive.max(MIN_KEEPALIVE),
        client_id: bc.client_id.to_string(),
    };
    if !send_packet(&socket, &connect).await {
        return;
    }

    let mut buf = vec![0u8; 1024];
    let connack = timeout(
        Duration::from_secs(bc.cfg.connect_timeout),
        recv_packet(&socket, &mut buf),
    )
    .await;

    if let Ok(Some(SnPacket::ConnAck {
        return_code: SnReturnCode::Accepted,
    })) = connack
    {
        debug!(
            "Bridge connection {} backup probe succeeded on {}",
            bc.cfg.name, address
        );
        bc.note_backup_ready();
    }

    send_packet(&socket, &SnPacket::Disconnect { duration: None }).await;
}

/// Interpret a topic id field as a two-character short topic name
fn short_topic_name(topic_id: u16) -> Option<String> {
    let bytes = topic_id.to_be_bytes();
    std::str::from_utf8(&bytes).ok().map(str::to_string)
}
