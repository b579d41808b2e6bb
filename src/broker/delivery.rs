//! Delivery pipeline
//!
//! Start-or-queue publish, inflight-window admission, queued-message
//! promotion, the retransmission timer, and session close. Everything here
//! runs inside the cooperative loop; handlers never block.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::{Packet, Publish, QoS, Subscribe};
use crate::session::{
    InflightMessage, NextExpected, PendingRegistration, QueuedMessage, Session, Variant,
};
use crate::topic::Priority;

use super::{BrokerState, ClientHandle, Outbound, Shared};

impl Shared {
    /// Apply an accepted publication: retained side effect, then fan-out to
    /// every matching subscriber through the delivery pipeline.
    pub fn process_publish(&self, originator: Option<&str>, publish: Publish) {
        if publish.retain {
            if publish.payload.is_empty() {
                self.subscriptions.clear_retained(&publish.topic);
            } else {
                self.subscriptions.set_retained(
                    &publish.topic,
                    publish.qos,
                    publish.payload.clone(),
                );
            }
        }

        let subscribers = self.subscriptions.get_subscribers(&publish.topic, originator);
        for sub in subscribers {
            let qos = publish.qos.min(sub.qos);
            if let Some(session) = self.sessions.get(&sub.client_id) {
                // Live deliveries carry retain=0; only retained replay on
                // subscribe sets the flag.
                self.start_or_queue(&session, &publish, qos, false, sub.priority);
            }
        }
    }

    /// Start a publish to one client, or queue it when the window is full.
    pub fn start_or_queue(
        &self,
        session: &Arc<RwLock<Session>>,
        publish: &Publish,
        qos: QoS,
        retain: bool,
        priority: Priority,
    ) {
        let mut s = session.write();

        // QoS 0 publications are not stored for disconnected sessions
        if !s.connected && qos == QoS::AtMostOnce {
            return;
        }

        let can_start = s.connected
            && s.good
            && s.queued_len() == 0
            && s.pending_registration.is_none()
            && (qos == QoS::AtMostOnce
                || s.inflight_out.len() < self.config.max_inflight_messages);

        if can_start {
            let handle = match self.connections.get(s.client_id.as_ref()) {
                Some(h) => h.clone(),
                None => return,
            };
            let msg = QueuedMessage {
                qos,
                retain,
                publish: publish.clone(),
            };
            self.start_one(&mut s, &handle, msg);
            return;
        }

        // Queue path
        if s.queued_len() >= self.config.max_queued_messages {
            s.discarded += 1;
            // Log once per threshold crossing, not per message
            if s.discarded % self.config.max_queued_messages == 1 {
                warn!(
                    "Queue full for {}; discarded {} messages",
                    s.client_id, s.discarded
                );
            }
            if s.discarded >= self.config.max_queued_messages * 10 {
                // Resource exhaustion: flag the client broken, cleaned on
                // the next sweep
                s.good = false;
            }
            return;
        }
        s.enqueue(
            priority,
            QueuedMessage {
                qos,
                retain,
                publish: publish.clone(),
            },
        );
    }

    /// Move one message into flight and hand it to the connection task.
    /// For an MQTT-SN client, a topic that is not yet registered first
    /// produces a REGISTER; the message is held until the REGACK arrives.
    fn start_one(&self, s: &mut Session, handle: &ClientHandle, msg: QueuedMessage) -> bool {
        if s.variant == Variant::MqttSn && needs_registration(s, &msg.publish.topic) {
            let topic_id = s.registrations.register(&msg.publish.topic);
            let msg_id = s.next_msg_id();
            let topic: Arc<str> = msg.publish.topic.clone();
            s.pending_registration = Some(PendingRegistration {
                topic_id,
                msg_id,
                topic: topic.clone(),
                held: msg,
                last_touch: Instant::now(),
            });
            handle.send(Outbound::Register {
                topic_id,
                msg_id,
                topic,
            });
            return false;
        }

        let mut out = msg.publish.clone();
        out.qos = msg.qos;
        out.retain = msg.retain;
        out.dup = false;
        out.msg_id = None;

        if msg.qos != QoS::AtMostOnce {
            let msg_id = s.next_msg_id();
            out.msg_id = Some(msg_id);
            s.inflight_out.insert(
                msg_id,
                InflightMessage {
                    msg_id,
                    qos: msg.qos,
                    retain: msg.retain,
                    publish: out.clone(),
                    next_expected: if msg.qos == QoS::AtLeastOnce {
                        NextExpected::PubAck
                    } else {
                        NextExpected::PubRec
                    },
                    last_touch: Some(Instant::now()),
                },
            );
        }

        handle.send(Outbound::Packet(Packet::Publish(out)))
    }

    /// Promote queued messages into the inflight window. Runs whenever
    /// capacity frees up: after PUBACK/PUBCOMP, after a REGACK releases a
    /// held message, and after a persistent session reattaches.
    pub fn process_queued(&self, client_id: &str) {
        let session = match self.sessions.get_connected(client_id) {
            Some(s) => s,
            None => return,
        };
        let handle = match self.connections.get(client_id) {
            Some(h) => h.clone(),
            None => return,
        };

        let mut s = session.write();
        if !s.connected || !s.good {
            return;
        }

        while s.pending_registration.is_none() {
            let has_capacity = s.inflight_out.len() < self.config.max_inflight_messages;
            // QoS 0 messages at the queue head drain regardless of the
            // window; QoS>=1 requires capacity.
            let next_qos = match s
                .queued
                .iter()
                .rev()
                .find_map(|q| q.front().map(|m| m.qos))
            {
                Some(qos) => qos,
                None => break,
            };
            if next_qos != QoS::AtMostOnce && !has_capacity {
                break;
            }
            let msg = match s.dequeue() {
                Some(m) => m,
                None => break,
            };
            if !self.start_one(&mut s, &handle, msg) {
                break;
            }
        }
    }

    /// Release the message held behind a REGISTER once its REGACK arrives.
    pub fn complete_registration(&self, session: &Arc<RwLock<Session>>, msg_id: u16) {
        let client_id = {
            let mut s = session.write();
            match s.pending_registration.take() {
                Some(pending) if pending.msg_id == msg_id => {
                    let handle = match self.connections.get(s.client_id.as_ref()) {
                        Some(h) => h.clone(),
                        None => return,
                    };
                    self.start_one(&mut s, &handle, pending.held);
                    s.client_id.clone()
                }
                Some(pending) => {
                    // Unknown ack id: keep waiting for the right one
                    warn!(
                        "REGACK msg id {} does not match pending {}",
                        msg_id, pending.msg_id
                    );
                    s.pending_registration = Some(pending);
                    return;
                }
                None => return,
            }
        };
        self.process_queued(&client_id);
    }

    /// Replay retained publications matching a fresh subscription, capped
    /// at the subscription's granted QoS. A large replay switches to the
    /// queued path so one subscriber cannot starve the loop.
    pub fn replay_retained(
        &self,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        sub_qos: QoS,
        priority: Priority,
    ) {
        let retained = self.subscriptions.get_retained(filter);
        let window = self.config.max_inflight_messages;

        for (count, r) in retained.into_iter().enumerate() {
            let qos = sub_qos.min(r.qos);
            let publish = Publish {
                dup: false,
                qos,
                retain: true,
                topic: r.topic.clone(),
                msg_id: None,
                payload: r.payload.clone(),
            };
            if count >= window {
                let mut s = session.write();
                s.enqueue(
                    priority,
                    QueuedMessage {
                        qos,
                        retain: true,
                        publish,
                    },
                );
            } else {
                self.start_or_queue(session, &publish, qos, true, priority);
            }
        }
    }

    /// Immediate retry pass for one client: resend every inflight entry
    /// marked for retransmission (used when a persistent session
    /// reattaches).
    pub fn retry_sweep_for(&self, client_id: &str) {
        let session = match self.sessions.get_connected(client_id) {
            Some(s) => s,
            None => return,
        };
        let handle = match self.connections.get(client_id) {
            Some(h) => h.clone(),
            None => return,
        };

        let now = Instant::now();
        let mut s = session.write();
        for msg in s.inflight_out.values_mut() {
            if msg.last_touch.is_some() {
                continue;
            }
            msg.last_touch = Some(now);
            match msg.next_expected {
                NextExpected::PubAck | NextExpected::PubRec => {
                    let mut publish = msg.publish.clone();
                    publish.dup = true;
                    handle.send(Outbound::Packet(Packet::Publish(publish)));
                }
                NextExpected::PubComp => {
                    handle.send(Outbound::Packet(Packet::PubRel(crate::protocol::PubRel {
                        msg_id: msg.msg_id,
                        dup: true,
                    })));
                }
                NextExpected::PubRel => {}
            }
        }
    }

    /// Retransmission sweep over every connected session.
    pub fn retry_sweep(&self) {
        let now = Instant::now();
        let interval = self.config.retry_interval;
        let mut resend: Vec<(ClientHandle, Outbound)> = Vec::new();

        self.sessions.for_each_connected(|client_id, session| {
            let handle = match self.connections.get(client_id.as_ref()) {
                Some(h) => h.clone(),
                None => return,
            };
            let mut s = session.write();
            if !s.good {
                return;
            }

            for msg in s.inflight_out.values_mut() {
                let due = match msg.last_touch {
                    None => true,
                    Some(t) => now.duration_since(t) > interval,
                };
                if !due {
                    continue;
                }
                msg.last_touch = Some(now);
                match msg.next_expected {
                    NextExpected::PubAck | NextExpected::PubRec => {
                        let mut publish = msg.publish.clone();
                        publish.dup = true;
                        resend.push((handle.clone(), Outbound::Packet(Packet::Publish(publish))));
                    }
                    NextExpected::PubComp => {
                        resend.push((
                            handle.clone(),
                            Outbound::Packet(Packet::PubRel(crate::protocol::PubRel {
                                msg_id: msg.msg_id,
                                dup: true,
                            })),
                        ));
                    }
                    NextExpected::PubRel => {}
                }
            }

            if let Some(ref mut pending) = s.pending_registration {
                if now.duration_since(pending.last_touch) > interval {
                    pending.last_touch = now;
                    resend.push((
                        handle.clone(),
                        Outbound::Register {
                            topic_id: pending.topic_id,
                            msg_id: pending.msg_id,
                            topic: pending.topic.clone(),
                        },
                    ));
                }
            }

            if let Some(ref mut pending) = s.pending_subscription {
                if now.duration_since(pending.last_touch) > interval {
                    pending.last_touch = now;
                    resend.push((
                        handle.clone(),
                        Outbound::Packet(Packet::Subscribe(Subscribe {
                            msg_id: pending.msg_id,
                            filters: vec![(pending.filter.to_string(), pending.qos)],
                        })),
                    ));
                }
            }
        });

        for (handle, event) in resend {
            handle.send(event);
        }
    }

    /// Keepalive sweep: outbound (bridge) sessions ping the remote end and
    /// are declared dead when a ping goes unanswered; inbound sessions are
    /// closed after 1.5x their keepalive without contact (the factor-2
    /// check at the 5-second boundary of the original rounds to the same
    /// outcome, so the stricter bound is kept).
    pub fn keepalive_sweep(&self) {
        let now = Instant::now();
        let mut to_close: Vec<(Arc<str>, bool)> = Vec::new();
        let mut pings: Vec<ClientHandle> = Vec::new();

        self.sessions.for_each_connected(|client_id, session| {
            let mut s = session.write();
            if !s.connected {
                return;
            }
            if !s.good {
                // Flagged by queue exhaustion or an I/O error; cleaned here
                to_close.push((client_id.clone(), true));
                return;
            }
            if s.keep_alive == 0 {
                return;
            }
            let elapsed = now.duration_since(s.last_contact).as_secs();
            if s.outbound {
                if elapsed >= s.keep_alive as u64 {
                    if s.ping_outstanding {
                        info!("Bridge session {} is not responding", client_id);
                        to_close.push((client_id.clone(), false));
                    } else if let Some(handle) = self.connections.get(client_id.as_ref()) {
                        s.ping_outstanding = true;
                        s.touch();
                        pings.push(handle.clone());
                    }
                }
            } else if elapsed > 2 * s.keep_alive as u64 {
                info!("Client {} has exceeded its keepalive; closing", client_id);
                to_close.push((client_id.clone(), true));
            }
        });

        for handle in pings {
            handle.send(Outbound::Packet(Packet::PingReq));
        }
        for (client_id, send_will) in to_close {
            self.close_session(&client_id, send_will);
        }
    }

    /// Ask a client's connection task to close its session. Falls back to
    /// finalizing directly when the task is already gone.
    pub fn close_session(&self, client_id: &str, send_will: bool) {
        let sent = self
            .connections
            .get(client_id)
            .map(|h| h.send(Outbound::Close { send_will }))
            .unwrap_or(false);
        if !sent {
            self.finalize_disconnect(client_id, send_will);
        }
    }

    /// Tear down a session after its socket is gone. Runs at most once per
    /// connection; the `closing` flag guards against reentry while the
    /// dispatcher still holds the session.
    pub fn finalize_disconnect(&self, client_id: &str, send_will: bool) {
        let session = match self.sessions.get(client_id) {
            Some(s) => s,
            None => return,
        };

        let (will, outbound, clean_session) = {
            let mut s = session.write();
            if s.closing {
                return;
            }
            s.closing = true;
            s.connected = false;
            s.connect_state = crate::session::ConnectState::Idle;
            s.ping_outstanding = false;
            let will = s.will.take();
            (will, s.outbound, s.clean_session)
        };

        self.connections.remove(client_id);

        // An inbound session that died without a clean DISCONNECT publishes
        // its will as if the client had sent it.
        if !outbound && send_will {
            if let Some(will) = will {
                debug!("Publishing will for {} to {}", client_id, will.topic);
                self.process_publish(
                    Some(client_id),
                    Publish {
                        dup: false,
                        qos: will.qos,
                        retain: will.retain,
                        topic: Arc::from(will.topic.as_str()),
                        msg_id: None,
                        payload: will.payload,
                    },
                );
            }
        }

        if outbound {
            // Bridge client records are reused on reconnection; only the
            // message lists are reset, and only for clean sessions.
            let mut s = session.write();
            if clean_session {
                s.reset();
            }
            s.closing = false;
        } else if clean_session {
            self.subscriptions.unsubscribe_all(client_id, true);
            self.sessions.remove(client_id);
        } else {
            let mut s = session.write();
            s.purge_qos0_queued();
            s.closing = false;
            drop(s);
            self.subscriptions.unsubscribe_all(client_id, false);
            self.sessions.move_to_disconnected(client_id);
        }
    }

    /// During STOPPING, close connected sessions that have no inflight work.
    pub fn sweep_quiescent(&self) {
        if self.state() != BrokerState::Stopping {
            return;
        }
        let mut quiescent: Vec<Arc<str>> = Vec::new();
        self.sessions.for_each_connected(|client_id, session| {
            let s = session.read();
            if s.inflight_out.is_empty() && s.inflight_in.is_empty() {
                quiescent.push(client_id.clone());
            }
        });
        for client_id in quiescent {
            self.close_session(&client_id, false);
        }
    }
}

/// An MQTT-SN publish needs a REGISTER first unless the topic fits the
/// short-topic form (two characters) or is already registered.
fn needs_registration(s: &Session, topic: &str) -> bool {
    topic.len() >= 3 && s.registrations.id_of(topic).is_none()
}
