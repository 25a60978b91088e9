// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tick-driven fan-out of positional and broadcast traffic between the
//! clients of one game server. A single background task owns the pending
//! batches; every public operation goes through the relay's mutex.

use log::trace;
use netutil::Session;
use protocol::{ClientId, Message};
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Positions are flushed on the unreliable channel, everything else on the
/// reliable one.
pub const CHANNEL_POSITIONS: u8 = 0;
pub const CHANNEL_PACKETS: u8 = 1;

const TICK: Duration = Duration::from_millis(11);

/// How many client notifications may queue before publishers start waiting.
const NOTIFY_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is no longer running")]
    Stopped,
}

/// Delivers one outgoing batch to a client on the given channel. Must not
/// block and must not call back into the relay.
pub type SendFn = Box<dyn Fn(u8, Vec<Message>) + Send + Sync>;

/// The inbound half handed to a client's ingress pipeline. Payload and
/// notification sends pace the publisher against the relay task, so a
/// client can never queue more than one undrained batch.
pub struct Publisher {
    cn: ClientId,
    payload: mpsc::Sender<Vec<Message>>,
    notify: mpsc::Sender<ClientId>,
}

impl Publisher {
    pub async fn publish(&self, messages: Vec<Message>) -> Result<(), RelayError> {
        self.payload
            .send(messages)
            .await
            .map_err(|_| RelayError::Stopped)?;
        self.notify
            .send(self.cn)
            .await
            .map_err(|_| RelayError::Stopped)
    }
}

#[derive(Default)]
struct State {
    inc_positions: HashMap<ClientId, mpsc::Receiver<Vec<Message>>>,
    positions: HashMap<ClientId, Vec<Message>>,
    inc_client_packets: HashMap<ClientId, mpsc::Receiver<Vec<Message>>>,
    client_packets: HashMap<ClientId, Vec<Message>>,
    send: HashMap<ClientId, SendFn>,
}

impl State {
    /// Drops every per-client entry without error checking. Re-adding a
    /// live cn goes through here first, so a cleanup that never ran cannot
    /// wedge the cn forever (the zombie-CN rule).
    fn force_remove(&mut self, cn: ClientId) {
        self.inc_positions.remove(&cn);
        self.positions.remove(&cn);
        self.inc_client_packets.remove(&cn);
        self.client_packets.remove(&cn);
        self.send.remove(&cn);
    }

    fn receive_positions(&mut self, cn: ClientId) {
        let Some(receiver) = self.inc_positions.get_mut(&cn) else {
            // Already removed; the notification outlived the client.
            return;
        };
        if let Ok(batch) = receiver.try_recv() {
            if batch.is_empty() {
                self.positions.remove(&cn);
            } else {
                self.positions.insert(cn, batch);
            }
        }
    }

    fn receive_client_packets(&mut self, cn: ClientId) {
        let Some(receiver) = self.inc_client_packets.get_mut(&cn) else {
            return;
        };
        if let Ok(batch) = receiver.try_recv() {
            self.client_packets.entry(cn).or_default().extend(batch);
        }
    }

    fn flush_positions(&mut self) {
        if self.positions.is_empty() || self.send.len() < 2 {
            return;
        }
        let pending = mem::take(&mut self.positions);
        Self::fan_out(&self.send, pending, None, CHANNEL_POSITIONS);
    }

    fn flush_client_packets(&mut self) {
        if self.client_packets.is_empty() || self.send.len() < 2 {
            return;
        }
        let pending = mem::take(&mut self.client_packets);
        Self::fan_out(
            &self.send,
            pending,
            Some(&|cn: ClientId| Message::ClientPacket { client: cn.into() }),
            CHANNEL_PACKETS,
        );
    }

    /// Delivers every pending batch to every client except its author.
    ///
    /// The combined buffer is doubled and each receiver walks the same
    /// sender order, advancing the offset even past its own excluded
    /// batch; both sides must keep using the identical ordering for the
    /// windowed reads to line up.
    fn fan_out(
        send: &HashMap<ClientId, SendFn>,
        packets: HashMap<ClientId, Vec<Message>>,
        prefix: Option<&dyn Fn(ClientId) -> Message>,
        channel: u8,
    ) {
        let mut senders: Vec<ClientId> = packets.keys().copied().collect();
        senders.sort_unstable();

        let mut lengths: HashMap<ClientId, usize> = HashMap::new();
        let mut combined: Vec<Message> = Vec::new();
        for &cn in &senders {
            let payload = &packets[&cn];
            let start = combined.len();
            if let Some(prefix) = prefix {
                combined.push(prefix(cn));
            }
            combined.extend_from_slice(payload);
            lengths.insert(cn, combined.len() - start);
        }

        if combined.is_empty() {
            return;
        }

        let copy = combined.clone();
        combined.extend(copy);

        let mut receivers: Vec<ClientId> = send.keys().copied().collect();
        receivers.sort_unstable();

        for &receiver in &receivers {
            let mut out: Vec<Message> = Vec::new();
            let mut offset = 0;
            for &sender in &senders {
                let len = lengths[&sender];
                if sender != receiver {
                    out.extend_from_slice(&combined[offset..offset + len]);
                }
                offset += len;
            }
            if !out.is_empty() {
                send[&receiver](channel, out);
            }
        }
    }

    fn flush_position_and_send(&mut self, cn: ClientId, message: Message) {
        let mut order: Vec<ClientId> = self.send.keys().copied().filter(|&c| c != cn).collect();
        order.sort_unstable();

        if let Some(position) = self.positions.remove(&cn) {
            for other in &order {
                self.send[other](CHANNEL_POSITIONS, position.clone());
            }
        }

        for other in &order {
            self.send[other](CHANNEL_POSITIONS, vec![message.clone()]);
        }
    }
}

struct Shared {
    state: Mutex<State>,
    position_notify: mpsc::Sender<ClientId>,
    packet_notify: mpsc::Sender<ClientId>,
}

/// Handle to a running relay. Cloning shares the same fan-out engine.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<Shared>,
}

impl Relay {
    /// Starts the background task. It stops when `session` ends.
    pub fn start(session: Session) -> Self {
        let (position_notify, mut position_notifs) = mpsc::channel(NOTIFY_BUFFER);
        let (packet_notify, mut packet_notifs) = mpsc::channel(NOTIFY_BUFFER);

        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            position_notify,
            packet_notify,
        });

        let task = shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = tick.tick() => {
                        let mut state = task.state.lock().unwrap();
                        state.flush_positions();
                        state.flush_client_packets();
                    }
                    Some(cn) = position_notifs.recv() => {
                        task.state.lock().unwrap().receive_positions(cn);
                    }
                    Some(cn) = packet_notifs.recv() => {
                        task.state.lock().unwrap().receive_client_packets(cn);
                    }
                }
            }
            trace!("relay loop ended");
        });

        Self { shared }
    }

    /// Registers a client. A remnant entry for the same cn is force-removed
    /// first so a failed cleanup can never block the reused cn. Returns the
    /// position and broadcast publishers for the client's inbound pipeline.
    pub fn add_client(&self, cn: ClientId, send: SendFn) -> (Publisher, Publisher) {
        let mut state = self.shared.state.lock().unwrap();

        if state.send.contains_key(&cn) {
            state.force_remove(cn);
        }

        state.send.insert(cn, send);

        let (position_tx, position_rx) = mpsc::channel(1);
        state.inc_positions.insert(cn, position_rx);
        let positions = Publisher {
            cn,
            payload: position_tx,
            notify: self.shared.position_notify.clone(),
        };

        let (packet_tx, packet_rx) = mpsc::channel(1);
        state.inc_client_packets.insert(cn, packet_rx);
        let packets = Publisher {
            cn,
            payload: packet_tx,
            notify: self.shared.packet_notify.clone(),
        };

        (positions, packets)
    }

    /// Unregisters a client. Removing an absent cn is not an error; double
    /// disconnects are normal. Undrained channels are simply dropped.
    pub fn remove_client(&self, cn: ClientId) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.send.contains_key(&cn) {
            return;
        }
        state.force_remove(cn);
    }

    /// Synchronous path for messages that must immediately follow the
    /// client's own position, e.g. a spawn event: flushes any pending
    /// position for `cn` to every other client, then delivers `message`
    /// the same way.
    pub fn flush_position_and_send(&self, cn: ClientId, message: Message) {
        self.shared
            .state
            .lock()
            .unwrap()
            .flush_position_and_send(cn, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::MessageCode;
    use rand::Rng;

    fn position(tag: u8) -> Message {
        Message::Position { data: vec![tag] }
    }

    fn text(tag: &str) -> Message {
        Message::Text {
            text: tag.to_owned(),
        }
    }

    type Deliveries = Arc<Mutex<Vec<(u8, Vec<Message>)>>>;

    fn collector() -> (Deliveries, SendFn) {
        let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = deliveries.clone();
        let send: SendFn = Box::new(move |channel, batch| {
            sink.lock().unwrap().push((channel, batch));
        });
        (deliveries, send)
    }

    fn state_with_clients(cns: &[u16]) -> (State, HashMap<ClientId, Deliveries>) {
        let mut state = State::default();
        let mut outputs = HashMap::new();
        for &cn in cns {
            let (deliveries, send) = collector();
            state.send.insert(ClientId(cn), send);
            outputs.insert(ClientId(cn), deliveries);
        }
        (state, outputs)
    }

    #[test]
    fn three_peer_positions() {
        let (mut state, outputs) = state_with_clients(&[1, 2, 3]);
        state.positions.insert(ClientId(1), vec![position(1)]);
        state.positions.insert(ClientId(2), vec![position(2)]);

        state.flush_positions();

        let got = |cn: u16| outputs[&ClientId(cn)].lock().unwrap().clone();
        assert_eq!(got(1), vec![(0, vec![position(2)])]);
        assert_eq!(got(2), vec![(0, vec![position(1)])]);
        assert_eq!(got(3), vec![(0, vec![position(1), position(2)])]);
        assert!(state.positions.is_empty());

        // Nothing pending, nothing delivered.
        state.flush_positions();
        assert_eq!(got(3).len(), 1);
    }

    #[test]
    fn client_packets_carry_the_author_header() {
        let (mut state, outputs) = state_with_clients(&[4, 9]);
        state
            .client_packets
            .insert(ClientId(4), vec![text("a"), text("b")]);

        state.flush_client_packets();

        let got = outputs[&ClientId(9)].lock().unwrap().clone();
        assert_eq!(
            got,
            vec![(
                1,
                vec![Message::ClientPacket { client: 4 }, text("a"), text("b")]
            )]
        );
        assert!(outputs[&ClientId(4)].lock().unwrap().is_empty());
    }

    #[test]
    fn no_receiver_sees_its_own_traffic() {
        let mut rng = rand::thread_rng();
        let cns: Vec<u16> = (0..12).map(|i| i * 7 + 1).collect();
        let (mut state, outputs) = state_with_clients(&cns);

        for &cn in &cns {
            let count = rng.gen_range(1..4);
            let batch: Vec<Message> = (0..count)
                .map(|_| Message::ClientDisconnected { client: cn as i32 })
                .collect();
            state.client_packets.insert(ClientId(cn), batch);
        }

        state.flush_client_packets();

        for &cn in &cns {
            for (_, batch) in outputs[&ClientId(cn)].lock().unwrap().iter() {
                for message in batch {
                    match message {
                        Message::ClientPacket { client }
                        | Message::ClientDisconnected { client } => {
                            assert_ne!(*client, cn as i32, "cn {} saw its own traffic", cn);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    #[test]
    fn flush_order_is_deterministic() {
        let run = || {
            let (mut state, outputs) = state_with_clients(&[3, 11, 200, 7]);
            for &cn in &[200u16, 3, 7] {
                state
                    .client_packets
                    .insert(ClientId(cn), vec![text(&cn.to_string())]);
            }
            state.flush_client_packets();
            let result = outputs[&ClientId(11)].lock().unwrap().clone();
            result
        };

        let first = run();
        let second = run();
        assert_eq!(first, second);
        // Ascending sender order within the one delivered batch.
        assert_eq!(
            first[0].1,
            vec![
                Message::ClientPacket { client: 3 },
                text("3"),
                Message::ClientPacket { client: 7 },
                text("7"),
                Message::ClientPacket { client: 200 },
                text("200"),
            ]
        );
    }

    #[test]
    fn flush_waits_for_a_second_client() {
        let (mut state, outputs) = state_with_clients(&[5]);
        state.positions.insert(ClientId(5), vec![position(5)]);
        state.flush_positions();
        assert!(outputs[&ClientId(5)].lock().unwrap().is_empty());
        // Still pending for when a peer arrives.
        assert!(state.positions.contains_key(&ClientId(5)));
    }

    #[test]
    fn flush_position_and_send_orders_position_first() {
        let (mut state, outputs) = state_with_clients(&[1, 2]);
        state.positions.insert(ClientId(1), vec![position(1)]);

        state.flush_position_and_send(
            ClientId(1),
            Message::Raw {
                code: MessageCode::Spawn,
                data: vec![],
            },
        );

        let got = outputs[&ClientId(2)].lock().unwrap().clone();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (0, vec![position(1)]));
        assert_eq!(
            got[1],
            (
                0,
                vec![Message::Raw {
                    code: MessageCode::Spawn,
                    data: vec![],
                }]
            )
        );
        assert!(outputs[&ClientId(1)].lock().unwrap().is_empty());
        assert!(!state.positions.contains_key(&ClientId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn publishers_feed_the_tick_flush() {
        let session = Session::new();
        let relay = Relay::start(session.clone());

        let (out1, send1) = collector();
        let (positions1, _packets1) = relay.add_client(ClientId(1), send1);
        let (out2, send2) = collector();
        let (_positions2, packets2) = relay.add_client(ClientId(2), send2);

        positions1.publish(vec![position(1)]).await.unwrap();
        positions1.publish(vec![position(9)]).await.unwrap();
        packets2.publish(vec![text("hi")]).await.unwrap();
        tokio::time::sleep(TICK + Duration::from_millis(1)).await;

        // Latest position wins; cn 1 never sees its own traffic.
        let got2 = out2.lock().unwrap().clone();
        assert_eq!(got2, vec![(0, vec![position(9)])]);
        let got1 = out1.lock().unwrap().clone();
        assert_eq!(
            got1,
            vec![(1, vec![Message::ClientPacket { client: 2 }, text("hi")])]
        );

        session.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn packet_batches_append_in_fifo_order() {
        let session = Session::new();
        let relay = Relay::start(session.clone());

        let (_out1, send1) = collector();
        let (_positions1, packets1) = relay.add_client(ClientId(1), send1);
        let (out2, send2) = collector();
        let _handles2 = relay.add_client(ClientId(2), send2);

        packets1.publish(vec![text("first")]).await.unwrap();
        packets1.publish(vec![text("second")]).await.unwrap();
        tokio::time::sleep(TICK + Duration::from_millis(1)).await;

        let got = out2.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![(
                1,
                vec![
                    Message::ClientPacket { client: 1 },
                    text("first"),
                    text("second"),
                ]
            )]
        );

        session.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn readding_a_cn_replaces_the_zombie() {
        let session = Session::new();
        let relay = Relay::start(session.clone());

        let (stale, stale_send) = collector();
        let _zombie_handles = relay.add_client(ClientId(7), stale_send);

        // The cleanup for cn 7 never ran; a new connection reuses it.
        let (fresh, fresh_send) = collector();
        let (_positions, packets) = relay.add_client(ClientId(7), fresh_send);

        let (peer, peer_send) = collector();
        let _peer_handles = relay.add_client(ClientId(8), peer_send);

        packets.publish(vec![text("alive")]).await.unwrap();
        tokio::time::sleep(TICK + Duration::from_millis(1)).await;

        assert!(!peer.lock().unwrap().is_empty());
        assert!(stale.lock().unwrap().is_empty());
        assert!(fresh.lock().unwrap().is_empty());

        // Removing twice stays silent.
        relay.remove_client(ClientId(7));
        relay.remove_client(ClientId(7));

        session.cancel();
    }
}
