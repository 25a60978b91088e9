// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cross-component scenarios driven through the public surface.

use gateway::assets::AssetFetcher;
use gateway::cluster::Cluster;
use gateway::config::PresetConfig;
use gateway::gameserver::ServerManager;
use gateway::ingress::{poll_transport, Connection, ConnectionKind, NetworkStatus, TransportEvent};
use gateway::relay::Relay;
use gateway::spaces::{FsEditStore, SpaceManager, Verse};
use gateway::user::{UserOrchestrator, UserStatus};
use netutil::Session;
use protocol::{ClientId, Message, MessageCode, Packet, RawPacket};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct FakeConnection {
    session: Session,
    host: String,
}

impl FakeConnection {
    fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(),
            host: host.to_owned(),
        })
    }
}

impl Connection for FakeConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::WebSocket
    }

    fn device_type(&self) -> &str {
        "test"
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn network_status(&self) -> NetworkStatus {
        NetworkStatus::Connected
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn connect(&self, _server_name: &str, _hidden: bool, _should_copy: bool) {}
}

fn cluster() -> Arc<Cluster> {
    let session = Session::new();
    let manager = Arc::new(ServerManager::new(
        session.child(),
        vec![PresetConfig {
            name: "lobby".to_owned(),
            description: "lobby".to_owned(),
            max_clients: 16,
            default: true,
        }],
        28785,
        None,
    ));
    let spaces = SpaceManager::new(
        manager.clone(),
        Arc::new(Verse::empty()),
        Arc::new(AssetFetcher::from_maps(Vec::new())),
        Arc::new(FsEditStore::new(
            std::env::temp_dir().join("gateway-int-test"),
        )),
    );
    Cluster::new(session, UserOrchestrator::new(), manager, spaces)
}

fn position(tag: u8) -> Message {
    Message::Position { data: vec![tag] }
}

type Deliveries = Arc<Mutex<Vec<(u8, Vec<Message>)>>>;

fn collector() -> (Deliveries, gateway::relay::SendFn) {
    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = deliveries.clone();
    (
        deliveries,
        Box::new(move |channel, batch| {
            sink.lock().unwrap().push((channel, batch));
        }),
    )
}

/// Three peers; two publish positions; each receiver sees everyone but
/// itself, the idle peer sees both, and a quiet tick delivers nothing.
#[tokio::test(start_paused = true)]
async fn three_peer_relay() {
    let session = Session::new();
    let relay = Relay::start(session.clone());

    let (out1, send1) = collector();
    let (pos1, _) = relay.add_client(ClientId(1), send1);
    let (out2, send2) = collector();
    let (pos2, _) = relay.add_client(ClientId(2), send2);
    let (out3, send3) = collector();
    let _handles3 = relay.add_client(ClientId(3), send3);

    pos1.publish(vec![position(1)]).await.unwrap();
    pos2.publish(vec![position(2)]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(12)).await;

    assert_eq!(out1.lock().unwrap().clone(), vec![(0, vec![position(2)])]);
    assert_eq!(out2.lock().unwrap().clone(), vec![(0, vec![position(1)])]);
    assert_eq!(
        out3.lock().unwrap().clone(),
        vec![(0, vec![position(1), position(2)])]
    );

    // No new publishes: the next tick is silent.
    tokio::time::sleep(Duration::from_millis(12)).await;
    assert_eq!(out3.lock().unwrap().len(), 1);

    session.cancel();
}

/// A user hands over from one server to another: the old peers are
/// forgotten exactly once each, the new roster lists the user exactly
/// once, and status lands on connected.
#[tokio::test]
async fn handover_between_servers() {
    let cluster = cluster();
    let session = Session::new();
    let server_x = cluster.manager.new_server(&session, "", false).unwrap();
    let server_y = cluster.manager.new_server(&session, "", false).unwrap();

    let u = cluster.accept(FakeConnection::new("u.example")).unwrap();
    let b = cluster.accept(FakeConnection::new("b.example")).unwrap();

    for (user, server) in [(&u, &server_x), (&b, &server_x)] {
        let mut admitted = user.connect(server).unwrap();
        assert!(admitted.recv().await.unwrap());
    }

    let mut outgoing = u.take_outgoing().unwrap();
    while outgoing.try_recv().is_ok() {}

    let mut admitted = u.connect(&server_y).unwrap();
    assert!(admitted.recv().await.unwrap());
    assert_eq!(u.status(), UserStatus::Connected);

    let mut forgotten = Vec::new();
    while let Ok(packet) = outgoing.try_recv() {
        for message in packet.messages {
            if let Message::ClientDisconnected { client } = message {
                forgotten.push(client);
            }
        }
    }
    assert_eq!(forgotten, vec![i32::from(b.id)]);

    let on_y = cluster.orchestrator.server_users(&server_y);
    assert_eq!(on_y.len(), 1);
    assert_eq!(on_y[0].id, u.id);
}

/// Datagram ingress end to end: peers connect through the transport
/// adapter, land in the lobby, and relay traffic to each other.
#[tokio::test]
async fn datagram_peers_relay_through_the_lobby() {
    let cluster = cluster();
    let session = Session::new();

    let (events_tx, events_rx) = mpsc::channel(16);
    let (send_tx, mut send_rx) = mpsc::unbounded_channel();
    tokio::spawn(poll_transport(
        cluster.clone(),
        session.clone(),
        events_rx,
        send_tx,
    ));

    for peer in [1u64, 2] {
        events_tx
            .send(TransportEvent::Connect {
                peer,
                host: format!("peer{}.example", peer),
            })
            .await
            .unwrap();
    }

    // Both peers admitted to the lobby.
    let mut waited = 0;
    loop {
        let connected = cluster
            .orchestrator
            .users()
            .iter()
            .filter(|user| user.status() == UserStatus::Connected)
            .count();
        if connected == 2 {
            break;
        }
        waited += 1;
        assert!(waited < 200, "peers never joined the lobby");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let frame = {
        let mut p = Packet::new();
        position(7).encode(&mut p);
        p.into_bytes()
    };
    events_tx
        .send(TransportEvent::Receive {
            peer: 1,
            channel: 0,
            data: frame,
        })
        .await
        .unwrap();

    // The other peer sees the position on channel 0.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let received = tokio::time::timeout_at(deadline, send_rx.recv())
            .await
            .expect("peer never received the relayed position")
            .expect("transport sender closed");
        let (peer, channel, data) = received;
        let mut p = Packet::from_bytes(&data);
        let code = p.get_int().unwrap();
        if code == MessageCode::Pos as i32 {
            assert_eq!(peer, 2);
            assert_eq!(channel, 0);
            break;
        }
    }

    events_tx
        .send(TransportEvent::Disconnect { peer: 1 })
        .await
        .unwrap();
    let mut waited = 0;
    while cluster.orchestrator.users().len() > 1 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
    }
    assert_eq!(cluster.orchestrator.users().len(), 1);

    session.cancel();
}

/// Inbound frames surface on the user's raw and typed streams.
#[tokio::test]
async fn inbound_frames_feed_the_proxies() {
    let cluster = cluster();
    let user = cluster.accept(FakeConnection::new("p.example")).unwrap();
    let _ = user.take_outgoing().unwrap();
    assert!(cluster.connect_user(&user, "").await.unwrap());

    let mut raw = user.raw_from.subscribe();
    let mut typed = user.from.subscribe();

    let mut p = Packet::new();
    Message::Text {
        text: "hello".to_owned(),
    }
    .encode(&mut p);
    cluster
        .route_client_frame(
            &user,
            RawPacket {
                channel: 1,
                data: p.into_bytes(),
            },
        )
        .await;

    assert_eq!(raw.recv().await.unwrap().channel, 1);
    assert_eq!(
        typed.recv().await.unwrap(),
        Message::Text {
            text: "hello".to_owned()
        }
    );
}
