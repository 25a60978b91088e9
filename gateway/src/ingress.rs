// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ingress transports. Native clients arrive over the external
//! reliable-datagram transport; web clients arrive over a WebSocket
//! bridge that splits engine traffic (binary frames, leading channel
//! byte) from control traffic (JSON text frames).

use crate::cluster::Cluster;
use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};
use log::{debug, warn};
use netutil::Session;
use protocol::RawPacket;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How often the bridge looks at a socket's activity clock. A quiet
/// client gets pinged after one missed window and dropped once it has
/// been silent for the full patience budget of four windows.
const ACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const PING_AFTER_IDLE: Duration = Duration::from_secs(20);
const DROP_AFTER_IDLE: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionKind {
    Datagram,
    WebSocket,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
}

/// What the gateway requires from an ingress transport.
pub trait Connection: Send + Sync {
    fn kind(&self) -> ConnectionKind;
    fn device_type(&self) -> &str;
    fn host(&self) -> String;
    fn network_status(&self) -> NetworkStatus;
    /// The connection's lifetime; cancelling it tears the user down.
    fn session(&self) -> &Session;
    /// Tells the client which server it now belongs to.
    fn connect(&self, server_name: &str, hidden: bool, should_copy: bool);
}

/// Text-frame control surface of the WebSocket bridge.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Client asks to join a server or space by name.
    Connect {
        #[serde(default)]
        name: String,
    },
    /// Client renames itself.
    SetName { name: String },
    /// Gateway confirms a server binding.
    ServerConnected {
        server: String,
        hidden: bool,
        should_copy: bool,
    },
}

pub struct WsConnection {
    session: Session,
    host: String,
    status: RwLock<NetworkStatus>,
    control: mpsc::UnboundedSender<ControlFrame>,
}

impl WsConnection {
    fn set_status(&self, status: NetworkStatus) {
        *self.status.write().unwrap() = status;
    }
}

impl Connection for WsConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::WebSocket
    }

    fn device_type(&self) -> &str {
        "web"
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn network_status(&self) -> NetworkStatus {
        *self.status.read().unwrap()
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn connect(&self, server_name: &str, hidden: bool, should_copy: bool) {
        let _ = self.control.send(ControlFrame::ServerConnected {
            server: server_name.to_owned(),
            hidden,
            should_copy,
        });
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(Vec<u8>);

#[derive(Message)]
#[rtype(result = "()")]
struct OutboundControl(ControlFrame);

/// One web client's socket. Registers a user on start, forwards frames
/// both ways, and reaps the user when the socket goes away.
pub struct WsIngress {
    cluster: Arc<Cluster>,
    host: String,
    connection: Option<Arc<WsConnection>>,
    user: Option<Arc<crate::user::User>>,
    last_activity: Instant,
}

impl WsIngress {
    pub fn new(cluster: Arc<Cluster>, host: String) -> Self {
        Self {
            cluster,
            host,
            connection: None,
            user: None,
            last_activity: Instant::now(),
        }
    }

    fn mark_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Pings quiet clients and drops dead ones; engine traffic normally
    /// keeps the clock fresh on its own.
    fn watch_activity(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(ACTIVITY_CHECK_INTERVAL, |act, ctx| {
            let idle = act.last_activity.elapsed();
            if idle > DROP_AFTER_IDLE {
                warn!("dropping web client idle for {:?}", idle);
                ctx.close(Some(CloseReason::from(CloseCode::Away)));
                ctx.stop();
            } else if idle > PING_AFTER_IDLE {
                ctx.ping(b"gate");
            }
        });
    }
}

impl Actor for WsIngress {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(WsConnection {
            session: Session::new(),
            host: self.host.clone(),
            status: RwLock::new(NetworkStatus::Connected),
            control,
        });

        let user = match self.cluster.accept(connection.clone()) {
            Ok(user) => user,
            Err(err) => {
                warn!("rejecting websocket connection: {}", err);
                ctx.close(Some(CloseReason::from(CloseCode::Again)));
                ctx.stop();
                return;
            }
        };

        // The actor is the sole consumer of the user's outgoing queue.
        let addr = ctx.address();
        let writer = user.clone();
        let mut outgoing = user.take_outgoing().expect("outgoing queue already taken");
        tokio::spawn(async move {
            while let Some(packet) = outgoing.recv().await {
                let mut encoded = protocol::Packet::new();
                for message in &packet.messages {
                    writer.to_proxy.publish(message.clone());
                    message.encode(&mut encoded);
                }
                let data = encoded.into_bytes();
                writer.raw_to.publish(RawPacket {
                    channel: packet.channel,
                    data: data.clone(),
                });

                let mut frame = Vec::with_capacity(data.len() + 1);
                frame.push(packet.channel);
                frame.extend(data);
                let result = if addr.try_send(Outbound(frame)).is_ok() {
                    Ok(())
                } else {
                    Err(crate::user::UserError::SendDropped)
                };
                let _ = packet.done.send(result);
            }
        });

        let control_addr = ctx.address();
        tokio::spawn(async move {
            while let Some(frame) = control_rx.recv().await {
                if control_addr.try_send(OutboundControl(frame)).is_err() {
                    return;
                }
            }
        });

        self.connection = Some(connection);
        self.user = Some(user);
        self.watch_activity(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(connection) = &self.connection {
            connection.set_status(NetworkStatus::Disconnected);
            connection.session.cancel();
        }
    }
}

impl Handler<Outbound> for WsIngress {
    type Result = ();

    fn handle(&mut self, outbound: Outbound, ctx: &mut Self::Context) {
        ctx.binary(outbound.0);
    }
}

impl Handler<OutboundControl> for WsIngress {
    type Result = ();

    fn handle(&mut self, outbound: OutboundControl, ctx: &mut Self::Context) {
        match serde_json::to_string(&outbound.0) {
            Ok(text) => ctx.text(text),
            Err(err) => warn!("control frame serialize failed: {}", err),
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsIngress {
    fn handle(
        &mut self,
        ws_message: Result<ws::Message, ws::ProtocolError>,
        ctx: &mut Self::Context,
    ) {
        self.mark_activity();
        match ws_message {
            Ok(ws::Message::Binary(bin)) => {
                let Some(user) = self.user.clone() else {
                    return;
                };
                if bin.len() < 2 {
                    warn!("undersized engine frame ignored");
                    return;
                }
                let raw = RawPacket {
                    channel: bin[0],
                    data: bin[1..].to_vec(),
                };
                let cluster = self.cluster.clone();
                tokio::spawn(async move {
                    cluster.route_client_frame(&user, raw).await;
                });
            }
            Ok(ws::Message::Text(text)) => {
                debug!("control frame {}", text);
                let Some(user) = self.user.clone() else {
                    return;
                };
                match serde_json::from_str::<ControlFrame>(&text) {
                    Ok(ControlFrame::Connect { name }) => {
                        let cluster = self.cluster.clone();
                        tokio::spawn(async move {
                            if let Err(err) = cluster.connect_user(&user, &name).await {
                                user.message(&format!("could not connect: {}", err));
                            }
                        });
                    }
                    Ok(ControlFrame::SetName { name }) => {
                        user.set_name(&name);
                        if let Some(client) = user.server_client() {
                            *client.name.write().unwrap() = name;
                        }
                    }
                    Ok(ControlFrame::ServerConnected { .. }) => {
                        warn!("client sent a gateway-only control frame");
                    }
                    Err(err) => {
                        warn!("parse err ignored {}", err);
                    }
                }
            }
            Ok(ws::Message::Close(_reason)) => {
                debug!("close websocket request");
                ctx.stop();
            }
            Ok(ws::Message::Ping(ping_data)) => {
                ctx.pong(&ping_data);
            }
            Ok(ws::Message::Pong(_)) => {
                // mark_activity already ran for this frame
            }
            _ => {
                warn!("websocket protocol error");
                ctx.stop()
            }
        }
    }
}

/// Routes an incoming HTTP upgrade to a `WsIngress` actor.
pub async fn ws_index(
    r: HttpRequest,
    stream: web::Payload,
    cluster: web::Data<Arc<Cluster>>,
) -> Result<HttpResponse, Error> {
    let host = r
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_owned());
    ws::start(WsIngress::new(cluster.get_ref().clone(), host), &r, stream)
}

/// Events surfaced by the external reliable-datagram transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connect { peer: u64, host: String },
    Receive { peer: u64, channel: u8, data: Vec<u8> },
    Disconnect { peer: u64 },
}

/// An outgoing datagram handed back to the transport.
pub type TransportSend = (u64, u8, Vec<u8>);

pub struct DatagramConnection {
    session: Session,
    host: String,
    status: RwLock<NetworkStatus>,
}

impl DatagramConnection {
    fn set_status(&self, status: NetworkStatus) {
        *self.status.write().unwrap() = status;
    }
}

impl Connection for DatagramConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Datagram
    }

    fn device_type(&self) -> &str {
        "desktop"
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn network_status(&self) -> NetworkStatus {
        *self.status.read().unwrap()
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn connect(&self, server_name: &str, _hidden: bool, _should_copy: bool) {
        // Native clients follow the gateway's own handshake traffic; there
        // is no side channel to announce the binding on.
        debug!("datagram peer bound to {}", server_name);
    }
}

/// Adapts the transport's event stream onto the cluster: one user per
/// peer, frames routed like any other ingress.
pub async fn poll_transport(
    cluster: Arc<Cluster>,
    session: Session,
    mut events: mpsc::Receiver<TransportEvent>,
    sender: mpsc::UnboundedSender<TransportSend>,
) {
    let mut peers: HashMap<u64, (Arc<DatagramConnection>, Arc<crate::user::User>)> =
        HashMap::new();

    loop {
        let event = tokio::select! {
            _ = session.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            TransportEvent::Connect { peer, host } => {
                let connection = Arc::new(DatagramConnection {
                    session: Session::new(),
                    host,
                    status: RwLock::new(NetworkStatus::Connected),
                });
                let user = match cluster.accept(connection.clone()) {
                    Ok(user) => user,
                    Err(err) => {
                        warn!("rejecting datagram peer {}: {}", peer, err);
                        continue;
                    }
                };

                let mut outgoing = user.take_outgoing().expect("outgoing queue already taken");
                let writer = user.clone();
                let out = sender.clone();
                tokio::spawn(async move {
                    while let Some(packet) = outgoing.recv().await {
                        let mut encoded = protocol::Packet::new();
                        for message in &packet.messages {
                            writer.to_proxy.publish(message.clone());
                            message.encode(&mut encoded);
                        }
                        let data = encoded.into_bytes();
                        writer.raw_to.publish(RawPacket {
                            channel: packet.channel,
                            data: data.clone(),
                        });
                        let result = out
                            .send((peer, packet.channel, data))
                            .map_err(|_| crate::user::UserError::SendDropped);
                        let _ = packet.done.send(result);
                    }
                });

                // Native clients land in the default server right away;
                // they can ask for a space once they are in.
                let joined = user.clone();
                let gateway = cluster.clone();
                tokio::spawn(async move {
                    if let Err(err) = gateway.connect_user(&joined, "").await {
                        warn!("datagram peer {} could not join: {}", peer, err);
                    }
                });

                peers.insert(peer, (connection, user));
            }
            TransportEvent::Receive {
                peer,
                channel,
                data,
            } => {
                let Some((_, user)) = peers.get(&peer) else {
                    debug!("frame from unknown peer {}", peer);
                    continue;
                };
                cluster
                    .route_client_frame(user, RawPacket { channel, data })
                    .await;
            }
            TransportEvent::Disconnect { peer } => {
                if let Some((connection, _)) = peers.remove(&peer) {
                    connection.set_status(NetworkStatus::Disconnected);
                    connection.session.cancel();
                }
            }
        }
    }
}
