// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ties the subsystems together: accepts ingress connections, resolves
//! connect targets to servers or spaces, and routes engine frames
//! between a user and its server's relay.

use crate::gameserver::ServerManager;
use crate::spaces::{SpaceError, SpaceManager};
use crate::user::{User, UserError, UserOrchestrator};
use log::{debug, info, warn};
use netutil::Session;
use protocol::{Message, MessageCode, Packet, RawPacket, PROTOCOL_VERSION};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error("no server is available")]
    NoServer,
}

pub struct Cluster {
    pub session: Session,
    pub orchestrator: Arc<UserOrchestrator>,
    pub manager: Arc<ServerManager>,
    pub spaces: Arc<SpaceManager>,
}

impl Cluster {
    pub fn new(
        session: Session,
        orchestrator: Arc<UserOrchestrator>,
        manager: Arc<ServerManager>,
        spaces: Arc<SpaceManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            orchestrator,
            manager,
            spaces,
        })
    }

    /// Registers an ingress connection as a user and arranges teardown of
    /// its server binding when the ingress session ends.
    pub fn accept(
        self: &Arc<Self>,
        connection: Arc<dyn crate::ingress::Connection>,
    ) -> Result<Arc<User>, UserError> {
        let user = self.orchestrator.add_user(connection)?;

        let watched = user.clone();
        tokio::spawn(async move {
            watched.session.cancelled().await;
            watched.disconnect_from_server();
        });

        Ok(user)
    }

    /// Resolves `target` and binds the user to it: the empty string means
    /// the first public server, then server aliases, then spaces.
    pub async fn connect_user(
        self: &Arc<Self>,
        user: &Arc<User>,
        target: &str,
    ) -> Result<bool, ClusterError> {
        let (server, name, is_space) = if target.is_empty() {
            (self.lobby()?, String::new(), false)
        } else if let Some(server) = self.manager.find_by_alias(target) {
            (server, target.to_owned(), false)
        } else {
            let instance = self.spaces.start_space(target)?;
            (instance.server.clone(), instance.id().to_owned(), true)
        };

        let mut admitted = user.connect_to_server(&server, &name, false, is_space)?;
        let connected = admitted.recv().await.unwrap_or(false);

        if !connected {
            debug!("[{}] connect to {} failed", user.session_prefix(), name);
            return Ok(false);
        }

        if is_space {
            user.set_space(self.spaces.find_instance(&server));
        }

        self.start_pipeline(user);
        self.greet(user);
        info!(
            "[{}] connected to {}",
            user.session_prefix(),
            server.reference()
        );
        Ok(true)
    }

    fn lobby(&self) -> Result<Arc<crate::gameserver::GameServer>, ClusterError> {
        if let Some(server) = self
            .manager
            .servers()
            .into_iter()
            .find(|server| !server.hidden)
        {
            return Ok(server);
        }
        self.manager
            .new_server(&self.session, "", false)
            .map_err(|_| ClusterError::NoServer)
    }

    /// Forwards the server's outgoing batches into the user's queue for
    /// as long as the binding lasts.
    fn start_pipeline(&self, user: &Arc<User>) {
        let Some(client) = user.server_client() else {
            return;
        };
        let session = user.server_session();
        let mut outgoing = client.subscribe();
        let user = user.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancelled() => return,
                    batch = outgoing.recv() => {
                        let Some((channel, messages)) = batch else { return };
                        let _ = user.send_channel(channel, messages);
                    }
                }
            }
        });
    }

    /// The handshake banner, plus releasing any chat queued during the
    /// connect.
    fn greet(&self, user: &Arc<User>) {
        let Some(server) = user.server() else {
            return;
        };
        let info = Message::ServInfo {
            client: user.id.into(),
            protocol: PROTOCOL_VERSION,
            session_id: 0,
            has_password: false,
            description: server.description(),
        };
        user.set_last_info(info.clone());
        let _ = user.send(vec![info]);
        user.restore_messages();
    }

    /// Decodes one ingress frame and feeds each message to the relay,
    /// the edit stream, or the command registry.
    pub async fn route_client_frame(&self, user: &Arc<User>, raw: RawPacket) {
        user.raw_from.publish(raw.clone());

        let mut packet = Packet::from_bytes(&raw.data);
        while !packet.is_drained() {
            let message = match Message::decode(&mut packet) {
                Ok(message) => message,
                Err(err) => {
                    warn!(
                        "[{}] dropping undecodable frame: {}",
                        user.session_prefix(),
                        err
                    );
                    return;
                }
            };
            user.from.publish(message.clone());
            self.route_message(user, message).await;
        }
    }

    async fn route_message(&self, user: &Arc<User>, message: Message) {
        let (Some(server), Some(client)) = (user.server(), user.server_client()) else {
            return;
        };

        let code = message.code();
        if code == MessageCode::Pos {
            let _ = client.publish_positions(vec![message]).await;
            return;
        }

        if code.is_edit() {
            server.handle_client_message(&client, &message);
            let _ = client.publish_packets(vec![message]).await;
            return;
        }

        if let Message::Text { text } = &message {
            if text.starts_with('#') {
                // Commands are between the user and the gateway.
                server.handle_client_message(&client, &message);
                return;
            }
        }

        let _ = client.publish_packets(vec![message]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresetConfig;
    use crate::ingress::{Connection, ConnectionKind, NetworkStatus};
    use crate::spaces::{FsEditStore, Verse};

    struct FakeConnection {
        session: Session,
    }

    impl Connection for FakeConnection {
        fn kind(&self) -> ConnectionKind {
            ConnectionKind::WebSocket
        }

        fn device_type(&self) -> &str {
            "test"
        }

        fn host(&self) -> String {
            "test.example".to_owned()
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
            Arc::new(crate::assets::AssetFetcher::from_maps(Vec::new())),
            Arc::new(FsEditStore::new(std::env::temp_dir().join("cluster-test"))),
        );
        Cluster::new(session, UserOrchestrator::new(), manager, spaces)
    }

    #[tokio::test]
    async fn default_connect_lands_in_the_lobby() {
        let cluster = cluster();
        let user = cluster
            .accept(Arc::new(FakeConnection {
                session: Session::new(),
            }))
            .unwrap();

        assert!(cluster.connect_user(&user, "").await.unwrap());
        assert!(user.server().is_some());

        // The banner went out and was recorded.
        assert!(matches!(
            user.last_info(),
            Some(Message::ServInfo { .. })
        ));
    }

    #[tokio::test]
    async fn positions_relay_between_two_users() {
        let cluster = cluster();
        let a = cluster
            .accept(Arc::new(FakeConnection {
                session: Session::new(),
            }))
            .unwrap();
        let b = cluster
            .accept(Arc::new(FakeConnection {
                session: Session::new(),
            }))
            .unwrap();

        let mut a_out = a.take_outgoing().unwrap();
        let mut b_out = b.take_outgoing().unwrap();

        assert!(cluster.connect_user(&a, "").await.unwrap());
        assert!(cluster.connect_user(&b, "").await.unwrap());

        let frame = {
            let mut p = Packet::new();
            Message::Position { data: vec![1, 2, 3] }.encode(&mut p);
            RawPacket {
                channel: 0,
                data: p.into_bytes(),
            }
        };
        cluster.route_client_frame(&a, frame).await;

        // Wait out a relay tick.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let mut b_got_position = false;
        while let Ok(packet) = b_out.try_recv() {
            if packet
                .messages
                .iter()
                .any(|m| m.code() == MessageCode::Pos)
            {
                b_got_position = true;
            }
        }
        assert!(b_got_position, "peer never saw the position");

        while let Ok(packet) = a_out.try_recv() {
            assert!(
                !packet.messages.iter().any(|m| m.code() == MessageCode::Pos),
                "author saw its own position"
            );
        }
    }

    #[tokio::test]
    async fn ingress_teardown_releases_the_binding() {
        let cluster = cluster();
        let session = Session::new();
        let user = cluster
            .accept(Arc::new(FakeConnection {
                session: session.clone(),
            }))
            .unwrap();

        assert!(cluster.connect_user(&user, "").await.unwrap());
        let server = user.server().unwrap();
        assert_eq!(server.num_clients(), 1);

        session.cancel();
        let mut waited = 0;
        while server.num_clients() > 0 && waited < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(server.num_clients(), 0);
        assert!(cluster.orchestrator.find_user(user.id).is_none());
    }
}
