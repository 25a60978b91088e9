// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The out-of-band server-info responder. Every response begins with the
//! request bytes it answers, because clients time the echo for RTT; the
//! rest is the framed status the probing browser renders.

use log::{debug, info, warn};
use netutil::Session;
use protocol::extinfo::{
    ClientExtInfo, ServerInfo, TeamInfo, EXT_ERROR, EXT_NO_ERROR, EXT_PLAYERSTATS,
    EXT_PLAYERSTATS_RESP_IDS, EXT_PLAYERSTATS_RESP_STATS, EXT_TEAMSCORE, EXT_UPTIME,
};
use protocol::{Packet, PacketError, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};

/// Re-registration cadence with the master directory.
const MASTER_INTERVAL: Duration = Duration::from_secs(60 * 60);

const DATAGRAM_MAX: usize = 1024;

#[derive(Debug, Error)]
pub enum InfoError {
    #[error("malformed info request")]
    Malformed(#[from] PacketError),
    #[error("unsupported extinfo command: {0}")]
    UnknownCommand(i32),
    #[error("master rejected registration: {0}")]
    MasterRejected(String),
    #[error("master closed without an acknowledgement")]
    MasterNoAck,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Anything that can answer an info probe: live game servers, the
/// gateway's aggregate view, or a fixture in tests.
pub trait InfoProvider: Send + Sync {
    fn server_info(&self) -> ServerInfo;
    fn client_info(&self) -> Vec<ClientExtInfo>;
    fn team_info(&self) -> TeamInfo;
    /// Seconds.
    fn uptime(&self) -> i32;
}

pub struct ServerInfoService {
    provider: Arc<dyn InfoProvider>,
    master: String,
}

impl ServerInfoService {
    pub fn new(provider: Arc<dyn InfoProvider>, master: &str) -> Self {
        Self {
            provider,
            master: master.to_owned(),
        }
    }

    /// Answers one datagram. Most requests produce a single response;
    /// player stats fan out into one datagram per targeted client.
    pub fn handle(&self, request: &[u8]) -> Result<Vec<Vec<u8>>, InfoError> {
        let mut request = Packet::from_bytes(request);
        // The echo keeps the bytes the cursor is about to consume.
        let echo = Packet::from_bytes(request.as_bytes());

        let millis = request.get_int()?;
        if millis != 0 {
            return Ok(vec![self.standard_probe(echo)]);
        }

        let command = request.get_int()?;
        match command {
            EXT_UPTIME => {
                let mut response = echo;
                response.put_int(self.provider.uptime());
                Ok(vec![response.into_bytes()])
            }
            EXT_PLAYERSTATS => {
                let client_num = request.get_int()?;
                Ok(self.player_stats(echo, client_num))
            }
            EXT_TEAMSCORE => {
                let mut response = echo;
                self.provider.team_info().put(&mut response);
                Ok(vec![response.into_bytes()])
            }
            other => Err(InfoError::UnknownCommand(other)),
        }
    }

    fn standard_probe(&self, mut response: Packet) -> Vec<u8> {
        let info = self.provider.server_info();
        let extended = info.game_speed != 100 || info.game_paused;

        response.put_int(info.num_clients);
        // The count of attributes that follow.
        response.put_int(if extended { 7 } else { 5 });
        response.put_int(PROTOCOL_VERSION);
        response.put_int(info.game_mode);
        response.put_int(info.time_left);
        response.put_int(info.max_clients);
        response.put_int(info.password_mode);
        if extended {
            response.put_int(info.game_paused as i32);
            response.put_int(info.game_speed);
        }
        response.put_string(&info.map);
        response.put_string(&info.description);
        response.into_bytes()
    }

    fn player_stats(&self, echo: Packet, client_num: i32) -> Vec<Vec<u8>> {
        let clients = self.provider.client_info();

        let mut response = echo;
        if client_num >= 0 && !clients.iter().any(|client| client.client == client_num) {
            response.put_int(EXT_ERROR);
            return vec![response.into_bytes()];
        }
        response.put_int(EXT_NO_ERROR);

        let mut out = Vec::with_capacity(clients.len() + 1);

        let mut ids = response.clone();
        ids.put_int(EXT_PLAYERSTATS_RESP_IDS);
        if client_num >= 0 {
            ids.put_int(client_num);
        } else {
            for client in &clients {
                ids.put_int(client.client);
            }
        }
        out.push(ids.into_bytes());

        for client in &clients {
            if client_num >= 0 && client.client != client_num {
                continue;
            }
            let mut stats = response.clone();
            stats.put_int(EXT_PLAYERSTATS_RESP_STATS);
            client.put(&mut stats);
            out.push(stats.into_bytes());
        }

        out
    }

    /// Binds the responder on `port` (the sibling of a game port) and
    /// answers probes until the session ends.
    pub async fn serve(
        self: Arc<Self>,
        session: Session,
        port: u16,
        register_master: bool,
    ) -> Result<(), InfoError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("serving server info on port {}", port);

        if register_master {
            // The master learns the game port, one below the responder's.
            tokio::spawn(poll_master(
                session.child(),
                self.master.clone(),
                port - 1,
            ));
        }

        let mut buf = [0u8; DATAGRAM_MAX];
        loop {
            tokio::select! {
                _ = session.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            warn!("info socket receive failed: {}", err);
                            continue;
                        }
                    };
                    match self.handle(&buf[..len]) {
                        Ok(responses) => {
                            for response in responses {
                                if let Err(err) = socket.send_to(&response, peer).await {
                                    warn!("info response to {} failed: {}", peer, err);
                                }
                            }
                        }
                        Err(err) => {
                            // Protocol violations get no response.
                            warn!("error handling server info: {}", err);
                        }
                    }
                }
            }
        }
    }
}

/// One registration exchange: `regserv`, then scan the reply lines for
/// the verdict.
pub async fn update_master(master: &str, port: u16) -> Result<(), InfoError> {
    let mut stream = TcpStream::connect(master).await?;
    stream
        .write_all(format!("regserv {}\n", port).as_bytes())
        .await?;

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.starts_with("failreg") {
            return Err(InfoError::MasterRejected(line));
        }
        if line.starts_with("succreg") {
            debug!("master accepted registration for port {}", port);
            return Ok(());
        }
    }
    Err(InfoError::MasterNoAck)
}

/// Keeps the master directory aware of this server, retrying hourly.
pub async fn poll_master(session: Session, master: String, port: u16) {
    let mut tick = tokio::time::interval(MASTER_INTERVAL);
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = tick.tick() => {
                if let Err(err) = update_master(&master, port).await {
                    warn!("failed to register with master {}: {}", master, err);
                }
            }
        }
    }
}
