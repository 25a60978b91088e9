// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Records of the out-of-band extended server-info protocol. A request
//! whose leading integer is nonzero is a standard info probe; a zero
//! selects one of the `EXT_*` commands.

use crate::packet::{Packet, PacketError};

pub const EXT_ACK: i32 = -1;
pub const EXT_VERSION: i32 = 105;
pub const EXT_NO_ERROR: i32 = 0;
pub const EXT_ERROR: i32 = 1;
pub const EXT_PLAYERSTATS_RESP_IDS: i32 = -10;
pub const EXT_PLAYERSTATS_RESP_STATS: i32 = -11;
pub const EXT_UPTIME: i32 = 0;
pub const EXT_PLAYERSTATS: i32 = 1;
pub const EXT_TEAMSCORE: i32 = 2;

/// Per-player stats block of an `EXT_PLAYERSTATS` response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientExtInfo {
    pub client: i32,
    pub ping: i32,
    pub name: String,
    pub team: String,
    pub frags: i32,
    pub flags: i32,
    pub deaths: i32,
    pub teamkills: i32,
    pub damage: i32,
    pub health: i32,
    pub armour: i32,
    pub gun_select: i32,
    pub privilege: i32,
    pub state: i32,
    pub ip: [u8; 3],
}

impl ClientExtInfo {
    pub fn put(&self, p: &mut Packet) {
        p.put_int(self.client);
        p.put_int(self.ping);
        p.put_string(&self.name);
        p.put_string(&self.team);
        p.put_int(self.frags);
        p.put_int(self.flags);
        p.put_int(self.deaths);
        p.put_int(self.teamkills);
        p.put_int(self.damage);
        p.put_int(self.health);
        p.put_int(self.armour);
        p.put_int(self.gun_select);
        p.put_int(self.privilege);
        p.put_int(self.state);
        p.put_bytes(&self.ip);
    }

    pub fn get(p: &mut Packet) -> Result<Self, PacketError> {
        Ok(Self {
            client: p.get_int()?,
            ping: p.get_int()?,
            name: p.get_string()?,
            team: p.get_string()?,
            frags: p.get_int()?,
            flags: p.get_int()?,
            deaths: p.get_int()?,
            teamkills: p.get_int()?,
            damage: p.get_int()?,
            health: p.get_int()?,
            armour: p.get_int()?,
            gun_select: p.get_int()?,
            privilege: p.get_int()?,
            state: p.get_int()?,
            ip: [p.get_byte()?, p.get_byte()?, p.get_byte()?],
        })
    }
}

/// Status block of a standard info probe response.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerInfo {
    pub num_clients: i32,
    pub game_paused: bool,
    pub game_mode: i32,
    /// Seconds.
    pub time_left: i32,
    pub max_clients: i32,
    pub password_mode: i32,
    pub game_speed: i32,
    pub map: String,
    pub description: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            num_clients: 0,
            game_paused: false,
            game_mode: 0,
            time_left: 0,
            max_clients: 0,
            password_mode: 0,
            game_speed: 100,
            map: String::new(),
            description: String::new(),
        }
    }
}

impl ServerInfo {
    /// Decodes the attribute section of a probe response (everything after
    /// the echoed request bytes).
    pub fn get(p: &mut Packet) -> Result<Self, PacketError> {
        let num_clients = p.get_int()?;
        let num_attributes = p.get_int()?;
        let _protocol = p.get_int()?;
        let game_mode = p.get_int()?;
        let time_left = p.get_int()?;
        let max_clients = p.get_int()?;
        let password_mode = p.get_int()?;
        let (game_paused, game_speed) = if num_attributes == 7 {
            (p.get_int()? != 0, p.get_int()?)
        } else {
            (false, 100)
        };
        Ok(Self {
            num_clients,
            game_paused,
            game_mode,
            time_left,
            max_clients,
            password_mode,
            game_speed,
            map: p.get_string()?,
            description: p.get_string()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TeamScore {
    pub team: String,
    pub score: i32,
    pub bases: Vec<i32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TeamInfo {
    pub is_deathmatch: bool,
    pub game_mode: i32,
    /// Seconds.
    pub time_left: i32,
    pub scores: Vec<TeamScore>,
}

impl TeamInfo {
    pub fn put(&self, p: &mut Packet) {
        p.put_int(self.is_deathmatch as i32);
        p.put_int(self.game_mode);
        p.put_int(self.time_left);
        for score in &self.scores {
            p.put_string(&score.team);
            p.put_int(score.score);
            if score.bases.is_empty() {
                p.put_int(-1);
                continue;
            }
            p.put_int(score.bases.len() as i32);
            for base in &score.bases {
                p.put_int(*base);
            }
        }
    }

    pub fn get(p: &mut Packet) -> Result<Self, PacketError> {
        let mut info = Self {
            is_deathmatch: p.get_int()? != 0,
            game_mode: p.get_int()?,
            time_left: p.get_int()?,
            scores: Vec::new(),
        };
        while !p.is_drained() {
            let team = p.get_string()?;
            let score = p.get_int()?;
            let num_bases = p.get_int()?;
            let mut bases = Vec::new();
            if num_bases >= 0 {
                for _ in 0..num_bases {
                    bases.push(p.get_int()?);
                }
            }
            info.scores.push(TeamScore { team, score, bases });
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_scores_terminate_baseless_records() {
        let info = TeamInfo {
            is_deathmatch: false,
            game_mode: 12,
            time_left: 300,
            scores: vec![
                TeamScore {
                    team: "good".to_owned(),
                    score: 3,
                    bases: vec![1, 4],
                },
                TeamScore {
                    team: "evil".to_owned(),
                    score: 1,
                    bases: vec![],
                },
            ],
        };
        let mut p = Packet::new();
        info.put(&mut p);
        assert_eq!(TeamInfo::get(&mut p).unwrap(), info);
    }

    #[test]
    fn player_stats_carry_the_ip_prefix() {
        let stats = ClientExtInfo {
            client: 9,
            ping: 32,
            name: "fuzz".to_owned(),
            team: "good".to_owned(),
            health: 100,
            ip: [10, 0, 1],
            ..Default::default()
        };
        let mut p = Packet::new();
        stats.put(&mut p);
        assert_eq!(ClientExtInfo::get(&mut p).unwrap(), stats);
    }
}
