// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::packet::{Packet, PacketError};

/// Network message codes, in wire order.
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MessageCode {
    Connect = 0,
    ServInfo,
    Welcome,
    InitClient,
    Pos,
    Text,
    Sound,
    ClientDisconnected,
    Shoot,
    Explode,
    Suicide,
    Died,
    Damage,
    HitPush,
    ShotFx,
    ExplodeFx,
    TrySpawn,
    SpawnState,
    Spawn,
    ForceDeath,
    GunSelect,
    Taunt,
    MapChange,
    MapVote,
    TeamInfo,
    ItemSpawn,
    ItemPickup,
    ItemAcc,
    Teleport,
    JumpPad,
    Ping,
    Pong,
    ClientPing,
    TimeUp,
    ForceIntermission,
    ServerMessage,
    ItemList,
    Resume,
    EditMode,
    EditEnt,
    EditFace,
    EditTexture,
    EditMaterial,
    Flip,
    Copy,
    Paste,
    Rotate,
    Replace,
    DelCube,
    Remip,
    EditVSlot,
    Undo,
    Redo,
    NewMap,
    GetMap,
    SendMap,
    Clipboard,
    EditVar,
    MasterMode,
    Kick,
    ClearBans,
    CurrentMaster,
    Spectator,
    SetMaster,
    SetTeam,
    Bases,
    BaseInfo,
    BaseScore,
    RepAmmo,
    BaseRegen,
    Announce,
    ListDemos,
    SendDemoList,
    GetDemo,
    SendDemo,
    DemoPlayback,
    RecordDemo,
    StopDemo,
    ClearDemos,
    TakeFlag,
    ReturnFlag,
    ResetFlag,
    InvisFlag,
    TryDropFlag,
    DropFlag,
    ScoreFlag,
    InitFlags,
    SayTeam,
    ClientPacket,
    AuthTry,
    AuthKick,
    AuthChallenge,
    AuthAnswer,
    RequestAuth,
    PauseGame,
    GameSpeed,
    AddBot,
    DelBot,
    InitAi,
    FromAi,
    BotLimit,
    BotBalance,
    MapCrc,
    CheckMaps,
    SwitchName,
    SwitchModel,
    SwitchTeam,
}

impl MessageCode {
    const COUNT: usize = MessageCode::SwitchTeam as usize + 1;

    /// Every code in wire order; the array length pins the table to the
    /// enum, so inserting or removing a variant fails to compile here
    /// instead of silently shifting codes.
    const ALL: [MessageCode; Self::COUNT] = {
        use MessageCode::*;
        [
            Connect, ServInfo, Welcome, InitClient, Pos, Text, Sound, ClientDisconnected,
            Shoot, Explode, Suicide, Died, Damage, HitPush, ShotFx, ExplodeFx, TrySpawn,
            SpawnState, Spawn, ForceDeath, GunSelect, Taunt, MapChange, MapVote, TeamInfo,
            ItemSpawn, ItemPickup, ItemAcc, Teleport, JumpPad, Ping, Pong, ClientPing,
            TimeUp, ForceIntermission, ServerMessage, ItemList, Resume, EditMode, EditEnt,
            EditFace, EditTexture, EditMaterial, Flip, Copy, Paste, Rotate, Replace,
            DelCube, Remip, EditVSlot, Undo, Redo, NewMap, GetMap, SendMap, Clipboard,
            EditVar, MasterMode, Kick, ClearBans, CurrentMaster, Spectator, SetMaster,
            SetTeam, Bases, BaseInfo, BaseScore, RepAmmo, BaseRegen, Announce, ListDemos,
            SendDemoList, GetDemo, SendDemo, DemoPlayback, RecordDemo, StopDemo,
            ClearDemos, TakeFlag, ReturnFlag, ResetFlag, InvisFlag, TryDropFlag, DropFlag,
            ScoreFlag, InitFlags, SayTeam, ClientPacket, AuthTry, AuthKick, AuthChallenge,
            AuthAnswer, RequestAuth, PauseGame, GameSpeed, AddBot, DelBot, InitAi, FromAi,
            BotLimit, BotBalance, MapCrc, CheckMaps, SwitchName, SwitchModel, SwitchTeam,
        ]
    };

    pub fn from_i32(code: i32) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    /// Whether a client-originated message mutates the shared map state and
    /// must be mirrored into a space's editing state.
    pub fn is_edit(self) -> bool {
        use MessageCode::*;
        matches!(
            self,
            EditEnt
                | EditFace
                | EditTexture
                | EditMaterial
                | Flip
                | Copy
                | Paste
                | Rotate
                | Replace
                | DelCube
                | Remip
                | EditVSlot
                | Undo
                | Redo
                | NewMap
                | EditVar
        )
    }
}

/// The messages the gateway routes or fabricates itself. Everything else
/// passes through as `Raw`.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A positional update; the payload stays opaque to the gateway.
    Position { data: Vec<u8> },
    /// Chat from a client.
    Text { text: String },
    /// Server-to-client chat line.
    ServerMessage { text: String },
    /// Tells a client to forget a peer.
    ClientDisconnected { client: i32 },
    /// Header prepended to relayed broadcast batches; length is handled by
    /// the transport framing.
    ClientPacket { client: i32 },
    /// Server handshake banner.
    ServInfo {
        client: i32,
        protocol: i32,
        session_id: i32,
        has_password: bool,
        description: String,
    },
    MapChange { name: String, mode: i32, has_items: bool },
    NewMap { size: i32 },
    /// Any other message, carried untouched.
    Raw { code: MessageCode, data: Vec<u8> },
}

impl Message {
    pub fn code(&self) -> MessageCode {
        match self {
            Message::Position { .. } => MessageCode::Pos,
            Message::Text { .. } => MessageCode::Text,
            Message::ServerMessage { .. } => MessageCode::ServerMessage,
            Message::ClientDisconnected { .. } => MessageCode::ClientDisconnected,
            Message::ClientPacket { .. } => MessageCode::ClientPacket,
            Message::ServInfo { .. } => MessageCode::ServInfo,
            Message::MapChange { .. } => MessageCode::MapChange,
            Message::NewMap { .. } => MessageCode::NewMap,
            Message::Raw { code, .. } => *code,
        }
    }

    pub fn encode(&self, p: &mut Packet) {
        p.put_int(self.code() as i32);
        match self {
            Message::Position { data } => p.put_bytes(data),
            Message::Text { text } | Message::ServerMessage { text } => p.put_string(text),
            Message::ClientDisconnected { client } | Message::ClientPacket { client } => {
                p.put_int(*client)
            }
            Message::ServInfo {
                client,
                protocol,
                session_id,
                has_password,
                description,
            } => {
                p.put_int(*client);
                p.put_int(*protocol);
                p.put_int(*session_id);
                p.put_int(*has_password as i32);
                p.put_string(description);
            }
            Message::MapChange {
                name,
                mode,
                has_items,
            } => {
                p.put_string(name);
                p.put_int(*mode);
                p.put_int(*has_items as i32);
            }
            Message::NewMap { size } => p.put_int(*size),
            Message::Raw { data, .. } => p.put_bytes(data),
        }
    }

    /// Decodes one message from the front of `p`. Unknown codes consume the
    /// remainder of the packet, matching the transport's one-message-per-
    /// frame framing for anything the gateway does not interpret.
    pub fn decode(p: &mut Packet) -> Result<Message, PacketError> {
        let raw_code = p.get_int()?;
        let code = MessageCode::from_i32(raw_code).ok_or(PacketError::UnexpectedEnd)?;
        Ok(match code {
            MessageCode::Pos => Message::Position {
                data: p.take_remaining(),
            },
            MessageCode::Text => Message::Text {
                text: p.get_string()?,
            },
            MessageCode::ServerMessage => Message::ServerMessage {
                text: p.get_string()?,
            },
            MessageCode::ClientDisconnected => Message::ClientDisconnected {
                client: p.get_int()?,
            },
            MessageCode::ClientPacket => Message::ClientPacket {
                client: p.get_int()?,
            },
            MessageCode::MapChange => Message::MapChange {
                name: p.get_string()?,
                mode: p.get_int()?,
                has_items: p.get_int()? != 0,
            },
            MessageCode::NewMap => Message::NewMap { size: p.get_int()? },
            _ => Message::Raw {
                code,
                data: p.take_remaining(),
            },
        })
    }
}

/// Cube color markup helpers for user-facing strings.
pub mod color {
    pub fn green(s: &str) -> String {
        format!("\u{c}0{}\u{c}7", s)
    }

    pub fn blue(s: &str) -> String {
        format!("\u{c}1{}\u{c}7", s)
    }

    pub fn yellow(s: &str) -> String {
        format!("\u{c}2{}\u{c}7", s)
    }

    pub fn red(s: &str) -> String {
        format!("\u{c}3{}\u{c}7", s)
    }

    pub fn magenta(s: &str) -> String {
        format!("\u{c}5{}\u{c}7", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_contiguous() {
        assert_eq!(MessageCode::from_i32(0), Some(MessageCode::Connect));
        assert_eq!(MessageCode::from_i32(4), Some(MessageCode::Pos));
        assert_eq!(
            MessageCode::from_i32(MessageCode::ClientPacket as i32),
            Some(MessageCode::ClientPacket)
        );
        assert_eq!(MessageCode::from_i32(-1), None);
        assert_eq!(MessageCode::from_i32(1000), None);
    }

    #[test]
    fn text_roundtrip() {
        let mut p = Packet::new();
        Message::ServerMessage {
            text: "map cycling".to_owned(),
        }
        .encode(&mut p);
        assert_eq!(
            Message::decode(&mut p).unwrap(),
            Message::ServerMessage {
                text: "map cycling".to_owned()
            }
        );
    }

    #[test]
    fn raw_decode_consumes_the_packet() {
        let mut p = Packet::new();
        p.put_int(MessageCode::Shoot as i32);
        p.put_bytes(&[1, 2, 3]);
        let decoded = Message::decode(&mut p).unwrap();
        assert!(matches!(
            decoded,
            Message::Raw {
                code: MessageCode::Shoot,
                ..
            }
        ));
        assert!(p.is_drained());
    }

    #[test]
    fn edit_codes_are_flagged() {
        assert!(MessageCode::EditFace.is_edit());
        assert!(MessageCode::NewMap.is_edit());
        assert!(!MessageCode::Text.is_edit());
        assert!(!MessageCode::Pos.is_edit());
    }
}
