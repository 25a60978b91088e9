// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod extinfo;
pub mod message;
pub mod packet;
pub mod proxy;

pub use message::{Message, MessageCode};
pub use packet::{Packet, PacketError};
pub use proxy::MessageProxy;

/// Cube engine network protocol revision spoken on both ingress transports.
pub const PROTOCOL_VERSION: i32 = 260;

/// The client number. Unique across the live user set, used both as the
/// relay key and as the on-wire client identifier.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u16);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<ClientId> for i32 {
    fn from(id: ClientId) -> i32 {
        id.0 as i32
    }
}

/// A raw wire packet together with the transport channel it travels on.
/// Channel 0 is unreliable (positions), channel 1 is reliable.
#[derive(Clone, Debug)]
pub struct RawPacket {
    pub channel: u8,
    pub data: Vec<u8>,
}
