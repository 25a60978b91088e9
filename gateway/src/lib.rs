// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The gateway: accepts clients over a reliable-datagram transport or the
//! WebSocket bridge, binds each to a game-server instance, relays traffic
//! between peers on the same instance, answers out-of-band server-info
//! probes, and hosts named spaces with persistent edit state.

pub mod assets;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod gameserver;
pub mod ingress;
pub mod relay;
pub mod serverinfo;
pub mod spaces;
pub mod user;
