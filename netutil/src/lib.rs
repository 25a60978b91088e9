// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod session;
pub mod topic;

pub use session::Session;
pub use topic::{Subscriber, Topic};
