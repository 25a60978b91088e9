// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use tokio_util::sync::CancellationToken;

/// A cancellation scope bound to a lifetime. Sessions nest: cancelling a
/// parent cancels every child, cancelling a child leaves the parent alone.
///
/// The gateway uses three levels: ingress connection > server binding >
/// space instance.
#[derive(Clone)]
pub struct Session {
    token: CancellationToken,
}

impl Session {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Creates a session cancelled whenever `self` is cancelled.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the session is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_cancellation_is_one_way() {
        let parent = Session::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
        other.cancelled().await;
    }
}
