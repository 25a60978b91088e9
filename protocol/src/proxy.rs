// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::message::{Message, MessageCode};
use netutil::{Session, Subscriber, Topic};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProxyError {
    #[error("timed out waiting for message")]
    Timeout,
    #[error("session ended while waiting for message")]
    Cancelled,
    #[error("message stream closed")]
    Closed,
}

/// A code-addressable view over one direction of a client's message
/// stream. One proxy carries messages *from* the client, its twin carries
/// messages *to* the client; consumers wait for the next message of a
/// given code without disturbing other subscribers.
pub struct MessageProxy {
    topic: Topic<Message>,
}

impl MessageProxy {
    pub fn new() -> Self {
        Self { topic: Topic::new() }
    }

    pub fn publish(&self, message: Message) {
        self.topic.publish(message);
    }

    pub fn subscribe(&self) -> Subscriber<Message> {
        self.topic.subscribe()
    }

    /// Returns the next message with `code`, abandoning the wait on session
    /// cancellation or after `duration`.
    pub async fn next_timeout(
        &self,
        session: &Session,
        duration: Duration,
        code: MessageCode,
    ) -> Result<Message, ProxyError> {
        // Subscribe before yielding so no matching message can slip by.
        let mut subscriber = self.subscribe();

        let wait = async {
            loop {
                match subscriber.recv().await {
                    Some(message) if message.code() == code => break Ok(message),
                    Some(_) => continue,
                    None => break Err(ProxyError::Closed),
                }
            }
        };

        tokio::select! {
            _ = session.cancelled() => Err(ProxyError::Cancelled),
            result = timeout(duration, wait) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ProxyError::Timeout),
            },
        }
    }
}

impl Default for MessageProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_code_wins_over_noise() {
        let proxy = std::sync::Arc::new(MessageProxy::new());
        let session = Session::new();

        let waiter = proxy.clone();
        let handle = tokio::spawn(async move {
            waiter
                .next_timeout(&session, Duration::from_secs(1), MessageCode::Text)
                .await
        });
        // Let the waiter subscribe before anything is published.
        tokio::task::yield_now().await;

        proxy.publish(Message::ServerMessage {
            text: "noise".to_owned(),
        });
        proxy.publish(Message::Text {
            text: "signal".to_owned(),
        });

        assert_eq!(
            handle.await.unwrap(),
            Ok(Message::Text {
                text: "signal".to_owned()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_a_match() {
        let proxy = MessageProxy::new();
        let session = Session::new();
        let result = proxy
            .next_timeout(&session, Duration::from_secs(5), MessageCode::Pong)
            .await;
        assert_eq!(result, Err(ProxyError::Timeout));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let proxy = MessageProxy::new();
        let session = Session::new();
        session.cancel();
        let result = proxy
            .next_timeout(&session, Duration::from_secs(5), MessageCode::Pong)
            .await;
        assert_eq!(result, Err(ProxyError::Cancelled));
    }
}
