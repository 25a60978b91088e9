// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use log::trace;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// How many values a subscriber may lag behind before its feed starts
/// dropping. Subscribers never exert backpressure on each other.
const SUBSCRIBER_BUFFER: usize = 64;

/// A fan-out broadcaster. Producers publish values; every subscriber
/// receives every value on its own bounded channel. A slow subscriber loses
/// its own overflow and nothing else.
pub struct Topic<T> {
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
}

pub struct Subscriber<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T: Clone> Topic<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscriber<T> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().unwrap().push(sender);
        Subscriber { receiver }
    }

    pub fn publish(&self, value: T) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sender| match sender.try_send(value.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("dropping value for lagging subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscriber<T> {
    /// Receives the next published value, or `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_value() {
        let topic = Topic::new();
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();

        for i in 0..5u32 {
            topic.publish(i);
        }

        for i in 0..5u32 {
            assert_eq!(a.recv().await, Some(i));
            assert_eq!(b.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_block_others() {
        let topic = Topic::new();
        let _stalled = topic.subscribe();
        let mut live = topic.subscribe();

        // Exceed the stalled subscriber's buffer.
        for i in 0..(SUBSCRIBER_BUFFER as u32 * 2) {
            topic.publish(i);
        }

        // The live subscriber still receives from the front of its own feed.
        assert_eq!(live.recv().await, Some(0));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_reaped() {
        let topic = Topic::new();
        let sub = topic.subscribe();
        drop(sub);
        topic.publish(1u32);
        assert_eq!(topic.subscriber_count(), 0);
    }
}
