use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::{PubSub, Subscription};

/// Buffered messages per channel before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// In-process pub/sub bus
///
/// Cloning a `LocalBus` is not supported; share it behind an `Arc` so all
/// participants see the same channels.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for LocalBus {
    async fn notify(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        // Publishing without subscribers is not an error.
        match self.sender(channel).send(payload.to_string()) {
            Ok(receivers) => trace!("published on {channel} to {receivers} receivers"),
            Err(_) => trace!("no receivers on {channel}"),
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Box<dyn Subscription>> {
        Ok(Box::new(LocalSubscription {
            channel: channel.to_string(),
            receiver: self.sender(channel).subscribe(),
        }))
    }
}

struct LocalSubscription {
    channel: String,
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for LocalSubscription {
    async fn next_message(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("subscriber on {} lagged, skipped {skipped} messages", self.channel);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
