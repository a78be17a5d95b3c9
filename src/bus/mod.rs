//! Broadcast publish/subscribe channels used for partition gossip
//!
//! The repartitioner only needs two operations: publish a payload on a
//! named channel, and receive every payload published on that channel
//! after subscribing (including its own). Any transport offering that
//! works; there is no ordering or delivery guarantee beyond best effort.
//!
//! ## Backends
//!
//! - **LocalBus**: in-process `tokio::sync::broadcast`, for single-host
//!   deployments and tests
//! - **PgBus** (feature `pg-bus`): PostgreSQL `LISTEN`/`NOTIFY`

use async_trait::async_trait;

pub mod local;
#[cfg(feature = "pg-bus")]
pub mod postgres;

pub use local::LocalBus;
#[cfg(feature = "pg-bus")]
pub use postgres::PgBus;

/// A broadcast channel transport
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload` to every current subscriber of `channel`
    async fn notify(&self, channel: &str, payload: &str) -> anyhow::Result<()>;

    /// Subscribe to `channel`
    ///
    /// Returns once the subscription is active, so a `notify` issued after
    /// this call returns is guaranteed to be observable by it.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Box<dyn Subscription>>;
}

/// An active subscription to one channel
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next payload
    ///
    /// `Ok(None)` means the channel is gone and no further messages will
    /// arrive. Implementations must be cancel-safe, callers wrap this in a
    /// timeout.
    async fn next_message(&mut self) -> anyhow::Result<Option<String>>;
}
