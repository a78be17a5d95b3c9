//! PostgreSQL `LISTEN`/`NOTIFY` transport

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use tracing::debug;

use super::{PubSub, Subscription};

/// Pub/sub over a PostgreSQL database shared by all cooperating processes
#[derive(Debug, Clone)]
pub struct PgBus {
    pool: PgPool,
}

impl PgBus {
    /// Connect to the database at `url`
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .context("failed to connect to pub/sub database")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PubSub for PgBus {
    async fn notify(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to NOTIFY on {channel}"))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Box<dyn Subscription>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("failed to open LISTEN connection")?;
        listener
            .listen(channel)
            .await
            .with_context(|| format!("failed to LISTEN on {channel}"))?;
        debug!("listening on {channel}");

        Ok(Box::new(PgSubscription { listener }))
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn next_message(&mut self) -> anyhow::Result<Option<String>> {
        let notification = self
            .listener
            .recv()
            .await
            .context("failed to receive notification")?;
        Ok(Some(notification.payload().to_string()))
    }
}
