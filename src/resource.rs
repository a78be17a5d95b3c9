//! Capability contracts for monitored resources
//!
//! The scheduler never branches on what kind of resource it is looking at
//! (host, VM, database server, ...). Every kind implements [`Resource`],
//! and every data source listing resources of some kind implements
//! [`ResourceType`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ResourceResult;
use crate::repartitioner::IdRange;
use crate::tsdb::TsdbClient;

/// Outcome of a single health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reading {
    Up,
    Down,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Up => write!(f, "up"),
            Reading::Down => write!(f, "down"),
        }
    }
}

/// A health reading together with its repeat/change history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    pub reading: Reading,

    /// How many consecutive probes returned this reading (starts at 1)
    pub reading_rpt: u64,

    /// When the reading last changed
    pub reading_chg: DateTime<Utc>,

    /// Probe-specific extras (e.g. last known WAL position)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Pulse {
    /// Fold a new reading into the previous pulse
    pub fn aggregate(
        previous: Option<&Pulse>,
        reading: Reading,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Pulse {
        Self::aggregate_at(previous, reading, data, Utc::now())
    }

    pub fn aggregate_at(
        previous: Option<&Pulse>,
        reading: Reading,
        data: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Pulse {
        match previous {
            Some(previous) if previous.reading == reading => Pulse {
                reading,
                reading_rpt: previous.reading_rpt + 1,
                reading_chg: previous.reading_chg,
                data,
            },
            _ => Pulse {
                reading,
                reading_rpt: 1,
                reading_chg: now,
                data,
            },
        }
    }

    pub fn is_up(&self) -> bool {
        self.reading == Reading::Up
    }
}

/// An open transport session to a resource
///
/// Sessions are expensive to open and are reused across poll cycles. A
/// session may be shared between a primary resource and the resources
/// attached to it.
#[async_trait]
pub trait Session: Send + Sync {
    /// Drive the transport's own event processing while `running` is set
    ///
    /// Only called for resources whose [`Resource::needs_event_loop`] is
    /// true. Must return promptly once `running` is cleared.
    async fn process_events(&self, running: Arc<AtomicBool>) -> ResourceResult<()> {
        let _ = running;
        Ok(())
    }

    /// Tear the session down
    async fn close(&self) -> ResourceResult<()>;

    /// Whether the session was invalidated (closed locally or by the peer)
    fn is_closed(&self) -> bool;

    /// Access to the concrete session type for probes
    fn as_any(&self) -> &dyn Any;
}

pub type SessionRef = Arc<dyn Session>;

/// A monitored resource of any kind
#[async_trait]
pub trait Resource: Send + Sync {
    fn id(&self) -> Uuid;

    /// Short kind name for logs, e.g. `vm_host`
    fn kind(&self) -> &str;

    /// Refresh the resource from its source of truth
    ///
    /// Returns [`ResourceError::NotFound`](crate::error::ResourceError::NotFound)
    /// once the resource was deleted.
    async fn reload(&self) -> ResourceResult<()>;

    async fn open_health_session(&self) -> ResourceResult<SessionRef>;

    async fn open_metrics_session(&self) -> ResourceResult<SessionRef>;

    /// Whether pulse checks need [`Session::process_events`] running alongside
    fn needs_event_loop(&self) -> bool {
        false
    }

    async fn check_pulse(
        &self,
        session: &SessionRef,
        previous: Option<&Pulse>,
    ) -> ResourceResult<Pulse>;

    /// Export metrics through the session, returning the number of samples
    async fn export_metrics(&self, session: &SessionRef, tsdb: &TsdbClient)
    -> ResourceResult<usize>;

    /// Whether the resource keeps a failure counter bumped by failed jobs
    fn has_failure_counter(&self) -> bool {
        false
    }

    async fn increment_failure_counter(&self) -> ResourceResult<()> {
        Ok(())
    }
}

/// A data source listing all resources of one category
#[async_trait]
pub trait ResourceType: Send + Sync {
    fn name(&self) -> &str;

    /// Every resource whose id falls within `range`
    fn stream_in_range<'a>(
        &'a self,
        range: &'a IdRange,
    ) -> BoxStream<'a, anyhow::Result<Arc<dyn Resource>>>;

    /// Current population, used once to size the submit queue
    async fn estimate_count(&self) -> anyhow::Result<usize>;

    /// Whether resources of this type may carry attached resources
    fn hosts_attachments(&self) -> bool {
        false
    }

    /// Tasks waiting for a connection to this data source
    fn connections_waiting(&self) -> usize {
        0
    }
}

/// A data source listing resources checked through their host's session
pub trait AttachedResourceType: Send + Sync {
    /// `(host_id, resource)` pairs for every host whose id is within `range`
    fn stream_attached<'a>(
        &'a self,
        range: &'a IdRange,
    ) -> BoxStream<'a, anyhow::Result<(Uuid, Arc<dyn Resource>)>>;
}
