//! Scheduler-owned wrappers pairing a resource with session and timing state
//!
//! A wrapper is created the first time a scan observes its resource and is
//! dropped once a later scan no longer returns it or the resource turns
//! out to be deleted.
//!
//! ## Ownership
//!
//! A wrapper travels through submit queue -> worker -> finish queue -> run
//! buffer -> submit queue, and is in exactly one of those places at any
//! time. That is what keeps session operations of one resource from ever
//! running concurrently with themselves; the mutexes inside wrappers are
//! never contended by two jobs.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ResourceResult;
use crate::resource::Resource;

pub mod metrics_target;
pub mod monitorable;

pub use metrics_target::MetricsTargetResource;
pub use monitorable::MonitorableResource;

/// Start/finish timestamps of the job currently or last run for a wrapper
///
/// `started_at` is set only while a worker is running the job; it is what
/// stuck-job detection looks at.
#[derive(Debug, Default)]
pub struct JobTiming {
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl JobTiming {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_started_at(&self, at: Option<DateTime<Utc>>) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_finished_at(&self, at: Option<DateTime<Utc>>) {
        *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

/// Behaviour the worker pool needs from a wrapper
#[async_trait]
pub trait MonitorWrapper: Send + Sync + 'static {
    fn resource(&self) -> &Arc<dyn Resource>;

    fn resource_id(&self) -> Uuid {
        self.resource().id()
    }

    fn timing(&self) -> &JobTiming;

    /// Set once the resource was found to no longer exist
    fn is_deleted(&self) -> bool;

    /// Make sure a usable session is open before the job runs
    async fn open_resource_session(&self) -> ResourceResult<()>;

    /// Close the session if open; idempotent and never fails
    async fn close_resource_session(&self);

    /// Replace the attached resources with `attached`
    ///
    /// Wrappers that do not support attachments ignore this.
    fn replace_attached(&self, attached: Vec<Arc<dyn Resource>>) {
        let _ = attached;
    }

    fn attached_count(&self) -> usize {
        0
    }
}
