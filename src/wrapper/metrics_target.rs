//! Metrics-export wrapper

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{JobTiming, MonitorWrapper};
use crate::error::{ResourceError, ResourceResult};
use crate::resource::{Resource, SessionRef};
use crate::tsdb::TsdbClient;

#[derive(Default)]
struct ExportState {
    session: Option<SessionRef>,
    last_export_success: bool,
}

/// Wrapper exporting a resource's metrics to the TSDB
pub struct MetricsTargetResource {
    resource: Arc<dyn Resource>,
    timing: JobTiming,
    deleted: AtomicBool,
    tsdb: Option<Arc<TsdbClient>>,
    state: tokio::sync::Mutex<ExportState>,
}

impl MetricsTargetResource {
    pub fn new(resource: Arc<dyn Resource>, tsdb: Option<Arc<TsdbClient>>) -> Self {
        Self {
            resource,
            timing: JobTiming::default(),
            deleted: AtomicBool::new(false),
            tsdb,
            state: tokio::sync::Mutex::new(ExportState::default()),
        }
    }

    pub async fn has_session(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    pub async fn last_export_success(&self) -> bool {
        self.state.lock().await.last_export_success
    }

    /// Export metrics over the open session
    ///
    /// Returns the number of samples exported, or `None` when nothing was
    /// exported. Failures are logged, not returned.
    pub async fn export_metrics(&self) -> Option<usize> {
        if self.is_deleted() {
            return None;
        }

        let Some(tsdb) = self.tsdb.as_deref() else {
            info!(
                resource_id = %self.resource.id(),
                "no TSDB client configured, skipping metrics export"
            );
            return None;
        };

        let mut state = self.state.lock().await;
        let Some(session) = state.session.clone() else {
            debug!(resource_id = %self.resource.id(), "no session open, skipping metrics export");
            return None;
        };

        match self.resource.export_metrics(&session, tsdb).await {
            Ok(count) => {
                state.last_export_success = true;
                debug!(resource_id = %self.resource.id(), count, "exported metrics");
                Some(count)
            }
            Err(e) => {
                state.last_export_success = false;
                warn!(
                    resource_id = %self.resource.id(),
                    kind = self.resource.kind(),
                    "metrics export failed: {e}"
                );
                None
            }
        }
    }
}

#[async_trait]
impl MonitorWrapper for MetricsTargetResource {
    fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    fn timing(&self) -> &JobTiming {
        &self.timing
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Reopen the session unless it exists and the last export succeeded
    ///
    /// Errors other than not-found are returned so the pool records a job
    /// failure.
    async fn open_resource_session(&self) -> ResourceResult<()> {
        let mut state = self.state.lock().await;
        if state.session.is_some() && state.last_export_success {
            return Ok(());
        }

        let opened = match self.resource.reload().await {
            Ok(()) => {
                close_session(&mut state).await;
                self.resource.open_metrics_session().await
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok(session) => {
                state.session = Some(session);
                Ok(())
            }
            Err(ResourceError::NotFound) => {
                self.deleted.store(true, Ordering::Release);
                close_session(&mut state).await;
                info!(resource_id = %self.resource.id(), "resource is deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn close_resource_session(&self) {
        close_session(&mut *self.state.lock().await).await;
    }
}

async fn close_session(state: &mut ExportState) {
    if let Some(session) = state.session.take() {
        if let Err(e) = session.close().await {
            debug!("ignoring error while closing session: {e}");
        }
    }
}
