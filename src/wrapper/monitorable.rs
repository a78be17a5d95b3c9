//! Health-pulse wrapper
//!
//! States: unopened -> session open (fresh <-> stale) -> deleted.
//!
//! A session counts as fresh while its last successful pulse (or its
//! opening) is younger than `session_fresh_for`. Connection-class errors on
//! a stale session get one reopen-and-retry; on a fresh session they are a
//! genuine down reading and are not retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{JobTiming, MonitorWrapper};
use crate::error::{ResourceError, ResourceResult};
use crate::resource::{Pulse, Resource, SessionRef};

/// Default age after which a session is considered stale
pub const DEFAULT_SESSION_FRESH_FOR: Duration = Duration::from_secs(8);

/// Up readings are logged for the first repeats ...
const LOGGED_FIRST_REPEATS: u64 = 2;

/// ... and every this many repeats afterwards
const LOG_EVERY_REPEATS: u64 = 5;

#[derive(Default)]
struct HealthState {
    session: Option<SessionRef>,
    pulse: Option<Pulse>,
    /// When the session was opened or last produced a pulse
    session_checked_at: Option<DateTime<Utc>>,
}

/// Wrapper running health pulse checks for one resource
pub struct MonitorableResource {
    resource: Arc<dyn Resource>,
    timing: JobTiming,
    deleted: AtomicBool,
    session_fresh_for: TimeDelta,
    state: tokio::sync::Mutex<HealthState>,
    attached: Mutex<HashMap<Uuid, Arc<MonitorableResource>>>,
}

impl MonitorableResource {
    pub fn new(resource: Arc<dyn Resource>) -> Self {
        Self {
            resource,
            timing: JobTiming::default(),
            deleted: AtomicBool::new(false),
            session_fresh_for: to_time_delta(DEFAULT_SESSION_FRESH_FOR),
            state: tokio::sync::Mutex::new(HealthState::default()),
            attached: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_session_freshness(mut self, fresh_for: Duration) -> Self {
        self.session_fresh_for = to_time_delta(fresh_for);
        self
    }

    /// Last recorded pulse
    pub async fn pulse(&self) -> Option<Pulse> {
        self.state.lock().await.pulse.clone()
    }

    pub async fn has_session(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// Ids of attached resources, sorted
    pub fn attached_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.attached_lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn attached(&self, id: &Uuid) -> Option<Arc<MonitorableResource>> {
        self.attached_lock().get(id).cloned()
    }

    /// Probe the resource and then every attached resource over the session
    ///
    /// Failures are logged and leave the previous pulse in place.
    pub async fn check_pulse(&self) {
        if self.is_deleted() {
            return;
        }

        let session = {
            let mut state = self.state.lock().await;
            self.check_own_pulse(&mut state).await;
            state.session.clone()
        };

        if let Some(session) = session {
            self.check_attached(&session).await;
        }
    }

    async fn check_own_pulse(&self, state: &mut HealthState) {
        let Some(session) = state.session.clone() else {
            debug!(
                resource_id = %self.resource.id(),
                kind = self.resource.kind(),
                "no session open, skipping pulse check"
            );
            return;
        };

        let stale = state
            .session_checked_at
            .is_none_or(|at| Utc::now() - at > self.session_fresh_for);

        let mut result = self.probe(state, &session).await;

        if let Err(e) = &result {
            if stale && e.is_stale_connection() {
                debug!(
                    resource_id = %self.resource.id(),
                    "stale session failed with {e}, reopening and retrying once"
                );
                result = match self.reopen_session(state).await {
                    Ok(session) => self.probe(state, &session).await,
                    Err(e) => Err(e),
                };
            }
        }

        self.record(state, result).await;
    }

    /// Run the resource's probe, pumping the session's event loop if needed
    async fn probe(&self, state: &mut HealthState, session: &SessionRef) -> ResourceResult<Pulse> {
        let previous = state.pulse.clone();

        if !self.resource.needs_event_loop() {
            return self.resource.check_pulse(session, previous.as_ref()).await;
        }

        let pump = EventPump::start(session);
        let result = self.resource.check_pulse(session, previous.as_ref()).await;

        let loop_failed = match pump.stop().await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(
                    resource_id = %self.resource.id(),
                    kind = self.resource.kind(),
                    "session event loop failed: {e}"
                );
                true
            }
            Err(e) => {
                error!(
                    resource_id = %self.resource.id(),
                    kind = self.resource.kind(),
                    "session event loop task failed: {e}"
                );
                true
            }
        };
        if loop_failed {
            close_session(state).await;
        }

        result
    }

    async fn record(&self, state: &mut HealthState, result: ResourceResult<Pulse>) {
        match result {
            Ok(pulse) => {
                if should_log_pulse(&pulse) {
                    info!(
                        resource_id = %self.resource.id(),
                        kind = self.resource.kind(),
                        reading = %pulse.reading,
                        reading_rpt = pulse.reading_rpt,
                        reading_chg = %pulse.reading_chg,
                        "got new pulse"
                    );
                }
                state.pulse = Some(pulse);
                state.session_checked_at = Some(Utc::now());
            }
            Err(ResourceError::NotFound) => self.mark_deleted(state).await,
            Err(e) => warn!(
                resource_id = %self.resource.id(),
                kind = self.resource.kind(),
                "pulse check failed: {e}"
            ),
        }
    }

    async fn check_attached(&self, session: &SessionRef) {
        let mut attached: Vec<Arc<MonitorableResource>> =
            self.attached_lock().values().cloned().collect();
        attached.sort_by_key(|child| child.resource_id());

        for child in attached {
            if !child.is_deleted() {
                let mut child_state = child.state.lock().await;
                let result = child.probe(&mut child_state, session).await;
                child.record(&mut child_state, result).await;
            }

            if child.is_deleted() {
                self.attached_lock().remove(&child.resource_id());
                debug!(resource_id = %child.resource_id(), "pruned deleted attached resource");
                continue;
            }

            if session.is_closed() {
                debug!(
                    resource_id = %self.resource.id(),
                    "shared session invalidated, remaining attached resources wait for the next cycle"
                );
                self.state.lock().await.session = None;
                break;
            }
        }
    }

    async fn reopen_session(&self, state: &mut HealthState) -> ResourceResult<SessionRef> {
        close_session(state).await;
        let session = self.resource.open_health_session().await?;
        state.session = Some(session.clone());
        state.session_checked_at = Some(Utc::now());
        Ok(session)
    }

    async fn mark_deleted(&self, state: &mut HealthState) {
        self.deleted.store(true, Ordering::Release);
        close_session(state).await;
        info!(
            resource_id = %self.resource.id(),
            kind = self.resource.kind(),
            "resource is deleted"
        );
    }

    fn attached_lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<MonitorableResource>>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MonitorWrapper for MonitorableResource {
    fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    fn timing(&self) -> &JobTiming {
        &self.timing
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Reopen the session unless it exists and the last pulse was up
    ///
    /// Errors other than not-found are logged and swallowed; the pulse check
    /// then finds no session and the next cycle tries again.
    async fn open_resource_session(&self) -> ResourceResult<()> {
        let mut state = self.state.lock().await;
        if state.session.is_some() && state.pulse.as_ref().is_some_and(Pulse::is_up) {
            return Ok(());
        }

        let opened = match self.resource.reload().await {
            Ok(()) => self.reopen_session(&mut state).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match opened {
            Ok(()) => {}
            Err(ResourceError::NotFound) => self.mark_deleted(&mut state).await,
            Err(e) => warn!(
                resource_id = %self.resource.id(),
                kind = self.resource.kind(),
                "failed to open health session: {e}"
            ),
        }
        Ok(())
    }

    async fn close_resource_session(&self) {
        close_session(&mut *self.state.lock().await).await;
    }

    fn replace_attached(&self, resources: Vec<Arc<dyn Resource>>) {
        let mut attached = self.attached_lock();
        let mut next = HashMap::with_capacity(resources.len());
        for resource in resources {
            let id = resource.id();
            let wrapper = attached.remove(&id).unwrap_or_else(|| {
                Arc::new(MonitorableResource {
                    session_fresh_for: self.session_fresh_for,
                    ..MonitorableResource::new(resource)
                })
            });
            next.insert(id, wrapper);
        }
        *attached = next;
    }

    fn attached_count(&self) -> usize {
        self.attached_lock().len()
    }
}

async fn close_session(state: &mut HealthState) {
    if let Some(session) = state.session.take() {
        if let Err(e) = session.close().await {
            debug!("ignoring error while closing session: {e}");
        }
    }
}

/// Helper task pumping a session's event loop during a pulse check
///
/// Stopped and aborted on drop as well, so a check that unwinds never
/// leaves the helper running.
struct EventPump {
    running: Arc<AtomicBool>,
    helper: Option<JoinHandle<ResourceResult<()>>>,
}

impl EventPump {
    fn start(session: &SessionRef) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let helper = tokio::spawn({
            let session = session.clone();
            let running = running.clone();
            async move { session.process_events(running).await }
        });
        Self {
            running,
            helper: Some(helper),
        }
    }

    async fn stop(mut self) -> Result<ResourceResult<()>, JoinError> {
        self.running.store(false, Ordering::Release);
        match self.helper.take() {
            Some(helper) => helper.await,
            None => Ok(Ok(())),
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(helper) = self.helper.take() {
            helper.abort();
        }
    }
}

fn should_log_pulse(pulse: &Pulse) -> bool {
    !pulse.is_up()
        || pulse.reading_rpt <= LOGGED_FIRST_REPEATS
        || pulse.reading_rpt % LOG_EVERY_REPEATS == 1
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
