//! Scheduling loop driving the health and metrics-export pools
//!
//! One task multiplexes four duties on independent periods:
//!
//! 1. **scan** both pools over the current id range (also whenever the
//!    repartitioner flags a range change)
//! 2. **report** an aggregate metrics snapshot
//! 3. **check stuck jobs** in both pools
//! 4. **enqueue** cooled-down wrappers, every iteration
//!
//! Between iterations it sleeps on the wake signal until the earliest
//! wrapper becomes due, so [`RunnerHandle::shutdown`] is observed at once.

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::MonitorError;
use crate::pool::{MonitorPool, PoolCloser};
use crate::repartitioner::Repartitioner;
use crate::wrapper::{MetricsTargetResource, MonitorableResource};

/// Category of the health pool in logs and metrics
pub const HEALTH_CATEGORY: &str = "monitor";

/// Category of the metrics-export pool in logs and metrics
pub const METRICS_CATEGORY: &str = "metric_export";

/// Periods of the runner's duties
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub scan_every: Duration,
    pub report_every: Duration,
    pub enqueue_every: Duration,
    pub check_stuck_pulses_every: Duration,

    /// Long-lived tasks of the process that are not pool jobs (scheduler,
    /// listen loop), left out of `active_threads_count`
    pub ignore_tasks: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            scan_every: Duration::from_secs(60),
            report_every: Duration::from_secs(5),
            enqueue_every: Duration::from_secs(5),
            check_stuck_pulses_every: Duration::from_secs(5),
            ignore_tasks: 2,
        }
    }
}

/// Periodic metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorMetrics {
    pub active_threads_count: usize,
    pub threads_waiting_for_db_connection: usize,
    pub total_monitor_resources: usize,
    pub total_metric_export_resources: usize,
    pub monitor_submit_queue_length: usize,
    pub metric_export_submit_queue_length: usize,
    pub monitor_idle_worker_threads: usize,
    pub metric_export_idle_worker_threads: usize,
}

/// Stops a running [`MonitorRunner`] from any task
///
/// Cheap to clone.
#[derive(Clone)]
pub struct RunnerHandle {
    wake: Arc<watch::Sender<bool>>,
    health: PoolCloser,
    metrics: PoolCloser,
}

impl RunnerHandle {
    /// Close the wake signal and both submit queues; idempotent
    pub fn shutdown(&self) {
        self.wake.send_replace(true);
        self.health.close();
        self.metrics.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.wake.borrow()
    }
}

pub struct MonitorRunner {
    health: MonitorPool<MonitorableResource>,
    metrics: MonitorPool<MetricsTargetResource>,
    repartitioner: Arc<Repartitioner>,
    settings: RunnerSettings,
    wake: Arc<watch::Sender<bool>>,
}

impl MonitorRunner {
    pub fn new(
        health: MonitorPool<MonitorableResource>,
        metrics: MonitorPool<MetricsTargetResource>,
        repartitioner: Arc<Repartitioner>,
        settings: RunnerSettings,
    ) -> Self {
        let (wake, _) = watch::channel(false);
        Self {
            health,
            metrics,
            repartitioner,
            settings,
            wake: Arc::new(wake),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            wake: self.wake.clone(),
            health: self.health.closer(),
            metrics: self.metrics.closer(),
        }
    }

    pub fn health_pool(&self) -> &MonitorPool<MonitorableResource> {
        &self.health
    }

    pub fn metrics_pool(&self) -> &MonitorPool<MetricsTargetResource> {
        &self.metrics
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.wake.borrow()
    }

    pub fn shutdown(&self) {
        self.handle().shutdown();
    }

    /// Run until shutdown
    ///
    /// A closed submit queue means shutdown is under way (or a pool was
    /// closed underneath the runner, in which case the rest is shut down
    /// too) and ends the loop cleanly. Any other error is returned.
    #[instrument(skip(self), fields(partition = self.repartitioner.partition_number()))]
    pub async fn run(&mut self) -> Result<(), MonitorError> {
        match self.run_loop().await {
            Err(MonitorError::QueueClosed) => {
                if !self.is_shutting_down() {
                    warn!("submit queue closed outside of shutdown, shutting down");
                    self.shutdown();
                }
                info!("monitor runner stopped");
                Ok(())
            }
            Ok(()) => {
                info!("monitor runner stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run until shutdown, terminating the process on any unexpected error
    ///
    /// An escaped error may leave part of the fleet unmonitored without
    /// anyone noticing, so the process exits for its supervisor to restart.
    pub async fn run_or_exit(&mut self) {
        if let Err(e) = self.run().await {
            let runtime = tokio::runtime::Handle::current().metrics();
            error!(
                alive_tasks = runtime.num_alive_tasks(),
                runtime_workers = runtime.num_workers(),
                "monitor runner failed: {e:#}\nscheduler backtrace:\n{}",
                Backtrace::force_capture()
            );
            self.log_running_jobs();
            std::process::exit(2);
        }
    }

    /// Log every job in flight, since worker stacks are not captured
    fn log_running_jobs(&self) -> usize {
        let pools = [
            (self.health.category(), self.health.running_jobs()),
            (self.metrics.category(), self.metrics.running_jobs()),
        ];
        let mut count = 0;
        for (category, jobs) in pools {
            for job in jobs {
                error!(
                    category,
                    resource_id = %job.resource_id,
                    job_started_at = %job.job_started_at,
                    time_elapsed = job.elapsed.num_milliseconds() as f64 / 1000.0,
                    "job in flight at runner failure"
                );
                count += 1;
            }
        }
        count
    }

    async fn run_loop(&mut self) -> Result<(), MonitorError> {
        let mut deadlines = Deadlines::new(Instant::now(), &self.settings);
        let mut wake_rx = self.wake.subscribe();

        while !self.is_shutting_down() {
            let now = Instant::now();

            let repartitioned = self.repartitioner.take_repartitioned();
            if repartitioned || now >= deadlines.scan_at {
                self.scan().await?;
                deadlines.scan_at = now + self.settings.scan_every;
            }

            if now >= deadlines.report_at {
                self.emit_metrics();
                deadlines.report_at = now + self.settings.report_every;
            }

            if now >= deadlines.check_stuck_at {
                self.check_stuck_pulses();
                deadlines.check_stuck_at = now + self.settings.check_stuck_pulses_every;
            }

            let sleep = self.enqueue().await?;
            // Timed out or woken: either way start the next iteration.
            let _ = tokio::time::timeout(sleep, wake_rx.wait_for(|closed| *closed)).await;
        }
        Ok(())
    }

    /// Rescan both pools over the current range, submitting new wrappers
    pub async fn scan(&mut self) -> Result<(), MonitorError> {
        let range = self.repartitioner.id_range();

        let new_health = self.health.scan(&range).await?;
        let health_count = new_health.len();
        for wrapper in new_health {
            self.health.submit(wrapper).await?;
        }

        let new_metrics = self.metrics.scan(&range).await?;
        let metrics_count = new_metrics.len();
        for wrapper in new_metrics {
            self.metrics.submit(wrapper).await?;
        }

        debug!(
            range = %range,
            new_monitor_resources = health_count,
            new_metric_export_resources = metrics_count,
            total_monitor_resources = self.health.resources().len(),
            total_metric_export_resources = self.metrics.resources().len(),
            "rescanned resources"
        );
        Ok(())
    }

    /// Re-submit due wrappers in both pools
    ///
    /// Returns how long to sleep until the earliest waiting wrapper is due,
    /// or `enqueue_every` when nothing is waiting.
    pub async fn enqueue(&mut self) -> Result<Duration, MonitorError> {
        let every = TimeDelta::from_std(self.settings.enqueue_every).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let before = now - every;

        let health_next = self.health.enqueue(before).await?;
        let metrics_next = self.metrics.enqueue(before).await?;

        let sleep = match health_next.into_iter().chain(metrics_next).min() {
            Some(finished_at) => (finished_at + every - now).to_std().unwrap_or(Duration::ZERO),
            None => self.settings.enqueue_every,
        };
        Ok(sleep)
    }

    pub fn metrics_snapshot(&self) -> MonitorMetrics {
        let alive = tokio::runtime::Handle::current()
            .metrics()
            .num_alive_tasks();

        MonitorMetrics {
            active_threads_count: alive.saturating_sub(self.settings.ignore_tasks),
            threads_waiting_for_db_connection: self.health.connections_waiting()
                + self.metrics.connections_waiting(),
            total_monitor_resources: self.health.resources().len(),
            total_metric_export_resources: self.metrics.resources().len(),
            monitor_submit_queue_length: self.health.submit_queue_len(),
            metric_export_submit_queue_length: self.metrics.submit_queue_len(),
            monitor_idle_worker_threads: self.health.idle_workers(),
            metric_export_idle_worker_threads: self.metrics.idle_workers(),
        }
    }

    pub fn emit_metrics(&self) {
        let snapshot = self.metrics_snapshot();
        info!(
            active_threads_count = snapshot.active_threads_count,
            threads_waiting_for_db_connection = snapshot.threads_waiting_for_db_connection,
            total_monitor_resources = snapshot.total_monitor_resources,
            total_metric_export_resources = snapshot.total_metric_export_resources,
            monitor_submit_queue_length = snapshot.monitor_submit_queue_length,
            metric_export_submit_queue_length = snapshot.metric_export_submit_queue_length,
            monitor_idle_worker_threads = snapshot.monitor_idle_worker_threads,
            metric_export_idle_worker_threads = snapshot.metric_export_idle_worker_threads,
            "monitor metrics"
        );
    }

    /// Log stuck jobs of both pools, returning how many were found
    pub fn check_stuck_pulses(&self) -> usize {
        self.health.check_stuck_pulses().len() + self.metrics.check_stuck_pulses().len()
    }

    /// Shut down and wait for both pools' workers to exit
    pub async fn wait_cleanup(&mut self, timeout: Option<Duration>) {
        self.shutdown();
        self.health.wait_cleanup(timeout).await;
        self.metrics.wait_cleanup(timeout).await;
    }
}

/// Next due time of each periodic duty
///
/// The first scan is due at once; reporting and the stuck check wait one
/// full period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadlines {
    scan_at: Instant,
    report_at: Instant,
    check_stuck_at: Instant,
}

impl Deadlines {
    fn new(now: Instant, settings: &RunnerSettings) -> Self {
        Self {
            scan_at: now,
            report_at: now + settings.report_every,
            check_stuck_at: now + settings.check_stuck_pulses_every,
        }
    }
}
