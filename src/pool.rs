//! Bounded worker pool and re-submission scheduler for one job category
//!
//! ## Pipeline
//!
//! ```text
//!  scan ──new──► submit queue (bounded) ──► worker ──► finish queue
//!                     ▲                                      │
//!                     └──── enqueue: cooled down ◄── run buffer
//! ```
//!
//! - **submit queue**: bounded mpsc channel, the backpressure point; shared
//!   by all workers
//! - **finish queue**: unbounded channel from workers back to the scheduler
//! - **run buffer**: finished wrappers waiting for their cooldown
//!
//! The tracked-resource map and the run buffer are owned by the pool and
//! mutated only through `&mut self` (`scan`/`enqueue`) by the single
//! scheduling task. Workers only push onto the finish queue.
//!
//! The submit queue capacity is computed once from the population estimate
//! at creation and never resized; a fleet that grows a lot after startup
//! gets proportionally more backpressure.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

use crate::error::MonitorError;
use crate::repartitioner::IdRange;
use crate::resource::{AttachedResourceType, Resource, ResourceType};
use crate::wrapper::MonitorWrapper;

/// Per-job callback run by workers after the session is opened
pub type JobFn<W> = Arc<dyn Fn(Arc<W>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`JobFn`]
pub fn job_fn<W, F, Fut>(f: F) -> JobFn<W>
where
    W: MonitorWrapper,
    F: Fn(Arc<W>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |wrapper| f(wrapper).boxed())
}

/// Builds a wrapper for a newly observed resource
pub type WrapperFactory<W> = Arc<dyn Fn(Arc<dyn Resource>) -> W + Send + Sync>;

/// How stuck jobs are detected and reported
#[derive(Debug, Clone)]
pub struct StuckJobInfo {
    /// Jobs running longer than this are reported
    pub timeout: Duration,

    /// Log message for the report
    pub message: String,

    /// Key identifying the report in logs
    pub key: String,
}

/// A job in flight on a worker
#[derive(Debug, Clone, PartialEq)]
pub struct RunningJob {
    pub resource_id: Uuid,
    pub job_started_at: DateTime<Utc>,
    pub elapsed: TimeDelta,
}

/// Everything needed to create a pool
pub struct PoolSpec<W: MonitorWrapper> {
    /// Category name used in logs and metrics, e.g. `monitor`
    pub category: String,
    pub factory: WrapperFactory<W>,
    pub stuck: StuckJobInfo,
    /// Requested worker count, before subtracting `reserved_tasks`
    pub worker_hint: usize,
    /// Headroom kept for the process's other tasks
    pub reserved_tasks: usize,
    pub types: Vec<Arc<dyn ResourceType>>,
    pub attached_types: Vec<Arc<dyn AttachedResourceType>>,
    pub job: JobFn<W>,
}

/// Closes a pool's submit queue from outside the scheduling task
#[derive(Clone)]
pub struct PoolCloser {
    closed: Arc<watch::Sender<bool>>,
}

impl PoolCloser {
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Worker pool for one job category
pub struct MonitorPool<W: MonitorWrapper> {
    category: String,
    factory: WrapperFactory<W>,
    stuck: StuckJobInfo,
    types: Vec<Arc<dyn ResourceType>>,
    attached_types: Vec<Arc<dyn AttachedResourceType>>,
    resources: HashMap<Uuid, Arc<W>>,
    submit_tx: mpsc::Sender<Arc<W>>,
    closed: Arc<watch::Sender<bool>>,
    finish_tx: mpsc::UnboundedSender<Arc<W>>,
    finish_rx: mpsc::UnboundedReceiver<Arc<W>>,
    run_queue: VecDeque<Arc<W>>,
    workers: Vec<JoinHandle<()>>,
    idle_workers: Arc<AtomicUsize>,
}

impl<W: MonitorWrapper> MonitorPool<W> {
    /// Create the pool and spawn its workers
    ///
    /// Worker count is `worker_hint - reserved_tasks`, at least 1. The
    /// submit queue holds `workers + 1.5 * estimated population` entries.
    pub async fn create(spec: PoolSpec<W>) -> anyhow::Result<Self> {
        let workers = spec.worker_hint.saturating_sub(spec.reserved_tasks).max(1);

        let mut population = 0usize;
        for resource_type in &spec.types {
            population += resource_type
                .estimate_count()
                .await
                .with_context(|| format!("failed to count {} resources", resource_type.name()))?;
        }
        let capacity = queue_capacity(workers, population);

        let job = spec.job.clone();
        let (mut pool, submit_rx) = Self::assemble(spec, capacity);
        pool.spawn_workers(workers, submit_rx, job);

        debug!(
            category = %pool.category,
            workers,
            capacity,
            population,
            "created monitor pool"
        );
        Ok(pool)
    }

    fn assemble(spec: PoolSpec<W>, capacity: usize) -> (Self, mpsc::Receiver<Arc<W>>) {
        let (submit_tx, submit_rx) = mpsc::channel(capacity);
        let (finish_tx, finish_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let pool = Self {
            category: spec.category,
            factory: spec.factory,
            stuck: spec.stuck,
            types: spec.types,
            attached_types: spec.attached_types,
            resources: HashMap::new(),
            submit_tx,
            closed: Arc::new(closed),
            finish_tx,
            finish_rx,
            run_queue: VecDeque::new(),
            workers: Vec::new(),
            idle_workers: Arc::new(AtomicUsize::new(0)),
        };
        (pool, submit_rx)
    }

    fn spawn_workers(&mut self, count: usize, submit_rx: mpsc::Receiver<Arc<W>>, job: JobFn<W>) {
        let submit_rx = Arc::new(Mutex::new(submit_rx));
        for _ in 0..count {
            let worker = Worker {
                category: self.category.clone(),
                submit_rx: submit_rx.clone(),
                closed_rx: self.closed.subscribe(),
                finish_tx: self.finish_tx.clone(),
                idle: self.idle_workers.clone(),
                job: job.clone(),
            };
            self.workers.push(tokio::spawn(worker.run()));
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Currently tracked resources, keyed by id
    pub fn resources(&self) -> &HashMap<Uuid, Arc<W>> {
        &self.resources
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.submit_tx.max_capacity()
    }

    /// Wrappers waiting in the submit queue
    pub fn submit_queue_len(&self) -> usize {
        self.submit_tx.max_capacity() - self.submit_tx.capacity()
    }

    /// Workers blocked waiting for a job
    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::Acquire)
    }

    /// Finished wrappers waiting for their cooldown
    pub fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }

    /// Tasks waiting for a connection to any of the pool's data sources
    pub fn connections_waiting(&self) -> usize {
        self.types.iter().map(|t| t.connections_waiting()).sum()
    }

    pub fn closer(&self) -> PoolCloser {
        PoolCloser {
            closed: self.closed.clone(),
        }
    }

    /// Push a wrapper onto the submit queue, waiting while it is full
    pub async fn submit(&self, wrapper: Arc<W>) -> Result<(), MonitorError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow() {
            return Err(MonitorError::QueueClosed);
        }

        tokio::select! {
            sent = self.submit_tx.send(wrapper) => sent.map_err(|_| MonitorError::QueueClosed),
            _ = wait_closed(&mut closed_rx) => Err(MonitorError::QueueClosed),
        }
    }

    /// Refresh the tracked map from every resource type for `range`
    ///
    /// Already tracked resources keep their wrapper (and with it any open
    /// session); anything not returned this time is dropped. Returns only
    /// the wrappers created by this scan.
    #[instrument(skip(self), fields(category = %self.category, range = %range))]
    pub async fn scan(&mut self, range: &IdRange) -> Result<Vec<Arc<W>>, MonitorError> {
        let mut scanned = HashMap::with_capacity(self.resources.len());
        let mut created = Vec::new();
        let mut hosts: HashMap<Uuid, Arc<W>> = HashMap::new();

        for resource_type in &self.types {
            let mut stream = resource_type.stream_in_range(range);
            while let Some(resource) = stream.next().await {
                let resource = resource
                    .with_context(|| format!("failed to list {} resources", resource_type.name()))
                    .map_err(MonitorError::Scan)?;
                let id = resource.id();

                let wrapper = match self.resources.get(&id) {
                    Some(existing) => existing.clone(),
                    None => {
                        let wrapper = Arc::new((self.factory)(resource));
                        created.push(wrapper.clone());
                        wrapper
                    }
                };

                if resource_type.hosts_attachments() {
                    hosts.insert(id, wrapper.clone());
                }
                scanned.insert(id, wrapper);
            }
        }

        if !self.attached_types.is_empty() {
            self.scan_attached(range, hosts).await?;
        }

        trace!(
            tracked = scanned.len(),
            new = created.len(),
            dropped = self.resources.keys().filter(|id| !scanned.contains_key(id)).count(),
            "scan finished"
        );
        self.resources = scanned;
        Ok(created)
    }

    async fn scan_attached(
        &self,
        range: &IdRange,
        mut hosts: HashMap<Uuid, Arc<W>>,
    ) -> Result<(), MonitorError> {
        let mut grouped: HashMap<Uuid, Vec<Arc<dyn Resource>>> = HashMap::new();
        for attached_type in &self.attached_types {
            let mut stream = attached_type.stream_attached(range);
            while let Some(pair) = stream.next().await {
                let (host_id, resource) = pair
                    .context("failed to list attached resources")
                    .map_err(MonitorError::Scan)?;
                grouped.entry(host_id).or_default().push(resource);
            }
        }

        for (host_id, attached) in grouped {
            if let Some(host) = hosts.remove(&host_id) {
                host.replace_attached(attached);
            }
        }

        // Hosts that had attachments before but none this time.
        for host in hosts.values() {
            host.replace_attached(Vec::new());
        }
        Ok(())
    }

    /// Re-submit wrappers that finished at or before `before`
    ///
    /// Drains the finish queue into the run buffer (dropping deleted
    /// wrappers from the tracked map), then submits the ready prefix of the
    /// buffer. Wrappers a scan stopped tracking in the meantime are not
    /// submitted. Returns the finish time of the new buffer head.
    ///
    /// The buffer is cut at the first not-yet-ready entry. Finish order only
    /// differs from completion order by scheduling jitter, and the buffer is
    /// filled by this single task, so the cut is close enough to FIFO.
    pub async fn enqueue(
        &mut self,
        before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, MonitorError> {
        while let Ok(wrapper) = self.finish_rx.try_recv() {
            if wrapper.is_deleted() {
                self.resources.remove(&wrapper.resource_id());
                debug!(
                    category = %self.category,
                    resource_id = %wrapper.resource_id(),
                    "stopped tracking deleted resource"
                );
            } else {
                self.run_queue.push_back(wrapper);
            }
        }

        let ready = self
            .run_queue
            .iter()
            .position(|w| w.timing().finished_at().is_some_and(|at| at > before))
            .unwrap_or(self.run_queue.len());

        let due: Vec<Arc<W>> = self.run_queue.drain(..ready).collect();
        for wrapper in due {
            if self.resources.contains_key(&wrapper.resource_id()) {
                self.submit(wrapper).await?;
            }
        }

        Ok(self
            .run_queue
            .front()
            .and_then(|w| w.timing().finished_at()))
    }

    /// Report every tracked job running longer than the stuck timeout
    ///
    /// Only logs; stuck jobs are never cancelled.
    pub fn check_stuck_pulses(&self) -> Vec<RunningJob> {
        let timeout = TimeDelta::from_std(self.stuck.timeout).unwrap_or(TimeDelta::MAX);

        let stuck: Vec<RunningJob> = self
            .running_jobs()
            .into_iter()
            .filter(|job| job.elapsed > timeout)
            .collect();
        for job in &stuck {
            warn!(
                key = %self.stuck.key,
                resource_id = %job.resource_id,
                job_started_at = %job.job_started_at,
                time_elapsed = job.elapsed.num_milliseconds() as f64 / 1000.0,
                "{}", self.stuck.message
            );
        }
        stuck
    }

    /// Every tracked job currently running on a worker
    pub fn running_jobs(&self) -> Vec<RunningJob> {
        let now = Utc::now();
        self.resources
            .values()
            .filter_map(|wrapper| {
                let started_at = wrapper.timing().started_at()?;
                Some(RunningJob {
                    resource_id: wrapper.resource_id(),
                    job_started_at: started_at,
                    elapsed: now - started_at,
                })
            })
            .collect()
    }

    /// Close the submit queue; further submits fail
    pub fn shutdown(&self) {
        self.closed.send_replace(true);
    }

    /// Shut down and wait for the workers to drain and exit
    pub async fn wait_cleanup(&mut self, timeout: Option<Duration>) {
        self.shutdown();
        for worker in self.workers.drain(..) {
            match timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, worker).await.is_err() {
                        warn!(category = %self.category, "worker did not exit within {timeout:?}");
                    }
                }
                None => {
                    if let Err(e) = worker.await {
                        error!(category = %self.category, "worker task failed: {e}");
                    }
                }
            }
        }
    }
}

fn queue_capacity(workers: usize, population: usize) -> usize {
    workers + (population as f64 * 1.5).round() as usize
}

async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as closed as well.
    let _ = closed_rx.wait_for(|closed| *closed).await;
}

struct Worker<W: MonitorWrapper> {
    category: String,
    submit_rx: Arc<Mutex<mpsc::Receiver<Arc<W>>>>,
    closed_rx: watch::Receiver<bool>,
    finish_tx: mpsc::UnboundedSender<Arc<W>>,
    idle: Arc<AtomicUsize>,
    job: JobFn<W>,
}

impl<W: MonitorWrapper> Worker<W> {
    async fn run(mut self) {
        while let Some(wrapper) = self.next_job().await {
            let guard = FinishGuard::start(wrapper.clone(), self.finish_tx.clone());

            let job = self.job.clone();
            let outcome = AssertUnwindSafe(async {
                wrapper.open_resource_session().await?;
                job(wrapper.clone()).await
            })
            .catch_unwind()
            .await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(panic) => Some(format!("job panicked: {}", panic_message(&*panic))),
            };

            if let Some(failure) = failure {
                let resource = wrapper.resource();
                error!(
                    category = %self.category,
                    resource_id = %resource.id(),
                    kind = resource.kind(),
                    "monitoring job has failed: {failure}"
                );
                if resource.has_failure_counter() {
                    if let Err(e) = resource.increment_failure_counter().await {
                        warn!(resource_id = %resource.id(), "failed to increment failure counter: {e}");
                    }
                }
            }

            drop(guard);
        }
        trace!(category = %self.category, "worker exiting");
    }

    /// Next queued wrapper; `None` once the queue is closed and drained
    async fn next_job(&mut self) -> Option<Arc<W>> {
        // Waiting for the receiver counts as idle too.
        let _idle = IdleGuard::enter(&self.idle);
        let mut submit_rx = self.submit_rx.lock().await;

        tokio::select! {
            next = submit_rx.recv() => next,
            _ = wait_closed(&mut self.closed_rx) => {
                submit_rx.close();
                submit_rx.recv().await
            }
        }
    }
}

struct IdleGuard<'a>(&'a AtomicUsize);

impl<'a> IdleGuard<'a> {
    fn enter(idle: &'a AtomicUsize) -> Self {
        idle.fetch_add(1, Ordering::AcqRel);
        Self(idle)
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Finish bookkeeping that runs however the job ends
///
/// Clears the start time, stamps the finish time and hands the wrapper back
/// to the scheduler, so no wrapper ever drops out of the pipeline.
struct FinishGuard<W: MonitorWrapper> {
    wrapper: Arc<W>,
    finish_tx: mpsc::UnboundedSender<Arc<W>>,
}

impl<W: MonitorWrapper> FinishGuard<W> {
    fn start(wrapper: Arc<W>, finish_tx: mpsc::UnboundedSender<Arc<W>>) -> Self {
        wrapper.timing().set_started_at(Some(Utc::now()));
        Self { wrapper, finish_tx }
    }
}

impl<W: MonitorWrapper> Drop for FinishGuard<W> {
    fn drop(&mut self) {
        let timing = self.wrapper.timing();
        timing.set_started_at(None);
        timing.set_finished_at(Some(Utc::now()));
        if self.finish_tx.send(self.wrapper.clone()).is_err() {
            trace!("finish queue gone, pool is shutting down");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
