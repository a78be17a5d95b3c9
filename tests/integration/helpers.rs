//! Helper types and functions for integration tests

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_monitor::config::HostConfig;
use fleet_monitor::error::{ResourceError, ResourceResult};
use fleet_monitor::pool::{MonitorPool, PoolSpec, StuckJobInfo, job_fn};
use fleet_monitor::repartitioner::IdRange;
use fleet_monitor::resource::{Pulse, Reading, Resource, ResourceType, Session, SessionRef};
use fleet_monitor::runner::{HEALTH_CATEGORY, METRICS_CATEGORY, MonitorRunner, RunnerSettings};
use fleet_monitor::repartitioner::Repartitioner;
use fleet_monitor::tsdb::TsdbClient;
use fleet_monitor::wrapper::{MetricsTargetResource, MonitorableResource};
use futures::StreamExt;
use futures::stream::BoxStream;
use uuid::Uuid;
use wiremock::MockServer;

pub struct TestSession {
    closed: AtomicBool,
}

#[async_trait]
impl Session for TestSession {
    async fn close(&self) -> ResourceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory resource counting what the scheduler does with it
#[derive(Default)]
pub struct TestResource {
    pub id: Uuid,
    pub deleted: AtomicBool,
    pub failing: AtomicBool,
    pub checks: AtomicUsize,
    pub exports: AtomicUsize,
    pub opens: AtomicUsize,
}

impl TestResource {
    pub fn new(id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            id,
            ..Default::default()
        })
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resource for TestResource {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &str {
        "test"
    }

    async fn reload(&self) -> ResourceResult<()> {
        if self.deleted.load(Ordering::SeqCst) {
            Err(ResourceError::NotFound)
        } else {
            Ok(())
        }
    }

    async fn open_health_session(&self) -> ResourceResult<SessionRef> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestSession {
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_metrics_session(&self) -> ResourceResult<SessionRef> {
        self.open_health_session().await
    }

    async fn check_pulse(
        &self,
        _session: &SessionRef,
        previous: Option<&Pulse>,
    ) -> ResourceResult<Pulse> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResourceError::Probe("probe failed".into()));
        }
        Ok(Pulse::aggregate(previous, Reading::Up, Default::default()))
    }

    async fn export_metrics(
        &self,
        _session: &SessionRef,
        _tsdb: &TsdbClient,
    ) -> ResourceResult<usize> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        Ok(3)
    }
}

/// Resource type over a mutable list of test resources
#[derive(Default)]
pub struct TestFleet {
    resources: Mutex<Vec<Arc<TestResource>>>,
}

impl TestFleet {
    pub fn new(resources: Vec<Arc<TestResource>>) -> Arc<Self> {
        Arc::new(Self {
            resources: Mutex::new(resources),
        })
    }

    pub fn set(&self, resources: Vec<Arc<TestResource>>) {
        *self.resources.lock().unwrap() = resources;
    }
}

#[async_trait]
impl ResourceType for TestFleet {
    fn name(&self) -> &str {
        "test_fleet"
    }

    fn stream_in_range<'a>(
        &'a self,
        range: &'a IdRange,
    ) -> BoxStream<'a, anyhow::Result<Arc<dyn Resource>>> {
        let matching: Vec<anyhow::Result<Arc<dyn Resource>>> = self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|r| range.contains(&r.id))
            .map(|r| Ok(r.clone() as Arc<dyn Resource>))
            .collect();
        futures::stream::iter(matching).boxed()
    }

    async fn estimate_count(&self) -> anyhow::Result<usize> {
        Ok(self.resources.lock().unwrap().len())
    }
}

pub fn stuck_info() -> StuckJobInfo {
    StuckJobInfo {
        timeout: Duration::from_secs(120),
        message: String::from("Pulse check has stuck."),
        key: String::from("pulse_check_stuck"),
    }
}

pub fn fast_settings() -> RunnerSettings {
    RunnerSettings {
        scan_every: Duration::from_millis(100),
        report_every: Duration::from_millis(100),
        enqueue_every: Duration::from_millis(30),
        check_stuck_pulses_every: Duration::from_millis(100),
        ignore_tasks: 0,
    }
}

pub async fn health_pool(types: Vec<Arc<dyn ResourceType>>) -> MonitorPool<MonitorableResource> {
    MonitorPool::create(PoolSpec {
        category: HEALTH_CATEGORY.to_string(),
        factory: Arc::new(MonitorableResource::new),
        stuck: stuck_info(),
        worker_hint: 6,
        reserved_tasks: 2,
        types,
        attached_types: Vec::new(),
        job: job_fn(|wrapper: Arc<MonitorableResource>| async move {
            wrapper.check_pulse().await;
            Ok(())
        }),
    })
    .await
    .unwrap()
}

pub async fn metrics_pool(
    types: Vec<Arc<dyn ResourceType>>,
    tsdb: Option<Arc<TsdbClient>>,
) -> MonitorPool<MetricsTargetResource> {
    MonitorPool::create(PoolSpec {
        category: METRICS_CATEGORY.to_string(),
        factory: Arc::new(move |resource: Arc<dyn Resource>| {
            MetricsTargetResource::new(resource, tsdb.clone())
        }),
        stuck: stuck_info(),
        worker_hint: 4,
        reserved_tasks: 2,
        types,
        attached_types: Vec::new(),
        job: job_fn(|wrapper: Arc<MetricsTargetResource>| async move {
            wrapper.export_metrics().await;
            Ok(())
        }),
    })
    .await
    .unwrap()
}

pub async fn create_runner(
    types: Vec<Arc<dyn ResourceType>>,
    tsdb: Option<Arc<TsdbClient>>,
    repartitioner: Arc<Repartitioner>,
) -> MonitorRunner {
    let health = health_pool(types.clone()).await;
    let metrics = metrics_pool(types, tsdb).await;
    MonitorRunner::new(health, metrics, repartitioner, fast_settings())
}

/// Poll `condition` until it holds, failing the test after `secs` seconds
pub async fn wait_until(secs: u64, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(secs), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn create_host_config(server: &MockServer, id: Uuid) -> HostConfig {
    let address = server.address();
    HostConfig {
        id,
        ip: address.ip(),
        display: Some(format!("Test {address}")),
        port: address.port(),
        token: Some("test-token".to_string()),
    }
}

pub fn create_mock_metrics_json(cpu_usage: f32, temperature: Option<f32>) -> serde_json::Value {
    serde_json::json!({
        "system": {
            "name": "TestOS",
            "kernel_version": "5.0.0",
            "os_version": "Test 1.0",
            "host_name": "test-host"
        },
        "memory": {
            "total": 16000000000u64,
            "used": 8000000000u64,
            "total_swap": 4000000000u64,
            "used_swap": 1000000000u64
        },
        "cpus": {
            "total": 8,
            "arch": "x86_64",
            "average_usage": cpu_usage,
            "cpus": []
        },
        "components": {
            "average_temperature": temperature,
            "components": []
        }
    })
}
