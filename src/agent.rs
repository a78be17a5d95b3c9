//! Hosts running the metrics agent, as monitored resources
//!
//! [`AgentInventory`] lists the configured hosts; each [`AgentHost`] is
//! probed over HTTP on the agent's `/metrics` endpoint. A host answering
//! with a metrics document is up; a refused or timed out connection, or an
//! error status, is a down reading.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::json;
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::ServerMetrics;
use crate::config::HostConfig;
use crate::error::{ResourceError, ResourceResult};
use crate::repartitioner::IdRange;
use crate::resource::{Pulse, Reading, Resource, ResourceType, Session, SessionRef};
use crate::tsdb::{Sample, TsdbClient};

const SECRET_HEADER: &str = "X-MONITORING-SECRET";

type HostMap = Arc<RwLock<BTreeMap<Uuid, HostConfig>>>;

/// Resource type over the configured agent hosts
pub struct AgentInventory {
    hosts: HostMap,
    client: reqwest::Client,
}

impl AgentInventory {
    pub fn new(hosts: Vec<HostConfig>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build agent HTTP client")?;

        let hosts = hosts.into_iter().map(|host| (host.id, host)).collect();
        Ok(Self {
            hosts: Arc::new(RwLock::new(hosts)),
            client,
        })
    }

    /// Add or replace a host
    pub fn insert(&self, host: HostConfig) {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.id, host);
    }

    pub fn remove(&self, id: &Uuid) -> Option<HostConfig> {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResourceType for AgentInventory {
    fn name(&self) -> &str {
        "agent_host"
    }

    fn stream_in_range<'a>(
        &'a self,
        range: &'a IdRange,
    ) -> BoxStream<'a, anyhow::Result<Arc<dyn Resource>>> {
        let hosts: Vec<anyhow::Result<Arc<dyn Resource>>> = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|host| range.contains(&host.id))
            .map(|host| {
                let host = AgentHost {
                    id: host.id,
                    config: RwLock::new(host.clone()),
                    inventory: self.hosts.clone(),
                    client: self.client.clone(),
                };
                Ok(Arc::new(host) as Arc<dyn Resource>)
            })
            .collect();
        futures::stream::iter(hosts).boxed()
    }

    async fn estimate_count(&self) -> anyhow::Result<usize> {
        Ok(self.len())
    }
}

/// A single agent host
pub struct AgentHost {
    id: Uuid,
    config: RwLock<HostConfig>,
    inventory: HostMap,
    client: reqwest::Client,
}

impl AgentHost {
    fn config(&self) -> HostConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn display_name(&self) -> String {
        let config = self.config();
        config
            .display
            .unwrap_or_else(|| format!("{}:{}", config.ip, config.port))
    }

    fn open_session(&self) -> SessionRef {
        let config = self.config();
        Arc::new(AgentSession {
            client: self.client.clone(),
            metrics_url: format!("http://{}:{}/metrics", config.ip, config.port),
            token: config.token,
            closed: AtomicBool::new(false),
        })
    }

    fn samples(&self, metrics: &ServerMetrics) -> Vec<Sample> {
        let now = Utc::now();
        let host = self.id.to_string();
        let display = self.display_name();
        let sample = |metric: &str, value: f64| {
            Sample::new(metric, value, now)
                .with_label("host", host.clone())
                .with_label("display", display.clone())
        };

        let mut samples = vec![
            sample("memory_used_bytes", metrics.memory.used as f64),
            sample("memory_total_bytes", metrics.memory.total as f64),
            sample("swap_used_bytes", metrics.memory.used_swap as f64),
            sample("swap_total_bytes", metrics.memory.total_swap as f64),
            sample("cpu_usage_percent", f64::from(metrics.cpus.average_usage)),
        ];

        for cpu in &metrics.cpus.cpus {
            samples.push(
                sample("cpu_core_usage_percent", f64::from(cpu.usage)).with_label("cpu", &cpu.name),
            );
        }

        if let Some(temperature) = metrics.components.average_temperature {
            samples.push(sample("temperature_celsius", f64::from(temperature)));
        }
        for component in &metrics.components.components {
            if let Some(temperature) = component.temperature {
                samples.push(
                    sample("component_temperature_celsius", f64::from(temperature))
                        .with_label("component", &component.name),
                );
            }
        }

        samples
    }
}

#[async_trait]
impl Resource for AgentHost {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &str {
        "agent_host"
    }

    async fn reload(&self) -> ResourceResult<()> {
        let current = self
            .inventory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.id)
            .cloned();

        match current {
            Some(config) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
                Ok(())
            }
            None => Err(ResourceError::NotFound),
        }
    }

    async fn open_health_session(&self) -> ResourceResult<SessionRef> {
        Ok(self.open_session())
    }

    async fn open_metrics_session(&self) -> ResourceResult<SessionRef> {
        Ok(self.open_session())
    }

    #[instrument(skip_all, fields(host = %self.id))]
    async fn check_pulse(
        &self,
        session: &SessionRef,
        previous: Option<&Pulse>,
    ) -> ResourceResult<Pulse> {
        let session = AgentSession::downcast(session)?;

        let (reading, data) = match session.fetch().await {
            Ok(metrics) => {
                let mut data = serde_json::Map::new();
                data.insert("cpu_usage".into(), json!(metrics.cpus.average_usage));
                data.insert("memory_used".into(), json!(metrics.memory.used));
                (Reading::Up, data)
            }
            Err(FetchError::Unreachable(reason)) => {
                let mut data = serde_json::Map::new();
                data.insert("reason".into(), json!(reason));
                (Reading::Down, data)
            }
            Err(FetchError::Resource(e)) => return Err(e),
        };

        trace!(%reading, "agent probed");
        Ok(Pulse::aggregate(previous, reading, data))
    }

    async fn export_metrics(&self, session: &SessionRef, tsdb: &TsdbClient) -> ResourceResult<usize> {
        let session = AgentSession::downcast(session)?;

        let metrics = match session.fetch().await {
            Ok(metrics) => metrics,
            Err(FetchError::Unreachable(reason)) => return Err(ResourceError::Probe(reason)),
            Err(FetchError::Resource(e)) => return Err(e),
        };

        tsdb.import(&self.samples(&metrics))
            .await
            .map_err(|e| ResourceError::Probe(format!("{e:#}")))
    }
}

enum FetchError {
    /// The agent did not answer usefully; a down reading, not a failure
    Unreachable(String),
    Resource(ResourceError),
}

/// Reusable HTTP session to one agent
pub struct AgentSession {
    client: reqwest::Client,
    metrics_url: String,
    token: Option<String>,
    closed: AtomicBool,
}

impl AgentSession {
    fn downcast(session: &SessionRef) -> ResourceResult<&AgentSession> {
        session
            .as_any()
            .downcast_ref::<AgentSession>()
            .ok_or_else(|| ResourceError::Session("not an agent session".into()))
    }

    pub fn metrics_url(&self) -> &str {
        &self.metrics_url
    }

    async fn fetch(&self) -> Result<ServerMetrics, FetchError> {
        if self.is_closed() {
            return Err(FetchError::Resource(ResourceError::Disconnected(
                "agent session closed".into(),
            )));
        }

        trace!("requesting metrics from {}", self.metrics_url);
        let mut request = self.client.get(&self.metrics_url);
        if let Some(token) = &self.token {
            request = request.header(SECRET_HEADER, token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Err(FetchError::Unreachable(e.to_string()));
            }
            Err(e) => {
                return Err(FetchError::Resource(ResourceError::Disconnected(e.to_string())));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Resource(ResourceError::Disconnected(e.to_string())))?;

        serde_json::from_str(&body).map_err(|e| {
            FetchError::Resource(ResourceError::Probe(format!("failed to parse metrics JSON: {e}")))
        })
    }
}

#[async_trait]
impl Session for AgentSession {
    async fn close(&self) -> ResourceResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
