//! Fleet health and metrics scheduler
//!
//! Continuously polls liveness ("pulse") and exports metrics for a large,
//! changing population of resources. Cooperating processes split the
//! resource id keyspace between themselves ([`repartitioner`]), and each
//! process drives two worker pools ([`pool`]) from a single scheduling loop
//! ([`runner`]).

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod pool;
pub mod repartitioner;
pub mod resource;
pub mod runner;
pub mod tsdb;
pub mod util;
pub mod wrapper;

use serde::{Deserialize, Serialize};

/// Metrics document served by a host agent on `/metrics`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub system: SystemInformation,
    pub memory: MemoryInformation,
    pub cpus: CpuOverview,
    pub components: ComponentOverview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInformation {
    pub name: Option<String>,
    pub kernel_version: Option<String>,
    pub os_version: Option<String>,
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInformation {
    pub total: u64,
    pub used: u64,
    pub total_swap: u64,
    pub used_swap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuOverview {
    pub total: usize,
    pub arch: String,
    pub average_usage: f32,
    pub cpus: Vec<CpuInformation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInformation {
    pub name: String,
    pub frequency: u64,
    pub usage: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentOverview {
    pub average_temperature: Option<f32>,
    pub components: Vec<ComponentInformation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInformation {
    pub name: String,
    pub temperature: Option<f32>,
}
