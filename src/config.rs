use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use tracing::trace;
use uuid::Uuid;

use crate::pool::StuckJobInfo;
use crate::repartitioner::RepartitionerConfig;
use crate::runner::RunnerSettings;

/// Monitor process configuration, read from a JSON file
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitorConfig {
    /// This process's 1-based partition number
    #[serde(default = "default_partition")]
    pub partition: u32,

    /// Pub/sub channel used to discover peer partitions
    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_listen_timeout_secs")]
    pub listen_timeout_secs: u64,

    #[serde(default = "default_recheck_secs")]
    pub recheck_secs: u64,

    #[serde(default = "default_stale_secs")]
    pub stale_secs: u64,

    #[serde(default = "default_max_partition")]
    pub max_partition: u32,

    #[serde(default = "default_scan_every_secs")]
    pub scan_every_secs: u64,

    #[serde(default = "default_report_every_secs")]
    pub report_every_secs: u64,

    #[serde(default = "default_enqueue_every_secs")]
    pub enqueue_every_secs: u64,

    #[serde(default = "default_check_stuck_every_secs")]
    pub check_stuck_every_secs: u64,

    /// Worker hint of the health pool
    #[serde(default = "default_health_workers")]
    pub health_workers: usize,

    /// Worker hint of the metrics-export pool
    #[serde(default = "default_metrics_workers")]
    pub metrics_workers: usize,

    /// Tasks kept aside for the scheduler and the listen loop
    #[serde(default = "default_reserved_tasks")]
    pub reserved_tasks: usize,

    #[serde(default = "default_stuck_pulse_timeout_secs")]
    pub stuck_pulse_timeout_secs: u64,

    #[serde(default = "default_stuck_export_timeout_secs")]
    pub stuck_export_timeout_secs: u64,

    #[serde(default = "default_session_fresh_secs")]
    pub session_fresh_secs: u64,

    /// Postgres connection for the peer-partition channel (in-process bus if absent)
    pub database_url: Option<String>,

    /// Metrics export target (export is skipped if absent)
    pub tsdb: Option<TsdbConfig>,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TsdbConfig {
    pub endpoint: String,
}

/// A host running the metrics agent
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HostConfig {
    pub id: Uuid,
    pub ip: IpAddr,
    pub display: Option<String>,
    #[serde(default = "crate::util::get_default_port")]
    pub port: u16,
    pub token: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            partition: default_partition(),
            channel: default_channel(),
            listen_timeout_secs: default_listen_timeout_secs(),
            recheck_secs: default_recheck_secs(),
            stale_secs: default_stale_secs(),
            max_partition: default_max_partition(),
            scan_every_secs: default_scan_every_secs(),
            report_every_secs: default_report_every_secs(),
            enqueue_every_secs: default_enqueue_every_secs(),
            check_stuck_every_secs: default_check_stuck_every_secs(),
            health_workers: default_health_workers(),
            metrics_workers: default_metrics_workers(),
            reserved_tasks: default_reserved_tasks(),
            stuck_pulse_timeout_secs: default_stuck_pulse_timeout_secs(),
            stuck_export_timeout_secs: default_stuck_export_timeout_secs(),
            session_fresh_secs: default_session_fresh_secs(),
            database_url: None,
            tsdb: None,
            hosts: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Overlay `MONITOR_PARTITION` and `MONITOR_DATABASE_URL` if set
    pub fn apply_env(&mut self) {
        if let Some(partition) = crate::util::get_partition() {
            self.partition = partition;
        }
        if let Some(url) = crate::util::get_database_url() {
            self.database_url = Some(url);
        }
    }

    pub fn repartitioner_config(&self) -> RepartitionerConfig {
        RepartitionerConfig {
            partition_number: self.partition,
            channel: self.channel.clone(),
            listen_timeout: Duration::from_secs(self.listen_timeout_secs),
            recheck_interval: Duration::from_secs(self.recheck_secs),
            stale_after: Duration::from_secs(self.stale_secs),
            max_partition: self.max_partition,
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            scan_every: Duration::from_secs(self.scan_every_secs),
            report_every: Duration::from_secs(self.report_every_secs),
            enqueue_every: Duration::from_secs(self.enqueue_every_secs),
            check_stuck_pulses_every: Duration::from_secs(self.check_stuck_every_secs),
            ..RunnerSettings::default()
        }
    }

    pub fn stuck_pulse_info(&self) -> StuckJobInfo {
        StuckJobInfo {
            timeout: Duration::from_secs(self.stuck_pulse_timeout_secs),
            message: String::from("Pulse check has stuck."),
            key: String::from("pulse_check_stuck"),
        }
    }

    pub fn stuck_export_info(&self) -> StuckJobInfo {
        StuckJobInfo {
            timeout: Duration::from_secs(self.stuck_export_timeout_secs),
            message: String::from("Metrics export has stuck."),
            key: String::from("metrics_export_stuck"),
        }
    }

    pub fn session_fresh_for(&self) -> Duration {
        Duration::from_secs(self.session_fresh_secs)
    }
}

fn default_partition() -> u32 {
    1
}

fn default_channel() -> String {
    String::from("monitor")
}

fn default_listen_timeout_secs() -> u64 {
    1
}

fn default_recheck_secs() -> u64 {
    18
}

fn default_stale_secs() -> u64 {
    40
}

fn default_max_partition() -> u32 {
    8
}

fn default_scan_every_secs() -> u64 {
    60
}

fn default_report_every_secs() -> u64 {
    5
}

fn default_enqueue_every_secs() -> u64 {
    5
}

fn default_check_stuck_every_secs() -> u64 {
    5
}

fn default_health_workers() -> usize {
    64
}

fn default_metrics_workers() -> usize {
    16
}

fn default_reserved_tasks() -> usize {
    2
}

fn default_stuck_pulse_timeout_secs() -> u64 {
    120
}

fn default_stuck_export_timeout_secs() -> u64 {
    300
}

fn default_session_fresh_secs() -> u64 {
    8
}

pub fn read_config_file(path: &str) -> anyhow::Result<MonitorConfig> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<MonitorConfig> {
    serde_json::from_str(content)
        .context("Invalid configuration file provided!")
        .inspect(|config| trace!("loaded config: {config:?}"))
}
