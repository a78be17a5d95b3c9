//! Time-series database client
//!
//! Samples are pushed in Prometheus text exposition format to a
//! VictoriaMetrics style `/api/v1/import/prometheus` endpoint.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{instrument, trace};

const IMPORT_PATH: &str = "/api/v1/import/prometheus";

/// A single time-series sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            labels: BTreeMap::new(),
            value,
            timestamp,
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// `metric{label="value",...} value timestamp_ms`
    pub fn to_exposition_line(&self) -> String {
        let mut line = self.metric.clone();
        if !self.labels.is_empty() {
            line.push('{');
            for (i, (name, value)) in self.labels.iter().enumerate() {
                if i > 0 {
                    line.push(',');
                }
                let _ = write!(line, "{}=\"{}\"", name, escape_label_value(value));
            }
            line.push('}');
        }
        let _ = write!(line, " {} {}", self.value, self.timestamp.timestamp_millis());
        line
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// HTTP client for the TSDB import endpoint
#[derive(Debug, Clone)]
pub struct TsdbClient {
    client: reqwest::Client,
    endpoint: String,
}

impl TsdbClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build TSDB HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Push `samples`, returning how many were sent
    #[instrument(skip(self, samples), fields(endpoint = %self.endpoint, count = samples.len()))]
    pub async fn import(&self, samples: &[Sample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }

        let body = samples
            .iter()
            .map(Sample::to_exposition_line)
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .client
            .post(format!("{}{}", self.endpoint, IMPORT_PATH))
            .body(body)
            .send()
            .await
            .context("failed to send samples to TSDB")?;

        if !response.status().is_success() {
            anyhow::bail!("TSDB import failed: HTTP {}", response.status());
        }

        trace!("imported samples");
        Ok(samples.len())
    }
}
