use crate::{
    annotations::{self, parse_bool, InvalidBool},
    ports,
};
use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;

const DEFAULT_SERVICE_METRICS_PATH: &str = "/metrics";

/// Controller-wide metrics defaults, overridable per pod through annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsConfig {
    pub default_enable_metrics: bool,
    pub default_enable_metrics_merging: bool,
    pub default_merged_metrics_port: String,
    pub default_prometheus_scrape_port: String,
    pub default_prometheus_scrape_path: String,
}

/// Ports served by the merged metrics server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedMetrics {
    pub merged_port: i32,
    pub service_port: Option<i32>,
    pub service_path: String,
}

// === impl MetricsConfig ===

impl MetricsConfig {
    pub fn enable_metrics(&self, pod: &Pod) -> Result<bool, InvalidBool> {
        self.toggle(pod, annotations::ENABLE_METRICS, self.default_enable_metrics)
    }

    pub fn enable_metrics_merging(&self, pod: &Pod) -> Result<bool, InvalidBool> {
        self.toggle(
            pod,
            annotations::ENABLE_METRICS_MERGING,
            self.default_enable_metrics_merging,
        )
    }

    fn toggle(&self, pod: &Pod, key: &str, default: bool) -> Result<bool, InvalidBool> {
        match annotations::pod_annotation(pod, key).filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_bool(key, raw),
            None => Ok(default),
        }
    }

    pub fn prometheus_scrape_port(&self, pod: &Pod) -> Result<Option<i32>> {
        ports::determine_and_validate_port(
            pod,
            annotations::PROMETHEUS_SCRAPE_PORT,
            &self.default_prometheus_scrape_port,
            false,
        )
    }

    pub fn prometheus_scrape_path(&self, pod: &Pod) -> String {
        annotations::pod_annotation(pod, annotations::PROMETHEUS_SCRAPE_PATH)
            .filter(|raw| !raw.is_empty())
            .unwrap_or(&self.default_prometheus_scrape_path)
            .to_string()
    }

    pub fn merged_metrics_port(&self, pod: &Pod) -> Result<Option<i32>> {
        ports::determine_and_validate_port(
            pod,
            annotations::MERGED_METRICS_PORT,
            &self.default_merged_metrics_port,
            false,
        )
    }

    /// The application's own metrics port, defaulting to the service port.
    pub fn service_metrics_port(&self, pod: &Pod) -> Result<Option<i32>> {
        let default = annotations::pod_annotation(pod, annotations::SERVICE_PORT)
            .filter(|raw| !raw.is_empty())
            .unwrap_or("0");
        ports::determine_and_validate_port(pod, annotations::SERVICE_METRICS_PORT, default, true)
    }

    /// Metrics merging runs only when metrics and merging are enabled and the application
    /// exposes a metrics port.
    pub fn should_run_merged_metrics_server(&self, pod: &Pod) -> Result<bool> {
        let enabled = self.enable_metrics(pod)? && self.enable_metrics_merging(pod)?;
        let service_port = self.service_metrics_port(pod)?.unwrap_or_default();
        Ok(enabled && service_port > 0)
    }

    pub fn merged_metrics(&self, pod: &Pod) -> Result<MergedMetrics> {
        anyhow::ensure!(
            self.should_run_merged_metrics_server(pod)?,
            "metrics merging should be enabled in order to return the metrics server configuration"
        );
        let merged_port = self
            .merged_metrics_port(pod)?
            .ok_or_else(|| anyhow::anyhow!("no merged metrics port configured"))?;
        Ok(MergedMetrics {
            merged_port,
            service_port: self.service_metrics_port(pod).ok().flatten(),
            service_path: DEFAULT_SERVICE_METRICS_PATH.to_string(),
        })
    }
}
