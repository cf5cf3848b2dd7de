// src/metrics.rs
//
// Per-driver metrics registry scoped by (testName, method), its reduction
// into a BenchmarkResult at `work done`, and the /metrics scrape endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tracing::info;

use crate::config::TestCaseConfiguration;
use crate::results::{operation_name, test_options_string, BenchmarkResult};

pub const DEFAULT_PROMETHEUS_PORT: u16 = 8888;

/// HTTP method label of an S3 operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    List,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::List => "LIST",
            Method::Delete => "DELETE",
        }
    }
}

/// Driver-owned metrics registry. Workers update it concurrently; the
/// snapshot step reads it once per test. All metrics carry the `gosbench`
/// namespace and a constant `version` label.
pub struct Metrics {
    registry: Registry,
    test_start: GaugeVec,
    test_end: GaugeVec,
    finished_ops: CounterVec,
    failed_ops: CounterVec,
    ops_latency: HistogramVec,
    uploaded_bytes: CounterVec,
    downloaded_bytes: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let mut labels = HashMap::new();
        labels.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        let registry = Registry::new_custom(Some("gosbench".to_string()), Some(labels))
            .context("failed to create metrics registry")?;

        let test_start = GaugeVec::new(
            Opts::new("test_start", "Start time of a test for Grafana annotations"),
            &["testName"],
        )?;
        let test_end = GaugeVec::new(
            Opts::new("test_end", "End time of a test for Grafana annotations"),
            &["testName"],
        )?;
        let finished_ops = CounterVec::new(
            Opts::new("finished_ops", "Finished S3 operations"),
            &["testName", "method"],
        )?;
        let failed_ops = CounterVec::new(
            Opts::new("failed_ops", "Failed S3 operations"),
            &["testName", "method"],
        )?;
        let ops_latency = HistogramVec::new(
            HistogramOpts::new("ops_latency", "Latency of S3 operations in ms")
                .buckets(exponential_buckets(2.0, 2.0, 12)?),
            &["testName", "method"],
        )?;
        let uploaded_bytes = CounterVec::new(
            Opts::new("uploaded_bytes", "Bytes uploaded to the S3 store"),
            &["testName", "method"],
        )?;
        let downloaded_bytes = CounterVec::new(
            Opts::new("downloaded_bytes", "Bytes downloaded from the S3 store"),
            &["testName", "method"],
        )?;

        registry.register(Box::new(test_start.clone()))?;
        registry.register(Box::new(test_end.clone()))?;
        registry.register(Box::new(finished_ops.clone()))?;
        registry.register(Box::new(failed_ops.clone()))?;
        registry.register(Box::new(ops_latency.clone()))?;
        registry.register(Box::new(uploaded_bytes.clone()))?;
        registry.register(Box::new(downloaded_bytes.clone()))?;

        Ok(Metrics {
            registry,
            test_start,
            test_end,
            finished_ops,
            failed_ops,
            ops_latency,
            uploaded_bytes,
            downloaded_bytes,
        })
    }

    /// Record one measured operation: latency always, then the finished or
    /// failed counter depending on the outcome.
    pub fn record_op(&self, test: &str, method: Method, latency: Duration, ok: bool) {
        self.ops_latency
            .with_label_values(&[test, method.as_str()])
            .observe(latency.as_secs_f64() * 1000.0);
        if ok {
            self.finished_ops.with_label_values(&[test, method.as_str()]).inc();
        } else {
            self.failed_ops.with_label_values(&[test, method.as_str()]).inc();
        }
    }

    pub fn add_uploaded_bytes(&self, test: &str, method: Method, bytes: u64) {
        self.uploaded_bytes
            .with_label_values(&[test, method.as_str()])
            .inc_by(bytes as f64);
    }

    pub fn add_downloaded_bytes(&self, test: &str, method: Method, bytes: u64) {
        self.downloaded_bytes
            .with_label_values(&[test, method.as_str()])
            .inc_by(bytes as f64);
    }

    pub fn mark_test_start(&self, test: &str) {
        self.test_start
            .with_label_values(&[test])
            .set(Utc::now().timestamp_millis() as f64);
    }

    pub fn mark_test_end(&self, test: &str) {
        self.test_end
            .with_label_values(&[test])
            .set(Utc::now().timestamp_millis() as f64);
    }

    /// Reduce the registry into a per-driver result for one test. Counters
    /// are summed over methods; latency is the histogram mean. Ops/sec and
    /// bandwidth are filled in by the caller from its observed duration.
    pub fn snapshot(&self, test: &TestCaseConfiguration, host: &str) -> BenchmarkResult {
        let mut result = BenchmarkResult {
            host: host.to_string(),
            test_name: test.name.clone(),
            operation_name: operation_name(test),
            workers: test.workers,
            options: test_options_string(test),
            ..BenchmarkResult::default()
        };

        let mut uploaded = 0.0;
        let mut downloaded = 0.0;
        let mut latency_sum = 0.0;
        let mut latency_count = 0.0;
        for family in self.registry.gather() {
            match family.get_name() {
                "gosbench_finished_ops" => {
                    result.operations = sum_counter_for_test(&family, &test.name);
                }
                "gosbench_failed_ops" => {
                    result.failed_operations = sum_counter_for_test(&family, &test.name);
                }
                "gosbench_uploaded_bytes" => {
                    uploaded = sum_counter_for_test(&family, &test.name);
                }
                "gosbench_downloaded_bytes" => {
                    downloaded = sum_counter_for_test(&family, &test.name);
                }
                "gosbench_ops_latency" => {
                    for metric in family.get_metric() {
                        if has_test_label(metric, &test.name) {
                            let histogram = metric.get_histogram();
                            latency_sum += histogram.get_sample_sum();
                            latency_count += histogram.get_sample_count() as f64;
                        }
                    }
                }
                _ => {}
            }
        }

        result.bytes = uploaded + downloaded;
        let attempts = result.operations + result.failed_operations;
        result.success_ratio = if attempts > 0.0 {
            result.operations / attempts
        } else {
            0.0
        };
        result.object_size = if attempts > 0.0 { result.bytes / attempts } else { 0.0 };
        result.latency_avg = if latency_count > 0.0 {
            latency_sum / latency_count
        } else {
            0.0
        };
        result
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }
}

fn has_test_label(metric: &prometheus::proto::Metric, test: &str) -> bool {
    metric
        .get_label()
        .iter()
        .any(|label| label.get_name() == "testName" && label.get_value() == test)
}

fn sum_counter_for_test(family: &prometheus::proto::MetricFamily, test: &str) -> f64 {
    family
        .get_metric()
        .iter()
        .filter(|metric| has_test_label(metric, test))
        .map(|metric| metric.get_counter().get_value())
        .sum()
}

/// Serve the scrape endpoint on `0.0.0.0:<port>` until the process exits.
pub async fn serve_metrics(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind metrics endpoint on port {}", port))?;
    info!(port, "serving Prometheus metrics on /metrics");
    axum::serve(listener, app)
        .await
        .context("metrics endpoint failed")
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> (StatusCode, String) {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BucketConfig, Distribution, MultipartConfig, ObjectConfig, TestCaseConfiguration,
    };

    fn test_case(name: &str) -> TestCaseConfiguration {
        TestCaseConfiguration {
            name: name.to_string(),
            objects: ObjectConfig {
                size_min: 1024,
                size_max: 1024,
                size_distribution: Distribution::Constant,
                number_min: 1,
                number_max: 1,
                number_distribution: Distribution::Constant,
                unit: "B".to_string(),
            },
            buckets: BucketConfig {
                number_min: 1,
                number_max: 1,
                number_distribution: Distribution::Constant,
            },
            multipart: MultipartConfig::default(),
            bucket_prefix: "b-".to_string(),
            object_prefix: "o".to_string(),
            runtime: Duration::from_secs(1),
            ops_deadline: 0,
            drivers: 1,
            drivers_share_buckets: true,
            workers: 4,
            clean_after: false,
            read_weight: 1,
            existing_read_weight: 0,
            write_weight: 1,
            list_weight: 0,
            delete_weight: 0,
        }
    }

    #[test]
    fn test_snapshot_reduces_counters_and_latency() {
        let metrics = Metrics::new().unwrap();
        let test = test_case("reduction");

        metrics.record_op("reduction", Method::Put, Duration::from_millis(10), true);
        metrics.record_op("reduction", Method::Put, Duration::from_millis(30), true);
        metrics.record_op("reduction", Method::Get, Duration::from_millis(20), false);
        metrics.add_uploaded_bytes("reduction", Method::Put, 2048);
        metrics.add_downloaded_bytes("reduction", Method::Get, 1024);

        let result = metrics.snapshot(&test, "host-a");
        assert_eq!(result.operations, 2.0);
        assert_eq!(result.failed_operations, 1.0);
        assert_eq!(result.bytes, 3072.0);
        assert_eq!(result.object_size, 1024.0);
        assert!((result.latency_avg - 20.0).abs() < 1e-9);
        assert!((result.success_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.host, "host-a");
        assert_eq!(result.workers, 4);
        assert_eq!(result.operation_name, "read(1)-write(1)");
        // Per-driver rates are recomputed from the observed duration later.
        assert_eq!(result.ops_per_second, 0.0);
        assert_eq!(result.bandwidth, 0.0);
    }

    #[test]
    fn test_snapshot_is_scoped_to_test_name() {
        let metrics = Metrics::new().unwrap();
        metrics.record_op("one", Method::Put, Duration::from_millis(5), true);
        metrics.record_op("two", Method::Put, Duration::from_millis(5), true);
        metrics.add_uploaded_bytes("two", Method::Put, 512);

        let result = metrics.snapshot(&test_case("one"), "host");
        assert_eq!(result.operations, 1.0);
        assert_eq!(result.bytes, 0.0);
    }

    #[test]
    fn test_empty_snapshot_guards_division() {
        let metrics = Metrics::new().unwrap();
        let result = metrics.snapshot(&test_case("empty"), "host");
        assert_eq!(result.operations, 0.0);
        assert_eq!(result.object_size, 0.0);
        assert_eq!(result.latency_avg, 0.0);
        assert_eq!(result.success_ratio, 0.0);
    }

    #[test]
    fn test_render_exposes_namespaced_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_op("render", Method::Delete, Duration::from_millis(3), true);
        metrics.mark_test_start("render");

        let body = metrics.render().unwrap();
        assert!(body.contains("gosbench_finished_ops"));
        assert!(body.contains("gosbench_ops_latency_bucket"));
        assert!(body.contains("gosbench_test_start"));
        assert!(body.contains("version="));
        // Exponential buckets, base 2, starting at 2 ms.
        assert!(body.contains("le=\"2\""));
        assert!(body.contains("le=\"4096\""));
    }
}
