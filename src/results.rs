// src/results.rs
//
// Benchmark result records, the coordinator-side aggregation and the two
// result sinks (CSV file and console table).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{duration_serde, TestCaseConfiguration};

pub const RESULTS_FILE_NAME: &str = "gosbench_results.csv";

const CSV_HEADER: [&str; 15] = [
    "TestName",
    "Operation Name",
    "Workers",
    "Object Size",
    "Completed Operations",
    "Failed Operations",
    "Ops/Second",
    "Total Bytes",
    "Bandwidth in Bytes/s",
    "Average Latency in ms",
    "Success Ratio",
    "Start Time",
    "Stop Time",
    "Test duration seen by server in seconds",
    "Test Options",
];

/// Per-driver snapshot of one finished test, shipped inside the
/// `work done` message and summed by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BenchmarkResult {
    pub host: String,
    pub test_name: String,
    pub operation_name: String,
    pub object_size: f64,
    pub operations: f64,
    pub failed_operations: f64,
    pub ops_per_second: f64,
    pub workers: usize,
    pub bytes: f64,
    /// Bytes per second of runtime.
    pub bandwidth: f64,
    /// Milliseconds.
    pub latency_avg: f64,
    pub success_ratio: f64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub options: String,
}

impl Default for BenchmarkResult {
    fn default() -> Self {
        BenchmarkResult {
            host: String::new(),
            test_name: String::new(),
            operation_name: String::new(),
            object_size: 0.0,
            operations: 0.0,
            failed_operations: 0.0,
            ops_per_second: 0.0,
            workers: 0,
            bytes: 0.0,
            bandwidth: 0.0,
            latency_avg: 0.0,
            success_ratio: 0.0,
            start_time: DateTime::UNIX_EPOCH,
            stop_time: DateTime::UNIX_EPOCH,
            duration: Duration::ZERO,
            options: String::new(),
        }
    }
}

/// Sum the per-driver results of one test into the aggregate record.
///
/// Operations, failures, bytes, ops/s, workers and bandwidth are summed;
/// latency and object size are averaged over drivers; the success ratio is
/// recomputed from the summed counters. Start/stop/duration are filled in by
/// the caller from the coordinator's own clock.
pub fn sum_benchmark_results(results: &[BenchmarkResult]) -> BenchmarkResult {
    let mut sum = BenchmarkResult::default();
    if results.is_empty() {
        return sum;
    }

    let mut latency_total = 0.0;
    let mut object_size_total = 0.0;
    for result in results {
        sum.bytes += result.bytes;
        sum.operations += result.operations;
        sum.failed_operations += result.failed_operations;
        sum.ops_per_second += result.ops_per_second;
        sum.bandwidth += result.bandwidth;
        sum.workers += result.workers;
        latency_total += result.latency_avg;
        object_size_total += result.object_size;
    }

    let attempts = sum.operations + sum.failed_operations;
    sum.success_ratio = if attempts > 0.0 {
        sum.operations / attempts
    } else {
        0.0
    };
    sum.latency_avg = latency_total / results.len() as f64;
    sum.object_size = object_size_total / results.len() as f64;
    sum.test_name = results[0].test_name.clone();
    sum.operation_name = results[0].operation_name.clone();
    sum.options = results[0].options.clone();
    sum
}

/// Composite operation name: `kind(weight)` per enabled kind joined by `-`,
/// or just the kind name when a single kind is enabled.
pub fn operation_name(test: &TestCaseConfiguration) -> String {
    let weights: [(&str, u32); 5] = [
        ("read", test.read_weight),
        ("existingRead", test.existing_read_weight),
        ("write", test.write_weight),
        ("list", test.list_weight),
        ("delete", test.delete_weight),
    ];
    let enabled: Vec<(&str, u32)> = weights.into_iter().filter(|(_, w)| *w > 0).collect();
    match enabled.len() {
        0 => "Unknown".to_string(),
        1 => enabled[0].0.to_string(),
        _ => enabled
            .iter()
            .map(|(name, weight)| format!("{}({})", name, weight))
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// Flat `key=value` rendering of the sizing and multipart settings, recorded
/// with every result row.
pub fn test_options_string(test: &TestCaseConfiguration) -> String {
    let pairs = [
        format!("object_size_min={}", test.objects.size_min),
        format!("object_size_max={}", test.objects.size_max),
        format!(
            "object_size_distribution={}",
            distribution_name(test.objects.size_distribution)
        ),
        format!("multipart_write_enabled={}", test.multipart.write_mpu_enabled),
        format!("multipart_write_part_size={}", test.multipart.write_part_size),
        format!("multipart_write_unit={}", test.multipart.write_unit),
        format!("multipart_read_enabled={}", test.multipart.read_mpu_enabled),
        format!("multipart_read_part_size={}", test.multipart.read_part_size),
        format!("multipart_read_unit={}", test.multipart.read_unit),
    ];
    pairs.join("~")
}

fn distribution_name(distribution: crate::config::Distribution) -> &'static str {
    match distribution {
        crate::config::Distribution::Constant => "constant",
        crate::config::Distribution::Random => "random",
        crate::config::Distribution::Sequential => "sequential",
    }
}

/// Append one aggregate row to the results CSV, creating it with a header
/// when absent. Tries the current directory first, then the system tmp dir.
pub fn write_result_to_csv(result: &BenchmarkResult) -> Result<()> {
    let candidates = [
        PathBuf::from(RESULTS_FILE_NAME),
        std::env::temp_dir().join(RESULTS_FILE_NAME),
    ];

    for path in &candidates {
        if path.exists() {
            return append_result_to_csv(path, result);
        }
    }
    for path in &candidates {
        if append_result_to_csv(path, result).is_ok() {
            return Ok(());
        }
    }
    bail!("could not write results CSV to the current directory or the tmp dir");
}

/// Append one row to the CSV at `path`, writing the header if the file is new.
pub fn append_result_to_csv(path: &Path, result: &BenchmarkResult) -> Result<()> {
    let created = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("could not open results CSV {}", path.display()))?;

    let mut writer = csv::Writer::from_writer(file);
    if created {
        writer
            .write_record(CSV_HEADER)
            .context("failed writing header to results csv")?;
    }
    writer
        .write_record(&[
            result.test_name.clone(),
            result.operation_name.clone(),
            format!("{}", result.workers),
            format!("{:.0}", result.object_size),
            format!("{:.0}", result.operations),
            format!("{:.0}", result.failed_operations),
            format!("{:.6}", result.ops_per_second),
            format!("{:.0}", result.bytes),
            format!("{:.6}", result.bandwidth),
            format!("{:.6}", result.latency_avg),
            format!("{:.2}", result.success_ratio),
            format!("{}", result.start_time.timestamp()),
            format!("{}", result.stop_time.timestamp()),
            format!("{:.6}", result.duration.as_secs_f64()),
            result.options.clone(),
        ])
        .context("failed writing line to results csv")?;
    writer.flush().context("failed flushing results csv")?;
    Ok(())
}

/// Print per-driver rows plus a Totals row as an aligned table on stdout.
pub fn write_results_to_console(driver_results: &[BenchmarkResult], total: &BenchmarkResult) {
    println!(
        "{:<18} {:<18} {:<22} {:>8} {:>12} {:>14} {:>11} {:>16} {:>12} {:>14} {:>11} {:>14} {:>10}",
        "HOST",
        "TEST NAME",
        "OP NAME",
        "WORKERS",
        "OBJECT SIZE",
        "COMPLETED OPS",
        "FAILED OPS",
        "OPS PER SECOND",
        "TOTAL MB",
        "BANDWIDTH (MB)",
        "LATENCY",
        "SUCCESS RATIO",
        "DURATION",
    );
    for result in driver_results {
        print_console_row(&result.host, result);
    }
    print_console_row("Totals", total);
}

fn print_console_row(host: &str, result: &BenchmarkResult) {
    const MEGABYTE: f64 = 1024.0 * 1024.0;
    println!(
        "{:<18} {:<18} {:<22} {:>8} {:>12.0} {:>14.0} {:>11.0} {:>9.2} ops/sec {:>9.2} MB {:>9.2} MB/s {:>8.2} ms {:>13.2}% {:>8.2} s",
        host,
        result.test_name,
        result.operation_name,
        result.workers,
        result.object_size,
        result.operations,
        result.failed_operations,
        result.ops_per_second,
        result.bytes / MEGABYTE,
        result.bandwidth / MEGABYTE,
        result.latency_avg,
        result.success_ratio * 100.0,
        result.duration.as_secs_f64(),
    );
}
