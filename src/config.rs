// src/config.rs
//
// Workload and endpoint configuration: schema, validation and the
// byte-unit / distribution arithmetic used by the work-plan generator.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

// Base-2 units: 1 KB = 1024 B.
pub const BYTE: u64 = 1;
pub const KILOBYTE: u64 = 1 << 10;
pub const MEGABYTE: u64 = 1 << 20;
pub const GIGABYTE: u64 = 1 << 30;
pub const TERABYTE: u64 = 1 << 40;

/// Everything needed to talk to one S3 endpoint.
/// Immutable once loaded; shipped to drivers verbatim inside the init message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Configuration {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub region: String,
    pub endpoint: String,
    /// Per-request timeout; zero disables the limit.
    #[serde(default, with = "duration_serde")]
    pub timeout: Duration,
    #[serde(rename = "skipSSLverify", default)]
    pub skip_ssl_verify: bool,
    #[serde(rename = "proxyHost", default)]
    pub proxy_host: String,
}

/// Credentials for the Grafana HTTP API. Only consumed for the annotation
/// log line after each test; kept in the schema for config compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrafanaConfiguration {
    pub username: String,
    pub password: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Constant,
    Random,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub size_min: u64,
    pub size_max: u64,
    pub size_distribution: Distribution,
    pub number_min: u64,
    pub number_max: u64,
    pub number_distribution: Distribution,
    /// Unit applied to size_min/size_max during validation (B/KB/MB/GB/TB).
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub number_min: u64,
    pub number_max: u64,
    pub number_distribution: Distribution,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultipartConfig {
    #[serde(default)]
    pub write_mpu_enabled: bool,
    #[serde(default)]
    pub write_part_size: u64,
    #[serde(default)]
    pub write_concurrency: usize,
    #[serde(default)]
    pub write_unit: String,
    #[serde(default)]
    pub read_mpu_enabled: bool,
    #[serde(default)]
    pub read_part_size: u64,
    #[serde(default)]
    pub read_concurrency: usize,
    #[serde(default)]
    pub read_unit: String,
}

/// One performance test: sizing, naming, stop condition, fleet shape and the
/// five operation weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseConfiguration {
    pub name: String,
    pub objects: ObjectConfig,
    pub buckets: BucketConfig,
    #[serde(default)]
    pub multipart: MultipartConfig,
    #[serde(default)]
    pub bucket_prefix: String,
    #[serde(default)]
    pub object_prefix: String,
    #[serde(rename = "stop_with_runtime", default, with = "duration_serde")]
    pub runtime: Duration,
    #[serde(rename = "stop_with_ops", default)]
    pub ops_deadline: u64,
    pub drivers: usize,
    #[serde(default)]
    pub drivers_share_buckets: bool,
    pub workers: usize,
    #[serde(default)]
    pub clean_after: bool,
    #[serde(default)]
    pub read_weight: u32,
    #[serde(default)]
    pub existing_read_weight: u32,
    #[serde(default)]
    pub write_weight: u32,
    #[serde(default)]
    pub list_weight: u32,
    #[serde(default)]
    pub delete_weight: u32,
}

/// Shape of the workload file: an optional Grafana block plus the tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workloadconf {
    #[serde(default)]
    pub grafana_config: Option<GrafanaConfiguration>,
    pub tests: Vec<TestCaseConfiguration>,
}

/// Full coordinator configuration: endpoint credentials plus the workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testconf {
    pub s3_config: Vec<S3Configuration>,
    #[serde(default)]
    pub grafana_config: Option<GrafanaConfiguration>,
    pub tests: Vec<TestCaseConfiguration>,
}

impl TestCaseConfiguration {
    /// Validate the invariants every test case must satisfy. Pure check,
    /// run both by the coordinator at load time and by drivers on init.
    pub fn check(&self) -> Result<()> {
        if self.runtime.is_zero() && self.ops_deadline == 0 {
            bail!("either stop_with_runtime or stop_with_ops needs to be set");
        }
        if self.read_weight == 0
            && self.existing_read_weight == 0
            && self.write_weight == 0
            && self.list_weight == 0
            && self.delete_weight == 0
        {
            bail!("at least one weight needs to be set - read / write / list / delete");
        }
        if self.existing_read_weight != 0 && self.bucket_prefix.is_empty() {
            bail!("when using existing_read_weight, setting the bucket_prefix is mandatory");
        }
        if self.buckets.number_min == 0 {
            bail!("please set minimum number of buckets");
        }
        if self.objects.size_min == 0 {
            bail!("please set minimum size of objects");
        }
        if self.objects.size_max == 0 {
            bail!("please set maximum size of objects");
        }
        if self.objects.number_min == 0 {
            bail!("please set minimum number of objects");
        }
        if self.objects.unit.is_empty() {
            bail!("please set the objects unit");
        }
        if self.drivers == 0 {
            bail!("please set the number of drivers");
        }
        if self.workers == 0 {
            bail!("please set the number of workers");
        }
        Ok(())
    }

    /// Normalize all sized fields to bytes using their declared units.
    /// Called exactly once, by the coordinator, after `check`.
    pub fn normalize(&mut self) -> Result<()> {
        let multiplier = byte_multiplier(&self.objects.unit)?;
        self.objects.size_min *= multiplier;
        self.objects.size_max *= multiplier;

        if self.multipart.write_mpu_enabled {
            let multiplier = byte_multiplier(&self.multipart.write_unit)
                .context("multipart write_unit")?;
            self.multipart.write_part_size *= multiplier;
        }
        if self.multipart.read_mpu_enabled {
            let multiplier =
                byte_multiplier(&self.multipart.read_unit).context("multipart read_unit")?;
            self.multipart.read_part_size *= multiplier;
        }
        Ok(())
    }
}

/// Validate and normalize every test in the config. Fatal at startup.
pub fn check_config(config: &mut Testconf) -> Result<()> {
    if config.s3_config.is_empty() {
        bail!("at least one S3 endpoint configuration is required");
    }
    for test in &mut config.tests {
        test.check()
            .with_context(|| format!("test case {:?}", test.name))?;
        test.normalize()
            .with_context(|| format!("test case {:?}", test.name))?;
    }
    Ok(())
}

/// Map a size unit to its base-1024 byte multiplier.
pub fn byte_multiplier(unit: &str) -> Result<u64> {
    match unit.to_uppercase().as_str() {
        "B" => Ok(BYTE),
        "KB" | "K" => Ok(KILOBYTE),
        "MB" | "M" => Ok(MEGABYTE),
        "GB" | "G" => Ok(GIGABYTE),
        "TB" | "T" => Ok(TERABYTE),
        other => Err(anyhow!(
            "could not parse unit size {:?} - please use one of B/KB/MB/GB/TB",
            other
        )),
    }
}

/// Draw the next value from a distribution.
///
/// `last` is the per-draw-site state for `sequential` mode; it persists for
/// the duration of the test and starts at zero.
pub fn evaluate_distribution(
    min: u64,
    max: u64,
    last: &mut u64,
    increment: u64,
    distribution: Distribution,
) -> u64 {
    match distribution {
        Distribution::Constant => min,
        Distribution::Random => {
            if max <= min {
                return min;
            }
            rand::rng().random_range(min..max)
        }
        Distribution::Sequential => {
            *last = (*last + increment).min(max);
            *last
        }
    }
}

/// Load the workload file (YAML or JSON, by extension).
pub fn load_workload_file(path: &Path) -> Result<Workloadconf> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("error reading workload config file {}", path.display()))?;
    parse_by_extension(path, &content).context("error parsing workload config file")
}

/// Load the S3 endpoint list (YAML or JSON, by extension).
pub fn load_s3_file(path: &Path) -> Result<Vec<S3Configuration>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("error reading S3 config file {}", path.display()))?;
    parse_by_extension(path, &content).context("error parsing S3 config file")
}

fn parse_by_extension<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(content).map_err(Into::into),
        Some("json") => serde_json::from_str(content).map_err(Into::into),
        _ => bail!(
            "configuration file {} must be a yaml or json formatted file",
            path.display()
        ),
    }
}

/// Durations on the wire and in config files: either a bare number of
/// nanoseconds or a humantime string ("30s", "5m"). Serialized as a string.
pub mod duration_serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Nanos(u64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Nanos(nanos) => Ok(Duration::from_nanos(nanos)),
            Raw::Float(nanos) => {
                if nanos < 0.0 {
                    return Err(Error::custom("duration must not be negative"));
                }
                Ok(Duration::from_nanos(nanos as u64))
            }
            Raw::Text(text) => humantime::parse_duration(&text).map_err(Error::custom),
        }
    }
}
