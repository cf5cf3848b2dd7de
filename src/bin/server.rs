// src/bin/server.rs

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;

use gosbench::config::{check_config, load_s3_file, load_workload_file, Testconf};
use gosbench::coordinator::{self, CoordinatorOpts, DEFAULT_CONTROL_PORT};

#[derive(Parser)]
#[command(
    name = "gosbench-server",
    version,
    about = "Coordinator for distributed S3 load generation"
)]
struct Cli {
    /// Config file describing the test run
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// S3 endpoint configuration file
    #[arg(short = 's', long = "s3-config")]
    s3_config: PathBuf,

    /// Port on which the server will be available for drivers
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Enable debug log output
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Enable trace log output
    #[arg(short = 't', long = "trace")]
    trace: bool,

    /// How long to wait on a phase barrier before giving up on a test
    #[arg(long = "barrier-timeout", value_parser = humantime::parse_duration, default_value = "5m")]
    barrier_timeout: Duration,
}

fn init_logging(debug: bool, trace: bool) {
    use tracing_subscriber::{fmt, EnvFilter};
    let level = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::new(format!("gosbench={0},gosbench_server={0}", level));
    fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.debug, cli.trace);

    let workload = load_workload_file(&cli.config)?;
    let s3_config = load_s3_file(&cli.s3_config)?;
    let mut config = Testconf {
        s3_config,
        grafana_config: workload.grafana_config,
        tests: workload.tests,
    };
    check_config(&mut config).context("issue detected when scanning through the config file")?;

    let opts = CoordinatorOpts {
        port: cli.port,
        barrier_timeout: cli.barrier_timeout,
        ..CoordinatorOpts::default()
    };
    coordinator::run(config, opts).await?;
    info!("shutting down server");
    Ok(())
}
