// src/bin/driver.rs

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing::error;

use gosbench::driver::{default_store_factory, Driver};
use gosbench::metrics::{serve_metrics, Metrics, DEFAULT_PROMETHEUS_PORT};

#[derive(Parser)]
#[command(
    name = "gosbench-driver",
    version,
    about = "Load-generating driver for distributed S3 benchmarks"
)]
struct Cli {
    /// Coordinator address, e.g. 192.168.1.1:2000
    #[arg(short = 's', long = "server")]
    server: String,

    /// Port for the Prometheus /metrics endpoint
    #[arg(short = 'p', long = "prometheus-port", default_value_t = DEFAULT_PROMETHEUS_PORT)]
    prometheus_port: u16,

    /// Enable debug log output
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Enable trace log output
    #[arg(short = 't', long = "trace")]
    trace: bool,
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
    let filter = EnvFilter::new(format!("gosbench={0},gosbench_driver={0}", level));
    fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.debug, cli.trace);

    let metrics = Arc::new(Metrics::new()?);
    let scrape_registry = metrics.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_metrics(scrape_registry, cli.prometheus_port).await {
            error!(error = %err, "prometheus endpoint failed");
        }
    });

    let driver = Driver::new(cli.server, metrics, default_store_factory());
    driver.run().await
}
