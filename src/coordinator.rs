// src/coordinator.rs
//
// The coordinator: accepts driver connections into a ready pool, stages each
// test across the requested number of drivers, enforces the two phase
// barriers and reduces the per-driver results into the aggregate record.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{S3Configuration, TestCaseConfiguration, Testconf};
use crate::protocol::{
    Connection, DriverConf, DriverMessage, MSG_PREPARATIONS_DONE, MSG_SHUTDOWN, MSG_START_WORK,
    MSG_WORK_DONE, READY_GREETING,
};
use crate::results::{
    append_result_to_csv, sum_benchmark_results, write_result_to_csv, write_results_to_console,
    BenchmarkResult,
};

pub const DEFAULT_CONTROL_PORT: u16 = 2000;

pub struct CoordinatorOpts {
    /// Control port drivers connect to.
    pub port: u16,
    /// Bound on each barrier wait; a test whose drivers do not all arrive
    /// within this window is abandoned with the missing drivers named.
    pub barrier_timeout: Duration,
    /// Pause between barrier 1 and `start work` so drivers quiesce.
    pub settle_delay: Duration,
    /// Explicit results CSV path; the default is the current directory with
    /// a tmp-dir fallback.
    pub results_path: Option<PathBuf>,
}

impl Default for CoordinatorOpts {
    fn default() -> Self {
        CoordinatorOpts {
            port: DEFAULT_CONTROL_PORT,
            barrier_timeout: Duration::from_secs(300),
            settle_delay: Duration::from_secs(5),
            results_path: None,
        }
    }
}

/// Everything the coordinator learned about one finished test.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub driver_results: Vec<BenchmarkResult>,
    pub aggregate: BenchmarkResult,
}

type ControlConnection = Connection<TcpStream>;

/// Bind the control port and run the whole plan.
pub async fn run(config: Testconf, opts: CoordinatorOpts) -> Result<Vec<TestReport>> {
    let listener = TcpListener::bind(("0.0.0.0", opts.port))
        .await
        .with_context(|| format!("could not open port {}", opts.port))?;
    run_with_listener(config, listener, &opts).await
}

/// Run the whole plan on an already bound listener. Returns one report per
/// completed test; abandoned tests are logged and skipped.
pub async fn run_with_listener(
    config: Testconf,
    listener: TcpListener,
    opts: &CoordinatorOpts,
) -> Result<Vec<TestReport>> {
    info!("ready to accept connections");
    let (ready_tx, ready_rx) = mpsc::channel::<ControlConnection>(1);
    let accept_loop = tokio::spawn(accept_drivers(listener, ready_tx));
    let outcome = schedule_tests(&config, ready_rx, opts).await;
    accept_loop.abort();
    outcome
}

/// Accept loop: handshake every connection and move greeted drivers into the
/// ready pool. Connections that fail to greet are closed silently.
async fn accept_drivers(listener: TcpListener, ready_tx: mpsc::Sender<ControlConnection>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(error = %err, "issue when waiting for driver connections");
                continue;
            }
        };
        info!(%peer, "driver connected to us");
        let ready_tx = ready_tx.clone();
        tokio::spawn(async move {
            let mut conn = Connection::new(stream);
            match conn.recv::<String>().await {
                Ok(greeting) if greeting == READY_GREETING => {
                    debug!(%peer, "we have a new driver");
                    let _ = ready_tx.send(conn).await;
                }
                Ok(other) => {
                    warn!(%peer, message = %other, "unexpected greeting - closing connection");
                }
                Err(err) => {
                    debug!(%peer, error = %err, "could not decode greeting - closing connection");
                }
            }
        });
    }
}

async fn schedule_tests(
    config: &Testconf,
    mut ready_rx: mpsc::Receiver<ControlConnection>,
    opts: &CoordinatorOpts,
) -> Result<Vec<TestReport>> {
    let mut reports = Vec::with_capacity(config.tests.len());
    let mut max_drivers = 0usize;
    for test in &config.tests {
        max_drivers = max_drivers.max(test.drivers);
        match execute_test(test, &config.s3_config, &mut ready_rx, opts).await {
            Ok(report) => {
                emit_report(&report, opts);
                reports.push(report);
            }
            Err(err) => {
                error!(test = %test.name, error = %err, "test failed - continuing with next test");
            }
        }
    }
    info!("all performance tests finished");
    shutdown_drivers(&mut ready_rx, max_drivers, opts.barrier_timeout).await;
    Ok(reports)
}

/// Stage and run one test: pair `test.drivers` ready connections with their
/// assignments, hold the two barriers, and reduce the collected results.
pub async fn execute_test(
    test: &TestCaseConfiguration,
    s3_configs: &[S3Configuration],
    ready_rx: &mut mpsc::Receiver<ControlConnection>,
    opts: &CoordinatorOpts,
) -> Result<TestReport> {
    let (prep_tx, mut prep_rx) = mpsc::channel::<String>(test.drivers);
    let (result_tx, mut result_rx) = mpsc::channel::<(String, BenchmarkResult)>(test.drivers);
    let mut start_signals = Vec::with_capacity(test.drivers);
    let mut sessions: Vec<JoinHandle<()>> = Vec::with_capacity(test.drivers);
    let mut assigned = Vec::with_capacity(test.drivers);

    for slot in 0..test.drivers {
        let conn = ready_rx.recv().await.context("ready pool closed")?;
        info!(
            test = %test.name,
            "we found driver {} / {} for this test",
            slot + 1,
            test.drivers
        );
        let assignment = DriverConf {
            s3_config: s3_configs[slot % s3_configs.len()].clone(),
            test: test.clone(),
            driver_id: format!("d{}", slot),
        };
        assigned.push(assignment.driver_id.clone());
        let (start_tx, start_rx) = oneshot::channel::<()>();
        start_signals.push(start_tx);
        sessions.push(tokio::spawn(run_driver_session(
            conn,
            assignment,
            prep_tx.clone(),
            start_rx,
            result_tx.clone(),
        )));
    }
    drop(prep_tx);
    drop(result_tx);

    // Barrier 1: every assigned driver has finished preparations.
    if let Err(err) = await_prep_barrier(&mut prep_rx, &assigned, opts.barrier_timeout).await {
        abort_sessions(&sessions);
        return Err(err);
    }
    tokio::time::sleep(opts.settle_delay).await;
    info!(test = %test.name, "all drivers have finished preparations - starting performance test");

    let start_time = Utc::now();
    for signal in start_signals {
        let _ = signal.send(());
    }

    // Barrier 2: every assigned driver has reported its result.
    let mut driver_results = Vec::with_capacity(test.drivers);
    let mut reported = Vec::with_capacity(test.drivers);
    while driver_results.len() < test.drivers {
        match timeout(opts.barrier_timeout, result_rx.recv()).await {
            Ok(Some((driver_id, result))) => {
                reported.push(driver_id);
                driver_results.push(result);
            }
            Ok(None) => {
                abort_sessions(&sessions);
                bail!(
                    "work barrier broken: drivers {:?} dropped",
                    missing_drivers(&assigned, &reported)
                );
            }
            Err(_) => {
                abort_sessions(&sessions);
                bail!(
                    "work barrier timed out after {:?}: still waiting for drivers {:?}",
                    opts.barrier_timeout,
                    missing_drivers(&assigned, &reported)
                );
            }
        }
    }
    let stop_time = Utc::now();
    info!(test = %test.name, "all drivers have finished the performance test - continuing with next test");
    info!(
        test = %test.name,
        "GRAFANA: ?from={}&to={}",
        start_time.timestamp_millis(),
        stop_time.timestamp_millis()
    );

    let mut aggregate = sum_benchmark_results(&driver_results);
    aggregate.start_time = start_time;
    aggregate.stop_time = stop_time;
    aggregate.duration = (stop_time - start_time).to_std().unwrap_or_default();
    Ok(TestReport {
        driver_results,
        aggregate,
    })
}

async fn await_prep_barrier(
    prep_rx: &mut mpsc::Receiver<String>,
    assigned: &[String],
    barrier_timeout: Duration,
) -> Result<()> {
    let mut arrived = Vec::with_capacity(assigned.len());
    while arrived.len() < assigned.len() {
        match timeout(barrier_timeout, prep_rx.recv()).await {
            Ok(Some(driver_id)) => arrived.push(driver_id),
            Ok(None) => bail!(
                "preparation barrier broken: drivers {:?} dropped",
                missing_drivers(assigned, &arrived)
            ),
            Err(_) => bail!(
                "preparation barrier timed out after {:?}: still waiting for drivers {:?}",
                barrier_timeout,
                missing_drivers(assigned, &arrived)
            ),
        }
    }
    Ok(())
}

fn missing_drivers(assigned: &[String], arrived: &[String]) -> Vec<String> {
    assigned
        .iter()
        .filter(|driver| !arrived.contains(driver))
        .cloned()
        .collect()
}

fn abort_sessions(sessions: &[JoinHandle<()>]) {
    for session in sessions {
        session.abort();
    }
}

/// One coroutine per assigned driver, owning its connection for the duration
/// of the test: send init, relay barrier signals, collect the result. Any
/// decode error or unexpected message drops the session and its connection.
async fn run_driver_session(
    mut conn: ControlConnection,
    assignment: DriverConf,
    prep_tx: mpsc::Sender<String>,
    start_rx: oneshot::Receiver<()>,
    result_tx: mpsc::Sender<(String, BenchmarkResult)>,
) {
    let driver_id = assignment.driver_id.clone();
    if let Err(err) = drive_session(&mut conn, assignment, prep_tx, start_rx, result_tx).await {
        error!(driver = %driver_id, error = %err, "driver responded unusually - dropping");
    }
}

async fn drive_session(
    conn: &mut ControlConnection,
    assignment: DriverConf,
    prep_tx: mpsc::Sender<String>,
    start_rx: oneshot::Receiver<()>,
    result_tx: mpsc::Sender<(String, BenchmarkResult)>,
) -> Result<()> {
    let driver_id = assignment.driver_id.clone();
    conn.send(&DriverMessage::init(assignment)).await?;

    let message: DriverMessage = conn.recv().await?;
    if message.message != MSG_PREPARATIONS_DONE {
        bail!(
            "expected {:?}, got {:?}",
            MSG_PREPARATIONS_DONE,
            message.message
        );
    }
    let _ = prep_tx.send(driver_id.clone()).await;

    start_rx.await.context("test aborted before start")?;
    conn.send(&DriverMessage::plain(MSG_START_WORK)).await?;

    let message: DriverMessage = conn.recv().await?;
    if message.message != MSG_WORK_DONE {
        bail!("expected {:?}, got {:?}", MSG_WORK_DONE, message.message);
    }
    let result = message
        .bench_result
        .context("work done without benchmark result")?;
    let _ = result_tx.send((driver_id, result)).await;
    Ok(())
}

fn emit_report(report: &TestReport, opts: &CoordinatorOpts) {
    let aggregate = &report.aggregate;
    info!(
        test = %aggregate.test_name,
        operation = %aggregate.operation_name,
        workers = aggregate.workers,
        object_size = aggregate.object_size,
        operations = aggregate.operations,
        failed_operations = aggregate.failed_operations,
        ops_per_second = aggregate.ops_per_second,
        bytes = aggregate.bytes,
        bandwidth = aggregate.bandwidth,
        latency_ms = aggregate.latency_avg,
        success_ratio = aggregate.success_ratio,
        duration_s = aggregate.duration.as_secs_f64(),
        "PERF RESULTS"
    );
    let written = match &opts.results_path {
        Some(path) => append_result_to_csv(path, aggregate),
        None => write_result_to_csv(aggregate),
    };
    if let Err(err) = written {
        error!(error = %err, "could not write the results CSV");
    }
    write_results_to_console(&report.driver_results, aggregate);
}

/// After the last test, hand `shutdown` to every remaining ready driver.
/// Bounded by the barrier timeout so missing drivers cannot hang the exit.
async fn shutdown_drivers(
    ready_rx: &mut mpsc::Receiver<ControlConnection>,
    count: usize,
    barrier_timeout: Duration,
) {
    for _ in 0..count {
        match timeout(barrier_timeout, ready_rx.recv()).await {
            Ok(Some(mut conn)) => {
                info!("shutting down driver");
                if let Err(err) = conn.send(&DriverMessage::plain(MSG_SHUTDOWN)).await {
                    warn!(error = %err, "could not send shutdown to driver");
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!("timed out waiting for remaining drivers before shutdown");
                break;
            }
        }
    }
}
