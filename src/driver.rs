// src/driver.rs
//
// The driver process: connects out to the coordinator, announces readiness,
// and runs one test per connection - init/prepare, measured work, optional
// cleanup - before re-entering the ready pool.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::RngCore;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::S3Configuration;
use crate::metrics::Metrics;
use crate::protocol::{
    Connection, DriverConf, DriverMessage, MSG_INIT, MSG_PREPARATIONS_DONE, MSG_SHUTDOWN,
    MSG_START_WORK, READY_GREETING,
};
use crate::results::BenchmarkResult;
use crate::s3::{ObjectStore, S3Store};
use crate::workload::{clean_work_plan, generate_work_plan, prepare_work_plan, run_test, WorkPlan};

/// Builds the two per-test store handles from the assigned credentials.
/// Injectable so the engine can run against an in-memory store in tests.
pub type StoreFactory = Arc<dyn Fn(&S3Configuration) -> Arc<dyn ObjectStore> + Send + Sync>;

pub fn default_store_factory() -> StoreFactory {
    Arc::new(|config| Arc::new(S3Store::new(config)))
}

/// A driver owns its metrics registry and, for the duration of one test, the
/// work plan and its pair of S3 clients.
pub struct Driver {
    server: String,
    host: String,
    metrics: Arc<Metrics>,
    store_factory: StoreFactory,
}

/// State built on `init` and consumed on `start work`.
struct PreparedTest {
    config: DriverConf,
    plan: WorkPlan,
    svc: Arc<dyn ObjectStore>,
    housekeeping: Arc<dyn ObjectStore>,
    payload: Arc<Vec<u8>>,
}

enum SessionEnd {
    Shutdown,
    TestFinished,
}

impl Driver {
    pub fn new(server: String, metrics: Arc<Metrics>, store_factory: StoreFactory) -> Self {
        let host = gethostname::gethostname().to_string_lossy().to_string();
        Driver {
            server,
            host,
            metrics,
            store_factory,
        }
    }

    /// Connect, serve one test, reconnect; exit when the coordinator says
    /// `shutdown`. Transport errors outside the normal end-of-test close are
    /// fatal for the process.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_session().await? {
                SessionEnd::Shutdown => {
                    info!("received shutdown command - exiting");
                    return Ok(());
                }
                SessionEnd::TestFinished => {
                    debug!("test finished - reconnecting for the next one");
                }
            }
        }
    }

    async fn run_session(&self) -> Result<SessionEnd> {
        let stream = TcpStream::connect(&self.server)
            .await
            .with_context(|| format!("could not connect to coordinator at {}", self.server))?;
        let mut conn = Connection::new(stream);
        conn.send(&READY_GREETING).await?;
        info!(server = %self.server, "ready for work");

        let mut prepared: Option<PreparedTest> = None;
        let mut completed_work = false;
        loop {
            let message: DriverMessage = match conn.recv().await {
                Ok(message) => message,
                // The coordinator closes the connection once it has collected
                // our result; that is the normal end of a test.
                Err(err) if completed_work => {
                    debug!(error = %err, "coordinator closed the connection after the test");
                    return Ok(SessionEnd::TestFinished);
                }
                Err(err) => return Err(err),
            };
            match message.message.as_str() {
                MSG_INIT => {
                    let config = message
                        .config
                        .context("init message without embedded config")?;
                    prepared = Some(self.init_test(config).await?);
                    conn.send(&DriverMessage::plain(MSG_PREPARATIONS_DONE)).await?;
                }
                MSG_START_WORK => {
                    let test = prepared.take().context("start work before init")?;
                    let result = self.perform_test(test).await;
                    conn.send(&DriverMessage::work_done(result)).await?;
                    completed_work = true;
                }
                MSG_SHUTDOWN => return Ok(SessionEnd::Shutdown),
                other => bail!("unexpected message from coordinator: {:?}", other),
            }
        }
    }

    /// Validate the assignment, build both store handles, generate the plan
    /// and run the prepare phase.
    async fn init_test(&self, config: DriverConf) -> Result<PreparedTest> {
        config.test.check().context("received an invalid test case")?;
        info!(test = %config.test.name, driver = %config.driver_id, "initializing test");

        let svc = (self.store_factory)(&config.s3_config);
        let housekeeping = (self.store_factory)(&config.s3_config);

        let mut payload = vec![0u8; config.test.objects.size_max as usize];
        rand::rng().fill_bytes(&mut payload);
        let payload = Arc::new(payload);

        let plan = generate_work_plan(&config.test, &config.driver_id);
        prepare_work_plan(&plan, housekeeping.as_ref(), &payload)
            .await
            .context("prepare phase failed")?;
        info!(test = %config.test.name, "preparations done");

        Ok(PreparedTest {
            config,
            plan,
            svc,
            housekeeping,
            payload,
        })
    }

    /// Run the measured phase, snapshot the registry into a result record
    /// and clean up if the test asks for it.
    async fn perform_test(&self, prepared: PreparedTest) -> BenchmarkResult {
        let PreparedTest {
            config,
            plan,
            svc,
            housekeeping,
            payload,
        } = prepared;
        let test = &config.test;
        let cleanup_queue = plan.queue.clone();
        let cleanup_buckets = plan.buckets.clone();

        let start_time = Utc::now();
        let duration = run_test(test, plan, svc, self.metrics.clone(), payload).await;
        let stop_time = Utc::now();

        let mut result = self.metrics.snapshot(test, &self.host);
        result.start_time = start_time;
        result.stop_time = stop_time;
        result.duration = duration;
        let seconds = duration.as_secs_f64();
        if seconds > 0.0 {
            result.ops_per_second = result.operations / seconds;
            result.bandwidth = result.bytes / seconds;
        }
        info!(
            test = %test.name,
            operations = result.operations,
            failed_operations = result.failed_operations,
            "work done"
        );

        if test.clean_after {
            clean_work_plan(&cleanup_queue, &cleanup_buckets, housekeeping.as_ref()).await;
            info!(test = %test.name, "cleanup finished");
        }
        result
    }
}
