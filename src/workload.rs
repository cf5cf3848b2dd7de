// src/workload.rs
//
// The driver's workload engine: weighted operation selection, the bucket and
// object plan, prepare/do/clean work items, and the dispatcher plus worker
// pool that execute the measured phase.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::{evaluate_distribution, TestCaseConfiguration};
use crate::metrics::{Method, Metrics};
use crate::s3::{MultipartSpec, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    ExistingRead,
    Write,
    List,
    Delete,
}

#[derive(Debug, Clone)]
struct OperationCounter {
    kind: OpKind,
    increment: f64,
    value: f64,
}

/// Selection state for the weighted operation mix. Separate from the
/// observability counters: scheduling never reads the metrics registry.
#[derive(Debug, Clone)]
pub struct OpChooser {
    counters: Vec<OperationCounter>,
}

impl OpChooser {
    pub fn from_test(test: &TestCaseConfiguration) -> Self {
        let weighted = [
            (OpKind::Read, test.read_weight),
            (OpKind::ExistingRead, test.existing_read_weight),
            (OpKind::Write, test.write_weight),
            (OpKind::List, test.list_weight),
            (OpKind::Delete, test.delete_weight),
        ];
        let counters = weighted
            .into_iter()
            .filter(|(_, weight)| *weight > 0)
            .map(|(kind, weight)| OperationCounter {
                kind,
                increment: 1.0 / weight as f64,
                value: 0.0,
            })
            .collect();
        OpChooser { counters }
    }

    /// Pick the kind with the lowest running value, then advance that value
    /// by 1/weight. Single-pass minimum; ties go to the first counter.
    pub fn next(&mut self) -> OpKind {
        debug_assert!(!self.counters.is_empty(), "no operation weights configured");
        let mut min_index = 0;
        for (index, counter) in self.counters.iter().enumerate() {
            if counter.value < self.counters[min_index].value {
                min_index = index;
            }
        }
        let counter = &mut self.counters[min_index];
        counter.value += counter.increment;
        counter.kind
    }
}

/// One planned object: where it lives, what it is called and how big it is.
/// `shared_bucket` is the un-namespaced name used for reads of preexisting
/// data.
#[derive(Debug, Clone)]
pub struct PlannedObject {
    pub bucket: String,
    pub shared_bucket: String,
    pub object: String,
    pub size: u64,
}

/// A single unit of work. `Stop` marks the end of the queue for tests bound
/// by an operation budget.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Read {
        bucket: String,
        object: String,
        size: u64,
        preexisting: bool,
        mpu: Option<MultipartSpec>,
    },
    Write {
        bucket: String,
        object: String,
        size: u64,
        mpu: Option<MultipartSpec>,
    },
    List {
        bucket: String,
        object: String,
        size: u64,
    },
    Delete {
        bucket: String,
        object: String,
        size: u64,
    },
    Stop,
}

impl WorkItem {
    /// Upload the seed object this item needs, through the housekeeping
    /// client. Writes and reads of preexisting data need none.
    pub async fn prepare(&self, housekeeping: &dyn ObjectStore, payload: &[u8]) -> Result<()> {
        match self {
            WorkItem::Read {
                bucket,
                object,
                size,
                preexisting: false,
                mpu,
            } => upload_seed(housekeeping, bucket, object, *size, *mpu, payload).await,
            WorkItem::List {
                bucket,
                object,
                size,
            }
            | WorkItem::Delete {
                bucket,
                object,
                size,
            } => upload_seed(housekeeping, bucket, object, *size, None, payload).await,
            _ => Ok(()),
        }
    }

    /// Run the measured operation against the instrumented client, recording
    /// latency, outcome and nominal byte counts. Operation errors are logged
    /// and counted, never propagated.
    pub async fn execute(
        &self,
        svc: &dyn ObjectStore,
        metrics: &Metrics,
        test_name: &str,
        payload: &[u8],
    ) {
        match self {
            WorkItem::Read {
                bucket,
                object,
                size,
                mpu,
                ..
            } => {
                let started = Instant::now();
                let outcome = match mpu {
                    Some(spec) => svc.get_object_multipart(bucket, object, *spec).await.map(|_| ()),
                    None => svc.get_object(bucket, object).await.map(|_| ()),
                };
                record_outcome(metrics, test_name, Method::Get, started.elapsed(), outcome, bucket, object);
                metrics.add_downloaded_bytes(test_name, Method::Get, *size);
            }
            WorkItem::Write {
                bucket,
                object,
                size,
                mpu,
            } => {
                let data = payload_slice(payload, *size);
                let started = Instant::now();
                let outcome = match mpu {
                    Some(spec) => svc.put_object_multipart(bucket, object, data, *spec).await,
                    None => svc.put_object(bucket, object, data).await,
                };
                record_outcome(metrics, test_name, Method::Put, started.elapsed(), outcome, bucket, object);
                metrics.add_uploaded_bytes(test_name, Method::Put, *size);
            }
            WorkItem::List { bucket, object, .. } => {
                let started = Instant::now();
                let outcome = svc.list_objects(bucket, object).await.map(|_| ());
                record_outcome(metrics, test_name, Method::List, started.elapsed(), outcome, bucket, object);
            }
            WorkItem::Delete { bucket, object, .. } => {
                let started = Instant::now();
                let outcome = svc.delete_object(bucket, object).await;
                record_outcome(metrics, test_name, Method::Delete, started.elapsed(), outcome, bucket, object);
            }
            WorkItem::Stop => {}
        }
    }

    /// Remove whatever this item left behind. Deletes are their own cleanup,
    /// as are reads of preexisting data.
    pub async fn clean(&self, housekeeping: &dyn ObjectStore) -> Result<()> {
        match self {
            WorkItem::Read {
                bucket,
                object,
                preexisting: false,
                ..
            }
            | WorkItem::Write { bucket, object, .. }
            | WorkItem::List { bucket, object, .. } => {
                housekeeping.delete_object(bucket, object).await
            }
            _ => Ok(()),
        }
    }
}

async fn upload_seed(
    housekeeping: &dyn ObjectStore,
    bucket: &str,
    object: &str,
    size: u64,
    mpu: Option<MultipartSpec>,
    payload: &[u8],
) -> Result<()> {
    let data = payload_slice(payload, size);
    match mpu {
        Some(spec) => {
            housekeeping
                .put_object_multipart(bucket, object, data, spec)
                .await
        }
        None => housekeeping.put_object(bucket, object, data).await,
    }
    .with_context(|| format!("failed to seed object {} in bucket {}", object, bucket))
}

fn payload_slice(payload: &[u8], size: u64) -> &[u8] {
    &payload[..(size as usize).min(payload.len())]
}

fn record_outcome(
    metrics: &Metrics,
    test_name: &str,
    method: Method,
    latency: Duration,
    outcome: Result<()>,
    bucket: &str,
    object: &str,
) {
    match outcome {
        Ok(()) => metrics.record_op(test_name, method, latency, true),
        Err(err) => {
            warn!(bucket, object, error = %err, "issues when performing work - ignoring");
            metrics.record_op(test_name, method, latency, false);
        }
    }
}

/// The per-test plan a driver builds on `init`: the buckets it owns, the
/// planned objects, the pre-assigned item queue and the selection state the
/// dispatcher continues from once the queue is drained.
#[derive(Debug, Clone)]
pub struct WorkPlan {
    pub buckets: Vec<String>,
    pub objects: Vec<PlannedObject>,
    pub queue: Vec<WorkItem>,
    pub chooser: OpChooser,
}

fn read_mpu_spec(test: &TestCaseConfiguration) -> Option<MultipartSpec> {
    test.multipart.read_mpu_enabled.then(|| {
        MultipartSpec {
            part_size: test.multipart.read_part_size,
            concurrency: test.multipart.read_concurrency,
        }
        .normalized()
    })
}

fn write_mpu_spec(test: &TestCaseConfiguration) -> Option<MultipartSpec> {
    test.multipart.write_mpu_enabled.then(|| {
        MultipartSpec {
            part_size: test.multipart.write_part_size,
            concurrency: test.multipart.write_concurrency,
        }
        .normalized()
    })
}

/// Materialize a concrete work item for `spec` with the given kind.
fn build_item(kind: OpKind, spec: &PlannedObject, test: &TestCaseConfiguration) -> WorkItem {
    match kind {
        OpKind::Read => WorkItem::Read {
            bucket: spec.bucket.clone(),
            object: spec.object.clone(),
            size: spec.size,
            preexisting: false,
            mpu: read_mpu_spec(test),
        },
        OpKind::ExistingRead => WorkItem::Read {
            bucket: spec.shared_bucket.clone(),
            object: spec.object.clone(),
            size: spec.size,
            preexisting: true,
            mpu: read_mpu_spec(test),
        },
        OpKind::Write => WorkItem::Write {
            bucket: spec.bucket.clone(),
            object: spec.object.clone(),
            size: spec.size,
            mpu: write_mpu_spec(test),
        },
        OpKind::List => WorkItem::List {
            bucket: spec.bucket.clone(),
            object: spec.object.clone(),
            size: spec.size,
        },
        OpKind::Delete => WorkItem::Delete {
            bucket: spec.bucket.clone(),
            object: spec.object.clone(),
            size: spec.size,
        },
    }
}

/// Build the deterministic bucket/object plan for one driver. Bucket names
/// carry the driver identity unless the test shares buckets across drivers.
pub fn generate_work_plan(test: &TestCaseConfiguration, driver_id: &str) -> WorkPlan {
    let mut chooser = OpChooser::from_test(test);
    let mut bucket_last = 0u64;
    let mut count_last = 0u64;
    let mut size_last = 0u64;

    let bucket_count = evaluate_distribution(
        test.buckets.number_min,
        test.buckets.number_max,
        &mut bucket_last,
        1,
        test.buckets.number_distribution,
    );

    let mut buckets = Vec::with_capacity(bucket_count as usize);
    let mut objects = Vec::new();
    for bucket_index in 0..bucket_count {
        let shared_bucket = format!("{}{}", test.bucket_prefix, bucket_index);
        let bucket = if test.drivers_share_buckets {
            shared_bucket.clone()
        } else {
            format!("{}-{}{}", driver_id, test.bucket_prefix, bucket_index)
        };
        buckets.push(bucket.clone());

        let object_count = evaluate_distribution(
            test.objects.number_min,
            test.objects.number_max,
            &mut count_last,
            1,
            test.objects.number_distribution,
        );
        for object_index in 0..object_count {
            let size = evaluate_distribution(
                test.objects.size_min,
                test.objects.size_max,
                &mut size_last,
                1,
                test.objects.size_distribution,
            );
            objects.push(PlannedObject {
                bucket: bucket.clone(),
                shared_bucket: shared_bucket.clone(),
                object: format!("{}{}", test.object_prefix, object_index),
                size,
            });
        }
    }

    let queue: Vec<WorkItem> = objects
        .iter()
        .map(|spec| build_item(chooser.next(), spec, test))
        .collect();

    debug!(
        buckets = buckets.len(),
        objects = objects.len(),
        "generated work plan"
    );
    WorkPlan {
        buckets,
        objects,
        queue,
        chooser,
    }
}

/// Prepare phase: create every planned bucket, then upload the seed objects
/// through the housekeeping client. Seed failures are logged and skipped;
/// a bucket that cannot be created fails the phase.
pub async fn prepare_work_plan(
    plan: &WorkPlan,
    housekeeping: &dyn ObjectStore,
    payload: &[u8],
) -> Result<()> {
    for bucket in &plan.buckets {
        housekeeping
            .create_bucket(bucket)
            .await
            .with_context(|| format!("could not ensure bucket {}", bucket))?;
    }
    for item in &plan.queue {
        if let Err(err) = item.prepare(housekeeping, payload).await {
            warn!(error = %err, "failed to prepare work item");
        }
    }
    Ok(())
}

/// Cleanup phase: best effort removal of everything this driver uploaded,
/// then of the buckets it created. Failures are logged, not propagated.
pub async fn clean_work_plan(queue: &[WorkItem], buckets: &[String], housekeeping: &dyn ObjectStore) {
    for item in queue {
        if let Err(err) = item.clean(housekeeping).await {
            warn!(error = %err, "failed to clean up work item");
        }
    }
    for bucket in buckets {
        if let Err(err) = housekeeping.delete_bucket(bucket).await {
            warn!(bucket, error = %err, "failed to clean up bucket");
        }
    }
}

/// Feed the workers. The pre-assigned queue goes out first; once drained the
/// dispatcher keeps materializing items from the plan with the same selection
/// state. With an operation budget it sends exactly that many items followed
/// by a single Stop marker; otherwise it streams until cancellation.
async fn dispatch_work(
    test: TestCaseConfiguration,
    plan: WorkPlan,
    work_tx: mpsc::Sender<WorkItem>,
    mut cancel_rx: broadcast::Receiver<()>,
) {
    let ops_deadline = test.ops_deadline;
    let WorkPlan {
        objects,
        queue,
        mut chooser,
        ..
    } = plan;
    let mut queued = queue.into_iter();
    let mut cursor = 0usize;
    let mut next_item = move || -> Option<WorkItem> {
        if let Some(item) = queued.next() {
            return Some(item);
        }
        if objects.is_empty() {
            return None;
        }
        let spec = &objects[cursor % objects.len()];
        cursor += 1;
        Some(build_item(chooser.next(), spec, &test))
    };

    if ops_deadline > 0 {
        let mut sent = 0u64;
        while sent < ops_deadline {
            let Some(item) = next_item() else { break };
            tokio::select! {
                _ = cancel_rx.recv() => return,
                result = work_tx.send(item) => {
                    if result.is_err() {
                        return;
                    }
                    sent += 1;
                }
            }
        }
        debug!(sent, "operation budget dispatched - sending stop marker");
        tokio::select! {
            _ = cancel_rx.recv() => {}
            result = work_tx.send(WorkItem::Stop) => {
                let _ = result;
            }
        }
    } else {
        loop {
            let Some(item) = next_item() else { return };
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!("runtime over - dispatcher stopping");
                    return;
                }
                result = work_tx.send(item) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn recv_item(queue: &Arc<Mutex<mpsc::Receiver<WorkItem>>>) -> Option<WorkItem> {
    let mut receiver = queue.lock().await;
    receiver.recv().await
}

/// Run the measured phase of one test: spawn the dispatcher and
/// `test.workers` workers, wait for the stop condition, and return the
/// observed wall-clock duration. Workers observe cancellation between items;
/// an in-flight operation is allowed to finish and is recorded.
pub async fn run_test(
    test: &TestCaseConfiguration,
    plan: WorkPlan,
    svc: Arc<dyn ObjectStore>,
    metrics: Arc<Metrics>,
    payload: Arc<Vec<u8>>,
) -> Duration {
    let (work_tx, work_rx) = mpsc::channel::<WorkItem>(test.workers.max(1) * 2);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (cancel_tx, _) = broadcast::channel::<()>(1);

    metrics.mark_test_start(&test.name);
    let started = Instant::now();

    let dispatcher = tokio::spawn(dispatch_work(
        test.clone(),
        plan,
        work_tx,
        cancel_tx.subscribe(),
    ));

    let mut workers = Vec::with_capacity(test.workers);
    for worker_id in 0..test.workers {
        let work_rx = work_rx.clone();
        let mut cancel_rx = cancel_tx.subscribe();
        let svc = svc.clone();
        let metrics = metrics.clone();
        let payload = payload.clone();
        let test_name = test.name.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = cancel_rx.recv() => {
                        debug!(worker_id, "runtime over - worker stopping");
                        break;
                    }
                    item = recv_item(&work_rx) => match item {
                        None => break,
                        Some(WorkItem::Stop) => {
                            debug!(worker_id, "found the end of the work queue - worker stopping");
                            break;
                        }
                        Some(item) => item,
                    }
                };
                item.execute(svc.as_ref(), &metrics, &test_name, &payload).await;
            }
        }));
    }

    // Armed only after every subscriber exists: broadcast messages are not
    // replayed to late subscribers.
    let timer = if test.runtime.is_zero() {
        None
    } else {
        let cancel = cancel_tx.clone();
        let runtime = test.runtime;
        Some(tokio::spawn(async move {
            tokio::time::sleep(runtime).await;
            let _ = cancel.send(());
        }))
    };

    for worker in workers {
        let _ = worker.await;
    }
    let _ = dispatcher.await;
    if let Some(timer) = timer {
        timer.abort();
    }
    metrics.mark_test_end(&test.name);
    started.elapsed()
}
