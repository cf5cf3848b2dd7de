// tests/distributed_tests.rs
//
// End-to-end tests of the coordinator/driver control plane over loopback
// TCP, with drivers running the real workload engine against an in-memory
// object store.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};

use common::MemoryStore;
use gosbench::config::{
    check_config, BucketConfig, Distribution, MultipartConfig, ObjectConfig, S3Configuration,
    TestCaseConfiguration, Testconf,
};
use gosbench::coordinator::{self, CoordinatorOpts};
use gosbench::driver::{Driver, StoreFactory};
use gosbench::metrics::Metrics;
use gosbench::protocol::{Connection, DriverMessage, READY_GREETING};
use gosbench::s3::ObjectStore;

fn endpoint() -> S3Configuration {
    S3Configuration {
        access_key: "test-access".to_string(),
        secret_key: "test-secret".to_string(),
        region: "us-east-1".to_string(),
        endpoint: "http://127.0.0.1:9000".to_string(),
        timeout: Duration::from_secs(30),
        skip_ssl_verify: false,
        proxy_host: String::new(),
    }
}

fn base_test(name: &str, drivers: usize) -> TestCaseConfiguration {
    TestCaseConfiguration {
        name: name.to_string(),
        objects: ObjectConfig {
            size_min: 4,
            size_max: 4,
            size_distribution: Distribution::Constant,
            number_min: 10,
            number_max: 10,
            number_distribution: Distribution::Constant,
            unit: "KB".to_string(),
        },
        buckets: BucketConfig {
            number_min: 1,
            number_max: 1,
            number_distribution: Distribution::Constant,
        },
        multipart: MultipartConfig::default(),
        bucket_prefix: "bench-".to_string(),
        object_prefix: "obj".to_string(),
        runtime: Duration::ZERO,
        ops_deadline: 0,
        drivers,
        drivers_share_buckets: false,
        workers: 4,
        clean_after: false,
        read_weight: 0,
        existing_read_weight: 0,
        write_weight: 1,
        list_weight: 0,
        delete_weight: 0,
    }
}

fn testconf(tests: Vec<TestCaseConfiguration>) -> Testconf {
    let mut config = Testconf {
        s3_config: vec![endpoint()],
        grafana_config: None,
        tests,
    };
    check_config(&mut config).unwrap();
    config
}

fn store_factory(store: Arc<MemoryStore>) -> StoreFactory {
    Arc::new(move |_| store.clone() as Arc<dyn ObjectStore>)
}

fn spawn_driver(addr: &str, factory: StoreFactory) {
    let server = addr.to_string();
    tokio::spawn(async move {
        let metrics = Arc::new(Metrics::new().unwrap());
        let driver = Driver::new(server, metrics, factory);
        let _ = driver.run().await;
    });
}

/// Options for loopback runs: short settle delay, bounded barriers, and the
/// results CSV kept inside the given scratch directory.
fn fast_opts(scratch: &std::path::Path) -> CoordinatorOpts {
    CoordinatorOpts {
        port: 0,
        barrier_timeout: Duration::from_secs(20),
        settle_delay: Duration::from_millis(200),
        results_path: Some(scratch.join("gosbench_results.csv")),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_driver_write_test_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut test = base_test("two-drivers", 2);
    test.runtime = Duration::from_secs(2);
    test.objects.size_min = 1;
    test.objects.size_max = 1;
    test.objects.unit = "MB".to_string();
    let config = testconf(vec![test]);

    let store = Arc::new(MemoryStore::default());
    let factory = store_factory(store.clone());
    spawn_driver(&addr, factory.clone());
    spawn_driver(&addr, factory);

    let results_dir = tempfile::tempdir().unwrap();
    let opts = fast_opts(results_dir.path());
    let results_path = opts.results_path.clone().unwrap();
    let reports = coordinator::run_with_listener(config, listener, &opts)
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let aggregate = &reports[0].aggregate;
    assert_eq!(reports[0].driver_results.len(), 2);
    assert!(aggregate.operations >= 1.0);
    assert_eq!(aggregate.failed_operations, 0.0);
    assert_eq!(aggregate.success_ratio, 1.0);
    assert!(aggregate.bandwidth > 0.0);
    assert_eq!(aggregate.workers, 8);
    assert!(aggregate.duration >= Duration::from_secs(2));

    let content = std::fs::read_to_string(&results_path).unwrap();
    assert_eq!(content.lines().count(), 2, "header plus exactly one data row");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operation_budget_and_weight_ratio() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut test = base_test("ratio", 1);
    test.ops_deadline = 400;
    test.objects.number_min = 100;
    test.objects.number_max = 100;
    test.read_weight = 3;
    test.write_weight = 1;
    let config = testconf(vec![test]);

    let store = Arc::new(MemoryStore::default());
    spawn_driver(&addr, store_factory(store.clone()));

    let scratch = tempfile::tempdir().unwrap();
    let reports = coordinator::run_with_listener(config, listener, &fast_opts(scratch.path()))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let aggregate = &reports[0].aggregate;
    assert_eq!(aggregate.operations + aggregate.failed_operations, 400.0);
    assert_eq!(aggregate.failed_operations, 0.0);

    // Reads only ever come from the measured client; the observed mix must
    // stay within 10% of the configured 3:1 ratio.
    let gets = store.gets.load(std::sync::atomic::Ordering::SeqCst) as f64;
    let read_share = gets / 400.0;
    assert!(
        (read_share - 0.75).abs() < 0.075,
        "read share {} too far from 3:1",
        read_share
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropped_driver_does_not_hang_the_scheduler() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut test = base_test("dropped", 2);
    test.runtime = Duration::from_secs(1);
    let config = testconf(vec![test]);

    let store = Arc::new(MemoryStore::default());
    spawn_driver(&addr, store_factory(store));

    // A driver that greets, accepts its assignment, then vanishes before
    // signaling that preparations are done.
    let fake_addr = addr.clone();
    tokio::spawn(async move {
        let stream = TcpStream::connect(&fake_addr).await.unwrap();
        let mut conn = Connection::new(stream);
        conn.send(&READY_GREETING).await.unwrap();
        let _init: DriverMessage = conn.recv().await.unwrap();
        // Connection dropped here.
    });

    let opts = CoordinatorOpts {
        port: 0,
        barrier_timeout: Duration::from_secs(2),
        settle_delay: Duration::from_millis(100),
        results_path: None,
    };
    let started = Instant::now();
    let reports = coordinator::run_with_listener(config, listener, &opts)
        .await
        .unwrap();

    assert!(reports.is_empty(), "the test cannot complete without both drivers");
    assert!(
        started.elapsed() < Duration::from_secs(15),
        "scheduler hung past the bounded barrier wait"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_after_removes_everything_the_driver_wrote() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut test = base_test("cleanup", 1);
    test.ops_deadline = 20;
    test.clean_after = true;
    let config = testconf(vec![test]);

    let store = Arc::new(MemoryStore::default());
    spawn_driver(&addr, store_factory(store.clone()));

    let scratch = tempfile::tempdir().unwrap();
    let reports = coordinator::run_with_listener(config, listener, &fast_opts(scratch.path()))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].aggregate.operations, 20.0);
    assert!(store.puts.load(std::sync::atomic::Ordering::SeqCst) >= 20);
    assert_eq!(store.object_count(), 0, "written objects must be deleted");
    assert_eq!(store.bucket_count(), 0, "created buckets must be deleted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multipart_write_accounts_full_object_size() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut test = base_test("multipart", 1);
    test.ops_deadline = 4;
    test.workers = 1;
    test.objects.size_min = 12;
    test.objects.size_max = 12;
    test.objects.unit = "MB".to_string();
    test.objects.number_min = 4;
    test.objects.number_max = 4;
    test.multipart.write_mpu_enabled = true;
    test.multipart.write_part_size = 5;
    test.multipart.write_unit = "MB".to_string();
    test.multipart.write_concurrency = 3;
    let config = testconf(vec![test]);

    let store = Arc::new(MemoryStore::default());
    spawn_driver(&addr, store_factory(store.clone()));

    let scratch = tempfile::tempdir().unwrap();
    let reports = coordinator::run_with_listener(config, listener, &fast_opts(scratch.path()))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let aggregate = &reports[0].aggregate;
    assert_eq!(aggregate.operations, 4.0);
    assert_eq!(aggregate.bytes, 4.0 * 12.0 * 1024.0 * 1024.0);
    assert!(store.multipart_puts.load(std::sync::atomic::Ordering::SeqCst) >= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consecutive_tests_reuse_the_driver_pool() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut first = base_test("first", 1);
    first.ops_deadline = 10;
    let mut second = base_test("second", 1);
    second.ops_deadline = 10;
    let config = testconf(vec![first, second]);

    let store = Arc::new(MemoryStore::default());
    spawn_driver(&addr, store_factory(store));

    let scratch = tempfile::tempdir().unwrap();
    let reports = coordinator::run_with_listener(config, listener, &fast_opts(scratch.path()))
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].aggregate.test_name, "first");
    assert_eq!(reports[1].aggregate.test_name, "second");
    assert_eq!(reports[0].aggregate.operations, 10.0);
    assert_eq!(reports[1].aggregate.operations, 10.0);
}

#[test]
fn test_existing_read_without_bucket_prefix_is_rejected() {
    let mut test = base_test("invalid", 1);
    test.write_weight = 0;
    test.existing_read_weight = 5;
    test.bucket_prefix = String::new();
    let mut config = Testconf {
        s3_config: vec![endpoint()],
        grafana_config: None,
        tests: vec![test],
    };
    let err = check_config(&mut config).unwrap_err();
    assert!(format!("{:#}", err).contains("bucket_prefix"));
}
