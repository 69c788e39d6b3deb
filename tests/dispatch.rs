use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use payment_dispatch::health_monitor::{HealthMonitor, ProcessorHealth};
use payment_dispatch::payment::PaymentRecord;
use payment_dispatch::payment_message::PaymentMessage;
use payment_dispatch::payment_processor::PaymentProcessor;
use payment_dispatch::processor_type::ProcessorKind;
use payment_dispatch::store::{RecordSink, StoreError};
use payment_dispatch::worker_pool::{SubmitError, WorkerDeps, WorkerPool};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<PaymentRecord>>,
}

impl MemorySink {
    fn records(&self) -> Vec<PaymentRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl RecordSink for MemorySink {
    fn add(&self, record: PaymentRecord) -> Result<(), StoreError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

type Responder = Arc<dyn Fn(usize) -> StatusCode + Send + Sync>;

struct StubProcessor {
    url: String,
    hits: Arc<AtomicUsize>,
}

impl StubProcessor {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn stub_processor(responder: Responder) -> StubProcessor {
    stub_processor_with_delay(responder, Duration::ZERO).await
}

async fn stub_processor_with_delay(responder: Responder, delay: Duration) -> StubProcessor {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let accept_hits = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let responder = Arc::clone(&responder);
            let hits = Arc::clone(&accept_hits);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let responder = Arc::clone(&responder);
                    let hits = Arc::clone(&hits);
                    async move {
                        let _ = req.into_body().collect().await;
                        let index = hits.fetch_add(1, Ordering::SeqCst);
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(responder(index))
                                .body(Full::new(Bytes::from("{}")))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    StubProcessor {
        url: format!("http://{}/payments", addr),
        hits,
    }
}

fn always(status: StatusCode) -> Responder {
    Arc::new(move |_| status)
}

struct Harness {
    monitor: Arc<HealthMonitor>,
    sink: Arc<MemorySink>,
    pool: WorkerPool,
}

fn harness(default_url: String, fallback_url: String, num_workers: usize) -> Harness {
    let monitor = Arc::new(HealthMonitor::new("http://unused/hc", "http://unused/hc"));
    let sink = Arc::new(MemorySink::default());
    let store: Arc<dyn RecordSink> = Arc::clone(&sink) as Arc<dyn RecordSink>;

    let pool = WorkerPool::start(
        num_workers,
        WorkerDeps {
            health_monitor: Arc::clone(&monitor),
            default_processor: Arc::new(PaymentProcessor::new(ProcessorKind::Default, default_url)),
            fallback_processor: Arc::new(PaymentProcessor::new(
                ProcessorKind::Fallback,
                fallback_url,
            )),
            store,
        },
    );

    Harness {
        monitor,
        sink,
        pool,
    }
}

fn payment(amount: Decimal, correlation_id: &str) -> PaymentMessage {
    PaymentMessage::new(amount, correlation_id.to_string(), OffsetDateTime::now_utc())
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    cond()
}

fn healthy(min_response_time: u64) -> ProcessorHealth {
    ProcessorHealth {
        failing: false,
        min_response_time,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_persists_one_record_via_default() {
    let default = stub_processor(always(StatusCode::OK)).await;
    let fallback = stub_processor(always(StatusCode::OK)).await;
    let h = harness(default.url.clone(), fallback.url.clone(), 4);

    let msg = payment(Decimal::new(199, 1), "a1");
    let stamped = msg.requested_at;
    h.pool.submit(msg).await.unwrap();

    assert!(wait_for(|| h.sink.records().len() == 1, Duration::from_secs(2)).await);

    let records = h.sink.records();
    assert_eq!(records[0].service_used, ProcessorKind::Default);
    assert_eq!(records[0].amount, Decimal::new(199, 1));
    assert_eq!(records[0].correlation_id, "a1");
    assert_eq!(records[0].requested_at, stamped);
    assert_eq!(fallback.hits(), 0);

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degraded_default_routes_to_fallback() {
    let default = stub_processor(always(StatusCode::OK)).await;
    let fallback = stub_processor(always(StatusCode::OK)).await;
    let h = harness(default.url.clone(), fallback.url.clone(), 4);

    h.monitor
        .apply_probe(ProcessorKind::Default, healthy(400))
        .await;
    h.monitor
        .apply_probe(ProcessorKind::Fallback, healthy(100))
        .await;

    h.pool.submit(payment(Decimal::new(50, 1), "b1")).await.unwrap();

    assert!(wait_for(|| h.sink.records().len() == 1, Duration::from_secs(2)).await);
    assert_eq!(h.sink.records()[0].service_used, ProcessorKind::Fallback);
    assert_eq!(default.hits(), 0);

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_payment_is_dropped_without_retry() {
    let default = stub_processor(always(StatusCode::UNPROCESSABLE_ENTITY)).await;
    let fallback = stub_processor(always(StatusCode::OK)).await;
    let h = harness(default.url.clone(), fallback.url.clone(), 4);

    h.pool.submit(payment(Decimal::new(77, 1), "d1")).await.unwrap();

    assert!(wait_for(|| default.hits() == 1, Duration::from_secs(2)).await);

    // Give a would-be retry ample time to fire; nothing should happen.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(default.hits(), 1);
    assert_eq!(fallback.hits(), 0);
    assert!(h.sink.records().is_empty());

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unavailable_default_is_retried_on_fallback() {
    let default = stub_processor(always(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let fallback = stub_processor(always(StatusCode::OK)).await;
    let h = harness(default.url.clone(), fallback.url.clone(), 4);

    let msg = payment(Decimal::new(10, 1), "r1");
    let stamped = msg.requested_at;
    h.pool.submit(msg).await.unwrap();

    assert!(wait_for(|| h.sink.records().len() == 1, Duration::from_secs(5)).await);

    let records = h.sink.records();
    assert_eq!(records[0].service_used, ProcessorKind::Fallback);
    assert_eq!(records[0].requested_at, stamped);
    assert_eq!(default.hits(), 1);
    assert_eq!(fallback.hits(), 1);

    // The failure report must have stuck.
    assert_eq!(
        h.monitor.determine_processor().await.unwrap(),
        ProcessorKind::Fallback
    );

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn both_unavailable_parks_message_until_recovery() {
    let default = stub_processor(always(StatusCode::OK)).await;
    let fallback = stub_processor(always(StatusCode::OK)).await;
    let h = harness(default.url.clone(), fallback.url.clone(), 4);

    h.monitor.inform_failure(ProcessorKind::Default).await;
    h.monitor.inform_failure(ProcessorKind::Fallback).await;

    h.pool.submit(payment(Decimal::ONE, "c1")).await.unwrap();

    // Parked: nothing reaches a processor while both are failing.
    sleep(Duration::from_millis(500)).await;
    assert!(h.sink.records().is_empty());
    assert_eq!(default.hits(), 0);
    assert_eq!(fallback.hits(), 0);

    h.monitor
        .apply_probe(ProcessorKind::Default, healthy(50))
        .await;

    assert!(wait_for(|| h.sink.records().len() == 1, Duration::from_secs(5)).await);
    assert_eq!(h.sink.records()[0].service_used, ProcessorKind::Default);
    assert_eq!(fallback.hits(), 0);

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_persist_everything_exactly_once() {
    // One shared upstream: the first ten calls fail with 500, the rest
    // succeed. Retried messages land on the later, healthy calls.
    let shared = stub_processor(Arc::new(|index| {
        if index < 10 {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }))
    .await;
    let h = harness(shared.url.clone(), shared.url.clone(), 4);

    // Stand in for the probe task: keep restoring health so reported
    // failures do not wedge the selector shut.
    let monitor = Arc::clone(&h.monitor);
    tokio::spawn(async move {
        loop {
            monitor.apply_probe(ProcessorKind::Default, healthy(10)).await;
            monitor.apply_probe(ProcessorKind::Fallback, healthy(10)).await;
            sleep(Duration::from_millis(100)).await;
        }
    });

    let total = 20;
    for i in 0..total {
        let msg = payment(Decimal::new(100 + i as i64, 1), &format!("m{}", i));
        h.pool.submit(msg).await.unwrap();
    }

    assert!(wait_for(|| h.sink.records().len() == total, Duration::from_secs(15)).await);

    // No duplicates, even after letting any stray retries fire.
    sleep(Duration::from_millis(500)).await;
    let records = h.sink.records();
    assert_eq!(records.len(), total);

    let mut by_correlation: HashMap<String, usize> = HashMap::new();
    for record in &records {
        *by_correlation.entry(record.correlation_id.clone()).or_default() += 1;
    }
    assert_eq!(by_correlation.len(), total);
    assert!(by_correlation.values().all(|&count| count == 1));

    h.pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_intake_queue_sheds_submissions() {
    // A single slow worker cannot keep up; the queue fills and submit must
    // shed instead of blocking.
    let slow = stub_processor_with_delay(always(StatusCode::OK), Duration::from_secs(1)).await;
    let h = harness(slow.url.clone(), slow.url.clone(), 1);

    let mut shed = None;
    for i in 0..40_000usize {
        match h.pool.submit(payment(Decimal::ONE, &format!("q{}", i))).await {
            Ok(()) => {}
            Err(SubmitError::Overloaded) => {
                shed = Some(i);
                break;
            }
            Err(other) => panic!("unexpected submit error: {}", other),
        }
    }

    let shed = shed.expect("intake queue never filled");
    assert!(shed >= 32_000, "queue shed far too early at {}", shed);
}
