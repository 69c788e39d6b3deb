use crate::health_monitor::HealthMonitor;
use crate::payment::PaymentRecord;
use crate::payment_message::PaymentMessage;
use crate::payment_processor::{PaymentProcessor, ProcessorError};
use crate::processor_type::ProcessorKind;
use crate::retry::RetryScheduler;
use crate::store::RecordSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

const QUEUE_CAPACITY: usize = 32_768;

#[derive(Debug)]
pub enum SubmitError {
    Overloaded,
    Closed,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Overloaded => write!(f, "intake queue is full"),
            SubmitError::Closed => write!(f, "intake queue is closed"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Bounded intake, sharded one channel per worker. Submissions are spread
/// round robin and never block; a full shard sheds the message.
pub(crate) struct IntakeQueue {
    shards: RwLock<Vec<mpsc::Sender<PaymentMessage>>>,
    next: AtomicUsize,
}

impl IntakeQueue {
    pub(crate) fn new(shards: Vec<mpsc::Sender<PaymentMessage>>) -> Self {
        Self {
            shards: RwLock::new(shards),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) async fn push(&self, msg: PaymentMessage) -> Result<(), SubmitError> {
        let shards = self.shards.read().await;
        if shards.is_empty() {
            return Err(SubmitError::Closed);
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % shards.len();
        shards[index].try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::Overloaded,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    async fn close(&self) {
        self.shards.write().await.clear();
    }
}

#[derive(Clone)]
pub struct WorkerDeps {
    pub health_monitor: Arc<HealthMonitor>,
    pub default_processor: Arc<PaymentProcessor>,
    pub fallback_processor: Arc<PaymentProcessor>,
    pub store: Arc<dyn RecordSink>,
}

/// Fixed set of workers draining the intake queue, one processor call per
/// message. Successful outcomes go to the record sink; transient failures go
/// back through the retry scheduler.
pub struct WorkerPool {
    queue: Arc<IntakeQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(num_workers: usize, deps: WorkerDeps) -> Self {
        let shard_capacity = (QUEUE_CAPACITY / num_workers).max(1);

        let mut senders = Vec::with_capacity(num_workers);
        let mut receivers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (sender, receiver) = mpsc::channel(shard_capacity);
            senders.push(sender);
            receivers.push(receiver);
        }

        let queue = Arc::new(IntakeQueue::new(senders));
        let retry = RetryScheduler::start(Arc::clone(&queue));

        let mut workers = Vec::with_capacity(num_workers);
        for (worker_id, receiver) in receivers.into_iter().enumerate() {
            let deps = deps.clone();
            let retry = retry.clone();
            workers.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, receiver, retry, deps).await;
            }));
        }

        tracing::info!(num_workers, "started worker pool");

        Self {
            queue,
            workers: Mutex::new(workers),
        }
    }

    /// Non-blocking enqueue. `Overloaded` means the queue was full; the
    /// caller decides how to surface that.
    pub async fn submit(&self, msg: PaymentMessage) -> Result<(), SubmitError> {
        self.queue.push(msg).await
    }

    /// Closes the intake queue and waits for the workers to drain what is
    /// already buffered. Messages parked in the retry scheduler are lost.
    pub async fn shutdown(&self) {
        self.queue.close().await;

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn worker_loop(
        worker_id: usize,
        mut receiver: mpsc::Receiver<PaymentMessage>,
        retry: RetryScheduler,
        deps: WorkerDeps,
    ) {
        while let Some(msg) = receiver.recv().await {
            Self::process_message(msg, &retry, &deps).await;
        }
        tracing::debug!(worker_id, "worker shutting down, channel closed");
    }

    async fn process_message(msg: PaymentMessage, retry: &RetryScheduler, deps: &WorkerDeps) {
        let kind = match deps.health_monitor.determine_processor().await {
            Ok(kind) => kind,
            Err(err) => {
                tracing::debug!(error = %err, "parking message for retry");
                retry.schedule(msg);
                return;
            }
        };

        let processor = match kind {
            ProcessorKind::Default => &deps.default_processor,
            ProcessorKind::Fallback => &deps.fallback_processor,
        };

        match processor.process(&msg).await {
            Ok(()) => {
                let record = PaymentRecord::new(msg.amount, msg.correlation_id, msg.requested_at, kind);
                let _ = deps.store.add(record);
            }
            Err(ProcessorError::InvalidPayment) => {
                // Permanent rejection by the upstream; no retry, no record.
                tracing::debug!(correlation_id = %msg.correlation_id, "payment rejected by processor");
            }
            Err(ProcessorError::Unavailable) => {
                deps.health_monitor.inform_failure(kind).await;
                retry.schedule(msg);
            }
        }
    }
}
