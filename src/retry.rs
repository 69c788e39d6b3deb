use crate::payment_message::PaymentMessage;
use crate::worker_pool::IntakeQueue;
use rand::Rng;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const RETRY_CAPACITY: usize = 8_192;
const MAX_RETRIES: u32 = 20;
const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 5_000;
const JITTER_FRACTION: f64 = 0.20;

struct RetryItem {
    msg: PaymentMessage,
    next_attempt: Instant,
}

impl PartialEq for RetryItem {
    fn eq(&self, other: &Self) -> bool {
        self.next_attempt == other.next_attempt
    }
}

impl Eq for RetryItem {}

impl PartialOrd for RetryItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the binary heap surfaces the earliest deadline first.
impl Ord for RetryItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.next_attempt.cmp(&self.next_attempt)
    }
}

/// Parks transiently failed messages until their backoff elapses, then
/// reinjects them into the intake queue. A single task owns the heap; all
/// producers talk to it through a bounded channel.
#[derive(Clone)]
pub(crate) struct RetryScheduler {
    sender: mpsc::Sender<RetryItem>,
}

impl RetryScheduler {
    pub(crate) fn start(queue: Arc<IntakeQueue>) -> Self {
        let (sender, receiver) = mpsc::channel(RETRY_CAPACITY);
        tokio::spawn(Self::run(queue, receiver));

        Self { sender }
    }

    pub(crate) fn schedule(&self, mut msg: PaymentMessage) {
        if msg.retry_count >= MAX_RETRIES {
            tracing::warn!(correlation_id = %msg.correlation_id, "max retries exceeded, dropping message");
            return;
        }

        msg.retry_count += 1;
        let delay = calc_backoff(msg.retry_count);
        let item = RetryItem {
            msg,
            next_attempt: Instant::now() + delay,
        };

        if self.sender.try_send(item).is_err() {
            tracing::warn!("retry queue is full, dropping message");
        }
    }

    async fn run(queue: Arc<IntakeQueue>, mut receiver: mpsc::Receiver<RetryItem>) {
        let mut heap: BinaryHeap<RetryItem> = BinaryHeap::new();

        loop {
            let now = Instant::now();
            while let Some(item) = heap.peek() {
                if item.next_attempt > now {
                    break;
                }
                if let Some(item) = heap.pop() {
                    if let Err(err) = queue.push(item.msg).await {
                        tracing::warn!(error = %err, "failed to reinject retried message");
                    }
                }
            }

            // At most one pending timer, armed on the heap root.
            let timer = heap
                .peek()
                .map(|item| tokio::time::sleep_until(item.next_attempt));

            tokio::select! {
                item = receiver.recv() => match item {
                    Some(item) => heap.push(item),
                    None => return,
                },
                _ = async {
                    match timer {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                } => {}
            }
        }
    }
}

fn calc_backoff(retry_count: u32) -> Duration {
    let base = (BASE_BACKOFF_MS * (1_u64 << retry_count.min(10))).min(MAX_BACKOFF_MS);

    let jitter_range = (base as f64 * JITTER_FRACTION) as i64;
    let jitter = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_millis((base as i64 + jitter) as u64)
}
