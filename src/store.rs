use crate::payment::{PaymentRecord, Summary};
use crate::processor_type::ProcessorKind;
use futures_util::pin_mut;
use rust_decimal::Decimal;
use std::time::Duration;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::Type;

const RECORD_BUFFER: usize = 1_000;
const MAX_BATCH_SIZE: usize = 100;
const MAX_BATCH_WINDOW: Duration = Duration::from_millis(2);

const SUMMARY_QUERY: &str = "
SELECT COUNT(*) AS total_requests,
       SUM(amount) AS total_amount,
       service_used
FROM payments
WHERE ($1::timestamp IS NULL OR requested_at >= $1::timestamp)
  AND ($2::timestamp IS NULL OR requested_at <= $2::timestamp)
GROUP BY service_used;
";

#[derive(Debug)]
pub enum StoreError {
    BufferFull,
    Pool(deadpool_postgres::PoolError),
    Query(tokio_postgres::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::BufferFull => write!(f, "record buffer is full"),
            StoreError::Pool(e) => write!(f, "database pool error: {}", e),
            StoreError::Query(e) => write!(f, "database query error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Non-blocking intake side of the persistence layer. The worker pool only
/// depends on this seam, which keeps the dispatch path testable without a
/// database.
pub trait RecordSink: Send + Sync {
    fn add(&self, record: PaymentRecord) -> Result<(), StoreError>;
}

/// Persists accepted payments through a small batching stage and serves the
/// time-windowed summary and purge queries.
pub struct Store {
    pool: deadpool_postgres::Pool,
    sender: mpsc::Sender<PaymentRecord>,
}

impl Store {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        let (sender, receiver) = mpsc::channel(RECORD_BUFFER);
        tokio::spawn(Self::batch_loop(receiver, pool.clone()));

        Self { pool, sender }
    }

    /// Accumulates up to `MAX_BATCH_SIZE` records or `MAX_BATCH_WINDOW` from
    /// the first record of a batch, whichever comes first. Flushes run on
    /// spawned tasks so a slow insert never stalls batching.
    async fn batch_loop(mut receiver: mpsc::Receiver<PaymentRecord>, pool: deadpool_postgres::Pool) {
        let mut batch: Vec<PaymentRecord> = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                record = receiver.recv() => match record {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() == 1 {
                            deadline = Some(Instant::now() + MAX_BATCH_WINDOW);
                        }
                        if batch.len() >= MAX_BATCH_SIZE {
                            Self::flush(&pool, std::mem::take(&mut batch));
                            deadline = None;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            Self::flush(&pool, std::mem::take(&mut batch));
                        }
                        return;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if !batch.is_empty() {
                        Self::flush(&pool, std::mem::take(&mut batch));
                    }
                    deadline = None;
                }
            }
        }
    }

    fn flush(pool: &deadpool_postgres::Pool, batch: Vec<PaymentRecord>) {
        let pool = pool.clone();
        tokio::spawn(async move {
            let result = if batch.len() == 1 {
                Self::insert_one(&pool, &batch[0]).await
            } else {
                Self::copy_batch(&pool, &batch).await
            };

            // The batch is abandoned on failure; this is the load-shedding
            // boundary, not a retry point.
            if let Err(err) = result {
                tracing::error!(error = %err, batch_size = batch.len(), "failed to persist payment batch");
            }
        });
    }

    async fn insert_one(
        pool: &deadpool_postgres::Pool,
        record: &PaymentRecord,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let client = pool.get().await?;

        let stmt = client
            .prepare(
                "INSERT INTO payments (amount, requested_at, service_used, correlation_id) VALUES ($1, $2, $3, $4)",
            )
            .await?;

        let requested_at = db_timestamp(record.requested_at);
        client
            .execute(
                &stmt,
                &[
                    &record.amount,
                    &requested_at,
                    &record.service_used,
                    &record.correlation_id,
                ],
            )
            .await?;

        Ok(())
    }

    async fn copy_batch(
        pool: &deadpool_postgres::Pool,
        batch: &[PaymentRecord],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let client = pool.get().await?;

        let sink = client
            .copy_in("COPY payments (amount, requested_at, service_used, correlation_id) FROM STDIN BINARY")
            .await?;
        let writer = BinaryCopyInWriter::new(
            sink,
            &[Type::NUMERIC, Type::TIMESTAMP, Type::TEXT, Type::TEXT],
        );
        pin_mut!(writer);

        for record in batch {
            let requested_at = db_timestamp(record.requested_at);
            writer
                .as_mut()
                .write(&[
                    &record.amount,
                    &requested_at,
                    &record.service_used,
                    &record.correlation_id,
                ])
                .await?;
        }

        writer.finish().await?;

        Ok(())
    }

    pub async fn summary(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Summary, StoreError> {
        let client = self.pool.get().await.map_err(StoreError::Pool)?;
        let stmt = client.prepare(SUMMARY_QUERY).await.map_err(StoreError::Query)?;

        let from = from.map(db_timestamp);
        let to = to.map(db_timestamp);
        let rows = client
            .query(&stmt, &[&from, &to])
            .await
            .map_err(StoreError::Query)?;

        let mut summary = Summary::default();
        for row in rows {
            let total_requests: i64 = row.get("total_requests");
            let total_amount: Decimal = row.get("total_amount");
            let service_used: ProcessorKind = row.get("service_used");

            let group = match service_used {
                ProcessorKind::Default => &mut summary.default,
                ProcessorKind::Fallback => &mut summary.fallback,
            };
            group.total_requests = total_requests;
            group.total_amount = total_amount;
        }

        Ok(summary)
    }

    pub async fn purge(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(StoreError::Pool)?;
        client
            .execute("TRUNCATE TABLE payments", &[])
            .await
            .map_err(StoreError::Query)?;

        Ok(())
    }
}

impl RecordSink for Store {
    fn add(&self, record: PaymentRecord) -> Result<(), StoreError> {
        if let Err(err) = self.sender.try_send(record) {
            let record = err.into_inner();
            tracing::warn!(correlation_id = %record.correlation_id, "record buffer is full, dropping payment");
            return Err(StoreError::BufferFull);
        }
        Ok(())
    }
}

/// The `payments` table stores naive UTC timestamps; strip the offset after
/// normalizing to UTC.
pub(crate) fn db_timestamp(at: OffsetDateTime) -> PrimitiveDateTime {
    let utc = at.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}
