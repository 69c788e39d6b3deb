use rust_decimal::Decimal;
use time::OffsetDateTime;

/// In-flight work item. `requested_at` is stamped once at intake and never
/// rewritten, no matter how many retry hops the message takes.
#[derive(Debug, Clone)]
pub struct PaymentMessage {
    pub amount: Decimal,
    pub correlation_id: String,
    pub requested_at: OffsetDateTime,
    pub retry_count: u32,
}

impl PaymentMessage {
    pub fn new(amount: Decimal, correlation_id: String, requested_at: OffsetDateTime) -> Self {
        Self {
            amount,
            correlation_id,
            requested_at,
            retry_count: 0,
        }
    }
}
