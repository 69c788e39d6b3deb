use crate::processor_type::ProcessorKind;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

/// A successfully processed payment, ready for persistence. Append-only.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub amount: Decimal,
    pub correlation_id: String,
    pub requested_at: OffsetDateTime,
    pub service_used: ProcessorKind,
}

impl PaymentRecord {
    pub fn new(
        amount: Decimal,
        correlation_id: String,
        requested_at: OffsetDateTime,
        service_used: ProcessorKind,
    ) -> Self {
        Self {
            amount,
            correlation_id,
            requested_at,
            service_used,
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct ProcessorSummary {
    #[serde(rename = "totalRequests")]
    pub total_requests: i64,
    #[serde(rename = "totalAmount")]
    pub total_amount: Decimal,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct Summary {
    pub default: ProcessorSummary,
    pub fallback: ProcessorSummary,
}
