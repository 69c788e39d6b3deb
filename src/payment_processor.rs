use crate::payment_message::PaymentMessage;
use crate::processor_type::ProcessorKind;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;

const REQUEST_DEADLINE: Duration = Duration::from_millis(180);

#[derive(Debug)]
pub enum ProcessorError {
    InvalidPayment,
    Unavailable,
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorError::InvalidPayment => write!(f, "invalid payment"),
            ProcessorError::Unavailable => write!(f, "processor is unavailable"),
        }
    }
}

impl std::error::Error for ProcessorError {}

/// Wire body for the processor POST. `retry_count` never crosses the wire.
#[derive(Debug, Serialize)]
struct ProcessorRequest<'a> {
    amount: Decimal,
    #[serde(rename = "correlationId")]
    correlation_id: &'a str,
    #[serde(rename = "requestedAt", with = "time::serde::rfc3339")]
    requested_at: OffsetDateTime,
}

impl<'a> From<&'a PaymentMessage> for ProcessorRequest<'a> {
    fn from(msg: &'a PaymentMessage) -> Self {
        Self {
            amount: msg.amount,
            correlation_id: &msg.correlation_id,
            requested_at: msg.requested_at,
        }
    }
}

/// One bounded-latency HTTP POST per payment, classified into accepted,
/// invalid, or unavailable. The underlying client pools connections across
/// all workers.
pub struct PaymentProcessor {
    kind: ProcessorKind,
    url: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl PaymentProcessor {
    pub fn new(kind: ProcessorKind, url: String) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self { kind, url, client }
    }

    pub fn kind(&self) -> ProcessorKind {
        self.kind
    }

    pub async fn process(&self, msg: &PaymentMessage) -> Result<(), ProcessorError> {
        let json_bytes = serde_json::to_vec(&ProcessorRequest::from(msg))
            .map_err(|_| ProcessorError::InvalidPayment)?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(json_bytes)))
            .map_err(|_| ProcessorError::InvalidPayment)?;

        let status = match tokio::time::timeout(REQUEST_DEADLINE, self.exchange(req)).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) | Err(_) => return Err(ProcessorError::Unavailable),
        };

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ProcessorError::InvalidPayment);
        }

        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Err(ProcessorError::Unavailable);
        }

        Ok(())
    }

    async fn exchange(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<StatusCode, hyper_util::client::legacy::Error> {
        let response = self.client.request(req).await?;
        let status = response.status();

        // Drain the body so the connection goes back to the pool.
        let _ = response.into_body().collect().await;

        Ok(status)
    }
}
