use crate::payment_message::PaymentMessage;
use crate::store::Store;
use crate::worker_pool::{SubmitError, WorkerPool};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;

pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub store: Arc<Store>,
}

#[derive(Debug, Deserialize)]
struct PaymentRequest {
    amount: Decimal,
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status_only(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// Accept loop for the intake API. Each connection is served on its own task.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| route(req, Arc::clone(&state)));
                    if let Err(err) = http1::Builder::new()
                        .keep_alive(true)
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!(error = ?err, "error serving connection");
                    }
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn route(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(Response::new(full("OK"))),
        (&Method::POST, "/payments") => submit_payment(req, &state).await,
        (&Method::GET, "/payments-summary") => payments_summary(&req, &state).await,
        (&Method::POST, "/purge-payments") => purge_payments(&state).await,
        _ => Ok(status_only(StatusCode::NOT_FOUND)),
    }
}

async fn submit_payment(
    req: Request<Incoming>,
    state: &AppState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();

    let request: PaymentRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return Ok(status_only(StatusCode::BAD_REQUEST)),
    };

    let msg = PaymentMessage::new(
        request.amount,
        request.correlation_id,
        OffsetDateTime::now_utc(),
    );

    match state.pool.submit(msg).await {
        Ok(()) => Ok(status_only(StatusCode::ACCEPTED)),
        Err(SubmitError::Overloaded) => Ok(status_only(StatusCode::TOO_MANY_REQUESTS)),
        Err(SubmitError::Closed) => Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

async fn payments_summary(
    req: &Request<Incoming>,
    state: &AppState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let query = req.uri().query().unwrap_or("");
    let from = time_bound(query, "from");
    let to = time_bound(query, "to");

    let summary = match state.store.summary(from, to).await {
        Ok(summary) => summary,
        Err(err) => {
            tracing::error!(error = %err, "summary query failed");
            return Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };

    match serde_json::to_vec(&summary) {
        Ok(body) => {
            let mut response = Response::new(full(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(response)
        }
        Err(_) => Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

async fn purge_payments(
    state: &AppState,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    match state.store.purge().await {
        Ok(()) => Ok(status_only(StatusCode::OK)),
        Err(err) => {
            tracing::error!(error = %err, "purge failed");
            Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

/// Window bounds are permissive: a missing or unparseable value is treated
/// as an open end.
fn time_bound(query: &str, key: &str) -> Option<OffsetDateTime> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == key)
        .and_then(|(_, value)| OffsetDateTime::parse(&value, &Rfc3339).ok())
}
