use crate::processor_type::ProcessorKind;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;

const PROBE_INTERVAL: Duration = Duration::from_millis(1000);
const PROBE_DEADLINE: Duration = Duration::from_millis(500);

/// A processor whose reported floor latency exceeds this is treated as
/// unusable even when it does not report itself as failing.
const MAX_ACCEPTABLE_RESPONSE_TIME_MS: u64 = 120;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProcessorHealth {
    pub failing: bool,
    #[serde(rename = "minResponseTime")]
    pub min_response_time: u64,
}

impl ProcessorHealth {
    fn degraded(&self) -> bool {
        self.failing || self.min_response_time > MAX_ACCEPTABLE_RESPONSE_TIME_MS
    }
}

/// Both records live in one struct behind a single lock so a selection reads
/// a consistent pair, never one stale and one fresh.
#[derive(Debug, Clone, Copy)]
struct HealthSnapshot {
    default: ProcessorHealth,
    fallback: ProcessorHealth,
}

impl HealthSnapshot {
    fn startup() -> Self {
        let usable = ProcessorHealth {
            failing: false,
            min_response_time: 0,
        };
        Self {
            default: usable,
            fallback: usable,
        }
    }
}

#[derive(Debug)]
pub enum SelectError {
    BothUnavailable,
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::BothUnavailable => write!(f, "both processors are unavailable"),
        }
    }
}

impl std::error::Error for SelectError {}

pub struct HealthMonitor {
    default_health_url: String,
    fallback_health_url: String,
    snapshot: Arc<RwLock<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(default_health_url: &str, fallback_health_url: &str) -> Self {
        Self {
            default_health_url: default_health_url.to_string(),
            fallback_health_url: fallback_health_url.to_string(),
            snapshot: Arc::new(RwLock::new(HealthSnapshot::startup())),
        }
    }

    /// Spawns the probe task. One task probes both processors on a fixed
    /// interval; failed probes leave the stored record untouched.
    pub fn start(&self) {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let urls = [
            (ProcessorKind::Default, self.default_health_url.clone()),
            (ProcessorKind::Fallback, self.fallback_health_url.clone()),
        ];
        let snapshot = Arc::clone(&self.snapshot);

        tokio::spawn(async move {
            let mut ticker = interval(PROBE_INTERVAL);
            loop {
                ticker.tick().await;
                for (kind, url) in &urls {
                    match Self::probe(&client, url).await {
                        Ok(health) => {
                            Self::store(&snapshot, *kind, health).await;
                            tracing::debug!(processor = %kind, health = ?health, "updated processor health");
                        }
                        Err(err) => {
                            tracing::warn!(processor = %kind, error = %err, "health probe failed");
                        }
                    }
                }
            }
        });
    }

    /// Picks the processor the next payment should use.
    pub async fn determine_processor(&self) -> Result<ProcessorKind, SelectError> {
        let snapshot = *self.snapshot.read().await;

        match (snapshot.default.degraded(), snapshot.fallback.degraded()) {
            (true, true) => Err(SelectError::BothUnavailable),
            (true, false) => Ok(ProcessorKind::Fallback),
            (false, true) => Ok(ProcessorKind::Default),
            (false, false) => {
                // Default is the cheaper processor; give it up only when it
                // is more than three times slower than the fallback.
                if snapshot.default.min_response_time > 3 * snapshot.fallback.min_response_time {
                    Ok(ProcessorKind::Fallback)
                } else {
                    Ok(ProcessorKind::Default)
                }
            }
        }
    }

    /// Marks a processor as failing right away instead of waiting for the
    /// next probe. The next successful probe restores it.
    pub async fn inform_failure(&self, kind: ProcessorKind) {
        let mut snapshot = self.snapshot.write().await;
        let record = match kind {
            ProcessorKind::Default => &mut snapshot.default,
            ProcessorKind::Fallback => &mut snapshot.fallback,
        };
        record.failing = true;
    }

    /// Replaces one stored record verbatim with a probe result.
    pub async fn apply_probe(&self, kind: ProcessorKind, health: ProcessorHealth) {
        Self::store(&self.snapshot, kind, health).await;
    }

    async fn store(snapshot: &RwLock<HealthSnapshot>, kind: ProcessorKind, health: ProcessorHealth) {
        let mut snapshot = snapshot.write().await;
        match kind {
            ProcessorKind::Default => snapshot.default = health,
            ProcessorKind::Fallback => snapshot.fallback = health,
        }
    }

    async fn probe(
        client: &Client<HttpConnector, Empty<Bytes>>,
        url: &str,
    ) -> Result<ProcessorHealth, Box<dyn std::error::Error + Send + Sync>> {
        let uri = url.parse::<hyper::Uri>()?;

        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())?;

        let res = tokio::time::timeout(PROBE_DEADLINE, client.request(req))
            .await
            .map_err(|_| "probe deadline elapsed")??;

        if res.status() != StatusCode::OK {
            return Err(format!("health endpoint returned {}", res.status()).into());
        }

        let body = res.into_body().collect().await?.to_bytes();
        let health: ProcessorHealth = serde_json::from_slice(&body)?;

        Ok(health)
    }
}
