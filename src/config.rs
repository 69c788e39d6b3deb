use std::env;
use std::fmt;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7118;
const DEFAULT_PROCESSOR_URL: &str = "http://localhost:8001/payments";
const FALLBACK_PROCESSOR_URL: &str = "http://localhost:8002/payments";

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required environment variable {}", key),
            ConfigError::Invalid(key, value) => {
                write!(f, "invalid value {:?} for environment variable {}", value, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub postgres_url: String,
    pub default_url: String,
    pub fallback_url: String,
    pub default_health_url: String,
    pub fallback_health_url: String,
    pub num_workers: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let postgres_url = get("POSTGRES_URL").ok_or(ConfigError::Missing("POSTGRES_URL"))?;

        let host = get("SERVER_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match get("SERVER_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid("SERVER_PORT", raw))?,
            None => DEFAULT_PORT,
        };

        let default_url =
            get("SERVICE_DEFAULT_URL").unwrap_or_else(|| DEFAULT_PROCESSOR_URL.to_string());
        let fallback_url =
            get("SERVICE_FALLBACK_URL").unwrap_or_else(|| FALLBACK_PROCESSOR_URL.to_string());

        let default_health_url = get("SERVICE_DEFAULT_HEALTH_URL")
            .unwrap_or_else(|| format!("{}/service-health", default_url));
        let fallback_health_url = get("SERVICE_FALLBACK_HEALTH_URL")
            .unwrap_or_else(|| format!("{}/service-health", fallback_url));

        let num_workers = match get("NUM_WORKERS") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::Invalid("NUM_WORKERS", raw)),
            },
            None => default_workers(),
        };

        Ok(Self {
            host,
            port,
            postgres_url,
            default_url,
            fallback_url,
            default_health_url,
            fallback_health_url,
            num_workers,
        })
    }
}

/// Workers spend most of their time blocked on HTTP calls, so they
/// outnumber cores.
fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 8
}
