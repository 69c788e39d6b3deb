use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod};
use payment_dispatch::config::AppConfig;
use payment_dispatch::health_monitor::HealthMonitor;
use payment_dispatch::payment_processor::PaymentProcessor;
use payment_dispatch::processor_type::ProcessorKind;
use payment_dispatch::server::{self, AppState};
use payment_dispatch::store::{RecordSink, Store};
use payment_dispatch::worker_pool::{WorkerDeps, WorkerPool};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_postgres::NoTls;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Default level WARN, overridable via RUST_LOG.
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(env_filter).try_init();
    }

    let config = AppConfig::from_env()?;

    let pg_config = config.postgres_url.parse::<tokio_postgres::Config>()?;
    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = deadpool_postgres::Pool::builder(mgr)
        .max_size(config.num_workers)
        .build()?;

    // Fail fast when the database is unreachable.
    pool.get().await?;

    let store = Arc::new(Store::new(pool));

    let health_monitor = Arc::new(HealthMonitor::new(
        &config.default_health_url,
        &config.fallback_health_url,
    ));
    health_monitor.start();

    let default_processor = Arc::new(PaymentProcessor::new(
        ProcessorKind::Default,
        config.default_url.clone(),
    ));
    let fallback_processor = Arc::new(PaymentProcessor::new(
        ProcessorKind::Fallback,
        config.fallback_url.clone(),
    ));

    let sink: Arc<dyn RecordSink> = Arc::clone(&store) as Arc<dyn RecordSink>;
    let worker_pool = Arc::new(WorkerPool::start(
        config.num_workers,
        WorkerDeps {
            health_monitor,
            default_processor,
            fallback_processor,
            store: sink,
        },
    ));

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(host = %config.host, port = config.port, "listening");

    let state = Arc::new(AppState {
        pool: Arc::clone(&worker_pool),
        store,
    });

    tokio::select! {
        _ = server::serve(listener, state) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    worker_pool.shutdown().await;

    Ok(())
}
