pub mod config;
pub mod health_monitor;
pub mod payment;
pub mod payment_message;
pub mod payment_processor;
pub mod processor_type;
mod retry;
pub mod server;
pub mod store;
pub mod worker_pool;
