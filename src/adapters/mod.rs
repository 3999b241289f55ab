pub mod campaigns;
pub mod counter_store;
pub mod health_handler;
pub mod metrics_handler;
pub mod pacing_handler;
pub mod rate_limit;
pub mod tracker;
