pub mod broker;
pub mod config;
pub mod gateway_type;
pub mod health_monitor;
pub mod payment;
pub mod payment_gateway;
pub mod payment_message;
pub mod queue;
pub mod signal;
pub mod store;
pub mod worker_pool;
