pub mod auth;
pub mod client_ip;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logger;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod state;
