pub mod api_log;
pub mod auth;
pub mod metrics;
pub mod rate_limit;
