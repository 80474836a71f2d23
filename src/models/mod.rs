pub mod api_log;
pub mod balance;
pub mod endpoint;
pub mod secret;
pub mod token;
pub mod usage;
pub mod user;
