pub mod azure;
pub mod handler;
pub mod metering;
pub mod upstream;
