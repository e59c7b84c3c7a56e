pub mod config;
pub mod export;
pub mod monitor;
pub mod probe;
pub mod store;
