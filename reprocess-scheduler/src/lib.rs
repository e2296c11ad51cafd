pub mod batcher;
pub mod config;
pub mod connect;
pub mod mode;
