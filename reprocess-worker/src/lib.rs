pub mod breaker;
pub mod chunk;
pub mod config;
pub mod consumer;
pub mod error;
pub mod manager;
pub mod processor;
pub mod stats;
