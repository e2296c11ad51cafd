pub mod channel;
pub mod config;
pub mod dedup;
pub mod kafka;
pub mod metrics;
pub mod payload;
pub mod publisher;
pub mod queues;
pub mod redis;
pub mod retry;
