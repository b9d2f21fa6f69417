//! AI Delegate: durable task queue and worker pool for delegated agent work.

pub mod api;
pub mod channels;
pub mod config;
pub mod delegation;
pub mod error;
pub mod executors;
pub mod notify;
pub mod store;
pub mod tasks;
pub mod worker;
