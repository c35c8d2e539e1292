//! Asynchronous image job pipeline
//!
//! Clients submit crop and resize jobs over HTTP. Jobs are recorded in a
//! Redis-backed store with a per-status index, delivered at least once
//! through a Redis stream with bounded retry, and executed by registered
//! image processors against inputs held in object storage.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
