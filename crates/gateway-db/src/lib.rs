//! Postgres-backed persistence for durable schedules and the optional
//! memory full-text search mirror.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
