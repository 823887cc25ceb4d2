//! Data models for the upload client.
//!
//! `upload_log` and `boulder` map to SQLite tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`. `session` is client-side only state.

pub mod boulder;
pub mod session;
pub mod upload_log;
