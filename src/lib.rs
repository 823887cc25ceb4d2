//! Resumable chunked video uploads for boulder beta videos.
//!
//! [`services::upload_service::ResumableUploader`] moves a file to the upload
//! API chunk by chunk, resuming from whatever the server already holds.
//! [`services::pipeline::UploadPipeline`] wraps it with the upload log and
//! boulder quality bookkeeping, while [`services::tracker::UploadTracker`] and
//! [`services::reaper::StaleUploadReaper`] watch the log from the side.

pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod services;
