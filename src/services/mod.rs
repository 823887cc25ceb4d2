//! Upload client services: the resumable uploader and the bookkeeping
//! around it.

pub mod background;
pub mod cdn;
pub mod connectivity;
pub mod pipeline;
pub mod quality_store;
pub mod reaper;
pub mod retry;
pub mod tracker;
pub mod transport;
pub mod upload_log_store;
pub mod upload_service;
pub mod wake_lock;
