//! Core data models for the bucket index.
//!
//! Row types map to database tables via `sqlx::FromRow`; record types are the
//! write-side shapes produced by remote listings. All of them serialize as
//! JSON via `serde`.

pub mod browse;
pub mod bucket_info;
pub mod job;
pub mod metrics;
pub mod object;
pub mod prefix_status;
pub mod version;
