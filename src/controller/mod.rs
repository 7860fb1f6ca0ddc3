//! # Controller
//!
//! Core controller modules for the push secret controller.
//!
//! - `backoff`: Exponential backoff with jitter for retries
//! - `duration`: Refresh interval parsing
//! - `generator`: Password, UUID and provider token generators
//! - `locks`: Keyed async locks
//! - `queue`: Coalescing work queue
//! - `reconciler`: Push reconciliation, retries and refresh scheduling
//! - `rules`: Validated push rules and destination planning
//! - `source`: Source secret cache
//! - `state`: Sync records and their persistence

pub mod backoff;
pub mod duration;
pub mod generator;
pub mod locks;
pub mod queue;
pub mod reconciler;
pub mod rules;
pub mod source;
pub mod state;
