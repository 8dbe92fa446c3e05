//! State module for tracking import progress
//!
//! This module provides the pure part of the Import Status Store: which states
//! exist, which transitions are legal, and how failures are resolved.
//!
//! # Components
//!
//! - `ImportStatus`: The lifecycle state of a tracked resource
//! - `FailureKind` / `Failure`: Classification of per-resource failures
//! - `RetryPolicy` / `BackoffPolicy`: Retry budget and backoff delays

mod failure;
mod import_status;
mod retry;

// Re-export main types
pub use failure::{Failure, FailureKind};
pub use import_status::ImportStatus;
pub use retry::{BackoffPolicy, Resolution, RetryPolicy};
