// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry building blocks shared by provisioning and sink flushes.
//!
//! ```text
//! backoff.rs  - Backoff trait, ExponentialBackoff, ConstantBackoff
//! retry.rs    - Retry (bounded attempts + cancellation), RetryConfig presets, retry()
//! ```

pub mod backoff;
pub mod retry;

pub use backoff::{Backoff, ConstantBackoff, ExponentialBackoff};
pub use retry::{retry, Retry, RetryConfig};
