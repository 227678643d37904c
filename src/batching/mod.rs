//! Size- or time-bounded batch accumulation.

pub mod hybrid_batcher;

pub use hybrid_batcher::{BatchConfig, BatchableItem, FlushBatch, FlushReason, HybridBatcher};
