//! Request pipeline: coalescing, prioritization, deduplication, adaptive
//! retry and compression of outgoing changes.

pub mod bandwidth;
pub mod coalescer;
pub mod compression;
pub mod dedup;
pub mod delta;
pub mod metrics;
pub mod pool;
pub mod priority_queue;
pub mod retry;

pub use bandwidth::{
    BandwidthConfig, BandwidthDetector, BandwidthProbe, ConnectionQuality, HttpBandwidthProbe,
    ProbeSample, SyncStrategy,
};
pub use coalescer::{CoalescedChange, CoalescerConfig, RequestCoalescer};
pub use compression::{CompressionConfig, Compressor, EncodedPayload, WriteBody};
pub use dedup::{DedupConfig, DedupStats, ExecuteOptions, RequestDeduplicator};
pub use delta::{apply_delta, calculate_delta, merge_changes};
pub use metrics::{MetricsCollector, SyncMetrics};
pub use pool::ObjectPool;
pub use priority_queue::PriorityQueue;
pub use retry::{retry, RetryConfig, SmartRetry};
