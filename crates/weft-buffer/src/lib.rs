//! Partition-tolerant result buffering.
//!
//! A durable SQLite-backed FIFO holds task results while the upstream
//! coordinator is unreachable; a partition detector gates new work and
//! triggers a flush on recovery; a periodic loop retries in the background.

pub mod buffer;
pub mod flush;
pub mod partition;
pub mod sink;

pub use buffer::{BufferError, BufferMetrics, BufferedResult, ResultBuffer};
pub use flush::PeriodicFlush;
pub use partition::{
    PartitionDetector, PartitionError, PartitionEvent, PartitionEventType, PartitionMonitor,
};
pub use sink::{ResultEnvelope, ResultSink, UpstreamSink};
