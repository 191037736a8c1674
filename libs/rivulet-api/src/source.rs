use std::future::Future;
use std::pin::Pin;

use crate::error::SourceError;
use crate::record::{Record, TopicPartition};

/// What to do when the resume cursor predates retained history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// Seek to the earliest retained offset and continue.
    Earliest,
    /// Treat as fatal; the runtime stops.
    Fail,
}

/// Abstraction over a partitioned, ordered log with a broker-side
/// offset store.
///
/// The runtime owns exactly one source. Partition assignment,
/// replication and the wire protocol live behind this trait.
pub trait RecordSource: Send + Sync {
    /// Establish the connection. Called once by the app before `start()`;
    /// transient failures are retried by the caller with backoff.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;

    /// Poll the next batch of records, at most `max_records`, resuming
    /// after the last committed offsets. Finite per call; restartable.
    /// Paused partitions yield nothing.
    fn poll(
        &self,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, SourceError>> + Send + '_>>;

    /// Durably advance the commit cursor for one partition.
    fn commit(
        &self,
        tp: &TopicPartition,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;

    /// Last committed offset for a partition, if any.
    fn committed(
        &self,
        tp: &TopicPartition,
    ) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + '_>>;

    /// Move the read position of a partition to the earliest retained
    /// offset. Returns the new position.
    fn seek_earliest(
        &self,
        tp: &TopicPartition,
    ) -> Pin<Box<dyn Future<Output = Result<i64, SourceError>> + Send + '_>>;

    /// Exclude a partition from subsequent polls (backpressure).
    fn pause(&self, tp: &TopicPartition);

    /// Re-include a previously paused partition.
    fn resume(&self, tp: &TopicPartition);
}

/// Write records into a topic. Used by forwarding agents; the in-memory
/// source implements it, broker-backed sources map it onto a producer.
pub trait TopicProducer: Send + Sync {
    fn send(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;
}
