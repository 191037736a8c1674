use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rivulet_api::error::SourceError;
use rivulet_api::record::{Record, TopicPartition, now_ms};
use rivulet_api::source::{RecordSource, TopicProducer};

use crate::config::SourceConfig;
use crate::error::EngineError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("source lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// ---------------------------------------------------------------------------
// MemorySource — in-process partitioned log
// ---------------------------------------------------------------------------

/// One partition of one topic: retained records plus the read cursor.
#[derive(Debug, Default)]
struct PartitionLog {
    /// Retained records, oldest first. Offsets are contiguous.
    records: VecDeque<Record>,
    /// Offset assigned to the next appended record.
    next_offset: i64,
    /// Next offset to hand out from `poll`.
    position: i64,
}

impl PartitionLog {
    fn earliest(&self) -> i64 {
        self.records
            .front()
            .map(|r| r.offset)
            .unwrap_or(self.next_offset)
    }
}

fn default_retention() -> usize {
    100_000
}

/// In-process partitioned log implementing [`RecordSource`] and
/// [`TopicProducer`].
///
/// Backs tests and local (`mem://`) runs: bounded retention per
/// partition, a committed-offset store, and partition pause for
/// backpressure. Broker-backed sources implement the same traits over a
/// real client.
pub struct MemorySource {
    partitions: Mutex<HashMap<TopicPartition, PartitionLog>>,
    committed: Mutex<HashMap<TopicPartition, i64>>,
    paused: Mutex<HashSet<TopicPartition>>,
    /// Records retained per partition; older ones are dropped, which is
    /// what makes `OffsetOutOfRange` reachable.
    retention: usize,
    /// Partitions created per topic on first publish.
    partitions_per_topic: u32,
    round_robin: AtomicU64,
    connected: AtomicBool,
    notify: tokio::sync::Notify,
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("retention", &self.retention)
            .field("partitions_per_topic", &self.partitions_per_topic)
            .finish()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_retention(default_retention())
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
            retention: retention.max(1),
            partitions_per_topic: 1,
            round_robin: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn with_partitions(mut self, n: u32) -> Self {
        self.partitions_per_topic = n.max(1);
        self
    }

    /// Append a record to an explicit partition. Returns its offset.
    pub fn publish_to(
        &self,
        topic: &str,
        partition: u32,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> i64 {
        let tp = TopicPartition::new(topic, partition);
        let mut partitions = lock(&self.partitions);
        let log = partitions.entry(tp).or_default();
        let offset = log.next_offset;
        log.next_offset += 1;
        log.records.push_back(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            value,
            ts_ms: now_ms(),
        });
        while log.records.len() > self.retention {
            log.records.pop_front();
        }
        drop(partitions);
        self.notify.notify_waiters();
        offset
    }

    /// Append a record, choosing the partition from the key hash or
    /// round-robin for keyless records.
    pub fn publish(&self, topic: &str, key: Option<Vec<u8>>, value: Vec<u8>) -> i64 {
        let partition = match &key {
            Some(k) => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() % self.partitions_per_topic as u64) as u32
            }
            None => {
                (self.round_robin.fetch_add(1, Ordering::Relaxed)
                    % self.partitions_per_topic as u64) as u32
            }
        };
        self.publish_to(topic, partition, key, value)
    }

    /// Wait until at least one record has been published since the call.
    pub async fn wait_for_data(&self) {
        self.notify.notified().await;
    }

    /// Number of retained records across all partitions of a topic.
    pub fn retained(&self, topic: &str) -> usize {
        let partitions = lock(&self.partitions);
        partitions
            .iter()
            .filter(|(tp, _)| tp.topic == topic)
            .map(|(_, log)| log.records.len())
            .sum()
    }

    /// Rewind read positions to the committed cursors, as a reconnect
    /// would. Retained records past the cursor are served again.
    pub fn rewind_to_committed(&self) {
        let committed = lock(&self.committed);
        let mut partitions = lock(&self.partitions);
        for (tp, log) in partitions.iter_mut() {
            log.position = committed.get(tp).map(|off| off + 1).unwrap_or(0);
        }
    }
}

impl RecordSource for MemorySource {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        Box::pin(async move {
            // Resume read positions from the committed cursors.
            let committed = lock(&self.committed);
            let mut partitions = lock(&self.partitions);
            for (tp, log) in partitions.iter_mut() {
                if let Some(off) = committed.get(tp) {
                    log.position = off + 1;
                }
            }
            self.connected.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn poll(
        &self,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, SourceError>> + Send + '_>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::Acquire) {
                return Err(SourceError::connection("poll before connect"));
            }

            let paused = lock(&self.paused).clone();
            let mut partitions = lock(&self.partitions);
            let mut batch = Vec::new();

            let mut tps: Vec<TopicPartition> = partitions.keys().cloned().collect();
            tps.sort();

            for tp in tps {
                if paused.contains(&tp) {
                    continue;
                }
                let log = match partitions.get_mut(&tp) {
                    Some(l) => l,
                    None => continue,
                };
                let earliest = log.earliest();
                if log.position < earliest {
                    return Err(SourceError::OffsetOutOfRange {
                        tp,
                        requested: log.position,
                        earliest,
                    });
                }
                for record in log.records.iter() {
                    if batch.len() >= max_records {
                        break;
                    }
                    if record.offset >= log.position {
                        batch.push(record.clone());
                    }
                }
                if let Some(last) = batch.last() {
                    if last.topic == tp.topic && last.partition == tp.partition {
                        log.position = last.offset + 1;
                    }
                }
                if batch.len() >= max_records {
                    break;
                }
            }

            Ok(batch)
        })
    }

    fn commit(
        &self,
        tp: &TopicPartition,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let tp = tp.clone();
        Box::pin(async move {
            let mut committed = lock(&self.committed);
            match committed.get(&tp) {
                // The cursor never moves backwards.
                Some(prev) if *prev >= offset => {
                    tracing::warn!(
                        tp = %tp,
                        offset,
                        committed = prev,
                        "ignoring non-monotonic commit"
                    );
                }
                _ => {
                    committed.insert(tp, offset);
                }
            }
            Ok(())
        })
    }

    fn committed(
        &self,
        tp: &TopicPartition,
    ) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + '_>> {
        let tp = tp.clone();
        Box::pin(async move { lock(&self.committed).get(&tp).copied() })
    }

    fn seek_earliest(
        &self,
        tp: &TopicPartition,
    ) -> Pin<Box<dyn Future<Output = Result<i64, SourceError>> + Send + '_>> {
        let tp = tp.clone();
        Box::pin(async move {
            let mut partitions = lock(&self.partitions);
            let log = partitions.entry(tp).or_default();
            log.position = log.earliest();
            Ok(log.position)
        })
    }

    fn pause(&self, tp: &TopicPartition) {
        lock(&self.paused).insert(tp.clone());
    }

    fn resume(&self, tp: &TopicPartition) {
        lock(&self.paused).remove(tp);
    }
}

impl TopicProducer for MemorySource {
    fn send(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.publish(&topic, key, value);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Connection with bounded exponential backoff
// ---------------------------------------------------------------------------

/// Connect the source, retrying transient failures with exponential
/// backoff inside the configured attempt budget.
pub async fn connect_with_backoff(
    source: &dyn RecordSource,
    cfg: &SourceConfig,
) -> Result<(), EngineError> {
    let attempts = cfg.connect_attempts.max(1);
    let mut backoff = Duration::from_millis(cfg.backoff_initial_ms.max(1));
    let backoff_max = Duration::from_millis(cfg.backoff_max_ms.max(1));

    let mut attempt = 0;
    loop {
        attempt += 1;
        match source.connect().await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(attempt, "source connected after retry");
                }
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    attempt,
                    attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "source connect failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_max);
            }
            Err(e) => {
                return Err(EngineError::Source(
                    e.with_context(format!("connect (after {attempt} attempts)")),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_resumes_after_commit() {
        let source = MemorySource::new();
        source.publish_to("t", 0, None, b"a".to_vec());
        source.publish_to("t", 0, None, b"b".to_vec());
        source.connect().await.unwrap();

        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, 0);
        assert_eq!(batch[1].offset, 1);

        // Nothing new — empty poll.
        assert!(source.poll(10).await.unwrap().is_empty());

        let tp = TopicPartition::new("t", 0);
        source.commit(&tp, 1).await.unwrap();
        source.publish_to("t", 0, None, b"c".to_vec());

        // Reconnect resumes after the cursor.
        source.connect().await.unwrap();
        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 2);
    }

    #[tokio::test]
    async fn commit_is_monotonic() {
        let source = MemorySource::new();
        let tp = TopicPartition::new("t", 0);
        source.commit(&tp, 5).await.unwrap();
        source.commit(&tp, 3).await.unwrap();
        assert_eq!(source.committed(&tp).await, Some(5));
    }

    #[tokio::test]
    async fn paused_partition_is_skipped() {
        let source = MemorySource::new();
        source.publish_to("t", 0, None, b"a".to_vec());
        source.publish_to("u", 0, None, b"b".to_vec());
        source.connect().await.unwrap();

        source.pause(&TopicPartition::new("t", 0));
        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].topic, "u");

        source.resume(&TopicPartition::new("t", 0));
        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].topic, "t");
    }

    #[tokio::test]
    async fn trimmed_history_raises_offset_out_of_range() {
        let source = MemorySource::with_retention(2);
        source.connect().await.unwrap();
        for v in [b"a", b"b", b"c", b"d"] {
            source.publish_to("t", 0, None, v.to_vec());
        }

        // Position 0 predates the retained window [2, 3].
        let err = source.poll(10).await.unwrap_err();
        match err {
            SourceError::OffsetOutOfRange {
                requested,
                earliest,
                ..
            } => {
                assert_eq!(requested, 0);
                assert_eq!(earliest, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Reset policy: seek to earliest and continue.
        let pos = source
            .seek_earliest(&TopicPartition::new("t", 0))
            .await
            .unwrap();
        assert_eq!(pos, 2);
        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, 2);
    }
}
