use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};

use rivulet_api::error::SourceError;
use rivulet_api::record::{Record, TopicPartition};
use rivulet_api::source::{OffsetReset, RecordSource};

use crate::agent::{AgentSpec, AgentState};
use crate::config::{AgentDefaults, AppConfig, SourceConfig};
use crate::error::EngineError;
use crate::policy::ValidationViolation;
use crate::router::TopicRouter;

/// Identity of one worker task: (agent id, partition).
pub type WorkerKey = (String, TopicPartition);

/// Runtime tuning derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub poll_max_records: usize,
    pub queue_depth: usize,
    pub stop_grace: Duration,
    pub offset_reset: OffsetReset,
    pub source: SourceConfig,
    /// Sleep between polls that return nothing.
    pub poll_idle: Duration,
}

impl RuntimeConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            poll_max_records: cfg.source.poll_max_records,
            queue_depth: cfg.agent_defaults.queue_depth,
            stop_grace: Duration::from_millis(cfg.stop_grace_ms),
            offset_reset: cfg.source.offset_reset.into(),
            source: cfg.source.clone(),
            poll_idle: Duration::from_millis(10),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_max_records: 256,
            queue_depth: AgentDefaults::default().queue_depth,
            stop_grace: Duration::from_millis(5_000),
            offset_reset: OffsetReset::Earliest,
            source: SourceConfig::default(),
            poll_idle: Duration::from_millis(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Observable runtime status
// ---------------------------------------------------------------------------

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("runtime status lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Shared view of worker states, failed agents and surfaced violations.
#[derive(Debug, Default)]
pub struct RuntimeStatus {
    states: Mutex<HashMap<WorkerKey, AgentState>>,
    failed: Mutex<HashSet<String>>,
    violations: Mutex<Vec<(String, ValidationViolation)>>,
}

impl RuntimeStatus {
    pub fn worker_state(&self, agent_id: &str, tp: &TopicPartition) -> Option<AgentState> {
        lock(&self.states)
            .get(&(agent_id.to_string(), tp.clone()))
            .copied()
    }

    pub fn is_failed(&self, agent_id: &str) -> bool {
        lock(&self.failed).contains(agent_id)
    }

    pub fn failed_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.failed).iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Validation violations surfaced so far, with the agent they hit.
    pub fn violations(&self) -> Vec<(String, ValidationViolation)> {
        lock(&self.violations).clone()
    }

    fn set_state(&self, key: &WorkerKey, next: AgentState) {
        let mut states = lock(&self.states);
        if let Some(prev) = states.get(key) {
            if *prev != next && !prev.can_transition_to(next) {
                tracing::warn!(
                    agent = %key.0,
                    tp = %key.1,
                    from = ?prev,
                    to = ?next,
                    "unexpected worker state transition"
                );
            }
        }
        states.insert(key.clone(), next);
    }

    fn mark_failed(&self, agent_id: &str) {
        lock(&self.failed).insert(agent_id.to_string());
    }

    fn record_violation(&self, agent_id: &str, violation: ValidationViolation) {
        lock(&self.violations)
            .push((agent_id.to_string(), violation));
    }
}

// ---------------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------------

struct Delivery {
    record: Record,
}

enum AckResult {
    Completed,
    Failed(String),
}

struct Ack {
    agent_id: String,
    tp: TopicPartition,
    offset: i64,
    result: AckResult,
}

struct Worker {
    tx: mpsc::Sender<Delivery>,
    handle: tokio::task::JoinHandle<()>,
}

/// Ack everything still queued for a dead worker as failed. Leaving the
/// backlog unacked would strand its pending entries, and shutdown would
/// then wait out the whole grace period for acks that can never arrive.
fn fail_queued(
    rx: &mut mpsc::Receiver<Delivery>,
    ack_tx: &mpsc::UnboundedSender<Ack>,
    agent_id: &str,
    tp: &TopicPartition,
) {
    rx.close();
    while let Ok(Delivery { record }) = rx.try_recv() {
        let _ = ack_tx.send(Ack {
            agent_id: agent_id.to_string(),
            tp: tp.clone(),
            offset: record.offset,
            result: AckResult::Failed("agent already failed".into()),
        });
    }
}

/// Delivery bookkeeping for one (partition, offset).
struct PendingEntry {
    /// Agents that received the record and have not acked yet.
    remaining: HashSet<String>,
    /// A receiving agent failed on this record; the offset (and everything
    /// behind it) must never commit, so the tail is redelivered after a
    /// restart.
    poisoned: bool,
}

// ---------------------------------------------------------------------------
// AgentRuntime
// ---------------------------------------------------------------------------

/// Supervises all agents: polls the source, routes and validates records,
/// feeds per-(agent, partition) workers, commits fully-acked offsets in
/// contiguous order, applies restart policies and backpressure.
pub struct AgentRuntime {
    source: Arc<dyn RecordSource>,
    router: TopicRouter,
    agents: HashMap<String, Arc<AgentSpec>>,
    cfg: RuntimeConfig,
    status: Arc<RuntimeStatus>,

    workers: HashMap<WorkerKey, Worker>,
    pending: HashMap<TopicPartition, BTreeMap<i64, PendingEntry>>,
    /// Partitions whose cursor can no longer advance in this process
    /// lifetime (a poisoned entry reached the front).
    halted: HashSet<TopicPartition>,
    ack_tx: mpsc::UnboundedSender<Ack>,
    ack_rx: Option<mpsc::UnboundedReceiver<Ack>>,
}

impl AgentRuntime {
    pub fn new(
        source: Arc<dyn RecordSource>,
        router: TopicRouter,
        agents: Vec<AgentSpec>,
        cfg: RuntimeConfig,
    ) -> Self {
        let agents = agents
            .into_iter()
            .map(|spec| (spec.id.clone(), Arc::new(spec)))
            .collect();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Self {
            source,
            router,
            agents,
            cfg,
            status: Arc::new(RuntimeStatus::default()),
            workers: HashMap::new(),
            pending: HashMap::new(),
            halted: HashSet::new(),
            ack_tx,
            ack_rx: Some(ack_rx),
        }
    }

    pub fn status(&self) -> Arc<RuntimeStatus> {
        Arc::clone(&self.status)
    }

    /// Main loop: poll → route → validate → deliver → ack → commit.
    /// Runs until the shutdown signal flips, then drains in-flight work
    /// within the grace period.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let source = Arc::clone(&self.source);
        let mut ack_rx = self
            .ack_rx
            .take()
            .ok_or_else(|| EngineError::AppState("runtime already ran".into()))?;

        tracing::info!(
            agents = self.agents.len(),
            topics = ?self.router.topics(),
            "runtime started"
        );

        let mut poll_failures: u32 = 0;
        let mut poll_backoff = Duration::from_millis(self.cfg.source.backoff_initial_ms.max(1));
        let backoff_max = Duration::from_millis(self.cfg.source.backoff_max_ms.max(1));

        loop {
            tokio::select! {
                // Shutdown first, acks before new polls: commits stay
                // current even under a steady record inflow.
                biased;

                _ = shutdown.changed() => break,
                Some(ack) = ack_rx.recv() => {
                    self.handle_ack(ack).await?;
                }
                batch = source.poll(self.cfg.poll_max_records) => match batch {
                    Ok(batch) => {
                        poll_failures = 0;
                        poll_backoff =
                            Duration::from_millis(self.cfg.source.backoff_initial_ms.max(1));
                        if batch.is_empty() {
                            tokio::time::sleep(self.cfg.poll_idle).await;
                        } else {
                            for record in batch {
                                self.dispatch(record).await?;
                            }
                        }
                    }
                    Err(SourceError::OffsetOutOfRange { tp, requested, earliest }) => {
                        self.resolve_out_of_range(tp, requested, earliest).await?;
                    }
                    Err(e) => {
                        poll_failures += 1;
                        if poll_failures >= self.cfg.source.connect_attempts.max(1) {
                            return Err(EngineError::Source(e.with_context(format!(
                                "poll (after {poll_failures} attempts)"
                            ))));
                        }
                        tracing::warn!(
                            attempt = poll_failures,
                            backoff_ms = poll_backoff.as_millis() as u64,
                            error = %e,
                            "poll failed, backing off"
                        );
                        tokio::time::sleep(poll_backoff).await;
                        poll_backoff = (poll_backoff * 2).min(backoff_max);
                    }
                },
            }
        }

        tracing::info!("runtime stopping, draining in-flight records");
        self.drain(&mut ack_rx).await;
        Ok(())
    }

    /// Route one polled record to its subscribed agents.
    async fn dispatch(&mut self, record: Record) -> Result<(), EngineError> {
        let tp = record.topic_partition();
        let offset = record.offset;

        let target_ids: Vec<String> = self
            .router
            .route(&record.topic)
            .iter()
            .filter(|id| !self.status.is_failed(id))
            .cloned()
            .collect();

        if target_ids.is_empty() {
            tracing::trace!(tp = %tp, offset, "no live subscribers, skipping");
            return Ok(());
        }

        // Register the in-flight entry before any delivery so acks can
        // never race past the bookkeeping. A halted partition gets no
        // entry: its cursor can never advance past the poisoned front,
        // so tracking later offsets would only grow the map forever.
        if !self.halted.contains(&tp) {
            self.pending.entry(tp.clone()).or_default().insert(
                offset,
                PendingEntry {
                    remaining: target_ids.iter().cloned().collect(),
                    poisoned: false,
                },
            );
        }

        for agent_id in target_ids {
            let spec = match self.agents.get(&agent_id) {
                Some(s) => Arc::clone(s),
                None => continue,
            };

            // Per-agent validation, before the handler ever runs. A
            // violating record is deterministic: retrying cannot help, so
            // the agent fails immediately and the offset stays
            // uncommitted.
            if let Err(violation) = spec.policy.check(&record) {
                tracing::error!(
                    agent = %agent_id,
                    tp = %tp,
                    offset,
                    error = %violation,
                    "validation violation, failing agent"
                );
                self.status.record_violation(&agent_id, violation);
                self.status.mark_failed(&agent_id);
                if let Some(entry) = self
                    .pending
                    .get_mut(&tp)
                    .and_then(|offsets| offsets.get_mut(&offset))
                {
                    entry.remaining.remove(&agent_id);
                    entry.poisoned = true;
                }
                continue;
            }

            self.deliver(&spec, &tp, record.clone()).await;
        }

        // A record may complete synchronously (all targets violated or
        // vanished); make sure commits still advance.
        self.advance_commits(&tp).await
    }

    /// Enqueue a record to the (agent, partition) worker, applying
    /// backpressure when its queue is full.
    async fn deliver(&mut self, spec: &Arc<AgentSpec>, tp: &TopicPartition, record: Record) {
        let key: WorkerKey = (spec.id.clone(), tp.clone());
        if !self.workers.contains_key(&key) {
            let worker = self.spawn_worker(spec, tp);
            self.workers.insert(key.clone(), worker);
        }
        let worker = match self.workers.get(&key) {
            Some(w) => w,
            None => return,
        };

        let offset = record.offset;
        match worker.tx.try_send(Delivery { record }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                // Backpressure: suspend the worker and pause the
                // partition until the queue has room again.
                self.status.set_state(&key, AgentState::Suspended);
                self.source.pause(tp);
                tracing::debug!(agent = %key.0, tp = %tp, offset, "worker queue full, partition paused");

                let closed = worker.tx.send(delivery).await.is_err();

                self.source.resume(tp);
                if closed {
                    self.poison(tp, offset, &key.0);
                } else {
                    self.status.set_state(&key, AgentState::Running);
                    tracing::debug!(agent = %key.0, tp = %tp, "partition resumed");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Worker exited (agent failed between routing and
                // delivery); the record was never processed.
                self.poison(tp, offset, &key.0);
            }
        }
    }

    fn spawn_worker(&self, spec: &Arc<AgentSpec>, tp: &TopicPartition) -> Worker {
        let (tx, mut rx) = mpsc::channel::<Delivery>(self.cfg.queue_depth.max(1));
        let key: WorkerKey = (spec.id.clone(), tp.clone());
        let spec = Arc::clone(spec);
        let status = Arc::clone(&self.status);
        let ack_tx = self.ack_tx.clone();

        status.set_state(&key, AgentState::Stopped);
        status.set_state(&key, AgentState::Starting);

        let handle = tokio::spawn(async move {
            status.set_state(&key, AgentState::Running);
            let backoff = Duration::from_millis(spec.restart.backoff_ms);

            while let Some(Delivery { record }) = rx.recv().await {
                if status.is_failed(&spec.id) {
                    // Failed elsewhere (validation or another partition);
                    // the current record and the backlog can never
                    // complete.
                    status.set_state(&key, AgentState::Failed);
                    let _ = ack_tx.send(Ack {
                        agent_id: spec.id.clone(),
                        tp: key.1.clone(),
                        offset: record.offset,
                        result: AckResult::Failed("agent already failed".into()),
                    });
                    fail_queued(&mut rx, &ack_tx, &spec.id, &key.1);
                    return;
                }

                let mut attempt: u32 = 0;
                let result = loop {
                    attempt += 1;
                    match spec.handler.on_record(&record).await {
                        Ok(()) => break AckResult::Completed,
                        Err(e) if attempt <= spec.restart.retries => {
                            tracing::warn!(
                                agent = %spec.id,
                                tp = %key.1,
                                offset = record.offset,
                                attempt,
                                error = %e,
                                "handler failed, retrying"
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        Err(e) => {
                            tracing::error!(
                                agent = %spec.id,
                                tp = %key.1,
                                offset = record.offset,
                                attempts = attempt,
                                error = %e,
                                "handler failed, restart budget exhausted"
                            );
                            break AckResult::Failed(e.to_string());
                        }
                    }
                };

                let failed = matches!(result, AckResult::Failed(_));
                let _ = ack_tx.send(Ack {
                    agent_id: spec.id.clone(),
                    tp: key.1.clone(),
                    offset: record.offset,
                    result,
                });
                if failed {
                    status.mark_failed(&spec.id);
                    status.set_state(&key, AgentState::Failed);
                    fail_queued(&mut rx, &ack_tx, &spec.id, &key.1);
                    return;
                }
            }

            // Channel closed: graceful shutdown.
            status.set_state(&key, AgentState::Stopping);
            status.set_state(&key, AgentState::Stopped);
        });

        Worker { tx, handle }
    }

    /// Mark a never-delivered record as permanently incomplete.
    fn poison(&mut self, tp: &TopicPartition, offset: i64, agent_id: &str) {
        if let Some(entry) = self
            .pending
            .get_mut(tp)
            .and_then(|offsets| offsets.get_mut(&offset))
        {
            entry.remaining.remove(agent_id);
            entry.poisoned = true;
        }
    }

    async fn handle_ack(&mut self, ack: Ack) -> Result<(), EngineError> {
        if let Some(entry) = self
            .pending
            .get_mut(&ack.tp)
            .and_then(|offsets| offsets.get_mut(&ack.offset))
        {
            entry.remaining.remove(&ack.agent_id);
            if let AckResult::Failed(reason) = &ack.result {
                tracing::error!(
                    agent = %ack.agent_id,
                    tp = %ack.tp,
                    offset = ack.offset,
                    reason = %reason,
                    "agent failed, partition cursor will not advance past this record"
                );
                entry.poisoned = true;
            }
        }
        self.advance_commits(&ack.tp).await
    }

    /// Commit the contiguous prefix of fully-acked offsets for one
    /// partition. Stops at the first incomplete or poisoned entry; a
    /// poisoned front halts the partition's cursor for good.
    async fn advance_commits(&mut self, tp: &TopicPartition) -> Result<(), EngineError> {
        if self.halted.contains(tp) {
            return Ok(());
        }
        let Some(offsets) = self.pending.get_mut(tp) else {
            return Ok(());
        };

        while let Some((&offset, entry)) = offsets.first_key_value().map(|(k, v)| (k, v)) {
            if entry.poisoned {
                self.halted.insert(tp.clone());
                // Nothing behind the poisoned front can commit either;
                // drop the bookkeeping for the whole partition.
                offsets.clear();
                break;
            }
            if !entry.remaining.is_empty() {
                break;
            }
            commit_with_retry(self.source.as_ref(), tp, offset, &self.cfg.source).await?;
            offsets.remove(&offset);
        }
        Ok(())
    }

    /// Apply the configured reset policy when the resume cursor predates
    /// retained history.
    async fn resolve_out_of_range(
        &mut self,
        tp: TopicPartition,
        requested: i64,
        earliest: i64,
    ) -> Result<(), EngineError> {
        match self.cfg.offset_reset {
            OffsetReset::Earliest => {
                let pos = self.source.seek_earliest(&tp).await?;
                tracing::warn!(
                    tp = %tp,
                    requested,
                    earliest,
                    reset_to = pos,
                    "cursor predates retained history, reset to earliest"
                );
                Ok(())
            }
            OffsetReset::Fail => Err(EngineError::Source(SourceError::OffsetOutOfRange {
                tp,
                requested,
                earliest,
            })),
        }
    }

    /// Drain in-flight work within the grace period, committing whatever
    /// completes; cancel the rest. Cancelled invocations never ack, so
    /// their offsets never commit.
    async fn drain(mut self, ack_rx: &mut mpsc::UnboundedReceiver<Ack>) {
        let deadline = Instant::now() + self.cfg.stop_grace;

        // Close all worker queues; workers finish what is already queued.
        let handles: Vec<(WorkerKey, tokio::task::JoinHandle<()>)> = self
            .workers
            .drain()
            .map(|(key, Worker { tx, handle })| {
                drop(tx);
                (key, handle)
            })
            .collect();

        // Keep committing completed work until the deadline or until
        // nothing is pending.
        loop {
            let has_pending = self
                .pending
                .iter()
                .any(|(tp, offsets)| !self.halted.contains(tp) && !offsets.is_empty());
            if !has_pending {
                break;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                tracing::warn!("grace period expired with records still in flight");
                break;
            }
            match timeout(left, ack_rx.recv()).await {
                Ok(Some(ack)) => {
                    if let Err(e) = self.handle_ack(ack).await {
                        tracing::error!(error = %e, "commit failed during drain");
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        for (key, mut handle) in handles {
            let left = deadline.saturating_duration_since(Instant::now());
            if timeout(left, &mut handle).await.is_err() {
                // Cancelled invocations never acked, so their offsets
                // stay uncommitted.
                handle.abort();
                tracing::warn!(agent = %key.0, tp = %key.1, "worker cancelled after grace period");
            }
        }

        tracing::info!("runtime stopped");
    }
}

/// Commit with a small bounded retry for transient source errors.
async fn commit_with_retry(
    source: &dyn RecordSource,
    tp: &TopicPartition,
    offset: i64,
    cfg: &SourceConfig,
) -> Result<(), EngineError> {
    let mut backoff = Duration::from_millis(cfg.backoff_initial_ms.max(1));
    let attempts = 3;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match source.commit(tp, offset).await {
            Ok(()) => {
                tracing::debug!(tp = %tp, offset, "committed");
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(tp = %tp, offset, attempt, error = %e, "commit failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                return Err(EngineError::Source(
                    e.with_context(format!("commit {tp}@{offset}")),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::Future;
    use std::pin::Pin;

    use rivulet_api::agent::Agent;
    use rivulet_api::error::HandlerError;
    use rivulet_api::record::now_ms;

    use crate::agent::RestartPolicy;
    use crate::policy::{ValidationPolicy, ValidationRule};
    use crate::router::Subscription;
    use crate::source::MemorySource;

    struct OkAgent;

    impl Agent for OkAgent {
        fn on_record(
            &self,
            _record: &Record,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn record(offset: i64) -> Record {
        Record {
            topic: "t".into(),
            partition: 0,
            offset,
            key: None,
            value: vec![0],
            ts_ms: now_ms(),
        }
    }

    fn spec(id: &str, policy: ValidationPolicy) -> AgentSpec {
        AgentSpec {
            id: id.into(),
            handler: Arc::new(OkAgent),
            policy,
            restart: RestartPolicy::default(),
        }
    }

    #[tokio::test]
    async fn halted_partition_stops_accumulating_pending_entries() {
        let mut router = TopicRouter::new();
        router
            .register(Subscription::new("strict", ["t".to_string()]))
            .unwrap();
        router
            .register(Subscription::new("lax", ["t".to_string()]))
            .unwrap();

        let mut rt = AgentRuntime::new(
            Arc::new(MemorySource::new()),
            router,
            vec![
                spec(
                    "strict",
                    ValidationPolicy::new().with_rule(ValidationRule::max_value_length(0)),
                ),
                spec("lax", ValidationPolicy::new()),
            ],
            RuntimeConfig::default(),
        );

        // First record violates for "strict": the entry is poisoned and
        // the partition halts with its bookkeeping dropped.
        let tp = TopicPartition::new("t", 0);
        rt.dispatch(record(0)).await.unwrap();
        assert!(rt.halted.contains(&tp));
        assert!(rt.pending.get(&tp).is_none_or(BTreeMap::is_empty));

        // The surviving agent keeps consuming, but the halted partition
        // must not collect an entry per record.
        for offset in 1..50 {
            rt.dispatch(record(offset)).await.unwrap();
        }
        assert!(rt.pending.get(&tp).is_none_or(BTreeMap::is_empty));
    }
}
