use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rivulet_api::agent::Agent;
use rivulet_api::error::HandlerError;
use rivulet_api::record::Record;
use rivulet_api::source::TopicProducer;

use crate::policy::ValidationPolicy;

/// Lifecycle state of an agent worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    /// Worker queue full; polling of the partition is paused.
    Suspended,
    Stopping,
    /// Unrecovered failure. The agent no longer consumes its partitions;
    /// other agents keep running.
    Failed,
}

impl AgentState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Stopping)
                | (Suspended, Stopping)
                | (Stopping, Stopped)
                | (Running, Failed)
                | (Suspended, Failed)
        )
    }
}

/// How many times a failing handler is re-invoked before the agent is
/// marked Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Retries after the first failure; total invocations = retries + 1.
    pub retries: u32,
    /// Delay between retries, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_ms: 50,
        }
    }
}

/// Everything the runtime needs to supervise one agent: handler,
/// validation rules, restart policy.
pub struct AgentSpec {
    pub id: String,
    pub handler: Arc<dyn Agent>,
    pub policy: ValidationPolicy,
    pub restart: RestartPolicy,
}

impl std::fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpec")
            .field("id", &self.id)
            .field("restart", &self.restart)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers used by the server binary
// ---------------------------------------------------------------------------

/// Logs every record, tagged with its source topic.
pub struct PrintAgent {
    name: String,
}

impl PrintAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Agent for PrintAgent {
    fn on_record(
        &self,
        record: &Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        let topic = record.topic.clone();
        let offset = record.offset;
        let text = String::from_utf8_lossy(&record.value).into_owned();
        Box::pin(async move {
            tracing::info!(
                agent = %self.name,
                topic = %topic,
                offset,
                message = %text,
                "received"
            );
            Ok(())
        })
    }
}

/// Re-publishes every record to a target topic.
pub struct ForwardAgent {
    target: String,
    producer: Arc<dyn TopicProducer>,
}

impl ForwardAgent {
    pub fn new(target: impl Into<String>, producer: Arc<dyn TopicProducer>) -> Self {
        Self {
            target: target.into(),
            producer,
        }
    }
}

impl Agent for ForwardAgent {
    fn on_record(
        &self,
        record: &Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        let key = record.key.clone();
        let value = record.value.clone();
        Box::pin(async move {
            self.producer
                .send(&self.target, key, value)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_lifecycle_path() {
        use AgentState::*;
        let path = [Stopped, Starting, Running, Suspended, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn failure_only_from_active_states() {
        use AgentState::*;
        assert!(Running.can_transition_to(Failed));
        assert!(Suspended.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
    }
}
