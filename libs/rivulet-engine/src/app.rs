use std::sync::Arc;

use tokio::sync::watch;

use rivulet_api::agent::Agent;
use rivulet_api::source::RecordSource;

use crate::agent::{AgentSpec, RestartPolicy};
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::policy::ValidationPolicy;
use crate::router::{Subscription, TopicRouter};
use crate::runtime::{AgentRuntime, RuntimeConfig, RuntimeStatus};
use crate::source::connect_with_backoff;

/// A set of topic names used to build a subscription. Obtained from
/// [`App::topic`]; one handle with several names merges the streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicHandle {
    topics: Vec<String>,
}

impl TopicHandle {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppPhase {
    New,
    Configured,
    Connected,
    Running,
    Stopped,
}

type ConfigHook = Box<dyn FnMut(&mut AppConfig) + Send>;

struct Registration {
    spec: AgentSpec,
    restart_override: Option<RestartPolicy>,
}

/// Per-process handle to the running supervisor task.
struct RunningRuntime {
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Result<(), EngineError>>,
    status: Arc<RuntimeStatus>,
}

/// Composition root: configuration lifecycle, topic handles, agent
/// registration, and the connect → start → stop sequence.
///
/// Explicitly instantiated and passed by reference — there is no ambient
/// process-wide singleton. Configuration is mutable only inside
/// `configure()` hooks and frozen once `connect()` succeeds.
pub struct App {
    config: AppConfig,
    phase: AppPhase,
    before_hooks: Vec<ConfigHook>,
    configured_hooks: Vec<ConfigHook>,
    router: TopicRouter,
    registrations: Vec<Registration>,
    source: Option<Arc<dyn RecordSource>>,
    runtime: Option<RunningRuntime>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("app_name", &self.config.app_name)
            .field("phase", &self.phase)
            .field("agents", &self.registrations.len())
            .finish()
    }
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            phase: AppPhase::New,
            before_hooks: Vec::new(),
            configured_hooks: Vec::new(),
            router: TopicRouter::new(),
            registrations: Vec::new(),
            source: None,
            runtime: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Declare a topic (or a merged set of topics) for subscriptions.
    pub fn topic<I, S>(&self, names: I) -> TopicHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TopicHandle {
            topics: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Run before `on_configured` hooks, before any connection attempt.
    pub fn on_before_configured(&mut self, hook: impl FnMut(&mut AppConfig) + Send + 'static) {
        self.before_hooks.push(Box::new(hook));
    }

    /// Run after the before-hooks, still before any connection attempt.
    /// Hooks fire in registration order and may derive config values.
    pub fn on_configured(&mut self, hook: impl FnMut(&mut AppConfig) + Send + 'static) {
        self.configured_hooks.push(Box::new(hook));
    }

    /// Register an agent with default validation (none) and the
    /// configured default restart policy. Returns the agent id.
    pub fn register_agent(
        &mut self,
        handle: &TopicHandle,
        id: impl Into<String>,
        handler: Arc<dyn Agent>,
    ) -> Result<String, EngineError> {
        self.register_agent_with(handle, id, handler, ValidationPolicy::new(), None)
    }

    /// Register an agent with explicit validation rules and an optional
    /// restart policy override. Fails with `DuplicateAgent` if the id is
    /// already subscribed.
    pub fn register_agent_with(
        &mut self,
        handle: &TopicHandle,
        id: impl Into<String>,
        handler: Arc<dyn Agent>,
        policy: ValidationPolicy,
        restart: Option<RestartPolicy>,
    ) -> Result<String, EngineError> {
        if !matches!(self.phase, AppPhase::New | AppPhase::Configured) {
            return Err(EngineError::AppState(
                "agents must be registered before connect()".into(),
            ));
        }
        if handle.topics.is_empty() {
            return Err(EngineError::Config(
                "topic handle names no topics".into(),
            ));
        }
        let id = id.into();
        self.router
            .register(Subscription::new(id.clone(), handle.topics.iter().cloned()))?;
        self.registrations.push(Registration {
            spec: AgentSpec {
                id: id.clone(),
                handler,
                policy,
                restart: RestartPolicy::default(),
            },
            restart_override: restart,
        });
        tracing::info!(agent = %id, topics = ?handle.topics, "registered agent");
        Ok(id)
    }

    /// Run the configuration hooks in registration order. Idempotent:
    /// called implicitly by `connect()` when still pending.
    pub fn configure(&mut self) -> Result<(), EngineError> {
        match self.phase {
            AppPhase::New => {}
            AppPhase::Configured => return Ok(()),
            _ => {
                return Err(EngineError::AppState(
                    "configure() after connect()".into(),
                ));
            }
        }
        for hook in &mut self.before_hooks {
            hook(&mut self.config);
        }
        for hook in &mut self.configured_hooks {
            hook(&mut self.config);
        }
        self.phase = AppPhase::Configured;
        tracing::info!(app = %self.config.app_name, "configured");
        Ok(())
    }

    /// Establish the record source, retrying transient failures with
    /// exponential backoff inside the configured attempt budget.
    /// Configuration is read-only from here on.
    pub async fn connect(&mut self, source: Arc<dyn RecordSource>) -> Result<(), EngineError> {
        self.configure()?;
        if self.phase != AppPhase::Configured {
            return Err(EngineError::AppState("connect() out of order".into()));
        }
        connect_with_backoff(source.as_ref(), &self.config.source)
            .await
            .map_err(|e| e.with_context(format!("broker {}", self.config.broker_address)))?;
        self.source = Some(source);
        self.phase = AppPhase::Connected;
        tracing::info!(broker = %self.config.broker_address, "connected");
        Ok(())
    }

    /// Spawn the supervisor; all agents transition to Running.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.phase != AppPhase::Connected {
            return Err(EngineError::AppState("start() before connect()".into()));
        }
        let source = match self.source.clone() {
            Some(s) => s,
            None => return Err(EngineError::AppState("no source attached".into())),
        };
        if self.registrations.is_empty() {
            return Err(EngineError::AppState("no agents registered".into()));
        }

        let default_restart = RestartPolicy {
            retries: self.config.agent_defaults.restart_retries,
            backoff_ms: self.config.agent_defaults.restart_backoff_ms,
        };
        let specs: Vec<AgentSpec> = self
            .registrations
            .drain(..)
            .map(|reg| AgentSpec {
                restart: reg.restart_override.unwrap_or(default_restart),
                ..reg.spec
            })
            .collect();

        let router = std::mem::take(&mut self.router);
        let runtime = AgentRuntime::new(
            source,
            router,
            specs,
            RuntimeConfig::from_app_config(&self.config),
        );
        let status = runtime.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runtime.run(shutdown_rx));

        self.runtime = Some(RunningRuntime {
            shutdown_tx,
            handle,
            status,
        });
        self.phase = AppPhase::Running;
        tracing::info!(app = %self.config.app_name, "started");
        Ok(())
    }

    /// Observable runtime state; available while running or stopped.
    pub fn status(&self) -> Option<Arc<RuntimeStatus>> {
        self.runtime.as_ref().map(|r| Arc::clone(&r.status))
    }

    /// Whether the supervisor task is still alive.
    pub fn is_running(&self) -> bool {
        self.phase == AppPhase::Running
            && self
                .runtime
                .as_ref()
                .map(|r| !r.handle.is_finished())
                .unwrap_or(false)
    }

    /// Graceful shutdown: drain in-flight records within the grace
    /// period, then stop. Returns the runtime's exit result.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        if self.phase != AppPhase::Running {
            return Err(EngineError::AppState("stop() without a running app".into()));
        }
        let running = match self.runtime.take() {
            Some(r) => r,
            None => return Err(EngineError::AppState("stop() before start()".into())),
        };
        let _ = running.shutdown_tx.send(true);
        let result = match running.handle.await {
            Ok(res) => res,
            Err(e) => Err(EngineError::AppState(format!("runtime task panicked: {e}"))),
        };
        // Keep status observable after shutdown.
        self.runtime = Some(RunningRuntime {
            shutdown_tx: running.shutdown_tx,
            handle: tokio::spawn(async { Ok::<(), EngineError>(()) }),
            status: running.status,
        });
        self.phase = AppPhase::Stopped;
        tracing::info!(app = %self.config.app_name, "stopped");
        result
    }

    /// Blocking entry point: connect → start → run until SIGINT → stop.
    pub async fn run(&mut self, source: Arc<dyn RecordSource>) -> Result<(), EngineError> {
        self.connect(source).await?;
        self.start().await?;
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to wait for shutdown signal");
        }
        tracing::info!("shutdown signal received");
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn config() -> AppConfig {
        AppConfig::parse(
            r#"
            app_name = "example-app"
            broker_address = "mem://local"

            [options]
            message_max_length = 15
            "#,
        )
        .unwrap()
    }

    struct NopAgent;

    impl Agent for NopAgent {
        fn on_record(
            &self,
            _record: &rivulet_api::record::Record,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = Result<(), rivulet_api::error::HandlerError>>
                    + Send
                    + '_,
            >,
        > {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn hooks_run_in_registration_order_before_connect() {
        let mut app = App::new(config());
        app.on_before_configured(|cfg| {
            cfg.options
                .insert("order".into(), toml::Value::String("before".into()));
        });
        app.on_configured(|cfg| {
            // Derive a value from an existing option.
            let max = cfg.option_i64("message_max_length").unwrap_or(0);
            cfg.options
                .insert("derived_max".into(), toml::Value::Integer(max * 2));
            cfg.options
                .insert("order".into(), toml::Value::String("after".into()));
        });

        app.configure().unwrap();
        assert_eq!(app.config().option_str("order"), Some("after"));
        assert_eq!(app.config().option_i64("derived_max"), Some(30));

        // Second call is a no-op.
        app.configure().unwrap();
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut app = App::new(config());
        let handle = app.topic(["topic1"]);
        app.register_agent(&handle, "a", Arc::new(NopAgent)).unwrap();
        let err = app
            .register_agent(&handle, "a", Arc::new(NopAgent))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn lifecycle_enforced() {
        let mut app = App::new(config());
        assert!(matches!(
            app.start().await.unwrap_err(),
            EngineError::AppState(_)
        ));
        assert!(matches!(
            app.stop().await.unwrap_err(),
            EngineError::AppState(_)
        ));

        let handle = app.topic(["topic1"]);
        app.register_agent(&handle, "a", Arc::new(NopAgent)).unwrap();

        let source = Arc::new(MemorySource::new());
        app.connect(source).await.unwrap();

        // Config frozen after connect.
        assert!(matches!(
            app.configure().unwrap_err(),
            EngineError::AppState(_)
        ));
        // Late registration rejected.
        let late = app.topic(["topic2"]);
        assert!(matches!(
            app.register_agent(&late, "b", Arc::new(NopAgent)).unwrap_err(),
            EngineError::AppState(_)
        ));

        app.start().await.unwrap();
        assert!(app.is_running());
        app.stop().await.unwrap();
        assert!(!app.is_running());

        // A second stop is out of order, same as stop before start.
        assert!(matches!(
            app.stop().await.unwrap_err(),
            EngineError::AppState(_)
        ));
    }
}
