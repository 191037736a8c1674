use std::sync::Arc;

use clap::Parser;

use rivulet_api::source::{RecordSource, TopicProducer};
use rivulet_engine::agent::{ForwardAgent, PrintAgent, RestartPolicy};
use rivulet_engine::app::App;
use rivulet_engine::config::{AgentKind, AppConfig};
use rivulet_engine::policy::{ValidationPolicy, ValidationRule};
use rivulet_engine::source::MemorySource;

#[derive(Parser)]
#[command(name = "rivulet-server", about = "Rivulet stream agent runtime")]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(long, default_value = "config.toml", env = "RIVULET_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match AppConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Only the in-memory source ships with the server; broker-backed
    // sources come from embedding the engine as a library.
    if !config.broker_address.starts_with("mem://") {
        tracing::error!(
            broker = %config.broker_address,
            "no built-in client for this broker address (expected mem://...)"
        );
        std::process::exit(1);
    }
    let memory = Arc::new(MemorySource::new());
    let producer: Arc<dyn TopicProducer> = memory.clone();
    let source: Arc<dyn RecordSource> = memory.clone();

    tracing::info!(
        agents = config.agents.len(),
        seed = config.seed.len(),
        "building app"
    );
    let mut app = App::new(config.clone());
    for agent_cfg in &config.agents {
        let handle = app.topic(agent_cfg.topics.iter().cloned());

        let mut policy = ValidationPolicy::new();
        if let Some(max) = agent_cfg.max_message_length {
            policy.push(ValidationRule::max_value_length(max));
        }

        let restart = agent_cfg.restart_retries.map(|retries| RestartPolicy {
            retries,
            backoff_ms: config.agent_defaults.restart_backoff_ms,
        });

        let handler: Arc<dyn rivulet_api::agent::Agent> = match agent_cfg.kind {
            AgentKind::Print => Arc::new(PrintAgent::new(agent_cfg.name.clone())),
            AgentKind::Forward => {
                let target = match &agent_cfg.forward_to {
                    Some(t) => t.clone(),
                    None => {
                        tracing::error!(agent = %agent_cfg.name, "forward agent without forward_to");
                        std::process::exit(1);
                    }
                };
                Arc::new(ForwardAgent::new(target, Arc::clone(&producer)))
            }
        };

        if let Err(e) =
            app.register_agent_with(&handle, agent_cfg.name.clone(), handler, policy, restart)
        {
            tracing::error!(agent = %agent_cfg.name, error = %e, "failed to register agent");
            std::process::exit(1);
        }
    }

    for seed in &config.seed {
        memory.publish(
            &seed.topic,
            seed.key.as_ref().map(|k| k.as_bytes().to_vec()),
            seed.value.as_bytes().to_vec(),
        );
    }

    tracing::info!("rivulet-server starting, press Ctrl+C to stop");
    if let Err(e) = app.run(source).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}
