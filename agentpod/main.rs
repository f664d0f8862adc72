use std::error::Error;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agentpod::config::Config;
use agentpod::sandbox::{CleanupOptions, SandboxProvider, SandboxStatus};

#[derive(Parser)]
#[command(name = "agentpod", about = "Operate Kubernetes agent sandboxes")]
enum Cli {
    /// Check cluster connectivity, namespace and pod counts
    Health,
    /// List sandbox pods in the namespace
    List,
    /// Remove sandboxes by status and age
    Cleanup {
        /// Only sandboxes idle for at least this many minutes
        #[arg(long)]
        older_than_minutes: Option<i64>,
        /// Statuses to remove (repeatable); defaults to stopped
        #[arg(long = "status")]
        statuses: Vec<SandboxStatus>,
    },
    /// Fill the warm pool with up to N pods
    Prewarm { count: usize },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agentpod=info,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    run(cli, &config).await?;
    Ok(())
}

async fn run(cli: Cli, config: &Config) -> Result<()> {
    let provider_config = config
        .provider_config()
        .context("failed to load provider config")?;
    let provider = SandboxProvider::connect(provider_config, &config.kube)
        .context("failed to connect to the Kubernetes API")?;

    match cli {
        Cli::Health => {
            let health = provider.health_check().await;
            print_json(&health)?;
            if !health.healthy {
                anyhow::bail!("unhealthy: {}", health.message);
            }
        }
        Cli::List => print_json(&provider.list().await)?,
        Cli::Cleanup {
            older_than_minutes,
            statuses,
        } => {
            provider.rehydrate().await;
            let options = CleanupOptions {
                older_than: older_than_minutes
                    .map(|m| chrono::Utc::now() - chrono::Duration::minutes(m)),
                status: (!statuses.is_empty()).then_some(statuses),
            };
            let removed = provider.cleanup(options).await;
            println!("removed {removed} sandbox(es)");
        }
        Cli::Prewarm { count } => {
            let created = provider
                .prewarm(count)
                .await
                .context("prewarm failed")?;
            println!("created {created} warm pod(s)");
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{out}");
    Ok(())
}
