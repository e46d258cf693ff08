use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use earlybird_adapters::{adapter_for_source, REMOTE_BOARD_SOURCE_ID};
use earlybird_core::UserRecord;
use earlybird_match::{
    ChatOracle, DeliveryConfig, DeliveryRunner, EmailConfig, EmailTransport,
    HttpEmailTransport, LogEmailTransport, MatchOracle, MatchingEngine, OracleConfig,
    TracingSessionSink,
};
use earlybird_pipeline::{
    IngestionPipeline, PipelineStatus, RuleSet, TracingTelemetrySink,
};
use earlybird_store::{
    HttpClientConfig, HttpFetcher, InMemoryJobStore, InMemoryUserStore, JobStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "earlybird")]
#[command(about = "Early-career job ingestion and digest delivery")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, classify and store jobs from the configured board.
    Ingest,
    /// Match a stored job corpus to subscribers and send digests.
    Deliver {
        /// Subscriber records as a JSON array.
        #[arg(long, value_name = "FILE")]
        users: PathBuf,
        /// Job corpus as a JSON array, as produced by `ingest`.
        #[arg(long, value_name = "FILE")]
        jobs: PathBuf,
        /// Log digests instead of calling the email API.
        #[arg(long)]
        dry_run: bool,
    },
    /// Ingest and then deliver against the fresh corpus in one pass.
    Run {
        #[arg(long, value_name = "FILE")]
        users: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
}

/// Ambient settings, read once at the process edge. Everything below
/// main works off explicit config structs.
#[derive(Debug, Clone)]
struct EnvSettings {
    source_id: String,
    user_agent: String,
    http_timeout_secs: u64,
    rules_file: Option<PathBuf>,
    oracle_api_key: Option<String>,
    email_api_key: Option<String>,
}

impl EnvSettings {
    fn from_env() -> Self {
        Self {
            source_id: std::env::var("EARLYBIRD_SOURCE")
                .unwrap_or_else(|_| REMOTE_BOARD_SOURCE_ID.to_string()),
            user_agent: std::env::var("EARLYBIRD_USER_AGENT")
                .unwrap_or_else(|_| "earlybird-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("EARLYBIRD_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            rules_file: std::env::var("EARLYBIRD_RULES_FILE").ok().map(PathBuf::from),
            oracle_api_key: std::env::var("OPENAI_API_KEY").ok(),
            email_api_key: std::env::var("RESEND_API_KEY").ok(),
        }
    }

    fn fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        })
    }

    fn rules(&self) -> Result<RuleSet> {
        match &self.rules_file {
            Some(path) => RuleSet::from_path(path),
            None => Ok(RuleSet::builtin()),
        }
    }

    fn engine(&self) -> Result<MatchingEngine> {
        let oracle: Option<Box<dyn MatchOracle>> = match &self.oracle_api_key {
            Some(key) => Some(Box::new(ChatOracle::new(OracleConfig::new(key.clone()))?)),
            None => None,
        };
        Ok(MatchingEngine::new(oracle))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = EnvSettings::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let store = Arc::new(InMemoryJobStore::new());
            let report = ingest(&settings, store).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Deliver {
            users,
            jobs,
            dry_run,
        } => {
            let store = Arc::new(InMemoryJobStore::new());
            for job in load_json::<Vec<earlybird_core::Job>>(&jobs)? {
                store.upsert(&job).await?;
            }
            let summary = deliver(&settings, store, &users, dry_run).await?;
            println!(
                "delivery complete: processed={} sent={} errors={}",
                summary.processed, summary.sent, summary.errors
            );
        }
        Commands::Run { users, dry_run } => {
            let store = Arc::new(InMemoryJobStore::new());
            let report = ingest(&settings, store.clone()).await?;
            if let PipelineStatus::Degraded { reason } = &report.status {
                eprintln!("ingestion degraded: {reason}");
            }
            let summary = deliver(&settings, store, &users, dry_run).await?;
            println!(
                "run complete: ingested={} processed={} sent={} errors={}",
                report.jobs.len(),
                summary.processed,
                summary.sent,
                summary.errors
            );
        }
    }

    Ok(())
}

async fn ingest(
    settings: &EnvSettings,
    store: Arc<InMemoryJobStore>,
) -> Result<earlybird_pipeline::IngestionReport> {
    let adapter = adapter_for_source(&settings.source_id)
        .with_context(|| format!("unknown source '{}'", settings.source_id))?;
    let pipeline = IngestionPipeline::new(
        adapter,
        settings.rules()?,
        settings.fetcher()?,
        store,
        Arc::new(TracingTelemetrySink),
    );
    Ok(pipeline.run(Uuid::new_v4()).await)
}

async fn deliver(
    settings: &EnvSettings,
    store: Arc<InMemoryJobStore>,
    users_file: &PathBuf,
    dry_run: bool,
) -> Result<earlybird_match::DeliverySummary> {
    let users = Arc::new(InMemoryUserStore::new(load_json::<Vec<UserRecord>>(
        users_file,
    )?));

    let transport: Arc<dyn EmailTransport> = if dry_run {
        Arc::new(LogEmailTransport)
    } else {
        let key = settings
            .email_api_key
            .clone()
            .context("RESEND_API_KEY not set; pass --dry-run to log digests instead")?;
        Arc::new(HttpEmailTransport::new(EmailConfig::new(key))?)
    };

    let runner = DeliveryRunner::new(
        store,
        users,
        settings.engine()?,
        transport,
        Arc::new(TracingSessionSink),
        DeliveryConfig::default(),
    );
    runner.run().await
}

fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
