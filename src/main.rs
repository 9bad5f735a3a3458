//! # crm-sync entry point
//!
//! Loads configuration, opens the account store and runs one sync pass over
//! every connected account. Partial failures are logged and do not change the
//! exit status; configuration and startup failures do.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crm_sync::analytics::{AnalyticsSink, HttpAnalyticsSink, LogAnalyticsSink};
use crm_sync::config::ConfigLoader;
use crm_sync::crm::HubSpotClient;
use crm_sync::repositories::{DbAccountStore, PersistenceMode};
use crm_sync::sync::{SyncOrchestrator, SyncSettings};
use crm_sync::{db, telemetry};

#[derive(Debug, Parser)]
#[command(name = "crm-sync", version, about = "Incremental CRM to analytics sync")]
struct Cli {
    /// Read accounts but never write them back.
    #[arg(long)]
    no_persist: bool,

    /// Log events instead of submitting them; implies --no-persist.
    #[arg(long)]
    dry_run: bool,

    /// Directory holding the layered .env files.
    #[arg(long, value_name = "DIR")]
    env_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = match cli.env_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("failed to load configuration")?;

    telemetry::init_tracing(&config).context("failed to initialize tracing")?;
    info!(profile = %config.profile, "loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "effective configuration");
    }

    let db = Arc::new(db::init_pool(&config).await?);
    db::run_migrations(&db).await?;

    let persistence = if cli.dry_run || cli.no_persist || !config.persist_accounts {
        PersistenceMode::Disabled
    } else {
        PersistenceMode::Enabled
    };
    let store = Arc::new(DbAccountStore::new(db).with_mode(persistence));

    let crm = Arc::new(HubSpotClient::new(config.hubspot()).context("failed to build CRM client")?);

    let analytics: Arc<dyn AnalyticsSink> = match config.analytics_endpoint()? {
        Some(endpoint) if !cli.dry_run => Arc::new(
            HttpAnalyticsSink::new(
                endpoint,
                config.analytics_api_key.clone(),
                config.http_timeout(),
            )
            .context("failed to build analytics client")?,
        ),
        _ => {
            warn!("no analytics endpoint in use, events will only be logged");
            Arc::new(LogAnalyticsSink)
        }
    };

    let orchestrator = SyncOrchestrator::new(crm, store, analytics)
        .with_settings(SyncSettings::from(&config.sync));

    let summary = orchestrator.run().await.context("failed to list accounts")?;
    info!(
        run_id = %summary.run_id,
        accounts = summary.accounts.len(),
        events = summary.events_flushed(),
        failed_kinds = summary.failed_kinds(),
        "sync complete"
    );

    Ok(())
}
