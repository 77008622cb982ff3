//! One-shot reconciliation entry point for cron jobs and operators.
//!
//! Configuration comes from the `SYNC_*` environment variables read by
//! [`CoreConfig::from_env`] and [`LoggingConfig::from_env`].

use std::path::PathBuf;
use std::process;

use clap::Parser;
use core_runtime::config::CoreConfig;
use core_runtime::logging::{init_logging, LoggingConfig};
use core_service::{EntityRegistry, Result, SyncService};
use core_sync::{SyncOutcome, TriggeredBy};
use tracing::error;

/// Reconcile directory collections with the external record source.
#[derive(Debug, Parser)]
#[command(name = "directory-sync", version, about = "Reconcile directory collections with the record source")]
struct Cli {
    /// Entity registry JSON listing entity types and mapping tables
    #[arg(long, env = "SYNC_REGISTRY_PATH")]
    registry: PathBuf,

    /// Entity type to reconcile (repeatable); every registered type when omitted
    #[arg(long = "entity")]
    entities: Vec<String>,

    /// Record the runs as triggered by this user instead of the scheduler
    #[arg(long)]
    user: Option<String>,

    /// Print secrets issued to newly created documents
    #[arg(long)]
    show_credentials: bool,
}

impl Cli {
    fn triggered_by(&self) -> TriggeredBy {
        match &self.user {
            Some(user) => TriggeredBy::User(user.clone()),
            None => TriggeredBy::Scheduled,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(2);
        }
    }
}

/// `Ok(false)` when at least one entity type failed to reconcile
async fn run(cli: Cli) -> Result<bool> {
    init_logging(LoggingConfig::from_env()?)?;

    let registry = EntityRegistry::load(&cli.registry).await?;
    let service = SyncService::bootstrap(CoreConfig::from_env()?, registry).await?;

    let entity_types = if cli.entities.is_empty() {
        service.entity_types()
    } else {
        cli.entities.clone()
    };

    let mut all_ok = true;
    for entity_type in &entity_types {
        match service.trigger(entity_type, cli.triggered_by()).await {
            Ok(outcome) => {
                println!("{}", summary(&outcome));
                if cli.show_credentials {
                    for credential in &outcome.generated_credentials {
                        println!("{}\t{}\t{}", credential.entity_type, credential.natural_key, credential.secret);
                    }
                }
            }
            Err(e) => {
                error!(%entity_type, error = %e, "Sync failed");
                all_ok = false;
            }
        }
    }

    service.shutdown().await;
    Ok(all_ok)
}

fn summary(outcome: &SyncOutcome) -> String {
    let results = &outcome.results;
    format!(
        "{} {} created={} updated={} deleted={} skipped={} failed={} total={}",
        outcome.entity_type,
        outcome.status,
        results.created,
        results.updated,
        results.deleted,
        results.skipped,
        results.failed,
        outcome.total()
    )
}
