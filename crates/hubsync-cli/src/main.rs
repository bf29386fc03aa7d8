use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hubsync_crm::{CrmClient, HubSpotClient, HubSpotConfig};
use hubsync_seed::SeedLoader;
use hubsync_sync::{SyncConfig, SyncKind, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

const WIPE_PHRASE: &str = "YES, DELETE ALL";

#[derive(Debug, Parser)]
#[command(name = "hubsync")]
#[command(about = "HubSpot to MongoDB sync and seed tooling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Leads,
    Deals,
}

impl From<Kind> for SyncKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Leads => SyncKind::Leads,
            Kind::Deals => SyncKind::Deals,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract one page of CRM records, upsert them and refresh summaries.
    Sync {
        #[arg(long, value_enum, default_value = "leads")]
        kind: Kind,
    },
    /// Bulk-load seed files into the CRM with relationship assignment.
    Load {
        #[arg(long, default_value = "contacts.json")]
        contacts_file: PathBuf,
        #[arg(long, default_value = "leads.json")]
        leads_file: PathBuf,
        #[arg(long, default_value = "deals.json")]
        deals_file: PathBuf,
    },
    /// Archive every deal, contact and company in the CRM.
    Wipe,
}

fn crm_client(config: &SyncConfig) -> Result<Arc<dyn CrmClient>> {
    ensure!(
        !config.hubspot_token.is_empty(),
        "HUBSPOT_TOKEN is not set in the environment"
    );
    let client = HubSpotClient::new(HubSpotConfig {
        base_url: config.hubspot_base_url.clone(),
        token: config.hubspot_token.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })
    .context("building hubspot client")?;
    Ok(Arc::new(client))
}

/// Deletion requires the confirmation phrase twice in a row.
fn confirm_wipe() -> Result<bool> {
    for prompt in [
        format!("Type '{WIPE_PHRASE}' to confirm: "),
        format!("Are you absolutely sure? Type '{WIPE_PHRASE}' again: "),
    ] {
        print!("{prompt}");
        io::stdout().flush().context("flushing prompt")?;
        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("reading confirmation")?;
        if input.trim() != WIPE_PHRASE {
            return Ok(false);
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { kind: Kind::Leads }) {
        Commands::Sync { kind } => {
            let pipeline = SyncPipeline::from_config(config)?;
            let summary = pipeline.run_once(kind.into()).await?;
            println!(
                "sync complete: run_id={} kind={} extracted={} matched={} modified={} upserted={}",
                summary.run_id,
                summary.kind,
                summary.extracted,
                summary.upsert.matched,
                summary.upsert.modified,
                summary.upsert.upserted
            );
            println!(
                "summaries: status_rows={} stage_rows={} close_rows={}",
                summary.status_rows, summary.stage_rows, summary.close_rows
            );
        }
        Commands::Load {
            contacts_file,
            leads_file,
            deals_file,
        } => {
            let crm = crm_client(&config)?;
            let mut loader = SeedLoader::from_os_rng(crm);
            let summary = loader
                .bulk_load(&contacts_file, &leads_file, &deals_file)
                .await;
            println!(
                "load complete: contacts={} leads={} deals={} total={}",
                summary.contacts_loaded,
                summary.leads_loaded,
                summary.deals_loaded,
                summary.total()
            );
        }
        Commands::Wipe => {
            println!("WARNING: you are about to delete ALL data from the CRM");
            if !confirm_wipe()? {
                info!("operation cancelled");
                println!("Operation cancelled");
                return Ok(());
            }
            let crm = crm_client(&config)?;
            let loader = SeedLoader::from_os_rng(crm);
            let summary = loader.wipe_all().await;
            println!(
                "wipe complete: deals={} contacts={} companies={} total={}",
                summary.deals_deleted,
                summary.contacts_deleted,
                summary.companies_deleted,
                summary.total()
            );
        }
    }

    Ok(())
}
