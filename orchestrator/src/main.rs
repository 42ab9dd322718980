mod config;
mod dataset;
mod db;
mod errors;
mod models;
mod pipeline;
mod scheduler;
mod state;
mod store;

use crate::config::{Cli, Command};
use crate::errors::AppError;
use crate::state::AppState;
use crate::store::MemoryStore;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zk_emissions::proof::TranscriptSystem;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.data_dir)?;
    let db_url = cli.database_url();

    // A pooled in-memory database would hand each connection its own empty schema.
    let db = if db_url == "sqlite::memory:" {
        db::connect_in_memory().await?
    } else {
        db::connect(&db_url).await?
    };
    db::init_schema(&db).await?;

    let state = AppState::new(db);

    match cli.command {
        Command::Prove(args) => {
            let dry_run = args.dry_run;
            let config = args.into_config()?;
            let summary = if dry_run {
                let store = Arc::new(MemoryStore::new());
                let summary = pipeline::prove_period(TranscriptSystem, store.clone(), &config).await?;
                tracing::info!(artifacts = store.len().await, "dry run complete");
                summary
            } else {
                pipeline::run_prover(&state, &config).await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Verify(args) => {
            let report = pipeline::run_verifier(&state, args.run_id, args.customer, args.full).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.accepted {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
