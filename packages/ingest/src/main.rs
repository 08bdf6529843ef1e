#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the maritime incident collector.

use std::{sync::Arc, time::Instant};

use chrono::Duration;
use clap::{Parser, Subcommand};
use seawatch_cache::{CacheStore, file::FileBackend, memory::MemoryBackend};
use seawatch_ingest::{
    SyncContext, SyncOptions, all_sources, enabled_sources,
    followup::{FollowUpQueue, LogHandler},
    maintenance, run_log, sync_source,
};
use seawatch_ingest_models::{StoreKind, SyncConfig, SyncStatus};
use seawatch_source::{
    Fetcher, RetryOptions,
    reference::{ReferenceResolver, RemoteReference},
    registry::collector_for,
    source_def::SourceDefinition,
};

#[derive(Parser)]
#[command(name = "seawatch_ingest", about = "Maritime security incident collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all configured sources
    Sources,
    /// Collect from one source
    Sync {
        /// Source identifier (e.g., "recaap")
        source: String,
        /// Re-process the cached raw payload instead of fetching
        #[arg(long)]
        cached: bool,
    },
    /// Collect from every enabled source
    SyncAll {
        /// Comma-separated list of source IDs (overrides `SEAWATCH_SOURCES`)
        #[arg(long)]
        sources: Option<String>,
        /// Re-process cached raw payloads instead of fetching
        #[arg(long)]
        cached: bool,
    },
    /// Show what is stored per source
    Summary {
        /// Limit to one source
        #[arg(long)]
        source: Option<String>,
    },
    /// Delete stored state
    Clear {
        /// Source to clear
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        source: Option<String>,
        /// Clear every source
        #[arg(long)]
        all: bool,
    },
    /// Remove the newest stored incidents so the next sync re-adds them
    Rollback {
        /// Source to roll back
        #[arg(long)]
        source: String,
        /// Number of incidents to remove
        #[arg(long, default_value = "1")]
        count: usize,
    },
    /// Print recent run log entries
    Runs {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
    /// Print per-function health over a window
    Health {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

async fn open_store(config: &SyncConfig) -> Result<CacheStore, Box<dyn std::error::Error>> {
    let store = match config.store {
        StoreKind::File => CacheStore::new(Arc::new(FileBackend::open(&config.data_dir).await?)),
        StoreKind::Memory => {
            log::warn!("Using the in-memory store; nothing will persist");
            CacheStore::new(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "duckdb")]
        StoreKind::DuckDb => {
            tokio::fs::create_dir_all(&config.data_dir).await?;
            let path = config.data_dir.join("seawatch.duckdb");
            CacheStore::new(Arc::new(
                seawatch_cache::duckdb_backend::DuckDbBackend::open(&path)?,
            ))
        }
        #[cfg(not(feature = "duckdb"))]
        StoreKind::DuckDb => {
            return Err("SEAWATCH_STORE=duckdb requires the `duckdb` feature".into());
        }
    };
    Ok(store)
}

async fn build_context(config: &SyncConfig) -> Result<SyncContext, Box<dyn std::error::Error>> {
    let store = open_store(config).await?;
    let fetcher = Fetcher::new()?;
    let retry = RetryOptions {
        timeout: config.http_timeout,
        max_retries: config.max_retries,
        retry_delay: config.retry_delay,
    };

    let remote = config.reference_url.as_ref().map(|base_url| RemoteReference {
        fetcher: fetcher.clone(),
        base_url: base_url.clone(),
        options: retry,
    });
    let resolver = ReferenceResolver::load(&store, remote.as_ref()).await;

    let queue = FollowUpQueue::spawn(Arc::new(LogHandler), store.clone());
    Ok(SyncContext::new(store, fetcher, retry, resolver)
        .with_followups(queue)
        .with_invocation_budget(config.invocation_budget))
}

async fn shutdown(ctx: SyncContext) {
    if let Some(queue) = ctx.followups {
        let stats = queue.shutdown().await;
        log::info!(
            "Follow-ups: {} processed, {} failed",
            stats.processed,
            stats.failed
        );
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn lookback(hours: i64) -> Result<Duration, Box<dyn std::error::Error>> {
    Duration::try_hours(hours)
        .filter(|window| *window >= Duration::zero())
        .ok_or_else(|| format!("--hours out of range: {hours}").into())
}

fn parse_source_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}


#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command {
        Commands::Sources => {
            let sources = all_sources();
            println!("{:<10} {:<10} DISPLAY NAME", "ID", "NAME");
            println!("{}", "-".repeat(50));
            for source in &sources {
                println!("{:<10} {:<10} {}", source.id, source.name, source.display_name);
            }
        }
        Commands::Sync { source, cached } => {
            let collector =
                collector_for(&source).ok_or_else(|| format!("Unknown source: {source}"))?;
            let ctx = build_context(&config).await?;
            let report = sync_source(&ctx, collector.as_ref(), SyncOptions { cached }).await;
            print_json(&report)?;
            shutdown(ctx).await;
            if report.status == SyncStatus::Error {
                return Err(report.message.into());
            }
        }
        Commands::SyncAll { sources, cached } => {
            let filter = sources.as_deref().map(parse_source_list).or(config.sources.clone());
            let sources = enabled_sources(filter.as_deref());
            log::info!(
                "Syncing {} source(s): {}",
                sources.len(),
                sources
                    .iter()
                    .map(|s| s.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            let ctx = build_context(&config).await?;
            let start = Instant::now();
            let mut failed = 0_usize;
            for source in &sources {
                let Some(collector) = collector_for(&source.id) else {
                    continue;
                };
                let report = sync_source(&ctx, collector.as_ref(), SyncOptions { cached }).await;
                if report.status == SyncStatus::Error {
                    failed += 1;
                }
                print_json(&report)?;
            }
            log::info!(
                "Synced {} source(s) in {:.1}s, {failed} failed",
                sources.len(),
                start.elapsed().as_secs_f64()
            );
            shutdown(ctx).await;
        }
        Commands::Summary { source } => {
            let store = open_store(&config).await?;
            let ids: Vec<String> = match source {
                Some(id) => vec![id],
                None => all_sources().into_iter().map(|s| s.id).collect(),
            };
            let mut summaries = Vec::with_capacity(ids.len());
            for id in &ids {
                summaries.push(maintenance::summarize_source(&store, id).await);
            }
            print_json(&summaries)?;
        }
        Commands::Clear { source, all } => {
            let store = open_store(&config).await?;
            if all {
                let ids: Vec<String> = all_sources()
                    .into_iter()
                    .map(|s: SourceDefinition| s.id)
                    .collect();
                maintenance::clear_all(&store, &ids).await?;
            } else if let Some(id) = source {
                maintenance::clear_source(&store, &id).await?;
            }
        }
        Commands::Rollback { source, count } => {
            let store = open_store(&config).await?;
            let removed = maintenance::rollback(&store, &source, count).await?;
            for incident in &removed {
                println!("{}\t{}", incident.source_id, incident.title);
            }
        }
        Commands::Runs { hours } => {
            let store = open_store(&config).await?;
            let since = store.now() - lookback(hours)?;
            print_json(&run_log::entries(&store, since).await)?;
        }
        Commands::Health { hours } => {
            let store = open_store(&config).await?;
            let since = store.now() - lookback(hours)?;
            print_json(&run_log::health(&store, since).await)?;
        }
    }

    Ok(())
}
