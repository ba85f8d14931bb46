//! rotacache - command-line front end for the rotacache engine.
//!
//! Fetches, watches and mutates resources on a rota server through the
//! local cache, and manages the offline mutation queue.

mod config;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rotacache_core::{
    merge_fields, ConflictStrategy, HttpRemote, MutationOutcome, MutationPriority,
    MutationRequest, QueryEngine, QueryState, ResourceKey,
};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "rotacache", version, about = "Cached, offline-tolerant access to a rota server")]
struct Cli {
    /// Config file (defaults to ~/.config/rotacache/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server base URL, overriding the config file
    #[arg(long, global = true, env = "ROTACACHE_SERVER_URL")]
    server: Option<String>,

    /// Directory for the cache store and offline queue
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a resource through the cache and print it
    Fetch {
        /// Key segments, e.g. `schedule 42`
        #[arg(required = true)]
        key: Vec<String>,
        /// Ignore a fresh cached copy
        #[arg(long)]
        refresh: bool,
    },
    /// Send a mutation; queued for replay if the server is unreachable
    Mutate {
        tag: String,
        /// Mutation variables as JSON
        variables: String,
        /// Key segments of the resource this mutation changes
        #[arg(long, num_args = 1..)]
        target: Vec<String>,
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
        /// Conflict strategy if the target changed server-side before replay
        #[arg(long, value_enum)]
        conflict: Option<ConflictArg>,
    },
    /// Subscribe to a resource and print every update until Ctrl-C
    Watch {
        #[arg(required = true)]
        key: Vec<String>,
    },
    /// Replay the offline mutation queue
    Replay,
    /// Show cache, queue and configuration status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove cached entries
    Clear {
        /// Keep this many of the most recent entries
        #[arg(long)]
        keep: Option<usize>,
        /// Also drop every queued mutation
        #[arg(long)]
        queue: bool,
    },
    /// Write the effective configuration to the config file
    InitConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PriorityArg {
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for MutationPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::High => MutationPriority::High,
            PriorityArg::Normal => MutationPriority::Normal,
            PriorityArg::Low => MutationPriority::Low,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ConflictArg {
    Local,
    Server,
    Merge,
    Newest,
}

impl From<ConflictArg> for ConflictStrategy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Local => ConflictStrategy::Local,
            ConflictArg::Server => ConflictStrategy::Server,
            ConflictArg::Merge => ConflictStrategy::Merge,
            ConflictArg::Newest => ConflictStrategy::Newest,
        }
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rotacache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());
    info!("rotacache starting");

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(server) = cli.server.clone() {
        config.server_url = Some(server);
    }

    if let Command::InitConfig = cli.command {
        let path = config.save(cli.config.as_deref())?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => config.data_dir()?,
    };
    let engine = open_engine(&config, &data_dir)?;

    let result = run(&engine, &config, &data_dir, cli.command).await;
    engine.shutdown().await?;
    result
}

fn open_engine(config: &Config, data_dir: &Path) -> Result<QueryEngine> {
    let mut remote = HttpRemote::new(config.server_url()?)?;
    if let Some(token) = &config.token {
        remote = remote.with_token(token.clone());
    }
    let engine = QueryEngine::open(config.engine.clone(), Arc::new(remote), data_dir)
        .with_context(|| format!("Failed to open cache at {}", data_dir.display()))?;

    // Field-level merge for every known mutation tag.
    for tag in config.engine.invalidation.tags() {
        engine.register_merge(tag, Arc::new(merge_fields));
    }
    Ok(engine)
}

async fn run(engine: &QueryEngine, config: &Config, data_dir: &Path, command: Command) -> Result<()> {
    match command {
        Command::Fetch { key, refresh } => {
            let key = ResourceKey::parse_words(&key);
            let payload = if refresh {
                engine.refetch(&key).await?
            } else {
                engine.query(&key).await?
            };
            print_json(&payload)?;
        }
        Command::Mutate {
            tag,
            variables,
            target,
            priority,
            conflict,
        } => {
            let variables: Value =
                serde_json::from_str(&variables).context("Mutation variables must be valid JSON")?;
            let mut request = MutationRequest::new(tag, variables).with_priority(priority.into());
            if !target.is_empty() {
                request = request.with_target(ResourceKey::parse_words(&target));
            }
            if let Some(conflict) = conflict {
                request = request.with_conflict_strategy(conflict.into());
            }
            match engine.mutate_with(request).await? {
                MutationOutcome::Applied(response) => print_json(&response)?,
                MutationOutcome::Queued(id) => {
                    eprintln!("Server unreachable; mutation {} queued for replay", id);
                }
            }
        }
        Command::Watch { key } => watch(engine, ResourceKey::parse_words(&key)).await?,
        Command::Replay => {
            let report = engine.reconnect().await?;
            println!(
                "Replayed {}, dropped {}, failed {}",
                report.succeeded.len(),
                report.dropped.len(),
                report.exhausted.len()
            );
            for (mutation, error) in &report.exhausted {
                eprintln!("  {} ({}): {}", mutation.mutation_tag, mutation.id, error);
            }
            if let Some((mutation, error)) = &report.retrying {
                eprintln!(
                    "Stopped at {} ({}): {}; {} still queued",
                    mutation.mutation_tag,
                    mutation.id,
                    error,
                    engine.pending_mutations().len()
                );
            }
        }
        Command::Status { json } => status(engine, config, data_dir, json)?,
        Command::Clear { keep, queue } => {
            match keep {
                Some(count) => {
                    let evicted = engine.trim(count).await?;
                    println!("Evicted {} entries", evicted);
                }
                None => {
                    engine.clear_cache().await?;
                    println!("Cache cleared");
                }
            }
            if queue {
                engine.clear_queue().await?;
                println!("Offline queue cleared");
            }
        }
        Command::InitConfig => {}
    }
    Ok(())
}

async fn watch(engine: &QueryEngine, key: ResourceKey) -> Result<()> {
    engine.start();
    let mut subscription = engine.subscribe(&key);
    print_state(&key, &subscription.current())?;

    loop {
        tokio::select! {
            next = subscription.next() => match next {
                Some(state) => print_state(&key, &state)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.unsubscribe(&key);
    Ok(())
}

fn print_state(key: &ResourceKey, state: &QueryState) -> Result<()> {
    match state {
        QueryState::Loading => eprintln!("[{}] loading...", key),
        QueryState::Ready(payload) => print_json(payload)?,
        QueryState::Failed(e) => eprintln!("[{}] error: {}", key, e),
    }
    Ok(())
}

fn status(engine: &QueryEngine, config: &Config, data_dir: &Path, json: bool) -> Result<()> {
    let stats = engine.store_stats();
    let pending = engine.pending_mutations();

    if json {
        let report = serde_json::json!({
            "server_url": config.server_url,
            "data_dir": data_dir,
            "store": stats,
            "pending_mutations": pending,
        });
        return print_json(&report);
    }

    println!("Server:     {}", config.server_url.as_deref().unwrap_or("(not set)"));
    println!("Data dir:   {}", data_dir.display());
    println!(
        "Cache:      {} entries, {} / {} bytes",
        stats.entries, stats.bytes, stats.budget_bytes
    );
    let now = Utc::now();
    for entry in engine.entries() {
        let state = if entry.is_stale(now) { "stale" } else { "fresh" };
        println!("  {:<40} {:>6}  {}", entry.key, state, entry.age_display());
    }
    println!("Queue:      {} pending", pending.len());
    for mutation in &pending {
        println!(
            "  {:<24} {:?} attempts={} {}",
            mutation.mutation_tag, mutation.priority, mutation.attempt_count, mutation.id
        );
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_mutate() {
        let cli = Cli::try_parse_from([
            "rotacache",
            "mutate",
            "staffChanged",
            r#"{"id": 3}"#,
            "--target",
            "roster",
            "3",
            "--priority",
            "high",
            "--conflict",
            "newest",
        ])
        .unwrap();
        match cli.command {
            Command::Mutate {
                tag,
                target,
                priority,
                conflict,
                ..
            } => {
                assert_eq!(tag, "staffChanged");
                assert_eq!(target, ["roster", "3"]);
                assert_eq!(MutationPriority::from(priority), MutationPriority::High);
                assert_eq!(conflict.map(ConflictStrategy::from), Some(ConflictStrategy::Newest));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_fetch_requires_a_key() {
        assert!(Cli::try_parse_from(["rotacache", "fetch"]).is_err());
    }
}
