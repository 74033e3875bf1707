use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pbsmon_client::PbsClient;
use pbsmon_collector::{
    now_unix, run_daemon, Collector, MonitorConfig, RetentionManager, SchedulerContext,
};
use pbsmon_core::{EntityKind, PassKind};
use pbsmon_store::{EntityFilter, HistoryQuery, RetentionHorizons, SortOrder, Store};
use pbsmon_store_sqlite::SqliteStore;

#[derive(Parser)]
#[command(name = "pbsmon", version)]
struct Cli {
    /// Path to the monitor config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or migrate the database and write a default config if absent
    Init,

    /// Run one collection pass (all kinds unless one is named)
    Collect {
        /// job, node, queue or utilization
        kind: Option<String>,
    },

    /// Show the latest system snapshot and recent pass outcomes
    Status,

    /// List current jobs
    Jobs {
        /// Filter to one state, e.g. R or Q
        #[arg(long)]
        state: Option<String>,
        /// Include finished jobs
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Show the recorded state transitions for one entity
    History {
        id: String,
        /// job, node or queue
        #[arg(long, default_value = "job")]
        kind: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// List collection events from the last N minutes
    Events {
        #[arg(long, default_value_t = 60)]
        window_mins: i64,
        /// Restrict to one pass kind
        #[arg(long)]
        kind: Option<String>,
    },

    /// Prune history, snapshot and event rows past the retention horizons
    Cleanup {
        #[arg(long)]
        history_days: Option<i64>,
        #[arg(long)]
        snapshot_days: Option<i64>,
    },

    /// Run the collection loop until interrupted
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(MonitorConfig::default_path);
    let config = MonitorConfig::load_or_default(&config_path)?;
    let db_path = config.database.db_path();

    match cli.cmd {
        Command::Init => {
            if !config_path.exists() {
                config.save_to(&config_path)?;
                println!("Wrote default config to {}", config_path.display());
            }
            let store = SqliteStore::migrate(&db_path)?;
            println!(
                "Database ready at {} (schema v{})",
                db_path.display(),
                store.schema_version()?
            );
        }
        Command::Collect { kind } => {
            let collector = open_collector(&config, &db_path)?;
            match kind.as_deref() {
                None => {
                    for k in EntityKind::ALL {
                        report(collector.collect(k, now_unix()).await?);
                    }
                    report(collector.collect_utilization(now_unix()).await?);
                }
                Some(s) => match PassKind::parse(s) {
                    Some(PassKind::Entities(k)) => {
                        report(collector.collect(k, now_unix()).await?)
                    }
                    Some(PassKind::Utilization) => {
                        report(collector.collect_utilization(now_unix()).await?)
                    }
                    None => bail!("unknown pass kind: {s}"),
                },
            }
        }
        Command::Status => {
            let store = open_store(&db_path)?;
            match store.latest_system_snapshot()? {
                None => println!("No utilization snapshot recorded yet"),
                Some((ts, s)) => {
                    println!("System at {ts}:");
                    println!(
                        "  jobs: {} total, {} running, {} queued, {} held",
                        s.total_jobs, s.running_jobs, s.queued_jobs, s.held_jobs
                    );
                    println!("  nodes: {} total, {} available", s.total_nodes, s.available_nodes);
                    match s.utilization_percent {
                        Some(pct) => println!(
                            "  cores: {}/{} in use ({pct:.1}%)",
                            s.used_cores, s.total_cores
                        ),
                        None => println!("  cores: {}/{} in use", s.used_cores, s.total_cores),
                    }
                }
            }
            let events = store.recent_events(None, now_unix(), 3600)?;
            println!("Passes in the last hour: {}", events.len());
            for e in events.iter().take(10) {
                println!(
                    "- {} at {} [{}] observed={} new={} changes={}",
                    e.kind.as_str(),
                    e.started_at,
                    e.outcome.as_str(),
                    e.counts.observed,
                    e.counts.new_entities,
                    e.counts.state_changes
                );
            }
        }
        Command::Jobs { state, all, limit } => {
            let store = open_store(&db_path)?;
            let filter = EntityFilter { state, include_final: all, limit: Some(limit) };
            let jobs = store.get_current(EntityKind::Job, &filter)?;
            for j in &jobs {
                let queue = j
                    .attrs
                    .get("queue")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-");
                println!("{} [{}] queue={} updated={}", j.id, j.state, queue, j.last_updated);
            }
            println!("{} job(s)", jobs.len());
        }
        Command::History { id, kind, limit } => {
            let kind = EntityKind::parse(&kind)
                .with_context(|| format!("unknown entity kind: {kind}"))?;
            let store = open_store(&db_path)?;
            let query = HistoryQuery {
                limit: Some(limit),
                order: SortOrder::Descending,
                ..HistoryQuery::for_entity(id)
            };
            for h in store.get_history(kind, &query)? {
                println!("{}  {}", h.timestamp, h.state);
            }
        }
        Command::Events { window_mins, kind } => {
            let pass = match kind.as_deref() {
                None => None,
                Some(s) => {
                    Some(PassKind::parse(s).with_context(|| format!("unknown pass kind: {s}"))?)
                }
            };
            let store = open_store(&db_path)?;
            for e in store.recent_events(pass, now_unix(), window_mins * 60)? {
                let error = e.error_message.as_deref().unwrap_or("");
                println!(
                    "{} {} [{}] observed={} rejected={} skipped={} {}",
                    e.started_at,
                    e.kind.as_str(),
                    e.outcome.as_str(),
                    e.counts.observed,
                    e.counts.finality_rejections,
                    e.counts.parse_errors,
                    error
                );
            }
        }
        Command::Cleanup { history_days, snapshot_days } => {
            let store = open_store(&db_path)?;
            let defaults = config.retention.horizons();
            let horizons = RetentionHorizons {
                history_days: history_days.unwrap_or(defaults.history_days),
                snapshot_days: snapshot_days.unwrap_or(defaults.snapshot_days),
            };
            let counts = store.cleanup(now_unix(), &horizons)?;
            println!(
                "Removed {} history, {} snapshot, {} event row(s); kept {} protected",
                counts.history_removed,
                counts.snapshots_removed,
                counts.events_removed,
                counts.protected_kept
            );
        }
        Command::Daemon => {
            let collector = open_collector(&config, &db_path)?;
            let scheduler = SchedulerContext::new(&config.collection);
            let retention = RetentionManager::new(config.retention.clone());

            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = stop_tx.send(true);
                }
            });
            run_daemon(collector, scheduler, retention, stop_rx).await?;
        }
    }

    Ok(())
}

fn open_store(db_path: &std::path::Path) -> anyhow::Result<SqliteStore> {
    SqliteStore::open(db_path)
        .with_context(|| format!("open database {}", db_path.display()))
}

fn open_collector(
    config: &MonitorConfig,
    db_path: &std::path::Path,
) -> anyhow::Result<Collector<PbsClient, SqliteStore>> {
    let store = open_store(db_path)?;
    let client = PbsClient::new(config.pbs.command_timeout_secs);
    Ok(Collector::new(client, store, config.policy.clone()))
}

fn report(event: pbsmon_core::CollectionEvent) {
    match event.error_message {
        Some(msg) => println!("{} pass failed: {msg}", event.kind.as_str()),
        None => println!(
            "{} pass {}: observed={} new={} changes={}",
            event.kind.as_str(),
            event.outcome.as_str(),
            event.counts.observed,
            event.counts.new_entities,
            event.counts.state_changes
        ),
    }
}
