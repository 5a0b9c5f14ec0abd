//! tandem - blue/green database cutover engine
//!
//! Validates configuration files and runs a full cutover simulation between
//! two in-memory databases under live synthetic write load.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tandem::clock::{SharedClock, SystemClock};
use tandem::config::TandemConfig;
use tandem::metrics::MetricsServer;
use tandem::migration::{
    ConsistencyVerifier, CutoverSnapshot, CutoverState, CutoverStateMachine, CutoverStateStore,
    MemorySchemaStore, SchemaMigration, StaticRouter, TrafficRouter,
};
use tandem::replication::{row, DatabaseError, MemoryDatabase, Side, SyncEngine};

/// tandem - zero-downtime blue/green database cutover
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (TOML)
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        env = "TANDEM_CONFIG",
        global = true
    )]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "TANDEM_LOG_LEVEL",
        global = true
    )]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate a configuration file
    CheckConfig,

    /// Print the default configuration as TOML
    DefaultConfig,

    /// Run a full cutover between two in-memory databases
    Simulate {
        /// Rows seeded per table on blue before sync starts
        #[arg(long, default_value = "1000")]
        rows: u64,

        /// Concurrent application writers
        #[arg(long, default_value = "4")]
        writers: usize,

        /// Delay between writes of one writer (milliseconds)
        #[arg(long, default_value = "5")]
        write_interval_ms: u64,

        /// Also write to green while blue serves, producing conflicts
        #[arg(long)]
        conflicts: bool,

        /// Give up and abort after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => TandemConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TandemConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    match cli.command {
        Commands::CheckConfig => check_config(&cli.config, &config),
        Commands::DefaultConfig => {
            print!("{}", TandemConfig::default().to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Simulate {
            rows,
            writers,
            write_interval_ms,
            conflicts,
            timeout_secs,
        } => {
            tandem::telemetry::init_logging(&config.logging)?;
            let options = SimulationOptions {
                rows,
                writers,
                write_interval: Duration::from_millis(write_interval_ms),
                conflicts,
                timeout: Duration::from_secs(timeout_secs),
            };
            simulate(config, options).await
        }
    }
}

fn check_config(path: &Option<PathBuf>, config: &TandemConfig) -> anyhow::Result<ExitCode> {
    let source = path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    match config.validate() {
        Ok(()) => {
            println!("{} {}", "✓".green().bold(), source);
            println!("  tables:          {}", config.tables.join(", "));
            println!("  lag threshold:   {:.3}s", config.cutover.lag_threshold_secs);
            println!("  grace period:    {}ms", config.cutover.grace_period_ms);
            println!("  drain timeout:   {}ms", config.cutover.drain_timeout_ms);
            println!(
                "  clean runs:      {} (retry budget {})",
                config.verify.clean_runs_required, config.verify.retry_budget
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{} {}: {}", "✗".red().bold(), source, e);
            Ok(ExitCode::FAILURE)
        }
    }
}

struct SimulationOptions {
    rows: u64,
    writers: usize,
    write_interval: Duration,
    conflicts: bool,
    timeout: Duration,
}

async fn simulate(config: TandemConfig, options: SimulationOptions) -> anyhow::Result<ExitCode> {
    config.validate()?;
    let clock: SharedClock = Arc::new(SystemClock);
    let blue = Arc::new(MemoryDatabase::new(Side::Blue, clock.clone()));
    let green = Arc::new(MemoryDatabase::new(Side::Green, clock.clone()));

    for table in &config.tables {
        for id in 0..options.rows {
            blue.upsert(table, id as i64, row([("id", id as i64), ("version", 0i64)]))?;
        }
    }
    info!(rows = options.rows, tables = config.tables.len(), "blue seeded");

    let engine = Arc::new(SyncEngine::new(
        blue.clone(),
        green.clone(),
        &config.sync,
        clock.clone(),
    ));
    let router = Arc::new(StaticRouter::default());
    let id = uuid::Uuid::new_v4().to_string();
    let migrations = config
        .tables
        .iter()
        .enumerate()
        .map(|(i, table)| {
            SchemaMigration::new(
                i as u64 + 1,
                format!("create {}", table),
                format!("CREATE TABLE {} (id BIGINT PRIMARY KEY, version BIGINT)", table),
                format!("DROP TABLE {}", table),
            )
        })
        .collect();

    let mut machine = CutoverStateMachine::new(
        id.clone(),
        &config,
        engine.clone(),
        Arc::new(MemorySchemaStore::new()),
        router.clone(),
        clock.clone(),
    )
    .with_migrations(migrations);
    if let Some(dir) = &config.state.data_dir {
        machine = machine.with_state_store(CutoverStateStore::new(dir, &id));
    }
    let machine = Arc::new(machine);

    if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .address()
            .parse()
            .context("parsing metrics address")?;
        let status_machine = machine.clone();
        let server = MetricsServer::new(addr)?.with_status(Arc::new(move || {
            serde_json::to_string_pretty(&status_machine.snapshot()).unwrap_or_default()
        }));
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!(error = %e, "metrics server stopped");
            }
        });
    }

    let stop_writers = Arc::new(AtomicBool::new(false));
    let written = Arc::new(AtomicU64::new(0));
    let mut writer_tasks = Vec::new();
    for writer in 0..options.writers {
        let blue = blue.clone();
        let green = green.clone();
        let router = router.clone();
        let tables = config.tables.clone();
        let stop = stop_writers.clone();
        let written = written.clone();
        let interval = options.write_interval;
        let rows = options.rows.max(1);
        let conflicts = options.conflicts && writer == 0;
        writer_tasks.push(tokio::spawn(async move {
            let mut version = 1i64;
            while !stop.load(Ordering::Relaxed) {
                let (table, key) = {
                    let mut rng = rand::thread_rng();
                    let table = &tables[rng.gen_range(0..tables.len())];
                    (table.clone(), rng.gen_range(0..rows) as i64)
                };
                let side = if conflicts && version % 2 == 0 {
                    Side::Green
                } else {
                    router.active_side()
                };
                let db = match side {
                    Side::Blue => &blue,
                    Side::Green => &green,
                };
                match db.upsert(&table, key, row([("id", key), ("version", version)])) {
                    Ok(_) => {
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(DatabaseError::WritesFrozen(_)) => {}
                    Err(e) => warn!(error = %e, "synthetic write failed"),
                }
                version += 1;
                tokio::time::sleep(interval).await;
            }
        }));
    }

    let compactor = {
        let blue = blue.clone();
        let green = green.clone();
        let tables = config.tables.clone();
        let stop = stop_writers.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            while !stop.load(Ordering::Relaxed) {
                ticker.tick().await;
                let blue_horizon = blue.compact_history(&green, &tables);
                let green_horizon = green.compact_history(&blue, &tables);
                debug!(blue_horizon, green_horizon, "compacted change logs");
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let machine = machine.clone();
        tokio::spawn(async move { machine.run(shutdown_rx).await })
    };
    machine.request_cutover().await.ok();

    let outcome = tokio::select! {
        result = runner => result.context("cutover task panicked")?,
        _ = tokio::time::sleep(options.timeout) => {
            warn!("simulation timed out");
            let _ = shutdown_tx.send(true);
            Ok(machine.state())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            let _ = shutdown_tx.send(true);
            Ok(machine.state())
        }
    };

    let mut state = match outcome {
        Ok(state) => state,
        Err(e) => {
            eprintln!("{} {}", "cutover error:".red().bold(), e);
            machine.state()
        }
    };
    if state.can_abort() {
        machine.abort("simulation ended before switch").await?;
        state = machine.state();
    }

    // Let the last writes land on green before stopping.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop_writers.store(true, Ordering::Relaxed);
    for task in writer_tasks {
        let _ = task.await;
    }
    compactor.abort();
    if state == CutoverState::Switched {
        machine.confirm_decommission().await?;
    } else {
        engine.stop_all().await;
    }

    let verifier = ConsistencyVerifier::new(config.verify.page_size, clock);
    let reports = verifier
        .verify(blue.as_ref(), green.as_ref(), &config.tables)
        .await?;

    print_summary(
        &machine.snapshot(),
        written.load(Ordering::Relaxed),
        engine.conflicts().len(),
    );
    println!("{}", "Final Consistency".bold().underline());
    for (table, report) in &reports {
        let mark = if report.is_clean() {
            "✓".green()
        } else {
            "✗".yellow()
        };
        println!(
            "  {} {:<12} blue {:>6} rows, green {:>6} rows, {} mismatched",
            mark,
            table,
            report.blue_rows,
            report.green_rows,
            report.mismatch_count()
        );
    }

    Ok(if state == CutoverState::Switched {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(snapshot: &CutoverSnapshot, written: u64, conflicts: usize) {
    let state = match snapshot.state {
        CutoverState::Switched => snapshot.state.to_string().green().bold(),
        CutoverState::RolledBack => snapshot.state.to_string().yellow().bold(),
        _ => snapshot.state.to_string().red().bold(),
    };
    println!();
    println!("{}", "Cutover Summary".bold().underline());
    println!("  Attempt:      {}", snapshot.id);
    println!("  State:        {}", state);
    println!("  Serving:      {}", snapshot.serving);
    println!("  Write pause:  {}ms", snapshot.write_pause_ms);
    println!("  Writes:       {}", written);
    println!("  Conflicts:    {}", conflicts);
    if let Some(err) = &snapshot.last_error {
        println!("  Last error:   {}", err.yellow());
    }
    println!();
    println!("{}", "Transitions".bold().underline());
    for t in &snapshot.history {
        println!(
            "  {} {} {} {}  {}",
            t.at.format("%H:%M:%S%.3f").to_string().dimmed(),
            t.from,
            "→".cyan().bold(),
            t.to,
            t.reason.dimmed()
        );
    }
    println!();
}
