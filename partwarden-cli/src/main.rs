//! Partwarden CLI
//!
//! Administrative front end for the partition lifecycle engine: one-time
//! conversions, index and foreign key rollout, manual detach/drop and the
//! scheduled maintenance run (`partwarden maintain` from cron or a job runner).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use partwarden::{
    connect, CalendarInterval, ColumnFamily, ConversionRequest, Ddl, EngineConfig, MayPostgresExecutor,
    PartitionManager, PartitionSettings, PartitionStateStore, PartitionStrategy, PgBackend, QualifiedName, RangeKey,
    SchemaExecutor,
};
use partwarden::state::DateConstraint;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "partwarden")]
#[command(about = "Range-partition lifecycle management for PostgreSQL")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Native,
    Inheritance,
}

impl From<StrategyArg> for PartitionStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Native => PartitionStrategy::Native,
            StrategyArg::Inheritance => PartitionStrategy::Inheritance,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configuration and detached-partition tables
    Init,

    /// Store maintenance settings for a table
    Configure {
        table: String,
        /// Leave the table out of `maintain` runs
        #[arg(long)]
        disabled: bool,
        /// Minimum number of free partitions (at least 3 are kept, plus 2)
        #[arg(long)]
        nr: Option<u32>,
        /// Detach partitions older than this interval (e.g. "3 months")
        #[arg(long)]
        detach: Option<String>,
        /// Drop detached partitions after this cool-down (at least 4 days)
        #[arg(long)]
        drop_detached: Option<String>,
        /// Pruning constraint marker
        #[arg(long, requires = "constraint_column")]
        constraint_marker: Option<String>,
        /// Date or timestamp column for pruning constraints
        #[arg(long, requires = "constraint_marker")]
        constraint_column: Option<String>,
    },

    /// Convert a plain table into a range-partitioned one
    Convert {
        table: String,
        /// Partitioning column
        #[arg(long)]
        column: String,
        /// Lower bound of the existing data
        #[arg(long)]
        start: String,
        /// Upper bound (exclusive) of the existing data
        #[arg(long)]
        end: String,
        /// Width of the first new partition ("1000000", "1 month")
        #[arg(long)]
        interval: String,
        #[arg(long, value_enum, default_value = "native")]
        strategy: StrategyArg,
        /// Always create a template table
        #[arg(long)]
        no_primary_key: bool,
        /// Move triggers from the original table to the new parent
        #[arg(long)]
        move_triggers: bool,
    },

    /// Create partitions until every range group has enough free ones
    Ensure {
        table: String,
        #[arg(long, default_value = "3")]
        min_free: usize,
    },

    /// Count free partitions
    Count {
        table: String,
        #[arg(long)]
        column: Option<String>,
        /// Column type override (integer, date, timestamp, timestamptz)
        #[arg(long = "type")]
        type_name: Option<String>,
        /// Range group number
        #[arg(long)]
        range_group: Option<u32>,
    },

    /// Print (or run) statements that index every partition
    Index {
        table: String,
        /// Index columns or expressions, e.g. "lower(email)" or "created_at DESC"
        #[arg(long, required = true, num_args = 1..)]
        columns: Vec<String>,
        #[arg(long, default_value = "btree")]
        method: String,
        #[arg(long)]
        unique: bool,
        /// Execute the statements instead of printing them
        #[arg(long)]
        execute: bool,
    },

    /// Print (or run) statements that add a foreign key to every partition
    ForeignKey {
        table: String,
        /// Constraint name
        #[arg(long)]
        name: String,
        /// Referenced table
        #[arg(long)]
        references: String,
        #[arg(long, required = true, num_args = 1..)]
        columns: Vec<String>,
        #[arg(long, required = true, num_args = 1..)]
        referenced_columns: Vec<String>,
        #[arg(long)]
        execute: bool,
    },

    /// Add pruning constraints on a date column of an integer-partitioned table
    Constrain {
        table: String,
        #[arg(long)]
        marker: String,
        #[arg(long)]
        column: String,
    },

    /// Detach a partition and record it for a later drop
    Detach {
        table: String,
        partition: String,
        /// Allow detaching a partition other than the oldest
        #[arg(long)]
        any: bool,
    },

    /// Drop a previously detached partition
    Drop { table: String, partition: String },

    /// Run grow, constrain, detach and drop for every configured table
    Maintain {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Write Prometheus metrics here after the run (textfile collector)
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(true) => process::exit(0),
        Ok(false) => {
            eprintln!("{} lock retries exhausted or run cancelled; nothing further was changed", "incomplete:".yellow());
            process::exit(2);
        }
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = EngineConfig::load().unwrap_or_else(|e| {
        log::warn!("using default engine settings: {e}");
        EngineConfig::default()
    });
    let database_url = cli
        .database_url
        .or_else(|| std::env::var("PARTWARDEN_DATABASE_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| config.database_url.clone());

    let client = connect(&database_url).context("connecting to database")?;
    let executor = MayPostgresExecutor::new(client);
    if !executor.check_health()? {
        bail!("database failed the health check");
    }
    let (config_table, detached_table) = config.state_tables()?;
    let backend = PgBackend::new(executor, config_table, detached_table);
    let manager = PartitionManager::new(&backend).with_retry_policy(config.retry_policy());

    match cli.command {
        Commands::Init => {
            backend.ensure_state_tables()?;
            println!("{} state tables ready", "ok".green());
            Ok(true)
        }
        Commands::Configure {
            table,
            disabled,
            nr,
            detach,
            drop_detached,
            constraint_marker,
            constraint_column,
        } => {
            let table = QualifiedName::parse(&table)?;
            let settings = PartitionSettings {
                auto_maintenance: !disabled,
                nr,
                date_constraint: constraint_marker
                    .zip(constraint_column)
                    .map(|(marker, constraint_column)| DateConstraint { marker, constraint_column }),
                detach: detach.as_deref().map(str::parse::<CalendarInterval>).transpose()?,
                drop_detached: drop_detached.as_deref().map(str::parse::<CalendarInterval>).transpose()?,
            };
            backend.save_configuration(&table, &settings)?;
            println!("{} {table}: {}", "configured".green(), settings.to_json()?);
            Ok(true)
        }
        Commands::Convert {
            table,
            column,
            start,
            end,
            interval,
            strategy,
            no_primary_key,
            move_triggers,
        } => {
            let request = ConversionRequest {
                table: QualifiedName::parse(&table)?,
                key_column: column,
                start,
                end,
                interval,
                strategy: strategy.into(),
                no_primary_key,
                move_triggers,
            };
            let converted = manager.convert_table(&request)?;
            if converted {
                println!("{} {table} is now partitioned", "converted".green());
            }
            Ok(converted)
        }
        Commands::Ensure { table, min_free } => {
            let table = QualifiedName::parse(&table)?;
            Ok(manager.ensure_free_partitions(&table, min_free)?)
        }
        Commands::Count {
            table,
            column,
            type_name,
            range_group,
        } => {
            let family = match type_name {
                Some(name) => match ColumnFamily::from_type_name(&name) {
                    Some(family) => Some(family),
                    None => bail!("unsupported column type {name}"),
                },
                None => None,
            };
            let table = QualifiedName::parse(&table)?;
            let free = manager.count_free_partitions(&table, column.as_deref(), family, range_group.map(RangeKey::Group))?;
            println!("{free}");
            Ok(true)
        }
        Commands::Index {
            table,
            columns,
            method,
            unique,
            execute,
        } => {
            let table = QualifiedName::parse(&table)?;
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            let statements = manager.partitioned_index_statements(&table, &columns, &method, unique)?;
            emit(&backend, &statements, execute)?;
            Ok(true)
        }
        Commands::ForeignKey {
            table,
            name,
            references,
            columns,
            referenced_columns,
            execute,
        } => {
            let table = QualifiedName::parse(&table)?;
            let references = QualifiedName::parse(&references)?;
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            let referenced: Vec<&str> = referenced_columns.iter().map(String::as_str).collect();
            let statements = manager.partitioned_foreign_key_statements(&table, &name, &references, &columns, &referenced)?;
            emit(&backend, &statements, execute)?;
            Ok(true)
        }
        Commands::Constrain { table, marker, column } => {
            let table = QualifiedName::parse(&table)?;
            let added = manager.add_pruning_constraints(&table, &marker, &column)?;
            println!("{} {added} constraint(s) on {table}", "added".green());
            Ok(true)
        }
        Commands::Detach { table, partition, any } => {
            let table = QualifiedName::parse(&table)?;
            Ok(manager.detach_partition(&table, &partition, !any)?)
        }
        Commands::Drop { table, partition } => {
            let table = QualifiedName::parse(&table)?;
            Ok(manager.drop_detached_partition(&table, &partition)?)
        }
        Commands::Maintain { json, metrics_file } => {
            let manager = manager.with_cancel_token(config.cancel_token());
            let report = manager.run_maintenance()?;
            if let Some(path) = metrics_file {
                let text = partwarden::metrics::METRICS.render()?;
                std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} tables, {} grown, {} constraint(s), {} detached, {} dropped",
                    report.tables,
                    report.grown.len(),
                    report.constraints_added,
                    report.detached.len(),
                    report.dropped.len()
                );
                for failure in &report.failures {
                    println!("  {} {} [{}]: {}", "failed".red(), failure.table, failure.pass, failure.reason);
                }
            }
            if !report.failures.is_empty() {
                bail!("{} maintenance failure(s)", report.failures.len());
            }
            Ok(!report.cancelled)
        }
    }
}

/// Print statements, or run them one by one.
fn emit(backend: &dyn SchemaExecutor, statements: &[Ddl], execute: bool) -> anyhow::Result<()> {
    for statement in statements {
        if execute {
            log::info!("{statement}");
            backend
                .execute(statement)
                .with_context(|| format!("executing {statement}"))?;
        } else {
            println!("{statement};");
        }
    }
    Ok(())
}
