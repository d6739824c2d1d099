//! # Report Harness CLI (`rpt`)
//!
//! ## Usage
//!
//! ```bash
//! rpt --config ./config/rpt.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rpt init` | Create the SQLite catalog database |
//! | `rpt load <catalog.toml>` | Upsert sources, reports, and schedules from a TOML catalog |
//! | `rpt sources` | List data sources and whether they look reachable |
//! | `rpt run <report-id>` | Execute a saved report and print JSON |
//! | `rpt query --source <id> ...` | Execute an ad-hoc retrieval + projection |
//! | `rpt schedules [--next N]` | List schedules with their next fire times |
//! | `rpt serve` | Start the HTTP server and the scheduler |
//!
//! ## Examples
//!
//! ```bash
//! rpt init
//! rpt load ./catalog.toml
//! rpt run sales-by-region
//! rpt query --source warehouse --sql "SELECT region, amount FROM orders" \
//!     --group-by region --agg amount=sum
//! rpt serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use report_harness::report_cmd::QueryOptions;
use report_harness::{catalog, config, migrate, report_cmd, schedule_cmd, server, sources};

/// Report Harness: report execution, connection pooling, and cron
/// scheduling for a reporting dashboard.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "rpt",
    about = "Report Harness: run reports over databases and files, on demand or on a schedule",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rpt.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Load a TOML catalog of sources, reports, and schedules.
    ///
    /// Entries are upserted by id. Editing a source bumps its modification
    /// time, so the next run uses a fresh connection pool.
    Load {
        /// Path to the catalog file.
        catalog: PathBuf,
    },

    /// List data sources and their health.
    Sources,

    /// Execute a saved report and print the result as JSON.
    Run {
        /// Report id.
        report: String,
    },

    /// Execute an ad-hoc query against a data source.
    Query {
        /// Data source id.
        #[arg(long)]
        source: String,

        /// Literal SQL for relational sources.
        #[arg(long)]
        sql: Option<String>,

        /// Sheet name for spreadsheet sources.
        #[arg(long)]
        sheet: Option<String>,

        /// Columns to keep, comma-separated, in output order.
        #[arg(long, value_delimiter = ',')]
        select: Vec<String>,

        /// Dimension column for aggregation.
        #[arg(long)]
        group_by: Option<String>,

        /// Aggregate as `column=op` (SUM, AVG, COUNT, MIN, MAX, NONE).
        #[arg(long = "agg", value_parser = parse_key_val)]
        aggregates: Vec<(String, String)>,
    },

    /// List schedules with their next fire time.
    Schedules {
        /// How many upcoming fire times to show per schedule.
        #[arg(long, default_value_t = 1)]
        next: usize,
    },

    /// Start the HTTP server and the scheduler.
    ///
    /// Binds to `[server].bind`. Ctrl-C stops the scheduler and releases
    /// all pooled connections.
    Serve,
}

/// Parse a `key=value` pair for `--agg` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg.logging.filter);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Load { catalog: path } => {
            catalog::run_load(&cfg, &path).await?;
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Run { report } => {
            report_cmd::run_report(&cfg, &report).await?;
        }
        Commands::Query {
            source,
            sql,
            sheet,
            select,
            group_by,
            aggregates,
        } => {
            let options = QueryOptions {
                source,
                sql,
                sheet,
                select,
                group_by,
                aggregates,
            };
            report_cmd::run_query(&cfg, &options).await?;
        }
        Commands::Schedules { next } => {
            schedule_cmd::list_schedules(&cfg, next).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
