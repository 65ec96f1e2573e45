use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};

use pewpew_scheduler::config::{LoggingConfig, SchedulerConfig};
use pewpew_scheduler::scheduler::{ApiResponse, AuthUser, ScheduleRequest, SharedState};

#[derive(Parser)]
#[command(
    name = "pewpew-scheduler",
    about = "Test scheduler control plane for pewpew load tests",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file [default: $PEWPEW_SCHEDULER_CONFIG, then
    /// /etc/pewpew-scheduler/scheduler.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (dispatch tick + historical janitor)
    Serve,

    /// Manage scheduled tests
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Maintain the historical calendar
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Print calendar events (scheduled and historical) as JSON
    Calendar,

    /// List test ids scheduled against a pewpew version
    Versions {
        /// Test runner version
        #[arg(long)]
        version: String,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all scheduled tests
    List,

    /// Schedule a test from a JSON request file
    Add {
        /// JSON ScheduleRequest
        #[arg(long)]
        request: PathBuf,

        /// User recorded as the scheduler of the test
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Remove a scheduled test
    Remove {
        /// Test id
        #[arg(long)]
        test_id: String,

        /// Also delete the uploaded test files
        #[arg(long)]
        delete_files: bool,

        /// User performing the removal
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Run one dispatch pass now
    Tick,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Merge finished runs into the history map and save it
    Search,

    /// Delete historical events older than N days
    Prune {
        /// Retention in days (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,
    },
}

/// Resolve the config with a stderr subscriber installed, so lookups and
/// fallbacks are reported before the configured logger exists.
fn resolve_config(explicit: Option<&Path>) -> Result<SchedulerConfig> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || SchedulerConfig::resolve(explicit))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn format_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_response(response: &ApiResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&response.json)?);
    if response.status >= 400 {
        anyhow::bail!("request failed with status {}", response.status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    let build = || pewpew_scheduler::build_service(&config, SharedState::default());

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting pewpew-scheduler daemon");
            pewpew_scheduler::serve(config.clone()).await?;
        }
        Commands::Schedule { action } => {
            let service = build()?;
            match action {
                ScheduleAction::List => {
                    let items = service.scheduled_items().await?;
                    if items.is_empty() {
                        println!("No scheduled tests found.");
                    } else {
                        println!(
                            "{:<36} | {:<24} | {:<22} | {:<10} | Recurring",
                            "Test Id", "Yaml", "Next Start", "Queue"
                        );
                        println!("{:-<36}-|-{:-<24}-|-{:-<22}-|-{:-<10}-|-{:-<9}", "", "", "", "", "");
                        for item in items {
                            println!(
                                "{:<36} | {:<24} | {:<22} | {:<10} | {}",
                                item.test_id(),
                                item.test_message.yaml_file,
                                format_ms(item.next_start),
                                item.queue_name,
                                !item.schedule.is_one_off()
                            );
                        }
                    }
                }
                ScheduleAction::Add { request, user } => {
                    let body = std::fs::read_to_string(&request)
                        .with_context(|| format!("failed to read request file: {}", request.display()))?;
                    let request: ScheduleRequest =
                        serde_json::from_str(&body).context("request file is not a valid ScheduleRequest")?;
                    let response = service.add_test(request, &AuthUser { user_id: user }).await;
                    print_response(&response)?;
                }
                ScheduleAction::Remove { test_id, delete_files, user } => {
                    let response = service
                        .remove_test(&test_id, &AuthUser { user_id: user }, delete_files)
                        .await;
                    print_response(&response)?;
                }
                ScheduleAction::Tick => {
                    let started = service.start_scheduled_tests().await?;
                    if started.is_empty() {
                        println!("No tests were due.");
                    }
                    for data in started {
                        println!("Started {} on {} ({})", data.test_id, data.queue_name, data.yaml_file);
                    }
                }
            }
        }
        Commands::History { action } => {
            let service = build()?;
            match action {
                HistoryAction::Search => {
                    let merged = service.history().run_historical_search().await?;
                    let saved = service.history().save_historical().await?;
                    println!("Merged {merged} finished test(s); saved: {saved}");
                }
                HistoryAction::Prune { days } => {
                    let days = days.unwrap_or(service.history().retention_days());
                    let removed = service.history().run_historical_delete(days).await?;
                    println!("Removed {removed} historical event(s) older than {days} day(s).");
                }
            }
        }
        Commands::Calendar => {
            let service = build()?;
            let events = service.get_calendar_events().await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Commands::Versions { version } => {
            let service = build()?;
            let ids = service.get_test_ids_for_pewpew_version(&version).await?;
            if ids.is_empty() {
                println!("No scheduled tests use pewpew {version}.");
            }
            for id in ids {
                println!("{id}");
            }
        }
    }

    Ok(())
}
