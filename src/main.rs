use appdata_cleaner_lib::file_cleaner::{CategorizedScan, CleanerStats, DEFAULT_GENERAL_CLEAN};
use appdata_cleaner_lib::{CleanerEngine, KeepStrategy, OperationTracker, PathCatalog, Settings};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "appdata-cleaner", version, about = "Safety-first cleanup of Windows user profiles")]
struct Cli {
    /// Settings file (defaults to ~/.appdata_cleaner/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan one category and print the categorized result
    Scan {
        #[arg(value_enum)]
        category: ScanKind,
        /// Print a statistics summary instead of the full file list
        #[arg(long)]
        summary: bool,
    },
    /// Scan one category, then clean its default selection
    Clean {
        #[arg(value_enum)]
        category: ScanKind,
        /// Labels to clean instead of the category defaults
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Report duplicates under the given paths, optionally removing extra copies
    Duplicates {
        paths: Vec<PathBuf>,
        #[arg(long)]
        remove: bool,
        /// newest, oldest, shortest_path or longest_path
        #[arg(long)]
        keep: Option<String>,
        #[arg(long)]
        no_backup: bool,
    },
    /// Trim browser history
    History {
        #[arg(long)]
        days: Option<u32>,
        #[arg(long = "browser")]
        browsers: Vec<String>,
    },
    /// Manage backups
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScanKind {
    General,
    Appdata,
    Temp,
    Browser,
    Logs,
}

#[derive(Debug, Subcommand)]
enum BackupAction {
    List,
    Restore {
        path: PathBuf,
        /// Restore to the recorded original paths instead of the staging directory
        #[arg(long)]
        original: bool,
    },
    Delete {
        path: PathBuf,
    },
    Cleanup,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env).try_init();
}

fn print_json<T: Serialize>(value: &T) -> appdata_cleaner_lib::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn scan(engine: &CleanerEngine, kind: ScanKind) -> appdata_cleaner_lib::Result<CategorizedScan> {
    match kind {
        ScanKind::General => engine.scan_general().await,
        ScanKind::Appdata => engine.scan_appdata(None).await,
        ScanKind::Temp => engine.scan_temp().await,
        ScanKind::Browser => engine.scan_browser_cache(None).await,
        ScanKind::Logs => engine.scan_logs().await,
    }
}

async fn run(cli: Cli) -> appdata_cleaner_lib::Result<()> {
    let config_path = cli.config.unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load_or_default(&config_path);
    if let Command::Clean { dry_run: true, .. } = cli.command {
        settings.dry_run = true;
    }
    let stats_path = settings.backup_path.with_file_name("telemetry.json");
    let engine = CleanerEngine::new(settings, PathCatalog::from_env(), OperationTracker::new())?
        .with_stats(CleanerStats::persisted_at(stats_path));

    match cli.command {
        Command::Scan { category, summary } => {
            let result = scan(&engine, category).await?;
            if summary {
                print_json(&engine.statistics(&result))
            } else {
                print_json(&result)
            }
        }
        Command::Clean {
            category,
            labels,
            no_backup,
            ..
        } => {
            let result = scan(&engine, category).await?;
            let chosen: Vec<&str> = labels.iter().map(String::as_str).collect();
            let chosen = (!chosen.is_empty()).then_some(chosen.as_slice());
            let backup = !no_backup;
            let cleaned = match category {
                ScanKind::Temp => engine.clean_temp(&result, chosen, backup).await?,
                ScanKind::Logs => engine.clean_logs(&result, chosen, backup).await?,
                ScanKind::Appdata => engine.clean_appdata(&result, backup).await?,
                ScanKind::Browser => engine.clean_browser_cache(&result, backup).await?,
                ScanKind::General => {
                    engine
                        .clean_categories(&result, chosen.unwrap_or(&DEFAULT_GENERAL_CLEAN), backup)
                        .await?
                }
            };
            print_json(&cleaned)
        }
        Command::Duplicates {
            paths,
            remove,
            keep,
            no_backup,
        } => {
            let result = engine.scan_duplicates(&paths).await?;
            if !remove {
                return print_json(&result.report());
            }
            let strategy = KeepStrategy::parse(keep.as_deref().unwrap_or(&engine.settings().keep_strategy));
            let cleaned = engine
                .remove_duplicates(&result.groups, strategy, !no_backup)
                .await?;
            print_json(&cleaned)
        }
        Command::History { days, browsers } => {
            let days = days.unwrap_or(engine.settings().history_days_to_keep);
            let filter = (!browsers.is_empty()).then_some(browsers.as_slice());
            let result = engine.clean_browser_history(filter, days).await?;
            print_json(&result)
        }
        Command::Backups { action } => match action {
            BackupAction::List => print_json(&engine.list_backups()),
            BackupAction::Restore { path, original } => {
                print_json(&engine.restore_backup(&path, original)?)
            }
            BackupAction::Delete { path } => {
                engine.delete_backup(&path)?;
                print_json(&serde_json::json!({ "deleted": path }))
            }
            BackupAction::Cleanup => {
                let removed = engine.cleanup_backups();
                print_json(&serde_json::json!({ "removed": removed }))
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
