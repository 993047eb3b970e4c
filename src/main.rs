use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::broadcast;

use ssi_tracker::configuration::{Config, ConfigOverrides};
use ssi_tracker::income::format_currency;
use ssi_tracker::storage::key_value::FileKeyValueStore;
use ssi_tracker::storage_manager::NotificationLevel;
use ssi_tracker::{
    BackendRegistry, IncomeType, ManagerSettings, NewIncome, StorageEvent, StorageManager,
    StorageType, TrackerError,
};

#[derive(Parser)]
#[command(name = "ssi-tracker")]
#[command(version)]
#[command(about = "Track job income against the SSI eligibility limit")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SSI_CONFIG")]
    config: Option<PathBuf>,

    /// Signed-in user id; omit to use unscoped data
    #[arg(short, long, env = "SSI_USER")]
    user: Option<String>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record an income entry
    Add {
        /// `job` or `ssi`
        #[arg(long, default_value = "job")]
        kind: IncomeType,
        /// Amount in dollars; ignored for `ssi` entries
        #[arg(long)]
        amount: Option<f64>,
        /// Date as YYYY-MM-DD
        #[arg(long)]
        date: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete an entry by id
    Delete { id: String },
    /// List entries, newest first
    List,
    /// Show totals against the income limit
    Summary,
    /// Delete every entry of the current user
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Show the active backend, or switch to another one
    Backend { name: Option<String> },
    /// Probe the realtime database connection
    Check,
    /// Print live updates until interrupted
    Watch,
}

fn print_event(event: &StorageEvent) {
    match event {
        StorageEvent::Notification { level, message } => match level {
            NotificationLevel::Error => eprintln!("[{}] {}", level, message),
            _ => println!("[{}] {}", level, message),
        },
        StorageEvent::Refreshed { backend, entries } => {
            info!("{} now holds {} entr(ies)", backend, entries.len())
        }
    }
}

fn drain_events(rx: &mut broadcast::Receiver<StorageEvent>) {
    loop {
        match rx.try_recv() {
            Ok(event) => print_event(&event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                error!("Skipped {} storage events", n)
            }
            Err(_) => break,
        }
    }
}

fn print_entries(manager: &StorageManager) {
    let entries = manager.entries();
    if entries.is_empty() {
        println!("No income entries.");
        return;
    }
    for entry in entries {
        println!(
            "{}  {:<10}  {:>12}  {}  ({})",
            entry.date,
            entry.kind.label(),
            format_currency(entry.amount),
            entry.description,
            entry.id
        );
    }
}

fn print_summary(manager: &StorageManager) {
    let summary = manager.summary();
    println!("SSI income:        {}", format_currency(summary.fixed_benefit_total));
    println!("Job income:        {}", format_currency(summary.job_total));
    println!("Remaining allowed: {}", format_currency(summary.remaining_allowed));
    println!(
        "Limit progress:    {:.1}% of {} ({:?})",
        summary.progress_percent,
        format_currency(summary.income_limit),
        summary.level
    );
    for segment in summary.chart_segments() {
        println!(
            "  {:<18} {:>12} {:>4}%",
            segment.label,
            format_currency(segment.amount),
            segment.percent
        );
    }
}

async fn watch(manager: &StorageManager, rx: &mut broadcast::Receiver<StorageEvent>) -> bool {
    if !manager.load_from_storage().await {
        return false;
    }
    drain_events(rx);
    print_entries(manager);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event @ StorageEvent::Refreshed { .. }) => {
                    print_event(&event);
                    print_entries(manager);
                }
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    error!("Skipped {} storage events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, detaching listeners");
                break;
            }
        }
    }
    manager.detach_listeners().await;
    true
}

async fn run(args: Args) -> Result<bool, TrackerError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_overrides(&args.overrides)?;
    config.ensure_data_dir()?;
    info!("Configuration imported successfully");

    let kv = Arc::new(FileKeyValueStore::new(config.key_value_path())?);
    let registry = BackendRegistry::from_config(&config, kv.clone()).await?;
    let settings = ManagerSettings {
        thresholds: config.thresholds(),
        default_backend: config.default_backend_type()?,
    };
    let manager = StorageManager::new(registry, kv, settings)?;
    manager.set_user_id(args.user.as_deref());
    let mut rx = manager.subscribe_events();

    let ok = match args.command {
        Command::Add {
            kind,
            amount,
            date,
            description,
        } => {
            let input = NewIncome {
                kind,
                amount,
                date,
                description,
            };
            let entry = input.into_entry(&manager.thresholds())?;
            let id = entry.id.clone();
            let ok = manager.load_from_storage().await && manager.add_entry(entry).await;
            if ok {
                println!("Added entry {}", id);
            }
            ok
        }
        Command::Delete { id } => {
            manager.load_from_storage().await && manager.delete_entry(&id).await
        }
        Command::List => {
            let ok = manager.load_from_storage().await;
            if ok {
                print_entries(&manager);
            }
            ok
        }
        Command::Summary => {
            let ok = manager.load_from_storage().await;
            if ok {
                print_summary(&manager);
            }
            ok
        }
        Command::Clear { yes } => {
            if !yes {
                return Err(TrackerError::InvalidInput(
                    "refusing to clear without --yes".to_string(),
                ));
            }
            manager.clear_storage().await
        }
        Command::Backend { name: None } => {
            println!("Active backend: {}", manager.current_backend());
            let available: Vec<&str> = manager
                .registry()
                .kinds()
                .into_iter()
                .map(|k: StorageType| k.as_str())
                .collect();
            println!("Available: {}", available.join(", "));
            true
        }
        Command::Backend { name: Some(name) } => manager.set_backend(&name).await,
        Command::Check => {
            let realtime = manager.registry().realtime().ok_or_else(|| {
                TrackerError::OperationFailed("realtime backend is not configured".to_string())
            })?;
            realtime.test_connection().await?;
            println!("Realtime database connection OK");
            if let Some(uid) = manager.current_user_id() {
                realtime.test_user_path(&uid).await?;
                println!("User data path OK for {}", uid);
            }
            true
        }
        Command::Watch => watch(&manager, &mut rx).await,
    };
    drain_events(&mut rx);
    manager.detach_listeners().await;
    Ok(ok)
}

#[tokio::main]
async fn main() {
    // https://docs.rs/env_logger/latest/env_logger/
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
