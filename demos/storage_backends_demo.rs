use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use env_logger::Env;
use log::{info, warn};
use tokio::sync::broadcast::error::TryRecvError;
use ssi_tracker::income::format_currency;
use ssi_tracker::storage::key_value::FileKeyValueStore;
use ssi_tracker::{
    BackendRegistry, ManagerSettings, NewIncome, StorageEvent, StorageManager, StorageType,
};

#[tokio::main]
async fn main() {
    // Initialize logger (RUST_LOG can override; default to info)
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();

    // Output directory for the key-value file
    let out_dir: PathBuf = env::var("SSI_DEMO_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            env::current_dir()
                .expect("cwd")
                .join("target")
                .join("storage_demo")
        });
    fs::create_dir_all(&out_dir).expect("create output dir");

    let kv = Arc::new(
        FileKeyValueStore::new(out_dir.join("local-storage.json")).expect("open kv store"),
    );
    // Remote backends are served in-process so the demo runs offline.
    let registry = BackendRegistry::in_process(kv.clone())
        .await
        .expect("build registry");
    let manager = StorageManager::new(registry, kv, ManagerSettings::default())
        .expect("create manager");
    let mut events = manager.subscribe_events();

    manager.set_user_id(Some("demo-user"));
    let thresholds = manager.thresholds();

    for backend in StorageType::ALL {
        info!("=== {} ===", backend.label());
        if !manager.set_backend(backend.as_str()).await {
            warn!("Could not switch to {}", backend);
            continue;
        }
        manager.clear_storage().await;

        let inputs = [
            NewIncome::job(500.0, "2024-03-01").with_description("Weekend shifts"),
            NewIncome::job(1200.0, "2024-02-01"),
            NewIncome::fixed_benefit("2024-03-01"),
        ];
        for input in inputs {
            let entry = input.into_entry(&thresholds).expect("valid entry");
            manager.add_entry(entry).await;
        }
        manager.load_from_storage().await;

        for entry in manager.entries() {
            info!(
                "{} {:<10} {:>10} {}",
                entry.date,
                entry.kind.label(),
                format_currency(entry.amount),
                entry.description
            );
        }
        let summary = manager.summary();
        info!(
            "job total {} / remaining {} / {:.0}% ({:?})",
            format_currency(summary.job_total),
            format_currency(summary.remaining_allowed),
            summary.progress_percent,
            summary.level
        );
    }

    // Pushes from another device only reach the realtime backend.
    manager.set_backend(StorageType::RealtimeSync.as_str()).await;
    if let Some(realtime) = manager.registry().realtime() {
        use ssi_tracker::Storage;
        let remote = NewIncome::job(42.0, "2024-03-15")
            .with_description("Entered on phone")
            .into_entry(&thresholds)
            .expect("valid entry");
        realtime
            .add(&remote, Some("demo-user"))
            .await
            .expect("remote write");
        info!("Working set after remote write: {} entries", manager.entries().len());
    }

    loop {
        match events.try_recv() {
            Ok(StorageEvent::Notification { level, message }) => info!("[{}] {}", level, message),
            Ok(_) => {}
            Err(TryRecvError::Lagged(n)) => warn!("{} older events dropped", n),
            Err(_) => break,
        }
    }

    manager.detach_listeners().await;
    info!("Demo complete. Key-value file at {}", out_dir.display());
}
