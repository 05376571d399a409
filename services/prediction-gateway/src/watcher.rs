//! Re-run a registry refresh when the model directory changes.

use anyhow::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::ModelRegistry;

/// Events closer together than this collapse into one refresh.
const DEBOUNCE: Duration = Duration::from_millis(250);

pub fn spawn_model_watcher(registry: Arc<ModelRegistry>, dir: PathBuf, budget_bytes: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = watch_loop(registry, dir, budget_bytes).await {
            tracing::warn!(error=?e, "model watch loop exited");
        }
    })
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}

async fn watch_loop(registry: Arc<ModelRegistry>, dir: PathBuf, budget_bytes: u64) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let mut watcher = RecommendedWatcher::new(move |res| { let _ = tx.blocking_send(res); }, notify::Config::default())?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::info!(dir=%dir.display(), "watching model directory");

    while let Some(evt) = rx.recv().await {
        match evt {
            Ok(ev) if is_relevant(&ev.kind) => {}
            Ok(_) => continue,
            Err(e) => { tracing::warn!(error=?e, "watch error"); continue; }
        }
        tokio::time::sleep(DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        let reg = registry.clone();
        let d = dir.clone();
        match tokio::task::spawn_blocking(move || reg.refresh(&d, budget_bytes)).await {
            Ok(Ok(models)) => tracing::info!(models = models.len(), "model directory changed, registry refreshed"),
            Ok(Err(e)) => tracing::warn!(error=%e, "refresh after directory change failed"),
            Err(e) => tracing::error!(error=?e, "refresh task panicked"),
        }
    }
    Ok(())
}
