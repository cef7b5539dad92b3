//! Filesystem listener: turns change events into backup jobs.

use super::watch::{DirectoryWatcher, FsEvent, WatchInterest, WatchRegistry};
use super::{BackupJob, BackupQueue};
use crate::model::{BackupType, ConfigBackup, ConfigBackupOptions};
use crate::snapshot::extract::{extract_multiple, extract_single};
use crate::snapshot::extract_directory_entry;
use crate::utils::{HistoryError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the listener task. It ends when the event channel closes (the
/// registry's watcher was dropped) or when `stop` fires. Events already
/// delivered are handled before stopping.
pub fn spawn_listener<W>(
    events: mpsc::UnboundedReceiver<FsEvent>,
    registry: Arc<Mutex<WatchRegistry<W>>>,
    queue: BackupQueue,
    config_dir: PathBuf,
    stop: oneshot::Receiver<()>,
) -> JoinHandle<()>
where
    W: DirectoryWatcher + 'static,
{
    tokio::spawn(run(events, registry, queue, config_dir, stop))
}

async fn run<W: DirectoryWatcher>(
    mut events: mpsc::UnboundedReceiver<FsEvent>,
    registry: Arc<Mutex<WatchRegistry<W>>>,
    queue: BackupQueue,
    config_dir: PathBuf,
    mut stop: oneshot::Receiver<()>,
) {
    info!("Filesystem listener started");
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = &mut stop => None,
        };
        let Some(event) = event else { break };

        match event {
            FsEvent::Changed(path) => {
                let interests = registry.lock().await.interests_for(&path);
                if interests.is_empty() {
                    continue;
                }
                debug!(path = %path.display(), interests = interests.len(), "Tracked file changed");

                for interest in interests {
                    if let Err(e) = enqueue_change(&queue, &config_dir, &path, interest).await {
                        if matches!(e, HistoryError::QueueClosed) {
                            info!("Backup queue closed, stopping filesystem listener");
                            return;
                        }
                        warn!(path = %path.display(), error = %e, "Failed to back up changed file");
                    }
                }
            }
            FsEvent::Error(message) => {
                warn!(error = %message, "Filesystem watcher error");
            }
        }
    }
    info!("Filesystem listener stopped");
}

async fn enqueue_change(queue: &BackupQueue, config_dir: &Path, changed: &Path, interest: WatchInterest) -> Result<()> {
    let WatchInterest { group, options } = interest;

    let dir = config_dir.to_path_buf();
    let path = changed.to_path_buf();
    let unit = options.clone();
    let snapshots = tokio::task::spawn_blocking(move || snapshots_for_change(&dir, &unit, &path)).await??;

    for snapshot in snapshots {
        queue
            .push(BackupJob {
                group: group.clone(),
                options: options.clone(),
                snapshot,
            })
            .await?;
    }
    Ok(())
}

/// Snapshots of `options` that a change to `changed` can affect. For a
/// directory unit only the changed file is read.
pub fn snapshots_for_change(config_dir: &Path, options: &ConfigBackupOptions, changed: &Path) -> Result<Vec<ConfigBackup>> {
    match options.backup_type {
        BackupType::Single => Ok(vec![extract_single(config_dir, options)?]),
        BackupType::Multiple => extract_multiple(config_dir, options),
        BackupType::Directory => {
            let Some(name) = changed.file_name() else {
                return Ok(Vec::new());
            };
            Ok(extract_directory_entry(config_dir, options, &name.to_string_lossy())?
                .into_iter()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SummaryCache;
    use crate::model::GroupSlug;
    use crate::pipeline::watch::tests::RecordingWatcher;
    use crate::store::retention::RetentionPolicy;
    use crate::store::BackupStore;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_directory_change_reads_only_changed_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let storage = temp_dir.path().join(".storage");
        fs::create_dir_all(&storage)?;
        fs::write(storage.join("core.config"), b"{}")?;
        fs::write(storage.join("core.area_registry"), b"{\"areas\": []}")?;

        let options = ConfigBackupOptions::directory(".storage", &["core.*"], &[]);
        let snapshots = snapshots_for_change(temp_dir.path(), &options, &storage.join("core.config"))?;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].identifier.id, "core.config");

        // Deleted before the event was handled.
        assert!(snapshots_for_change(temp_dir.path(), &options, &storage.join("core.gone"))?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_listener_enqueues_changed_units() -> Result<()> {
        let config_dir = TempDir::new()?;
        let backup_dir = TempDir::new()?;
        fs::write(
            config_dir.path().join("scenes.yaml"),
            "- id: s1\n  name: Evening\n- id: s2\n  name: Morning\n",
        )?;

        let cache = Arc::new(SummaryCache::new());
        let (queue, worker) = BackupQueue::start(BackupStore::new(backup_dir.path()), cache.clone(), RetentionPolicy::default());

        let group = GroupSlug::new("scenes");
        let options = ConfigBackupOptions::multiple("scenes.yaml", "id", "name");
        let mut registry = WatchRegistry::new(RecordingWatcher::default(), config_dir.path());
        registry.register_interest(&config_dir.path().join("scenes.yaml"), &group, &options)?;
        let registry = Arc::new(Mutex::new(registry));

        let (tx, rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let listener = spawn_listener(rx, registry, queue.clone(), config_dir.path().to_path_buf(), stop_rx);

        tx.send(FsEvent::Changed(config_dir.path().join("scenes.yaml"))).unwrap();
        tx.send(FsEvent::Changed(config_dir.path().join("untracked.yaml"))).unwrap();
        tx.send(FsEvent::Error("overflow".into())).unwrap();
        drop(tx);
        listener.await?;

        queue.flush().await?;
        assert_eq!(cache.len().await, 2);
        let names: Vec<_> = cache.list_group(&group).await.into_iter().map(|s| s.friendly_name).collect();
        assert_eq!(names, vec!["Evening", "Morning"]);

        queue.close().await;
        worker.await?;
        Ok(())
    }
}
