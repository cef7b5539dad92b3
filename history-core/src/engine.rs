//! The history engine: owns the store, the summary cache, the job queue and
//! the watch registry, and exposes the operations the HTTP layer needs.

use crate::cache::SummaryCache;
use crate::config::Settings;
use crate::model::{
    BackupConfigSummary, BackupType, ConfigBackupIdentifier, ConfigBackupOptions, ConfigGroup, GroupSlug, SnapshotEntry,
};
use crate::pipeline::listener::spawn_listener;
use crate::pipeline::watch::{DirectoryWatcher, FsEvent, NotifyWatcher, WatchRegistry};
use crate::pipeline::{BackupJob, BackupQueue};
use crate::restore::{restore_snapshot, RestoreRequest};
use crate::snapshot::extract;
use crate::store::retention::recompute_summary;
use crate::store::BackupStore;
use crate::utils::{HistoryError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct HistoryEngine<W: DirectoryWatcher = NotifyWatcher> {
    settings: Settings,
    store: BackupStore,
    cache: Arc<SummaryCache>,
    queue: BackupQueue,
    registry: Arc<Mutex<WatchRegistry<W>>>,
    stop_listener: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HistoryEngine<NotifyWatcher> {
    /// Start the engine with the platform's filesystem watcher.
    pub async fn start(settings: Settings) -> Result<Arc<Self>> {
        let (watcher, events) = NotifyWatcher::new()?;
        Self::start_with_watcher(settings, watcher, events).await
    }
}

impl<W: DirectoryWatcher + 'static> HistoryEngine<W> {
    /// Load summaries from the store, spawn the worker and the listener, then
    /// run the initial full scan.
    pub async fn start_with_watcher(
        settings: Settings,
        watcher: W,
        events: mpsc::UnboundedReceiver<FsEvent>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let store = BackupStore::new(&settings.backup_dir);
        let cache = {
            let store = store.clone();
            let groups = settings.groups.clone();
            tokio::task::spawn_blocking(move || -> Result<SummaryCache> {
                std::fs::create_dir_all(store.root())?;
                SummaryCache::load(&store, &groups)
            })
            .await??
        };
        let cache = Arc::new(cache);

        let (queue, worker) = BackupQueue::start(store.clone(), cache.clone(), settings.retention_defaults());
        let registry = Arc::new(Mutex::new(WatchRegistry::new(watcher, &settings.config_dir)));
        let (stop_tx, stop_rx) = oneshot::channel();
        let listener = spawn_listener(events, registry.clone(), queue.clone(), settings.config_dir.clone(), stop_rx);

        info!(
            config_dir = %settings.config_dir.display(),
            backup_dir = %settings.backup_dir.display(),
            groups = settings.groups.len(),
            "History engine started"
        );

        let engine = Arc::new(Self {
            settings,
            store,
            cache,
            queue,
            registry,
            stop_listener: Mutex::new(Some(stop_tx)),
            tasks: Mutex::new(vec![listener, worker]),
        });
        engine.scan_all().await?;
        Ok(engine)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn groups(&self) -> &[ConfigGroup] {
        &self.settings.groups
    }

    /// Extract every configured unit, register its watches and queue a job
    /// per snapshot. Units that cannot be read are logged and skipped.
    /// Returns the number of queued jobs.
    pub async fn scan_all(&self) -> Result<usize> {
        let mut queued = 0;
        for group in &self.settings.groups {
            let slug = group.slug();
            for options in &group.configs {
                self.register_watch(&slug, options).await;

                let config_dir = self.settings.config_dir.clone();
                let unit = options.clone();
                let snapshots = match tokio::task::spawn_blocking(move || extract(&config_dir, &unit)).await? {
                    Ok(snapshots) => snapshots,
                    Err(e) => {
                        warn!(group = %slug, path = %options.path, error = %e, "Skipping unreadable unit");
                        continue;
                    }
                };

                for snapshot in snapshots {
                    self.queue
                        .push(BackupJob {
                            group: slug.clone(),
                            options: options.clone(),
                            snapshot,
                        })
                        .await?;
                    queued += 1;
                }
            }
        }
        info!(jobs = queued, "Full scan queued");
        Ok(queued)
    }

    async fn register_watch(&self, slug: &GroupSlug, options: &ConfigBackupOptions) {
        let unit_path = self.settings.config_dir.join(&options.path);
        let mut registry = self.registry.lock().await;
        let result = match options.backup_type {
            BackupType::Directory => registry.register_directory(unit_path, slug, options),
            BackupType::Single | BackupType::Multiple => registry.register_interest(&unit_path, slug, options),
        };
        if let Err(e) = result {
            warn!(group = %slug, path = %options.path, error = %e, "Failed to watch unit");
        }
    }

    /// Wait until every job queued so far has been processed.
    pub async fn flush(&self) -> Result<()> {
        self.queue.flush().await
    }

    /// Every cached summary, grouped by slug and sorted by friendly name.
    pub async fn summaries(&self) -> BTreeMap<GroupSlug, Vec<BackupConfigSummary>> {
        self.cache.snapshot_all().await.into_iter().collect()
    }

    pub async fn summary(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) -> Option<BackupConfigSummary> {
        self.cache.get(group, identifier).await
    }

    pub async fn list_snapshots(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) -> Result<Vec<SnapshotEntry>> {
        let store = self.store.clone();
        let (group, identifier) = (group.clone(), identifier.clone());
        tokio::task::spawn_blocking(move || store.list_snapshots(&group, &identifier)).await?
    }

    pub async fn read_snapshot(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier, filename: &str) -> Result<Vec<u8>> {
        let store = self.store.clone();
        let (group, identifier, filename) = (group.clone(), identifier.clone(), filename.to_string());
        tokio::task::spawn_blocking(move || store.read_snapshot(&group, &identifier, &filename)).await?
    }

    /// Delete one snapshot and recompute the unit's summary from what is left.
    pub async fn delete_snapshot(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier, filename: &str) -> Result<()> {
        let current = self.cache.get(group, identifier).await;
        let friendly_name = current
            .as_ref()
            .map(|s| s.friendly_name.clone())
            .unwrap_or_else(|| identifier.id.clone());
        let backup_type = current
            .as_ref()
            .map(|s| s.backup_type)
            .or_else(|| self.settings.find_unit(group, &identifier.path).map(|o| o.backup_type))
            .unwrap_or(BackupType::Single);

        let store = self.store.clone();
        let (slug, id, filename) = (group.clone(), identifier.clone(), filename.to_string());
        let summary = tokio::task::spawn_blocking(move || {
            store.delete_snapshot(&slug, &id, &filename)?;
            recompute_summary(&store, &slug, &id, &friendly_name, backup_type)
        })
        .await??;

        debug!(group = %group, identifier = %identifier, remaining = summary.as_ref().map_or(0, |s| s.backup_count), "Snapshot deleted");
        self.cache.set(group, identifier, summary).await;
        Ok(())
    }

    /// Delete every snapshot of a unit and forget its summary.
    pub async fn delete_all(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) -> Result<()> {
        let store = self.store.clone();
        let (slug, id) = (group.clone(), identifier.clone());
        tokio::task::spawn_blocking(move || store.delete_all_snapshots(&slug, &id)).await??;

        self.cache.remove(group, identifier).await;
        info!(group = %group, identifier = %identifier, "All snapshots deleted");
        Ok(())
    }

    /// Write a stored snapshot back into the live tree. Nothing is queued; a
    /// watched destination is picked up by the listener like any other edit.
    pub async fn restore(&self, request: RestoreRequest) -> Result<PathBuf> {
        let options = self
            .settings
            .find_unit(&request.group, &request.identifier.path)
            .cloned()
            .ok_or_else(|| {
                HistoryError::NotFound(format!(
                    "no unit '{}' in group '{}'",
                    request.identifier.path, request.group
                ))
            })?;

        let store = self.store.clone();
        let config_dir = self.settings.config_dir.clone();
        tokio::task::spawn_blocking(move || restore_snapshot(&store, &config_dir, &options, &request)).await?
    }

    /// Close the watcher and the queue, then wait for the listener and the
    /// worker to drain and exit.
    pub async fn shutdown(&self) {
        self.registry.lock().await.close();
        if let Some(stop) = self.stop_listener.lock().await.take() {
            let _ = stop.send(());
        }
        self.queue.close().await;

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("History engine stopped");
    }
}
