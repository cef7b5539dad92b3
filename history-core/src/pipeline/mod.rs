//! Backup pipeline: a FIFO job queue drained by a single worker task.
//!
//! Producers (full scans, the filesystem listener) push [`BackupJob`]s. The
//! worker compares each snapshot's hash against the cached summary and only
//! touches the store when the content changed.

pub mod listener;
pub mod watch;

use crate::cache::SummaryCache;
use crate::model::{ConfigBackup, ConfigBackupOptions, GroupSlug};
use crate::store::retention::{apply_retention, RetentionPolicy};
use crate::store::BackupStore;
use crate::utils::{HistoryError, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// One snapshot waiting to be compared and possibly stored.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub group: GroupSlug,
    pub options: ConfigBackupOptions,
    pub snapshot: ConfigBackup,
}

enum QueueItem {
    Backup(Box<BackupJob>),
    /// Barrier: answered once every item queued before it was handled.
    Flush(oneshot::Sender<()>),
}

/// Producer handle of the job queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct BackupQueue {
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<QueueItem>>>>,
}

impl BackupQueue {
    /// Create the queue and spawn its worker.
    pub fn start(store: BackupStore, cache: Arc<SummaryCache>, defaults: RetentionPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = BackupWorker { store, cache, defaults };
        let handle = tokio::spawn(worker.run(rx));
        let queue = Self {
            tx: Arc::new(RwLock::new(Some(tx))),
        };
        (queue, handle)
    }

    pub async fn push(&self, job: BackupJob) -> Result<()> {
        self.send(QueueItem::Backup(Box::new(job))).await
    }

    /// Wait until every job pushed before this call has been processed.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(QueueItem::Flush(done_tx)).await?;
        done_rx.await.map_err(|_| HistoryError::QueueClosed)
    }

    /// Stop accepting jobs. The worker finishes what is already queued and
    /// then exits.
    pub async fn close(&self) {
        if self.tx.write().await.take().is_some() {
            info!("Backup queue closed");
        }
    }

    async fn send(&self, item: QueueItem) -> Result<()> {
        let guard = self.tx.read().await;
        let tx = guard.as_ref().ok_or(HistoryError::QueueClosed)?;
        tx.send(item).map_err(|_| HistoryError::QueueClosed)
    }
}

/// Outcome of processing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Unchanged,
    Stored { filename: String },
}

struct BackupWorker {
    store: BackupStore,
    cache: Arc<SummaryCache>,
    defaults: RetentionPolicy,
}

impl BackupWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        info!("Backup worker started");
        while let Some(item) = rx.recv().await {
            match item {
                QueueItem::Backup(job) => {
                    let group = job.group.clone();
                    let identifier = job.snapshot.identifier.clone();
                    match self.process(*job).await {
                        Ok(JobOutcome::Unchanged) => {}
                        Ok(JobOutcome::Stored { filename }) => {
                            info!(group = %group, identifier = %identifier, file = %filename, "Backup stored");
                        }
                        Err(e) => {
                            error!(group = %group, identifier = %identifier, error = %e, "Backup failed");
                        }
                    }
                }
                QueueItem::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        info!("Backup worker stopped");
    }

    async fn process(&self, job: BackupJob) -> Result<JobOutcome> {
        let BackupJob { group, options, snapshot } = job;
        let identifier = snapshot.identifier.clone();

        if let Some(summary) = self.cache.get(&group, &identifier).await {
            if summary.last_hash == snapshot.hash {
                debug!(group = %group, identifier = %identifier, "Content unchanged");
                return Ok(JobOutcome::Unchanged);
            }
        }

        let store = self.store.clone();
        let policy = RetentionPolicy::resolve(&options, &self.defaults);
        let slug = group.clone();
        let (filename, summary) = tokio::task::spawn_blocking(move || -> Result<_> {
            let filename = store.save_snapshot(&slug, &snapshot)?;
            let summary = apply_retention(&store, &slug, &snapshot, &policy, Utc::now())?;
            Ok((filename, summary))
        })
        .await??;

        self.cache.set(&group, &identifier, summary).await;
        Ok(JobOutcome::Stored { filename })
    }
}
