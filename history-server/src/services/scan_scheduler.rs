use history_core::HistoryEngine;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

pub struct ScanScheduler {
    scheduler: Mutex<JobScheduler>,
    engine: Arc<HistoryEngine>,
    cancel: CancellationToken,
}

impl ScanScheduler {
    pub async fn new(engine: Arc<HistoryEngine>, cancel: CancellationToken) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            engine,
            cancel,
        })
    }

    /// Run a full scan every time `cron_expression` fires.
    pub async fn schedule_scan(&self, cron_expression: &str) -> anyhow::Result<()> {
        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        let expression = normalize_cron(cron_expression);

        let job = Job::new_async(expression.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                run_scan(&engine, &cancel).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %expression, "Scan scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

/// One scheduled scan. Once shutdown has started nothing more is queued, so
/// the engine's final drain is not extended by a late trigger.
pub async fn run_scan(engine: &HistoryEngine, cancel: &CancellationToken) -> Option<usize> {
    if cancel.is_cancelled() {
        tracing::debug!("Shutting down, skipping scheduled scan");
        return None;
    }

    tracing::info!("Starting scheduled scan");
    match engine.scan_all().await {
        Ok(queued) => {
            tracing::info!(queued, "Scheduled scan queued");
            Some(queued)
        }
        Err(e) => {
            tracing::error!(error = %e, "Scheduled scan failed");
            None
        }
    }
}

/// The scheduler expects a leading seconds field; classic five-field
/// expressions get `0` prepended.
pub fn normalize_cron(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_core::model::{ConfigBackupOptions, ConfigGroup};
    use history_core::Settings;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("*/30 * * * *"), "0 */30 * * * *");
        assert_eq!(normalize_cron(" 0 0 3 * * * "), "0 0 3 * * *");
        assert_eq!(normalize_cron("@hourly"), "@hourly");
    }

    #[tokio::test]
    async fn test_scan_skipped_after_cancel() {
        let config = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(config.path().join("configuration.yaml"), "homeassistant: {}\n").unwrap();
        let settings = Settings {
            config_dir: config.path().to_path_buf(),
            backup_dir: backups.path().to_path_buf(),
            groups: vec![ConfigGroup::new("Core", vec![ConfigBackupOptions::single("configuration.yaml")])],
            ..Settings::default()
        };
        let engine = HistoryEngine::start(settings).await.unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(run_scan(&engine, &cancel).await, Some(1));
        cancel.cancel();
        assert_eq!(run_scan(&engine, &cancel).await, None);
        engine.shutdown().await;
    }
}
