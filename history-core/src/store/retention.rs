//! Retention policy enforcement and summary recomputation.

use super::BackupStore;
use crate::model::{BackupConfigSummary, BackupType, ConfigBackup, ConfigBackupIdentifier, ConfigBackupOptions, GroupSlug};
use crate::snapshot::hash_content;
use crate::utils::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

/// Effective limits for one unit. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_backups: Option<usize>,
    pub max_age_days: Option<u32>,
}

impl RetentionPolicy {
    /// Per-unit overrides win over the process-wide defaults.
    pub fn resolve(options: &ConfigBackupOptions, defaults: &RetentionPolicy) -> Self {
        Self {
            max_backups: options.max_backups.or(defaults.max_backups),
            max_age_days: options.max_backup_age_days.or(defaults.max_age_days),
        }
    }
}

/// Delete snapshots of `snapshot`'s identifier that exceed the policy and
/// return the recomputed summary, or `None` when no snapshot survived.
pub fn apply_retention(
    store: &BackupStore,
    group: &GroupSlug,
    snapshot: &ConfigBackup,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Option<BackupConfigSummary>> {
    let identifier = &snapshot.identifier;
    let entries = store.list_snapshots(group, identifier)?;
    let cutoff = policy.max_age_days.map(|days| now - Duration::days(i64::from(days)));

    let mut backup_count = 0;
    let mut backups_size = 0;
    for (index, entry) in entries.iter().enumerate() {
        let over_count = policy.max_backups.is_some_and(|max| index >= max);
        let too_old = cutoff.is_some_and(|cutoff| entry.timestamp < cutoff);

        if over_count || too_old {
            match store.delete_snapshot(group, identifier, &entry.filename) {
                Ok(()) => {
                    info!(group = %group, identifier = %identifier, file = %entry.filename, over_count, too_old, "Deleted old snapshot");
                    continue;
                }
                Err(e) => {
                    warn!(group = %group, identifier = %identifier, file = %entry.filename, error = %e, "Failed to delete old snapshot");
                }
            }
        }

        backup_count += 1;
        backups_size += entry.size;
    }

    if backup_count == 0 {
        return Ok(None);
    }

    Ok(Some(BackupConfigSummary {
        identifier: identifier.clone(),
        friendly_name: snapshot.friendly_name.clone(),
        last_hash: snapshot.hash.clone(),
        backup_count,
        backups_size,
        backup_type: snapshot.backup_type,
    }))
}

/// Rebuild a summary purely from what is on disk. `last_hash` comes from the
/// newest surviving snapshot.
pub fn recompute_summary(
    store: &BackupStore,
    group: &GroupSlug,
    identifier: &ConfigBackupIdentifier,
    friendly_name: &str,
    backup_type: BackupType,
) -> Result<Option<BackupConfigSummary>> {
    let entries = store.list_snapshots(group, identifier)?;
    let Some(newest) = entries.first() else {
        return Ok(None);
    };
    let content = store.read_snapshot(group, identifier, &newest.filename)?;

    Ok(Some(BackupConfigSummary {
        identifier: identifier.clone(),
        friendly_name: friendly_name.to_string(),
        last_hash: hash_content(&content),
        backup_count: entries.len(),
        backups_size: entries.iter().map(|e| e.size).sum(),
        backup_type,
    }))
}
