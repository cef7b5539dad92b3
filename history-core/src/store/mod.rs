//! On-disk snapshot storage.
//!
//! Layout: `<root>/<group_slug>/<path>/<id>/<timestamp>.<ext>`, where `<path>`
//! may span several directories (`packages/lights.yaml`). Timestamps are
//! UTC with microsecond precision (`20240101T120000_000000`) so that sorting
//! the file names of one identifier sorts them chronologically. Second
//! precision names (`20240101T120000`) written by older versions are still
//! understood and sort before any same-second microsecond name.

pub mod retention;

use crate::model::{BackupType, ConfigBackup, ConfigBackupIdentifier, GroupSlug, SnapshotEntry};
use crate::utils::{HistoryError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";
const MAX_COLLISION_RETRIES: u32 = 1000;

/// Extension used when the source file has none.
pub const DEFAULT_EXTENSION: &str = "backup";

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every snapshot of one identifier.
    pub fn identifier_dir(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) -> Result<PathBuf> {
        let mut dir = self.root.join(validate_component(group.as_str())?);
        for segment in validate_path(&identifier.path)?.split('/') {
            dir.push(segment);
        }
        Ok(dir.join(validate_component(&identifier.id)?))
    }

    /// Persist `snapshot` under the current time. A name collision moves the
    /// timestamp forward one microsecond at a time; existing files are never
    /// overwritten.
    pub fn save_snapshot(&self, group: &GroupSlug, snapshot: &ConfigBackup) -> Result<String> {
        let mut at = truncate_to_micros(Utc::now());
        for _ in 0..MAX_COLLISION_RETRIES {
            match self.save_snapshot_at(group, snapshot, at) {
                Err(HistoryError::Collision(name)) => {
                    debug!(group = %group, file = %name, "Snapshot name taken, retrying");
                    at += Duration::microseconds(1);
                }
                other => return other,
            }
        }
        Err(HistoryError::Collision(format!(
            "{} in {} after {} attempts",
            snapshot.identifier, group, MAX_COLLISION_RETRIES
        )))
    }

    /// Persist `snapshot` under exactly `at`, failing with
    /// [`HistoryError::Collision`] when that file already exists.
    pub fn save_snapshot_at(&self, group: &GroupSlug, snapshot: &ConfigBackup, at: DateTime<Utc>) -> Result<String> {
        let dir = self.identifier_dir(group, &snapshot.identifier)?;
        fs::create_dir_all(&dir)?;

        let filename = format!("{}.{}", timestamp_name(at), snapshot_extension(snapshot));
        let path = dir.join(&filename);
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(HistoryError::Collision(filename));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&snapshot.content)?;

        debug!(group = %group, identifier = %snapshot.identifier, file = %filename, "Snapshot written");
        Ok(filename)
    }

    /// Stored snapshots of one identifier, newest first. Unknown identifiers
    /// have no snapshots, and files without a snapshot timestamp are ignored.
    pub fn list_snapshots(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) -> Result<Vec<SnapshotEntry>> {
        let dir = self.identifier_dir(group, identifier)?;
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some(timestamp) = parse_timestamp(&filename) else {
                debug!(file = %entry.path().display(), "Ignoring file without a snapshot timestamp");
                continue;
            };
            entries.push(SnapshotEntry {
                filename,
                size: metadata.len(),
                timestamp,
            });
        }

        entries.sort_by(|a, b| b.filename.cmp(&a.filename));
        Ok(entries)
    }

    pub fn read_snapshot(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier, filename: &str) -> Result<Vec<u8>> {
        let path = self.identifier_dir(group, identifier)?.join(validate_component(filename)?);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                HistoryError::NotFound(format!("snapshot {} of {} in {}", filename, identifier, group))
            }
            _ => e.into(),
        })
    }

    /// Newest stored snapshot with its content.
    pub fn latest_snapshot(
        &self,
        group: &GroupSlug,
        identifier: &ConfigBackupIdentifier,
    ) -> Result<Option<(SnapshotEntry, Vec<u8>)>> {
        let Some(entry) = self.list_snapshots(group, identifier)?.into_iter().next() else {
            return Ok(None);
        };
        let content = self.read_snapshot(group, identifier, &entry.filename)?;
        Ok(Some((entry, content)))
    }

    pub fn delete_snapshot(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier, filename: &str) -> Result<()> {
        let dir = self.identifier_dir(group, identifier)?;
        let path = dir.join(validate_component(filename)?);
        fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                HistoryError::NotFound(format!("snapshot {} of {} in {}", filename, identifier, group))
            }
            _ => e.into(),
        })?;
        self.prune_empty_dirs(&dir);
        Ok(())
    }

    pub fn delete_all_snapshots(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) -> Result<()> {
        let dir = self.identifier_dir(group, identifier)?;
        fs::remove_dir_all(&dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HistoryError::NotFound(format!("backups of {} in {}", identifier, group)),
            _ => e.into(),
        })?;
        if let Some(parent) = dir.parent() {
            self.prune_empty_dirs(parent);
        }
        Ok(())
    }

    /// Group slugs that have a directory under the root.
    pub fn list_groups(&self) -> Result<Vec<GroupSlug>> {
        Ok(list_entries(&self.root)?
            .dirs
            .into_iter()
            .filter(|name| validate_component(name).is_ok())
            .map(GroupSlug::new)
            .collect())
    }

    /// Every identifier with stored snapshots under `group`. A directory that
    /// holds snapshot files is an identifier; the directories above it, up
    /// to the group, form its unit path.
    pub fn list_identifiers(&self, group: &GroupSlug) -> Result<Vec<ConfigBackupIdentifier>> {
        let group_dir = self.root.join(validate_component(group.as_str())?);
        let mut identifiers = Vec::new();
        collect_identifiers(&group_dir, &mut Vec::new(), &mut identifiers)?;
        Ok(identifiers)
    }

    /// Remove `dir` and its ancestors up to the root while they are empty.
    fn prune_empty_dirs(&self, dir: &Path) {
        let mut current = Some(dir);
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            // remove_dir only succeeds on empty directories
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Reject anything that could escape its directory when used as a single
/// path component.
pub fn validate_component(component: &str) -> Result<&str> {
    let invalid = component.is_empty()
        || component == "."
        || component.contains("..")
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0');
    if invalid {
        return Err(HistoryError::InvalidComponent(component.to_string()));
    }
    Ok(component)
}

/// Reject a unit path that could escape the configuration or backup root.
/// Nested paths are allowed as long as every `/`-separated segment is a safe
/// component.
pub fn validate_path(path: &str) -> Result<&str> {
    if path.is_empty() {
        return Err(HistoryError::InvalidComponent(path.to_string()));
    }
    for segment in path.split('/') {
        validate_component(segment).map_err(|_| HistoryError::InvalidComponent(path.to_string()))?;
    }
    Ok(path)
}

/// File extension for a stored snapshot: `yaml` for records of a multiple
/// file, otherwise the source file's own extension.
pub fn snapshot_extension(snapshot: &ConfigBackup) -> String {
    if snapshot.backup_type == BackupType::Multiple {
        return "yaml".to_string();
    }
    snapshot
        .file_path
        .extension()
        .map(|ext| ext.to_string_lossy().to_string())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

pub fn timestamp_name(at: DateTime<Utc>) -> String {
    format!(
        "{}_{:06}",
        at.format(TIMESTAMP_FORMAT),
        at.timestamp_subsec_micros().min(999_999)
    )
}

/// Timestamp embedded in a snapshot file name, in either naming scheme.
pub fn parse_timestamp(filename: &str) -> Option<DateTime<Utc>> {
    let stem = filename.split('.').next()?;
    let (seconds, micros) = match stem.split_once('_') {
        Some((seconds, micros)) => (seconds, micros.parse::<i64>().ok()?),
        None => (stem, 0),
    };
    let naive = NaiveDateTime::parse_from_str(seconds, TIMESTAMP_FORMAT).ok()?;
    Some(naive.and_utc() + Duration::microseconds(micros))
}

fn truncate_to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

#[derive(Debug, Default)]
struct DirEntries {
    dirs: Vec<String>,
    has_snapshots: bool,
}

fn list_entries(dir: &Path) -> Result<DirEntries> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DirEntries::default()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = DirEntries::default();
    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_dir() {
            entries.dirs.push(name);
        } else if parse_timestamp(&name).is_some() {
            entries.has_snapshots = true;
        }
    }
    entries.dirs.sort();
    Ok(entries)
}

fn collect_identifiers(
    dir: &Path,
    segments: &mut Vec<String>,
    identifiers: &mut Vec<ConfigBackupIdentifier>,
) -> Result<()> {
    let entries = list_entries(dir)?;
    if entries.has_snapshots {
        match segments.split_last() {
            Some((id, path)) if !path.is_empty() => {
                identifiers.push(ConfigBackupIdentifier::new(path.join("/"), id.clone()));
            }
            _ => warn!(path = %dir.display(), "Snapshots outside an identifier directory"),
        }
    }

    for name in entries.dirs {
        if validate_component(&name).is_err() {
            continue;
        }
        let child = dir.join(&name);
        segments.push(name);
        collect_identifiers(&child, segments, identifiers)?;
        segments.pop();
    }
    Ok(())
}
