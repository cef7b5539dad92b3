//! Directory watch registry.
//!
//! Several tracked units often live in the same directory (e.g. a handful of
//! YAML files in the config root). The OS watch is requested once per
//! directory; every unit interested in it is recorded as an interest.

use crate::model::{BackupType, ConfigBackupOptions, GroupSlug};
use crate::snapshot::matches_filters;
use crate::utils::{HistoryError, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something that can start watching a directory for changes.
pub trait DirectoryWatcher: Send {
    fn watch(&mut self, directory: &Path) -> Result<()>;
}

/// A unit that wants to hear about changes in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchInterest {
    pub group: GroupSlug,
    pub options: ConfigBackupOptions,
}

pub struct WatchRegistry<W: DirectoryWatcher> {
    watcher: Option<W>,
    config_dir: PathBuf,
    interests: HashMap<PathBuf, Vec<WatchInterest>>,
}

impl<W: DirectoryWatcher> WatchRegistry<W> {
    pub fn new(watcher: W, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            watcher: Some(watcher),
            config_dir: config_dir.into(),
            interests: HashMap::new(),
        }
    }

    /// Record that `group`'s unit wants changes to `file_path`.
    pub fn register_interest(&mut self, file_path: &Path, group: &GroupSlug, options: &ConfigBackupOptions) -> Result<()> {
        let directory = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config_dir.clone());
        self.register_directory(directory, group, options)
    }

    /// Record interest in every file directly inside `directory`. The OS watch
    /// is only requested the first time a directory is seen; an existing
    /// interest for the same group and unit path is updated in place.
    pub fn register_directory(&mut self, directory: PathBuf, group: &GroupSlug, options: &ConfigBackupOptions) -> Result<()> {
        if !self.interests.contains_key(&directory) {
            let watcher = self.watcher.as_mut().ok_or(HistoryError::WatcherClosed)?;
            watcher.watch(&directory)?;
            info!(directory = %directory.display(), unit = %options.path, "Watching directory");
        } else {
            debug!(directory = %directory.display(), unit = %options.path, "Directory already watched");
        }

        let interests = self.interests.entry(directory).or_default();
        let interest = WatchInterest {
            group: group.clone(),
            options: options.clone(),
        };
        match interests
            .iter_mut()
            .find(|existing| existing.group == *group && existing.options.path == options.path)
        {
            Some(existing) => *existing = interest,
            None => interests.push(interest),
        }
        Ok(())
    }

    /// Interests whose unit covers `changed`.
    pub fn interests_for(&self, changed: &Path) -> Vec<WatchInterest> {
        let Some(directory) = changed.parent() else {
            return Vec::new();
        };
        let Some(interests) = self.interests.get(directory) else {
            return Vec::new();
        };

        interests
            .iter()
            .filter(|interest| self.covers(interest, changed))
            .cloned()
            .collect()
    }

    pub fn watched_directories(&self) -> Vec<PathBuf> {
        let mut directories: Vec<_> = self.interests.keys().cloned().collect();
        directories.sort();
        directories
    }

    /// Drop the underlying watcher. For [`NotifyWatcher`] this closes the
    /// event channel, which ends the listener.
    pub fn close(&mut self) {
        if self.watcher.take().is_some() {
            info!(directories = self.interests.len(), "Closing directory watcher");
        }
    }

    fn covers(&self, interest: &WatchInterest, changed: &Path) -> bool {
        let unit_path = self.config_dir.join(&interest.options.path);
        match interest.options.backup_type {
            BackupType::Single | BackupType::Multiple => changed == unit_path,
            BackupType::Directory => {
                if changed.parent() != Some(unit_path.as_path()) {
                    return false;
                }
                let Some(name) = changed.file_name() else {
                    return false;
                };
                matches_filters(&interest.options, &name.to_string_lossy()).unwrap_or_else(|e| {
                    warn!(unit = %interest.options.path, error = %e, "Invalid file pattern");
                    false
                })
            }
        }
    }
}

/// What the filesystem listener receives.
#[derive(Debug)]
pub enum FsEvent {
    /// A file was created or its content was written.
    Changed(PathBuf),
    Error(String),
}

/// [`DirectoryWatcher`] backed by the platform's native notification API.
pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
}

impl NotifyWatcher {
    /// Create the watcher and the channel its events are delivered on. The
    /// channel closes once the watcher is dropped.
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<FsEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if !is_write_or_create(&event.kind) {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.send(FsEvent::Changed(path));
                    }
                }
                Err(e) => {
                    let _ = tx.send(FsEvent::Error(e.to_string()));
                }
            }
        })?;
        Ok((Self { watcher }, rx))
    }
}

impl DirectoryWatcher for NotifyWatcher {
    fn watch(&mut self, directory: &Path) -> Result<()> {
        self.watcher.watch(directory, RecursiveMode::NonRecursive)?;
        Ok(())
    }
}

fn is_write_or_create(kind: &EventKind) -> bool {
    use notify::event::ModifyKind;
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(_))
    )
}
