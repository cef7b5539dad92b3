//! Core data types shared by the extractor, store, cache and pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Sentinel returned by YAML key lookups when the key is missing.
pub const UNKNOWN_NODE_VALUE: &str = "unknown";

/// URL-safe identifier of a config group, derived from its display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupSlug(String);

impl GroupSlug {
    /// Lower-cases ASCII alphanumerics and collapses every other run of
    /// characters into a single `-`.
    pub fn from_name(name: &str) -> Self {
        let mut slug = String::with_capacity(name.len());
        let mut pending_dash = false;
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push(c.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
        }
        Self(slug)
    }

    /// Wrap an existing slug, e.g. one taken from a URL or a directory name.
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// The whole file is one unit.
    Single,
    /// Each record of a YAML sequence file is one unit.
    Multiple,
    /// Each file directly inside a directory is one unit.
    Directory,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupType::Single => "single",
            BackupType::Multiple => "multiple",
            BackupType::Directory => "directory",
        };
        f.write_str(name)
    }
}

/// Describes where one trackable unit lives and how it is split up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBackupOptions {
    /// Path relative to the live configuration directory.
    pub path: String,

    pub backup_type: BackupType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backups: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backup_age_days: Option<u32>,

    /// Key holding a record's id (`multiple` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_node: Option<String>,

    /// Key holding a record's display name (`multiple` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name_node: Option<String>,

    /// Glob patterns a file name must match (`directory` only, empty = all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_file_patterns: Vec<String>,

    /// Glob patterns that exclude a file name (`directory` only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_file_patterns: Vec<String>,
}

impl ConfigBackupOptions {
    pub fn single(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            backup_type: BackupType::Single,
            max_backups: None,
            max_backup_age_days: None,
            id_node: None,
            friendly_name_node: None,
            include_file_patterns: Vec::new(),
            exclude_file_patterns: Vec::new(),
        }
    }

    pub fn multiple(
        path: impl Into<String>,
        id_node: impl Into<String>,
        friendly_name_node: impl Into<String>,
    ) -> Self {
        Self {
            backup_type: BackupType::Multiple,
            id_node: Some(id_node.into()),
            friendly_name_node: Some(friendly_name_node.into()),
            ..Self::single(path)
        }
    }

    pub fn directory(path: impl Into<String>, include: &[&str], exclude: &[&str]) -> Self {
        Self {
            backup_type: BackupType::Directory,
            include_file_patterns: include.iter().map(|p| p.to_string()).collect(),
            exclude_file_patterns: exclude.iter().map(|p| p.to_string()).collect(),
            ..Self::single(path)
        }
    }

    pub fn with_retention(mut self, max_backups: Option<usize>, max_age_days: Option<u32>) -> Self {
        self.max_backups = max_backups;
        self.max_backup_age_days = max_age_days;
        self
    }
}

/// A named namespace of tracked units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigGroup {
    pub name: String,
    #[serde(default)]
    pub configs: Vec<ConfigBackupOptions>,
}

impl ConfigGroup {
    pub fn new(name: impl Into<String>, configs: Vec<ConfigBackupOptions>) -> Self {
        Self {
            name: name.into(),
            configs,
        }
    }

    pub fn slug(&self) -> GroupSlug {
        GroupSlug::from_name(&self.name)
    }
}

/// `(path, id)` pair addressing one unit inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigBackupIdentifier {
    pub path: String,
    pub id: String,
}

impl ConfigBackupIdentifier {
    pub fn new(path: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ConfigBackupIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path, self.id)
    }
}

/// Point-in-time capture of one unit's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBackup {
    pub identifier: ConfigBackupIdentifier,
    pub friendly_name: String,
    pub hash: String,
    pub modified: DateTime<Utc>,
    pub backup_type: BackupType,
    /// Absolute path of the live file the content was read from.
    pub file_path: PathBuf,
    pub content: Vec<u8>,
}

/// Cached statistics about the stored snapshots of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfigSummary {
    #[serde(flatten)]
    pub identifier: ConfigBackupIdentifier,
    pub friendly_name: String,
    pub last_hash: String,
    pub backup_count: usize,
    pub backups_size: u64,
    pub backup_type: BackupType,
}

/// One stored snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub filename: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_from_name() {
        assert_eq!(GroupSlug::from_name("Core Home Assistant").as_str(), "core-home-assistant");
        assert_eq!(GroupSlug::from_name("Storage & Settings").as_str(), "storage-settings");
        assert_eq!(GroupSlug::from_name("  ESP Home ").as_str(), "esp-home");
        assert_eq!(GroupSlug::from_name("Scenes").as_str(), "scenes");
    }

    #[test]
    fn test_options_deserialize_lowercase_type() {
        let toml = r#"
            path = "automations.yaml"
            backup_type = "multiple"
            id_node = "id"
            friendly_name_node = "alias"
        "#;
        let options: ConfigBackupOptions = toml::from_str(toml).unwrap();
        assert_eq!(options, ConfigBackupOptions::multiple("automations.yaml", "id", "alias"));
    }
}
