//! Settings for the configuration history engine.
//!
//! Loaded from a TOML file with environment variable overrides. Without a
//! file the defaults describe a standard Home Assistant installation.

use crate::model::{BackupType, ConfigBackupOptions, ConfigGroup, GroupSlug};
use crate::store::retention::RetentionPolicy;
use crate::store::validate_path;
use crate::utils::{HistoryError, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Live configuration directory being tracked
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Root of the snapshot store
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Cron expression for periodic full scans; empty disables them
    #[serde(default)]
    pub cron_schedule: Option<String>,

    #[serde(default)]
    pub default_max_backups: Option<usize>,

    #[serde(default)]
    pub default_max_backup_age_days: Option<u32>,

    #[serde(default = "default_groups")]
    pub groups: Vec<ConfigGroup>,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/homeassistant")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/data/backups")
}

fn default_port() -> u16 {
    40613
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_groups() -> Vec<ConfigGroup> {
    vec![
        ConfigGroup::new(
            "Core Home Assistant",
            vec![
                ConfigBackupOptions::single("configuration.yaml"),
                ConfigBackupOptions::directory(
                    ".storage",
                    &["core.*", "frontend.*", "person"],
                    &[
                        "core.analytics",
                        "core.config_entries",
                        "core.restore_state",
                        "core.device_registry",
                        "core.entity_registry",
                        "core.uuid",
                    ],
                ),
            ],
        ),
        ConfigGroup::new(
            "Automations",
            vec![ConfigBackupOptions::multiple("automations.yaml", "id", "alias")],
        ),
        ConfigGroup::new(
            "Scenes",
            vec![ConfigBackupOptions::multiple("scenes.yaml", "id", "name")],
        ),
        ConfigGroup::new(
            "ESP Home",
            vec![ConfigBackupOptions::directory("esphome", &["*.yaml"], &["secrets.yaml"])],
        ),
        ConfigGroup::new(
            "Dashboards",
            vec![ConfigBackupOptions::directory(
                ".storage",
                &["lovelace.*", "lovelace_dashboards", "energy"],
                &[],
            )],
        ),
        ConfigGroup::new(
            "Helpers",
            vec![ConfigBackupOptions::directory(
                ".storage",
                &["counter.*", "input_*", "schedule", "timer"],
                &[],
            )],
        ),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            backup_dir: default_backup_dir(),
            port: default_port(),
            log_level: default_log_level(),
            cron_schedule: None,
            default_max_backups: None,
            default_max_backup_age_days: None,
            groups: default_groups(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| HistoryError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from `path` when given and present, otherwise use the defaults.
    /// Environment overrides are applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let settings = Self::from_file(path)?;
                info!(path = %path.display(), groups = settings.groups.len(), "Loaded settings");
                settings
            }
            Some(path) => {
                warn!(path = %path.display(), "Settings file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `CONFIG_DIR`, `BACKUP_DIR`, `PORT`, `CRON_SCHEDULE` and
    /// `LOG_LEVEL` as returned by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CONFIG_DIR") {
            self.config_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("BACKUP_DIR") {
            self.backup_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("PORT") {
            match port.trim_start_matches(':').parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid PORT"),
            }
        }
        if let Some(cron) = lookup("CRON_SCHEDULE") {
            self.cron_schedule = Some(cron);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Cron expression, if periodic scans are enabled.
    pub fn cron_expression(&self) -> Option<&str> {
        self.cron_schedule
            .as_deref()
            .map(str::trim)
            .filter(|cron| !cron.is_empty())
    }

    pub fn retention_defaults(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_backups: self.default_max_backups,
            max_age_days: self.default_max_backup_age_days,
        }
    }

    /// Configured unit `path` inside the group with slug `group`.
    pub fn find_unit(&self, group: &GroupSlug, path: &str) -> Option<&ConfigBackupOptions> {
        self.groups
            .iter()
            .filter(|g| &g.slug() == group)
            .flat_map(|g| g.configs.iter())
            .find(|options| options.path == path)
    }

    /// Reject units the engine cannot track safely.
    pub fn validate(&self) -> Result<()> {
        check_limits("default", self.default_max_backups, self.default_max_backup_age_days)?;

        let mut slugs = HashSet::new();
        for group in &self.groups {
            let slug = group.slug();
            if slug.as_str().is_empty() {
                return Err(HistoryError::Config(format!(
                    "group name '{}' has no letters or digits",
                    group.name
                )));
            }
            if !slugs.insert(slug.clone()) {
                return Err(HistoryError::Config(format!("duplicate group '{}'", slug)));
            }

            let mut paths = HashSet::new();
            for options in &group.configs {
                validate_path(&options.path)?;
                check_limits(&options.path, options.max_backups, options.max_backup_age_days)?;
                if !paths.insert(options.path.as_str()) {
                    warn!(group = %slug, path = %options.path, "Path configured twice in one group");
                }
                if options.backup_type == BackupType::Multiple && options.id_node.is_none() {
                    return Err(HistoryError::Config(format!(
                        "'{}' in group '{}' is a multiple backup without an id_node",
                        options.path, group.name
                    )));
                }
                for pattern in options
                    .include_file_patterns
                    .iter()
                    .chain(&options.exclude_file_patterns)
                {
                    Pattern::new(pattern)?;
                }
            }
        }
        Ok(())
    }
}

/// A limit of zero would delete every snapshot right after writing it, so the
/// next scan would store it again. Leave the limit unset to keep everything.
fn check_limits(scope: &str, max_backups: Option<usize>, max_age_days: Option<u32>) -> Result<()> {
    if max_backups == Some(0) {
        return Err(HistoryError::Config(format!("{scope}: max_backups must be at least 1")));
    }
    if max_age_days == Some(0) {
        return Err(HistoryError::Config(format!("{scope}: max_backup_age_days must be at least 1")));
    }
    Ok(())
}
