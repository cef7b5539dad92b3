//! Reads the live configuration tree and turns it into snapshots.
//!
//! Three layouts are understood:
//! - `single`: the whole file is one unit
//! - `directory`: every matching file directly inside a directory is a unit
//! - `multiple`: every record of a YAML sequence file is a unit, stored as
//!   its own source text so comments and quoting survive a restore

use super::hash::hash_content;
use super::layout::SequenceLayout;
use super::yaml::{node_value, parse_records};
use crate::model::{BackupType, ConfigBackup, ConfigBackupIdentifier, ConfigBackupOptions};
use crate::utils::{HistoryError, Result};
use chrono::{DateTime, Utc};
use glob::Pattern;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Extract every unit described by `options`.
pub fn extract(config_dir: &Path, options: &ConfigBackupOptions) -> Result<Vec<ConfigBackup>> {
    match options.backup_type {
        BackupType::Single => Ok(vec![extract_single(config_dir, options)?]),
        BackupType::Multiple => extract_multiple(config_dir, options),
        BackupType::Directory => extract_directory(config_dir, options),
    }
}

/// Whole-file snapshot whose id is the configured path.
pub fn extract_single(config_dir: &Path, options: &ConfigBackupOptions) -> Result<ConfigBackup> {
    let file_path = config_dir.join(&options.path);
    let (content, modified) = read_file(&file_path)?;

    Ok(ConfigBackup {
        identifier: ConfigBackupIdentifier::new(&options.path, &options.path),
        friendly_name: options.path.clone(),
        hash: hash_content(&content),
        modified,
        backup_type: BackupType::Single,
        file_path,
        content,
    })
}

/// One snapshot per record of a YAML sequence file. Records keep their
/// source text when the document layout is recognised and are re-serialized
/// alone otherwise.
pub fn extract_multiple(config_dir: &Path, options: &ConfigBackupOptions) -> Result<Vec<ConfigBackup>> {
    let id_node = options.id_node.as_deref().ok_or_else(|| {
        HistoryError::Config(format!("'{}' is a multiple backup without an id_node", options.path))
    })?;
    let friendly_name_node = options.friendly_name_node.as_deref().unwrap_or(id_node);

    let file_path = config_dir.join(&options.path);
    let (content, modified) = read_file(&file_path)?;
    let records = parse_records(&content)?;
    let layout = std::str::from_utf8(&content)
        .ok()
        .and_then(|text| SequenceLayout::scan(text, &records));
    if layout.is_none() && !records.is_empty() {
        debug!(path = %options.path, "Sequence layout not recognised, re-serializing records");
    }

    let mut seen = HashSet::new();
    let mut backups = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let id = node_value(record, id_node);
        if !seen.insert(id.clone()) {
            warn!(path = %options.path, id = %id, "Skipping record with duplicate id");
            continue;
        }

        let blob = match layout.as_ref().and_then(|layout| layout.source(index)) {
            Some(source) => source.as_bytes().to_vec(),
            None => serde_yaml::to_string(record)?.into_bytes(),
        };
        backups.push(ConfigBackup {
            identifier: ConfigBackupIdentifier::new(&options.path, id),
            friendly_name: node_value(record, friendly_name_node),
            hash: hash_content(&blob),
            modified,
            backup_type: BackupType::Multiple,
            file_path: file_path.clone(),
            content: blob,
        });
    }

    Ok(backups)
}

/// One snapshot per matching regular file directly inside the directory.
/// A missing directory yields no snapshots.
pub fn extract_directory(config_dir: &Path, options: &ConfigBackupOptions) -> Result<Vec<ConfigBackup>> {
    let directory = config_dir.join(&options.path);
    let read_dir = match fs::read_dir(&directory) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if matches_filters(options, &name)? {
            names.push(name);
        }
    }
    names.sort();

    names
        .iter()
        .map(|name| directory_snapshot(&directory, options, name))
        .collect()
}

/// Snapshot of a single named file of a `directory` unit, or `None` when the
/// file is filtered out or no longer exists.
pub fn extract_directory_entry(
    config_dir: &Path,
    options: &ConfigBackupOptions,
    filename: &str,
) -> Result<Option<ConfigBackup>> {
    if !matches_filters(options, filename)? {
        return Ok(None);
    }

    let directory = config_dir.join(&options.path);
    match directory_snapshot(&directory, options, filename) {
        Ok(backup) => Ok(Some(backup)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// True when `name` passes the include list (empty = everything) and matches
/// no exclude pattern.
pub fn matches_filters(options: &ConfigBackupOptions, name: &str) -> Result<bool> {
    if !options.include_file_patterns.is_empty()
        && !any_pattern_matches(&options.include_file_patterns, name)?
    {
        return Ok(false);
    }
    Ok(!any_pattern_matches(&options.exclude_file_patterns, name)?)
}

fn any_pattern_matches(patterns: &[String], name: &str) -> Result<bool> {
    for pattern in patterns {
        if Pattern::new(pattern)?.matches(name) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn directory_snapshot(directory: &Path, options: &ConfigBackupOptions, name: &str) -> Result<ConfigBackup> {
    let file_path = directory.join(name);
    let (content, modified) = read_file(&file_path)?;

    Ok(ConfigBackup {
        identifier: ConfigBackupIdentifier::new(&options.path, name),
        friendly_name: name.to_string(),
        hash: hash_content(&content),
        modified,
        backup_type: BackupType::Directory,
        file_path,
        content,
    })
}

fn read_file(path: &Path) -> Result<(Vec<u8>, DateTime<Utc>)> {
    let content = fs::read(path)?;
    let modified = fs::metadata(path)?
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok((content, modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const AUTOMATIONS: &str = r#"- id: "example-1"
  alias: "Sample Multi Example 1"
  config:
    settingA: true
    nested:
      option2: [1, 2, 3]
- id: "example-2"
  alias: "Sample Multi Example 2"
  config:
    settingA: false
"#;

    fn sample_dir() -> std::io::Result<TempDir> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join("sample-dir");
        fs::create_dir(&dir)?;
        fs::write(dir.join("a-id.yaml"), b"id: a\n")?;
        fs::write(dir.join("b.yaml"), b"name: b\n")?;
        fs::write(dir.join("random-file"), b"This isn't yaml")?;
        fs::create_dir(dir.join("nested"))?;
        fs::write(dir.join("nested/c.yaml"), b"ignored\n")?;
        Ok(temp_dir)
    }

    fn ids(backups: &[ConfigBackup]) -> Vec<&str> {
        backups.iter().map(|b| b.identifier.id.as_str()).collect()
    }

    #[test]
    fn test_extract_single() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("configuration.yaml"), b"homeassistant:\n  name: Home\n")?;

        let backup = extract_single(temp_dir.path(), &ConfigBackupOptions::single("configuration.yaml"))?;
        assert_eq!(backup.identifier, ConfigBackupIdentifier::new("configuration.yaml", "configuration.yaml"));
        assert_eq!(backup.friendly_name, "configuration.yaml");
        assert_eq!(backup.backup_type, BackupType::Single);
        assert_eq!(backup.content, b"homeassistant:\n  name: Home\n");
        assert_eq!(backup.hash, hash_content(b"homeassistant:\n  name: Home\n"));
        assert_eq!(backup.file_path, temp_dir.path().join("configuration.yaml"));
        Ok(())
    }

    #[test]
    fn test_extract_single_missing_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = extract_single(temp_dir.path(), &ConfigBackupOptions::single("missing.yaml"));
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn test_extract_multiple() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("automations.yaml"), AUTOMATIONS)?;

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let backups = extract_multiple(temp_dir.path(), &options)?;

        assert_eq!(ids(&backups), vec!["example-1", "example-2"]);
        assert_eq!(backups[0].friendly_name, "Sample Multi Example 1");
        assert_eq!(backups[1].identifier.path, "automations.yaml");

        // Each snapshot holds only its own record.
        let record: serde_yaml::Value = serde_yaml::from_slice(&backups[0].content)?;
        assert_eq!(node_value(&record, "id"), "example-1");
        let text = String::from_utf8(backups[0].content.clone()).unwrap();
        assert!(!text.contains("example-2"));
        assert_eq!(backups[0].hash, hash_content(&backups[0].content));
        Ok(())
    }

    #[test]
    fn test_extract_multiple_keeps_record_source() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(
            temp_dir.path().join("automations.yaml"),
            "- id: \"a1\"\n  alias: \"Wake up\"  # weekdays\n  at: \"08:30:00\"\n  state: 'on'\n- id: a2\n  alias: Sleep\n",
        )?;

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let backups = extract_multiple(temp_dir.path(), &options)?;
        assert_eq!(
            backups[0].content,
            b"id: \"a1\"\nalias: \"Wake up\"  # weekdays\nat: \"08:30:00\"\nstate: 'on'\n"
        );
        assert_eq!(backups[0].friendly_name, "Wake up");
        assert_eq!(backups[1].content, b"id: a2\nalias: Sleep\n");
        Ok(())
    }

    #[test]
    fn test_extract_multiple_flow_sequence_is_reserialized() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("scenes.yaml"), "[{id: s1, name: Evening}]\n")?;

        let options = ConfigBackupOptions::multiple("scenes.yaml", "id", "name");
        let backups = extract_multiple(temp_dir.path(), &options)?;
        let record: serde_yaml::Value = serde_yaml::from_slice(&backups[0].content)?;
        assert_eq!(node_value(&record, "name"), "Evening");
        Ok(())
    }

    #[test]
    fn test_extract_multiple_missing_keys_use_sentinel() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("scenes.yaml"), "- id: s1\n- name: no id here\n")?;

        let options = ConfigBackupOptions::multiple("scenes.yaml", "id", "name");
        let backups = extract_multiple(temp_dir.path(), &options)?;
        assert_eq!(ids(&backups), vec!["s1", "unknown"]);
        assert_eq!(backups[0].friendly_name, "unknown");
        assert_eq!(backups[1].friendly_name, "no id here");
        Ok(())
    }

    #[test]
    fn test_extract_multiple_skips_duplicate_ids() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("scenes.yaml"), "- id: s1\n  name: first\n- id: s1\n  name: second\n")?;

        let options = ConfigBackupOptions::multiple("scenes.yaml", "id", "name");
        let backups = extract_multiple(temp_dir.path(), &options)?;
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].friendly_name, "first");
        Ok(())
    }

    #[test]
    fn test_extract_multiple_invalid_yaml_is_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("automations.yaml"), "- id: [broken\n")?;

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        assert!(extract_multiple(temp_dir.path(), &options).is_err());
        Ok(())
    }

    #[test]
    fn test_extract_multiple_requires_id_node() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("automations.yaml"), AUTOMATIONS)?;

        let mut options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        options.id_node = None;
        let err = extract_multiple(temp_dir.path(), &options).unwrap_err();
        assert!(matches!(err, HistoryError::Config(_)));
        Ok(())
    }

    #[test]
    fn test_extract_directory_all_files() -> Result<()> {
        let temp_dir = sample_dir()?;
        let options = ConfigBackupOptions::directory("sample-dir", &[], &[]);

        let backups = extract_directory(temp_dir.path(), &options)?;
        assert_eq!(ids(&backups), vec!["a-id.yaml", "b.yaml", "random-file"]);
        assert_eq!(backups[2].content, b"This isn't yaml");
        assert_eq!(backups[2].friendly_name, "random-file");
        assert!(backups.iter().all(|b| b.identifier.path == "sample-dir"));
        Ok(())
    }

    #[test]
    fn test_extract_directory_include_patterns() -> Result<()> {
        let temp_dir = sample_dir()?;
        let options = ConfigBackupOptions::directory("sample-dir", &["*id.yaml"], &[]);
        assert_eq!(ids(&extract_directory(temp_dir.path(), &options)?), vec!["a-id.yaml"]);
        Ok(())
    }

    #[test]
    fn test_extract_directory_exclude_patterns() -> Result<()> {
        let temp_dir = sample_dir()?;
        let options = ConfigBackupOptions::directory("sample-dir", &[], &["*id.yaml", "random-file"]);
        assert_eq!(ids(&extract_directory(temp_dir.path(), &options)?), vec!["b.yaml"]);
        Ok(())
    }

    #[test]
    fn test_extract_directory_include_then_exclude() -> Result<()> {
        let temp_dir = sample_dir()?;
        let options = ConfigBackupOptions::directory("sample-dir", &["*.yaml"], &["*id.yaml"]);
        assert_eq!(ids(&extract_directory(temp_dir.path(), &options)?), vec!["b.yaml"]);
        Ok(())
    }

    #[test]
    fn test_extract_directory_no_matches_or_missing_dir() -> Result<()> {
        let temp_dir = sample_dir()?;
        let options = ConfigBackupOptions::directory("sample-dir", &["*.nonexistent"], &[]);
        assert!(extract_directory(temp_dir.path(), &options)?.is_empty());

        let missing = ConfigBackupOptions::directory("not-there", &[], &[]);
        assert!(extract_directory(temp_dir.path(), &missing)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_extract_directory_entry() -> Result<()> {
        let temp_dir = sample_dir()?;
        let options = ConfigBackupOptions::directory("sample-dir", &["*.yaml"], &[]);

        let backup = extract_directory_entry(temp_dir.path(), &options, "b.yaml")?.unwrap();
        assert_eq!(backup.identifier, ConfigBackupIdentifier::new("sample-dir", "b.yaml"));
        assert!(extract_directory_entry(temp_dir.path(), &options, "random-file")?.is_none());
        assert!(extract_directory_entry(temp_dir.path(), &options, "gone.yaml")?.is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        let options = ConfigBackupOptions::directory("sample-dir", &["[unclosed"], &[]);
        assert!(matches!(matches_filters(&options, "a"), Err(HistoryError::Pattern(_))));
    }
}
