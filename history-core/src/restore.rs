//! Writes a stored snapshot back into the live configuration tree.
//!
//! Records of a `multiple` file are merged structurally: the restored record
//! replaces the one with the same id at its existing position, or is appended
//! when that id is gone. Every other record keeps its place and its exact
//! bytes, comments and quoting included.

use crate::model::{BackupType, ConfigBackupIdentifier, ConfigBackupOptions, GroupSlug};
use crate::snapshot::layout::SequenceLayout;
use crate::snapshot::yaml::{node_value, parse_records, serialize_records};
use crate::store::{validate_component, BackupStore};
use crate::utils::{HistoryError, Result};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Which stored snapshot to put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub group: GroupSlug,
    pub identifier: ConfigBackupIdentifier,
    pub filename: String,
}

impl RestoreRequest {
    pub fn new(group: GroupSlug, path: impl Into<String>, id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            group,
            identifier: ConfigBackupIdentifier::new(path, id),
            filename: filename.into(),
        }
    }
}

/// Restore `request` for the unit described by `options`. Returns the live
/// file that was written. Neither the store nor any cached summary is
/// modified.
pub fn restore_snapshot(
    store: &BackupStore,
    config_dir: &Path,
    options: &ConfigBackupOptions,
    request: &RestoreRequest,
) -> Result<PathBuf> {
    let content = store.read_snapshot(&request.group, &request.identifier, &request.filename)?;

    let destination = match options.backup_type {
        BackupType::Single => {
            let destination = config_dir.join(&options.path);
            fs::write(&destination, &content)?;
            destination
        }
        BackupType::Directory => {
            let directory = config_dir.join(&options.path);
            fs::create_dir_all(&directory)?;
            let destination = directory.join(validate_component(&request.identifier.id)?);
            fs::write(&destination, &content)?;
            destination
        }
        BackupType::Multiple => {
            let id_node = options.id_node.as_deref().ok_or_else(|| {
                HistoryError::Config(format!("'{}' is a multiple backup without an id_node", options.path))
            })?;
            let destination = config_dir.join(&options.path);
            let current = match fs::read(&destination) {
                Ok(current) => current,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            let merged = merge_record(&current, id_node, &request.identifier.id, &content)?;
            fs::write(&destination, merged)?;
            destination
        }
    };

    info!(
        group = %request.group,
        identifier = %request.identifier,
        file = %request.filename,
        destination = %destination.display(),
        "Snapshot restored"
    );
    Ok(destination)
}

/// Splice `record` (one YAML record) into the sequence document `current`,
/// keyed by the value under `id_node`. Only the replaced record's text
/// changes; documents whose layout cannot be followed line by line are
/// re-serialized as a whole.
pub fn merge_record(current: &[u8], id_node: &str, id: &str, record: &[u8]) -> Result<String> {
    let mut records = parse_records(current)?;
    let restored: Value = serde_yaml::from_slice(record)?;
    let position = records.iter().position(|existing| node_value(existing, id_node) == id);

    if let Some(merged) = splice_record(current, &records, position, record, &restored) {
        return Ok(merged);
    }

    warn!(id = %id, "Record layout not recognised, rewriting the whole sequence");
    match position {
        Some(index) => records[index] = restored,
        None => records.push(restored),
    }
    serialize_records(records)
}

/// Text-level merge. Returns `None` unless the result parses back to the
/// expected records.
fn splice_record(
    current: &[u8],
    records: &[Value],
    position: Option<usize>,
    record: &[u8],
    restored: &Value,
) -> Option<String> {
    let text = std::str::from_utf8(current).ok()?;
    let record = std::str::from_utf8(record).ok()?;
    let layout = SequenceLayout::scan(text, records)?;

    let (merged, index) = match position {
        Some(index) => (layout.replace(text, index, record)?, index),
        None => (layout.append(text, record), records.len()),
    };

    let expected_len = records.len() + usize::from(position.is_none());
    let reparsed = parse_records(merged.as_bytes()).ok()?;
    (reparsed.len() == expected_len && reparsed.get(index) == Some(restored)).then_some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::snapshot;
    use tempfile::TempDir;

    const AUTOMATIONS: &str = "\
- id: automation_1
  alias: Lights on
- id: automation_2
  alias: Lights off
- id: automation_3
  alias: Heating
";

    // Quoting matters to Home Assistant's YAML 1.1 loader: unquoted `on` is a
    // boolean and unquoted `08:30:00` a sexagesimal integer.
    const R1: &str = "\
- id: \"a1\"
  alias: \"Wake up\"  # weekdays only
  trigger:
    - platform: time
      at: \"08:30:00\"
  action:
    - service: light.turn_on
      data:
        state: 'on'
";
    const R2: &str = "\
- id: \"a2\"
  alias: Lights off
";
    const R3: &str = "\
# Heating follows
- id: \"a3\"
  alias: 'Heating'
  mode: \"single\"
";

    fn automations() -> String {
        format!("# Automations\n{R1}\n{R2}{R3}")
    }

    struct Fixture {
        _config: TempDir,
        _backups: TempDir,
        config_dir: PathBuf,
        store: BackupStore,
        group: GroupSlug,
    }

    fn fixture() -> Fixture {
        let config = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        Fixture {
            config_dir: config.path().to_path_buf(),
            store: BackupStore::new(backups.path()),
            group: GroupSlug::new("automations"),
            _config: config,
            _backups: backups,
        }
    }

    fn store_record(fx: &Fixture, id: &str, content: &str) -> String {
        let snap = snapshot("automations.yaml", id, BackupType::Multiple, content.as_bytes());
        fx.store.save_snapshot(&fx.group, &snap).unwrap()
    }

    #[test]
    fn test_restore_preserves_siblings_and_order() -> Result<()> {
        let fx = fixture();
        let destination = fx.config_dir.join("automations.yaml");
        fs::write(&destination, AUTOMATIONS)?;
        let filename = store_record(&fx, "automation_2", "id: automation_2\nalias: Lights dimmed\n");

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let request = RestoreRequest::new(fx.group.clone(), "automations.yaml", "automation_2", filename);
        restore_snapshot(&fx.store, &fx.config_dir, &options, &request)?;

        let restored = fs::read_to_string(&destination)?;
        let records = parse_records(restored.as_bytes())?;
        let ids: Vec<_> = records.iter().map(|r| node_value(r, "id")).collect();
        assert_eq!(ids, vec!["automation_1", "automation_2", "automation_3"]);
        assert_eq!(node_value(&records[1], "alias"), "Lights dimmed");
        assert_eq!(
            restored,
            "- id: automation_1\n  alias: Lights on\n- id: automation_2\n  alias: Lights dimmed\n- id: automation_3\n  alias: Heating\n"
        );
        Ok(())
    }

    #[test]
    fn test_restore_keeps_sibling_bytes() -> Result<()> {
        let fx = fixture();
        let destination = fx.config_dir.join("automations.yaml");
        let live = automations();
        fs::write(&destination, &live)?;
        let filename = store_record(&fx, "a2", "id: \"a2\"\nalias: Lights dimmed  # restored\n");

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let request = RestoreRequest::new(fx.group.clone(), "automations.yaml", "a2", filename);
        restore_snapshot(&fx.store, &fx.config_dir, &options, &request)?;

        let restored = fs::read_to_string(&destination)?;
        let (head, tail) = live.split_once(R2).unwrap();
        assert_eq!(restored, format!("{head}- id: \"a2\"\n  alias: Lights dimmed  # restored\n{tail}"));
        assert!(restored.contains("at: \"08:30:00\""));
        assert!(restored.contains("state: 'on'"));
        Ok(())
    }

    #[test]
    fn test_extracted_record_restores_byte_for_byte() -> Result<()> {
        let fx = fixture();
        let destination = fx.config_dir.join("automations.yaml");
        let live = automations();
        fs::write(&destination, &live)?;

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let extracted = crate::snapshot::extract(&fx.config_dir, &options)?;
        assert_eq!(extracted.len(), 3);
        let filename = fx.store.save_snapshot(&fx.group, &extracted[0])?;

        // Edit a1 and drop a3, then put a1 back from its snapshot.
        fs::write(&destination, format!("# Automations\n- id: a1\n  alias: Changed\n\n{R2}"))?;
        let request = RestoreRequest::new(fx.group.clone(), "automations.yaml", "a1", filename);
        restore_snapshot(&fx.store, &fx.config_dir, &options, &request)?;
        assert_eq!(fs::read_to_string(&destination)?, format!("# Automations\n{R1}\n{R2}"));
        Ok(())
    }

    #[test]
    fn test_restore_first_and_last_record_keep_positions() -> Result<()> {
        for (index, id) in [(0, "automation_1"), (2, "automation_3")] {
            let merged = merge_record(AUTOMATIONS.as_bytes(), "id", id, format!("id: {id}\nalias: Restored\n").as_bytes())?;
            let records = parse_records(merged.as_bytes())?;
            assert_eq!(records.len(), 3);
            assert_eq!(node_value(&records[index], "id"), id);
            assert_eq!(node_value(&records[index], "alias"), "Restored");
        }
        Ok(())
    }

    #[test]
    fn test_restore_removed_record_appends() -> Result<()> {
        let merged = merge_record(
            AUTOMATIONS.as_bytes(),
            "id",
            "automation_4",
            b"id: automation_4\nalias: Garden\n",
        )?;
        assert_eq!(merged, format!("{AUTOMATIONS}- id: automation_4\n  alias: Garden\n"));

        let live = automations();
        let merged = merge_record(live.as_bytes(), "id", "a4", b"id: a4\nalias: 'Garden'\n")?;
        assert_eq!(merged, format!("{live}- id: a4\n  alias: 'Garden'\n"));
        Ok(())
    }

    #[test]
    fn test_restore_is_idempotent() -> Result<()> {
        let fx = fixture();
        let destination = fx.config_dir.join("automations.yaml");
        fs::write(&destination, AUTOMATIONS)?;
        let filename = store_record(&fx, "automation_4", "id: automation_4\nalias: Garden\n");

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let request = RestoreRequest::new(fx.group.clone(), "automations.yaml", "automation_4", filename);
        restore_snapshot(&fx.store, &fx.config_dir, &options, &request)?;
        let first = fs::read(&destination)?;
        restore_snapshot(&fx.store, &fx.config_dir, &options, &request)?;
        let second = fs::read(&destination)?;

        assert_eq!(first, second);
        assert_eq!(parse_records(&second)?.len(), 4);
        Ok(())
    }

    #[test]
    fn test_restore_into_missing_file_creates_sequence() -> Result<()> {
        let fx = fixture();
        let filename = store_record(&fx, "automation_1", "id: automation_1\nalias: Lights on\n");

        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let request = RestoreRequest::new(fx.group.clone(), "automations.yaml", "automation_1", filename);
        let destination = restore_snapshot(&fx.store, &fx.config_dir, &options, &request)?;

        let records = parse_records(&fs::read(destination)?)?;
        assert_eq!(records.len(), 1);
        Ok(())
    }

    #[test]
    fn test_restore_single_and_directory_overwrite() -> Result<()> {
        let fx = fixture();
        let group = GroupSlug::new("core");

        fs::write(fx.config_dir.join("configuration.yaml"), "broken: [")?;
        let single = snapshot("configuration.yaml", "configuration.yaml", BackupType::Single, b"homeassistant: {}\n");
        let filename = fx.store.save_snapshot(&group, &single)?;
        let request = RestoreRequest::new(group.clone(), "configuration.yaml", "configuration.yaml", filename);
        restore_snapshot(&fx.store, &fx.config_dir, &ConfigBackupOptions::single("configuration.yaml"), &request)?;
        assert_eq!(fs::read(fx.config_dir.join("configuration.yaml"))?, b"homeassistant: {}\n");

        let entry = snapshot(".storage", "core.config", BackupType::Directory, b"{\"version\": 1}");
        let filename = fx.store.save_snapshot(&group, &entry)?;
        let request = RestoreRequest::new(group, ".storage", "core.config", filename);
        let options = ConfigBackupOptions::directory(".storage", &[], &[]);
        let destination = restore_snapshot(&fx.store, &fx.config_dir, &options, &request)?;
        assert_eq!(destination, fx.config_dir.join(".storage").join("core.config"));
        assert_eq!(fs::read(destination)?, b"{\"version\": 1}");
        Ok(())
    }

    #[test]
    fn test_restore_missing_snapshot_is_not_found() {
        let fx = fixture();
        let request = RestoreRequest::new(fx.group.clone(), "automations.yaml", "automation_1", "20240101T120000_000000.yaml");
        let options = ConfigBackupOptions::multiple("automations.yaml", "id", "alias");
        let err = restore_snapshot(&fx.store, &fx.config_dir, &options, &request).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_restore_rejects_non_sequence_destination() -> Result<()> {
        let err = merge_record(b"automation: []\n", "id", "a", b"id: a\n").unwrap_err();
        assert!(matches!(err, HistoryError::InvalidDocument(_)));
        Ok(())
    }

    #[test]
    fn test_restore_into_flow_sequence_falls_back_to_rewrite() -> Result<()> {
        let merged = merge_record(b"[{id: a1, alias: One}, {id: a2, alias: Two}]\n", "id", "a1", b"id: a1\nalias: Uno\n")?;
        let records = parse_records(merged.as_bytes())?;
        assert_eq!(records.len(), 2);
        assert_eq!(node_value(&records[0], "alias"), "Uno");
        assert_eq!(node_value(&records[1], "alias"), "Two");
        Ok(())
    }
}
