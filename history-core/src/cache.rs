//! In-memory summaries of every tracked unit, rebuilt from the store layout
//! at startup.

use crate::model::{BackupConfigSummary, BackupType, ConfigBackupIdentifier, ConfigBackupOptions, ConfigGroup, GroupSlug};
use crate::snapshot::yaml::node_value;
use crate::store::retention::recompute_summary;
use crate::store::BackupStore;
use crate::utils::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub type SummaryMap = HashMap<ConfigBackupIdentifier, BackupConfigSummary>;

/// Summaries keyed by group, then identifier, behind one reader/writer lock.
#[derive(Default)]
pub struct SummaryCache {
    inner: RwLock<HashMap<GroupSlug, SummaryMap>>,
}

impl SummaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild every summary from the store. Units no longer configured are
    /// still loaded so their history stays reachable.
    pub fn load(store: &BackupStore, groups: &[ConfigGroup]) -> Result<Self> {
        let mut map: HashMap<GroupSlug, SummaryMap> = HashMap::new();
        let mut loaded = 0;

        for slug in store.list_groups()? {
            for identifier in store.list_identifiers(&slug)? {
                let options = find_options(groups, &slug, &identifier.path);
                let backup_type = options
                    .map(|o| o.backup_type)
                    .unwrap_or_else(|| infer_backup_type(&identifier));

                let summary = match recompute_summary(store, &slug, &identifier, &identifier.id, backup_type) {
                    Ok(Some(summary)) => summary,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(group = %slug, identifier = %identifier, error = %e, "Skipping unreadable backups");
                        continue;
                    }
                };
                let friendly_name = friendly_name_for(store, &slug, &identifier, options);

                map.entry(slug.clone())
                    .or_default()
                    .insert(identifier, BackupConfigSummary { friendly_name, ..summary });
                loaded += 1;
            }
        }

        info!(groups = map.len(), summaries = loaded, "Loaded backup summaries");
        Ok(Self {
            inner: RwLock::new(map),
        })
    }

    pub async fn get(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) -> Option<BackupConfigSummary> {
        self.inner
            .read()
            .await
            .get(group)
            .and_then(|summaries| summaries.get(identifier))
            .cloned()
    }

    /// Insert or replace, or remove the entry entirely when `summary` is `None`.
    pub async fn set(
        &self,
        group: &GroupSlug,
        identifier: &ConfigBackupIdentifier,
        summary: Option<BackupConfigSummary>,
    ) {
        let mut map = self.inner.write().await;
        match summary {
            Some(summary) => {
                map.entry(group.clone())
                    .or_default()
                    .insert(identifier.clone(), summary);
            }
            None => {
                if let Some(summaries) = map.get_mut(group) {
                    summaries.remove(identifier);
                    if summaries.is_empty() {
                        map.remove(group);
                    }
                }
            }
        }
    }

    pub async fn remove(&self, group: &GroupSlug, identifier: &ConfigBackupIdentifier) {
        self.set(group, identifier, None).await;
    }

    /// Summaries of one group sorted by friendly name.
    pub async fn list_group(&self, group: &GroupSlug) -> Vec<BackupConfigSummary> {
        let mut summaries: Vec<_> = self
            .inner
            .read()
            .await
            .get(group)
            .map(|summaries| summaries.values().cloned().collect())
            .unwrap_or_default();
        summaries.sort_by(|a, b| a.friendly_name.cmp(&b.friendly_name));
        summaries
    }

    /// Every group with its summaries sorted by friendly name.
    pub async fn snapshot_all(&self) -> HashMap<GroupSlug, Vec<BackupConfigSummary>> {
        let map = self.inner.read().await;
        map.iter()
            .map(|(slug, summaries)| {
                let mut list: Vec<_> = summaries.values().cloned().collect();
                list.sort_by(|a, b| a.friendly_name.cmp(&b.friendly_name));
                (slug.clone(), list)
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn find_options<'a>(groups: &'a [ConfigGroup], slug: &GroupSlug, path: &str) -> Option<&'a ConfigBackupOptions> {
    groups
        .iter()
        .filter(|group| &group.slug() == slug)
        .flat_map(|group| group.configs.iter())
        .find(|options| options.path == path)
}

fn infer_backup_type(identifier: &ConfigBackupIdentifier) -> BackupType {
    if identifier.id == identifier.path {
        BackupType::Single
    } else {
        BackupType::Directory
    }
}

/// Display name of a unit as the extractor would produce it; record names
/// are read back from the newest snapshot.
fn friendly_name_for(
    store: &BackupStore,
    slug: &GroupSlug,
    identifier: &ConfigBackupIdentifier,
    options: Option<&ConfigBackupOptions>,
) -> String {
    let Some(options) = options.filter(|o| o.backup_type == BackupType::Multiple) else {
        return identifier.id.clone();
    };
    let Some(key) = options.friendly_name_node.as_deref().or(options.id_node.as_deref()) else {
        return identifier.id.clone();
    };

    match store.latest_snapshot(slug, identifier) {
        Ok(Some((_, content))) => serde_yaml::from_slice::<serde_yaml::Value>(&content)
            .map(|record| node_value(&record, key))
            .unwrap_or_else(|_| identifier.id.clone()),
        _ => identifier.id.clone(),
    }
}
