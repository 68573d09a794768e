// Collection meta bookkeeping - the <col>/<col>.meta.json file

use crate::document::Id;
use crate::error::{Result, ShardboxError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// How a collection assigns ids: an incrementing counter or a random
/// string of `uid_length` characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    Incr,
    Uid,
}

/// Id configuration persisted with the collection. `id_count` is the incr
/// cursor, bumped on every insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaModel {
    pub id_strategy: IdStrategy,
    pub id_count: u64,
    pub id_max_count: u64,
    pub uid_length: usize,
}

/// One shard's bookkeeping entry. `size` caches the on-disk byte length
/// and converges after every successful write; `documents` lists the ids
/// stored in the shard, in file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    #[serde(rename = "$id")]
    pub id: u32,
    pub size: u64,
    pub path: String,
    pub documents: Vec<Id>,
}

/// The collection meta file. Invariants: every id in `stores` is unique
/// across the whole mapping, and `target` always names an existing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub db_name: String,
    pub col_name: String,
    pub store_max: u64,
    pub model: MetaModel,
    pub stores: BTreeMap<String, StoreEntry>,
    pub target: String,
    pub version: u64,
    pub timestamp: i64,
}

impl CollectionMeta {
    pub fn new(db_name: &str, col_name: &str, store_max: u64, model: MetaModel) -> CollectionMeta {
        let first = StoreEntry {
            id: 0,
            size: 2,
            path: shard_rel_path(col_name, 0),
            documents: Vec::new(),
        };
        let mut stores = BTreeMap::new();
        let target = first.path.clone();
        stores.insert("0".to_string(), first);
        CollectionMeta {
            db_name: db_name.to_string(),
            col_name: col_name.to_string(),
            store_max,
            model,
            stores,
            target,
            version: 1,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Shard entries in shard-id order (the map is keyed by the decimal
    /// shard id, so lexical key order is not numeric order).
    pub fn ordered_stores(&self) -> Vec<&StoreEntry> {
        let mut entries: Vec<&StoreEntry> = self.stores.values().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn target_entry(&self) -> Result<&StoreEntry> {
        self.stores
            .values()
            .find(|e| e.path == self.target)
            .ok_or_else(|| {
                ShardboxError::Cache(format!(
                    "meta for '{}' has no store entry for its target shard",
                    self.col_name
                ))
            })
    }

    pub fn entry_for_path_mut(&mut self, path: &str) -> Result<&mut StoreEntry> {
        let col_name = self.col_name.clone();
        self.stores
            .values_mut()
            .find(|e| e.path == path)
            .ok_or_else(|| {
                ShardboxError::Cache(format!(
                    "meta for '{col_name}' has no store entry for shard '{path}'"
                ))
            })
    }

    /// Linear scan for the shard holding `id`.
    pub fn doc_store_path(&self, id: &Id) -> Option<&str> {
        self.ordered_stores()
            .into_iter()
            .find(|e| e.documents.contains(id))
            .map(|e| e.path.as_str())
    }

    pub fn next_shard_id(&self) -> u32 {
        self.stores.values().map(|e| e.id).max().map_or(0, |n| n + 1)
    }

    pub fn document_count(&self) -> usize {
        self.stores.values().map(|e| e.documents.len()).sum()
    }

    pub(crate) fn touch(&mut self) {
        self.version += 1;
        self.timestamp = Utc::now().timestamp_millis();
    }
}

pub fn shard_rel_path(col_name: &str, shard_id: u32) -> String {
    format!("{col_name}/{col_name}.{shard_id}.json")
}

pub fn meta_rel_path(col_name: &str) -> String {
    format!("{col_name}/{col_name}.meta.json")
}

pub fn meta_exists(root: &Path, col_name: &str) -> bool {
    root.join(meta_rel_path(col_name)).exists()
}

pub fn read_meta(root: &Path, col_name: &str) -> Result<CollectionMeta> {
    let path = root.join(meta_rel_path(col_name));
    let content = std::fs::read_to_string(&path)?;
    let meta: CollectionMeta = serde_json::from_str(&content)?;
    Ok(meta)
}

pub fn write_meta(root: &Path, meta: &CollectionMeta) -> Result<()> {
    let path = root.join(meta_rel_path(&meta.col_name));
    let content = serde_json::to_string_pretty(meta)?;
    std::fs::write(&path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_meta() -> CollectionMeta {
        CollectionMeta::new(
            "app",
            "users",
            4096,
            MetaModel {
                id_strategy: IdStrategy::Incr,
                id_count: 0,
                id_max_count: 1000,
                uid_length: 16,
            },
        )
    }

    #[test]
    fn test_new_meta_targets_first_shard() {
        let meta = sample_meta();
        assert_eq!(meta.target, "users/users.0.json");
        assert_eq!(meta.version, 1);
        assert!(meta.target_entry().is_ok());
    }

    #[test]
    fn test_meta_round_trip() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("users")).unwrap();
        let mut meta = sample_meta();
        meta.stores.get_mut("0").unwrap().documents = vec![Id::Int(1), Id::Str("x".into())];
        write_meta(tmp.path(), &meta).unwrap();

        let loaded = read_meta(tmp.path(), "users").unwrap();
        assert_eq!(loaded.col_name, "users");
        assert_eq!(loaded.stores["0"].documents, vec![Id::Int(1), Id::Str("x".into())]);
        assert_eq!(loaded.store_max, 4096);
    }

    #[test]
    fn test_serialized_entry_uses_dollar_id() {
        let meta = sample_meta();
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"$id\":0"));
    }

    #[test]
    fn test_ordered_stores_is_numeric() {
        let mut meta = sample_meta();
        for shard_id in [2u32, 10, 1] {
            meta.stores.insert(
                shard_id.to_string(),
                StoreEntry {
                    id: shard_id,
                    size: 2,
                    path: shard_rel_path("users", shard_id),
                    documents: Vec::new(),
                },
            );
        }
        let order: Vec<u32> = meta.ordered_stores().iter().map(|e| e.id).collect();
        assert_eq!(order, vec![0, 1, 2, 10]);
        assert_eq!(meta.next_shard_id(), 11);
    }

    #[test]
    fn test_doc_store_path_scans_in_order() {
        let mut meta = sample_meta();
        meta.stores.get_mut("0").unwrap().documents = vec![Id::Int(1)];
        meta.stores.insert(
            "1".to_string(),
            StoreEntry {
                id: 1,
                size: 2,
                path: shard_rel_path("users", 1),
                documents: vec![Id::Int(2)],
            },
        );
        assert_eq!(meta.doc_store_path(&Id::Int(2)), Some("users/users.1.json"));
        assert_eq!(meta.doc_store_path(&Id::Int(9)), None);
    }
}
