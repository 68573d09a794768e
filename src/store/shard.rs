// Shard file IO and the insert/split path

use crate::document::Id;
use crate::error::Result;
use crate::store::meta::{self, CollectionMeta, StoreEntry};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;

/// Read a shard file: a JSON array of documents.
pub fn read_shard(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)?;
    let docs: Vec<Value> = serde_json::from_str(&content)?;
    Ok(docs)
}

/// Write a shard file. Compact JSON, so byte sizes stay predictable.
pub fn write_shard(path: &Path, docs: &[Value]) -> Result<()> {
    let content = serde_json::to_string(docs)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Create an empty shard file (and its directory, on first use).
pub fn create_shard(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, "[]")?;
    Ok(())
}

/// Would appending `candidate` push the target shard past `store_max`?
pub fn is_max_size(meta: &CollectionMeta, candidate: &Value) -> Result<bool> {
    let entry = meta.target_entry()?;
    let candidate_len = serde_json::to_string(candidate)?.len() as u64;
    Ok(entry.size + candidate_len > meta.store_max)
}

/// Append documents to the collection, filling the target shard and
/// spilling the remainder into freshly created shards until everything is
/// placed. A document too large for an empty shard is placed alone -
/// splitting it further is impossible. Every shard write is finalized by
/// re-reading the file and rewriting the meta.
pub fn insert_documents(root: &Path, meta: &mut CollectionMeta, docs: Vec<Value>) -> Result<()> {
    let mut remaining: VecDeque<Value> = docs.into();
    while !remaining.is_empty() {
        let target_rel = meta.target.clone();
        let target_abs = root.join(&target_rel);
        let mut shard_docs = read_shard(&target_abs)?;
        let mut size = meta.target_entry()?.size;

        let mut placed = false;
        while let Some(doc) = remaining.front() {
            let doc_len = serde_json::to_string(doc)?.len() as u64 + 1;
            if size + doc_len <= meta.store_max || shard_docs.is_empty() {
                size += doc_len;
                if let Some(doc) = remaining.pop_front() {
                    shard_docs.push(doc);
                }
                placed = true;
            } else {
                break;
            }
        }

        if placed {
            write_shard(&target_abs, &shard_docs)?;
            finalize_shard_write(root, meta, &target_rel)?;
        }

        if !remaining.is_empty() {
            let shard_id = meta.next_shard_id();
            let rel = meta::shard_rel_path(&meta.col_name, shard_id);
            create_shard(&root.join(&rel))?;
            meta.stores.insert(
                shard_id.to_string(),
                StoreEntry {
                    id: shard_id,
                    size: 2,
                    path: rel.clone(),
                    documents: Vec::new(),
                },
            );
            meta.target = rel;
            meta.touch();
            meta::write_meta(root, meta)?;
            log::debug!(
                "collection '{}' split into shard {}",
                meta.col_name,
                shard_id
            );
        }
    }
    Ok(())
}

/// After a successful shard write: re-read the file, recompute its id list
/// and byte size from disk (never trusted from memory), and rewrite the
/// meta with a bumped version.
pub fn finalize_shard_write(root: &Path, meta: &mut CollectionMeta, rel_path: &str) -> Result<()> {
    let abs = root.join(rel_path);
    let docs = read_shard(&abs)?;
    let size = std::fs::metadata(&abs)?.len();
    let ids: Vec<Id> = docs
        .iter()
        .filter_map(|d| d.get("id").and_then(Id::from_value))
        .collect();
    let entry = meta.entry_for_path_mut(rel_path)?;
    entry.documents = ids;
    entry.size = size;
    meta.touch();
    meta::write_meta(root, meta)
}

/// Stream every shard's documents through `transform`, rewriting in place
/// only the shards the transform reports as changed. Returns the total
/// change count.
pub fn rewrite_shards<F>(root: &Path, meta: &mut CollectionMeta, mut transform: F) -> Result<u64>
where
    F: FnMut(&mut Vec<Value>) -> Result<u64>,
{
    let shard_paths: Vec<String> = meta
        .ordered_stores()
        .into_iter()
        .map(|e| e.path.clone())
        .collect();
    let mut affected = 0;
    for rel_path in shard_paths {
        let abs = root.join(&rel_path);
        let mut docs = read_shard(&abs)?;
        let changed = transform(&mut docs)?;
        if changed > 0 {
            write_shard(&abs, &docs)?;
            finalize_shard_write(root, meta, &rel_path)?;
            affected += changed;
        }
    }
    Ok(affected)
}

/// Read every shard in shard-id order and concatenate the documents.
pub fn read_all(root: &Path, meta: &CollectionMeta) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for entry in meta.ordered_stores() {
        let mut docs = read_shard(&root.join(&entry.path))?;
        out.append(&mut docs);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::meta::{IdStrategy, MetaModel};
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(store_max: u64) -> (TempDir, CollectionMeta) {
        let tmp = TempDir::new().unwrap();
        let meta = CollectionMeta::new(
            "db",
            "items",
            store_max,
            MetaModel {
                id_strategy: IdStrategy::Incr,
                id_count: 0,
                id_max_count: 10_000,
                uid_length: 16,
            },
        );
        create_shard(&tmp.path().join(&meta.target)).unwrap();
        meta::write_meta(tmp.path(), &meta).unwrap();
        (tmp, meta)
    }

    fn small_doc(id: u64) -> Value {
        // ~18 bytes serialized
        json!({"id": id, "v": "aaaa"})
    }

    #[test]
    fn test_insert_within_limit() {
        let (tmp, mut meta) = setup(4096);
        insert_documents(tmp.path(), &mut meta, vec![small_doc(1), small_doc(2)]).unwrap();
        assert_eq!(meta.stores.len(), 1);
        assert_eq!(meta.stores["0"].documents, vec![Id::Int(1), Id::Int(2)]);
        let on_disk = read_shard(&tmp.path().join(&meta.target)).unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[test]
    fn test_split_into_multiple_shards() {
        let (tmp, mut meta) = setup(200);
        let docs: Vec<Value> = (1..=11).map(small_doc).collect();
        insert_documents(tmp.path(), &mut meta, docs).unwrap();

        assert!(meta.stores.len() >= 2, "expected a split, got {:?}", meta.stores.keys());
        // every shard respects the cap
        for entry in meta.ordered_stores() {
            assert!(entry.size <= 200, "shard {} is {} bytes", entry.id, entry.size);
        }
        // all 11 ids present exactly once across shards
        let mut all: Vec<Id> = Vec::new();
        for entry in meta.ordered_stores() {
            all.extend(entry.documents.iter().cloned());
        }
        assert_eq!(all.len(), 11);
        let unique: std::collections::HashSet<&Id> = all.iter().collect();
        assert_eq!(unique.len(), 11);
    }

    #[test]
    fn test_oversized_document_placed_alone() {
        let (tmp, mut meta) = setup(64);
        let big = json!({"id": 1, "v": "x".repeat(200)});
        insert_documents(tmp.path(), &mut meta, vec![big, small_doc(2)]).unwrap();
        let first = &meta.stores["0"];
        assert_eq!(first.documents, vec![Id::Int(1)]);
        assert!(first.size > 64);
        // the small doc spilled into a new shard
        assert_eq!(meta.doc_store_path(&Id::Int(2)), Some("items/items.1.json"));
    }

    #[test]
    fn test_meta_matches_disk_after_write() {
        let (tmp, mut meta) = setup(4096);
        insert_documents(tmp.path(), &mut meta, vec![small_doc(1), small_doc(2)]).unwrap();

        // recomputing from the file yields exactly the stored bookkeeping
        let reloaded = meta::read_meta(tmp.path(), "items").unwrap();
        let entry = &reloaded.stores["0"];
        let on_disk = read_shard(&tmp.path().join(&entry.path)).unwrap();
        let ids: Vec<Id> = on_disk
            .iter()
            .filter_map(|d| d.get("id").and_then(Id::from_value))
            .collect();
        assert_eq!(ids, entry.documents);
        let size = std::fs::metadata(tmp.path().join(&entry.path)).unwrap().len();
        assert_eq!(size, entry.size);
    }

    #[test]
    fn test_version_bumps_on_writes() {
        let (tmp, mut meta) = setup(4096);
        let before = meta.version;
        insert_documents(tmp.path(), &mut meta, vec![small_doc(1)]).unwrap();
        assert!(meta.version > before);
    }

    #[test]
    fn test_is_max_size() {
        let (_tmp, mut meta) = setup(20);
        assert!(!is_max_size(&meta, &json!({"id": 1})).unwrap());
        meta.entry_for_path_mut("items/items.0.json").unwrap().size = 18;
        assert!(is_max_size(&meta, &json!({"id": 1})).unwrap());
    }

    #[test]
    fn test_rewrite_only_changed_shards() {
        let (tmp, mut meta) = setup(200);
        let docs: Vec<Value> = (1..=11).map(small_doc).collect();
        insert_documents(tmp.path(), &mut meta, docs).unwrap();
        let versions_before: Vec<(u32, u64)> = meta
            .ordered_stores()
            .iter()
            .map(|e| (e.id, e.size))
            .collect();

        // remove the single document with id 11 (lives in the last shard)
        let removed = rewrite_shards(tmp.path(), &mut meta, |docs| {
            let before = docs.len();
            docs.retain(|d| d.get("id").and_then(Value::as_u64) != Some(11));
            Ok((before - docs.len()) as u64)
        })
        .unwrap();
        assert_eq!(removed, 1);

        // the first shard was untouched
        let first_size = meta.ordered_stores()[0].size;
        assert_eq!(first_size, versions_before[0].1);
    }
}
