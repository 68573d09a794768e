// In-memory id cache - one entry per collection, owned by the Database

use crate::document::Id;
use crate::error::{Result, ShardboxError};
use crate::store::meta::{CollectionMeta, IdStrategy, MetaModel};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct CollectionIds {
    ids: HashSet<Id>,
    cursor: u64,
}

/// Live id state per collection: the set of ids present in storage and the
/// incr cursor. Guarded by one mutex; resolution registers the id under
/// the same lock as the uniqueness check, so no two resolve calls can
/// observe a duplicate.
pub struct IdCache {
    inner: Mutex<HashMap<String, CollectionIds>>,
}

impl IdCache {
    pub fn new() -> IdCache {
        IdCache {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> Result<MutexGuard<'_, HashMap<String, CollectionIds>>> {
        self.inner
            .lock()
            .map_err(|_| ShardboxError::Cache("id cache lock poisoned".into()))
    }

    /// Populate the cache for a collection from its meta file. A no-op if
    /// the collection is already loaded.
    pub fn load(&self, col_name: &str, meta: &CollectionMeta) -> Result<()> {
        let mut inner = self.locked()?;
        if inner.contains_key(col_name) {
            return Ok(());
        }
        let mut ids = HashSet::new();
        let mut cursor = meta.model.id_count;
        for entry in meta.stores.values() {
            for id in &entry.documents {
                if let Id::Int(n) = id {
                    cursor = cursor.max(*n);
                }
                ids.insert(id.clone());
            }
        }
        inner.insert(col_name.to_string(), CollectionIds { ids, cursor });
        Ok(())
    }

    pub fn contains(&self, col_name: &str, id: &Id) -> Result<bool> {
        let inner = self.locked()?;
        Ok(inner
            .get(col_name)
            .map_or(false, |state| state.ids.contains(id)))
    }

    pub fn remove(&self, col_name: &str, id: &Id) -> Result<()> {
        let mut inner = self.locked()?;
        if let Some(state) = inner.get_mut(col_name) {
            state.ids.remove(id);
        }
        Ok(())
    }

    pub fn cursor(&self, col_name: &str) -> Result<u64> {
        let inner = self.locked()?;
        Ok(inner.get(col_name).map_or(0, |state| state.cursor))
    }

    /// Resolve an id for a new document: validate a supplied id or
    /// generate the next one, registering it atomically with the check.
    pub fn resolve(
        &self,
        col_name: &str,
        model: &MetaModel,
        supplied: Option<&Value>,
    ) -> Result<Id> {
        let mut inner = self.locked()?;
        let state = inner.entry(col_name.to_string()).or_default();
        match (model.id_strategy, supplied) {
            (IdStrategy::Incr, Some(value)) => {
                let n = value.as_u64().ok_or_else(|| {
                    ShardboxError::Typing(format!(
                        "supplied id for '{col_name}' must be an unsigned integer"
                    ))
                })?;
                if n == 0 || n > model.id_max_count {
                    return Err(ShardboxError::Validation(format!(
                        "supplied id {n} is outside 1..={} for '{col_name}'",
                        model.id_max_count
                    )));
                }
                let id = Id::Int(n);
                if state.ids.contains(&id) {
                    return Err(ShardboxError::Cache(format!(
                        "id {n} already exists in '{col_name}'"
                    )));
                }
                state.cursor = state.cursor.max(n);
                state.ids.insert(id.clone());
                Ok(id)
            }
            (IdStrategy::Incr, None) => {
                let n = state.cursor + 1;
                if n > model.id_max_count {
                    return Err(ShardboxError::Cache(format!(
                        "id space exhausted for '{col_name}' (id_max_count {})",
                        model.id_max_count
                    )));
                }
                state.cursor = n;
                let id = Id::Int(n);
                state.ids.insert(id.clone());
                Ok(id)
            }
            (IdStrategy::Uid, Some(value)) => {
                let s = value.as_str().ok_or_else(|| {
                    ShardboxError::Typing(format!(
                        "supplied id for '{col_name}' must be a string"
                    ))
                })?;
                if s.is_empty() {
                    return Err(ShardboxError::Validation(format!(
                        "supplied id for '{col_name}' must not be empty"
                    )));
                }
                let id = Id::Str(s.to_string());
                if state.ids.contains(&id) {
                    return Err(ShardboxError::Cache(format!(
                        "id '{s}' already exists in '{col_name}'"
                    )));
                }
                state.ids.insert(id.clone());
                Ok(id)
            }
            (IdStrategy::Uid, None) => {
                // regenerate on collision
                loop {
                    let s = nanoid::nanoid!((model.uid_length));
                    let id = Id::Str(s);
                    if !state.ids.contains(&id) {
                        state.ids.insert(id.clone());
                        return Ok(id);
                    }
                }
            }
        }
    }
}

impl Default for IdCache {
    fn default() -> Self {
        IdCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn incr_model(max: u64) -> MetaModel {
        MetaModel {
            id_strategy: IdStrategy::Incr,
            id_count: 0,
            id_max_count: max,
            uid_length: 16,
        }
    }

    fn uid_model(len: usize) -> MetaModel {
        MetaModel {
            id_strategy: IdStrategy::Uid,
            id_count: 0,
            id_max_count: 0,
            uid_length: len,
        }
    }

    #[test]
    fn test_incr_generates_sequence() {
        let cache = IdCache::new();
        let model = incr_model(100);
        assert_eq!(cache.resolve("c", &model, None).unwrap(), Id::Int(1));
        assert_eq!(cache.resolve("c", &model, None).unwrap(), Id::Int(2));
        assert_eq!(cache.cursor("c").unwrap(), 2);
    }

    #[test]
    fn test_incr_supplied_id_checked() {
        let cache = IdCache::new();
        let model = incr_model(100);
        assert_eq!(cache.resolve("c", &model, Some(&json!(7))).unwrap(), Id::Int(7));
        // duplicate
        assert!(matches!(
            cache.resolve("c", &model, Some(&json!(7))),
            Err(ShardboxError::Cache(_))
        ));
        // wrong type
        assert!(matches!(
            cache.resolve("c", &model, Some(&json!("x"))),
            Err(ShardboxError::Typing(_))
        ));
        // out of range
        assert!(cache.resolve("c", &model, Some(&json!(101))).is_err());
        // generation continues past the supplied id
        assert_eq!(cache.resolve("c", &model, None).unwrap(), Id::Int(8));
    }

    #[test]
    fn test_incr_exhaustion() {
        let cache = IdCache::new();
        let model = incr_model(2);
        cache.resolve("c", &model, None).unwrap();
        cache.resolve("c", &model, None).unwrap();
        assert!(matches!(
            cache.resolve("c", &model, None),
            Err(ShardboxError::Cache(_))
        ));
    }

    #[test]
    fn test_uid_generation() {
        let cache = IdCache::new();
        let model = uid_model(10);
        let a = cache.resolve("c", &model, None).unwrap();
        let b = cache.resolve("c", &model, None).unwrap();
        assert_ne!(a, b);
        match &a {
            Id::Str(s) => assert_eq!(s.chars().count(), 10),
            other => panic!("expected string id, got {other:?}"),
        }
    }

    #[test]
    fn test_uid_supplied_uniqueness() {
        let cache = IdCache::new();
        let model = uid_model(10);
        cache.resolve("c", &model, Some(&json!("abc"))).unwrap();
        assert!(cache.resolve("c", &model, Some(&json!("abc"))).is_err());
        assert!(cache.resolve("c", &model, Some(&json!(""))).is_err());
    }

    #[test]
    fn test_load_from_meta_sets_cursor() {
        use crate::store::meta::CollectionMeta;
        let mut meta = CollectionMeta::new("db", "c", 4096, incr_model(100));
        meta.stores.get_mut("0").unwrap().documents = vec![Id::Int(3), Id::Int(5)];
        let cache = IdCache::new();
        cache.load("c", &meta).unwrap();
        assert!(cache.contains("c", &Id::Int(5)).unwrap());
        assert_eq!(cache.resolve("c", &meta.model, None).unwrap(), Id::Int(6));
    }

    #[test]
    fn test_remove() {
        let cache = IdCache::new();
        let model = incr_model(100);
        let id = cache.resolve("c", &model, None).unwrap();
        cache.remove("c", &id).unwrap();
        assert!(!cache.contains("c", &id).unwrap());
    }
}
