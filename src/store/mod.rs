pub mod ids;
pub mod meta;
pub mod shard;

use crate::document::Document;
use crate::error::{Result, ShardboxError};
use crate::filter;
use crate::request::queue::RequestQueue;
use crate::request::RequestCoordinator;
use crate::schema::registry::CompileCtx;
use crate::schema::{DocumentModel, ModelSettings, Schema};
use crate::validation;
use ids::IdCache;
use meta::{CollectionMeta, IdStrategy, MetaModel};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Database-wide configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Default shard size cap for new collections, in bytes.
    pub store_max: u64,
    /// Bounded wait for a request's deferred relation saves.
    pub task_timeout: Duration,
    /// Per-pending-operation admission delay in the request queue.
    pub queue_step: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            store_max: 16_384,
            task_timeout: Duration::from_millis(3000),
            queue_step: Duration::from_millis(1),
        }
    }
}

/// Options for a new collection.
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    pub store_max: Option<u64>,
    pub id_strategy: IdStrategy,
    pub id_max_count: u64,
    pub uid_length: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            store_max: None,
            id_strategy: IdStrategy::Incr,
            id_max_count: 100_000,
            uid_length: 16,
        }
    }
}

/// Read parameters for `find`.
#[derive(Debug, Clone, Default)]
pub struct FindParams {
    pub offset: usize,
    pub limit: Option<usize>,
    pub reverse: bool,
}

/// Shard bookkeeping summary for a collection.
#[derive(Debug, Clone)]
pub struct CollectionResources {
    pub col_name: String,
    pub shards: usize,
    pub documents: usize,
    pub size: u64,
    pub store_max: u64,
}

struct DatabaseInner {
    root: PathBuf,
    name: String,
    config: DatabaseConfig,
    models: RwLock<HashMap<String, Arc<DocumentModel>>>,
    ids: IdCache,
    coordinator: Arc<RequestCoordinator>,
    queues: Mutex<HashMap<String, Arc<RequestQueue>>>,
}

/// The main entry point. Opens a data directory, registers models, and
/// hands out collection handles. Cheap to clone; all clones share the id
/// cache, the pending-request table and the per-collection queues.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (or create) a database directory.
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Database> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let name = root
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("db")
            .to_string();
        log::debug!("opened database '{}' at {}", name, root.display());
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                root,
                name,
                config,
                models: RwLock::new(HashMap::new()),
                ids: IdCache::new(),
                coordinator: Arc::new(RequestCoordinator::new()),
                queues: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Create a collection: its directory, its first shard file and its
    /// meta file.
    pub fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<()> {
        if !valid_collection_name(name) {
            return Err(ShardboxError::Typing(format!(
                "invalid collection name '{name}'"
            )));
        }
        if meta::meta_exists(&self.inner.root, name) {
            return Err(ShardboxError::Other(format!(
                "collection '{name}' already exists"
            )));
        }
        let store_max = options.store_max.unwrap_or(self.inner.config.store_max);
        let model = MetaModel {
            id_strategy: options.id_strategy,
            id_count: 0,
            id_max_count: options.id_max_count,
            uid_length: options.uid_length,
        };
        let collection_meta = CollectionMeta::new(&self.inner.name, name, store_max, model);
        shard::create_shard(&self.inner.root.join(&collection_meta.target))?;
        meta::write_meta(&self.inner.root, &collection_meta)?;
        log::debug!("created collection '{name}' (store_max {store_max} bytes)");
        Ok(())
    }

    /// Get a handle to an existing collection.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        if !meta::meta_exists(&self.inner.root, name) {
            return Err(ShardboxError::Other(format!(
                "collection '{name}' does not exist"
            )));
        }
        let collection_meta = meta::read_meta(&self.inner.root, name)?;
        self.inner.ids.load(name, &collection_meta)?;
        Ok(Collection {
            db: self.clone(),
            name: name.to_string(),
        })
    }

    /// Compile a schema declaration against the registered models.
    pub fn compile_schema(&self, declaration: &Value) -> Result<Schema> {
        let model_collections = self.model_collections()?;
        Schema::compile(
            declaration,
            &CompileCtx {
                models: &model_collections,
            },
        )
    }

    /// Register a pre-compiled schema (use this path to attach custom
    /// validate hooks first).
    pub fn register_model(
        &self,
        name: &str,
        collection: &str,
        schema: Schema,
        settings: ModelSettings,
    ) -> Result<()> {
        if !meta::meta_exists(&self.inner.root, collection) {
            return Err(ShardboxError::Validation(format!(
                "collection '{collection}' does not exist"
            )));
        }
        let mut models = self
            .inner
            .models
            .write()
            .map_err(|_| ShardboxError::Other("model registry lock poisoned".into()))?;
        if models.contains_key(name) {
            return Err(ShardboxError::Schema(format!(
                "model '{name}' is already registered"
            )));
        }
        models.insert(
            name.to_string(),
            Arc::new(DocumentModel {
                name: name.to_string(),
                collection: collection.to_string(),
                schema,
                settings,
            }),
        );
        Ok(())
    }

    /// Compile and register a model in one step.
    pub fn model(
        &self,
        name: &str,
        collection: &str,
        declaration: &Value,
        settings: ModelSettings,
    ) -> Result<()> {
        let schema = self.compile_schema(declaration)?;
        self.register_model(name, collection, schema, settings)
    }

    fn model_collections(&self) -> Result<HashMap<String, String>> {
        let models = self
            .inner
            .models
            .read()
            .map_err(|_| ShardboxError::Other("model registry lock poisoned".into()))?;
        Ok(models
            .values()
            .map(|m| (m.name.clone(), m.collection.clone()))
            .collect())
    }

    pub(crate) fn model_for_collection(&self, collection: &str) -> Option<Arc<DocumentModel>> {
        let models = self.inner.models.read().ok()?;
        models
            .values()
            .find(|m| m.collection == collection)
            .cloned()
    }

    pub(crate) fn root(&self) -> &Path {
        &self.inner.root
    }

    pub(crate) fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub(crate) fn ids(&self) -> &IdCache {
        &self.inner.ids
    }

    pub(crate) fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.inner.coordinator
    }

    /// The collection's single-writer queue, created on first use.
    pub(crate) fn queue(&self, collection: &str) -> Result<Arc<RequestQueue>> {
        let mut queues = self
            .inner
            .queues
            .lock()
            .map_err(|_| ShardboxError::Other("queue table lock poisoned".into()))?;
        if let Some(queue) = queues.get(collection) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(RequestQueue::start(
            collection,
            self.inner.config.queue_step,
        )?);
        queues.insert(collection.to_string(), Arc::clone(&queue));
        Ok(queue)
    }
}

fn valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A handle to one collection. Mutations are serialized through the
/// collection's request queue; reads stream the shards directly.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate and insert one document. Blocks until any deferred
    /// relation saves have completed.
    pub fn add_one(&self, value: Value) -> Result<Document> {
        let db = self.db.clone();
        let col_name = self.name.clone();
        let result = self
            .db
            .queue(&self.name)?
            .run(Box::new(move || validation::add_one(&db, &col_name, value)))?;
        Document::from_data(result)
    }

    /// Validate and insert a batch under one request.
    pub fn add_many(&self, values: Vec<Value>) -> Result<Vec<Document>> {
        let db = self.db.clone();
        let col_name = self.name.clone();
        let result = self
            .db
            .queue(&self.name)?
            .run(Box::new(move || validation::add_many(&db, &col_name, values)))?;
        into_documents(result)
    }

    /// Query documents with a filter token list and read parameters.
    pub fn find(&self, filters: &[&str], params: &FindParams) -> Result<Vec<Document>> {
        let filters = filter::parse_filters(filters)?;
        let docs = validation::find_docs(&self.db, &self.name, &filters, params)?;
        docs.into_iter().map(Document::from_data).collect()
    }

    /// Query documents by a predicate over the array at `path`.
    pub fn find_by_array_path<F>(
        &self,
        path: &str,
        predicate: F,
        params: &FindParams,
    ) -> Result<Vec<Document>>
    where
        F: Fn(&[Value]) -> bool,
    {
        let docs = validation::find_docs(&self.db, &self.name, &None, &FindParams::default())?;
        let mut matched: Vec<Value> = docs
            .into_iter()
            .filter(|doc| {
                filter::get_path(doc, path)
                    .and_then(Value::as_array)
                    .map_or(false, |array| predicate(array))
            })
            .collect();
        if params.reverse {
            matched.reverse();
        }
        let iter = matched.into_iter().skip(params.offset);
        let matched: Vec<Value> = match params.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        };
        matched.into_iter().map(Document::from_data).collect()
    }

    /// Merge `update` into the first matching document.
    pub fn update_one(&self, filters: &[&str], update: Value) -> Result<Option<Document>> {
        let filters = filter::parse_filters(filters)?;
        let db = self.db.clone();
        let col_name = self.name.clone();
        let result = self.db.queue(&self.name)?.run(Box::new(move || {
            validation::update_docs(&db, &col_name, &filters, update, true)
        }))?;
        Ok(into_documents(result)?.into_iter().next())
    }

    /// Merge `update` into every matching document.
    pub fn update_many(&self, filters: &[&str], update: Value) -> Result<Vec<Document>> {
        let filters = filter::parse_filters(filters)?;
        let db = self.db.clone();
        let col_name = self.name.clone();
        let result = self.db.queue(&self.name)?.run(Box::new(move || {
            validation::update_docs(&db, &col_name, &filters, update, false)
        }))?;
        into_documents(result)
    }

    /// Delete the first matching document. Returns the removed count.
    pub fn delete_one(&self, filters: &[&str]) -> Result<u64> {
        self.delete(filters, true)
    }

    /// Delete every matching document. Returns the removed count.
    pub fn delete_many(&self, filters: &[&str]) -> Result<u64> {
        self.delete(filters, false)
    }

    fn delete(&self, filters: &[&str], first_only: bool) -> Result<u64> {
        let filters = filter::parse_filters(filters)?;
        let db = self.db.clone();
        let col_name = self.name.clone();
        let result = self.db.queue(&self.name)?.run(Box::new(move || {
            validation::delete_docs(&db, &col_name, &filters, first_only)
        }))?;
        Ok(result.as_u64().unwrap_or(0))
    }

    /// Append values to the array at `path` in every matching document
    /// (creating the array if absent). Returns the matched-document count.
    pub fn insert_into(&self, filters: &[&str], path: &str, values: Vec<Value>) -> Result<u64> {
        let filters = filter::parse_filters(filters)?;
        let db = self.db.clone();
        let col_name = self.name.clone();
        let path = path.to_string();
        let result = self.db.queue(&self.name)?.run(Box::new(move || {
            validation::insert_into(&db, &col_name, &filters, &path, values)
        }))?;
        Ok(result.as_u64().unwrap_or(0))
    }

    /// Remove elements matching an array-update expression. Returns the
    /// removed element count.
    pub fn remove_from(&self, filters: &[&str], path: &str, expr: &str) -> Result<u64> {
        let filters = filter::parse_filters(filters)?;
        let expr = filter::parse_array_expr(expr)?;
        let db = self.db.clone();
        let col_name = self.name.clone();
        let path = path.to_string();
        let result = self.db.queue(&self.name)?.run(Box::new(move || {
            validation::remove_from(&db, &col_name, &filters, &path, &expr)
        }))?;
        Ok(result.as_u64().unwrap_or(0))
    }

    /// Update array elements matching an array-update expression. Returns
    /// the updated element count.
    pub fn update_array(
        &self,
        filters: &[&str],
        path: &str,
        expr: &str,
        update: Value,
    ) -> Result<u64> {
        let filters = filter::parse_filters(filters)?;
        let expr = filter::parse_array_expr(expr)?;
        let db = self.db.clone();
        let col_name = self.name.clone();
        let path = path.to_string();
        let result = self.db.queue(&self.name)?.run(Box::new(move || {
            validation::update_array(&db, &col_name, &filters, &path, &expr, &update)
        }))?;
        Ok(result.as_u64().unwrap_or(0))
    }

    /// Shard bookkeeping summary, read from the meta file.
    pub fn resources(&self) -> Result<CollectionResources> {
        let collection_meta = meta::read_meta(self.db.root(), &self.name)?;
        Ok(CollectionResources {
            col_name: collection_meta.col_name.clone(),
            shards: collection_meta.stores.len(),
            documents: collection_meta.document_count(),
            size: collection_meta.stores.values().map(|e| e.size).sum(),
            store_max: collection_meta.store_max,
        })
    }

    /// The current meta file contents.
    pub fn meta(&self) -> Result<CollectionMeta> {
        meta::read_meta(self.db.root(), &self.name)
    }
}

fn into_documents(result: Value) -> Result<Vec<Document>> {
    match result {
        Value::Array(docs) => docs.into_iter().map(Document::from_data).collect(),
        other => Err(ShardboxError::Other(format!(
            "expected an array of documents, got {}",
            crate::schema::types::type_name(&other)
        ))),
    }
}
