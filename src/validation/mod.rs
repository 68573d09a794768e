// Document engine - validates candidates against a model's schema graph,
// decomposing embedded relations into deferred save tasks

use crate::document::Id;
use crate::error::{Result, ShardboxError};
use crate::filter::{self, ArrayExpr, FilterList};
use crate::request::{DeferredTask, TaskOp};
use crate::schema::types::{type_name, ArrayEmbed, ArrayRules, Relation, RelationField, RelationKind, SchemaType};
use crate::schema::{DocumentModel, ModelSettings, Schema};
use crate::store::{meta, shard, Database, FindParams};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Explicit per-call request context, threaded as an ordinary parameter
/// through every nested validation call. Carries the coordinator token and
/// the ids reserved so far (released again if validation fails).
pub(crate) struct RequestCtx {
    token: Uuid,
    resolved_ids: Vec<(String, Id)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Insert,
    Update,
}

// ── Entry points (run inside the collection's request queue) ───────

pub(crate) fn add_one(db: &Database, col_name: &str, value: Value) -> Result<Value> {
    let token = db.coordinator().open_request()?;
    let mut ctx = RequestCtx {
        token,
        resolved_ids: Vec::new(),
    };
    let outcome = build_insert_doc(db, col_name, value, &mut ctx).and_then(|doc| {
        storage_insert(db, col_name, vec![doc.clone()])?;
        Ok(doc)
    });
    settle_request(db, &ctx, outcome)
}

pub(crate) fn add_many(db: &Database, col_name: &str, values: Vec<Value>) -> Result<Value> {
    let token = db.coordinator().open_request()?;
    let mut ctx = RequestCtx {
        token,
        resolved_ids: Vec::new(),
    };
    let outcome: Result<Value> = (|| {
        let mut docs = Vec::with_capacity(values.len());
        for value in values {
            docs.push(build_insert_doc(db, col_name, value, &mut ctx)?);
        }
        storage_insert(db, col_name, docs.clone())?;
        Ok(Value::Array(docs))
    })();
    settle_request(db, &ctx, outcome)
}

pub(crate) fn update_docs(
    db: &Database,
    col_name: &str,
    filters: &Option<FilterList>,
    update: Value,
    first_only: bool,
) -> Result<Value> {
    let update_map = match update {
        Value::Object(map) => map,
        other => {
            return Err(ShardboxError::Typing(format!(
                "update for '{col_name}' must be a JSON object, got {}",
                type_name(&other)
            )))
        }
    };
    if update_map.contains_key("id") {
        return Err(ShardboxError::Validation(
            "the id field cannot be updated".into(),
        ));
    }

    let mut matches = find_docs(db, col_name, filters, &FindParams::default())?;
    if first_only {
        matches.truncate(1);
    }
    if matches.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }

    let token = db.coordinator().open_request()?;
    let mut ctx = RequestCtx {
        token,
        resolved_ids: Vec::new(),
    };
    let update_keys: HashSet<String> = update_map.keys().cloned().collect();
    let outcome: Result<Value> = (|| {
        let model = db.model_for_collection(col_name);
        let mut updated = Vec::with_capacity(matches.len());
        for existing in &matches {
            let existing_map = existing.as_object().ok_or_else(|| {
                ShardboxError::Other(format!("stored document in '{col_name}' is not an object"))
            })?;
            let id = existing.get("id").and_then(Id::from_value).ok_or_else(|| {
                ShardboxError::Other(format!("stored document in '{col_name}' has no id"))
            })?;
            let mut merged = existing_map.clone();
            for (key, value) in &update_map {
                merged.insert(key.clone(), value.clone());
            }
            let validated = match &model {
                Some(model) => {
                    let mut merged_value = Value::Object(merged);
                    inherit_relation_ids(&model.schema, existing, &mut merged_value);
                    let merged_map = merged_value.as_object().cloned().unwrap_or_default();
                    validate_with_model(
                        db,
                        model,
                        &merged_map,
                        &id,
                        &mut ctx,
                        Mode::Update,
                        Some(&update_keys),
                    )?
                }
                None => Value::Object(merged),
            };
            updated.push(validated);
        }

        let mut by_id: HashMap<Id, Value> = HashMap::new();
        for doc in &updated {
            if let Some(id) = doc.get("id").and_then(Id::from_value) {
                by_id.insert(id, doc.clone());
            }
        }
        let mut meta_state = meta::read_meta(db.root(), col_name)?;
        shard::rewrite_shards(db.root(), &mut meta_state, |docs| {
            let mut changed = 0;
            for doc in docs.iter_mut() {
                if let Some(id) = doc.get("id").and_then(Id::from_value) {
                    if let Some(new_doc) = by_id.get(&id) {
                        if doc != new_doc {
                            *doc = new_doc.clone();
                            changed += 1;
                        }
                    }
                }
            }
            Ok(changed)
        })?;
        Ok(Value::Array(updated))
    })();
    settle_request(db, &ctx, outcome)
}

pub(crate) fn delete_docs(
    db: &Database,
    col_name: &str,
    filters: &Option<FilterList>,
    first_only: bool,
) -> Result<Value> {
    let mut meta_state = meta::read_meta(db.root(), col_name)?;
    db.ids().load(col_name, &meta_state)?;
    let mut removed: Vec<Id> = Vec::new();
    let mut stop = false;
    shard::rewrite_shards(db.root(), &mut meta_state, |docs| {
        let mut changed = 0;
        docs.retain(|doc| {
            if stop {
                return true;
            }
            let matched = filters.as_ref().map_or(true, |f| f.matches(doc));
            if !matched {
                return true;
            }
            if let Some(id) = doc.get("id").and_then(Id::from_value) {
                removed.push(id);
            }
            changed += 1;
            if first_only {
                stop = true;
            }
            false
        });
        Ok(changed)
    })?;
    for id in &removed {
        db.ids().remove(col_name, id)?;
    }
    Ok(Value::from(removed.len() as u64))
}

/// Read path: stream every shard through the filter, then apply read
/// parameters. Does not go through the request queue.
pub(crate) fn find_docs(
    db: &Database,
    col_name: &str,
    filters: &Option<FilterList>,
    params: &FindParams,
) -> Result<Vec<Value>> {
    let meta_state = meta::read_meta(db.root(), col_name)?;
    let mut out = Vec::new();
    for entry in meta_state.ordered_stores() {
        let docs = shard::read_shard(&db.root().join(&entry.path))?;
        for doc in docs {
            if filters.as_ref().map_or(true, |f| f.matches(&doc)) {
                out.push(doc);
            }
        }
    }
    if params.reverse {
        out.reverse();
    }
    let iter = out.into_iter().skip(params.offset);
    Ok(match params.limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    })
}

// ── Array mutation ops (storage-level transforms) ──────────────────

pub(crate) fn insert_into(
    db: &Database,
    col_name: &str,
    filters: &Option<FilterList>,
    path: &str,
    values: Vec<Value>,
) -> Result<Value> {
    let mut meta_state = meta::read_meta(db.root(), col_name)?;
    let affected = shard::rewrite_shards(db.root(), &mut meta_state, |docs| {
        let mut changed = 0;
        for doc in docs.iter_mut() {
            if !filters.as_ref().map_or(true, |f| f.matches(doc)) {
                continue;
            }
            match array_at_path(doc, path, true)? {
                Some(array) => {
                    array.extend(values.iter().cloned());
                    changed += 1;
                }
                None => log::warn!("no array at '{path}' in a matching '{col_name}' document"),
            }
        }
        Ok(changed)
    })?;
    Ok(Value::from(affected))
}

pub(crate) fn remove_from(
    db: &Database,
    col_name: &str,
    filters: &Option<FilterList>,
    path: &str,
    expr: &ArrayExpr,
) -> Result<Value> {
    let mut meta_state = meta::read_meta(db.root(), col_name)?;
    let mut total: u64 = 0;
    shard::rewrite_shards(db.root(), &mut meta_state, |docs| {
        let mut changed = 0;
        for doc in docs.iter_mut() {
            if !filters.as_ref().map_or(true, |f| f.matches(doc)) {
                continue;
            }
            if let Some(array) = array_at_path(doc, path, false)? {
                let removed = filter::remove_array_elements(array, expr);
                if removed > 0 {
                    changed += 1;
                    total += removed as u64;
                }
            }
        }
        Ok(changed)
    })?;
    Ok(Value::from(total))
}

pub(crate) fn update_array(
    db: &Database,
    col_name: &str,
    filters: &Option<FilterList>,
    path: &str,
    expr: &ArrayExpr,
    update: &Value,
) -> Result<Value> {
    let mut meta_state = meta::read_meta(db.root(), col_name)?;
    let mut total: u64 = 0;
    shard::rewrite_shards(db.root(), &mut meta_state, |docs| {
        let mut changed = 0;
        for doc in docs.iter_mut() {
            if !filters.as_ref().map_or(true, |f| f.matches(doc)) {
                continue;
            }
            if let Some(array) = array_at_path(doc, path, false)? {
                let updated = filter::update_array_elements(array, expr, update)?;
                if updated > 0 {
                    changed += 1;
                    total += updated as u64;
                }
            }
        }
        Ok(changed)
    })?;
    Ok(Value::from(total))
}

fn array_at_path<'a>(
    doc: &'a mut Value,
    path: &str,
    create: bool,
) -> Result<Option<&'a mut Vec<Value>>> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(p) => filter::get_path_mut(doc, p),
        None => Some(doc),
    };
    let Some(parent) = parent else {
        return Ok(None);
    };
    let Some(obj) = parent.as_object_mut() else {
        return Ok(None);
    };
    if !obj.contains_key(leaf) {
        if !create {
            return Ok(None);
        }
        obj.insert(leaf.to_string(), Value::Array(Vec::new()));
    }
    match obj.get_mut(leaf) {
        Some(Value::Array(array)) => Ok(Some(array)),
        Some(_) => Err(ShardboxError::Typing(format!(
            "field '{path}' is not an array"
        ))),
        None => Ok(None),
    }
}

// ── Storage-level writes (shared by entry points and deferred tasks) ─

/// Persist already-validated documents: sync the incr cursor into the
/// meta, then append with shard splitting.
pub(crate) fn storage_insert(db: &Database, col_name: &str, docs: Vec<Value>) -> Result<Value> {
    let mut meta_state = meta::read_meta(db.root(), col_name)?;
    db.ids().load(col_name, &meta_state)?;
    meta_state.model.id_count = db.ids().cursor(col_name)?;
    shard::insert_documents(db.root(), &mut meta_state, docs.clone())?;
    Ok(Value::Array(docs))
}

fn storage_update_one(db: &Database, col_name: &str, id: &Id, payload: &Value) -> Result<Value> {
    let mut meta_state = meta::read_meta(db.root(), col_name)?;
    db.ids().load(col_name, &meta_state)?;
    let mut updated: Option<Value> = None;
    shard::rewrite_shards(db.root(), &mut meta_state, |docs| {
        let mut changed = 0;
        for doc in docs.iter_mut() {
            if doc.get("id").and_then(Id::from_value).as_ref() != Some(id) {
                continue;
            }
            let mut merged = doc.clone();
            if let (Some(base), Some(src)) = (merged.as_object_mut(), payload.as_object()) {
                for (key, value) in src {
                    if key != "id" {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
            if merged != *doc {
                *doc = merged.clone();
                changed += 1;
            }
            updated = Some(merged);
        }
        Ok(changed)
    })?;
    updated.ok_or_else(|| {
        ShardboxError::Validation(format!("document '{id}' not found in '{col_name}'"))
    })
}

// ── Request lifecycle ──────────────────────────────────────────────

fn settle_request(db: &Database, ctx: &RequestCtx, outcome: Result<Value>) -> Result<Value> {
    match outcome {
        Ok(value) => {
            let tasks = run_tasks(db, ctx.token);
            db.coordinator().close_request(ctx.token);
            tasks.map(|_| value)
        }
        Err(e) => {
            // validation failed before any write: release the reserved ids
            db.coordinator().close_request(ctx.token);
            for (collection, id) in &ctx.resolved_ids {
                let _ = db.ids().remove(collection, id);
            }
            Err(e)
        }
    }
}

fn run_tasks(db: &Database, token: Uuid) -> Result<HashMap<String, Value>> {
    if db.coordinator().task_count(token)? == 0 {
        return Ok(HashMap::new());
    }
    let task_db = db.clone();
    db.coordinator().run_scheduled_tasks(
        token,
        move |op| execute_task(&task_db, op),
        db.config().task_timeout,
    )
}

/// Deferred tasks carry validated documents; execution routes the save
/// through the target collection's own request queue.
fn execute_task(db: &Database, op: &TaskOp) -> Result<Value> {
    match op {
        TaskOp::SaveOne { collection, doc } => queue_insert(db, collection, vec![doc.clone()]),
        TaskOp::SaveMany { collection, docs } => queue_insert(db, collection, docs.clone()),
        TaskOp::UpdateOne {
            collection,
            id,
            doc,
        } => {
            let queue = db.queue(collection)?;
            let task_db = db.clone();
            let col_name = collection.clone();
            let id = id.clone();
            let payload = doc.clone();
            queue.run(Box::new(move || {
                storage_update_one(&task_db, &col_name, &id, &payload)
            }))
        }
    }
}

fn queue_insert(db: &Database, col_name: &str, docs: Vec<Value>) -> Result<Value> {
    let queue = db.queue(col_name)?;
    let task_db = db.clone();
    let col_name = col_name.to_string();
    queue.run(Box::new(move || storage_insert(&task_db, &col_name, docs)))
}

fn schedule(db: &Database, ctx: &RequestCtx, path: &str, op: TaskOp) -> Result<()> {
    db.coordinator().schedule_task(
        ctx.token,
        DeferredTask {
            path: path.to_string(),
            op,
        },
    )
}

// ── Validation traversal ───────────────────────────────────────────

/// Validate a candidate as a new document of `col_name`: resolve the id
/// first (relation fields need the parent id settled), then run the
/// model's schema graph if one is registered.
fn build_insert_doc(
    db: &Database,
    col_name: &str,
    value: Value,
    ctx: &mut RequestCtx,
) -> Result<Value> {
    let input = match value {
        Value::Object(map) => map,
        other => {
            return Err(ShardboxError::Typing(format!(
                "document for '{col_name}' must be a JSON object, got {}",
                type_name(&other)
            )))
        }
    };
    if !meta::meta_exists(db.root(), col_name) {
        return Err(ShardboxError::Validation(format!(
            "collection '{col_name}' does not exist"
        )));
    }
    let meta_state = meta::read_meta(db.root(), col_name)?;
    db.ids().load(col_name, &meta_state)?;
    let id = db.ids().resolve(col_name, &meta_state.model, input.get("id"))?;
    ctx.resolved_ids.push((col_name.to_string(), id.clone()));
    match db.model_for_collection(col_name) {
        Some(model) => validate_with_model(db, &model, &input, &id, ctx, Mode::Insert, None),
        None => {
            let mut out = input;
            out.insert("id".to_string(), id.to_value());
            Ok(Value::Object(out))
        }
    }
}

fn validate_with_model(
    db: &Database,
    model: &Arc<DocumentModel>,
    input: &Map<String, Value>,
    id: &Id,
    ctx: &mut RequestCtx,
    mode: Mode,
    update_keys: Option<&HashSet<String>>,
) -> Result<Value> {
    let mut out = Map::new();
    out.insert("id".to_string(), id.to_value());
    validate_fields(db, model, model.schema.fields(), input, "", &mut out, ctx, mode)?;
    copy_undeclared(&model.settings, model.schema.fields(), input, &mut out, true)?;
    match mode {
        Mode::Insert => stamp_insert(&model.settings, input, &mut out),
        Mode::Update => stamp_update(&model.settings, input, update_keys, &mut out),
    }
    Ok(Value::Object(out))
}

#[allow(clippy::too_many_arguments)]
fn validate_fields(
    db: &Database,
    model: &Arc<DocumentModel>,
    fields: &BTreeMap<String, SchemaType>,
    input: &Map<String, Value>,
    prefix: &str,
    out: &mut Map<String, Value>,
    ctx: &mut RequestCtx,
    mode: Mode,
) -> Result<()> {
    for (name, schema_type) in fields {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        let raw = input.get(name);
        let validated = match schema_type {
            SchemaType::Nested(shape) => match raw {
                None | Some(Value::Null) => None,
                Some(Value::Object(sub)) => {
                    let mut sub_out = Map::new();
                    validate_fields(db, model, &shape.fields, sub, &path, &mut sub_out, ctx, mode)?;
                    copy_undeclared(&model.settings, &shape.fields, sub, &mut sub_out, false)?;
                    Some(Value::Object(sub_out))
                }
                Some(other) => {
                    return Err(ShardboxError::Validation(format!(
                        "field '{path}' expected object, got {}",
                        type_name(other)
                    )))
                }
            },
            SchemaType::Relation(relation_field) => {
                handle_relation(db, ctx, &path, relation_field, raw, mode)?
            }
            SchemaType::Array(rules) => {
                if let Some(ArrayEmbed::Relation(relation)) = &rules.embed {
                    handle_relation_array(db, ctx, &path, rules, relation, raw, mode)?
                } else {
                    validate_leaf(&model.schema, &path, schema_type, name, raw, true)?
                }
            }
            leaf => validate_leaf(&model.schema, &path, leaf, name, raw, true)?,
        };
        if let Some(value) = validated {
            out.insert(name.clone(), value);
        }
    }
    Ok(())
}

/// Leaf validation plus the custom hook: the hook runs exactly once per
/// call, on present values, and its result is re-validated with hooks
/// disabled (the flag is passed down, never shared state).
fn validate_leaf(
    schema: &Schema,
    path: &str,
    schema_type: &SchemaType,
    field: &str,
    raw: Option<&Value>,
    apply_hook: bool,
) -> Result<Option<Value>> {
    let validated = schema_type.validate(field, raw)?;
    if apply_hook && validated.is_some() {
        if let Some(hook) = schema.hook(path) {
            let input = validated.clone().unwrap_or(Value::Null);
            let output = hook(&input)?;
            return validate_leaf(schema, path, schema_type, field, Some(&output), false);
        }
    }
    Ok(validated)
}

fn handle_relation(
    db: &Database,
    ctx: &mut RequestCtx,
    path: &str,
    relation_field: &RelationField,
    raw: Option<&Value>,
    mode: Mode,
) -> Result<Option<Value>> {
    let relation = &relation_field.relation;
    match raw {
        None => {
            if relation_field.required {
                return Err(ShardboxError::Validation(format!(
                    "field '{path}' is required"
                )));
            }
            Ok(None)
        }
        Some(Value::Null) => {
            if relation_field.required {
                return Err(ShardboxError::Validation(format!(
                    "field '{path}' is required and cannot be null"
                )));
            }
            Ok(Some(Value::Null))
        }
        Some(value) if value.is_number() || value.is_string() => {
            let id = Id::from_value(value).ok_or_else(|| {
                ShardboxError::Typing(format!("field '{path}' holds an invalid id"))
            })?;
            ensure_target_exists(db, &relation.target_collection, &id)?;
            Ok(Some(id.to_value()))
        }
        Some(Value::Object(sub)) => {
            if mode == Mode::Update {
                if let Some(existing) = sub.get("id").and_then(Id::from_value) {
                    if db.ids().contains(&relation.target_collection, &existing)? {
                        let payload =
                            validate_update_payload(db, &relation.target_collection, sub)?;
                        schedule(
                            db,
                            ctx,
                            path,
                            TaskOp::UpdateOne {
                                collection: relation.target_collection.clone(),
                                id: existing.clone(),
                                doc: payload,
                            },
                        )?;
                        return Ok(Some(existing.to_value()));
                    }
                }
            }
            let doc =
                build_insert_doc(db, &relation.target_collection, Value::Object(sub.clone()), ctx)?;
            let id_value = doc.get("id").cloned().unwrap_or(Value::Null);
            schedule(
                db,
                ctx,
                path,
                TaskOp::SaveOne {
                    collection: relation.target_collection.clone(),
                    doc,
                },
            )?;
            Ok(Some(id_value))
        }
        Some(other) => Err(ShardboxError::Validation(format!(
            "field '{path}' expected an id or an embedded object, got {}",
            type_name(other)
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_relation_array(
    db: &Database,
    ctx: &mut RequestCtx,
    path: &str,
    rules: &ArrayRules,
    relation: &Relation,
    raw: Option<&Value>,
    mode: Mode,
) -> Result<Option<Value>> {
    let raw = match raw {
        None => {
            if rules.required {
                return Err(ShardboxError::Validation(format!(
                    "field '{path}' is required"
                )));
            }
            return Ok(None);
        }
        Some(value) => value,
    };
    let elements = rules.coerce_elements(path, raw)?;

    let mut ordered: Vec<Id> = Vec::new();
    let mut new_docs: Vec<Value> = Vec::new();
    let mut batch_ids: HashSet<Id> = HashSet::new();
    let mut update_tasks: Vec<(Id, Value)> = Vec::new();

    for element in &elements {
        if element.is_number() || element.is_string() {
            let id = Id::from_value(element).ok_or_else(|| {
                ShardboxError::Typing(format!("field '{path}' holds an invalid id"))
            })?;
            // ref-embedded arrays check every plain id against the cache;
            // document-embedded arrays only de-duplicate
            if relation.kind == RelationKind::Ref {
                ensure_target_exists(db, &relation.target_collection, &id)?;
            }
            push_keep_last(&mut ordered, id);
        } else if let Value::Object(sub) = element {
            if mode == Mode::Update {
                if let Some(existing) = sub.get("id").and_then(Id::from_value) {
                    if db.ids().contains(&relation.target_collection, &existing)? {
                        let payload =
                            validate_update_payload(db, &relation.target_collection, sub)?;
                        update_tasks.push((existing.clone(), payload));
                        push_keep_last(&mut ordered, existing);
                        continue;
                    }
                }
            }
            let doc =
                build_insert_doc(db, &relation.target_collection, Value::Object(sub.clone()), ctx)?;
            let id = doc.get("id").and_then(Id::from_value).ok_or_else(|| {
                ShardboxError::Other(format!("embedded document for '{path}' has no id"))
            })?;
            if !batch_ids.insert(id.clone()) {
                return Err(ShardboxError::Validation(format!(
                    "duplicate id '{id}' in the embedded batch for '{path}'"
                )));
            }
            new_docs.push(doc);
            push_keep_last(&mut ordered, id);
        } else {
            return Err(ShardboxError::Validation(format!(
                "field '{path}' elements must be ids or embedded objects, got {}",
                type_name(element)
            )));
        }
    }

    if !new_docs.is_empty() {
        // all embeds of one path merge into a single save-many task
        schedule(
            db,
            ctx,
            path,
            TaskOp::SaveMany {
                collection: relation.target_collection.clone(),
                docs: new_docs,
            },
        )?;
    }
    for (id, payload) in update_tasks {
        let task_path = format!("{path}.{id}");
        schedule(
            db,
            ctx,
            &task_path,
            TaskOp::UpdateOne {
                collection: relation.target_collection.clone(),
                id,
                doc: payload,
            },
        )?;
    }

    Ok(Some(Value::Array(
        ordered.iter().map(Id::to_value).collect(),
    )))
}

/// Partial update of a related document: leaf-validate the supplied keys
/// against the target model. Nested relation updates are rejected.
fn validate_update_payload(
    db: &Database,
    target_collection: &str,
    sub: &Map<String, Value>,
) -> Result<Value> {
    let Some(model) = db.model_for_collection(target_collection) else {
        let mut out = sub.clone();
        out.remove("id");
        return Ok(Value::Object(out));
    };
    let mut out = Map::new();
    for (key, value) in sub {
        if key == "id" {
            continue;
        }
        match model.schema.fields().get(key) {
            Some(SchemaType::Relation(_)) => {
                return Err(ShardboxError::Validation(format!(
                    "field '{key}': relation updates inside an embedded update are not supported"
                )))
            }
            Some(SchemaType::Array(rules))
                if matches!(rules.embed, Some(ArrayEmbed::Relation(_))) =>
            {
                return Err(ShardboxError::Validation(format!(
                    "field '{key}': relation updates inside an embedded update are not supported"
                )))
            }
            Some(SchemaType::Nested(_)) | None => {
                if model.settings.strict && !model.schema.fields().contains_key(key) {
                    return Err(ShardboxError::Validation(format!(
                        "undeclared field '{key}' rejected by strict mode"
                    )));
                }
                out.insert(key.clone(), value.clone());
            }
            Some(leaf) => {
                if let Some(v) = validate_leaf(&model.schema, key, leaf, key, Some(value), true)? {
                    out.insert(key.clone(), v);
                }
            }
        }
    }
    Ok(Value::Object(out))
}

fn ensure_target_exists(db: &Database, col_name: &str, id: &Id) -> Result<()> {
    if !meta::meta_exists(db.root(), col_name) {
        return Err(ShardboxError::Validation(format!(
            "related collection '{col_name}' does not exist"
        )));
    }
    let meta_state = meta::read_meta(db.root(), col_name)?;
    db.ids().load(col_name, &meta_state)?;
    if db.ids().contains(col_name, id)? {
        Ok(())
    } else {
        Err(ShardboxError::Validation(format!(
            "referenced document '{id}' not found in collection '{col_name}'"
        )))
    }
}

fn push_keep_last(ids: &mut Vec<Id>, id: Id) {
    if let Some(pos) = ids.iter().position(|existing| existing == &id) {
        ids.remove(pos);
    }
    ids.push(id);
}

/// On update, an embedded object for a relation field without an explicit
/// id inherits the id the stored document already points at.
fn inherit_relation_ids(schema: &Schema, existing: &Value, merged: &mut Value) {
    for edge in schema.relations() {
        if edge.in_array {
            continue;
        }
        let Some(existing_id) = filter::get_path(existing, &edge.path).and_then(Id::from_value)
        else {
            continue;
        };
        if let Some(obj) = filter::get_path_mut(merged, &edge.path).and_then(Value::as_object_mut) {
            if !obj.contains_key("id") {
                obj.insert("id".to_string(), existing_id.to_value());
            }
        }
    }
}

fn copy_undeclared(
    settings: &ModelSettings,
    fields: &BTreeMap<String, SchemaType>,
    input: &Map<String, Value>,
    out: &mut Map<String, Value>,
    top_level: bool,
) -> Result<()> {
    for (key, value) in input {
        if fields.contains_key(key) || out.contains_key(key) {
            continue;
        }
        if top_level {
            if key == "id" {
                continue;
            }
            if key == "created_at" && settings.timestamps.created_at {
                continue;
            }
            if key == "updated_at" && settings.timestamps.updated_at {
                continue;
            }
        }
        if settings.strict {
            return Err(ShardboxError::Validation(format!(
                "undeclared field '{key}' rejected by strict mode"
            )));
        }
        out.insert(key.clone(), value.clone());
    }
    Ok(())
}

fn stamp_insert(settings: &ModelSettings, input: &Map<String, Value>, out: &mut Map<String, Value>) {
    let now = Utc::now().to_rfc3339();
    if settings.timestamps.created_at {
        let value = input
            .get("created_at")
            .cloned()
            .unwrap_or_else(|| Value::String(now.clone()));
        out.insert("created_at".to_string(), value);
    }
    if settings.timestamps.updated_at {
        let value = input
            .get("updated_at")
            .cloned()
            .unwrap_or_else(|| Value::String(now.clone()));
        out.insert("updated_at".to_string(), value);
    }
}

fn stamp_update(
    settings: &ModelSettings,
    merged: &Map<String, Value>,
    update_keys: Option<&HashSet<String>>,
    out: &mut Map<String, Value>,
) {
    if settings.timestamps.created_at {
        if let Some(value) = merged.get("created_at") {
            out.insert("created_at".to_string(), value.clone());
        }
    }
    if settings.timestamps.updated_at {
        let explicit = update_keys.map_or(false, |keys| keys.contains("updated_at"));
        let value = if explicit {
            merged.get("updated_at").cloned()
        } else {
            None
        };
        out.insert(
            "updated_at".to_string(),
            value.unwrap_or_else(|| Value::String(Utc::now().to_rfc3339())),
        );
    }
}
