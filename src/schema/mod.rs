pub mod registry;
pub mod types;

use crate::error::{Result, ShardboxError};
use registry::CompileCtx;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use types::{RelationEdge, SchemaType};

/// A caller-supplied validator for one field. Runs exactly once per
/// validation call; its result is re-validated against the field's rules.
pub type ValidateHook = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// A compiled schema: a field graph plus the relation edges discovered
/// while compiling it. The `id` field is implicit and may not be declared.
#[derive(Clone)]
pub struct Schema {
    fields: BTreeMap<String, SchemaType>,
    relations: Vec<RelationEdge>,
    hooks: HashMap<String, ValidateHook>,
}

impl Schema {
    /// Compile a declaration tree. Relation markers resolve against the
    /// models in `ctx`; anything invalid aborts compilation entirely.
    pub fn compile(declaration: &Value, ctx: &CompileCtx<'_>) -> Result<Schema> {
        let map = declaration.as_object().ok_or_else(|| {
            ShardboxError::Schema("schema declaration must be a JSON object".into())
        })?;
        if map.contains_key("id") {
            return Err(ShardboxError::Schema(
                "the 'id' field is implicit and cannot be declared".into(),
            ));
        }
        let mut fields = BTreeMap::new();
        let mut relations = Vec::new();
        for (name, field_declaration) in map {
            let (field, mut edges) = registry::compile_field(name, field_declaration, ctx)?;
            relations.append(&mut edges);
            fields.insert(name.clone(), field);
        }
        Ok(Schema {
            fields,
            relations,
            hooks: HashMap::new(),
        })
    }

    pub fn fields(&self) -> &BTreeMap<String, SchemaType> {
        &self.fields
    }

    pub fn relations(&self) -> &[RelationEdge] {
        &self.relations
    }

    pub fn hook(&self, path: &str) -> Option<&ValidateHook> {
        self.hooks.get(path)
    }

    /// Attach a custom validator to the field at `path` (dotted for nested
    /// fields). Declarations are plain JSON data, so validators are
    /// attached here rather than declared.
    pub fn set_hook<F>(&mut self, path: &str, hook: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        if !self.has_field(path) {
            return Err(ShardboxError::Schema(format!(
                "cannot attach a validator: no field at path '{path}'"
            )));
        }
        self.hooks.insert(path.to_string(), Arc::new(hook));
        Ok(())
    }

    fn has_field(&self, path: &str) -> bool {
        let mut segments = path.split('.');
        let first = match segments.next() {
            Some(s) => s,
            None => return false,
        };
        let mut current = match self.fields.get(first) {
            Some(field) => field,
            None => return false,
        };
        for segment in segments {
            match current {
                SchemaType::Nested(shape) => match shape.fields.get(segment) {
                    Some(field) => current = field,
                    None => return false,
                },
                _ => return false,
            }
        }
        true
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.fields)
            .field("relations", &self.relations)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Automatic timestamp stamping per model.
#[derive(Debug, Clone, Copy)]
pub struct Timestamps {
    pub created_at: bool,
    pub updated_at: bool,
}

impl Default for Timestamps {
    fn default() -> Self {
        Timestamps {
            created_at: true,
            updated_at: true,
        }
    }
}

/// Per-model settings. `strict` rejects undeclared fields when true and
/// passes them through when false.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSettings {
    pub strict: bool,
    pub timestamps: Timestamps,
}

/// A registered model: a compiled schema bound to a collection. Immutable
/// after registration.
#[derive(Debug, Clone)]
pub struct DocumentModel {
    pub name: String,
    pub collection: String,
    pub schema: Schema,
    pub settings: ModelSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(declaration: Value) -> Result<Schema> {
        let models = HashMap::new();
        Schema::compile(&declaration, &CompileCtx { models: &models })
    }

    #[test]
    fn test_compile_collects_relations() {
        let schema = compile(json!({
            "title": {"type": "string", "required": true},
            "author": {"$ref": "authors"},
            "meta": {"reviewer": {"$ref": "users"}}
        }))
        .unwrap();
        assert_eq!(schema.fields().len(), 3);
        let paths: Vec<&str> = schema.relations().iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"author"));
        assert!(paths.contains(&"meta.reviewer"));
    }

    #[test]
    fn test_id_declaration_rejected() {
        assert!(compile(json!({"id": "incr"})).is_err());
    }

    #[test]
    fn test_bad_field_aborts_whole_schema() {
        assert!(compile(json!({
            "ok": "string",
            "bad": {"type": "string", "shout": true}
        }))
        .is_err());
    }

    #[test]
    fn test_hook_attachment_checks_path() {
        let mut schema = compile(json!({
            "name": "string",
            "address": {"city": "string"}
        }))
        .unwrap();
        assert!(schema.set_hook("name", |v| Ok(v.clone())).is_ok());
        assert!(schema.set_hook("address.city", |v| Ok(v.clone())).is_ok());
        assert!(schema.set_hook("missing", |v| Ok(v.clone())).is_err());
        assert!(schema.hook("name").is_some());
    }
}
