// Type registry - maps declaration markers to SchemaType constructors

use crate::error::{Result, ShardboxError};
use crate::schema::types::{
    ArrayEmbed, ArrayRules, CommonRules, NestedObject, NumberRules, Relation, RelationEdge,
    RelationField, RelationKind, SchemaType, StringRules,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Compilation context: the models already registered on the database,
/// mapped to their collection names. Markers that are not built-in type
/// tags resolve against this map as document relations.
pub struct CompileCtx<'a> {
    pub models: &'a HashMap<String, String>,
}

const STRING_RULES: &[&str] = &[
    "type",
    "required",
    "default",
    "enum",
    "min_length",
    "max_length",
    "trim",
    "lowercase",
    "capitalize",
];
const NUMBER_RULES: &[&str] = &["type", "required", "default", "enum", "min", "max"];
const VALUE_RULES: &[&str] = &["type", "required", "default"];
const ARRAY_RULES: &[&str] = &["type", "required", "embed", "min_length", "max_length"];
const ID_RULES: &[&str] = &["type"];
const REF_RULES: &[&str] = &["$ref", "required"];
const RELATION_RULES: &[&str] = &["type", "required"];

const PRIMITIVE_MARKERS: &[&str] = &["string", "number", "boolean", "date", "any"];

/// Compile one field declaration. A declaration is a bare marker string,
/// an object with a `type` marker plus rules, a `$ref` descriptor, or an
/// object without `type`/`$ref` (a nested-object declaration). Returns the
/// compiled field and every relation edge discovered beneath it.
pub fn compile_field(
    path: &str,
    declaration: &Value,
    ctx: &CompileCtx<'_>,
) -> Result<(SchemaType, Vec<RelationEdge>)> {
    match declaration {
        Value::String(marker) => compile_marker(path, marker, &Map::new(), ctx),
        Value::Object(map) => {
            if map.contains_key("$ref") {
                compile_ref(path, map)
            } else if let Some(marker) = map.get("type") {
                let marker = marker.as_str().ok_or_else(|| {
                    ShardboxError::Schema(format!(
                        "the type marker for field '{path}' must be a string"
                    ))
                })?;
                compile_marker(path, marker, map, ctx)
            } else {
                compile_nested(path, map, ctx)
            }
        }
        other => Err(ShardboxError::Schema(format!(
            "invalid declaration for field '{path}': expected a marker or object, got {}",
            crate::schema::types::type_name(other)
        ))),
    }
}

fn compile_marker(
    path: &str,
    marker: &str,
    rules: &Map<String, Value>,
    ctx: &CompileCtx<'_>,
) -> Result<(SchemaType, Vec<RelationEdge>)> {
    match marker {
        "string" => Ok((build_string(path, rules)?, Vec::new())),
        "number" => Ok((build_number(path, rules)?, Vec::new())),
        "boolean" => {
            check_keys(path, rules, VALUE_RULES)?;
            let st = SchemaType::Boolean(common_rules(path, rules)?);
            Ok((finalize_default(path, st)?, Vec::new()))
        }
        "date" => {
            check_keys(path, rules, VALUE_RULES)?;
            let st = SchemaType::Date(common_rules(path, rules)?);
            Ok((finalize_default(path, st)?, Vec::new()))
        }
        "any" => {
            check_keys(path, rules, VALUE_RULES)?;
            let st = SchemaType::Any(common_rules(path, rules)?);
            Ok((finalize_default(path, st)?, Vec::new()))
        }
        "array" => build_array(path, rules, ctx),
        "incr" => {
            check_keys(path, rules, ID_RULES)?;
            Ok((SchemaType::Incr, Vec::new()))
        }
        "uid" => {
            check_keys(path, rules, ID_RULES)?;
            Ok((SchemaType::Uid, Vec::new()))
        }
        model_name => {
            check_keys(path, rules, RELATION_RULES)?;
            let collection = ctx.models.get(model_name).ok_or_else(|| {
                ShardboxError::Schema(format!(
                    "unknown type marker '{model_name}' for field '{path}'"
                ))
            })?;
            let relation = Relation {
                kind: RelationKind::Document,
                target_model: Some(model_name.to_string()),
                target_collection: collection.clone(),
            };
            let edge = RelationEdge {
                path: path.to_string(),
                kind: RelationKind::Document,
                target_model: relation.target_model.clone(),
                target_collection: relation.target_collection.clone(),
                in_array: false,
            };
            let field = RelationField {
                relation,
                required: rule_bool(path, rules, "required")?,
            };
            Ok((SchemaType::Relation(field), vec![edge]))
        }
    }
}

fn compile_ref(path: &str, rules: &Map<String, Value>) -> Result<(SchemaType, Vec<RelationEdge>)> {
    check_keys(path, rules, REF_RULES)?;
    let target = rules.get("$ref").and_then(Value::as_str).ok_or_else(|| {
        ShardboxError::Schema(format!(
            "'$ref' for field '{path}' must be a collection name string"
        ))
    })?;
    let relation = Relation {
        kind: RelationKind::Ref,
        target_model: None,
        target_collection: target.to_string(),
    };
    let edge = RelationEdge {
        path: path.to_string(),
        kind: RelationKind::Ref,
        target_model: None,
        target_collection: target.to_string(),
        in_array: false,
    };
    let field = RelationField {
        relation,
        required: rule_bool(path, rules, "required")?,
    };
    Ok((SchemaType::Relation(field), vec![edge]))
}

fn compile_nested(
    path: &str,
    map: &Map<String, Value>,
    ctx: &CompileCtx<'_>,
) -> Result<(SchemaType, Vec<RelationEdge>)> {
    let mut fields = BTreeMap::new();
    let mut edges = Vec::new();
    for (name, declaration) in map {
        let child_path = format!("{path}.{name}");
        let (field, mut child_edges) = compile_field(&child_path, declaration, ctx)?;
        edges.append(&mut child_edges);
        fields.insert(name.clone(), field);
    }
    Ok((SchemaType::Nested(NestedObject { fields }), edges))
}

fn build_string(path: &str, rules: &Map<String, Value>) -> Result<SchemaType> {
    check_keys(path, rules, STRING_RULES)?;
    let built = StringRules {
        common: common_rules(path, rules)?,
        enum_values: rule_string_enum(path, rules)?,
        min_length: rule_usize(path, rules, "min_length")?,
        max_length: rule_usize(path, rules, "max_length")?,
        trim: rule_bool(path, rules, "trim")?,
        lowercase: rule_bool(path, rules, "lowercase")?,
        capitalize: rule_bool(path, rules, "capitalize")?,
    };
    if built.lowercase && built.capitalize {
        return Err(ShardboxError::Schema(format!(
            "'lowercase' and 'capitalize' are mutually exclusive for field '{path}'"
        )));
    }
    if let (Some(min), Some(max)) = (built.min_length, built.max_length) {
        if min > max {
            return Err(ShardboxError::Schema(format!(
                "min_length exceeds max_length for field '{path}'"
            )));
        }
    }
    finalize_default(path, SchemaType::String(built))
}

fn build_number(path: &str, rules: &Map<String, Value>) -> Result<SchemaType> {
    check_keys(path, rules, NUMBER_RULES)?;
    let built = NumberRules {
        common: common_rules(path, rules)?,
        enum_values: rule_number_enum(path, rules)?,
        min: rule_f64(path, rules, "min")?,
        max: rule_f64(path, rules, "max")?,
    };
    if let (Some(min), Some(max)) = (built.min, built.max) {
        if min > max {
            return Err(ShardboxError::Schema(format!(
                "min exceeds max for field '{path}'"
            )));
        }
    }
    finalize_default(path, SchemaType::Number(built))
}

fn build_array(
    path: &str,
    rules: &Map<String, Value>,
    ctx: &CompileCtx<'_>,
) -> Result<(SchemaType, Vec<RelationEdge>)> {
    check_keys(path, rules, ARRAY_RULES)?;
    let (embed, edges) = match rules.get("embed") {
        None => (None, Vec::new()),
        Some(declaration) => {
            let (embed, edges) = compile_embed(path, declaration, ctx)?;
            (Some(embed), edges)
        }
    };
    let built = ArrayRules {
        required: rule_bool(path, rules, "required")?,
        embed,
        min_length: rule_usize(path, rules, "min_length")?,
        max_length: rule_usize(path, rules, "max_length")?,
    };
    if let (Some(min), Some(max)) = (built.min_length, built.max_length) {
        if min > max {
            return Err(ShardboxError::Schema(format!(
                "min_length exceeds max_length for field '{path}'"
            )));
        }
    }
    Ok((SchemaType::Array(built), edges))
}

fn compile_embed(
    path: &str,
    declaration: &Value,
    ctx: &CompileCtx<'_>,
) -> Result<(ArrayEmbed, Vec<RelationEdge>)> {
    match declaration {
        Value::String(marker) if PRIMITIVE_MARKERS.contains(&marker.as_str()) => {
            let (primitive, _) = compile_marker(path, marker, &Map::new(), ctx)?;
            Ok((ArrayEmbed::Primitive(Box::new(primitive)), Vec::new()))
        }
        Value::String(marker) => {
            let collection = ctx.models.get(marker).ok_or_else(|| {
                ShardboxError::Schema(format!(
                    "unknown embed marker '{marker}' for field '{path}'"
                ))
            })?;
            let relation = Relation {
                kind: RelationKind::Document,
                target_model: Some(marker.clone()),
                target_collection: collection.clone(),
            };
            let edge = RelationEdge {
                path: path.to_string(),
                kind: RelationKind::Document,
                target_model: Some(marker.clone()),
                target_collection: collection.clone(),
                in_array: true,
            };
            Ok((ArrayEmbed::Relation(relation), vec![edge]))
        }
        Value::Array(inner) if inner.len() == 1 => {
            // one level of nested primitive arrays
            match compile_embed(path, &inner[0], ctx)? {
                (ArrayEmbed::Primitive(primitive), _) => {
                    Ok((ArrayEmbed::PrimitiveList(primitive), Vec::new()))
                }
                _ => Err(ShardboxError::Schema(format!(
                    "nested array embeds for field '{path}' must be primitive"
                ))),
            }
        }
        Value::Object(map) if map.contains_key("$ref") => {
            check_keys(path, map, &["$ref"])?;
            let target = map.get("$ref").and_then(Value::as_str).ok_or_else(|| {
                ShardboxError::Schema(format!(
                    "'$ref' embed for field '{path}' must be a collection name string"
                ))
            })?;
            let relation = Relation {
                kind: RelationKind::Ref,
                target_model: None,
                target_collection: target.to_string(),
            };
            let edge = RelationEdge {
                path: path.to_string(),
                kind: RelationKind::Ref,
                target_model: None,
                target_collection: target.to_string(),
                in_array: true,
            };
            Ok((ArrayEmbed::Relation(relation), vec![edge]))
        }
        Value::Object(map) if map.contains_key("type") => {
            let (field, edges) = compile_field(path, declaration, ctx)?;
            if !edges.is_empty() {
                return Err(ShardboxError::Schema(format!(
                    "relation embeds for field '{path}' take a bare marker, not rules"
                )));
            }
            match field {
                SchemaType::String(_)
                | SchemaType::Number(_)
                | SchemaType::Boolean(_)
                | SchemaType::Date(_)
                | SchemaType::Any(_) => Ok((ArrayEmbed::Primitive(Box::new(field)), Vec::new())),
                _ => Err(ShardboxError::Schema(format!(
                    "only primitive types may carry rules in the embed for field '{path}'"
                ))),
            }
        }
        Value::Object(map) => {
            let (field, edges) = compile_nested(path, map, ctx)?;
            if !edges.is_empty() {
                return Err(ShardboxError::Schema(format!(
                    "relations are not supported inside array-embedded objects ('{path}')"
                )));
            }
            match field {
                SchemaType::Nested(shape) => Ok((ArrayEmbed::Nested(shape), Vec::new())),
                _ => Err(ShardboxError::Schema(format!(
                    "invalid embed declaration for field '{path}'"
                ))),
            }
        }
        other => Err(ShardboxError::Schema(format!(
            "invalid embed declaration for field '{path}': got {}",
            crate::schema::types::type_name(other)
        ))),
    }
}

// ── Rule extraction helpers ────────────────────────────────────────

fn check_keys(path: &str, rules: &Map<String, Value>, allowed: &[&str]) -> Result<()> {
    for key in rules.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(ShardboxError::Schema(format!(
                "unknown rule '{key}' for field '{path}'"
            )));
        }
    }
    Ok(())
}

fn common_rules(path: &str, rules: &Map<String, Value>) -> Result<CommonRules> {
    Ok(CommonRules {
        required: rule_bool(path, rules, "required")?,
        default: rules.get("default").cloned(),
    })
}

fn rule_bool(path: &str, rules: &Map<String, Value>, key: &str) -> Result<bool> {
    match rules.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ShardboxError::Schema(format!(
            "rule '{key}' for field '{path}' must be a boolean"
        ))),
    }
}

fn rule_usize(path: &str, rules: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match rules.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(|n| Some(n as usize)).ok_or_else(|| {
            ShardboxError::Schema(format!(
                "rule '{key}' for field '{path}' must be an unsigned integer"
            ))
        }),
    }
}

fn rule_f64(path: &str, rules: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match rules.get(key) {
        None => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| {
            ShardboxError::Schema(format!(
                "rule '{key}' for field '{path}' must be a number"
            ))
        }),
    }
}

fn rule_string_enum(path: &str, rules: &Map<String, Value>) -> Result<Option<Vec<String>>> {
    let Some(value) = rules.get("enum") else {
        return Ok(None);
    };
    let items = value.as_array().ok_or_else(|| {
        ShardboxError::Schema(format!("rule 'enum' for field '{path}' must be an array"))
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let s = item.as_str().ok_or_else(|| {
            ShardboxError::Schema(format!(
                "enum values for string field '{path}' must be strings"
            ))
        })?;
        out.push(s.to_string());
    }
    Ok(Some(out))
}

fn rule_number_enum(path: &str, rules: &Map<String, Value>) -> Result<Option<Vec<f64>>> {
    let Some(value) = rules.get("enum") else {
        return Ok(None);
    };
    let items = value.as_array().ok_or_else(|| {
        ShardboxError::Schema(format!("rule 'enum' for field '{path}' must be an array"))
    })?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let n = item.as_f64().ok_or_else(|| {
            ShardboxError::Schema(format!(
                "enum values for number field '{path}' must be numbers"
            ))
        })?;
        out.push(n);
    }
    Ok(Some(out))
}

/// Construction-time default consistency: a required field may not default
/// to null, and a non-null default must satisfy the field's own rules. The
/// stored default is the normalized (transformed) value.
fn finalize_default(path: &str, schema_type: SchemaType) -> Result<SchemaType> {
    let Some(default) = schema_type.default_value().cloned() else {
        return Ok(schema_type);
    };
    if default.is_null() {
        if schema_type.is_required() {
            return Err(ShardboxError::Schema(format!(
                "field '{path}' is required but declares a null default"
            )));
        }
        return Ok(schema_type);
    }
    match schema_type.validate(path, Some(&default)) {
        Ok(Some(normalized)) => Ok(schema_type.with_default(normalized)),
        Ok(None) => Ok(schema_type),
        Err(e) => Err(ShardboxError::Schema(format!(
            "invalid default for field '{path}': {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(models: &HashMap<String, String>) -> CompileCtx<'_> {
        CompileCtx { models }
    }

    #[test]
    fn test_bare_marker() {
        let models = HashMap::new();
        let (field, edges) = compile_field("name", &json!("string"), &ctx_with(&models)).unwrap();
        assert!(matches!(field, SchemaType::String(_)));
        assert!(edges.is_empty());
    }

    #[test]
    fn test_unknown_rule_rejected() {
        let models = HashMap::new();
        let decl = json!({"type": "string", "maxlength": 5});
        let err = compile_field("name", &decl, &ctx_with(&models)).unwrap_err();
        assert!(err.to_string().contains("maxlength"));
    }

    #[test]
    fn test_unknown_marker_rejected() {
        let models = HashMap::new();
        assert!(compile_field("x", &json!("text"), &ctx_with(&models)).is_err());
    }

    #[test]
    fn test_default_must_satisfy_rules() {
        let models = HashMap::new();
        let decl = json!({"type": "string", "enum": ["a", "b"], "default": "c"});
        assert!(compile_field("x", &decl, &ctx_with(&models)).is_err());

        let decl = json!({"type": "number", "min": 10, "default": 3});
        assert!(compile_field("x", &decl, &ctx_with(&models)).is_err());
    }

    #[test]
    fn test_required_null_default_rejected() {
        let models = HashMap::new();
        let decl = json!({"type": "string", "required": true, "default": null});
        assert!(compile_field("x", &decl, &ctx_with(&models)).is_err());
    }

    #[test]
    fn test_default_is_normalized() {
        let models = HashMap::new();
        let decl = json!({"type": "string", "trim": true, "default": "  a  "});
        let (field, _) = compile_field("x", &decl, &ctx_with(&models)).unwrap();
        assert_eq!(field.default_value(), Some(&json!("a")));
    }

    #[test]
    fn test_min_max_cross_check() {
        let models = HashMap::new();
        let decl = json!({"type": "number", "min": 5, "max": 1});
        assert!(compile_field("x", &decl, &ctx_with(&models)).is_err());
        let decl = json!({"type": "string", "min_length": 5, "max_length": 1});
        assert!(compile_field("x", &decl, &ctx_with(&models)).is_err());
    }

    #[test]
    fn test_lowercase_capitalize_exclusive() {
        let models = HashMap::new();
        let decl = json!({"type": "string", "lowercase": true, "capitalize": true});
        assert!(compile_field("x", &decl, &ctx_with(&models)).is_err());
    }

    #[test]
    fn test_ref_descriptor() {
        let models = HashMap::new();
        let (field, edges) =
            compile_field("author", &json!({"$ref": "authors"}), &ctx_with(&models)).unwrap();
        match field {
            SchemaType::Relation(r) => {
                assert_eq!(r.relation.kind, RelationKind::Ref);
                assert_eq!(r.relation.target_collection, "authors");
            }
            other => panic!("expected relation, got {other:?}"),
        }
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].path, "author");
    }

    #[test]
    fn test_model_marker_resolves_to_document_relation() {
        let mut models = HashMap::new();
        models.insert("Author".to_string(), "authors".to_string());
        let (field, edges) = compile_field("author", &json!("Author"), &ctx_with(&models)).unwrap();
        match field {
            SchemaType::Relation(r) => assert_eq!(r.relation.kind, RelationKind::Document),
            other => panic!("expected relation, got {other:?}"),
        }
        assert_eq!(edges[0].target_collection, "authors");
    }

    #[test]
    fn test_nested_object_collects_dotted_edges() {
        let models = HashMap::new();
        let decl = json!({
            "street": "string",
            "owner": {"$ref": "users"}
        });
        let (field, edges) = compile_field("address", &decl, &ctx_with(&models)).unwrap();
        assert!(matches!(field, SchemaType::Nested(_)));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].path, "address.owner");
    }

    #[test]
    fn test_array_embeds() {
        let mut models = HashMap::new();
        models.insert("Comment".to_string(), "comments".to_string());
        let ctx = ctx_with(&models);

        let (field, edges) =
            compile_field("tags", &json!({"type": "array", "embed": "string"}), &ctx).unwrap();
        match field {
            SchemaType::Array(rules) => {
                assert!(matches!(rules.embed, Some(ArrayEmbed::Primitive(_))))
            }
            other => panic!("expected array, got {other:?}"),
        }
        assert!(edges.is_empty());

        let (_, edges) =
            compile_field("comments", &json!({"type": "array", "embed": "Comment"}), &ctx).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].in_array);

        let (_, edges) = compile_field(
            "watchers",
            &json!({"type": "array", "embed": {"$ref": "users"}}),
            &ctx,
        )
        .unwrap();
        assert_eq!(edges[0].kind, RelationKind::Ref);

        let (field, _) = compile_field(
            "matrix",
            &json!({"type": "array", "embed": ["number"]}),
            &ctx,
        )
        .unwrap();
        match field {
            SchemaType::Array(rules) => {
                assert!(matches!(rules.embed, Some(ArrayEmbed::PrimitiveList(_))))
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_relations_rejected_inside_array_objects() {
        let models = HashMap::new();
        let decl = json!({"type": "array", "embed": {"owner": {"$ref": "users"}}});
        assert!(compile_field("xs", &decl, &ctx_with(&models)).is_err());
    }
}
