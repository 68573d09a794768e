use crate::error::{Result, ShardboxError};
use serde_json::Value;
use std::collections::BTreeMap;

/// How a relation field points at another document: `Document` embeds (or
/// names) a modelled document, `Ref` holds a foreign id into a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Document,
    Ref,
}

/// Target of a relation field.
#[derive(Debug, Clone)]
pub struct Relation {
    pub kind: RelationKind,
    pub target_model: Option<String>,
    pub target_collection: String,
}

/// A relation discovered while compiling a schema, tagged with its dotted
/// path from the document root. Built once at compile time, never mutated.
#[derive(Debug, Clone)]
pub struct RelationEdge {
    pub path: String,
    pub kind: RelationKind,
    pub target_model: Option<String>,
    pub target_collection: String,
    pub in_array: bool,
}

#[derive(Debug, Clone)]
pub struct RelationField {
    pub relation: Relation,
    pub required: bool,
}

/// Rules shared by every scalar variant.
#[derive(Debug, Clone, Default)]
pub struct CommonRules {
    pub required: bool,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct StringRules {
    pub common: CommonRules,
    pub enum_values: Option<Vec<String>>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub trim: bool,
    pub lowercase: bool,
    pub capitalize: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NumberRules {
    pub common: CommonRules,
    pub enum_values: Option<Vec<f64>>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ArrayRules {
    pub required: bool,
    pub embed: Option<ArrayEmbed>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

/// What an array declares for its elements. Exactly one of: a primitive
/// type (optionally with rules), one level of nested primitive arrays, an
/// object shape, or a relation (validated by the document engine).
#[derive(Debug, Clone)]
pub enum ArrayEmbed {
    Primitive(Box<SchemaType>),
    PrimitiveList(Box<SchemaType>),
    Nested(NestedObject),
    Relation(Relation),
}

/// A compiled object declaration: the same rule set as a top-level schema,
/// minus the implicit id field.
#[derive(Debug, Clone)]
pub struct NestedObject {
    pub fields: BTreeMap<String, SchemaType>,
}

/// One compiled field contract. Leaf variants validate on their own;
/// `Nested` and `Relation` (and relation-embedded arrays) are traversed by
/// the document engine, which owns id caches and deferred-task scheduling.
#[derive(Debug, Clone)]
pub enum SchemaType {
    String(StringRules),
    Number(NumberRules),
    Boolean(CommonRules),
    Date(CommonRules),
    Any(CommonRules),
    Array(ArrayRules),
    Nested(NestedObject),
    Incr,
    Uid,
    Relation(RelationField),
}

impl SchemaType {
    pub fn is_required(&self) -> bool {
        match self {
            SchemaType::String(r) => r.common.required,
            SchemaType::Number(r) => r.common.required,
            SchemaType::Boolean(c) | SchemaType::Date(c) | SchemaType::Any(c) => c.required,
            SchemaType::Array(r) => r.required,
            SchemaType::Nested(_) => false,
            SchemaType::Incr | SchemaType::Uid => true,
            SchemaType::Relation(r) => r.required,
        }
    }

    pub fn default_value(&self) -> Option<&Value> {
        match self {
            SchemaType::String(r) => r.common.default.as_ref(),
            SchemaType::Number(r) => r.common.default.as_ref(),
            SchemaType::Boolean(c) | SchemaType::Date(c) | SchemaType::Any(c) => c.default.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn with_default(mut self, value: Value) -> SchemaType {
        match &mut self {
            SchemaType::String(r) => r.common.default = Some(value),
            SchemaType::Number(r) => r.common.default = Some(value),
            SchemaType::Boolean(c) | SchemaType::Date(c) | SchemaType::Any(c) => {
                c.default = Some(value)
            }
            _ => {}
        }
        self
    }

    /// Validate a leaf value. `None` means the field is absent from the
    /// candidate document (distinct from JSON null); the result is `None`
    /// when the field should stay absent.
    pub fn validate(&self, field: &str, value: Option<&Value>) -> Result<Option<Value>> {
        let value = match value {
            Some(v) => v,
            None => {
                if let Some(default) = self.default_value() {
                    return Ok(Some(default.clone()));
                }
                if self.is_required() {
                    return Err(required_error(field));
                }
                return Ok(None);
            }
        };
        match self {
            SchemaType::String(rules) => rules.validate(field, value).map(Some),
            SchemaType::Number(rules) => rules.validate(field, value).map(Some),
            SchemaType::Boolean(_) => {
                // null is a type error for booleans
                let b = value
                    .as_bool()
                    .ok_or_else(|| type_error(field, "boolean", value))?;
                Ok(Some(Value::Bool(b)))
            }
            SchemaType::Date(rules) => validate_date(field, value, rules.required).map(Some),
            SchemaType::Any(_) => Ok(Some(value.clone())),
            SchemaType::Array(rules) => rules.validate(field, value).map(Some),
            SchemaType::Incr => {
                if value.as_u64().is_none() {
                    return Err(type_error(field, "unsigned integer id", value));
                }
                Ok(Some(value.clone()))
            }
            SchemaType::Uid => {
                if !value.is_string() {
                    return Err(type_error(field, "string id", value));
                }
                Ok(Some(value.clone()))
            }
            SchemaType::Nested(_) | SchemaType::Relation(_) => Err(ShardboxError::Other(format!(
                "field '{field}' must be validated by the document engine"
            ))),
        }
    }
}

impl StringRules {
    fn validate(&self, field: &str, value: &Value) -> Result<Value> {
        if value.is_null() {
            if self.common.required {
                return Err(null_error(field));
            }
            return Ok(Value::Null);
        }
        let s = value
            .as_str()
            .ok_or_else(|| type_error(field, "string", value))?;
        let mut s = s.to_string();
        if self.trim {
            s = s.trim().to_string();
        }
        if self.lowercase {
            s = s.to_lowercase();
        } else if self.capitalize {
            s = capitalize(&s);
        }
        let len = s.chars().count();
        if let Some(min) = self.min_length {
            if len < min {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' is shorter than min_length {min}"
                )));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' is longer than max_length {max}"
                )));
            }
        }
        if let Some(allowed) = &self.enum_values {
            if !allowed.iter().any(|a| a == &s) {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' value '{s}' is not in enum: {allowed:?}"
                )));
            }
        }
        Ok(Value::String(s))
    }
}

impl NumberRules {
    fn validate(&self, field: &str, value: &Value) -> Result<Value> {
        if value.is_null() {
            if self.common.required {
                return Err(null_error(field));
            }
            return Ok(Value::Null);
        }
        let n = value
            .as_f64()
            .ok_or_else(|| type_error(field, "number", value))?;
        if let Some(min) = self.min {
            if n < min {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' value {n} is below min {min}"
                )));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' value {n} is above max {max}"
                )));
            }
        }
        if let Some(allowed) = &self.enum_values {
            if !allowed.iter().any(|a| a == &n) {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' value {n} is not in enum: {allowed:?}"
                )));
            }
        }
        Ok(value.clone())
    }
}

fn validate_date(field: &str, value: &Value, required: bool) -> Result<Value> {
    match value {
        Value::Null => {
            if required {
                return Err(null_error(field));
            }
            Ok(Value::Null)
        }
        Value::String(s) => {
            let ok = chrono::DateTime::parse_from_rfc3339(s).is_ok()
                || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok();
            if !ok {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' value '{s}' is not a valid date"
                )));
            }
            Ok(value.clone())
        }
        // epoch milliseconds
        Value::Number(n) if n.as_i64().is_some() => Ok(value.clone()),
        other => Err(type_error(field, "date", other)),
    }
}

impl ArrayRules {
    fn validate(&self, field: &str, value: &Value) -> Result<Value> {
        if value.is_null() {
            // null becomes an empty sequence, unless required with a
            // minimum length
            if self.required && self.min_length.is_some() {
                return Err(null_error(field));
            }
            return Ok(Value::Array(Vec::new()));
        }
        let elements = value
            .as_array()
            .ok_or_else(|| type_error(field, "array", value))?;
        self.check_length(field, elements.len())?;
        let validated = match &self.embed {
            None => elements.clone(),
            Some(ArrayEmbed::Primitive(inner)) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(inner.validate(field, Some(element))?.unwrap_or(Value::Null));
                }
                out
            }
            Some(ArrayEmbed::PrimitiveList(inner)) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    let nested = element
                        .as_array()
                        .ok_or_else(|| type_error(field, "array of arrays", element))?;
                    let mut row = Vec::with_capacity(nested.len());
                    for item in nested {
                        row.push(inner.validate(field, Some(item))?.unwrap_or(Value::Null));
                    }
                    out.push(Value::Array(row));
                }
                out
            }
            Some(ArrayEmbed::Nested(shape)) => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(shape.validate_element(field, element)?);
                }
                out
            }
            Some(ArrayEmbed::Relation(_)) => {
                return Err(ShardboxError::Other(format!(
                    "field '{field}' must be validated by the document engine"
                )))
            }
        };
        Ok(Value::Array(validated))
    }

    pub(crate) fn check_length(&self, field: &str, len: usize) -> Result<()> {
        if let Some(min) = self.min_length {
            if len < min {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' has fewer than min_length {min} elements"
                )));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return Err(ShardboxError::Validation(format!(
                    "field '{field}' has more than max_length {max} elements"
                )));
            }
        }
        Ok(())
    }

    /// Null policy + type/length checks for the engine's relation-array
    /// path; element validation is the caller's job.
    pub(crate) fn coerce_elements(&self, field: &str, value: &Value) -> Result<Vec<Value>> {
        if value.is_null() {
            if self.required && self.min_length.is_some() {
                return Err(null_error(field));
            }
            return Ok(Vec::new());
        }
        let elements = value
            .as_array()
            .ok_or_else(|| type_error(field, "array", value))?;
        self.check_length(field, elements.len())?;
        Ok(elements.clone())
    }
}

impl NestedObject {
    /// Leaf-only validation used for array-embedded object shapes (schema
    /// compilation guarantees no relations inside these). Undeclared keys
    /// pass through.
    pub fn validate_element(&self, field: &str, element: &Value) -> Result<Value> {
        let obj = element
            .as_object()
            .ok_or_else(|| type_error(field, "object", element))?;
        let mut out = serde_json::Map::new();
        for (name, schema_type) in &self.fields {
            let validated = match schema_type {
                SchemaType::Nested(inner) => match obj.get(name) {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(inner.validate_element(name, v)?),
                },
                other => other.validate(name, obj.get(name))?,
            };
            if let Some(v) = validated {
                out.insert(name.clone(), v);
            }
        }
        for (key, value) in obj {
            if !self.fields.contains_key(key) && !out.contains_key(key) {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(Value::Object(out))
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_error(field: &str, expected: &str, value: &Value) -> ShardboxError {
    ShardboxError::Validation(format!(
        "field '{field}' expected {expected}, got {}",
        type_name(value)
    ))
}

fn required_error(field: &str) -> ShardboxError {
    ShardboxError::Validation(format!("field '{field}' is required"))
}

fn null_error(field: &str) -> ShardboxError {
    ShardboxError::Validation(format!("field '{field}' is required and cannot be null"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_transforms_in_order() {
        let st = SchemaType::String(StringRules {
            trim: true,
            lowercase: true,
            ..Default::default()
        });
        let out = st.validate("name", Some(&json!("  Alice  "))).unwrap();
        assert_eq!(out, Some(json!("alice")));
    }

    #[test]
    fn test_string_capitalize() {
        let st = SchemaType::String(StringRules {
            capitalize: true,
            ..Default::default()
        });
        let out = st.validate("name", Some(&json!("alice"))).unwrap();
        assert_eq!(out, Some(json!("Alice")));
    }

    #[test]
    fn test_string_bounds_and_enum() {
        let st = SchemaType::String(StringRules {
            min_length: Some(2),
            max_length: Some(5),
            enum_values: Some(vec!["draft".into(), "live".into()]),
            ..Default::default()
        });
        assert!(st.validate("status", Some(&json!("draft"))).is_ok());
        assert!(st.validate("status", Some(&json!("x"))).is_err());
        assert!(st.validate("status", Some(&json!("queued"))).is_err());
    }

    #[test]
    fn test_absent_applies_default_then_required() {
        let st = SchemaType::Number(NumberRules {
            common: CommonRules {
                required: true,
                default: Some(json!(3)),
            },
            ..Default::default()
        });
        assert_eq!(st.validate("n", None).unwrap(), Some(json!(3)));

        let st = SchemaType::Number(NumberRules {
            common: CommonRules {
                required: true,
                default: None,
            },
            ..Default::default()
        });
        assert!(st.validate("n", None).is_err());

        let st = SchemaType::Number(NumberRules::default());
        assert_eq!(st.validate("n", None).unwrap(), None);
    }

    #[test]
    fn test_null_policies() {
        let string = SchemaType::String(StringRules::default());
        assert_eq!(string.validate("s", Some(&json!(null))).unwrap(), Some(json!(null)));

        let required_string = SchemaType::String(StringRules {
            common: CommonRules {
                required: true,
                default: None,
            },
            ..Default::default()
        });
        assert!(required_string.validate("s", Some(&json!(null))).is_err());

        let boolean = SchemaType::Boolean(CommonRules::default());
        assert!(boolean.validate("b", Some(&json!(null))).is_err());
    }

    #[test]
    fn test_array_null_maps_to_empty() {
        let st = SchemaType::Array(ArrayRules::default());
        assert_eq!(st.validate("xs", Some(&json!(null))).unwrap(), Some(json!([])));

        let st = SchemaType::Array(ArrayRules {
            required: true,
            min_length: Some(1),
            ..Default::default()
        });
        assert!(st.validate("xs", Some(&json!(null))).is_err());
    }

    #[test]
    fn test_array_primitive_embed_checks_elements() {
        let st = SchemaType::Array(ArrayRules {
            embed: Some(ArrayEmbed::Primitive(Box::new(SchemaType::Number(
                NumberRules::default(),
            )))),
            ..Default::default()
        });
        assert!(st.validate("xs", Some(&json!([1, 2, 3]))).is_ok());
        assert!(st.validate("xs", Some(&json!([1, "two"]))).is_err());
    }

    #[test]
    fn test_array_nested_primitive_list() {
        let st = SchemaType::Array(ArrayRules {
            embed: Some(ArrayEmbed::PrimitiveList(Box::new(SchemaType::String(
                StringRules::default(),
            )))),
            ..Default::default()
        });
        assert!(st.validate("xs", Some(&json!([["a"], ["b", "c"]]))).is_ok());
        assert!(st.validate("xs", Some(&json!(["a"]))).is_err());
    }

    #[test]
    fn test_nested_element_validation() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "qty".to_string(),
            SchemaType::Number(NumberRules {
                common: CommonRules {
                    required: true,
                    default: None,
                },
                ..Default::default()
            }),
        );
        let shape = NestedObject { fields };
        assert!(shape.validate_element("line", &json!({"qty": 2, "note": "x"})).is_ok());
        assert!(shape.validate_element("line", &json!({"note": "x"})).is_err());
    }

    #[test]
    fn test_date_formats() {
        let st = SchemaType::Date(CommonRules::default());
        assert!(st.validate("d", Some(&json!("2026-08-07"))).is_ok());
        assert!(st.validate("d", Some(&json!("2026-08-07T10:00:00Z"))).is_ok());
        assert!(st.validate("d", Some(&json!(1754500000000_i64))).is_ok());
        assert!(st.validate("d", Some(&json!("yesterday"))).is_err());
    }
}
