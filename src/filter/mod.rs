// Filter mini-language - expression parsing and evaluation for find/update/delete

use crate::error::{Result, ShardboxError};
use serde_json::Value;

/// Comparison operators accepted in filter expressions.
///
/// `>` is strict; `<` admits the bound itself. `and`/`or` chains are folded
/// pairwise left-to-right with no operator precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// Right-hand side of a filter expression. The reserved tokens
/// `$undefined`, `$null`, `$true` and `$false` map to their primitives;
/// anything else stays raw and is coerced against the field's type at
/// evaluation time (numeric fields parse the token as a number).
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Undefined,
    Null,
    Bool(bool),
    Raw(String),
}

impl FilterValue {
    fn parse(token: &str) -> FilterValue {
        match token {
            "$undefined" => FilterValue::Undefined,
            "$null" => FilterValue::Null,
            "$true" => FilterValue::Bool(true),
            "$false" => FilterValue::Bool(false),
            other => FilterValue::Raw(other.to_string()),
        }
    }
}

/// One parsed `"<field_path>,<operator>,<value>"` expression.
#[derive(Debug, Clone)]
pub struct Expr {
    pub path: String,
    pub op: CmpOp,
    pub value: FilterValue,
}

/// A parsed filter list: expressions alternating with `and`/`or`.
#[derive(Debug, Clone)]
pub struct FilterList {
    first: Expr,
    rest: Vec<(Connector, Expr)>,
}

/// Parse a filter token list. Tokens alternate expressions and connectors:
/// `["age,>,20", "and", "age,<,40"]`. An empty list means "match all" and
/// parses to `None`.
pub fn parse_filters(tokens: &[&str]) -> Result<Option<FilterList>> {
    if tokens.is_empty() {
        return Ok(None);
    }
    let first = parse_expr(tokens[0])?;
    let mut rest = Vec::new();
    let mut i = 1;
    while i < tokens.len() {
        let connector = match tokens[i] {
            "and" => Connector::And,
            "or" => Connector::Or,
            other => {
                return Err(ShardboxError::Typing(format!(
                    "expected 'and' or 'or' between filter expressions, got '{other}'"
                )))
            }
        };
        let expr = tokens.get(i + 1).ok_or_else(|| {
            ShardboxError::Typing("filter list ends with a dangling connector".into())
        })?;
        rest.push((connector, parse_expr(expr)?));
        i += 2;
    }
    Ok(Some(FilterList { first, rest }))
}

fn parse_expr(token: &str) -> Result<Expr> {
    let mut parts = token.splitn(3, ',');
    let path = parts.next().unwrap_or("").trim();
    let op = parts.next().ok_or_else(|| {
        ShardboxError::Typing(format!("filter expression '{token}' is missing an operator"))
    })?;
    let value = parts.next().ok_or_else(|| {
        ShardboxError::Typing(format!("filter expression '{token}' is missing a value"))
    })?;
    if path.is_empty() {
        return Err(ShardboxError::Typing(format!(
            "filter expression '{token}' is missing a field path"
        )));
    }
    let op = match op.trim() {
        "=" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        other => {
            return Err(ShardboxError::Typing(format!(
                "unknown filter operator '{other}'"
            )))
        }
    };
    Ok(Expr {
        path: path.to_string(),
        op,
        value: FilterValue::parse(value.trim()),
    })
}

impl FilterList {
    /// Evaluate against a document. Triples are resolved pairwise
    /// left-to-right: `a or b and c` is `(a or b) and c`.
    pub fn matches(&self, doc: &Value) -> bool {
        let mut acc = eval_expr(doc, &self.first);
        for (connector, expr) in &self.rest {
            let rhs = eval_expr(doc, expr);
            acc = match connector {
                Connector::And => acc && rhs,
                Connector::Or => acc || rhs,
            };
        }
        acc
    }
}

fn eval_expr(doc: &Value, expr: &Expr) -> bool {
    let field = get_path(doc, &expr.path);
    match (&expr.value, field) {
        (FilterValue::Undefined, f) => match expr.op {
            CmpOp::Eq => f.is_none(),
            CmpOp::Ne => f.is_some(),
            _ => false,
        },
        (FilterValue::Null, f) => match expr.op {
            CmpOp::Eq => matches!(f, Some(Value::Null)),
            CmpOp::Ne => !matches!(f, Some(Value::Null)),
            _ => false,
        },
        (FilterValue::Bool(b), Some(Value::Bool(x))) => match expr.op {
            CmpOp::Eq => x == b,
            CmpOp::Ne => x != b,
            _ => false,
        },
        (FilterValue::Bool(_), _) => matches!(expr.op, CmpOp::Ne),
        (FilterValue::Raw(s), Some(Value::Number(n))) => match (n.as_f64(), s.parse::<f64>()) {
            (Some(a), Ok(b)) => cmp_f64(a, b, expr.op),
            _ => matches!(expr.op, CmpOp::Ne),
        },
        (FilterValue::Raw(s), Some(Value::String(t))) => cmp_str(t, s, expr.op),
        (FilterValue::Raw(_), _) => matches!(expr.op, CmpOp::Ne),
    }
}

fn cmp_f64(a: f64, b: f64, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        // '<' admits the bound itself
        CmpOp::Lt => a <= b,
        CmpOp::Le => a <= b,
    }
}

fn cmp_str(a: &str, b: &str, op: CmpOp) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Lt => a <= b,
        CmpOp::Le => a <= b,
    }
}

// ── Array-update path expressions ──────────────────────────────────

/// Element selector of an array-update expression: `$item` matches
/// primitive/date elements by value; a field name matches object elements
/// by that key (`id` being the common unique key).
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Item,
    Key(String),
}

/// A parsed array-update expression `"<selector>,<op>,<value>"`.
/// `=`/`!=` select every match, `===`/`!==` only the first.
#[derive(Debug, Clone)]
pub struct ArrayExpr {
    pub selector: Selector,
    pub equal: bool,
    pub first_only: bool,
    pub value: FilterValue,
}

pub fn parse_array_expr(token: &str) -> Result<ArrayExpr> {
    let mut parts = token.splitn(3, ',');
    let selector = parts.next().unwrap_or("").trim();
    let op = parts.next().ok_or_else(|| {
        ShardboxError::Typing(format!("array expression '{token}' is missing an operator"))
    })?;
    let value = parts.next().ok_or_else(|| {
        ShardboxError::Typing(format!("array expression '{token}' is missing a value"))
    })?;
    if selector.is_empty() {
        return Err(ShardboxError::Typing(format!(
            "array expression '{token}' is missing a selector"
        )));
    }
    let selector = if selector == "$item" {
        Selector::Item
    } else {
        Selector::Key(selector.to_string())
    };
    let (equal, first_only) = match op.trim() {
        "=" => (true, false),
        "!=" => (false, false),
        "===" => (true, true),
        "!==" => (false, true),
        other => {
            return Err(ShardboxError::Typing(format!(
                "unknown array-update operator '{other}'"
            )))
        }
    };
    Ok(ArrayExpr {
        selector,
        equal,
        first_only,
        value: FilterValue::parse(value.trim()),
    })
}

fn values_equal(element: &Value, value: &FilterValue) -> bool {
    match value {
        FilterValue::Undefined => false,
        FilterValue::Null => element.is_null(),
        FilterValue::Bool(b) => element.as_bool() == Some(*b),
        FilterValue::Raw(s) => match element {
            Value::Number(n) => match (n.as_f64(), s.parse::<f64>()) {
                (Some(a), Ok(b)) => a == b,
                _ => false,
            },
            Value::String(t) => t == s,
            _ => false,
        },
    }
}

fn element_selected(element: &Value, expr: &ArrayExpr) -> bool {
    let matched = match &expr.selector {
        Selector::Item => values_equal(element, &expr.value),
        Selector::Key(key) => element
            .get(key)
            .map_or(false, |v| values_equal(v, &expr.value)),
    };
    matched == expr.equal
}

/// Apply an array-update expression. `$item` matches are replaced outright
/// with the update value (first element, if an array was supplied); object
/// matches get the update deep-merged in. Returns the number of elements
/// changed.
pub fn update_array_elements(
    elements: &mut Vec<Value>,
    expr: &ArrayExpr,
    update: &Value,
) -> Result<usize> {
    let update = match update {
        Value::Array(values) => values.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    if matches!(expr.selector, Selector::Key(_)) && !update.is_object() {
        return Err(ShardboxError::Typing(
            "array updates on object elements require an object value".into(),
        ));
    }
    let mut changed = 0;
    for element in elements.iter_mut() {
        if !element_selected(element, expr) {
            continue;
        }
        match expr.selector {
            Selector::Item => *element = update.clone(),
            Selector::Key(_) => deep_merge(element, &update),
        }
        changed += 1;
        if expr.first_only {
            break;
        }
    }
    Ok(changed)
}

/// Remove matching elements: every match for `=`/`!=`, only the first for
/// `===`/`!==`. Returns the number removed.
pub fn remove_array_elements(elements: &mut Vec<Value>, expr: &ArrayExpr) -> usize {
    let before = elements.len();
    if expr.first_only {
        if let Some(pos) = elements.iter().position(|e| element_selected(e, expr)) {
            elements.remove(pos);
        }
    } else {
        elements.retain(|e| !element_selected(e, expr));
    }
    before - elements.len()
}

/// Deep-merge `src` into `target`: objects merge key-wise recursively,
/// everything else is replaced.
pub fn deep_merge(target: &mut Value, src: &Value) {
    match (target, src) {
        (Value::Object(t), Value::Object(s)) => {
            for (key, value) in s {
                match t.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        t.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, src) => *target = src.clone(),
    }
}

// ── Dotted-path access ─────────────────────────────────────────────

pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

pub fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get_mut(segment)?;
    }
    Some(current)
}
