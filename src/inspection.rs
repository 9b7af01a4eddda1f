//! Inspection Pipeline: turn a Variable Info tree into a plain structured
//! value, then either run the filter DSL over it or produce a structural
//! summary (spec.md §4.6).
//!
//! Grounded in the teacher's habit of modeling a small closed grammar as a
//! Rust enum dispatched in one place (`dap_type.rs`'s capability flags,
//! `event.rs`'s reason enums); applied here to `PathSegment`.

use serde_json::{Map, Value};

use crate::codec::{ScalarValue, VariableInfo};
use crate::error::{BridgeError, Result};

/// A plain JSON-shaped rendering of a `VariableInfo` tree: arrays for
/// array-typed variables, objects for object-typed ones, scalars for
/// leaves. Classname/fullname/truncated are folded in as object keys so the
/// filter DSL and the structural summary can both walk a single shape.
pub fn to_structured_value(info: &VariableInfo) -> Value {
    match &info.children {
        Some(children) if info.r#type == "array" => {
            Value::Array(children.iter().map(to_structured_value).collect())
        }
        Some(children) => {
            let mut map = Map::new();
            for child in children {
                map.insert(child.name.clone(), to_structured_value(child));
            }
            if let Some(classname) = &info.classname {
                map.insert("__classname".to_string(), Value::String(classname.clone()));
            }
            Value::Object(map)
        }
        None => match &info.value {
            Some(value) => value.to_json(),
            None => Value::Null,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PathSegment {
    Field(String),
    Index(usize),
    Wildcard,
    /// `$..k` — recursive descent for a named field.
    RecursiveDescent(String),
}

/// Parse `$.a.b`, `$.a[0]`, `$.a[*].b`, and `$..k` into a segment list. The
/// leading `$` is required; everything else is dot/bracket navigation.
fn parse_filter(expr: &str) -> Result<Vec<PathSegment>> {
    let rest = expr
        .strip_prefix('$')
        .ok_or_else(|| BridgeError::InvalidFilter(format!("filter must start with '$': {expr:?}")))?;

    let mut segments = Vec::new();
    let chars: Vec<char> = rest.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if chars.get(i + 1) == Some(&'.') {
                    i += 2;
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    if start == i {
                        return Err(BridgeError::InvalidFilter(format!("empty recursive descent key in {expr:?}")));
                    }
                    segments.push(PathSegment::RecursiveDescent(chars[start..i].iter().collect()));
                } else {
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    if start == i {
                        return Err(BridgeError::InvalidFilter(format!("empty field name in {expr:?}")));
                    }
                    segments.push(PathSegment::Field(chars[start..i].iter().collect()));
                }
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| BridgeError::InvalidFilter(format!("unclosed '[' in {expr:?}")))?;
                let inner: String = chars[i + 1..close].iter().collect();
                if inner == "*" {
                    segments.push(PathSegment::Wildcard);
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| BridgeError::InvalidFilter(format!("invalid index {inner:?} in {expr:?}")))?;
                    segments.push(PathSegment::Index(index));
                }
                i = close + 1;
            }
            other => {
                return Err(BridgeError::InvalidFilter(format!(
                    "unexpected character {other:?} in {expr:?}"
                )))
            }
        }
    }

    Ok(segments)
}

fn evaluate_segments(value: &Value, segments: &[PathSegment]) -> Result<Value> {
    let Some((head, tail)) = segments.split_first() else {
        return Ok(value.clone());
    };

    match head {
        PathSegment::Field(name) => {
            let next = value
                .as_object()
                .and_then(|m| m.get(name))
                .ok_or_else(|| BridgeError::InvalidFilter(format!("no field {name:?}")))?;
            evaluate_segments(next, tail)
        }
        PathSegment::Index(index) => {
            let next = value
                .as_array()
                .and_then(|a| a.get(*index))
                .ok_or_else(|| BridgeError::InvalidFilter(format!("no index {index}")))?;
            evaluate_segments(next, tail)
        }
        PathSegment::Wildcard => {
            let items = value
                .as_array()
                .ok_or_else(|| BridgeError::InvalidFilter("'[*]' requires an array".to_string()))?;
            let mapped: Result<Vec<Value>> = items.iter().map(|item| evaluate_segments(item, tail)).collect();
            Ok(Value::Array(mapped?))
        }
        PathSegment::RecursiveDescent(name) => {
            let mut found = Vec::new();
            collect_recursive(value, name, &mut found);
            if found.is_empty() {
                return Err(BridgeError::InvalidFilter(format!("no matches for recursive descent {name:?}")));
            }
            let mapped: Result<Vec<Value>> = found.iter().map(|item| evaluate_segments(item, tail)).collect();
            let mut values = mapped?;
            if values.len() == 1 {
                Ok(values.remove(0))
            } else {
                Ok(Value::Array(values))
            }
        }
    }
}

fn collect_recursive(value: &Value, name: &str, found: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(name) {
                found.push(v.clone());
            }
            for v in map.values() {
                collect_recursive(v, name, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_recursive(item, name, found);
            }
        }
        _ => {}
    }
}

/// Enumerate the first ~20 navigable dotted paths from the root, for the
/// diagnostic payload's `available_keys`.
fn available_keys(value: &Value, limit: usize) -> Vec<String> {
    let mut keys = Vec::new();
    collect_keys(value, String::new(), &mut keys, limit);
    keys
}

fn collect_keys(value: &Value, prefix: String, out: &mut Vec<String>, limit: usize) {
    if out.len() >= limit {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "__classname" {
                    continue;
                }
                if out.len() >= limit {
                    return;
                }
                let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                out.push(path.clone());
                collect_keys(child, path, out, limit);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                if out.len() >= limit {
                    return;
                }
                let path = format!("{prefix}[{i}]");
                out.push(path.clone());
                collect_keys(child, path, out, limit);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuralSummary {
    pub r#type: String,
    pub classname: Option<String>,
    pub keys: Vec<String>,
    pub children_count: usize,
    pub preview: Vec<(String, String)>,
}

/// Build the default "do not paste large payloads back to the agent"
/// summary: at most 3 children, each preview value truncated to 50 chars.
pub fn structural_summary(info: &VariableInfo) -> StructuralSummary {
    let keys: Vec<String> = info
        .children
        .as_ref()
        .map(|children| children.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    let children_count = info.numchildren.map(|n| n as usize).unwrap_or_else(|| keys.len());

    let preview = info
        .children
        .as_ref()
        .into_iter()
        .flatten()
        .take(3)
        .map(|child| {
            let marker = match (&child.value, &child.children) {
                (Some(value), _) => truncate(&render_scalar(value), 50),
                (None, Some(grandchildren)) => format!("[{} children]", grandchildren.len()),
                (None, None) => "null".to_string(),
            };
            (child.name.clone(), format!("({}) {marker}", child.r#type))
        })
        .collect();

    StructuralSummary {
        r#type: info.r#type.clone(),
        classname: info.classname.clone(),
        keys,
        children_count,
        preview,
    }
}

fn render_scalar(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Int(text) => text.clone(),
        ScalarValue::Float(f) => f.to_string(),
        ScalarValue::Bool(b) => b.to_string(),
        ScalarValue::Str(s) => s.clone(),
        ScalarValue::Resource(s) => format!("[resource: {s}]"),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterDiagnostic {
    pub error: String,
    pub variable: String,
    pub r#type: String,
    pub available_keys: Vec<String>,
    pub hint: String,
}

/// Evaluate a filter expression against structured data. Evaluator errors
/// never abort the caller — they downgrade to a diagnostic payload
/// (spec.md §9 "Filter evaluator").
pub fn apply_filter(variable_name: &str, info: &VariableInfo, structured: &Value, expr: &str) -> std::result::Result<Value, FilterDiagnostic> {
    let outcome = parse_filter(expr).and_then(|segments| evaluate_segments(structured, &segments));
    outcome.map_err(|e| FilterDiagnostic {
        error: e.to_string(),
        variable: variable_name.to_string(),
        r#type: info.r#type.clone(),
        available_keys: available_keys(structured, 20),
        hint: "inspect available_keys and retry with a valid filter".to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(name: &str, r#type: &str, value: ScalarValue) -> VariableInfo {
        VariableInfo {
            name: name.to_string(),
            r#type: r#type.to_string(),
            value: Some(value),
            children: None,
            classname: None,
            fullname: None,
            numchildren: None,
            truncated: None,
        }
    }

    fn object(name: &str, classname: &str, children: Vec<VariableInfo>) -> VariableInfo {
        let numchildren = children.len() as u32;
        VariableInfo {
            name: name.to_string(),
            r#type: "object".to_string(),
            value: None,
            children: Some(children),
            classname: Some(classname.to_string()),
            fullname: None,
            numchildren: Some(numchildren),
            truncated: None,
        }
    }

    fn array(name: &str, children: Vec<VariableInfo>) -> VariableInfo {
        let numchildren = children.len() as u32;
        VariableInfo {
            name: name.to_string(),
            r#type: "array".to_string(),
            value: None,
            children: Some(children),
            classname: None,
            fullname: None,
            numchildren: Some(numchildren),
            truncated: None,
        }
    }

    fn sample_order() -> VariableInfo {
        object(
            "$order",
            "Order",
            vec![
                leaf("id", "int", ScalarValue::Int("123".to_string())),
                leaf("total", "float", ScalarValue::Float(99.99)),
                array(
                    "items",
                    vec![
                        object("0", "Item", vec![leaf("sku", "string", ScalarValue::Str("A1".to_string()))]),
                        object("1", "Item", vec![leaf("sku", "string", ScalarValue::Str("B2".to_string()))]),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn structural_summary_matches_scenario_2() {
        let order = sample_order();
        let summary = structural_summary(&order);
        assert_eq!(summary.keys, vec!["id", "total", "items"]);
        assert_eq!(summary.children_count, 3);
        assert_eq!(summary.preview.len(), 3);
        assert_eq!(summary.preview[0], ("id".to_string(), "(int) 123".to_string()));
        assert_eq!(summary.preview[1], ("total".to_string(), "(float) 99.99".to_string()));
        assert_eq!(summary.preview[2].1, "(array) [2 children]");
    }

    #[test]
    fn filter_items_star_sku_returns_both_skus() {
        let order = sample_order();
        let structured = to_structured_value(&order);
        let result = apply_filter("$order", &order, &structured, "$.items[*].sku").unwrap();
        assert_eq!(result, serde_json::json!(["A1", "B2"]));
    }

    #[test]
    fn filter_field_navigation() {
        let order = sample_order();
        let structured = to_structured_value(&order);
        let result = apply_filter("$order", &order, &structured, "$.id").unwrap();
        assert_eq!(result, serde_json::json!(123));
    }

    #[test]
    fn filter_unknown_field_yields_diagnostic_with_available_keys() {
        let order = sample_order();
        let structured = to_structured_value(&order);
        let diagnostic = apply_filter("$order", &order, &structured, "$.nonexistent").unwrap_err();
        assert!(diagnostic.available_keys.contains(&"id".to_string()));
        assert!(diagnostic.available_keys.contains(&"items".to_string()));
    }

    #[test]
    fn recursive_descent_finds_nested_key() {
        let order = sample_order();
        let structured = to_structured_value(&order);
        let result = apply_filter("$order", &order, &structured, "$..sku").unwrap();
        assert_eq!(result, serde_json::json!(["A1", "B2"]));
    }

    #[test]
    fn filter_must_start_with_dollar() {
        assert!(matches!(parse_filter("items[0]"), Err(BridgeError::InvalidFilter(_))));
    }
}
