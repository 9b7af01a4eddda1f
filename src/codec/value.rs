//! Variable Info decoding: DBGp `<property>` elements into the recursive
//! value shape of spec.md §3, plus the base64 and `file://` URI helpers the
//! rest of the codec and the DBGp Link share.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::xml::XmlNode;

/// A decoded scalar. Integers are kept as their original decimal text
/// rather than parsed into a machine integer, so that values wider than
/// 64 bits survive the round trip unchanged (the ledger's `safe_stringify`
/// relies on this to represent large integers as decimal strings).
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int(String),
    Float(f64),
    Bool(bool),
    Str(String),
    /// An opaque resource handle, tagged as `[resource: <text>]`.
    Resource(String),
}

impl ScalarValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScalarValue::Int(text) => match text.parse::<i64>() {
                Ok(n) => serde_json::Value::Number(n.into()),
                Err(_) => serde_json::Value::String(text.clone()),
            },
            ScalarValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScalarValue::Bool(b) => serde_json::Value::Bool(*b),
            ScalarValue::Str(s) => serde_json::Value::String(s.clone()),
            ScalarValue::Resource(s) => serde_json::Value::String(format!("[resource: {s}]")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub r#type: String,
    pub value: Option<ScalarValue>,
    pub children: Option<Vec<VariableInfo>>,
    pub classname: Option<String>,
    pub fullname: Option<String>,
    pub numchildren: Option<u32>,
    pub truncated: Option<bool>,
}

/// Decode a `<property>` XML element (and its nested `<property>` children,
/// recursively) into a `VariableInfo`.
pub fn decode_property(node: &XmlNode) -> VariableInfo {
    let name = node.attr("name").unwrap_or_default().to_string();
    let classname = node.attr("classname").map(str::to_string);
    let fullname = node.attr("fullname").map(str::to_string);
    let numchildren = node.attr("numchildren").and_then(|n| n.parse().ok());
    let r#type = node.attr("type").unwrap_or("string").to_string();

    let decoded_text = decode_text(node);

    let size = node.attr("size").and_then(|n| n.parse::<usize>().ok());
    let truncated = match size {
        Some(size) if size > decoded_text.len() => Some(true),
        _ => None,
    };

    let nested: Vec<VariableInfo> = node.children_named("property").map(decode_property).collect();

    if !nested.is_empty() {
        return VariableInfo {
            name,
            r#type,
            value: None,
            children: Some(nested),
            classname,
            fullname,
            numchildren,
            truncated,
        };
    }

    let value = coerce_scalar(&r#type, &decoded_text);

    VariableInfo {
        name,
        r#type,
        value,
        children: None,
        classname,
        fullname,
        numchildren,
        truncated,
    }
}

fn decode_text(node: &XmlNode) -> String {
    match node.attr("encoding") {
        Some("base64") => decode_base64_to_utf8(&node.text),
        _ => node.text.clone(),
    }
}

/// Typed coercion per spec.md §4.1: `int` → integer, `float` → float,
/// `bool` → true iff `"1"` or case-insensitive `"true"`, `null` → absent,
/// `resource` → opaque tagged string, everything else → string.
fn coerce_scalar(r#type: &str, text: &str) -> Option<ScalarValue> {
    match r#type {
        "null" => None,
        "int" => Some(ScalarValue::Int(text.to_string())),
        "float" => text.parse::<f64>().ok().map(ScalarValue::Float).or_else(|| Some(ScalarValue::Str(text.to_string()))),
        "bool" => Some(ScalarValue::Bool(text == "1" || text.eq_ignore_ascii_case("true"))),
        "resource" => Some(ScalarValue::Resource(text.to_string())),
        _ => Some(ScalarValue::Str(text.to_string())),
    }
}

/// base64-decode DBGp wire text into a UTF-8 string; invalid base64 or
/// non-UTF-8 bytes fall back to the original text rather than panicking.
pub fn decode_base64_to_utf8(text: &str) -> String {
    match BASE64.decode(text.trim()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| text.to_string()),
        Err(_) => text.to_string(),
    }
}

pub fn encode_base64(text: &str) -> String {
    BASE64.encode(text.as_bytes())
}

/// Decode a `file://`-prefixed value; a non-`file://` value is returned
/// unchanged. Invalid percent-encoding is returned unchanged after the
/// scheme is stripped.
pub fn decode_file_uri(value: &str) -> String {
    match value.strip_prefix("file://") {
        Some(rest) => match urlencoding::decode(rest) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => rest.to_string(),
        },
        None => value.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn leaf(r#type: &str, text: &str, encoding: Option<&str>) -> XmlNode {
        let mut attrs = HashMap::new();
        attrs.insert("name".to_string(), "$x".to_string());
        attrs.insert("type".to_string(), r#type.to_string());
        if let Some(enc) = encoding {
            attrs.insert("encoding".to_string(), enc.to_string());
        }
        XmlNode {
            tag: "property".to_string(),
            attrs,
            text: text.to_string(),
            children: Vec::new(),
        }
    }

    #[test]
    fn coerces_int() {
        let node = leaf("int", "123", None);
        let info = decode_property(&node);
        assert_eq!(info.value, Some(ScalarValue::Int("123".to_string())));
    }

    #[test]
    fn coerces_bool_true_values() {
        assert_eq!(decode_property(&leaf("bool", "1", None)).value, Some(ScalarValue::Bool(true)));
        assert_eq!(decode_property(&leaf("bool", "TRUE", None)).value, Some(ScalarValue::Bool(true)));
        assert_eq!(decode_property(&leaf("bool", "0", None)).value, Some(ScalarValue::Bool(false)));
    }

    #[test]
    fn null_has_no_value() {
        let info = decode_property(&leaf("null", "", None));
        assert_eq!(info.value, None);
    }

    #[test]
    fn resource_is_tagged() {
        let info = decode_property(&leaf("resource", "Resource id #5", None));
        assert_eq!(info.value, Some(ScalarValue::Resource("Resource id #5".to_string())));
        assert_eq!(info.value.unwrap().to_json(), serde_json::json!("[resource: Resource id #5]"));
    }

    #[test]
    fn base64_text_is_decoded_to_utf8() {
        let encoded = encode_base64("hello world");
        let info = decode_property(&leaf("string", &encoded, Some("base64")));
        assert_eq!(info.value, Some(ScalarValue::Str("hello world".to_string())));
    }

    #[test]
    fn truncated_when_size_exceeds_decoded_length() {
        let mut node = leaf("string", "ab", None);
        node.attrs.insert("size".to_string(), "10".to_string());
        let info = decode_property(&node);
        assert_eq!(info.truncated, Some(true));
    }

    #[test]
    fn not_truncated_when_size_matches() {
        let mut node = leaf("string", "abcd", None);
        node.attrs.insert("size".to_string(), "4".to_string());
        let info = decode_property(&node);
        assert_eq!(info.truncated, None);
    }

    #[test]
    fn nested_properties_become_children_with_no_value() {
        let mut parent = leaf("array", "", None);
        parent.children.push(leaf("int", "1", None));
        parent.children.push(leaf("int", "2", None));
        let info = decode_property(&parent);
        assert_eq!(info.value, None);
        assert_eq!(info.children.unwrap().len(), 2);
    }

    #[test]
    fn file_uri_round_trip() {
        let path = "/var/www/html/app/x.php";
        let uri = format!("file://{path}");
        assert_eq!(decode_file_uri(&uri), path);
    }

    #[test]
    fn file_uri_decodes_percent_escapes() {
        assert_eq!(decode_file_uri("file:///var/www/my%20app.php"), "/var/www/my app.php");
    }

    #[test]
    fn non_file_uri_value_is_unchanged() {
        assert_eq!(decode_file_uri("/already/local/path.php"), "/already/local/path.php");
    }

    #[test]
    fn base64_round_trip_preserves_utf8() {
        let original = "caf\u{e9} \u{1F600}";
        let encoded = encode_base64(original);
        assert_eq!(decode_base64_to_utf8(&encoded), original);
    }
}
