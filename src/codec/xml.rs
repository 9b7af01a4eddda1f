//! A generic attribute/text/child XML tree, parsed with `quick_xml`.
//!
//! DBGp responses are shallow, small documents (a handful of `<property>` or
//! `<stack>` children under one root), so a single eager tree is simpler to
//! work with than a streaming reader; the teacher takes the analogous
//! eager-parse approach for DAP's JSON bodies (`serde_json::from_slice`
//! straight into a `Value` plus a typed struct).

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    pub fn child_named(&self, tag: &str) -> Option<&XmlNode> {
        self.children_named(tag).next()
    }
}

/// Parse a complete XML document into a single root `XmlNode`.
pub fn parse(bytes: &[u8]) -> Result<XmlNode> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) => {
                let node = new_node(&tag)?;
                stack.push(node);
            }
            Event::Empty(tag) => {
                let node = new_node(&tag)?;
                push_child(&mut stack, &mut root, node);
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(cdata) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| BridgeError::Unknown("xml: unbalanced end tag".to_string()))?;
                push_child(&mut stack, &mut root, node);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| BridgeError::Unknown("xml: empty document".to_string()))
}

fn new_node(tag: &quick_xml::events::BytesStart) -> Result<XmlNode> {
    let mut node = XmlNode {
        tag: String::from_utf8_lossy(tag.name().as_ref()).into_owned(),
        ..Default::default()
    };
    for attr in tag.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        node.attrs.insert(key, value);
    }
    Ok(node)
}

fn push_child(stack: &mut Vec<XmlNode>, root: &mut Option<XmlNode>, node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => *root = Some(node),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_nested_elements_and_attributes() {
        let xml = br#"<response status="break" reason="ok"><message><![CDATA[hi]]></message></response>"#;
        let root = parse(xml).unwrap();
        assert_eq!(root.tag, "response");
        assert_eq!(root.attr("status"), Some("break"));
        assert_eq!(root.attr("reason"), Some("ok"));
        let message = root.child_named("message").unwrap();
        assert_eq!(message.text, "hi");
    }

    #[test]
    fn parses_self_closing_children() {
        let xml = br#"<init idekey="x"/>"#;
        let root = parse(xml).unwrap();
        assert_eq!(root.tag, "init");
        assert_eq!(root.attr("idekey"), Some("x"));
    }

    #[test]
    fn collects_multiple_same_named_children_in_order() {
        let xml = br#"<response><property name="a"/><property name="b"/></response>"#;
        let root = parse(xml).unwrap();
        let names: Vec<_> = root.children_named("property").map(|p| p.attr("name").unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
