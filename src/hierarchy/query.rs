//! Element queries over a parsed hierarchy: `by=id|text|label|className`
//! walks the [`Node`] tree; `by=xpath` is evaluated against the raw XML so the
//! full expression language stays available, and matches are re-materialized
//! through the parser.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sxd_document::dom::Element;
use sxd_document::parser as xml_parser;
use sxd_xpath::{Context, Factory, Value};

use crate::error::DriverError;
use crate::hierarchy::parse::extract_bounds;
use crate::model::{Node, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum By {
    #[serde(rename = "id")]
    Id,
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "label")]
    Label,
    #[serde(rename = "xpath")]
    XPath,
    #[serde(rename = "className")]
    ClassName,
}

/// A find/click request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementQuery {
    pub by: By,
    pub value: String,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_timeout() -> f64 {
    10.0
}

/// Map a logical attribute name to the platform's raw XML attribute.
///
/// | logical     | android     | ios   | harmony |
/// |-------------|-------------|-------|---------|
/// | text        | text        | label | text    |
/// | resourceId  | resource-id | name  | id      |
/// | className   | class       | type  | type    |
pub fn attr_alias(platform: Platform, logical: &str) -> Option<&'static str> {
    match (platform, logical) {
        (Platform::Android, "text") => Some("text"),
        (Platform::Android, "resourceId") => Some("resource-id"),
        (Platform::Android, "className") => Some("class"),
        (Platform::Ios, "text") => Some("label"),
        (Platform::Ios, "resourceId") => Some("name"),
        (Platform::Ios, "className") => Some("type"),
        (Platform::Harmony, "text") => Some("text"),
        (Platform::Harmony, "resourceId") => Some("id"),
        (Platform::Harmony, "className") => Some("type"),
        _ => None,
    }
}

/// Non-XPath matching rules.
pub fn node_match(node: &Node, by: By, value: &str) -> bool {
    let prop = |k: &str| node.properties.get(k).map(String::as_str);
    match by {
        By::Id => prop("resource-id") == Some(value) || prop("label") == Some(value),
        By::Text => prop("text") == Some(value) || prop("label") == Some(value),
        By::Label => prop("label") == Some(value),
        By::ClassName => node.name == value,
        By::XPath => false,
    }
}

/// Walk the parsed tree in document order collecting matches.
pub fn find_in_tree<'a>(root: &'a Node, by: By, value: &str) -> Vec<&'a Node> {
    root.walk().filter(|n| node_match(n, by, value)).collect()
}

/// A raw XPath match, attributes untouched. Used by the assertion engine.
#[derive(Debug, Clone)]
pub struct XPathMatch {
    pub name: String,
    pub attributes: HashMap<String, String>,
}

/// Evaluate `expr` over the raw document and return the matched elements.
pub fn xpath_select(xml: &str, expr: &str) -> Result<Vec<XPathMatch>, DriverError> {
    let package = xml_parser::parse(xml)
        .map_err(|e| DriverError::ParseError(format!("malformed hierarchy xml: {}", e)))?;
    let document = package.as_document();

    let elements = eval_elements(&document, expr)?;
    Ok(elements
        .into_iter()
        .map(|el| XPathMatch {
            name: el.name().local_part().to_string(),
            attributes: element_attributes(el),
        })
        .collect())
}

/// Evaluate `expr` and re-materialize each match as a [`Node`] subtree with
/// ancestry-derived keys, via the same conversion rules as the parser.
pub fn xpath_to_nodes(
    xml: &str,
    expr: &str,
    platform: Platform,
) -> Result<Vec<Node>, DriverError> {
    let package = xml_parser::parse(xml)
        .map_err(|e| DriverError::ParseError(format!("malformed hierarchy xml: {}", e)))?;
    let document = package.as_document();

    let elements = eval_elements(&document, expr)?;
    Ok(elements
        .into_iter()
        .map(|el| {
            let parent_key = ancestor_key(el);
            convert_element(el, parent_key.as_deref(), sibling_index(el), platform)
        })
        .collect())
}

fn eval_elements<'d>(
    document: &'d sxd_document::dom::Document<'d>,
    expr: &str,
) -> Result<Vec<Element<'d>>, DriverError> {
    let factory = Factory::new();
    let xpath = factory
        .build(expr)
        .map_err(|e| DriverError::InvalidArgument(format!("invalid xpath {:?}: {}", expr, e)))?
        .ok_or_else(|| DriverError::InvalidArgument(format!("empty xpath {:?}", expr)))?;

    let context = Context::new();
    let value = xpath
        .evaluate(&context, document.root())
        .map_err(|e| DriverError::InvalidArgument(format!("xpath {:?} failed: {}", expr, e)))?;

    match value {
        Value::Nodeset(set) => Ok(set
            .document_order()
            .into_iter()
            .filter_map(|n| n.element())
            .collect()),
        // Non-nodeset results (count(), string()) match nothing.
        _ => Ok(Vec::new()),
    }
}

fn element_attributes(el: Element<'_>) -> HashMap<String, String> {
    el.attributes()
        .iter()
        .map(|a| {
            (
                a.name().local_part().to_string(),
                a.value().to_string(),
            )
        })
        .collect()
}

fn parent_element(el: Element<'_>) -> Option<Element<'_>> {
    match el.parent() {
        Some(sxd_document::dom::ParentOfChild::Element(parent)) => Some(parent),
        _ => None,
    }
}

/// Position of the element among its element siblings, used as the key index
/// fallback when no `index` attribute exists.
fn sibling_index(el: Element<'_>) -> usize {
    let parent = match parent_element(el) {
        Some(p) => p,
        None => return 0,
    };
    parent
        .children()
        .iter()
        .filter_map(|c| c.element())
        .position(|sib| sib == el)
        .unwrap_or(0)
}

/// Key of the element's parent chain, `None` when the element is the root.
fn ancestor_key(el: Element<'_>) -> Option<String> {
    let parent = parent_element(el)?;
    let parent_parent = ancestor_key(parent);
    Some(key_for(
        parent,
        parent_parent.as_deref(),
        sibling_index(parent),
    ))
}

fn key_for(el: Element<'_>, parent_key: Option<&str>, index: usize) -> String {
    let name = el.name().local_part();
    let parent_key = match parent_key {
        Some(k) => k,
        None => return name.to_string(),
    };
    let index = el
        .attribute("index")
        .map(|a| a.value().to_string())
        .unwrap_or_else(|| index.to_string());
    match el.attribute("resource-id").map(|a| a.value()).filter(|v| !v.is_empty()) {
        Some(id) => format!("{}/{}", parent_key, id),
        None => format!("{}/{}[{}]", parent_key, name, index),
    }
}

fn convert_element(
    el: Element<'_>,
    parent_key: Option<&str>,
    index: usize,
    platform: Platform,
) -> Node {
    let key = key_for(el, parent_key, index);
    let properties = element_attributes(el);
    let mut node = Node::new(key.clone(), el.name().local_part().to_string(), properties);
    if let Some(bounds) = extract_bounds(&node.properties, platform) {
        node.set_bounds(bounds);
    }
    node.children = el
        .children()
        .iter()
        .filter_map(|c| c.element())
        .enumerate()
        .map(|(i, child)| convert_element(child, Some(&key), i, platform))
        .collect();
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WindowSize;

    const XML: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<hierarchy rotation="0">
  <node index="0" class="android.widget.FrameLayout" bounds="[0,0][1080,1920]">
    <node index="0" text="Login" resource-id="com.example:id/login_btn"
          class="android.widget.Button" bounds="[100,200][500,300]"/>
    <node index="1" text="Cancel" resource-id="com.example:id/cancel_btn"
          class="android.widget.Button" bounds="[100,400][500,500]"/>
  </node>
</hierarchy>"#;

    fn tree() -> Node {
        crate::hierarchy::parse_xml(
            XML,
            Platform::Android,
            WindowSize {
                width: 1080,
                height: 1920,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_find_by_id_and_text() {
        let root = tree();
        let hits = find_in_tree(&root, By::Id, "com.example:id/login_btn");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bounds, Some([100, 200, 500, 300]));

        let hits = find_in_tree(&root, By::Text, "Cancel");
        assert_eq!(hits.len(), 1);

        assert!(find_in_tree(&root, By::Text, "Missing").is_empty());
    }

    #[test]
    fn test_find_by_class_name() {
        let root = tree();
        // className matches the element kind (tag), not the class attribute.
        assert_eq!(find_in_tree(&root, By::ClassName, "node").len(), 3);
    }

    #[test]
    fn test_label_matches_ios_attribute() {
        let xml = r#"<AppiumAUT>
  <XCUIElementTypeButton type="XCUIElementTypeButton" label="OK"
      x="10" y="20" width="100" height="44"/>
</AppiumAUT>"#;
        let root = crate::hierarchy::parse_xml(
            xml,
            Platform::Ios,
            WindowSize {
                width: 390,
                height: 844,
            },
        )
        .unwrap();
        assert_eq!(find_in_tree(&root, By::Label, "OK").len(), 1);
        // by=id also consults the label.
        assert_eq!(find_in_tree(&root, By::Id, "OK").len(), 1);
    }

    #[test]
    fn test_xpath_select() {
        let matches =
            xpath_select(XML, "//*[@resource-id='com.example:id/login_btn']").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].attributes.get("text").unwrap(), "Login");
    }

    #[test]
    fn test_xpath_invalid_expression() {
        let err = xpath_select(XML, "//[bad").unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[test]
    fn test_xpath_to_nodes_materializes_keys_and_bounds() {
        let nodes = xpath_to_nodes(
            XML,
            "//node[@text='Login']",
            Platform::Android,
        )
        .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key, "hierarchy/node[0]/com.example:id/login_btn");
        assert_eq!(nodes[0].bounds, Some([100, 200, 500, 300]));
    }

    #[test]
    fn test_alias_table() {
        assert_eq!(attr_alias(Platform::Android, "resourceId"), Some("resource-id"));
        assert_eq!(attr_alias(Platform::Ios, "text"), Some("label"));
        assert_eq!(attr_alias(Platform::Harmony, "className"), Some("type"));
        assert_eq!(attr_alias(Platform::Android, "unknownKey"), None);
    }
}
