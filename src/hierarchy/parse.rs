//! Parse platform UI-tree XML into a uniform [`Node`] tree.
//!
//! Android dumps carry `bounds="[x1,y1][x2,y2]"`; iOS (WebDriverAgent source)
//! carries `x`/`y`/`width`/`height` floats; HarmonyOS follows the Android
//! convention where present, otherwise the iOS one.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use crate::error::DriverError;
use crate::model::{Node, Platform, WindowSize};

/// Parse a hierarchy document. The window size is used to synthesize root
/// bounds when the dump itself carries no geometry for the root element.
pub fn parse_xml(
    xml: &str,
    platform: Platform,
    wsize: WindowSize,
) -> Result<Node, DriverError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    // Stack of open elements; the in-progress node plus its child count so
    // sibling indices stay stable even when elements are elided.
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let node = begin_node(e, platform, stack.last())?;
                stack.push(node);
            }
            Ok(Event::Empty(ref e)) => {
                let node = begin_node(e, platform, stack.last())?;
                finish_node(node, platform, &mut stack, &mut root);
            }
            Ok(Event::End(_)) => {
                let node = match stack.pop() {
                    Some(n) => n,
                    None => {
                        return Err(DriverError::ParseError(
                            "unbalanced closing tag".to_string(),
                        ))
                    }
                };
                finish_node(node, platform, &mut stack, &mut root);
            }
            Ok(Event::Eof) => break,
            // Whitespace-only text, comments and declarations are ignored.
            Ok(Event::Text(_)) | Ok(Event::Comment(_)) | Ok(Event::Decl(_)) => {}
            Ok(_) => {}
            Err(e) => {
                return Err(DriverError::ParseError(format!(
                    "malformed hierarchy xml at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(DriverError::ParseError(format!(
            "unclosed element <{}>",
            stack.last().map(|n| n.name.as_str()).unwrap_or("?")
        )));
    }

    let mut root =
        root.ok_or_else(|| DriverError::ParseError("document has no root element".to_string()))?;
    if root.bounds.is_none() {
        root.set_bounds([0, 0, wsize.width as i32, wsize.height as i32]);
    }
    Ok(root)
}

fn begin_node(
    e: &BytesStart<'_>,
    platform: Platform,
    parent: Option<&Node>,
) -> Result<Node, DriverError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();

    let mut properties = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| DriverError::ParseError(format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map(|v| v.to_string())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).to_string());
        properties.insert(key, value);
    }

    let key = node_key(&name, &properties, parent);
    let mut node = Node::new(key, name, properties);
    if let Some(bounds) = extract_bounds(&node.properties, platform) {
        node.set_bounds(bounds);
    }
    Ok(node)
}

fn finish_node(node: Node, platform: Platform, stack: &mut Vec<Node>, root: &mut Option<Node>) {
    if elide_invisible(&node, platform) {
        return;
    }
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_none() {
                *root = Some(node);
            }
        }
    }
}

/// iOS elements that report `visible="false"` and have a zero-area bound are
/// dropped; everything else is kept regardless of visibility.
fn elide_invisible(node: &Node, platform: Platform) -> bool {
    if platform != Platform::Ios {
        return false;
    }
    if node.properties.get("visible").map(String::as_str) != Some("false") {
        return false;
    }
    match node.bounds {
        Some([x1, y1, x2, y2]) => x1 == x2 || y1 == y2,
        None => true,
    }
}

/// `parent.key + "/" + (resource-id if present else tag "[" index "]")`.
/// The root element uses its tag alone.
fn node_key(name: &str, properties: &HashMap<String, String>, parent: Option<&Node>) -> String {
    let parent = match parent {
        Some(p) => p,
        None => return name.to_string(),
    };
    let index = properties
        .get("index")
        .cloned()
        .unwrap_or_else(|| parent.children.len().to_string());
    let leaf = match properties.get("resource-id").filter(|id| !id.is_empty()) {
        Some(id) => id.clone(),
        None => format!("{}[{}]", name, index),
    };
    let key = format!("{}/{}", parent.key, leaf);
    if parent.children.iter().any(|c| c.key == key) {
        // Sibling keys must stay unique even when resource-ids repeat.
        format!("{}/{}[{}]", parent.key, leaf, parent.children.len())
    } else {
        key
    }
}

/// Derive `[x1, y1, x2, y2]` from the raw attributes, per platform.
pub fn extract_bounds(
    properties: &HashMap<String, String>,
    platform: Platform,
) -> Option<[i32; 4]> {
    match platform {
        Platform::Android => parse_android_bounds(properties.get("bounds")?),
        Platform::Ios => parse_xywh_bounds(properties),
        Platform::Harmony => {
            if let Some(raw) = properties.get("bounds") {
                parse_android_bounds(raw)
            } else {
                parse_xywh_bounds(properties)
            }
        }
    }
}

/// Parse `"[x1,y1][x2,y2]"`. A malformed value yields `None`, never an error.
fn parse_android_bounds(raw: &str) -> Option<[i32; 4]> {
    let re = Regex::new(r"\d+").ok()?;
    let numbers: Vec<i32> = re
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if numbers.len() != 4 {
        return None;
    }
    let b = [numbers[0], numbers[1], numbers[2], numbers[3]];
    if b[0] > b[2] || b[1] > b[3] {
        return None;
    }
    Some(b)
}

fn parse_xywh_bounds(properties: &HashMap<String, String>) -> Option<[i32; 4]> {
    let x: f64 = properties.get("x")?.parse().ok()?;
    let y: f64 = properties.get("y")?.parse().ok()?;
    let w: f64 = properties.get("width")?.parse().ok()?;
    let h: f64 = properties.get("height")?.parse().ok()?;
    if w < 0.0 || h < 0.0 {
        return None;
    }
    Some([
        x.round() as i32,
        y.round() as i32,
        (x + w).round() as i32,
        (y + h).round() as i32,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const WSIZE: WindowSize = WindowSize {
        width: 1080,
        height: 1920,
    };

    const ANDROID_XML: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<hierarchy rotation="0">
  <!-- status bar omitted -->
  <node index="0" class="android.widget.FrameLayout" bounds="[0,0][1080,1920]">
    <node index="0" text="Login" resource-id="com.example:id/login_btn"
          class="android.widget.Button" bounds="[100,200][500,300]"/>
    <node index="1" text="" resource-id="" class="android.view.View" bounds="[broken]"/>
  </node>
</hierarchy>"#;

    #[test]
    fn test_parse_android_tree() {
        let root = parse_xml(ANDROID_XML, Platform::Android, WSIZE).unwrap();
        assert_eq!(root.name, "hierarchy");
        assert_eq!(root.key, "hierarchy");
        let frame = &root.children[0];
        assert_eq!(frame.bounds, Some([0, 0, 1080, 1920]));
        let button = &frame.children[0];
        assert_eq!(button.key.as_str(), "hierarchy/node[0]/com.example:id/login_btn");
        assert_eq!(button.bounds, Some([100, 200, 500, 300]));
        assert_eq!(button.properties.get("text").unwrap(), "Login");
        // Malformed bounds yield a node with absent bounds, not a failure.
        let view = &frame.children[1];
        assert!(view.bounds.is_none());
    }

    #[test]
    fn test_parse_ios_tree_and_visibility() {
        let xml = r#"<AppiumAUT>
  <XCUIElementTypeApplication type="XCUIElementTypeApplication" name="Demo"
      x="0" y="0" width="390" height="844" visible="true">
    <XCUIElementTypeButton type="XCUIElementTypeButton" label="OK"
        x="10" y="20.5" width="100" height="44" visible="true"/>
    <XCUIElementTypeOther type="XCUIElementTypeOther" label="gone"
        x="0" y="0" width="0" height="0" visible="false"/>
  </XCUIElementTypeApplication>
</AppiumAUT>"#;
        let root = parse_xml(xml, Platform::Ios, WSIZE).unwrap();
        let app = &root.children[0];
        assert_eq!(app.bounds, Some([0, 0, 390, 844]));
        // The invisible zero-area element is elided.
        assert_eq!(app.children.len(), 1);
        assert_eq!(app.children[0].bounds, Some([10, 21, 110, 65]));
    }

    #[test]
    fn test_invisible_but_sized_is_kept() {
        let xml = r#"<AppiumAUT>
  <XCUIElementTypeButton label="Hidden" x="0" y="0" width="50" height="50" visible="false"/>
</AppiumAUT>"#;
        let root = parse_xml(xml, Platform::Ios, WSIZE).unwrap();
        assert_eq!(root.children.len(), 1);
    }

    #[test]
    fn test_bounds_ordering_invariant() {
        let root = parse_xml(ANDROID_XML, Platform::Android, WSIZE).unwrap();
        for node in root.walk() {
            if let Some([x1, y1, x2, y2]) = node.bounds {
                assert!(x1 <= x2 && y1 <= y2, "bad bounds on {}", node.key);
            }
        }
    }

    #[test]
    fn test_malformed_root_is_an_error() {
        let err = parse_xml("<hierarchy><node></hierarchy>", Platform::Android, WSIZE)
            .unwrap_err();
        assert!(matches!(err, DriverError::ParseError(_)));
        assert!(parse_xml("", Platform::Android, WSIZE).is_err());
        assert!(parse_xml("not xml at all", Platform::Android, WSIZE).is_err());
    }

    #[test]
    fn test_harmony_falls_back_to_xywh() {
        let xml = r#"<root>
  <Component id="btn" bounds="[0,0][100,100]"/>
  <Component id="img" x="10" y="10" width="30" height="30"/>
</root>"#;
        let root = parse_xml(xml, Platform::Harmony, WSIZE).unwrap();
        assert_eq!(root.children[0].bounds, Some([0, 0, 100, 100]));
        assert_eq!(root.children[1].bounds, Some([10, 10, 40, 40]));
    }

    #[test]
    fn test_entity_decoding() {
        let xml = r#"<hierarchy><node text="Devices &amp; Groups" bounds="[0,0][10,10]"/></hierarchy>"#;
        let root = parse_xml(xml, Platform::Android, WSIZE).unwrap();
        assert_eq!(
            root.children[0].properties.get("text").unwrap(),
            "Devices & Groups"
        );
    }

    #[test]
    fn test_element_count_preserved() {
        let root = parse_xml(ANDROID_XML, Platform::Android, WSIZE).unwrap();
        // hierarchy + frame + button + view
        assert_eq!(root.walk().count(), 4);
        let with_bounds = root
            .walk()
            .filter(|n| n.properties.contains_key("bounds"))
            .filter(|n| n.bounds.is_some())
            .count();
        assert_eq!(with_bounds, 2);
    }
}
