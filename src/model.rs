//! Shared data model: devices, UI nodes, window geometry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Supported device platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Harmony,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Harmony => "harmony",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "android" | "android_adb" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "harmony" => Ok(Platform::Harmony),
            other => anyhow::bail!("unknown platform: {}", other),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected device as reported by a provider's `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    pub enabled: bool,
}

impl DeviceInfo {
    pub fn online(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            status: "device".to_string(),
            name: None,
            model: None,
            product: None,
            enabled: true,
        }
    }
}

/// Screen dimensions in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Rectangle derived from node bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A single element of the UI hierarchy.
///
/// `properties` keeps the raw platform attribute names; normalization happens
/// at query time via the platform alias table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable path string, unique among siblings; a parent's key is a strict
    /// prefix of its children's keys.
    pub key: String,
    /// Element kind (XML tag).
    pub name: String,
    pub properties: HashMap<String, String>,
    /// `[x1, y1, x2, y2]` in device pixels, absent when the source had no
    /// usable geometry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[i32; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rect: Option<Rect>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(key: String, name: String, properties: HashMap<String, String>) -> Self {
        Self {
            key,
            name,
            properties,
            bounds: None,
            rect: None,
            children: Vec::new(),
        }
    }

    /// Attach bounds and the derived rect in one step.
    pub fn set_bounds(&mut self, bounds: [i32; 4]) {
        self.rect = Some(Rect {
            x: bounds[0],
            y: bounds[1],
            width: bounds[2] - bounds[0],
            height: bounds[3] - bounds[1],
        });
        self.bounds = Some(bounds);
    }

    /// Depth-first traversal in document order, including `self`.
    pub fn walk(&self) -> NodeIter<'_> {
        NodeIter { stack: vec![self] }
    }
}

pub struct NodeIter<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // Push children reversed so iteration stays in document order.
        for child in node.children.iter().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}

/// An installed application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(rename = "packageName")]
    pub package_name: String,
    #[serde(rename = "versionName", skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    #[serde(rename = "versionCode", skip_serializing_if = "Option::is_none")]
    pub version_code: Option<i64>,
}

/// The foreground application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentApp {
    pub package: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_roundtrip() {
        for p in [Platform::Android, Platform::Ios, Platform::Harmony] {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
        assert!("windows".parse::<Platform>().is_err());
    }

    #[test]
    fn test_set_bounds_derives_rect() {
        let mut node = Node::new("root".into(), "hierarchy".into(), HashMap::new());
        node.set_bounds([10, 20, 110, 220]);
        let rect = node.rect.unwrap();
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (10, 20, 100, 200));
    }

    #[test]
    fn test_walk_document_order() {
        let mut root = Node::new("a".into(), "a".into(), HashMap::new());
        let mut b = Node::new("a/b".into(), "b".into(), HashMap::new());
        b.children.push(Node::new("a/b/c".into(), "c".into(), HashMap::new()));
        root.children.push(b);
        root.children.push(Node::new("a/d".into(), "d".into(), HashMap::new()));
        let keys: Vec<_> = root.walk().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "a/b", "a/b/c", "a/d"]);
    }
}
