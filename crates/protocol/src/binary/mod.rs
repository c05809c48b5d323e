//! Binary node model and codec.
//!
//! Every stanza exchanged with the server is a tree of [`BinaryNode`]s. The
//! wire form is a compact, dictionary-compressed serialization:
//!
//! ```text
//! node    := list(size) string(tag) (string(key) string(value))* [content]
//! size    := 1 + 2 * attrs + (1 if content is present)
//! content := list(n) node{n} | BINARY_8/20/32 length bytes
//! string  := LIST_EMPTY | token | DICTIONARY_i index | NIBBLE_8 | HEX_8
//!          | JID_PAIR | AD_JID | BINARY_8/20/32 length bytes
//! ```
//!
//! Decoding is hardened against untrusted input: it never reads past the
//! buffer, rejects nesting deeper than a configured limit and checks every
//! count against the remaining input before allocating.

mod decode;
mod encode;
pub mod jid;
pub mod tokens;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use decode::{decode_node, decode_node_with_depth};
pub use encode::{encode_node, encode_node_with_depth};
pub use jid::{DeviceAddress, Jid};

/// Default maximum nesting depth accepted by the codec.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Wire tag bytes.
pub mod tags {
    /// Empty list, or the empty string in string position.
    pub const LIST_EMPTY: u8 = 0;
    /// Primary token for `xmlstreamend`.
    pub const STREAM_END: u8 = 2;
    /// First secondary dictionary.
    pub const DICTIONARY_0: u8 = 236;
    /// Second secondary dictionary.
    pub const DICTIONARY_1: u8 = 237;
    /// Third secondary dictionary.
    pub const DICTIONARY_2: u8 = 238;
    /// Fourth secondary dictionary.
    pub const DICTIONARY_3: u8 = 239;
    /// Device-qualified address: domain byte, device byte, user string.
    pub const AD_JID: u8 = 247;
    /// List with a one-byte size.
    pub const LIST_8: u8 = 248;
    /// List with a two-byte size.
    pub const LIST_16: u8 = 249;
    /// Address: user string (or empty) then server string.
    pub const JID_PAIR: u8 = 250;
    /// Packed upper-case hexadecimal string.
    pub const HEX_8: u8 = 251;
    /// Byte literal with a one-byte length.
    pub const BINARY_8: u8 = 252;
    /// Byte literal with a 20-bit length.
    pub const BINARY_20: u8 = 253;
    /// Byte literal with a four-byte length.
    pub const BINARY_32: u8 = 254;
    /// Packed numeric string (`0-9`, `-`, `.`).
    pub const NIBBLE_8: u8 = 255;

    /// Longest string accepted by the packed encodings.
    pub const PACKED_MAX: usize = 127;
}

/// Content of a node: nothing, child nodes, or a raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeContent {
    /// No content.
    #[default]
    None,
    /// Ordered child nodes.
    Nodes(Vec<BinaryNode>),
    /// Raw bytes.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// One unit of the binary wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryNode {
    /// Element name.
    pub tag: String,
    /// Attributes. Keys are unique; ordering carries no meaning.
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Content.
    #[serde(default)]
    pub content: NodeContent,
}

impl BinaryNode {
    /// Creates a node with no attributes and no content.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: NodeContent::None,
        }
    }

    /// Adds or replaces an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Adds every attribute from an iterator.
    pub fn with_attrs<K, V>(mut self, attrs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in attrs {
            self.attrs.insert(key.into(), value.into());
        }
        self
    }

    /// Sets child nodes as content.
    pub fn with_children(mut self, children: Vec<BinaryNode>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    /// Sets a raw payload as content.
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    /// Returns an attribute value.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Returns the child nodes, or an empty slice.
    pub fn children(&self) -> &[BinaryNode] {
        match &self.content {
            NodeContent::Nodes(children) => children,
            _ => &[],
        }
    }

    /// Returns the first child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&BinaryNode> {
        self.children().iter().find(|child| child.tag == tag)
    }

    /// Returns every child with the given tag.
    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a BinaryNode> {
        self.children().iter().filter(move |child| child.tag == tag)
    }

    /// Returns the raw payload, if the content is bytes.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

impl fmt::Display for BinaryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (key, value) in &self.attrs {
            write!(f, " {}=\"{}\"", key, escape_attr(value))?;
        }
        match &self.content {
            NodeContent::None => write!(f, "/>"),
            NodeContent::Nodes(children) if children.is_empty() => write!(f, "/>"),
            NodeContent::Nodes(children) => {
                write!(f, ">")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                write!(f, "</{}>", self.tag)
            }
            NodeContent::Bytes(bytes) => {
                write!(f, ">")?;
                match std::str::from_utf8(bytes) {
                    Ok(text) if !text.chars().any(char::is_control) => {
                        write!(f, "{}", escape_attr(text))?
                    }
                    _ => write!(f, "<!-- {} bytes -->", bytes.len())?,
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> BinaryNode {
        BinaryNode::new("iq")
            .with_attr("id", "1")
            .with_attr("type", "get")
            .with_attr("xmlns", "w:p")
            .with_children(vec![BinaryNode::new("ping")])
    }

    #[test]
    fn test_builder_and_accessors() {
        let node = ping();
        assert_eq!(node.attr("type"), Some("get"));
        assert_eq!(node.attr("missing"), None);
        assert_eq!(node.children().len(), 1);
        assert!(node.child("ping").is_some());
        assert!(node.bytes().is_none());
    }

    #[test]
    fn test_children_by_tag() {
        let node = BinaryNode::new("message").with_children(vec![
            BinaryNode::new("enc").with_attr("type", "pkmsg"),
            BinaryNode::new("meta"),
            BinaryNode::new("enc").with_attr("type", "skmsg"),
        ]);
        let types: Vec<_> = node
            .children_by_tag("enc")
            .filter_map(|enc| enc.attr("type"))
            .collect();
        assert_eq!(types, vec!["pkmsg", "skmsg"]);
    }

    #[test]
    fn test_display_xml_like() {
        assert_eq!(
            ping().to_string(),
            r#"<iq id="1" type="get" xmlns="w:p"><ping/></iq>"#
        );
    }

    #[test]
    fn test_display_bytes() {
        let text = BinaryNode::new("body").with_bytes(b"hello".to_vec());
        assert_eq!(text.to_string(), "<body>hello</body>");

        let binary = BinaryNode::new("enc").with_bytes(vec![0u8, 1, 2]);
        assert_eq!(binary.to_string(), "<enc><!-- 3 bytes --></enc>");
    }

    #[test]
    fn test_json_roundtrip() {
        let node = ping();
        let json = serde_json::to_string(&node).unwrap();
        let back: BinaryNode = serde_json::from_str(&json).unwrap();
        assert_eq!(node, back);
    }
}
