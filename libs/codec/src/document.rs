//! Structured Document Tree
//!
//! An XML-like tree used as the opaque payload carrier: a tag name, an optional
//! text value, named attributes and ordered children. Payloads travel as this
//! tree; its linear byte form is produced with bincode.
//!
//! # Wire Form
//!
//! The tree is flattened into a pre-order node table, each entry carrying its
//! child count, so neither encoding nor decoding recurses. Decoding enforces
//! [`MAX_DEPTH`] and [`MAX_ENCODED_SIZE`]; a frame that breaks either is an
//! [`CodecError::Encoding`] like any other malformed input.

use crate::error::{CodecError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Deepest nesting accepted on either side of the wire (the root is depth 1)
pub const MAX_DEPTH: usize = 128;

/// Largest linear encoding produced or accepted
pub const MAX_ENCODED_SIZE: u64 = 16 * 1024 * 1024;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ENCODED_SIZE)
}

/// One pre-order entry of the wire node table
#[derive(Serialize, Deserialize)]
struct WireNode {
    tag: String,
    value: Option<String>,
    attributes: BTreeMap<String, String>,
    child_count: u64,
}

/// A node of a structured document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    tag: String,
    value: Option<String>,
    attributes: BTreeMap<String, String>,
    children: Vec<Document>,
}

impl Document {
    /// Create an empty node with the given tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Builder: set the text value
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Builder: set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(name.into(), value.to_string());
        self
    }

    /// Builder: append a child
    pub fn with_child(mut self, child: Document) -> Self {
        self.children.push(child);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
    }

    /// Attribute value by name
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Attribute parsed into `T`, `None` when absent or unparsable
    pub fn attribute_as<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.attribute(name).and_then(|raw| raw.parse().ok())
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl ToString) {
        self.attributes.insert(name.into(), value.to_string());
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn children(&self) -> &[Document] {
        &self.children
    }

    pub fn push_child(&mut self, child: Document) {
        self.children.push(child);
    }

    /// First child with the given tag
    pub fn child(&self, tag: &str) -> Option<&Document> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// Drop value, attributes and children, keeping the tag
    pub fn clear(&mut self) {
        self.value = None;
        self.attributes.clear();
        self.children.clear();
    }

    /// Serialize to the linear byte encoding used on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut table = Vec::new();
        let mut pending = vec![(self, 1usize)];
        while let Some((node, depth)) = pending.pop() {
            if depth > MAX_DEPTH {
                return Err(CodecError::encoding(
                    format!("document nests deeper than {} levels", MAX_DEPTH),
                    0,
                ));
            }
            table.push(WireNode {
                tag: node.tag.clone(),
                value: node.value.clone(),
                attributes: node.attributes.clone(),
                child_count: node.children.len() as u64,
            });
            pending.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
        wire_options()
            .serialize(&table)
            .map_err(|e| CodecError::encoding(e, 0))
    }

    /// Parse the linear byte encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let malformed = |message: String| CodecError::encoding(message, bytes.len());
        let table: Vec<WireNode> = wire_options()
            .deserialize(bytes)
            .map_err(|e| CodecError::encoding(e, bytes.len()))?;

        let mut nodes = table.into_iter();
        let root = nodes
            .next()
            .ok_or_else(|| malformed("empty node table".to_string()))?;
        // Path from the root to the node being filled, with children still owed
        let mut open = vec![Self::from_wire(root)];
        while let Some((_, remaining)) = open.last_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                let next = nodes
                    .next()
                    .ok_or_else(|| malformed("node table ends inside a node".to_string()))?;
                if open.len() >= MAX_DEPTH {
                    return Err(malformed(format!("document nests deeper than {} levels", MAX_DEPTH)));
                }
                open.push(Self::from_wire(next));
                continue;
            }

            let (finished, _) = open.pop().ok_or_else(|| malformed("unbalanced node table".to_string()))?;
            match open.last_mut() {
                Some((parent, _)) => parent.children.push(finished),
                None if nodes.next().is_some() => {
                    return Err(malformed("trailing nodes after root".to_string()))
                }
                None => return Ok(finished),
            }
        }
        Err(malformed("node table has no root".to_string()))
    }

    fn from_wire(node: WireNode) -> (Self, u64) {
        let document = Self {
            tag: node.tag,
            value: node.value,
            attributes: node.attributes,
            children: Vec::new(),
        };
        (document, node.child_count)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (name, value) in &self.attributes {
            write!(f, " {}=\"{}\"", name, value)?;
        }
        if self.value.is_none() && self.children.is_empty() {
            return write!(f, " />");
        }
        write!(f, ">")?;
        if let Some(value) = &self.value {
            write!(f, "{}", value)?;
        }
        for child in &self.children {
            write!(f, "{}", child)?;
        }
        write!(f, "</{}>", self.tag)
    }
}
