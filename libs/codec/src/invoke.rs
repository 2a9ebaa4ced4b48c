//! Invoke Envelope
//!
//! The RPC message exchanged between systems: a listener name plus an ordered
//! list of typed parameters. On the wire an envelope is a [`Document`]:
//!
//! ```text
//! <invoke listener="optimize">
//!     <parameter type="document"><travel .../></parameter>
//!     <parameter type="number" name="_Piece_first">0</parameter>
//! </invoke>
//! ```
//!
//! Parameters whose name starts with `_` are framework bookkeeping. They ride
//! along with the envelope but are not positional arguments of a handler.

use crate::document::Document;
use crate::error::{CodecError, Result};

/// Root tag of an encoded envelope
pub const INVOKE_TAG: &str = "invoke";
/// Tag of each encoded parameter
pub const PARAMETER_TAG: &str = "parameter";

/// Reserved parameter carrying the round identifier of a dispatched piece
pub const HISTORY_UID: &str = "_History_uid";
/// Reserved parameter carrying the first piece index of a dispatched range
pub const PIECE_FIRST: &str = "_Piece_first";
/// Reserved parameter carrying the number of pieces in a dispatched range
pub const PIECE_SIZE: &str = "_Piece_size";

/// Reserved parameter counting pieces a sub-tree could not complete
pub const LOST_PIECES: &str = "_Lost_pieces";
/// Reserved parameter listing the lost piece ranges as a document
pub const LOST_RANGES: &str = "_Lost_ranges";

/// Numbers travel as `f64`; integers above this lose precision on the wire
pub const MAX_EXACT_INTEGER: u64 = 1 << 53;

/// Parameter payload
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Document(Document),
}

impl ParameterValue {
    /// Type tag written to the wire
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Document(_) => "document",
        }
    }
}

/// One typed, optionally named, envelope parameter
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeParameter {
    name: Option<String>,
    value: ParameterValue,
}

impl InvokeParameter {
    pub fn new(value: impl Into<ParameterValue>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn into_value(self) -> ParameterValue {
        self.value
    }

    /// Bookkeeping parameters are excluded from handler arity
    pub fn is_reserved(&self) -> bool {
        self.name.as_deref().is_some_and(|n| n.starts_with('_'))
    }

    pub fn as_bool(&self) -> Result<bool> {
        match &self.value {
            ParameterValue::Boolean(b) => Ok(*b),
            other => Err(mismatch("boolean", other)),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match &self.value {
            ParameterValue::Number(n) => Ok(*n),
            other => Err(mismatch("number", other)),
        }
    }

    /// Number as a non-negative integer; fractional or negative values are rejected
    pub fn as_u64(&self) -> Result<u64> {
        let value = self.as_f64()?;
        if value.fract() != 0.0 || value < 0.0 || value > u64::MAX as f64 {
            return Err(CodecError::NumberOutOfRange { value, target: "u64" });
        }
        Ok(value as u64)
    }

    pub fn as_i64(&self) -> Result<i64> {
        let value = self.as_f64()?;
        if value.fract() != 0.0 || value < i64::MIN as f64 || value > i64::MAX as f64 {
            return Err(CodecError::NumberOutOfRange { value, target: "i64" });
        }
        Ok(value as i64)
    }

    pub fn as_str(&self) -> Result<&str> {
        match &self.value {
            ParameterValue::String(s) => Ok(s),
            other => Err(mismatch("string", other)),
        }
    }

    pub fn as_document(&self) -> Result<&Document> {
        match &self.value {
            ParameterValue::Document(d) => Ok(d),
            other => Err(mismatch("document", other)),
        }
    }

    fn to_document(&self) -> Document {
        let mut node = Document::new(PARAMETER_TAG).with_attribute("type", self.value.type_tag());
        if let Some(name) = &self.name {
            node.set_attribute("name", name);
        }
        match &self.value {
            ParameterValue::Boolean(b) => node.set_value(b.to_string()),
            ParameterValue::Number(n) => node.set_value(n.to_string()),
            ParameterValue::String(s) => node.set_value(s.clone()),
            ParameterValue::Document(d) => node.push_child(d.clone()),
        }
        node
    }

    fn from_document(node: &Document, index: usize) -> Result<Self> {
        let type_tag = node.attribute("type").unwrap_or_default();
        let raw = node.value().unwrap_or_default();
        let invalid = || CodecError::InvalidValue {
            type_tag: type_tag.to_string(),
            index,
            value: raw.to_string(),
        };

        let value = match type_tag {
            "boolean" => ParameterValue::Boolean(raw.parse().map_err(|_| invalid())?),
            "number" => ParameterValue::Number(raw.parse().map_err(|_| invalid())?),
            "string" => ParameterValue::String(raw.to_string()),
            "document" => ParameterValue::Document(
                node.children()
                    .first()
                    .cloned()
                    .ok_or(CodecError::MissingDocument { index })?,
            ),
            other => {
                return Err(CodecError::UnknownParameterType {
                    type_tag: other.to_string(),
                    index,
                })
            }
        };

        Ok(Self {
            name: node.attribute("name").map(str::to_string),
            value,
        })
    }
}

fn mismatch(expected: &'static str, actual: &ParameterValue) -> CodecError {
    CodecError::TypeMismatch {
        expected,
        actual: actual.type_tag(),
    }
}

macro_rules! number_conversions {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ParameterValue {
                fn from(value: $t) -> Self {
                    ParameterValue::Number(value as f64)
                }
            }
        )*
    };
}

number_conversions!(f64, f32, i64, i32, u64, u32, usize);

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Boolean(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Document> for ParameterValue {
    fn from(value: Document) -> Self {
        ParameterValue::Document(value)
    }
}

macro_rules! parameter_conversions {
    ($($t:ty),*) => {
        $(
            impl From<$t> for InvokeParameter {
                fn from(value: $t) -> Self {
                    InvokeParameter::new(value)
                }
            }
        )*
    };
}

parameter_conversions!(bool, f64, f32, i64, i32, u64, u32, usize, &str, String, Document, ParameterValue);

/// RPC envelope: listener name plus ordered parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Invoke {
    listener: String,
    parameters: Vec<InvokeParameter>,
}

impl Invoke {
    pub fn new(listener: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            parameters: Vec::new(),
        }
    }

    /// Builder: append a parameter
    pub fn with(mut self, parameter: impl Into<InvokeParameter>) -> Self {
        self.parameters.push(parameter.into());
        self
    }

    pub fn push(&mut self, parameter: impl Into<InvokeParameter>) {
        self.parameters.push(parameter.into());
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    /// All parameters, reserved ones included, in declaration order
    pub fn parameters(&self) -> &[InvokeParameter] {
        &self.parameters
    }

    /// Positional arguments: every non-reserved parameter in order
    pub fn arguments(&self) -> impl Iterator<Item = &InvokeParameter> {
        self.parameters.iter().filter(|p| !p.is_reserved())
    }

    pub fn arity(&self) -> usize {
        self.arguments().count()
    }

    /// Positional argument by index
    pub fn argument(&self, index: usize) -> Result<&InvokeParameter> {
        self.arguments()
            .nth(index)
            .ok_or(CodecError::MissingArgument { index })
    }

    /// Fail unless exactly `expected` positional arguments are present
    pub fn expect_arity(&self, expected: usize) -> Result<()> {
        let actual = self.arity();
        if actual != expected {
            return Err(CodecError::ArityMismatch {
                listener: self.listener.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Named parameter lookup, reserved or not
    pub fn find(&self, name: &str) -> Option<&InvokeParameter> {
        self.parameters.iter().find(|p| p.name() == Some(name))
    }

    /// Remove and return a named parameter
    pub fn take(&mut self, name: &str) -> Option<InvokeParameter> {
        let index = self.parameters.iter().position(|p| p.name() == Some(name))?;
        Some(self.parameters.remove(index))
    }

    /// Replace every parameter called `name` with a single one holding `value`
    pub fn set_named(&mut self, name: &str, value: impl Into<ParameterValue>) {
        self.parameters.retain(|p| p.name() != Some(name));
        self.parameters.push(InvokeParameter::named(name, value));
    }

    /// Encode into the fixed document shape
    pub fn to_document(&self) -> Document {
        let mut root = Document::new(INVOKE_TAG).with_attribute("listener", &self.listener);
        for parameter in &self.parameters {
            root.push_child(parameter.to_document());
        }
        root
    }

    /// Decode from the fixed document shape
    pub fn from_document(root: &Document) -> Result<Self> {
        if root.tag() != INVOKE_TAG {
            return Err(CodecError::UnexpectedTag {
                expected: INVOKE_TAG.to_string(),
                actual: root.tag().to_string(),
            });
        }
        let listener = root
            .attribute("listener")
            .filter(|l| !l.is_empty())
            .ok_or(CodecError::MissingListener)?;

        let parameters = root
            .children()
            .iter()
            .filter(|c| c.tag() == PARAMETER_TAG)
            .enumerate()
            .map(|(index, node)| InvokeParameter::from_document(node, index))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            listener: listener.to_string(),
            parameters,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_document().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_document(&Document::from_bytes(bytes)?)
    }
}
