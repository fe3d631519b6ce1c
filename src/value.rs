//! Attribute value container.
//!
//! Attribute values attached to nodes and edges are dynamically typed: a
//! value may be empty, a number, a piece of text, or an opaque configuration
//! tree. Text carries a cached numeric interpretation so repeated numeric
//! access does not re-parse.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;

/// A dynamically typed attribute value.
///
/// Text and numbers convert into each other where possible: a value
/// constructed from the text `"42"` reports `is_number()` and yields `42.0`
/// from [`AttributeValue::as_number`]. The numeric interpretation is
/// computed once, when the value is constructed.
///
/// # Examples
///
/// ```
/// use srql::AttributeValue;
///
/// let v = AttributeValue::text("6371");
/// assert!(v.is_number());
/// assert_eq!(v.as_number().unwrap(), 6371.0);
///
/// let w = AttributeValue::text("pose");
/// assert!(!w.is_number());
/// assert!(w.as_number().is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// No information. Evaluates to an empty string, never to a number.
    Empty,
    /// A numeric value.
    Number(f64),
    /// A textual value with its cached numeric interpretation.
    Text {
        /// The raw text.
        raw: String,
        /// `Some` if the whole text parses as a number.
        parsed: Option<f64>,
    },
    /// An opaque configuration tree, passed through verbatim.
    Xml(Arc<serde_json::Value>),
}

impl AttributeValue {
    /// Creates an empty value.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// Creates a numeric value.
    #[must_use]
    pub const fn number(v: f64) -> Self {
        Self::Number(v)
    }

    /// Creates a textual value, caching its numeric interpretation.
    ///
    /// An empty string produces [`AttributeValue::Empty`].
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        let raw = s.into();
        if raw.is_empty() {
            return Self::Empty;
        }
        let parsed = parse_number(&raw);
        Self::Text { raw, parsed }
    }

    /// Creates a value holding an opaque configuration tree.
    #[must_use]
    pub fn xml(tree: Arc<serde_json::Value>) -> Self {
        Self::Xml(tree)
    }

    /// Returns true if this value holds no information.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns true if this value has a numeric interpretation.
    #[must_use]
    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Number(_) | Self::Text { parsed: Some(_), .. })
    }

    /// Returns the numeric interpretation of this value.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::NotANumber`] if the value is empty, an opaque
    /// tree, or text that does not parse as a number.
    pub fn as_number(&self) -> Result<f64, EvalError> {
        match self {
            Self::Number(v) => Ok(*v),
            Self::Text {
                parsed: Some(v), ..
            } => Ok(*v),
            other => Err(EvalError::NotANumber {
                text: other.as_text(),
            }),
        }
    }

    /// Returns the textual form of this value.
    ///
    /// Empty values render as the empty string, numbers in their shortest
    /// round-trip form, opaque trees as compact JSON.
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Number(v) => format_number(*v),
            Self::Text { raw, .. } => raw.clone(),
            Self::Xml(tree) => tree.to_string(),
        }
    }

    /// Returns the opaque configuration tree, if this value holds one.
    #[must_use]
    pub fn as_xml(&self) -> Option<&Arc<serde_json::Value>> {
        match self {
            Self::Xml(tree) => Some(tree),
            _ => None,
        }
    }
}

impl Default for AttributeValue {
    fn default() -> Self {
        Self::Empty
    }
}

impl PartialEq for AttributeValue {
    /// Opaque trees compare by identity of the shared tree. Otherwise the
    /// comparison is numeric when both sides are numbers and textual when
    /// either side is not.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Xml(a), Self::Xml(b)) => Arc::ptr_eq(a, b),
            (Self::Xml(_), _) | (_, Self::Xml(_)) => false,
            _ => {
                if let (Ok(a), Ok(b)) = (self.as_number(), other.as_number()) {
                    a == b
                } else {
                    self.as_text() == other.as_text()
                }
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::text(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::text(v)
    }
}

/// Strict number parse: the whole string must be consumed.
fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Renders a number without a trailing `.0` for integral values.
fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.0}")
    } else {
        format!("{v}")
    }
}
