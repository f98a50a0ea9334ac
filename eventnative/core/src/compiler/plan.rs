//! Native plans: the executable form of expressions in the native grammar.

use serde_json::{Number, Value};

/// A compiled expression that runs in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct NativePlan {
    pub(crate) root: Node,
}

impl NativePlan {
    pub(crate) fn new(root: Node) -> Self {
        Self { root }
    }

    /// Root node of the plan tree.
    pub fn root(&self) -> &Node {
        &self.root
    }
}

/// One operation over the implicit input binding `$`.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// The event itself.
    Input,
    /// JavaScript `undefined`.
    Undefined,
    /// A scalar literal, already normalised to its JSON form.
    Literal(Value),
    /// Property reads applied to a base node.
    Path {
        base: Box<Node>,
        segments: Vec<Segment>,
    },
    /// Object literal.
    Object(Vec<Member>),
    /// Array literal.
    Array(Vec<Element>),
}

/// A single property read. Optional reads short-circuit the whole chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub key: String,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Property(String, Node),
    Spread(Node),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Item(Node),
    Spread(Node),
}

/// Largest integer a JavaScript number holds exactly.
pub(crate) const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// JSON value JavaScript produces for a number after `JSON.stringify`
/// followed by a JSON parse: integral values print as their shortest
/// round-trip digits without a fraction, non-finite values become `null`.
pub(crate) fn js_number(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        // Display prints shortest round-trip digits padded with zeros,
        // which is also what JavaScript prints below 1e21.
        let text = format!("{}", n);
        if let Ok(u) = text.parse::<u64>() {
            return Value::from(u);
        }
        if let Ok(i) = text.parse::<i64>() {
            return Value::from(i);
        }
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Property key JavaScript derives from a numeric literal, if it is an integer.
pub(crate) fn numeric_key(n: f64) -> Option<String> {
    if !n.is_finite() || n.fract() != 0.0 || n.abs() > MAX_SAFE_INTEGER {
        return None;
    }
    if n == 0.0 {
        return Some("0".to_string());
    }
    Some(format!("{}", n as i64))
}
