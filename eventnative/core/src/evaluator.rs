//! In-process evaluation of native plans.
//!
//! Results match what the scripting runtime returns for the same expression
//! after its output went through `JSON.stringify` and back: `undefined`
//! members vanish, integer-like keys sort first, numbers print the way
//! JavaScript prints them.

use crate::compiler::plan::{js_number, Element, Member, NativePlan, Node, MAX_SAFE_INTEGER};
use crate::error::Error;
use crate::event::{type_name, Event};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

/// Evaluates `plan` against one event. Pure; safe to call concurrently.
pub fn evaluate(plan: &NativePlan, event: &Event) -> Result<Value, Error> {
    let result = eval(plan.root(), event)?;
    Ok(result.into_value().unwrap_or(Value::Null))
}

/// Intermediate result. Borrowed variants avoid cloning event data that is
/// only read through.
enum Resolved<'a> {
    Undefined,
    Input(&'a Event),
    Borrowed(&'a Value),
    Owned(Value),
}

impl<'a> Resolved<'a> {
    fn is_nullish(&self) -> bool {
        match self {
            Resolved::Undefined => true,
            Resolved::Borrowed(value) => value.is_null(),
            Resolved::Owned(value) => value.is_null(),
            Resolved::Input(_) => false,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Resolved::Undefined => "undefined",
            Resolved::Input(_) => "object",
            Resolved::Borrowed(value) => type_name(value),
            Resolved::Owned(value) => type_name(value),
        }
    }

    /// Normalised JSON value, `None` for `undefined`.
    fn into_value(self) -> Option<Value> {
        match self {
            Resolved::Undefined => None,
            Resolved::Input(event) => Some(Value::Object(normalize_object(event))),
            Resolved::Borrowed(value) => Some(normalize(value)),
            Resolved::Owned(value) => Some(value),
        }
    }

    fn get(self, key: &str) -> Result<Resolved<'a>, Error> {
        let resolved = match self {
            Resolved::Undefined => Resolved::Undefined,
            Resolved::Input(event) => event.get(key).map_or(Resolved::Undefined, Resolved::Borrowed),
            Resolved::Borrowed(value) => match value {
                Value::Object(map) => map.get(key).map_or(Resolved::Undefined, Resolved::Borrowed),
                Value::Array(items) => match key {
                    "length" => Resolved::Owned(Value::from(items.len())),
                    _ => array_index(key)
                        .and_then(|i| items.get(i as usize))
                        .map_or(Resolved::Undefined, Resolved::Borrowed),
                },
                Value::String(s) => string_property(s, key)?,
                _ => Resolved::Undefined,
            },
            Resolved::Owned(value) => match value {
                Value::Object(mut map) => map.remove(key).map_or(Resolved::Undefined, Resolved::Owned),
                Value::Array(mut items) => match key {
                    "length" => Resolved::Owned(Value::from(items.len())),
                    _ => match array_index(key).map(|i| i as usize) {
                        Some(i) if i < items.len() => Resolved::Owned(items.swap_remove(i)),
                        _ => Resolved::Undefined,
                    },
                },
                Value::String(s) => string_property(&s, key)?,
                _ => Resolved::Undefined,
            },
        };
        Ok(resolved)
    }
}

fn eval<'a>(node: &'a Node, event: &'a Event) -> Result<Resolved<'a>, Error> {
    match node {
        Node::Input => Ok(Resolved::Input(event)),
        Node::Undefined => Ok(Resolved::Undefined),
        Node::Literal(value) => Ok(Resolved::Borrowed(value)),
        Node::Path { base, segments } => {
            let mut current = eval(base, event)?;
            for segment in segments {
                if current.is_nullish() {
                    if segment.optional {
                        return Ok(Resolved::Undefined);
                    }
                    return Err(Error::evaluation(format!(
                        "Cannot read properties of {} (reading '{}')",
                        current.describe(),
                        segment.key
                    )));
                }
                current = current.get(&segment.key)?;
            }
            Ok(current)
        }
        Node::Object(members) => {
            let mut builder = ObjectBuilder::default();
            for member in members {
                match member {
                    Member::Property(key, node) => {
                        builder.set(key.clone(), eval(node, event)?.into_value())
                    }
                    Member::Spread(node) => builder.spread(eval(node, event)?)?,
                }
            }
            Ok(Resolved::Owned(Value::Object(builder.finish())))
        }
        Node::Array(elements) => {
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                match element {
                    Element::Item(node) => {
                        items.push(eval(node, event)?.into_value().unwrap_or(Value::Null))
                    }
                    Element::Spread(node) => spread_into_array(&mut items, eval(node, event)?)?,
                }
            }
            Ok(Resolved::Owned(Value::Array(items)))
        }
    }
}

fn string_property<'a>(s: &str, key: &str) -> Result<Resolved<'a>, Error> {
    if key == "length" {
        return Ok(Resolved::Owned(Value::from(s.encode_utf16().count())));
    }
    let Some(index) = array_index(key) else {
        return Ok(Resolved::Undefined);
    };
    match s.encode_utf16().nth(index as usize) {
        None => Ok(Resolved::Undefined),
        Some(unit) => char::from_u32(u32::from(unit))
            .map(|c| Resolved::Owned(Value::String(c.to_string())))
            .ok_or_else(|| Error::evaluation(format!("index {} splits a surrogate pair", index))),
    }
}

fn spread_into_array(items: &mut Vec<Value>, source: Resolved<'_>) -> Result<(), Error> {
    match source {
        Resolved::Borrowed(Value::Array(values)) => items.extend(values.iter().map(normalize)),
        Resolved::Owned(Value::Array(values)) => items.extend(values),
        Resolved::Borrowed(Value::String(s)) => items.extend(code_points(s)),
        Resolved::Owned(Value::String(s)) => items.extend(code_points(&s)),
        other => {
            return Err(Error::evaluation(format!(
                "{} is not iterable",
                other.describe()
            )))
        }
    }
    Ok(())
}

fn code_points(s: &str) -> impl Iterator<Item = Value> + '_ {
    s.chars().map(|c| Value::String(c.to_string()))
}

/// Object under construction. Keys assigned `undefined` keep their slot so a
/// later assignment lands at the original position.
#[derive(Default)]
struct ObjectBuilder {
    map: Map<String, Value>,
    undefined: HashSet<String>,
}

impl ObjectBuilder {
    fn set(&mut self, key: String, value: Option<Value>) {
        match value {
            Some(value) => {
                self.undefined.remove(&key);
                self.map.insert(key, value);
            }
            None => {
                self.map.insert(key.clone(), Value::Null);
                self.undefined.insert(key);
            }
        }
    }

    fn spread(&mut self, source: Resolved<'_>) -> Result<(), Error> {
        match source {
            Resolved::Input(event) => {
                for (key, value) in event {
                    self.set(key.clone(), Some(normalize(value)));
                }
            }
            Resolved::Borrowed(Value::Object(map)) => {
                for (key, value) in map {
                    self.set(key.clone(), Some(normalize(value)));
                }
            }
            Resolved::Owned(Value::Object(map)) => {
                for (key, value) in map {
                    self.set(key, Some(value));
                }
            }
            Resolved::Borrowed(Value::Array(items)) => {
                for (i, value) in items.iter().enumerate() {
                    self.set(i.to_string(), Some(normalize(value)));
                }
            }
            Resolved::Owned(Value::Array(items)) => {
                for (i, value) in items.into_iter().enumerate() {
                    self.set(i.to_string(), Some(value));
                }
            }
            Resolved::Borrowed(Value::String(s)) => self.spread_string(s)?,
            Resolved::Owned(Value::String(s)) => self.spread_string(&s)?,
            _ => {}
        }
        Ok(())
    }

    fn spread_string(&mut self, s: &str) -> Result<(), Error> {
        for (i, c) in s.chars().enumerate() {
            if c.len_utf16() > 1 {
                return Err(Error::evaluation(
                    "spreading a string with surrogate pairs into an object",
                ));
            }
            self.set(i.to_string(), Some(Value::String(c.to_string())));
        }
        Ok(())
    }

    fn finish(self) -> Map<String, Value> {
        let map = if self.undefined.is_empty() {
            self.map
        } else {
            let undefined = self.undefined;
            self.map
                .into_iter()
                .filter(|(key, _)| !undefined.contains(key))
                .collect()
        };
        js_order(map)
    }
}

/// Canonical array index: decimal without leading zeros, below 2^32 - 1.
fn array_index(key: &str) -> Option<u32> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    key.parse::<u32>().ok().filter(|i| *i < u32::MAX)
}

/// Reorders keys the way JavaScript enumerates them: array indices
/// ascending, then everything else in insertion order.
fn js_order(map: Map<String, Value>) -> Map<String, Value> {
    if !map.keys().any(|key| array_index(key).is_some()) {
        return map;
    }
    let mut indexed = Vec::new();
    let mut named = Vec::new();
    for (key, value) in map {
        match array_index(&key) {
            Some(i) => indexed.push((i, key, value)),
            None => named.push((key, value)),
        }
    }
    indexed.sort_by_key(|(i, _, _)| *i);
    indexed
        .into_iter()
        .map(|(_, key, value)| (key, value))
        .chain(named)
        .collect()
}

fn normalize_object(map: &Map<String, Value>) -> Map<String, Value> {
    js_order(
        map.iter()
            .map(|(key, value)| (key.clone(), normalize(value)))
            .collect(),
    )
}

/// Deep copy with JavaScript key order and number formatting.
pub(crate) fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_object(map)),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Number(n) => normalize_number(n),
        other => other.clone(),
    }
}

fn normalize_number(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        if (i as f64).abs() <= MAX_SAFE_INTEGER {
            return Value::Number(n.clone());
        }
    } else if let Some(u) = n.as_u64() {
        if (u as f64) <= MAX_SAFE_INTEGER {
            return Value::Number(n.clone());
        }
    }
    n.as_f64().map(js_number).unwrap_or(Value::Null)
}
