//! Resource records
//!
//! A [`Resource`] is one normalized record from a provider listing. Filters
//! and actions may add annotation keys but never touch the identifying
//! attribute.

use serde::Serialize;
use serde_json::{Map, Value};

/// One cloud object as an ordered attribute map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    #[serde(skip)]
    id_field: String,
    #[serde(flatten)]
    data: Map<String, Value>,
}

impl Resource {
    /// Wrap a JSON object. Returns `None` for non-object values.
    pub fn from_value(id_field: &str, value: Value) -> Option<Self> {
        match value {
            Value::Object(data) => Some(Self {
                id_field: id_field.to_string(),
                data,
            }),
            _ => None,
        }
    }

    /// Identifying attribute rendered as a string
    pub fn id(&self) -> String {
        match self.data.get(&self.id_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Dot-notation lookup; numeric segments index arrays
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let (first, rest) = match path.split_once('.') {
            Some((first, rest)) => (first, Some(rest)),
            None => (path, None),
        };
        let head = self.data.get(first)?;
        match rest {
            Some(rest) => lookup_path(head, rest),
            None => Some(head),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Add or replace an annotation. Refuses to overwrite the id attribute.
    pub fn annotate(&mut self, key: &str, value: Value) -> bool {
        if key == self.id_field {
            tracing::warn!("Refusing to overwrite id attribute '{}' on {}", key, self.id());
            return false;
        }
        self.data.insert(key.to_string(), value);
        true
    }

    /// Mutable access to an annotation object, creating it when missing
    pub fn annotation_object(&mut self, key: &str) -> Option<&mut Map<String, Value>> {
        if key == self.id_field {
            return None;
        }
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        entry.as_object_mut()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
    }
}

/// Walk a dot path inside a JSON value
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Array(items) => {
                let idx: usize = part.parse().ok()?;
                items.get(idx)?
            }
            Value::Object(map) => map.get(part)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Split resources into consecutive chunks of at most `size`
pub fn chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            out.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
