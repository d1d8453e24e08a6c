//! Ordered multi-valued output mapping.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name to ordered list of values.
///
/// Keys are unique and keep the order in which they were first written;
/// values under a key keep the order in which they were appended. Every
/// entry is stored as a JSON array so the map serializes directly as an
/// indexing document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputMap {
    fields: Map<String, Value>,
}

impl OutputMap {
    /// Creates an empty output map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends values to a field, creating it if needed.
    ///
    /// Appending an empty sequence to a missing field creates nothing.
    pub fn append(&mut self, field: &str, values: impl IntoIterator<Item = Value>) {
        let mut values = values.into_iter().peekable();
        if values.peek().is_none() {
            return;
        }
        self.update(field, |existing| existing.extend(values));
    }

    /// Appends a single value to a field.
    pub fn push(&mut self, field: &str, value: Value) {
        self.update(field, |existing| existing.push(value));
    }

    /// Creates a field with no values if it does not exist yet.
    pub fn ensure_field(&mut self, field: &str) {
        self.update(field, |_| {});
    }

    /// Returns the values of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&[Value]> {
        self.fields
            .get(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
    }

    /// Returns the first value of a field.
    #[must_use]
    pub fn first(&self, field: &str) -> Option<&Value> {
        self.get(field).and_then(<[Value]>::first)
    }

    /// Removes a field, returning its values.
    pub fn remove(&mut self, field: &str) -> Option<Vec<Value>> {
        match self.fields.shift_remove(field) {
            Some(Value::Array(values)) => Some(values),
            _ => None,
        }
    }

    /// Returns true if the field exists.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Returns field names in first-write order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if no field has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the map as a JSON object document.
    #[must_use]
    pub fn to_document(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Consumes the map into a JSON object document.
    #[must_use]
    pub fn into_document(self) -> Value {
        Value::Object(self.fields)
    }

    /// Applies `f` to the values of `field`. A scalar read from a
    /// deserialized document becomes a one-element list.
    fn update(&mut self, field: &str, f: impl FnOnce(&mut Vec<Value>)) {
        let entry = self.fields.entry(field.to_string()).or_insert(Value::Null);
        let mut values = match entry.take() {
            Value::Array(values) => values,
            Value::Null => Vec::new(),
            scalar => vec![scalar],
        };
        f(&mut values);
        *entry = Value::Array(values);
    }
}
