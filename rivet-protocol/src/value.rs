//! Dynamic value model for struct payloads.

use crate::types::TType;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    Double(f64),
    I16(i16),
    I32(i32),
    I64(i64),
    String(String),
    /// String-typed value that is not valid UTF-8.
    Binary(Bytes),
    Struct(Struct),
    List { elem: TType, items: Vec<Value> },
    Set { elem: TType, items: Vec<Value> },
    Map {
        key: TType,
        value: TType,
        entries: Vec<(Value, Value)>,
    },
}

impl Value {
    /// Returns the wire type of this value.
    pub fn ttype(&self) -> TType {
        match self {
            Value::Bool(_) => TType::Bool,
            Value::Byte(_) => TType::Byte,
            Value::Double(_) => TType::Double,
            Value::I16(_) => TType::I16,
            Value::I32(_) => TType::I32,
            Value::I64(_) => TType::I64,
            Value::String(_) | Value::Binary(_) => TType::String,
            Value::Struct(_) => TType::Struct,
            Value::List { .. } => TType::List,
            Value::Set { .. } => TType::Set,
            Value::Map { .. } => TType::Map,
        }
    }

    pub fn list(elem: TType, items: Vec<Value>) -> Self {
        Value::List { elem, items }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the raw bytes of a string-typed value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_struct(self) -> Option<Struct> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Byte(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Struct> for Value {
    fn from(v: Struct) -> Self {
        Value::Struct(v)
    }
}

/// A struct payload: field values keyed by field id, kept in id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Struct {
    fields: BTreeMap<i16, Value>,
}

impl Struct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: i16, value: impl Into<Value>) -> Self {
        self.fields.insert(id, value.into());
        self
    }

    /// Sets a field, returning the previous value.
    pub fn set(&mut self, id: i16, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(id, value.into())
    }

    pub fn get(&self, id: i16) -> Option<&Value> {
        self.fields.get(&id)
    }

    pub fn take(&mut self, id: i16) -> Option<Value> {
        self.fields.remove(&id)
    }

    pub fn contains(&self, id: i16) -> bool {
        self.fields.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over fields in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (i16, &Value)> {
        self.fields.iter().map(|(id, value)| (*id, value))
    }
}

impl FromIterator<(i16, Value)> for Struct {
    fn from_iter<I: IntoIterator<Item = (i16, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_ttype() {
        assert_eq!(Value::from("hi").ttype(), TType::String);
        assert_eq!(Value::Binary(Bytes::from_static(b"\xff")).ttype(), TType::String);
        assert_eq!(Value::from(7i64).ttype(), TType::I64);
        assert_eq!(Value::list(TType::I32, vec![]).ttype(), TType::List);
        assert_eq!(Value::from(Struct::new()).ttype(), TType::Struct);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert_eq!(Value::from(3i32).as_i32(), Some(3));
        assert_eq!(Value::from(3i32).as_i64(), None);
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(
            Value::Binary(Bytes::from_static(b"ab")).as_bytes(),
            Some(&b"ab"[..])
        );
    }

    #[test]
    fn test_struct_fields_ordered_by_id() {
        let s = Struct::new()
            .with(3, "c")
            .with(1, "a")
            .with(2, "b");
        let ids: Vec<i16> = s.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_struct_set_and_take() {
        let mut s = Struct::new();
        assert!(s.set(0, "first").is_none());
        assert_eq!(s.set(0, "second"), Some(Value::from("first")));
        assert!(s.contains(0));
        assert_eq!(s.take(0), Some(Value::from("second")));
        assert!(s.is_empty());
    }
}
