//! Type bridge between dynamic script values and host collections.
//!
//! Script values cross the op boundary as a tagged [`ScriptValue`]. The
//! bridge only ever asks a value whether it has indexed elements or named
//! members; it never needs to know which engine produced it.
//!
//! Host collections go the other way as [`ListApi`] and [`MapApi`]
//! snapshots. Their JSON form carries a `@@vigil` marker so the sandbox
//! bootstrap can revive them into frozen wrapper objects.

use std::borrow::Borrow;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Key marking a serialized bridge wrapper.
pub const BRIDGE_MARKER: &str = "@@vigil";

/// Largest integral magnitude that survives a round trip through `f64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Errors from operations on bridge wrappers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// `ListApi::get` was called with an index outside `0..length`.
    #[error("IndexOutOfRange: index {index} out of range for length {length}")]
    IndexOutOfRange {
        /// The requested index.
        index: usize,
        /// The list length.
        length: usize,
    },
}

/// A dynamic script value as seen by the host.
///
/// Produced by the bootstrap's encoder: functions collapse to `Callable`,
/// non-finite numbers to `Null`, and bridge wrappers to plain arrays/objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptValue {
    /// `undefined`, or an omitted argument.
    Undefined,
    /// `null`.
    Null,
    /// A boolean.
    Boolean {
        /// The value.
        value: bool,
    },
    /// An IEEE-754 double.
    Number {
        /// The value.
        value: f64,
    },
    /// A string.
    String {
        /// The value.
        value: String,
    },
    /// Anything with indexed elements.
    Array {
        /// Elements in index order.
        items: Vec<ScriptValue>,
    },
    /// Anything with named members.
    Object {
        /// Members in enumeration order.
        members: Vec<(String, ScriptValue)>,
    },
    /// A function.
    Callable,
}

impl ScriptValue {
    /// Build a string value.
    pub fn string(value: impl Into<String>) -> Self {
        Self::String {
            value: value.into(),
        }
    }

    /// Whether the value exposes indexed elements.
    pub fn has_indexed_elements(&self) -> bool {
        matches!(self, Self::Array { .. })
    }

    /// Whether the value exposes named members.
    pub fn has_named_members(&self) -> bool {
        matches!(self, Self::Object { .. })
    }

    /// `undefined` or `null`.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// The string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String { value } => Some(value),
            _ => None,
        }
    }

    /// Indexed elements; empty for anything else.
    pub fn items(&self) -> &[ScriptValue] {
        match self {
            Self::Array { items } => items,
            _ => &[],
        }
    }

    /// Named members; empty for anything else.
    pub fn members(&self) -> &[(String, ScriptValue)] {
        match self {
            Self::Object { members } => members,
            _ => &[],
        }
    }

    /// Look up a named member.
    pub fn member(&self, name: &str) -> Option<&ScriptValue> {
        self.members()
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// The script-facing name of this value's type, as `typeof` would say it
    /// (with `null` and arrays called out).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean { .. } => "boolean",
            Self::Number { .. } => "number",
            Self::String { .. } => "string",
            Self::Array { .. } => "Array",
            Self::Object { .. } => "Object",
            Self::Callable => "function",
        }
    }

    /// Convert to plain JSON. `undefined` and functions become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Undefined | Self::Null | Self::Callable => Value::Null,
            Self::Boolean { value } => Value::Bool(*value),
            Self::Number { value } => number_to_json(*value),
            Self::String { value } => Value::String(value.clone()),
            Self::Array { items } => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object { members } => Value::Object(
                members
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from plain JSON.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean { value: *b },
            Value::Number(n) => Self::Number {
                value: n.as_f64().unwrap_or(f64::NAN),
            },
            Value::String(s) => Self::string(s.clone()),
            Value::Array(items) => Self::Array {
                items: items.iter().map(Self::from_json).collect(),
            },
            Value::Object(map) => Self::Object {
                members: map
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            },
        }
    }
}

/// Integral doubles become JSON integers so `3` stays `3`.
fn number_to_json(value: f64) -> serde_json::Value {
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        serde_json::Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// An immutable, ordered snapshot handed to scripts instead of a host `Vec`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListApi<T> {
    items: Vec<T>,
}

impl<T> ListApi<T> {
    /// Wrap a snapshot.
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    /// The empty list.
    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Element at `index`, or [`BridgeError::IndexOutOfRange`].
    pub fn get(&self, index: usize) -> Result<&T, BridgeError> {
        self.items.get(index).ok_or(BridgeError::IndexOutOfRange {
            index,
            length: self.items.len(),
        })
    }

    /// Iterate in order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Transform every element, keeping order.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> ListApi<U> {
        ListApi {
            items: self.items.into_iter().map(f).collect(),
        }
    }

    /// Unwrap into the underlying elements.
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for ListApi<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> FromIterator<T> for ListApi<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T: Serialize> Serialize for ListApi<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(BRIDGE_MARKER, "list")?;
        map.serialize_entry("items", &self.items)?;
        map.end()
    }
}

/// An immutable, key-unique mapping handed to scripts instead of a host map.
///
/// Keeps insertion order so scripts see members in enumeration order.
#[derive(Debug, Clone, PartialEq)]
pub struct MapApi<K, V> {
    entries: Vec<(K, V)>,
}

impl<K: PartialEq, V> MapApi<K, V> {
    /// The empty map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or replace. A replaced key keeps its original position.
    pub fn insert(&mut self, key: K, value: V) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Value for `key`; `None` is the absent-value marker, not an error.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: PartialEq + ?Sized,
    {
        self.entries
            .iter()
            .find(|(k, _)| k.borrow() == key)
            .map(|(_, v)| v)
    }

    /// Whether `key` is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: PartialEq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> ListApi<K>
    where
        K: Clone,
    {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Transform every value, keeping keys and order.
    pub fn map_values<U>(self, mut f: impl FnMut(V) -> U) -> MapApi<K, U> {
        MapApi {
            entries: self.entries.into_iter().map(|(k, v)| (k, f(v))).collect(),
        }
    }
}

impl<K: PartialEq, V> Default for MapApi<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq, V> FromIterator<(K, V)> for MapApi<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<K: Serialize, V: Serialize> Serialize for MapApi<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(BRIDGE_MARKER, "map")?;
        map.serialize_entry("entries", &self.entries)?;
        map.end()
    }
}

/// Snapshot the indexed elements of `value`; anything else yields an empty list.
pub fn array_to_list(value: &ScriptValue) -> ListApi<ScriptValue> {
    if value.has_indexed_elements() {
        ListApi::new(value.items().to_vec())
    } else {
        ListApi::empty()
    }
}

/// Snapshot the named members of `value`; anything else yields an empty map.
pub fn object_to_map(value: &ScriptValue) -> MapApi<String, ScriptValue> {
    if value.has_named_members() {
        value.members().iter().cloned().collect()
    } else {
        MapApi::new()
    }
}
