//! Host-side value model.
//!
//! [`Value`] is what host code sends into and receives from the engine.
//! Primitives and host containers ([`List`], [`Map`]) are owned by the
//! host; tables, functions, coroutines and userdata stay inside the engine
//! and are represented by proxies.
//!
//! Host containers are shared and interior-mutable, so a container may hold
//! itself. Equality on containers and proxies is identity, never structural.

use crate::error::ConversionError;
use crate::proxy::{Coroutine, Function, Table, UserData};
use crate::registry::SlotId;
use crate::runtime::Scope;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A value that can cross the host/engine boundary.
#[derive(Clone, Default)]
pub enum Value {
    /// Absent value (`nil`).
    #[default]
    Nil,
    /// Boolean.
    Boolean(bool),
    /// Integer. Integral engine numbers come back as this variant.
    Integer(i64),
    /// Floating-point number.
    Number(f64),
    /// Text decoded with the runtime's charset.
    Text(String),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Host sequence, copied into a new table on the way in.
    List(List),
    /// Host key-mapping, copied into a new table on the way in.
    Map(Map),
    /// Host function callable from script code.
    Callback(Callback),
    /// Engine table.
    Table(Table),
    /// Engine function.
    Function(Function),
    /// Engine coroutine.
    Coroutine(Coroutine),
    /// Engine userdata or any other opaque engine value.
    UserData(UserData),
}

impl Value {
    /// Returns the engine-style type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Callback(_) => "callback",
            Self::Table(_) => "table",
            Self::Function(_) => "function",
            Self::Coroutine(_) => "coroutine",
            Self::UserData(_) => "userdata",
        }
    }

    /// Returns true for [`Value::Nil`].
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Returns the boolean, if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, accepting integral numbers.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            #[allow(clippy::cast_possible_truncation)]
            Self::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    /// Returns the number as `f64`, accepting integers.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the raw bytes of text or byte strings.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(s) => Some(s.as_bytes()),
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the list, if this is one.
    #[must_use]
    pub fn as_list(&self) -> Option<&List> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the map, if this is one.
    #[must_use]
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the table proxy, if this is one.
    #[must_use]
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the function proxy, if this is one.
    #[must_use]
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the coroutine proxy, if this is one.
    #[must_use]
    pub fn as_coroutine(&self) -> Option<&Coroutine> {
        match self {
            Self::Coroutine(c) => Some(c),
            _ => None,
        }
    }

    /// Returns the userdata proxy, if this is one.
    #[must_use]
    pub fn as_userdata(&self) -> Option<&UserData> {
        match self {
            Self::UserData(u) => Some(u),
            _ => None,
        }
    }

    /// Consumes the value, returning the table proxy.
    #[must_use]
    pub fn into_table(self) -> Option<Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Consumes the value, returning the function proxy.
    #[must_use]
    pub fn into_function(self) -> Option<Function> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Consumes the value, returning the coroutine proxy.
    #[must_use]
    pub fn into_coroutine(self) -> Option<Coroutine> {
        match self {
            Self::Coroutine(c) => Some(c),
            _ => None,
        }
    }

    /// Builds a value from JSON.
    ///
    /// Objects become [`Map`]s with text keys, arrays become [`List`]s.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                let map = Map::new();
                for (k, v) in obj {
                    map.insert(k, Self::from_json(v));
                }
                Self::Map(map)
            }
        }
    }

    /// Converts host-owned data to JSON.
    ///
    /// # Errors
    ///
    /// Fails for callbacks, proxies, non-UTF-8 bytes, non-finite numbers,
    /// non-text map keys and self-referential containers.
    pub fn to_json(&self) -> Result<serde_json::Value, ConversionError> {
        self.to_json_inner(&mut HashSet::new())
    }

    fn to_json_inner(
        &self,
        active: &mut HashSet<usize>,
    ) -> Result<serde_json::Value, ConversionError> {
        match self {
            Self::Nil => Ok(serde_json::Value::Null),
            Self::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
            Self::Integer(i) => Ok(serde_json::Value::from(*i)),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| ConversionError::Unsupported(format!("non-finite number {n}"))),
            Self::Text(s) => Ok(serde_json::Value::String(s.clone())),
            Self::Bytes(b) => String::from_utf8(b.clone())
                .map(serde_json::Value::String)
                .map_err(|_| ConversionError::Unsupported("non-UTF-8 bytes".into())),
            Self::List(list) => {
                if !active.insert(list.identity()) {
                    return Err(ConversionError::Cycle("list"));
                }
                let items = list
                    .to_vec()
                    .iter()
                    .map(|v| v.to_json_inner(active))
                    .collect::<Result<Vec<_>, _>>()?;
                active.remove(&list.identity());
                Ok(serde_json::Value::Array(items))
            }
            Self::Map(map) => {
                if !active.insert(map.identity()) {
                    return Err(ConversionError::Cycle("map"));
                }
                let mut obj = serde_json::Map::new();
                for (k, v) in map.entries() {
                    let Self::Text(key) = k else {
                        return Err(ConversionError::Unsupported(format!(
                            "{} map key",
                            k.type_name()
                        )));
                    };
                    obj.insert(key, v.to_json_inner(active)?);
                }
                active.remove(&map.identity());
                Ok(serde_json::Value::Object(obj))
            }
            other => Err(ConversionError::Unsupported(format!(
                "{} has no JSON form",
                other.type_name()
            ))),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            #[allow(clippy::cast_precision_loss)]
            (Self::Integer(i), Self::Number(n)) | (Self::Number(n), Self::Integer(i)) => {
                *i as f64 == *n
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Callback(a), Self::Callback(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a == b,
            (Self::Coroutine(a), Self::Coroutine(b)) => a == b,
            (Self::UserData(a), Self::UserData(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Boolean(b) => write!(f, "Boolean({b})"),
            Self::Integer(i) => write!(f, "Integer({i})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::Text(s) => write!(f, "Text({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes({b:?})"),
            Self::List(l) => l.fmt(f),
            Self::Map(m) => m.fmt(f),
            Self::Callback(c) => c.fmt(f),
            Self::Table(t) => t.fmt(f),
            Self::Function(func) => func.fmt(f),
            Self::Coroutine(c) => c.fmt(f),
            Self::UserData(u) => u.fmt(f),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Boolean,
    i8 => Integer,
    i16 => Integer,
    i32 => Integer,
    i64 => Integer,
    u8 => Integer,
    u16 => Integer,
    u32 => Integer,
    f32 => Number,
    f64 => Number,
    String => Text,
    &str => Text,
    &[u8] => Bytes,
    List => List,
    Map => Map,
    Callback => Callback,
    Table => Table,
    Function => Function,
    Coroutine => Coroutine,
    UserData => UserData,
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Nil
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(List::from_vec(items))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Nil, Into::into)
    }
}

/// Shared host sequence.
#[derive(Clone, Default)]
pub struct List(Arc<RwLock<Vec<Value>>>);

impl List {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list holding `items`.
    #[must_use]
    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    /// Appends a value.
    pub fn push(&self, value: impl Into<Value>) {
        self.0.write().push(value.into());
    }

    /// Returns the value at `index` (0-based).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.read().get(index).cloned()
    }

    /// Replaces the value at `index`; returns false if out of bounds.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> bool {
        match self.0.write().get_mut(index) {
            Some(slot) => {
                *slot = value.into();
                true
            }
            None => false,
        }
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Returns true if the list has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Returns a snapshot of the items.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.read().clone()
    }

    /// Identity of the shared storage.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "List(len={})", self.len())
    }
}

impl FromIterator<Value> for List {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

/// Hashable form of a map key, consistent with [`Value`] equality.
///
/// Integral floats hash as integers so `Integer(2)` and `Number(2.0)` share
/// an entry. Containers, callbacks and proxies hash by identity.
#[derive(Clone, PartialEq, Eq, Hash)]
enum MapKey {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(u64),
    Text(String),
    Bytes(Vec<u8>),
    Shared(usize),
    Proxy(u64, SlotId),
}

impl MapKey {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn of(value: &Value) -> Self {
        match value {
            Value::Nil => Self::Nil,
            Value::Boolean(b) => Self::Boolean(*b),
            Value::Integer(i) => Self::Integer(*i),
            Value::Number(n)
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 =>
            {
                Self::Integer(*n as i64)
            }
            Value::Number(n) => Self::Float(n.to_bits()),
            Value::Text(s) => Self::Text(s.clone()),
            Value::Bytes(b) => Self::Bytes(b.clone()),
            Value::List(list) => Self::Shared(list.identity()),
            Value::Map(map) => Self::Shared(map.identity()),
            Value::Callback(callback) => Self::Shared(callback.identity()),
            Value::Table(Table(proxy))
            | Value::Function(Function(proxy))
            | Value::Coroutine(Coroutine(proxy))
            | Value::UserData(UserData(proxy)) => Self::Proxy(proxy.runtime_id(), proxy.slot()),
        }
    }
}

/// Shared host key-mapping, insertion-ordered.
#[derive(Clone, Default)]
pub struct Map(Arc<RwLock<IndexMap<MapKey, (Value, Value)>>>);

impl Map {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry, returning the previous value.
    ///
    /// Replacing keeps the key first inserted and its position.
    pub fn insert(&self, key: impl Into<Value>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        let mut entries = self.0.write();
        match entries.entry(MapKey::of(&key)) {
            indexmap::map::Entry::Occupied(mut slot) => {
                Some(std::mem::replace(&mut slot.get_mut().1, value))
            }
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert((key, value));
                None
            }
        }
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: impl Into<Value>) -> Option<Value> {
        let key = MapKey::of(&key.into());
        self.0.read().get(&key).map(|(_, v)| v.clone())
    }

    /// Removes an entry, returning its value. Later entries keep their order.
    pub fn remove(&self, key: impl Into<Value>) -> Option<Value> {
        let key = MapKey::of(&key.into());
        self.0.write().shift_remove(&key).map(|(_, v)| v)
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: impl Into<Value>) -> bool {
        let key = MapKey::of(&key.into());
        self.0.read().contains_key(&key)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Returns true if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Returns a snapshot of the entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.read().values().cloned().collect()
    }

    /// Identity of the shared storage.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Map(len={})", self.len())
    }
}

/// Result returned by host callbacks.
pub type CallbackResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

type CallbackFn = dyn Fn(&Scope, Vec<Value>) -> CallbackResult + Send + Sync;

/// Host function exposed to script code.
///
/// The callback receives a [`Scope`] for re-entering the runtime that
/// invoked it, plus the converted arguments.
///
/// # Example
///
/// ```
/// use moonbridge::{Callback, Value};
///
/// let add = Callback::named("add", |_scope, args| {
///     let sum: i64 = args.iter().filter_map(Value::as_integer).sum();
///     Ok(Value::Integer(sum))
/// });
/// assert_eq!(add.name(), Some("add"));
/// ```
#[derive(Clone)]
pub struct Callback {
    name: Option<Arc<str>>,
    func: Arc<CallbackFn>,
}

impl Callback {
    /// Wraps an anonymous host function.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Scope, Vec<Value>) -> CallbackResult + Send + Sync + 'static,
    {
        Self {
            name: None,
            func: Arc::new(func),
        }
    }

    /// Wraps a host function under a name used in error reports.
    pub fn named<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Scope, Vec<Value>) -> CallbackResult + Send + Sync + 'static,
    {
        Self {
            name: Some(Arc::from(name.into())),
            func: Arc::new(func),
        }
    }

    /// Returns the registered name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn invoke(&self, scope: &Scope, args: Vec<Value>) -> CallbackResult {
        (self.func)(scope, args)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.func) as *const () as usize
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({})", self.name().unwrap_or("<anonymous>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Value>();
    }

    #[test]
    fn numeric_cross_equality() {
        assert_eq!(Value::Integer(2), Value::Number(2.0));
        assert_ne!(Value::Integer(2), Value::Number(2.5));
        assert_eq!(Value::Number(2.0).as_integer(), Some(2));
        assert_eq!(Value::Number(2.5).as_integer(), None);
    }

    #[test]
    fn containers_compare_by_identity() {
        let a = List::from_vec(vec![1.into()]);
        let b = List::from_vec(vec![1.into()]);
        assert_eq!(Value::List(a.clone()), Value::List(a.clone()));
        assert_ne!(Value::List(a), Value::List(b));
    }

    #[test]
    fn map_insert_replaces_equal_keys() {
        let map = Map::new();
        assert!(map.insert("k", 1).is_none());
        assert_eq!(map.insert("k", 2), Some(Value::Integer(1)));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("k"), Some(Value::Integer(2)));
        assert_eq!(map.remove("k"), Some(Value::Integer(2)));
        assert!(map.is_empty());
    }

    #[test]
    fn map_keys_follow_value_equality() {
        let map = Map::new();
        map.insert(2, "two");
        assert_eq!(map.get(Value::Number(2.0)), Some(Value::from("two")));
        assert_eq!(map.insert(Value::Number(2.0), "deux"), Some(Value::from("two")));
        assert!(matches!(map.entries()[0].0, Value::Integer(2)));

        map.insert(Value::Number(0.5), "half");
        map.insert(Value::Bytes(b"k".to_vec()), "bytes");
        map.insert("k", "text");
        assert_eq!(map.len(), 4);
        assert_eq!(map.get(Value::Bytes(b"k".to_vec())), Some(Value::from("bytes")));

        let shared = List::new();
        map.insert(shared.clone(), "list");
        assert!(map.contains_key(shared));
        assert!(!map.contains_key(List::new()));
    }

    #[test]
    fn map_removal_keeps_insertion_order() {
        let map = Map::new();
        for key in ["a", "b", "c", "d"] {
            map.insert(key, key.to_uppercase());
        }
        map.remove("b");
        let keys: Vec<Value> = map.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Value::from("a"), Value::from("c"), Value::from("d")]);
    }

    #[test]
    fn list_set_and_get() {
        let list = List::new();
        list.push("a");
        assert!(list.set(0, "b"));
        assert!(!list.set(5, "c"));
        assert_eq!(list.get(0), Some(Value::Text("b".into())));
    }

    #[test]
    fn json_round_trip() {
        let source = json!({"name": "moon", "tags": [1, 2.5, true, null]});
        let value = Value::from_json(source.clone());
        assert_eq!(value.to_json().expect("to json"), source);
    }

    #[test]
    fn json_rejects_cycles() {
        let map = Map::new();
        map.insert("self", map.clone());
        let err = Value::Map(map.clone()).to_json().expect_err("cycle");
        assert_eq!(err, ConversionError::Cycle("map"));
        // Break the cycle so the test does not leak.
        map.remove("self");
    }

    #[test]
    fn json_rejects_callbacks() {
        let cb = Callback::new(|_, _| Ok(Value::Nil));
        assert!(Value::Callback(cb).to_json().is_err());
    }

    #[test]
    fn option_and_unit_conversions() {
        assert!(Value::from(None::<i32>).is_nil());
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
        assert!(Value::from(()).is_nil());
    }
}
