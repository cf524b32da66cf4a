//! Table proxy.

use super::{expect_kind, ProxyRef};
use crate::bridge;
use crate::convert;
use crate::error::{ConversionError, Error, Result};
use crate::registry::ObjectKind;
use crate::state::Context;
use crate::value::{Map, Value};
use std::fmt;

/// Handle on an engine table.
///
/// Keyed access goes through the table's metamethods; the `raw_*` variants
/// bypass them. Numeric keys stay keys: a table used as an array is still
/// accessed by key, with the engine's 1-based indices.
///
/// # Example
///
/// ```
/// use moonbridge::{Runtime, Value};
///
/// let rt = Runtime::new()?;
/// let table = rt.eval("{ greeting = 'hi', 10, 20 }")?.into_table().expect("table");
/// assert_eq!(table.get("greeting")?, Value::from("hi"));
/// assert_eq!(table.get(2)?, Value::Integer(20));
/// assert_eq!(table.len()?, 2);
/// # Ok::<(), moonbridge::Error>(())
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Table(pub(crate) ProxyRef);

impl Table {
    fn with<R>(&self, f: impl FnOnce(&Context<'_>, mlua::Table) -> Result<R>) -> Result<R> {
        self.0.with(|cx, value| {
            let table = expect_kind!(value, Table, "table");
            f(cx, table)
        })
    }

    /// Returns `table[key]`, honouring `__index`.
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        self.with(|cx, table| {
            let key = convert::to_lua(cx, &key)?;
            let results = bridge::call_function(
                cx,
                &cx.internals.index,
                vec![mlua::Value::Table(table), key],
            )?;
            first(cx, results)
        })
    }

    /// Performs `table[key] = value`, honouring `__newindex`.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if key.is_nil() {
            return Err(ConversionError::NilKey.into());
        }
        self.with(|cx, table| {
            let mut args = vec![mlua::Value::Table(table)];
            args.extend(convert::to_lua_multi(cx, &[key, value])?);
            bridge::call_function(cx, &cx.internals.assign, args)?;
            Ok(())
        })
    }

    /// Removes `key` by assigning nil.
    pub fn delete(&self, key: impl Into<Value>) -> Result<()> {
        self.set(key, Value::Nil)
    }

    /// Returns true if `table[key]` is not nil.
    pub fn contains_key(&self, key: impl Into<Value>) -> Result<bool> {
        Ok(!self.get(key)?.is_nil())
    }

    /// Returns the border of the array part (`#table`).
    pub fn len(&self) -> Result<usize> {
        self.with(|cx, table| {
            let results =
                bridge::call_function(cx, &cx.internals.length, vec![mlua::Value::Table(table)])?;
            Ok(match results.into_vec().into_iter().next() {
                Some(mlua::Value::Integer(n)) => usize::try_from(n).unwrap_or(0),
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Some(mlua::Value::Number(n)) if n >= 0.0 => n as usize,
                _ => 0,
            })
        })
    }

    /// Returns true if `#table` is zero.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns the length without invoking metamethods.
    pub fn raw_len(&self) -> Result<usize> {
        self.with(|_, table| Ok(table.raw_len()))
    }

    /// Returns `table[key]` without invoking metamethods.
    pub fn raw_get(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        self.with(|cx, table| {
            let key = convert::to_lua(cx, &key)?;
            let value = convert::raw_exact(&table, key)?;
            convert::to_host(cx, value)
        })
    }

    /// Assigns `table[key] = value` without invoking metamethods.
    pub fn raw_set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if key.is_nil() {
            return Err(ConversionError::NilKey.into());
        }
        self.with(|cx, table| {
            let mut converted = convert::to_lua_multi(cx, &[key, value])?.into_iter();
            let key = converted.next().unwrap_or(mlua::Value::Nil);
            let value = converted.next().unwrap_or(mlua::Value::Nil);
            table.raw_set(key, value)?;
            Ok(())
        })
    }

    /// Returns the metatable, if one is set.
    pub fn metatable(&self) -> Result<Option<Table>> {
        self.with(|cx, table| {
            let results = bridge::call_function(
                cx,
                &cx.internals.getmetatable,
                vec![mlua::Value::Table(table)],
            )?;
            match results.into_vec().into_iter().next() {
                None | Some(mlua::Value::Nil) => Ok(None),
                Some(mt @ mlua::Value::Table(_)) => {
                    Ok(Some(Table(cx.anchor(mt, ObjectKind::Table, false)?)))
                }
                Some(_) => Err(Error::runtime("metatable is protected")),
            }
        })
    }

    /// Sets or clears the metatable.
    pub fn set_metatable(&self, metatable: Option<&Table>) -> Result<()> {
        self.with(|cx, table| {
            let metatable = match metatable {
                Some(mt) => cx.fetch(&mt.0)?,
                None => mlua::Value::Nil,
            };
            bridge::call_function(
                cx,
                &cx.internals.setmetatable,
                vec![mlua::Value::Table(table), metatable],
            )?;
            Ok(())
        })
    }

    /// Iterates over the table's pairs.
    ///
    /// The iterator is lazy; each step takes the runtime guard once. Keys
    /// must not be added to the table while iterating (values may change
    /// or be cleared), otherwise the engine's `next` may fail or skip pairs.
    #[must_use]
    pub fn iter(&self) -> TableIter {
        TableIter {
            table: self.clone(),
            last: None,
            done: false,
        }
    }

    /// Iterates over the table's keys.
    pub fn keys(&self) -> impl Iterator<Item = Result<Value>> {
        self.iter().map(|pair| pair.map(|(key, _)| key))
    }

    /// Iterates over the table's values.
    pub fn values(&self) -> impl Iterator<Item = Result<Value>> {
        self.iter().map(|pair| pair.map(|(_, value)| value))
    }

    /// Copies the table's pairs into a host [`Map`].
    ///
    /// Only the first level is copied; nested tables stay proxies.
    pub fn to_map(&self) -> Result<Map> {
        let map = Map::new();
        for pair in self.iter() {
            let (key, value) = pair?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Id of the runtime that owns this table.
    #[must_use]
    pub fn runtime_id(&self) -> u64 {
        self.0.runtime_id()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({:?})", self.0)
    }
}

impl IntoIterator for &Table {
    type Item = Result<(Value, Value)>;
    type IntoIter = TableIter;

    fn into_iter(self) -> TableIter {
        self.iter()
    }
}

/// Lazy iterator over a table's pairs, driven by the engine's `next`.
pub struct TableIter {
    table: Table,
    last: Option<Value>,
    done: bool,
}

impl Iterator for TableIter {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let key = self.last.take().unwrap_or_default();
        let step = self.table.with(|cx, table| {
            let key = convert::to_lua(cx, &key)?;
            let results =
                bridge::call_function(cx, &cx.internals.next, vec![mlua::Value::Table(table), key])?;
            let mut results = results.into_vec().into_iter();
            let key = results.next().unwrap_or(mlua::Value::Nil);
            if key.is_nil() {
                return Ok(None);
            }
            let value = results.next().unwrap_or(mlua::Value::Nil);
            Ok(Some((convert::to_host(cx, key)?, convert::to_host(cx, value)?)))
        });
        match step {
            Ok(Some((key, value))) => {
                self.last = Some(key.clone());
                Some(Ok((key, value)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl std::iter::FusedIterator for TableIter {}

/// Converts the first of `results`, or `Nil` if there are none.
fn first(cx: &Context<'_>, results: mlua::MultiValue) -> Result<Value> {
    match results.into_vec().into_iter().next() {
        Some(value) => convert::to_host(cx, value),
        None => Ok(Value::Nil),
    }
}
