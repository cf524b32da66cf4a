//! Value conversion between host values and engine values.
//!
//! Host-to-engine conversion copies host containers into new tables. A
//! [`ConversionContext`] lives for one top-level conversion and maps each
//! host container to the table made for it, so shared sub-containers are
//! converted once and self-references either become engine-side cycles or
//! are rejected, depending on [`CyclePolicy`].
//!
//! Engine-to-host conversion never copies tables, functions, coroutines or
//! userdata; they come back as proxies anchored in the registry.

use crate::bridge;
use crate::config::{CyclePolicy, Encoding};
use crate::error::{ConversionError, Error, Result};
use crate::proxy::{Coroutine, Function, Table, UserData};
use crate::registry::ObjectKind;
use crate::state::Context;
use crate::value::{List, Map, Value};
use mlua::MultiValue;
use std::collections::{HashMap, HashSet};

/// Per-pass conversion state.
struct ConversionContext<'a, 'cx> {
    cx: &'a Context<'cx>,
    /// Host container identity to the table created for it.
    visited: HashMap<usize, mlua::Table>,
    /// Containers whose conversion has not finished yet.
    active: HashSet<usize>,
    depth: usize,
}

impl<'a, 'cx> ConversionContext<'a, 'cx> {
    fn new(cx: &'a Context<'cx>) -> Self {
        Self {
            cx,
            visited: HashMap::new(),
            active: HashSet::new(),
            depth: 0,
        }
    }

    fn convert(&mut self, value: &Value) -> Result<mlua::Value> {
        let lua = self.cx.lua;
        let converted = match value {
            Value::Nil => mlua::Value::Nil,
            Value::Boolean(b) => mlua::Value::Boolean(*b),
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(i) => match mlua::Integer::try_from(*i) {
                Ok(i) => mlua::Value::Integer(i),
                Err(_) => mlua::Value::Number(*i as f64),
            },
            Value::Number(n) => mlua::Value::Number(*n),
            Value::Text(text) => {
                let bytes = encode(self.cx.config().encoding, text)?;
                mlua::Value::String(lua.create_string(bytes)?)
            }
            Value::Bytes(bytes) => mlua::Value::String(lua.create_string(bytes)?),
            Value::List(list) => mlua::Value::Table(self.list(list)?),
            Value::Map(map) => mlua::Value::Table(self.map(map)?),
            Value::Callback(callback) => {
                if !self.cx.config().allow_host_callbacks {
                    return Err(ConversionError::CallbacksDisabled.into());
                }
                mlua::Value::Function(bridge::host_function(self.cx, callback)?)
            }
            Value::Table(table) => self.cx.fetch(&table.0)?,
            Value::Function(function) => self.cx.fetch(&function.0)?,
            Value::Coroutine(coroutine) => self.cx.fetch(&coroutine.0)?,
            Value::UserData(userdata) => self.cx.fetch(&userdata.0)?,
        };
        Ok(converted)
    }

    /// Returns the table already made for `identity`, or `None` if the
    /// container has not been seen in this pass.
    fn revisit(&self, identity: usize, kind: &'static str) -> Result<Option<mlua::Table>> {
        let Some(table) = self.visited.get(&identity) else {
            return Ok(None);
        };
        if self.active.contains(&identity) && self.cx.config().cycles == CyclePolicy::Reject {
            return Err(ConversionError::Cycle(kind).into());
        }
        Ok(Some(table.clone()))
    }

    fn descend(&mut self) -> Result<()> {
        let max_depth = self.cx.config().max_depth;
        if self.depth >= max_depth {
            return Err(ConversionError::TooDeep(max_depth).into());
        }
        self.depth += 1;
        Ok(())
    }

    fn list(&mut self, list: &List) -> Result<mlua::Table> {
        let identity = list.identity();
        if let Some(table) = self.revisit(identity, "list")? {
            return Ok(table);
        }
        self.descend()?;

        let items = list.to_vec();
        let table = self.cx.lua.create_table_with_capacity(items.len(), 0)?;
        self.visited.insert(identity, table.clone());
        self.active.insert(identity);
        for (i, item) in items.iter().enumerate() {
            let value = self.convert(item)?;
            table.raw_set(i + 1, value)?;
        }
        self.active.remove(&identity);

        self.depth -= 1;
        Ok(table)
    }

    fn map(&mut self, map: &Map) -> Result<mlua::Table> {
        let identity = map.identity();
        if let Some(table) = self.revisit(identity, "map")? {
            return Ok(table);
        }
        self.descend()?;

        let entries = map.entries();
        let table = self.cx.lua.create_table_with_capacity(0, entries.len())?;
        self.visited.insert(identity, table.clone());
        self.active.insert(identity);
        for (key, value) in &entries {
            if key.is_nil() {
                return Err(ConversionError::NilKey.into());
            }
            let key = self.convert(key)?;
            let value = self.convert(value)?;
            table.raw_set(key, value)?;
        }
        self.active.remove(&identity);

        self.depth -= 1;
        Ok(table)
    }
}

fn encode(encoding: Encoding, text: &str) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Utf8 | Encoding::Binary => Ok(text.as_bytes().to_vec()),
        Encoding::Latin1 => text
            .chars()
            .map(|ch| {
                u8::try_from(u32::from(ch))
                    .map_err(|_| Error::from(ConversionError::Encoding { encoding, ch }))
            })
            .collect(),
    }
}

fn decode(encoding: Encoding, bytes: &[u8]) -> Value {
    match encoding {
        Encoding::Utf8 => match std::str::from_utf8(bytes) {
            Ok(text) => Value::Text(text.to_string()),
            Err(_) => Value::Bytes(bytes.to_vec()),
        },
        Encoding::Latin1 => Value::Text(bytes.iter().copied().map(char::from).collect()),
        Encoding::Binary => Value::Bytes(bytes.to_vec()),
    }
}

/// Converts one host value.
pub(crate) fn to_lua(cx: &Context<'_>, value: &Value) -> Result<mlua::Value> {
    ConversionContext::new(cx).convert(value)
}

/// Converts an argument list in one pass, so containers shared between
/// arguments map to the same table.
pub(crate) fn to_lua_multi(cx: &Context<'_>, values: &[Value]) -> Result<Vec<mlua::Value>> {
    let mut pass = ConversionContext::new(cx);
    values.iter().map(|value| pass.convert(value)).collect()
}

/// Converts one engine value.
pub(crate) fn to_host(cx: &Context<'_>, value: mlua::Value) -> Result<Value> {
    let converted = match value {
        mlua::Value::Nil => Value::Nil,
        mlua::Value::Boolean(b) => Value::Boolean(b),
        #[allow(clippy::cast_precision_loss)]
        mlua::Value::Integer(i) => match i64::try_from(i) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Number(i as f64),
        },
        mlua::Value::Number(n) => Value::Number(n),
        mlua::Value::String(s) => decode(cx.config().encoding, &s.as_bytes()),
        table @ mlua::Value::Table(_) => {
            Value::Table(Table(cx.anchor(table, ObjectKind::Table, false)?))
        }
        function @ mlua::Value::Function(_) => {
            Value::Function(Function(cx.anchor(function, ObjectKind::Function, false)?))
        }
        // Threads created by script code cannot be told apart from
        // yielded ones, so they count as started.
        thread @ mlua::Value::Thread(_) => {
            Value::Coroutine(Coroutine(cx.anchor(thread, ObjectKind::Coroutine, true)?))
        }
        other => Value::UserData(UserData(cx.anchor(other, ObjectKind::UserData, false)?)),
    };
    Ok(converted)
}

pub(crate) fn to_host_multi(cx: &Context<'_>, values: MultiValue) -> Result<Vec<Value>> {
    values
        .into_vec()
        .into_iter()
        .map(|value| to_host(cx, value))
        .collect()
}

/// Reads `table[key]` without metamethods.
///
/// The binding reads numbers with a near-zero fraction as integers, which
/// turns tiny floats into `0`; those are read again as doubles.
pub(crate) fn raw_exact<K>(table: &mlua::Table, key: K) -> Result<mlua::Value>
where
    K: mlua::IntoLua + Clone,
{
    let value = table.raw_get::<mlua::Value>(key.clone())?;
    if value == mlua::Value::Integer(0) {
        let exact = table.raw_get::<f64>(key)?;
        if exact != 0.0 {
            return Ok(mlua::Value::Number(exact));
        }
    }
    Ok(value)
}

/// Unpacks a `{ n = count, ... }` result table into engine values.
pub(crate) fn unpack(packed: &mlua::Table) -> Result<MultiValue> {
    let count = packed.raw_get::<usize>("n")?;
    let values = (1..=count)
        .map(|index| raw_exact(packed, index))
        .collect::<Result<Vec<_>>>()?;
    Ok(MultiValue::from_vec(values))
}

/// Collapses call results to one host value.
///
/// No results give `Nil` and one result is returned as is. Several results
/// become a [`List`] when `unpack_returns` is set; otherwise only the first
/// is kept.
pub(crate) fn collapse_returns(cx: &Context<'_>, values: MultiValue) -> Result<Value> {
    let mut values = to_host_multi(cx, values)?;
    let collapsed = match values.len() {
        0 => Value::Nil,
        1 => values.pop().unwrap_or_default(),
        _ if cx.config().unpack_returns => Value::List(List::from_vec(values)),
        _ => values.swap_remove(0),
    };
    Ok(collapsed)
}

/// Converts a callback's return value into engine results.
///
/// With `unpack_returns` set, a returned [`List`] is spread into multiple
/// results, mirroring [`collapse_returns`].
pub(crate) fn callback_returns(cx: &Context<'_>, value: Value) -> Result<MultiValue> {
    let values = match value {
        Value::List(list) if cx.config().unpack_returns => to_lua_multi(cx, &list.to_vec())?,
        single => vec![to_lua(cx, &single)?],
    };
    Ok(MultiValue::from_vec(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_rejects_wide_chars() {
        assert_eq!(
            encode(Encoding::Latin1, "café").expect("latin-1"),
            vec![b'c', b'a', b'f', 0xE9]
        );
        let err = encode(Encoding::Latin1, "5€").expect_err("euro sign");
        assert!(matches!(
            err,
            Error::Conversion(ConversionError::Encoding { ch: '€', .. })
        ));
    }

    #[test]
    fn utf8_decode_falls_back_to_bytes() {
        assert_eq!(
            decode(Encoding::Utf8, "héllo".as_bytes()),
            Value::Text("héllo".into())
        );
        assert_eq!(
            decode(Encoding::Utf8, &[0xff, 0xfe]),
            Value::Bytes(vec![0xff, 0xfe])
        );
    }

    #[test]
    fn latin1_decode_maps_every_byte() {
        assert_eq!(decode(Encoding::Latin1, &[0x63, 0xE9]), Value::Text("cé".into()));
    }

    #[test]
    fn binary_always_decodes_to_bytes() {
        assert_eq!(decode(Encoding::Binary, b"abc"), Value::Bytes(b"abc".to_vec()));
    }
}
