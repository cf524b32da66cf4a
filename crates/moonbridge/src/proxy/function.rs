//! Function proxy.

use super::{expect_kind, Coroutine, ProxyRef};
use crate::bridge;
use crate::convert;
use crate::error::{Error, Result};
use crate::registry::ObjectKind;
use crate::state::Context;
use crate::value::{Map, Value};
use std::fmt;

/// Handle on an engine function.
#[derive(Clone, PartialEq, Eq)]
pub struct Function(pub(crate) ProxyRef);

impl Function {
    fn with<R>(&self, f: impl FnOnce(&Context<'_>, mlua::Function) -> Result<R>) -> Result<R> {
        self.0.with(|cx, value| {
            let function = expect_kind!(value, Function, "function");
            f(cx, function)
        })
    }

    /// Calls the function, collapsing its results to one value.
    ///
    /// Multiple results come back as a [`List`](crate::List) when the
    /// runtime unpacks returns, otherwise only the first is kept.
    pub fn call(&self, args: impl IntoIterator<Item = Value>) -> Result<Value> {
        let args: Vec<Value> = args.into_iter().collect();
        self.with(|cx, function| {
            let args = convert::to_lua_multi(cx, &args)?;
            let results = bridge::call_function(cx, &function, args)?;
            convert::collapse_returns(cx, results)
        })
    }

    /// Calls the function and returns every result.
    pub fn call_multi(&self, args: impl IntoIterator<Item = Value>) -> Result<Vec<Value>> {
        let args: Vec<Value> = args.into_iter().collect();
        self.with(|cx, function| {
            let args = convert::to_lua_multi(cx, &args)?;
            let results = bridge::call_function(cx, &function, args)?;
            convert::to_host_multi(cx, results)
        })
    }

    /// Calls the function with keyword-like arguments.
    ///
    /// `kwargs` is passed as one table after the positional arguments.
    pub fn call_with_kwargs(
        &self,
        args: impl IntoIterator<Item = Value>,
        kwargs: Map,
    ) -> Result<Value> {
        let mut args: Vec<Value> = args.into_iter().collect();
        args.push(Value::Map(kwargs));
        self.call(args)
    }

    /// Creates a coroutine running this function.
    ///
    /// The coroutine starts in the `created` state. Its first resume calls
    /// the function with `args` followed by the resume arguments.
    pub fn coroutine(&self, args: impl IntoIterator<Item = Value>) -> Result<Coroutine> {
        let args: Vec<Value> = args.into_iter().collect();
        self.with(|cx, function| {
            let mut spawn_args = vec![mlua::Value::Function(function)];
            spawn_args.extend(convert::to_lua_multi(cx, &args)?);
            let body = bridge::call_function(cx, &cx.internals.spawn, spawn_args)?;
            let body = match body.into_vec().into_iter().next() {
                Some(mlua::Value::Function(body)) => body,
                _ => return Err(Error::runtime("spawn did not return a function")),
            };
            let thread = cx.lua.create_thread(body)?;
            let anchor = cx.anchor(mlua::Value::Thread(thread), ObjectKind::Coroutine, false)?;
            Ok(Coroutine(anchor))
        })
    }

    /// Id of the runtime that owns this function.
    #[must_use]
    pub fn runtime_id(&self) -> u64 {
        self.0.runtime_id()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:?})", self.0)
    }
}
