//! Call bridge.
//!
//! Host-to-engine calls run through a small bootstrap chunk whose
//! `protected` helper wraps every call in `xpcall` with a handler that
//! records the traceback while the failing frames are still on the stack.
//! Engine-to-host calls go through closures created by [`host_function`],
//! which re-enter the runtime guard on the calling thread.

use crate::convert;
use crate::error::{Error, LifecycleError, Result, Traceback};
use crate::runtime::Scope;
use crate::state::Context;
use crate::translate;
use crate::value::Callback;
use mlua::{Lua, MultiValue};
use std::sync::Arc;
use tracing::warn;

const BOOTSTRAP: &str = r##"
local traceback = debug.traceback
local xpcall, select, unpack, type, setmetatable = xpcall, select, unpack, type, setmetatable
local co_resume, co_status, co_running = coroutine.resume, coroutine.status, coroutine.running

local function pack(...)
  return { n = select("#", ...), ... }
end

local function capture(err)
  return { err, traceback("", 2) }
end

-- Threads whose body has started running.
local entered = setmetatable({}, { __mode = "k" })

local helpers = {}

function helpers.protected(f, ...)
  local args = pack(...)
  return xpcall(function()
    return pack(f(unpack(args, 1, args.n)))
  end, capture)
end

function helpers.resume(co, ...)
  local res = pack(co_resume(co, ...))
  if not res[1] then
    return false, { res[2], traceback(co, "", 0) }
  end
  return true, pack(unpack(res, 2, res.n))
end

function helpers.spawn(f, ...)
  local bound = pack(...)
  return function(...)
    entered[co_running()] = true
    local extra = pack(...)
    local all = {}
    for i = 1, bound.n do all[i] = bound[i] end
    for i = 1, extra.n do all[bound.n + i] = extra[i] end
    return f(unpack(all, 1, bound.n + extra.n))
  end
end

function helpers.entered(co)
  return entered[co] == true
end

function helpers.host(f)
  return function(...)
    return f(pack(...))
  end
end

function helpers.index(t, k) return t[k] end
function helpers.assign(t, k, v) t[k] = v end
function helpers.length(t) return #t end

helpers.status = co_status
helpers.next = next
helpers.type = type
helpers.tostring = tostring
helpers.getmetatable = getmetatable
helpers.setmetatable = setmetatable
helpers.version = (jit and jit.version) or _VERSION
return helpers
"##;

/// Bridge helpers captured from the bootstrap chunk.
///
/// Captured before any standard library is withheld, so they keep working
/// when scripts cannot see `debug` or `coroutine`.
pub(crate) struct Internals {
    pub(crate) protected: mlua::Function,
    pub(crate) resume: mlua::Function,
    pub(crate) spawn: mlua::Function,
    pub(crate) entered: mlua::Function,
    host: mlua::Function,
    pub(crate) index: mlua::Function,
    pub(crate) assign: mlua::Function,
    pub(crate) length: mlua::Function,
    pub(crate) status: mlua::Function,
    pub(crate) next: mlua::Function,
    pub(crate) type_of: mlua::Function,
    pub(crate) tostring: mlua::Function,
    pub(crate) getmetatable: mlua::Function,
    pub(crate) setmetatable: mlua::Function,
    version: String,
}

impl Internals {
    pub(crate) fn load(lua: &Lua) -> Result<Self> {
        let helpers: mlua::Table = lua.load(BOOTSTRAP).set_name("=moonbridge").eval()?;
        Ok(Self {
            protected: helpers.get("protected")?,
            resume: helpers.get("resume")?,
            spawn: helpers.get("spawn")?,
            entered: helpers.get("entered")?,
            host: helpers.get("host")?,
            index: helpers.get("index")?,
            assign: helpers.get("assign")?,
            length: helpers.get("length")?,
            status: helpers.get("status")?,
            next: helpers.get("next")?,
            type_of: helpers.get("type")?,
            tostring: helpers.get("tostring")?,
            getmetatable: helpers.get("getmetatable")?,
            setmetatable: helpers.get("setmetatable")?,
            version: helpers.get("version")?,
        })
    }

    /// Engine version string (`jit.version` or `_VERSION`).
    pub(crate) fn version(&self) -> &str {
        &self.version
    }
}

/// Calls `func` in protected mode and returns its raw results.
pub(crate) fn call_function(
    cx: &Context<'_>,
    func: &mlua::Function,
    args: Vec<mlua::Value>,
) -> Result<MultiValue> {
    let mut all = Vec::with_capacity(args.len() + 1);
    all.push(mlua::Value::Function(func.clone()));
    all.extend(args);
    let results = cx
        .internals
        .protected
        .call::<MultiValue>(MultiValue::from_vec(all))?;
    unwrap_protected(cx, results)
}

/// Resumes `thread` and returns the yielded or returned values.
pub(crate) fn resume_thread(
    cx: &Context<'_>,
    thread: mlua::Thread,
    args: Vec<mlua::Value>,
) -> Result<MultiValue> {
    let mut all = Vec::with_capacity(args.len() + 1);
    all.push(mlua::Value::Thread(thread));
    all.extend(args);
    let results = cx
        .internals
        .resume
        .call::<MultiValue>(MultiValue::from_vec(all))?;
    unwrap_protected(cx, results)
}

/// Splits an `(ok, packed | holder)` pair from `protected` or `resume`.
fn unwrap_protected(cx: &Context<'_>, results: MultiValue) -> Result<MultiValue> {
    let mut values = results.into_vec().into_iter();
    match (values.next(), values.next()) {
        (Some(mlua::Value::Boolean(true)), Some(mlua::Value::Table(packed))) => {
            convert::unpack(&packed)
        }
        (Some(mlua::Value::Boolean(false)), holder) => Err(translate::from_capture(
            cx,
            holder.unwrap_or(mlua::Value::Nil),
        )),
        _ => Err(Error::runtime("protected call returned no status")),
    }
}

/// Wraps a host callback as an engine function.
///
/// The closure holds the runtime weakly; it re-enters the guard, which the
/// calling thread already owns while script code is running.
pub(crate) fn host_function(cx: &Context<'_>, callback: &Callback) -> Result<mlua::Function> {
    let owner = Arc::downgrade(cx.shared);
    let callback = callback.clone();
    let func = cx.lua.create_function(move |_, args: mlua::Table| {
        let shared = owner
            .upgrade()
            .ok_or_else(|| translate::to_lua(LifecycleError::Dropped.into()))?;
        shared
            .enter(|cx| invoke_callback(cx, &callback, &args))
            .map_err(translate::to_lua)
    })?;
    Ok(cx.internals.host.call::<mlua::Function>(func)?)
}

fn invoke_callback(
    cx: &Context<'_>,
    callback: &Callback,
    args: &mlua::Table,
) -> Result<MultiValue> {
    let args = convert::to_host_multi(cx, convert::unpack(args)?)?;
    let scope = Scope::new(Arc::clone(cx.shared));
    match callback.invoke(&scope, args) {
        Ok(value) => convert::callback_returns(cx, value),
        Err(source) => {
            let name = callback.name();
            warn!(
                runtime = cx.runtime_id(),
                callback = name.unwrap_or("<anonymous>"),
                error = %source,
                "host callback failed"
            );
            Err(Error::HostCallback {
                callback: name.map(str::to_string),
                source: Arc::from(source),
                traceback: Traceback::default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{LuaOptions, StdLib};

    fn lua() -> Lua {
        // SAFETY: the bootstrap needs `debug`; test chunks are trusted.
        unsafe { Lua::unsafe_new_with(StdLib::ALL, LuaOptions::new()) }
    }

    #[test]
    fn bootstrap_loads_all_helpers() {
        let lua = lua();
        let internals = Internals::load(&lua).expect("bootstrap");
        assert!(!internals.version().is_empty());
    }

    #[test]
    fn protected_reports_failure_with_traceback() {
        let lua = lua();
        let internals = Internals::load(&lua).expect("bootstrap");
        let failing: mlua::Function = lua
            .load("error('boom')")
            .set_name("=test")
            .into_function()
            .expect("compile");
        let results = internals
            .protected
            .call::<MultiValue>(failing)
            .expect("protected never raises");
        let values = results.into_vec();
        assert_eq!(values[0], mlua::Value::Boolean(false));

        let holder = values[1].as_table().expect("holder table");
        let message: String = holder.raw_get(1).expect("message");
        let traceback: String = holder.raw_get(2).expect("traceback");
        assert!(message.contains("boom"));
        assert!(traceback.contains("stack traceback:"));
    }

    #[test]
    fn protected_packs_results_with_their_count() {
        let lua = lua();
        let internals = Internals::load(&lua).expect("bootstrap");
        let returns: mlua::Function = lua
            .load("return function() return 1e-300, nil, 'x', nil end")
            .eval()
            .expect("function");
        let results = internals
            .protected
            .call::<MultiValue>(returns)
            .expect("protected never raises");
        let values = results.into_vec();
        assert_eq!(values[0], mlua::Value::Boolean(true));

        let packed = values[1].as_table().expect("packed table");
        let unpacked = convert::unpack(packed).expect("unpack").into_vec();
        assert_eq!(unpacked.len(), 4);
        assert_eq!(unpacked[0], mlua::Value::Number(1e-300));
        assert_eq!(unpacked[3], mlua::Value::Nil);
    }

    #[test]
    fn spawn_prepends_arguments_and_marks_entry() {
        let lua = lua();
        let internals = Internals::load(&lua).expect("bootstrap");
        let concat: mlua::Function = lua
            .load("return function(...) return table.concat({...}, ',') end")
            .eval()
            .expect("function");
        let body: mlua::Function = internals
            .spawn
            .call((concat, "a", "b"))
            .expect("spawn");
        let thread = lua.create_thread(body).expect("thread");
        let entered: bool = internals.entered.call(thread.clone()).expect("entered");
        assert!(!entered);

        let joined: String = thread.resume(("c",)).expect("resume");
        assert_eq!(joined, "a,b,c");
        let entered: bool = internals.entered.call(thread).expect("entered");
        assert!(entered);
    }
}
