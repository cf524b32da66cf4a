//! Host-facing runtime API.

use crate::bridge;
use crate::config::RuntimeConfig;
use crate::convert;
use crate::error::{ConversionError, Error, Result};
use crate::proxy::{Function, Table};
use crate::registry::ObjectKind;
use crate::state::{Context, Shared};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

const EVAL_CHUNK: &str = "=eval";
const EXECUTE_CHUNK: &str = "=execute";

/// One embedded LuaJIT interpreter.
///
/// A runtime can be shared between threads (`&Runtime` is `Send + Sync`);
/// all calls are serialized on its guard. Dropping the runtime invalidates
/// every proxy it handed out. [`close`](Self::close) tears the interpreter
/// down explicitly and refuses while proxies are still alive.
///
/// # Example
///
/// ```
/// use moonbridge::{Callback, Runtime, Value};
///
/// let rt = Runtime::new()?;
/// rt.set_global(
///     "double",
///     Callback::named("double", |_, args| {
///         let n = args.first().and_then(Value::as_integer).unwrap_or(0);
///         Ok(Value::Integer(n * 2))
///     }),
/// )?;
/// assert_eq!(rt.eval("double(21)")?, Value::Integer(42));
/// # Ok::<(), moonbridge::Error>(())
/// ```
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Opens a runtime with `config`.
    ///
    /// # Errors
    ///
    /// Fails if the interpreter cannot be initialized.
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        Ok(Self {
            shared: Shared::open(config)?,
        })
    }

    /// Opens a runtime with the default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the interpreter cannot be initialized.
    pub fn new() -> Result<Self> {
        Self::open(RuntimeConfig::default())
    }

    /// Evaluates an expression (or, failing that, a chunk) and collapses its
    /// results to one value.
    pub fn eval(&self, source: &str) -> Result<Value> {
        eval(&self.shared, source)
    }

    /// Evaluates like [`eval`](Self::eval) and returns every result.
    pub fn eval_multi(&self, source: &str) -> Result<Vec<Value>> {
        eval_multi(&self.shared, source)
    }

    /// Runs a chunk for its side effects.
    pub fn execute(&self, source: &str) -> Result<()> {
        execute(&self.shared, source)
    }

    /// Compiles a chunk without running it.
    pub fn compile(&self, source: &str, name: &str) -> Result<Function> {
        self.shared.enter(|cx| {
            let function = load(cx, source, &format!("={name}"))?;
            Ok(Function(cx.anchor(
                mlua::Value::Function(function),
                ObjectKind::Function,
                false,
            )?))
        })
    }

    /// Returns the global environment table.
    pub fn globals(&self) -> Result<Table> {
        globals(&self.shared)
    }

    /// Reads a global variable.
    pub fn get_global(&self, name: &str) -> Result<Value> {
        globals(&self.shared)?.get(name)
    }

    /// Assigns a global variable.
    pub fn set_global(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        globals(&self.shared)?.set(name, value)
    }

    /// Loads a module through the engine's `require`.
    pub fn require(&self, module: &str) -> Result<Value> {
        let module = module.to_string();
        self.shared.enter(|cx| {
            let require = cx
                .lua
                .globals()
                .raw_get::<Option<mlua::Function>>("require")?
                .ok_or_else(|| Error::runtime("require is not available"))?;
            let name = convert::to_lua(cx, &Value::Text(module))?;
            let results = bridge::call_function(cx, &require, vec![name])?;
            convert::collapse_returns(cx, results)
        })
    }

    /// Creates an empty table.
    pub fn create_table(&self) -> Result<Table> {
        create_table(&self.shared)
    }

    /// Copies a host [`List`](crate::List) or [`Map`](crate::Map) into a
    /// new table.
    pub fn table_from(&self, value: impl Into<Value>) -> Result<Table> {
        let value = value.into();
        if !matches!(value, Value::List(_) | Value::Map(_)) {
            return Err(ConversionError::Unsupported(format!(
                "cannot build a table from {}",
                value.type_name()
            ))
            .into());
        }
        self.shared.enter(|cx| {
            let table = convert::to_lua(cx, &value)?;
            Ok(Table(cx.anchor(table, ObjectKind::Table, false)?))
        })
    }

    /// Tears down the interpreter.
    ///
    /// # Errors
    ///
    /// Fails with [`LifecycleError::LiveReferences`](crate::LifecycleError::LiveReferences)
    /// while proxies are alive, and with
    /// [`LifecycleError::CallInFlight`](crate::LifecycleError::CallInFlight)
    /// while a call is executing. Closing twice succeeds.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Returns true once [`close`](Self::close) has succeeded.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of engine objects currently anchored for proxies.
    #[must_use]
    pub fn live_references(&self) -> usize {
        self.shared.live_references()
    }

    /// The engine's version string, such as `LuaJIT 2.1.1700008891`.
    #[must_use]
    pub fn engine_version(&self) -> &str {
        self.shared.engine_version()
    }

    /// Process-unique id of this runtime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// The configuration this runtime was opened with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        self.shared.config()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shared.finish();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id())
            .field("engine", &self.engine_version())
            .finish_non_exhaustive()
    }
}

/// Handle passed to host callbacks.
///
/// Calls made through a scope run on the guard the invoking thread already
/// holds, so a callback can call back into the runtime that invoked it.
pub struct Scope {
    shared: Arc<Shared>,
}

impl Scope {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// See [`Runtime::eval`].
    pub fn eval(&self, source: &str) -> Result<Value> {
        eval(&self.shared, source)
    }

    /// See [`Runtime::eval_multi`].
    pub fn eval_multi(&self, source: &str) -> Result<Vec<Value>> {
        eval_multi(&self.shared, source)
    }

    /// See [`Runtime::execute`].
    pub fn execute(&self, source: &str) -> Result<()> {
        execute(&self.shared, source)
    }

    /// See [`Runtime::globals`].
    pub fn globals(&self) -> Result<Table> {
        globals(&self.shared)
    }

    /// See [`Runtime::create_table`].
    pub fn create_table(&self) -> Result<Table> {
        create_table(&self.shared)
    }

    /// Id of the runtime that invoked the callback.
    #[must_use]
    pub fn runtime_id(&self) -> u64 {
        self.shared.id()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("runtime", &self.shared.id())
            .finish()
    }
}

/// Compiles `source` as an expression list when it parses as one, and as a
/// chunk otherwise.
///
/// The expression list is passed through a local function rather than
/// returned directly: a plain `return f()` is a tail call, which drops the
/// caller's frame and the callee's name from tracebacks.
fn load_expression(cx: &Context<'_>, source: &str) -> Result<mlua::Function> {
    let wrapped = format!("local function results(...) return ... end return results({source}\n)");
    match load(cx, &wrapped, EVAL_CHUNK) {
        Ok(function) => Ok(function),
        Err(Error::Syntax { .. }) => load(cx, source, EVAL_CHUNK),
        Err(err) => Err(err),
    }
}

fn load(cx: &Context<'_>, source: &str, chunk_name: &str) -> Result<mlua::Function> {
    Ok(cx.lua.load(source).set_name(chunk_name).into_function()?)
}

fn eval(shared: &Arc<Shared>, source: &str) -> Result<Value> {
    shared.enter(|cx| {
        let function = load_expression(cx, source)?;
        let results = bridge::call_function(cx, &function, Vec::new())?;
        convert::collapse_returns(cx, results)
    })
}

fn eval_multi(shared: &Arc<Shared>, source: &str) -> Result<Vec<Value>> {
    shared.enter(|cx| {
        let function = load_expression(cx, source)?;
        let results = bridge::call_function(cx, &function, Vec::new())?;
        convert::to_host_multi(cx, results)
    })
}

fn execute(shared: &Arc<Shared>, source: &str) -> Result<()> {
    shared.enter(|cx| {
        let function = load(cx, source, EXECUTE_CHUNK)?;
        bridge::call_function(cx, &function, Vec::new())?;
        Ok(())
    })
}

fn globals(shared: &Arc<Shared>) -> Result<Table> {
    shared.enter(|cx| {
        let globals = mlua::Value::Table(cx.lua.globals());
        Ok(Table(cx.anchor(globals, ObjectKind::Table, false)?))
    })
}

fn create_table(shared: &Arc<Shared>) -> Result<Table> {
    shared.enter(|cx| {
        let table = mlua::Value::Table(cx.lua.create_table()?);
        Ok(Table(cx.anchor(table, ObjectKind::Table, false)?))
    })
}
