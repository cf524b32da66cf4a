//! Coroutine proxy.

use super::{expect_kind, ProxyRef};
use crate::bridge;
use crate::convert;
use crate::error::{Error, Result};
use crate::state::Context;
use crate::value::Value;
use mlua::MultiValue;
use std::fmt;

/// Coroutine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoroutineStatus {
    /// Created from the host and never resumed.
    Created,
    /// Yielded, or handed over by script code without having finished.
    Suspended,
    /// Currently executing, or resuming another coroutine.
    Running,
    /// Returned or raised.
    Dead,
}

impl CoroutineStatus {
    /// Returns the lowercase state name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Suspended => "suspended",
            Self::Running => "running",
            Self::Dead => "dead",
        }
    }

    /// Returns true for states a resume is accepted in.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Created | Self::Suspended)
    }
}

impl fmt::Display for CoroutineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle on an engine coroutine.
///
/// # Example
///
/// ```
/// use moonbridge::{CoroutineStatus, Runtime, Value};
///
/// let rt = Runtime::new()?;
/// let gen = rt
///     .eval("function(n) for i = 1, n do coroutine.yield(i) end end")?
///     .into_function()
///     .expect("function");
/// let co = gen.coroutine([Value::Integer(2)])?;
/// assert_eq!(co.status()?, CoroutineStatus::Created);
/// assert_eq!(co.resume([])?, Value::Integer(1));
/// assert_eq!(co.status()?, CoroutineStatus::Suspended);
/// # Ok::<(), moonbridge::Error>(())
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Coroutine(pub(crate) ProxyRef);

impl Coroutine {
    fn with<R>(&self, f: impl FnOnce(&Context<'_>, mlua::Thread) -> Result<R>) -> Result<R> {
        self.0.with(|cx, value| {
            let thread = expect_kind!(value, Thread, "coroutine");
            f(cx, thread)
        })
    }

    /// Returns the current state.
    pub fn status(&self) -> Result<CoroutineStatus> {
        self.with(|cx, thread| status_of(cx, &self.0, &thread))
    }

    /// Resumes the coroutine, collapsing the yielded or returned values.
    ///
    /// Fails with [`Error::CoroutineState`] if the coroutine is dead or
    /// already running.
    pub fn resume(&self, args: impl IntoIterator<Item = Value>) -> Result<Value> {
        let args: Vec<Value> = args.into_iter().collect();
        self.resume_with(&args, convert::collapse_returns)
    }

    /// Resumes the coroutine and returns every yielded or returned value.
    pub fn resume_multi(&self, args: impl IntoIterator<Item = Value>) -> Result<Vec<Value>> {
        let args: Vec<Value> = args.into_iter().collect();
        self.resume_with(&args, convert::to_host_multi)
    }

    /// Resumes with no arguments until the coroutine is dead.
    ///
    /// A final `nil` return is not yielded.
    #[must_use]
    pub fn values(&self) -> CoroutineValues {
        CoroutineValues {
            coroutine: self.clone(),
            done: false,
        }
    }

    /// Id of the runtime that owns this coroutine.
    #[must_use]
    pub fn runtime_id(&self) -> u64 {
        self.0.runtime_id()
    }

    fn resume_with<R>(
        &self,
        args: &[Value],
        finish: impl FnOnce(&Context<'_>, MultiValue) -> Result<R>,
    ) -> Result<R> {
        self.with(|cx, thread| {
            let status = status_of(cx, &self.0, &thread)?;
            if !status.is_resumable() {
                return Err(Error::CoroutineState { status });
            }
            let args = convert::to_lua_multi(cx, args)?;
            let results = bridge::resume_thread(cx, thread, args)?;
            finish(cx, results)
        })
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coroutine({:?})", self.0)
    }
}

/// Maps the engine status onto [`CoroutineStatus`].
///
/// The engine reports `suspended` both before the first resume and after a
/// yield. Threads made by [`Function::coroutine`](crate::Function::coroutine)
/// record their first entry engine-side, so resumes from script code count
/// too; threads made by scripts are always treated as started.
fn status_of(cx: &Context<'_>, proxy: &ProxyRef, thread: &mlua::Thread) -> Result<CoroutineStatus> {
    let status = cx.internals.status.call::<String>(thread.clone())?;
    Ok(match status.as_str() {
        "suspended" if cx.started(proxy) => CoroutineStatus::Suspended,
        "suspended" if cx.internals.entered.call::<bool>(thread.clone())? => {
            CoroutineStatus::Suspended
        }
        "suspended" => CoroutineStatus::Created,
        "running" | "normal" => CoroutineStatus::Running,
        _ => CoroutineStatus::Dead,
    })
}

/// Iterator returned by [`Coroutine::values`].
pub struct CoroutineValues {
    coroutine: Coroutine,
    done: bool,
}

impl Iterator for CoroutineValues {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.coroutine.with(|cx, thread| {
            let proxy = &self.coroutine.0;
            let status = status_of(cx, proxy, &thread)?;
            if status == CoroutineStatus::Dead {
                return Ok(None);
            }
            if !status.is_resumable() {
                return Err(Error::CoroutineState { status });
            }
            let results = bridge::resume_thread(cx, thread.clone(), Vec::new())?;
            let value = convert::collapse_returns(cx, results)?;
            let finished = status_of(cx, proxy, &thread)? == CoroutineStatus::Dead;
            Ok(Some((value, finished)))
        });
        match step {
            Ok(Some((value, finished))) => {
                if finished {
                    self.done = true;
                    if value.is_nil() {
                        return None;
                    }
                }
                Some(Ok(value))
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

impl std::iter::FusedIterator for CoroutineValues {}
