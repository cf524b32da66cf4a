//! Host handles over engine objects.
//!
//! A proxy is a cheap, cloneable handle on one registry slot. Clones share
//! the slot's count; the last clone to drop queues the slot for release.
//! Proxies hold their runtime strongly: dropping the [`Runtime`](crate::Runtime)
//! handle keeps the engine open until the last proxy is gone. An explicit
//! [`Runtime::close`](crate::Runtime::close) refuses while proxies are live.

mod coroutine;
mod function;
mod table;
mod userdata;

pub use coroutine::{Coroutine, CoroutineStatus, CoroutineValues};
pub use function::Function;
pub use table::{Table, TableIter};
pub use userdata::UserData;

use crate::error::Result;
use crate::registry::SlotId;
use crate::state::{Context, Shared};
use std::fmt;
use std::sync::Arc;

/// Shared handle on one registry slot.
#[derive(Clone)]
pub(crate) struct ProxyRef(Arc<Anchor>);

struct Anchor {
    owner: Arc<Shared>,
    slot: SlotId,
}

impl Drop for Anchor {
    fn drop(&mut self) {
        self.owner.schedule_release(self.slot);
    }
}

impl ProxyRef {
    pub(crate) fn new(owner: Arc<Shared>, slot: SlotId) -> Self {
        Self(Arc::new(Anchor { owner, slot }))
    }

    pub(crate) fn runtime_id(&self) -> u64 {
        self.0.owner.id()
    }

    pub(crate) fn slot(&self) -> SlotId {
        self.0.slot
    }

    /// Runs `f` under the owning runtime's guard with the anchored value.
    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&Context<'_>, mlua::Value) -> Result<R>,
    ) -> Result<R> {
        self.0.owner.enter(|cx| {
            let value = cx.fetch(self)?;
            f(cx, value)
        })
    }
}

impl PartialEq for ProxyRef {
    fn eq(&self, other: &Self) -> bool {
        self.runtime_id() == other.runtime_id() && self.slot() == other.slot()
    }
}

impl Eq for ProxyRef {}

impl fmt::Debug for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime={} slot={:?}", self.runtime_id(), self.slot())
    }
}

/// Unwraps an engine value of the expected variant or returns a type error.
macro_rules! expect_kind {
    ($value:expr, $variant:ident, $what:literal) => {
        match $value {
            mlua::Value::$variant(inner) => inner,
            other => {
                return Err($crate::error::Error::runtime(format!(
                    concat!("expected ", $what, ", found {}"),
                    other.type_name()
                )))
            }
        }
    };
}

pub(crate) use expect_kind;
