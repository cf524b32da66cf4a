//! Opaque engine values.

use super::ProxyRef;
use crate::error::Result;
use std::fmt;

/// Handle on an engine value the host cannot look into: full or light
/// userdata, LuaJIT cdata, or an error object.
#[derive(Clone, PartialEq, Eq)]
pub struct UserData(pub(crate) ProxyRef);

impl UserData {
    /// Returns the engine's `type()` of the value.
    pub fn type_name(&self) -> Result<String> {
        self.0.with(|cx, value| Ok(cx.internals.type_of.call::<String>(value)?))
    }

    /// Id of the runtime that owns this value.
    #[must_use]
    pub fn runtime_id(&self) -> u64 {
        self.0.runtime_id()
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({:?})", self.0)
    }
}
