//! Embedded-state handle and concurrency guard.
//!
//! [`Shared`] owns the one interpreter state of a runtime behind a
//! re-entrant mutex. Every operation that touches the engine goes through
//! [`Shared::enter`], which hands out a [`Context`] for the duration of the
//! guarded region. A host callback invoked from script code re-enters on
//! the thread that already holds the guard, so nested calls never deadlock.
//!
//! Proxy drops never block: they queue their slot on a release list that is
//! drained the next time the guard is taken (or immediately, if it is free).

use crate::bridge::Internals;
use crate::config::{Library, RuntimeConfig};
use crate::error::{ConversionError, LifecycleError, Result};
use crate::proxy::ProxyRef;
use crate::registry::{ObjectKind, Registry, SlotId};
use mlua::{Lua, LuaOptions, RegistryKey, StdLib};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Interpreter plus the bridge helpers loaded into it.
pub(crate) struct Engine {
    // Dropped before `lua`.
    internals: Internals,
    lua: Lua,
}

/// Guarded runtime state. Only touched while holding [`Shared::state`].
pub(crate) struct State {
    engine: RefCell<Option<Engine>>,
    registry: RefCell<Registry>,
    /// Number of active guarded regions on the owning thread.
    depth: Cell<usize>,
}

/// State shared between a runtime and the proxies it hands out.
pub(crate) struct Shared {
    id: u64,
    config: RuntimeConfig,
    engine_version: String,
    state: ReentrantMutex<State>,
    releases: Mutex<Vec<SlotId>>,
}

impl Shared {
    /// Creates the interpreter and loads the standard libraries.
    pub(crate) fn open(config: RuntimeConfig) -> Result<Arc<Self>> {
        // SAFETY: `ALL` includes `debug` and `ffi`; libraries the config
        // withholds are removed from the environment before any script runs.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL, LuaOptions::new()) };
        let internals = Internals::load(&lua)?;
        withhold(&lua, &config.suppress)?;

        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let engine_version = internals.version().to_string();
        debug!(
            runtime = id,
            engine = %engine_version,
            encoding = %config.encoding,
            suppressed = config.suppress.len(),
            "runtime opened"
        );

        Ok(Arc::new(Self {
            id,
            config,
            engine_version,
            state: ReentrantMutex::new(State {
                engine: RefCell::new(Some(Engine { internals, lua })),
                registry: RefCell::new(Registry::new()),
                depth: Cell::new(0),
            }),
            releases: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Runs `f` inside the guard.
    ///
    /// Blocks while another thread holds the guard. Re-entering from the
    /// thread that holds it succeeds immediately.
    pub(crate) fn enter<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Context<'_>) -> Result<R>,
    ) -> Result<R> {
        let state = self.state.lock();
        self.drain_releases(&state);

        let engine = state.engine.borrow();
        let Some(engine) = engine.as_ref() else {
            return Err(LifecycleError::Closed.into());
        };
        let depth = DepthGuard::new(&state.depth);
        trace!(runtime = self.id, depth = depth.level(), "guard entered");

        let cx = Context {
            shared: self,
            state: &state,
            lua: &engine.lua,
            internals: &engine.internals,
        };
        f(&cx)
    }

    /// Tears down the interpreter.
    ///
    /// Closing an already closed runtime succeeds. Fails without touching
    /// the engine if proxies are alive or a call is executing.
    pub(crate) fn close(&self) -> Result<()> {
        let Some(state) = self.state.try_lock() else {
            return Err(LifecycleError::CallInFlight.into());
        };
        if state.depth.get() > 0 {
            return Err(LifecycleError::CallInFlight.into());
        }
        self.drain_releases(&state);
        if state.engine.borrow().is_none() {
            return Ok(());
        }

        let live = state.registry.borrow().live();
        if live > 0 {
            debug!(runtime = self.id, live, "close refused: live references");
            return Err(LifecycleError::LiveReferences(live).into());
        }

        let engine = state.engine.borrow_mut().take();
        drop(engine);
        // Dropping the engine may release proxies captured by callbacks.
        self.drain_releases(&state);
        debug!(runtime = self.id, "runtime closed");
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        let state = self.state.lock();
        let closed = state.engine.borrow().is_none();
        closed
    }

    /// Number of anchored engine objects.
    pub(crate) fn live_references(&self) -> usize {
        let state = self.state.lock();
        self.drain_releases(&state);
        let live = state.registry.borrow().live();
        live
    }

    /// Queues `slot` for release and drains the queue if the guard is free.
    pub(crate) fn schedule_release(&self, slot: SlotId) {
        self.releases.lock().push(slot);
        if let Some(state) = self.state.try_lock() {
            self.drain_releases(&state);
        }
    }

    /// Best-effort drain for teardown, reporting what is left behind.
    pub(crate) fn finish(&self) {
        let Some(state) = self.state.try_lock() else {
            warn!(runtime = self.id, "runtime dropped while a call is in flight");
            return;
        };
        self.drain_releases(&state);
        let pending = self.releases.lock().len();
        if pending > 0 {
            warn!(runtime = self.id, pending, "deferred releases not drained at teardown");
        }
        if let Ok(registry) = state.registry.try_borrow() {
            if registry.live() > 0 {
                debug!(
                    runtime = self.id,
                    live = registry.live(),
                    "runtime handle dropped; live proxies keep the engine open"
                );
            }
        }
        debug!(runtime = self.id, "runtime dropped");
    }

    fn drain_releases(&self, state: &State) {
        let pending = std::mem::take(&mut *self.releases.lock());
        if pending.is_empty() {
            return;
        }
        let Ok(mut registry) = state.registry.try_borrow_mut() else {
            self.releases.lock().extend(pending);
            return;
        };
        let keys: Vec<RegistryKey> = pending
            .into_iter()
            .filter_map(|slot| registry.release(slot))
            .collect();
        drop(registry);

        // Without an engine the keys are simply dropped.
        let Ok(engine) = state.engine.try_borrow() else {
            return;
        };
        let Some(engine) = engine.as_ref() else {
            return;
        };
        for key in keys {
            if let Err(err) = engine.lua.remove_registry_value(key) {
                warn!(runtime = self.id, error = %err, "failed to remove registry value");
            }
        }
    }
}

/// Counts nested guarded regions; restores the count on every exit path.
struct DepthGuard<'a> {
    depth: &'a Cell<usize>,
}

impl<'a> DepthGuard<'a> {
    fn new(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Self { depth }
    }

    fn level(&self) -> usize {
        self.depth.get()
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

/// Access to the engine for the duration of one guarded region.
pub(crate) struct Context<'a> {
    pub(crate) shared: &'a Arc<Shared>,
    pub(crate) lua: &'a Lua,
    pub(crate) internals: &'a Internals,
    state: &'a State,
}

impl Context<'_> {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub(crate) fn runtime_id(&self) -> u64 {
        self.shared.id
    }

    /// Anchors an engine object and returns a handle to its slot.
    ///
    /// Objects already anchored share their slot.
    pub(crate) fn anchor(
        &self,
        value: mlua::Value,
        kind: ObjectKind,
        started: bool,
    ) -> Result<ProxyRef> {
        let ptr = match &value {
            mlua::Value::LightUserData(_) | mlua::Value::Error(_) => 0,
            other => other.to_pointer() as usize,
        };
        let existing = self.state.registry.borrow_mut().retain_existing(ptr);
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let key = self.lua.create_registry_value(value)?;
                self.state
                    .registry
                    .borrow_mut()
                    .insert(key, ptr, kind, started)
            }
        };
        Ok(ProxyRef::new(Arc::clone(self.shared), slot))
    }

    /// Resolves a proxy to the engine object it anchors.
    pub(crate) fn fetch(&self, proxy: &ProxyRef) -> Result<mlua::Value> {
        if proxy.runtime_id() != self.shared.id {
            return Err(ConversionError::ForeignProxy {
                owner: proxy.runtime_id(),
                target: self.shared.id,
            }
            .into());
        }
        let registry = self.state.registry.borrow();
        let entry = registry
            .get(proxy.slot())
            .ok_or(LifecycleError::Dropped)?;
        Ok(self.lua.registry_value::<mlua::Value>(&entry.key)?)
    }

    /// Whether the anchored coroutine was first seen already started.
    pub(crate) fn started(&self, proxy: &ProxyRef) -> bool {
        self.state
            .registry
            .borrow()
            .get(proxy.slot())
            .is_some_and(|entry| entry.started)
    }
}

/// Removes withheld standard libraries from the global environment and from
/// the loaded-module cache.
fn withhold(lua: &Lua, libraries: &[Library]) -> Result<()> {
    if libraries.is_empty() {
        return Ok(());
    }
    let globals = lua.globals();
    let loaded: Option<mlua::Table> = lua.named_registry_value("_LOADED")?;
    for library in libraries {
        let name = library.global_name();
        globals.raw_set(name, mlua::Value::Nil)?;
        if let Some(loaded) = &loaded {
            loaded.raw_set(name, mlua::Value::Nil)?;
        }
        if *library == Library::Package {
            globals.raw_set("require", mlua::Value::Nil)?;
            globals.raw_set("module", mlua::Value::Nil)?;
        }
        trace!(library = name, "standard library withheld");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn runtime_ids_are_unique() {
        let a = Shared::open(RuntimeConfig::default()).expect("open a");
        let b = Shared::open(RuntimeConfig::default()).expect("open b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn enter_tracks_depth() {
        let shared = Shared::open(RuntimeConfig::default()).expect("open");
        let depth = shared
            .enter(|cx| cx.shared.enter(|_| Ok(cx.state.depth.get())))
            .expect("nested enter");
        assert_eq!(depth, 2);
        assert_eq!(shared.state.lock().depth.get(), 0);
    }

    #[test]
    fn close_inside_guard_is_refused() {
        let shared = Shared::open(RuntimeConfig::default()).expect("open");
        let err = shared
            .enter(|cx| cx.shared.close())
            .expect_err("close in guard");
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::CallInFlight)
        ));
        assert!(!shared.is_closed());
    }

    #[test]
    fn close_is_idempotent_and_blocks_enter() {
        let shared = Shared::open(RuntimeConfig::default()).expect("open");
        shared.close().expect("first close");
        shared.close().expect("second close");
        assert!(shared.is_closed());
        let err = shared.enter(|_| Ok(())).expect_err("closed");
        assert!(matches!(err, Error::Lifecycle(LifecycleError::Closed)));
    }

    #[test]
    fn anchors_are_released_through_the_queue() {
        let shared = Shared::open(RuntimeConfig::default()).expect("open");
        let proxy = shared
            .enter(|cx| {
                let table = cx.lua.create_table()?;
                cx.anchor(mlua::Value::Table(table), ObjectKind::Table, false)
            })
            .expect("anchor");
        assert_eq!(shared.live_references(), 1);
        drop(proxy);
        assert_eq!(shared.live_references(), 0);
    }

    #[test]
    fn withheld_libraries_are_gone() {
        let config = RuntimeConfig::default()
            .suppress(Library::Io)
            .suppress(Library::Package);
        let shared = Shared::open(config).expect("open");
        shared
            .enter(|cx| {
                let globals = cx.lua.globals();
                assert!(globals.raw_get::<mlua::Value>("io")?.is_nil());
                assert!(globals.raw_get::<mlua::Value>("require")?.is_nil());
                assert!(!globals.raw_get::<mlua::Value>("string")?.is_nil());
                Ok(())
            })
            .expect("inspect globals");
    }
}
