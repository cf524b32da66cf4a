//! Bidirectional bridge between Rust hosts and an embedded LuaJIT interpreter.
//!
//! Host values flow into scripts, and script tables, functions and
//! coroutines flow back out as proxies that stay usable after the call that
//! produced them returns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Runtime (host API)                                      │
//! │    eval / execute / globals / close                      │
//! │         │                                                │
//! │         ▼                                                │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  Shared: ReentrantMutex<State>   (guard)           │  │
//! │  │    engine: Lua + bootstrap helpers                 │  │
//! │  │    registry: slot -> RegistryKey + count           │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │         ▲                        │                       │
//! │         │ Arc                    ▼                       │
//! │  Table / Function /       convert: Value <-> mlua::Value │
//! │  Coroutine / UserData     bridge:  protected calls,      │
//! │  (proxies)                         host callbacks        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use moonbridge::{Map, Runtime, Value};
//!
//! let rt = Runtime::new()?;
//! let config = Map::new();
//! config.insert("name", "moon");
//! rt.set_global("config", config)?;
//!
//! let greet = rt
//!     .eval("function(prefix) return prefix .. config.name end")?
//!     .into_function()
//!     .expect("function");
//! assert_eq!(greet.call([Value::from("hello, ")])?, Value::from("hello, moon"));
//! # Ok::<(), moonbridge::Error>(())
//! ```
//!
//! # Threads
//!
//! A [`Runtime`] and its proxies are `Send + Sync`. Calls are serialized on
//! one re-entrant guard per runtime; a host callback invoked from script
//! code re-enters that guard on the same thread through its [`Scope`].

mod bridge;
mod config;
mod convert;
mod error;
mod proxy;
mod registry;
mod runtime;
mod state;
mod translate;
mod value;

pub use config::{
    ConfigError, ConfigLoader, CyclePolicy, Encoding, Library, RuntimeConfig, DEFAULT_MAX_DEPTH,
};
pub use error::{ConversionError, Error, Frame, LifecycleError, Result, Traceback};
pub use proxy::{
    Coroutine, CoroutineStatus, CoroutineValues, Function, Table, TableIter, UserData,
};
pub use runtime::{Runtime, Scope};
pub use value::{Callback, CallbackResult, List, Map, Value};

/// Crate version, set at build time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
