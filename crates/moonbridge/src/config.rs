//! Runtime configuration.
//!
//! # Layering
//!
//! ```text
//! Priority (highest to lowest):
//!
//! ┌─────────────────────────────────────────┐
//! │  1. Environment Variables (MOONBRIDGE_*)│
//! ├─────────────────────────────────────────┤
//! │  2. TOML file (ConfigLoader::with_file) │
//! ├─────────────────────────────────────────┤
//! │  3. Default Values                      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field | Type |
//! |----------|-------|------|
//! | `MOONBRIDGE_ENCODING` | `encoding` | `utf-8` \| `latin-1` \| `binary` |
//! | `MOONBRIDGE_ALLOW_HOST_CALLBACKS` | `allow_host_callbacks` | bool |
//! | `MOONBRIDGE_UNPACK_RETURNS` | `unpack_returns` | bool |
//! | `MOONBRIDGE_MAX_DEPTH` | `max_depth` | integer |
//!
//! # Example Configuration
//!
//! ```toml
//! allow_host_callbacks = true
//! encoding = "latin-1"
//! unpack_returns = false
//! suppress = ["io", "os"]
//! cycles = "reject"
//! max_depth = 64
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Default limit on container nesting during host→engine conversion.
pub const DEFAULT_MAX_DEPTH: usize = 200;

/// Charset used to convert text values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// UTF-8; undecodable engine strings come back as bytes.
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    /// ISO-8859-1; every byte maps to one char.
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
    /// No decoding; engine strings always come back as bytes.
    #[serde(rename = "binary")]
    Binary,
}

impl Encoding {
    /// Returns the canonical charset name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Latin1 => "latin-1",
            Self::Binary => "binary",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Self::Latin1),
            "binary" | "none" => Ok(Self::Binary),
            other => Err(ConfigError::UnknownEncoding(other.to_string())),
        }
    }
}

/// What to do when a host container is reached again during conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    /// Reuse the table already created for the container.
    #[default]
    Preserve,
    /// Fail with a conversion error.
    Reject,
}

/// Standard library modules that can be removed from a runtime.
///
/// The base library cannot be suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    /// `coroutine.*`
    Coroutine,
    /// `table.*`
    Table,
    /// `io.*`
    Io,
    /// `os.*`
    Os,
    /// `string.*`
    String,
    /// `math.*`
    Math,
    /// `package` and `require`
    Package,
    /// `debug.*`
    Debug,
    /// `bit.*`
    Bit,
    /// `jit.*`
    Jit,
    /// `ffi`
    Ffi,
}

impl Library {
    /// Returns the global name the module is installed under.
    #[must_use]
    pub fn global_name(self) -> &'static str {
        match self {
            Self::Coroutine => "coroutine",
            Self::Table => "table",
            Self::Io => "io",
            Self::Os => "os",
            Self::String => "string",
            Self::Math => "math",
            Self::Package => "package",
            Self::Debug => "debug",
            Self::Bit => "bit",
            Self::Jit => "jit",
            Self::Ffi => "ffi",
        }
    }
}

/// Configuration for one runtime.
///
/// # Example
///
/// ```
/// use moonbridge::{Encoding, RuntimeConfig};
///
/// let config = RuntimeConfig::default().with_encoding(Encoding::Latin1);
/// assert!(config.allow_host_callbacks);
/// assert_eq!(config.encoding, Encoding::Latin1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Allow host callbacks to be converted into engine functions.
    pub allow_host_callbacks: bool,

    /// Charset for text conversion.
    pub encoding: Encoding,

    /// Return multiple engine results as a list instead of the first one.
    ///
    /// Also expands a list returned from a host callback into multiple
    /// engine results.
    pub unpack_returns: bool,

    /// Standard library modules removed after the engine is opened.
    pub suppress: Vec<Library>,

    /// Policy for self-referential host containers.
    pub cycles: CyclePolicy,

    /// Maximum container nesting converted from host to engine.
    pub max_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            allow_host_callbacks: true,
            encoding: Encoding::Utf8,
            unpack_returns: true,
            suppress: Vec::new(),
            cycles: CyclePolicy::Preserve,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl RuntimeConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables host callbacks.
    #[must_use]
    pub fn with_host_callbacks(mut self, allow: bool) -> Self {
        self.allow_host_callbacks = allow;
        self
    }

    /// Sets the text charset.
    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Sets multi-value return handling.
    #[must_use]
    pub fn with_unpack_returns(mut self, unpack: bool) -> Self {
        self.unpack_returns = unpack;
        self
    }

    /// Removes a standard library module from the runtime.
    #[must_use]
    pub fn suppress(mut self, library: Library) -> Self {
        if !self.suppress.contains(&library) {
            self.suppress.push(library);
        }
        self
    }

    /// Sets the cycle policy.
    #[must_use]
    pub fn with_cycle_policy(mut self, cycles: CyclePolicy) -> Self {
        self.cycles = cycles;
        self
    }

    /// Sets the nesting limit.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Serializes to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Deserializes from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed or has invalid values.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Applies overrides read through `lookup`.
    ///
    /// `lookup` receives the variable name and returns its value if set.
    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let bad = |var: &'static str, value: String, expected: &'static str| ConfigError::Override {
            var,
            value,
            expected,
        };
        if let Some(val) = lookup(ENV_ENCODING) {
            self.encoding = match val.parse() {
                Ok(encoding) => encoding,
                Err(_) => return Err(bad(ENV_ENCODING, val, "a charset")),
            };
        }
        if let Some(val) = lookup(ENV_ALLOW_HOST_CALLBACKS) {
            self.allow_host_callbacks = parse_bool(&val)
                .ok_or_else(|| bad(ENV_ALLOW_HOST_CALLBACKS, val.clone(), "a boolean"))?;
        }
        if let Some(val) = lookup(ENV_UNPACK_RETURNS) {
            self.unpack_returns = parse_bool(&val)
                .ok_or_else(|| bad(ENV_UNPACK_RETURNS, val.clone(), "a boolean"))?;
        }
        if let Some(val) = lookup(ENV_MAX_DEPTH) {
            self.max_depth = match val.trim().parse() {
                Ok(depth) => depth,
                Err(_) => return Err(bad(ENV_MAX_DEPTH, val, "an integer")),
            };
        }
        Ok(())
    }
}

const ENV_ENCODING: &str = "MOONBRIDGE_ENCODING";
const ENV_ALLOW_HOST_CALLBACKS: &str = "MOONBRIDGE_ALLOW_HOST_CALLBACKS";
const ENV_UNPACK_RETURNS: &str = "MOONBRIDGE_UNPACK_RETURNS";
const ENV_MAX_DEPTH: &str = "MOONBRIDGE_MAX_DEPTH";

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration loader.
///
/// # Example
///
/// ```ignore
/// use moonbridge::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_file("moonbridge.toml")
///     .skip_env_vars()
///     .load()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// TOML file to read, if any.
    file: Option<PathBuf>,
    /// Skip environment variable overrides.
    skip_env: bool,
}

impl ConfigLoader {
    /// Creates a loader that reads only defaults and the environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TOML file layered over the defaults.
    ///
    /// A missing file is ignored.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skips environment variable overrides.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Loads and merges configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or
    /// parsed, or if an environment variable holds an invalid value.
    pub fn load(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut config = match &self.file {
            Some(path) => Self::load_file(path)?.unwrap_or_default(),
            None => RuntimeConfig::default(),
        };

        if !self.skip_env {
            config.apply_overrides(|name| std::env::var(name).ok())?;
        }

        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Option<RuntimeConfig>, ConfigError> {
        if !path.exists() {
            debug!("config file not found: {}", path.display());
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config = RuntimeConfig::from_toml(&content).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded config from {}", path.display());
        Ok(Some(config))
    }
}

/// Failure to assemble a [`RuntimeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("cannot read runtime config {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML or holds unknown values.
    #[error("malformed runtime config {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The config could not be written out as TOML.
    #[error("cannot encode runtime config: {0}")]
    Encode(#[from] toml::ser::Error),

    /// An override variable holds a value of the wrong shape.
    #[error("{var}={value:?}: expected {expected}")]
    Override {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    /// A charset name that is not one of `utf-8`, `latin-1` or `binary`.
    #[error("unknown encoding '{0}'")]
    UnknownEncoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert!(config.allow_host_callbacks);
        assert!(config.unpack_returns);
        assert_eq!(config.encoding, Encoding::Utf8);
        assert_eq!(config.cycles, CyclePolicy::Preserve);
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert!(config.suppress.is_empty());
    }

    #[test]
    fn toml_round_trip() {
        let config = RuntimeConfig::default()
            .with_encoding(Encoding::Latin1)
            .with_cycle_policy(CyclePolicy::Reject)
            .suppress(Library::Io)
            .suppress(Library::Os);
        let text = config.to_toml().expect("serialize");
        assert!(text.contains("encoding = \"latin-1\""));
        let parsed = RuntimeConfig::from_toml(&text).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let parsed = RuntimeConfig::from_toml("unpack_returns = false").expect("parse");
        assert!(!parsed.unpack_returns);
        assert!(parsed.allow_host_callbacks);
        assert_eq!(parsed.max_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn encoding_aliases() {
        let parsed = RuntimeConfig::from_toml("encoding = \"latin1\"").expect("parse");
        assert_eq!(parsed.encoding, Encoding::Latin1);
        assert_eq!("UTF8".parse::<Encoding>().ok(), Some(Encoding::Utf8));
        assert!("ebcdic".parse::<Encoding>().is_err());
    }

    #[test]
    fn suppress_is_deduplicated() {
        let config = RuntimeConfig::default()
            .suppress(Library::Debug)
            .suppress(Library::Debug);
        assert_eq!(config.suppress, vec![Library::Debug]);
    }

    #[test]
    fn overrides_apply() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(lookup(&[
                ("MOONBRIDGE_ENCODING", "binary"),
                ("MOONBRIDGE_ALLOW_HOST_CALLBACKS", "off"),
                ("MOONBRIDGE_UNPACK_RETURNS", "0"),
                ("MOONBRIDGE_MAX_DEPTH", "12"),
            ]))
            .expect("apply");
        assert_eq!(config.encoding, Encoding::Binary);
        assert!(!config.allow_host_callbacks);
        assert!(!config.unpack_returns);
        assert_eq!(config.max_depth, 12);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(lookup(&[("MOONBRIDGE_UNPACK_RETURNS", "maybe")]))
            .expect_err("should fail");
        let ConfigError::Override { var, value, .. } = &err else {
            panic!("expected override error, got {err:?}");
        };
        assert_eq!(*var, "MOONBRIDGE_UNPACK_RETURNS");
        assert_eq!(value, "maybe");
        assert!(err.to_string().contains("MOONBRIDGE_UNPACK_RETURNS"));
    }

    #[test]
    fn loader_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("moonbridge.toml");
        std::fs::write(&path, "max_depth = 7\nsuppress = [\"io\"]\n").expect("write");

        let config = ConfigLoader::new()
            .with_file(&path)
            .skip_env_vars()
            .load()
            .expect("load");
        assert_eq!(config.max_depth, 7);
        assert_eq!(config.suppress, vec![Library::Io]);
    }

    #[test]
    fn loader_ignores_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ConfigLoader::new()
            .with_file(dir.path().join("absent.toml"))
            .skip_env_vars()
            .load()
            .expect("load");
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn loader_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_depth = \"deep\"").expect("write");

        let err = ConfigLoader::new()
            .with_file(&path)
            .skip_env_vars()
            .load()
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::Malformed { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn loader_reports_unreadable_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ConfigLoader::new()
            .with_file(dir.path())
            .skip_env_vars()
            .load()
            .expect_err("a directory is not a file");
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }
}
