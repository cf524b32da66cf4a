//! Error types for bridge operations.
//!
//! Every failure that crosses the host/engine boundary is reported as an
//! [`Error`]. Engine failures carry a [`Traceback`] captured inside the
//! engine before its stack unwinds; failures raised by host callbacks keep
//! the original host error as their [`source`](std::error::Error::source).

use crate::config::{ConfigError, Encoding};
use crate::proxy::CoroutineStatus;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while driving the embedded engine.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A value could not cross the boundary.
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// The engine raised while executing script code.
    #[error("lua error: {message}")]
    EmbeddedRuntime {
        /// Engine error text, including its source position prefix.
        message: String,
        /// Call frames captured at the raise site.
        traceback: Traceback,
        /// Non-string error value, converted to a host value.
        payload: Option<Box<Value>>,
    },

    /// The engine rejected source text.
    #[error("lua syntax error: {message}")]
    Syntax {
        /// Parser message.
        message: String,
        /// Whether the source ended before the statement was complete.
        incomplete_input: bool,
    },

    /// Invalid coroutine transition.
    #[error("cannot resume {status} coroutine")]
    CoroutineState {
        /// Status observed when the resume was attempted.
        status: CoroutineStatus,
    },

    /// Operation against a closed, dropped, or busy runtime.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// A host callback failed while invoked from script code.
    #[error("host callback {} failed: {source}", .callback.as_deref().unwrap_or("<anonymous>"))]
    HostCallback {
        /// Name the callback was registered with, if any.
        callback: Option<String>,
        /// The original host failure.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
        /// Script frames active when the callback failed.
        traceback: Traceback,
    },

    /// Invalid runtime configuration.
    #[error("config error: {0}")]
    Config(#[source] Arc<ConfigError>),
}

impl Error {
    /// Returns a machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conversion(_) => "BRIDGE_CONVERSION",
            Self::EmbeddedRuntime { .. } => "BRIDGE_RUNTIME",
            Self::Syntax { .. } => "BRIDGE_SYNTAX",
            Self::CoroutineState { .. } => "BRIDGE_COROUTINE_STATE",
            Self::Lifecycle(_) => "BRIDGE_LIFECYCLE",
            Self::HostCallback { .. } => "BRIDGE_HOST_CALLBACK",
            Self::Config(_) => "BRIDGE_CONFIG",
        }
    }

    /// Returns whether retrying the operation may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Lifecycle(err) => matches!(err, LifecycleError::CallInFlight),
            Self::EmbeddedRuntime { .. } | Self::HostCallback { .. } => true,
            Self::Conversion(_)
            | Self::Syntax { .. }
            | Self::CoroutineState { .. }
            | Self::Config(_) => false,
        }
    }

    /// Returns the engine traceback, if this error carries one.
    #[must_use]
    pub fn traceback(&self) -> Option<&Traceback> {
        match self {
            Self::EmbeddedRuntime { traceback, .. } | Self::HostCallback { traceback, .. } => {
                Some(traceback)
            }
            _ => None,
        }
    }

    /// Returns the non-string error value raised by script code.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::EmbeddedRuntime { payload, .. } => payload.as_deref(),
            _ => None,
        }
    }

    /// Creates an engine runtime error without traceback.
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::EmbeddedRuntime {
            message: message.into(),
            traceback: Traceback::default(),
            payload: None,
        }
    }

    /// Attaches `traceback` unless the error already carries frames.
    pub(crate) fn with_traceback(mut self, frames: Traceback) -> Self {
        if let Self::EmbeddedRuntime { traceback, .. } | Self::HostCallback { traceback, .. } =
            &mut self
        {
            if traceback.is_empty() {
                *traceback = frames;
            }
        }
        self
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(Arc::new(err))
    }
}

/// Reasons a value cannot cross the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// Text contains a character the configured charset cannot represent.
    #[error("cannot encode {ch:?} as {encoding}")]
    Encoding {
        /// Configured charset.
        encoding: Encoding,
        /// First offending character.
        ch: char,
    },

    /// A container was reached again while it was still being converted.
    #[error("self-referential {0} rejected by cycle policy")]
    Cycle(&'static str),

    /// Nesting exceeded the configured depth limit.
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    /// Host callbacks are disabled for this runtime.
    #[error("host callbacks are disabled for this runtime")]
    CallbacksDisabled,

    /// Table keys cannot be nil.
    #[error("table key cannot be nil")]
    NilKey,

    /// A proxy was passed to a runtime other than the one that created it.
    #[error("proxy belongs to runtime #{owner}, not runtime #{target}")]
    ForeignProxy {
        /// Runtime that created the proxy.
        owner: u64,
        /// Runtime the proxy was passed to.
        target: u64,
    },

    /// The value has no representation on the target side.
    #[error("unsupported value: {0}")]
    Unsupported(String),
}

/// Runtime lifecycle violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The runtime was closed.
    #[error("runtime is closed")]
    Closed,

    /// The engine object or the runtime behind it no longer exists.
    #[error("runtime was dropped")]
    Dropped,

    /// Close was refused because proxies are still alive.
    #[error("runtime still has {0} live references")]
    LiveReferences(usize),

    /// Close was refused because a call is executing.
    #[error("a call is in flight on this runtime")]
    CallInFlight,
}

/// One engine call frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Chunk name, or `[C]` for native functions.
    pub source: String,
    /// Current line, when known.
    pub line: Option<u32>,
    /// Frame description (`main chunk`, `function 'name'`, ...).
    pub what: String,
}

impl Frame {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line == "..." {
            return None;
        }
        let (head, what) = line.split_once(": in ").unwrap_or((line, ""));
        let (source, line_no) = match head.rsplit_once(':') {
            Some((source, n)) => match n.parse::<u32>() {
                Ok(n) => (source, Some(n)),
                Err(_) => (head, None),
            },
            None => (head, None),
        };
        Some(Self {
            source: source.to_string(),
            line: line_no,
            what: what.to_string(),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.source, line)?,
            None => write!(f, "{}", self.source)?,
        }
        if !self.what.is_empty() {
            write!(f, ": in {}", self.what)?;
        }
        Ok(())
    }
}

/// Engine call-stack trace, innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traceback {
    frames: Vec<Frame>,
}

impl Traceback {
    /// Parses the engine's textual traceback format.
    ///
    /// Accepts text with or without the `stack traceback:` header.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let body = match text.find(TRACEBACK_HEADER) {
            Some(at) => &text[at + TRACEBACK_HEADER.len()..],
            None => text,
        };
        Self {
            frames: body.lines().filter_map(Frame::parse).collect(),
        }
    }

    /// Returns the frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Returns the number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if no frames were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{TRACEBACK_HEADER}")?;
        for frame in &self.frames {
            writeln!(f, "\t{frame}")?;
        }
        Ok(())
    }
}

const TRACEBACK_HEADER: &str = "stack traceback:";

/// Splits engine error text into message and traceback.
pub(crate) fn split_traceback(text: &str) -> (String, Traceback) {
    match text.find(TRACEBACK_HEADER) {
        Some(at) => (text[..at].trim_end().to_string(), Traceback::parse(&text[at..])),
        None => (text.to_string(), Traceback::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "eval:1: boom\nstack traceback:\n\t[C]: in function 'error'\n\teval:1: in main chunk\n\t[C]: in function 'xpcall'";

    #[test]
    fn split_message_and_frames() {
        let (message, traceback) = split_traceback(SAMPLE);
        assert_eq!(message, "eval:1: boom");
        assert_eq!(traceback.len(), 3);

        let native = &traceback.frames()[0];
        assert_eq!(native.source, "[C]");
        assert_eq!(native.line, None);
        assert_eq!(native.what, "function 'error'");

        let chunk = &traceback.frames()[1];
        assert_eq!(chunk.source, "eval");
        assert_eq!(chunk.line, Some(1));
        assert_eq!(chunk.what, "main chunk");
    }

    #[test]
    fn split_without_traceback() {
        let (message, traceback) = split_traceback("plain failure");
        assert_eq!(message, "plain failure");
        assert!(traceback.is_empty());
    }

    #[test]
    fn quoted_chunk_names_keep_colons() {
        let traceback = Traceback::parse("\t[string \"a:b\"]:12: in function 'f'");
        assert_eq!(traceback.frames()[0].source, "[string \"a:b\"]");
        assert_eq!(traceback.frames()[0].line, Some(12));
    }

    #[test]
    fn traceback_display_round_trips() {
        let (_, traceback) = split_traceback(SAMPLE);
        let reparsed = Traceback::parse(&traceback.to_string());
        assert_eq!(reparsed, traceback);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::runtime("x").code(), "BRIDGE_RUNTIME");
        assert_eq!(
            Error::from(LifecycleError::Closed).code(),
            "BRIDGE_LIFECYCLE"
        );
        assert_eq!(
            Error::from(ConversionError::NilKey).code(),
            "BRIDGE_CONVERSION"
        );
    }

    #[test]
    fn only_busy_lifecycle_is_recoverable() {
        assert!(Error::from(LifecycleError::CallInFlight).is_recoverable());
        assert!(!Error::from(LifecycleError::Closed).is_recoverable());
        assert!(!Error::from(ConversionError::CallbacksDisabled).is_recoverable());
    }

    #[test]
    fn with_traceback_keeps_existing_frames() {
        let first = Traceback::parse("\teval:1: in main chunk");
        let second = Traceback::parse("\tother:2: in main chunk");
        let err = Error::runtime("x").with_traceback(first.clone());
        let err = err.with_traceback(second);
        assert_eq!(err.traceback(), Some(&first));
    }
}
