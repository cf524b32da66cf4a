//! Error translation between the engine and the host.

use crate::convert;
use crate::error::{split_traceback, Error, Traceback};
use crate::state::Context;

/// Builds an [`Error`] from the holder produced by the bootstrap's error
/// handler: a table of `{ error_value, traceback_text }`.
pub(crate) fn from_capture(cx: &Context<'_>, holder: mlua::Value) -> Error {
    let mlua::Value::Table(holder) = holder else {
        return from_error_value(cx, holder);
    };
    let value = convert::raw_exact(&holder, 1).unwrap_or(mlua::Value::Nil);
    let traceback = holder
        .raw_get::<Option<String>>(2)
        .ok()
        .flatten()
        .map(|text| Traceback::parse(&text))
        .unwrap_or_default();
    from_error_value(cx, value).with_traceback(traceback)
}

/// Translates a raised engine value.
///
/// Strings become the message. Other values keep a host copy as payload.
fn from_error_value(cx: &Context<'_>, value: mlua::Value) -> Error {
    match value {
        mlua::Value::String(s) => Error::runtime(s.to_string_lossy().to_string()),
        mlua::Value::Error(err) => from_lua(&err),
        mlua::Value::Nil => Error::runtime("nil"),
        other => {
            let message = cx
                .internals
                .tostring
                .call::<String>(other.clone())
                .unwrap_or_else(|_| other.type_name().to_string());
            let payload = match convert::to_host(cx, other) {
                Ok(value) => Some(Box::new(value)),
                Err(_) => None,
            };
            Error::EmbeddedRuntime {
                message,
                traceback: Traceback::default(),
                payload,
            }
        }
    }
}

/// Translates an error reported by the binding.
pub(crate) fn from_lua(err: &mlua::Error) -> Error {
    match err {
        mlua::Error::SyntaxError {
            message,
            incomplete_input,
        } => Error::Syntax {
            message: message.clone(),
            incomplete_input: *incomplete_input,
        },
        mlua::Error::RuntimeError(text) => {
            let (message, traceback) = split_traceback(text);
            Error::runtime(message).with_traceback(traceback)
        }
        mlua::Error::MemoryError(message) => Error::runtime(message.clone()),
        mlua::Error::CallbackError { traceback, cause } => {
            from_lua(cause).with_traceback(Traceback::parse(traceback))
        }
        mlua::Error::WithContext { cause, .. } => from_lua(cause),
        mlua::Error::ExternalError(source) => match source.downcast_ref::<Error>() {
            Some(err) => err.clone(),
            None => Error::runtime(source.to_string()),
        },
        other => Error::runtime(other.to_string()),
    }
}

/// Wraps a host error so it propagates through the engine's error
/// mechanism and can be recovered unchanged on the way out.
pub(crate) fn to_lua(err: Error) -> mlua::Error {
    mlua::Error::external(err)
}

impl From<mlua::Error> for Error {
    fn from(err: mlua::Error) -> Self {
        from_lua(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConversionError, LifecycleError};
    use std::sync::Arc;

    #[test]
    fn syntax_errors_keep_their_kind() {
        let err = Error::from(mlua::Error::SyntaxError {
            message: "[string \"x\"]:1: unexpected symbol".into(),
            incomplete_input: false,
        });
        assert!(matches!(err, Error::Syntax { .. }));
    }

    #[test]
    fn runtime_errors_split_their_traceback() {
        let err = Error::from(mlua::Error::RuntimeError(
            "eval:1: boom\nstack traceback:\n\teval:1: in main chunk".into(),
        ));
        let Error::EmbeddedRuntime { message, traceback, .. } = err else {
            panic!("expected runtime error");
        };
        assert_eq!(message, "eval:1: boom");
        assert_eq!(traceback.len(), 1);
    }

    #[test]
    fn host_errors_survive_the_round_trip() {
        let original = Error::from(ConversionError::NilKey);
        let wrapped = mlua::Error::CallbackError {
            traceback: "stack traceback:\n\t[C]: in ?".into(),
            cause: Arc::new(to_lua(original)),
        };
        let err = Error::from(wrapped);
        assert!(matches!(err, Error::Conversion(ConversionError::NilKey)));
    }

    #[test]
    fn lifecycle_errors_survive_context() {
        let wrapped = mlua::Error::WithContext {
            context: "while calling".into(),
            cause: Arc::new(to_lua(LifecycleError::Dropped.into())),
        };
        assert!(matches!(
            Error::from(wrapped),
            Error::Lifecycle(LifecycleError::Dropped)
        ));
    }
}
