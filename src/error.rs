//! Error taxonomy and the GraphQL wire envelope.
//!
//! Two kinds of failure cross the crate boundary:
//!
//! - **Client errors** ([`ClientError`]): message-safe, shown to API clients
//!   verbatim. Admission denials, request-envelope validation failures, and
//!   GraphQL parse errors belong here.
//! - **Everything else**: rendered to the wire as the fixed string
//!   `"Internal server error"` with code `INTERNAL_SERVER_ERROR`; the original
//!   error is only observable through the gateway's out-of-band error hook.
//!
//! Cancellation is its own signal, not an error kind: executors surface a
//! [`Canceled`] sentinel (possibly wrapped) and [`is_canceled`] detects it by
//! walking the source chain.

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Boxed error used at the collaborator seams.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Cap on source-chain traversal; a deeper (or cyclic) chain stops here.
const MAX_CAUSE_DEPTH: usize = 100;

/// Code attached to scrubbed internal failures.
pub const INTERNAL_ERROR_CODE: &str = "INTERNAL_SERVER_ERROR";

/// Message substituted for any failure that is not message-safe.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// An error whose message is safe to show to API clients.
///
/// No stack information, no wrapped causes; just a message and an optional
/// machine-readable code for the envelope's `extensions.code` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    message: String,
    code: Option<String>,
}

impl ClientError {
    /// A client error with a bare message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// A client error carrying a machine-readable code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// The client-visible message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The machine-readable code, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for ClientError {}

/// Sentinel error for a canceled request context.
///
/// Executors return this (directly or wrapped as a source) when the request's
/// cancellation token fires before execution completes. The HTTP adapter maps
/// it to [`Outcome::Canceled`](crate::admission::Outcome) and suppresses the
/// response, since the client is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("context canceled")
    }
}

impl StdError for Canceled {}

/// Walk the `source()` chain to the innermost error.
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    for _ in 0..MAX_CAUSE_DEPTH {
        match current.source() {
            Some(source) => current = source,
            None => break,
        }
    }
    current
}

/// Whether the root cause of `err` is the cancellation sentinel.
pub fn is_canceled(err: &(dyn StdError + 'static)) -> bool {
    root_cause(err).is::<Canceled>()
}

/// `extensions` member of a wire error.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorExtensions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One entry of the response's `errors` array:
/// `{message, path, extensions{code, timestamp}}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GraphqlError {
    pub message: String,
    pub path: Option<Vec<String>>,
    pub extensions: ErrorExtensions,
}

impl GraphqlError {
    /// Render an error for the wire.
    ///
    /// A [`ClientError`] keeps its message and code. Anything else is scrubbed
    /// to [`INTERNAL_ERROR_MESSAGE`] with [`INTERNAL_ERROR_CODE`]; the original
    /// stays server-side.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        match err.downcast_ref::<ClientError>() {
            Some(client) => Self {
                message: client.message().to_owned(),
                path: None,
                extensions: ErrorExtensions {
                    code: client.code().map(str::to_owned),
                    timestamp: Utc::now(),
                },
            },
            None => Self {
                message: INTERNAL_ERROR_MESSAGE.to_owned(),
                path: None,
                extensions: ErrorExtensions {
                    code: Some(INTERNAL_ERROR_CODE.to_owned()),
                    timestamp: Utc::now(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapper(BoxError);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapped: {}", self.0)
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(self.0.as_ref())
        }
    }

    #[test]
    fn root_cause_unwraps_nested_sources() {
        let inner: BoxError = Box::new(Canceled);
        let outer = Wrapper(Box::new(Wrapper(inner)));
        assert_eq!(root_cause(&outer).to_string(), "context canceled");
    }

    #[test]
    fn root_cause_of_flat_error_is_itself() {
        let err = ClientError::new("nope");
        assert_eq!(root_cause(&err).to_string(), "nope");
    }

    #[test]
    fn canceled_is_detected_through_wrapping() {
        let direct = Canceled;
        assert!(is_canceled(&direct));

        let wrapped = Wrapper(Box::new(Canceled));
        assert!(is_canceled(&wrapped));

        let other = ClientError::new("parse failed");
        assert!(!is_canceled(&other));
    }

    #[test]
    fn client_errors_keep_their_message_and_code() {
        let err = ClientError::with_code("BAD_QUERY", "query is malformed");
        let rendered = GraphqlError::from_error(&err);
        assert_eq!(rendered.message, "query is malformed");
        assert_eq!(rendered.extensions.code.as_deref(), Some("BAD_QUERY"));
        assert_eq!(rendered.path, None);
    }

    #[test]
    fn internal_errors_are_scrubbed() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "db password leaked");
        let rendered = GraphqlError::from_error(&err);
        assert_eq!(rendered.message, INTERNAL_ERROR_MESSAGE);
        assert_eq!(
            rendered.extensions.code.as_deref(),
            Some(INTERNAL_ERROR_CODE)
        );
        assert!(!rendered.message.contains("password"));
    }

    #[test]
    fn wire_shape_matches_the_envelope() {
        let rendered = GraphqlError::from_error(&ClientError::new("nope"));
        let json = serde_json::to_value(&rendered).unwrap();
        assert_eq!(json["message"], "nope");
        assert_eq!(json["path"], serde_json::Value::Null);
        assert!(json["extensions"]["timestamp"].is_string());
        // A bare client error has no code to serialize.
        assert!(json["extensions"].get("code").is_none());
    }
}
