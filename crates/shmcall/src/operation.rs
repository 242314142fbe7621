//! The work the executor performs per request.

use std::any::Any;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// A single-shot asynchronous operation mapping a request to a response.
///
/// The executor awaits one call at a time; the returned future runs on the
/// executor thread and need not be `Send`.
#[allow(async_fn_in_trait)]
pub trait Operation {
    /// Perform the operation.
    ///
    /// An error does not break the channel: it is serialized into an
    /// [`OperationFailure`] payload and returned to the driver as the
    /// response.
    async fn call(&mut self, request: String) -> anyhow::Result<String>;
}

/// Wrap a closure returning a future as an [`Operation`].
///
/// ```ignore
/// let reverse = operation_fn(|req: String| async move {
///     Ok::<_, anyhow::Error>(req.chars().rev().collect())
/// });
/// ```
pub fn operation_fn<F, Fut>(f: F) -> FnOperation<F>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    FnOperation { f }
}

/// Operation built by [`operation_fn`].
pub struct FnOperation<F> {
    f: F,
}

impl<F, Fut> Operation for FnOperation<F>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    async fn call(&mut self, request: String) -> anyhow::Result<String> {
        (self.f)(request).await
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation").finish_non_exhaustive()
    }
}

/// Response payload sent in place of a result when the operation fails.
///
/// Serialized as `{"error":"<message>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationFailure {
    pub error: String,
}

impl OperationFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Capture an error with its full cause chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }

    /// Capture a panic raised inside the operation.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(format!("operation panicked: {message}"))
    }

    /// Text sent through the channel.
    pub fn to_payload(&self) -> String {
        serde_json::json!({ "error": self.error }).to_string()
    }

    /// Recognize a failure payload in a response.
    ///
    /// Returns `None` for ordinary responses.
    pub fn from_payload(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation failed: {}", self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_payload_roundtrip() {
        let failure = OperationFailure::new("key generation \"failed\"");
        let payload = failure.to_payload();
        assert_eq!(payload, r#"{"error":"key generation \"failed\""}"#);
        assert_eq!(OperationFailure::from_payload(&payload), Some(failure));
    }

    #[test]
    fn test_ordinary_text_is_not_a_failure() {
        assert_eq!(OperationFailure::from_payload("54321"), None);
        assert_eq!(OperationFailure::from_payload(r#"{"error":"x","y":1}"#), None);
    }

    #[test]
    fn test_from_error_keeps_context() {
        let err = Err::<(), _>(anyhow::anyhow!("disk full"))
            .context("writing key")
            .unwrap_err();
        assert_eq!(OperationFailure::from_error(&err).error, "writing key: disk full");
    }

    #[test]
    fn test_from_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            OperationFailure::from_panic(payload).error,
            "operation panicked: boom"
        );
    }

    #[test]
    fn test_operation_fn_calls_closure() {
        let mut op = operation_fn(|req: String| async move {
            Ok::<_, anyhow::Error>(req.to_uppercase())
        });
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert_eq!(rt.block_on(op.call("abc".into())).unwrap(), "ABC");
    }
}
