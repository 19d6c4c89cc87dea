//! Relay error type and classification.
//!
//! Classification happens exactly once, at the transport boundary or at a
//! local precondition, and the resulting flags drive the retry driver and
//! the circuit breaker: `retryable` continues the candidate loop,
//! `trippable` feeds `record_failure`.

use thiserror::Error;

/// Where a relay failure originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayErrorSource {
    Upstream,
    Network,
    Timeout,
    Local,
}

impl RelayErrorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayErrorSource::Upstream => "upstream",
            RelayErrorSource::Network => "network",
            RelayErrorSource::Timeout => "timeout",
            RelayErrorSource::Local => "local",
        }
    }
}

/// A classified relay failure. `status_code` is 0 when no HTTP status is
/// associated with the failure (transport errors).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RelayError {
    pub status_code: u16,
    pub source: RelayErrorSource,
    pub retryable: bool,
    pub trippable: bool,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl RelayError {
    pub fn new(
        status_code: u16,
        source: RelayErrorSource,
        retryable: bool,
        trippable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status_code,
            source,
            retryable,
            trippable,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Local precondition failure (disabled channel, missing key, adapter
    /// mismatch). Retryable so the driver moves on, never trippable.
    pub fn local(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(status_code, RelayErrorSource::Local, true, false, message)
    }

    /// Non-retryable local failure, e.g. a malformed inbound request.
    pub fn local_fatal(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(status_code, RelayErrorSource::Local, false, false, message)
    }

    /// Sentinel for the round loop when every candidate breaker is open.
    pub fn all_breakers_open() -> Self {
        Self::local(503, "all upstream circuit breakers are open")
    }

    /// Classify a transport-level failure. Timeouts (including the relay's
    /// own first-token timeout, matched by message) are TIMEOUT; everything
    /// else is NETWORK. Both are retryable and trippable.
    pub fn from_transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        let message = err.to_string();
        let lowered = message.to_ascii_lowercase();
        let timeout = is_reqwest_timeout(&err)
            || lowered.contains("timeout")
            || lowered.contains("deadline exceeded")
            || lowered.contains("first token timeout");
        let source = if timeout {
            RelayErrorSource::Timeout
        } else {
            RelayErrorSource::Network
        };
        Self::new(0, source, true, true, message).with_cause(err)
    }

    /// Classify a non-2xx upstream status with a truncated body.
    pub fn from_upstream_status(status_code: u16, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("upstream error: {status_code}")
        } else {
            format!("upstream error: {status_code}: {body}")
        };
        match status_code {
            429 => Self::new(status_code, RelayErrorSource::Upstream, true, false, message),
            500..=599 => Self::new(status_code, RelayErrorSource::Upstream, true, true, message),
            401 | 403 => Self::new(
                status_code,
                RelayErrorSource::Upstream,
                false,
                false,
                message,
            ),
            _ => Self::new(
                status_code,
                RelayErrorSource::Upstream,
                false,
                false,
                message,
            ),
        }
    }

    /// Status to surface to the client, falling back when unset.
    pub fn status_or(&self, fallback: u16) -> u16 {
        if self.status_code > 0 {
            self.status_code
        } else if fallback > 0 {
            fallback
        } else {
            502
        }
    }
}

fn is_reqwest_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = current {
        if let Some(req) = err.downcast_ref::<reqwest::Error>() {
            if req.is_timeout() {
                return true;
            }
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = err.source();
    }
    false
}
