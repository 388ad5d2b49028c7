//! Error taxonomy for the bridge and the session orchestrator.
//!
//! Two kinds of error live here and they travel different paths:
//!
//! - [`BridgeError`] is the `Result` error returned to the *caller* of an
//!   operation: validation failures are synchronous and fail fast, transport
//!   and handshake failures are rejected asynchronously.
//! - [`Fault`] is the *observable* error record pushed to registered error
//!   listeners and appended to the session's error list.  Transport and
//!   handshake failures produce both (no silent failure: the caller sees the
//!   error AND observers see the fault); security violations produce only a
//!   fault, because there is no caller to return to on the inbound path.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::protocol::messages::now_millis;

// ── Caller-facing errors ──────────────────────────────────────────────────────

/// Errors returned by bridge and session operations.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Bad caller input (empty project id, blank code, disallowed filename).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The message failed envelope validation.
    #[error("invalid message envelope")]
    InvalidMessage,

    /// No simulator frame is attached (`send` before `initialize`, or after
    /// `destroy`).
    #[error("no simulator frame attached")]
    NotAttached,

    /// An inbound message's declared origin is not on the allow-list.
    #[error("untrusted origin: {0}")]
    UntrustedOrigin(String),

    /// The frame's ready signal never arrived within the retry budget.
    #[error("handshake timed out after {retries} attempts of {timeout:?}")]
    HandshakeTimeout {
        /// Watchdog expiries consumed.
        retries: u32,
        /// Duration of each attempt.
        timeout: Duration,
    },

    /// The bridge was reset while the operation was pending.
    #[error("bridge was reset")]
    Reset,

    /// The outbound transport failed to deliver.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// No confirmation arrived within the configured window.
    #[error("confirmation timed out after {0:?}")]
    ConfirmTimeout(Duration),

    /// The frame explicitly reported failure (e.g. injected code rejected).
    #[error("simulator rejected request: {0}")]
    Rejected(String),
}

// ── Observable faults ─────────────────────────────────────────────────────────

/// Domain classification of an observable fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// Project/handshake loading problems (`load-error`).
    Load,
    /// Transport-level send failures and confirmation timeouts.
    Communication,
    /// The frame reported a simulation-level failure.
    Simulation,
    /// An untrusted origin tried to deliver a message.
    Security,
}

/// An error record delivered to error listeners and kept in session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fault {
    /// Domain classification.
    pub kind: FaultKind,
    /// Human-readable description (for logs, not end users).
    pub message: String,
    /// Milliseconds since the Unix epoch at creation time.
    pub timestamp: u64,
    /// Structured context: the failing message, the origin, retry counts...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl Fault {
    /// Builds a fault stamped with the current time.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: now_millis(),
            context: None,
        }
    }

    /// Attaches structured context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
