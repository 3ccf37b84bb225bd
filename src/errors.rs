//! Error taxonomy for the dialog core.
//!
//! [`DialogError`] realizes the error kinds named in the specification as
//! concrete variants. Every variant carries enough context to be logged
//! usefully and maps deterministically to a SIP status code via
//! [`DialogError::status_code`] so that inbound-request failures can be
//! answered on the wire without the caller re-deriving the mapping.

use std::time::Duration;

use thiserror::Error;

use crate::dialog::{DialogId, DialogState};

/// The crate-wide result alias. Library code always returns this; only
/// tests and examples may `unwrap`/`expect`.
pub type DialogResult<T> = Result<T, DialogError>;

/// Errors surfaced by dialog operations.
#[derive(Debug, Error, Clone)]
pub enum DialogError {
    /// The operation is not legal in the dialog's current state.
    #[error("invalid state for {operation}: dialog is {state:?}")]
    InvalidState {
        state: DialogState,
        operation: &'static str,
    },

    /// A concurrent INVITE/re-INVITE is already pending on this dialog.
    #[error("dialog has a pending INVITE transaction")]
    Busy,

    /// A lookup (by id, call-id, or tag pair) found nothing.
    #[error("dialog not found: {id}")]
    NotFound { id: String },

    /// Inbound message failed structural validation.
    #[error("malformed message: {detail}")]
    MalformedMessage { detail: String },

    /// A 401/407 was received; surfaced unchanged for the caller to retry
    /// with credentials.
    #[error("authentication required (status {code})")]
    AuthRequired { code: u16 },

    /// A transaction or dialog timer expired.
    #[error("timeout waiting for {context}")]
    Timeout { context: String },

    /// The operation was aborted by the caller via its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying transport send failed permanently.
    #[error("transport failure: {detail}")]
    TransportFailure { detail: String },

    /// A 3xx–6xx final response was received on a dialog-establishing or
    /// in-dialog request.
    #[error("remote failure {code}: {reason}")]
    RemoteFailure { code: u16, reason: String },

    /// An id is already registered; only meaningful for
    /// [`crate::registry::DialogRegistry::register`].
    #[error("duplicate dialog id: {id}")]
    DuplicateId { id: String },

    /// A dialog-internal invariant was violated; this indicates a bug in
    /// this crate or in a caller bypassing the public API, not a protocol
    /// condition.
    #[error("internal error in {context}: {message}")]
    Internal { context: String, message: String },
}

impl DialogError {
    pub fn invalid_state(state: DialogState, operation: &'static str) -> Self {
        DialogError::InvalidState { state, operation }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        DialogError::NotFound { id: id.into() }
    }

    pub fn not_found_id(id: &DialogId) -> Self {
        DialogError::NotFound { id: id.to_string() }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        DialogError::MalformedMessage {
            detail: detail.into(),
        }
    }

    pub fn timeout(context: impl Into<String>) -> Self {
        DialogError::Timeout {
            context: context.into(),
        }
    }

    pub fn timeout_after(context: impl Into<String>, _after: Duration) -> Self {
        Self::timeout(context)
    }

    pub fn transport_failure(detail: impl Into<String>) -> Self {
        DialogError::TransportFailure {
            detail: detail.into(),
        }
    }

    pub fn remote_failure(code: u16, reason: impl Into<String>) -> Self {
        DialogError::RemoteFailure {
            code,
            reason: reason.into(),
        }
    }

    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        DialogError::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// The SIP final-response status code this error maps to when the
    /// triggering request must be answered locally. Returns `None` for
    /// variants with no wire representation (e.g. `Cancelled`, which is a
    /// purely local/caller-side outcome).
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DialogError::InvalidState { .. } => Some(491),
            DialogError::Busy => Some(491),
            DialogError::NotFound { .. } => Some(481),
            DialogError::MalformedMessage { .. } => Some(400),
            DialogError::AuthRequired { code } => Some(*code),
            DialogError::Timeout { .. } => Some(408),
            DialogError::Cancelled => None,
            DialogError::TransportFailure { .. } => None,
            DialogError::RemoteFailure { code, .. } => Some(*code),
            DialogError::DuplicateId { .. } => Some(482),
            DialogError::Internal { .. } => Some(500),
        }
    }

    /// Whether this error, when it arises from processing an in-dialog
    /// request, should terminate the dialog (§7 propagation policy: 481,
    /// 408 and internal session-terminating conditions tear the dialog
    /// down; other remote failures do not).
    pub fn terminates_dialog(&self) -> bool {
        matches!(
            self,
            DialogError::NotFound { .. } | DialogError::Timeout { .. }
        ) || matches!(self, DialogError::RemoteFailure { code, .. } if *code == 481 || *code == 408)
    }
}
