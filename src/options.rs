//! Recognized options for dialog creation and per-request construction
//! (spec §4.6).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::media::Body;

/// A single extra header to append or replace on an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOverride {
    pub name: String,
    pub value: String,
    pub replace: bool,
}

/// How a P-Asserted-Identity entry should be rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertedIdentity {
    Sip(String),
    Tel(String),
}

/// Session-Expires/Min-SE negotiation per RFC 4028.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimerOption {
    pub delta_seconds: u32,
    pub refresher: SessionRefresher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRefresher {
    Uac,
    Uas,
}

/// Options applied at dialog creation (`UserAgent::create_dialog`).
///
/// Built up with `with_*` chain methods, matching the builder style the
/// rest of this codebase uses for configuration (see [`crate::config::DialogConfig`]).
#[derive(Debug, Clone, Default)]
pub struct CallOption {
    pub(crate) from_user: Option<String>,
    pub(crate) from_display: Option<String>,
    pub(crate) to_user: Option<String>,
    pub(crate) to_display: Option<String>,
    pub(crate) asserted_identities: Vec<AssertedIdentity>,
    pub(crate) asserted_display: Option<String>,
    pub(crate) from_as_asserted_identity: bool,
    pub(crate) contact_uri: Option<String>,
    pub(crate) privacy: bool,
    pub(crate) custom_headers: Vec<HeaderOverride>,
    pub(crate) session_timer: Option<SessionTimerOption>,
}

impl CallOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_user(mut self, user: impl Into<String>) -> Self {
        self.from_user = Some(user.into());
        self
    }

    pub fn from_display(mut self, display: impl Into<String>) -> Self {
        self.from_display = Some(display.into());
        self
    }

    pub fn to_user(mut self, user: impl Into<String>) -> Self {
        self.to_user = Some(user.into());
        self
    }

    pub fn to_display(mut self, display: impl Into<String>) -> Self {
        self.to_display = Some(display.into());
        self
    }

    pub fn asserted_identity(mut self, uri: impl Into<String>) -> Self {
        self.asserted_identities.push(AssertedIdentity::Sip(uri.into()));
        self
    }

    pub fn asserted_identity_tel(mut self, e164: impl Into<String>) -> Self {
        self.asserted_identities.push(AssertedIdentity::Tel(e164.into()));
        self
    }

    pub fn asserted_display(mut self, name: impl Into<String>) -> Self {
        self.asserted_display = Some(name.into());
        self
    }

    pub fn from_as_asserted_identity(mut self) -> Self {
        self.from_as_asserted_identity = true;
        self
    }

    pub fn contact_uri(mut self, uri: impl Into<String>) -> Self {
        self.contact_uri = Some(uri.into());
        self
    }

    pub fn privacy(mut self, flag: bool) -> Self {
        self.privacy = flag;
        self
    }

    pub fn custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.push(HeaderOverride {
            name: name.into(),
            value: value.into(),
            replace: false,
        });
        self
    }

    pub fn session_timer(mut self, delta: Duration, refresher: SessionRefresher) -> Self {
        self.session_timer = Some(SessionTimerOption {
            delta_seconds: delta.as_secs() as u32,
            refresher,
        });
        self
    }
}

/// Options applied to a single outbound in-dialog request.
#[derive(Debug, Clone, Default)]
pub struct ReqOption {
    pub(crate) body: Option<Body>,
    pub(crate) headers: Vec<HeaderOverride>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancellation: Option<CancellationToken>,
}

impl ReqOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, content_type: impl Into<String>, bytes: impl Into<bytes::Bytes>) -> Self {
        self.body = Some(Body::new(content_type, bytes));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderOverride {
            name: name.into(),
            value: value.into(),
            replace: false,
        });
        self
    }

    pub fn replace(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderOverride {
            name: name.into(),
            value: value.into(),
            replace: true,
        });
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Ties this request's transaction to `token`: cancelling it before the
    /// transport send aborts the operation cleanly with
    /// [`crate::errors::DialogError::Cancelled`]; cancelling it afterward
    /// stops the caller from waiting on the transaction further but cannot
    /// retract a request already on the wire (spec §5). For an in-flight
    /// INVITE, prefer [`crate::ua::UserAgent::cancel`], which actually
    /// issues CANCEL on the wire.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}
