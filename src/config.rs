//! Programmatic configuration for a [`crate::ua::UserAgent`] (ambient stack §10.4).
//!
//! No file or CLI parsing lives in this crate (out of scope per spec §1);
//! configuration is always constructed by the embedding application,
//! following the `with_*` builder style the teacher codebase uses for
//! its own `DialogManagerConfig`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DialogError, DialogResult};

/// RFC 3261 §17.1.1.1 timer defaults, overridable per [`DialogConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl TimerSettings {
    /// Timer B: INVITE client transaction timeout, 64*T1.
    pub fn timer_b(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer H: server-side wait for ACK after sending a 2xx... actually
    /// after sending a non-2xx final, 64*T1 (ACK-for-2xx has no
    /// transaction-level timer; the dialog layer tracks it separately,
    /// see [`crate::dialog::Dialog`]).
    pub fn timer_h(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer D: wait time for response retransmissions on the client
    /// side, at least 32s over unreliable transports.
    pub fn timer_d(&self) -> Duration {
        Duration::from_secs(32)
    }
}

/// Configuration for a [`crate::ua::UserAgent`].
///
/// ```
/// use sip_dialog_core::config::DialogConfig;
///
/// let config = DialogConfig::new("127.0.0.1:5060".parse().unwrap())
///     .with_user_agent("example-ua/1.0")
///     .with_max_dialogs(1000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    /// Local address this UA binds to; forwarded to the injected transport.
    pub local_address: SocketAddr,

    /// Default `From`/local-Contact identity used by [`crate::ua::UserAgent::create_dialog`]
    /// when a call option doesn't override the user part. A bare
    /// `sip:<host>:<port>` built from `local_address` if never set.
    pub local_identity: Option<String>,

    /// `User-Agent`/`Server` header value for outbound messages.
    pub user_agent: Option<String>,

    /// Default timeout applied to client operations that don't override
    /// it via [`crate::options::ReqOption::timeout`].
    pub dialog_timeout: Duration,

    /// Cap on concurrently active dialogs; `None` is unlimited.
    pub max_dialogs: Option<usize>,

    /// Whether `cleanup_terminated` runs on a background interval.
    pub auto_cleanup: bool,

    /// How often the background cleanup task runs when `auto_cleanup` is set.
    pub cleanup_interval: Duration,

    /// Grace window a Terminated dialog is retained to absorb
    /// retransmissions before `cleanup_terminated` removes it (spec §5).
    pub termination_grace: Duration,

    pub timers: TimerSettings,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            local_address: "0.0.0.0:5060".parse().unwrap(),
            local_identity: None,
            user_agent: Some("sip-dialog-core/0.1".to_string()),
            dialog_timeout: Duration::from_secs(180),
            max_dialogs: Some(10_000),
            auto_cleanup: true,
            cleanup_interval: Duration::from_secs(30),
            termination_grace: Duration::from_secs(32),
            timers: TimerSettings::default(),
        }
    }
}

impl DialogConfig {
    pub fn new(local_address: SocketAddr) -> Self {
        Self {
            local_address,
            ..Self::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_local_identity(mut self, uri: impl Into<String>) -> Self {
        self.local_identity = Some(uri.into());
        self
    }

    /// The effective local identity: the configured override, or a
    /// `sip:<local_address>` fallback derived from the bind address.
    pub fn local_identity_or_default(&self) -> String {
        self.local_identity
            .clone()
            .unwrap_or_else(|| format!("sip:{}", self.local_address))
    }

    pub fn with_dialog_timeout(mut self, timeout: Duration) -> Self {
        self.dialog_timeout = timeout;
        self
    }

    pub fn with_max_dialogs(mut self, max: usize) -> Self {
        self.max_dialogs = Some(max);
        self
    }

    pub fn with_unlimited_dialogs(mut self) -> Self {
        self.max_dialogs = None;
        self
    }

    pub fn with_auto_cleanup(mut self, interval: Duration) -> Self {
        self.auto_cleanup = true;
        self.cleanup_interval = interval;
        self
    }

    pub fn without_auto_cleanup(mut self) -> Self {
        self.auto_cleanup = false;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn validate(&self) -> DialogResult<()> {
        if let Some(0) = self.max_dialogs {
            return Err(DialogError::internal(
                "DialogConfig::validate",
                "max_dialogs must be nonzero when set",
            ));
        }
        if self.dialog_timeout.is_zero() {
            return Err(DialogError::internal(
                "DialogConfig::validate",
                "dialog_timeout must be nonzero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(DialogConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_dialogs_rejected() {
        let config = DialogConfig::default().with_max_dialogs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn timer_b_is_64_times_t1() {
        let timers = TimerSettings::default();
        assert_eq!(timers.timer_b(), Duration::from_secs(32));
    }
}
