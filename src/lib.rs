//! RFC 3261 SIP dialog management layer.
//!
//! This crate owns the *signaling* lifecycle of a call leg from the first
//! INVITE through BYE: the dialog state machine, the per-user-agent
//! registry, in-dialog request construction, the RFC 3261 §17 transaction
//! state machines, a UAC/UAS facade, and the REFER-with-Replaces transfer
//! subsystem.
//!
//! It deliberately does not parse SIP messages or move bytes on a socket —
//! those live in [`rvoip_sip_core`] and the injected [`transport::SipTransport`]
//! capability — and it never interprets SDP or media, treating request/response
//! bodies as opaque [`media::Body`] values.
//!
//! The starting point for most applications is [`ua::UserAgent`].

pub mod builder;
pub mod config;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod media;
pub mod options;
pub mod refer;
pub mod registry;
pub mod transaction;
pub mod transport;
pub mod ua;

pub use config::DialogConfig;
pub use dialog::{Dialog, DialogId, DialogRole, DialogState};
pub use errors::{DialogError, DialogResult};
pub use registry::DialogRegistry;
pub use ua::UserAgent;
