//! RFC 3261 §17 transaction state machines (ambient stack §10.3).
//!
//! No separate transaction-core collaborator is in scope for this crate
//! (spec §3): it owns the client INVITE/non-INVITE and server
//! INVITE/non-INVITE state machines itself, driven by `tokio::time`
//! against the abstract [`crate::transport::SipTransport`] byte-level
//! collaborator.

mod client;
mod key;
mod server;

pub use client::{ClientTransaction, TransactionManager};
pub use key::{generate_branch, TransactionKey};
pub use server::ServerTransaction;

/// An event delivered to the dialog layer as a client transaction
/// progresses (spec §4.4: "the dialog consumes" this stream).
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Provisional(rvoip_sip_core::prelude::Response),
    Final(rvoip_sip_core::prelude::Response),
    Timeout,
    TransportError(String),
}

/// Coarse transaction state, shared shape for INVITE and non-INVITE
/// variants (RFC 3261 Figures 5-8 differ in which states exist and in
/// timer names, not in this overall shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}
