//! The UAC/UAS facade (spec §4.5): the public entry point most
//! applications drive calls through, plus the inbound-message dispatch
//! that feeds it.

mod executor;
mod facade;
mod glare;
mod inbound;
mod wire;

pub use facade::{IncomingInviteHandler, IncomingReferHandler, UserAgent};
