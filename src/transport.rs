//! The abstract transport capability the dialog core consumes (spec §1, §6).
//!
//! This crate never touches a socket. `SipTransport` is the byte-level
//! collaborator — in a full deployment this is backed by `rvoip-sip-transport`
//! (UDP/TCP/TLS/WS) — and `InboundSink` is the callback surface that
//! collaborator uses to hand parsed messages back in. Both halves must be
//! safe to call from any thread/task (spec §6).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use rvoip_sip_core::prelude::*;

use crate::errors::DialogResult;
use crate::transaction::{ServerTransaction, TransactionKey};

/// Outbound byte-level capability: hand a fully-built request or response
/// to the network. Retransmission timing at the packet level is this
/// collaborator's concern; the RFC 3261 transaction state machines that
/// decide *when* to retransmit live in [`crate::transaction`].
#[async_trait]
pub trait SipTransport: Send + Sync {
    async fn send_request(&self, request: Request, destination: SocketAddr) -> DialogResult<()>;
    async fn send_response(&self, response: Response, destination: SocketAddr) -> DialogResult<()>;
}

/// Inbound delivery entry points a transport adapter calls once it has
/// parsed a message off the wire (spec §6). Implemented by
/// [`crate::ua::UserAgent`].
pub trait InboundSink: Send + Sync {
    fn deliver_request(&self, request: Request, source: SocketAddr, server_tx: ServerTransaction);
    fn deliver_response(&self, response: Response, client_tx_id: TransactionKey);
}

/// An in-memory test double used by this crate's own integration tests
/// (ambient stack §10.5) — records every message sent instead of
/// touching a socket.
#[derive(Default)]
pub struct FakeTransport {
    sent_requests: Mutex<VecDeque<(Request, SocketAddr)>>,
    sent_responses: Mutex<VecDeque<(Response, SocketAddr)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_request(&self) -> Option<(Request, SocketAddr)> {
        self.sent_requests.lock().unwrap().pop_front()
    }

    pub fn take_response(&self) -> Option<(Response, SocketAddr)> {
        self.sent_responses.lock().unwrap().pop_front()
    }

    pub fn requests_sent(&self) -> usize {
        self.sent_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl SipTransport for FakeTransport {
    async fn send_request(&self, request: Request, destination: SocketAddr) -> DialogResult<()> {
        self.sent_requests.lock().unwrap().push_back((request, destination));
        Ok(())
    }

    async fn send_response(&self, response: Response, destination: SocketAddr) -> DialogResult<()> {
        self.sent_responses.lock().unwrap().push_back((response, destination));
        Ok(())
    }
}
