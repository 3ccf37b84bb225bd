//! Server transaction state machines (RFC 3261 §17.2).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rvoip_sip_core::prelude::*;

use crate::errors::{DialogError, DialogResult};
use crate::transport::SipTransport;

use super::key::TransactionKey;

/// A handle to an inbound server transaction, delivered alongside the
/// request it was created for (spec §4.4 `deliver_request`). The dialog
/// layer must call [`ServerTransaction::respond`] exactly once per final
/// response.
#[derive(Clone)]
pub struct ServerTransaction {
    pub key: TransactionKey,
    destination: SocketAddr,
    transport: Arc<dyn SipTransport>,
    responded: Arc<AtomicBool>,
    request_via: Option<TypedHeader>,
}

impl ServerTransaction {
    /// `request_via` is the top Via header off the request this
    /// transaction answers (RFC 3261 §8.2.6.2 requires it be echoed back
    /// verbatim on every response); the transport adapter that parsed the
    /// request is expected to pass it along when constructing this.
    pub fn new(
        key: TransactionKey,
        destination: SocketAddr,
        transport: Arc<dyn SipTransport>,
        request_via: Option<TypedHeader>,
    ) -> Self {
        Self {
            key,
            destination,
            transport,
            responded: Arc::new(AtomicBool::new(false)),
            request_via,
        }
    }

    /// The Via header to stamp onto any response built for this
    /// transaction, if the constructing adapter supplied one.
    pub fn request_via(&self) -> Option<&TypedHeader> {
        self.request_via.as_ref()
    }

    /// Sends a provisional response; may be called any number of times
    /// before the final response.
    pub async fn provisional(&self, response: Response) -> DialogResult<()> {
        if !response.status.is_provisional() {
            return Err(DialogError::internal(
                "ServerTransaction::provisional",
                "status is not 1xx",
            ));
        }
        self.transport.send_response(response, self.destination).await
    }

    /// Sends the final response. Enforces the "exactly once" contract
    /// from spec §4.4: a second call fails rather than silently
    /// re-sending, since the transaction layer (not this crate's dialog
    /// layer) owns final-response retransmission once issued.
    pub async fn respond(&self, response: Response) -> DialogResult<()> {
        if response.status.is_provisional() {
            return self.provisional(response).await;
        }
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(DialogError::internal(
                "ServerTransaction::respond",
                "final response already sent for this transaction",
            ));
        }
        self.transport.send_response(response, self.destination).await
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }
}
