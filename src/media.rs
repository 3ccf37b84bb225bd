//! Opaque message bodies (spec §3, §6).
//!
//! The dialog core never parses SDP or any other body format; it only
//! carries `content_type`/`bytes` pairs between the application and the
//! wire. SDP parsing, codec negotiation and the RTP session live in an
//! external `MediaSession` collaborator that is not part of this crate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque request/response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub content_type: String,
    pub bytes: Bytes,
}

impl Body {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn sdp(bytes: impl Into<Bytes>) -> Self {
        Self::new("application/sdp", bytes)
    }

    /// A `message/sipfrag` body, used by the REFER NOTIFY subscription
    /// (spec §4.7) to report the progress of a triggered call.
    pub fn sipfrag(status_line: impl Into<String>) -> Self {
        Self::new("message/sipfrag", status_line.into().into_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Convenience hook for applications that want to feed a freshly
/// established dialog's answer body straight to their media layer. Not
/// part of the dialog core's contract (spec §6): the dialog core calls
/// nothing in here automatically, it only offers a single call site so
/// applications don't have to duplicate the "grab the body from the 2xx
/// I just ACKed" plumbing.
#[async_trait::async_trait]
pub trait MediaSession: Send + Sync {
    async fn on_answer(&self, body: Body);
}
