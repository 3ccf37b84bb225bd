//! End-to-end scenario tests (spec §8) driving two [`UserAgent`]s against
//! each other through an in-memory relay transport — no sockets, no real
//! parser/transport adapter, just this crate's own dialog layer talking
//! to itself the way two real UAs would across a network.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use rvoip_sip_core::prelude::*;

use sip_dialog_core::config::DialogConfig;
use sip_dialog_core::dialog::DialogState;
use sip_dialog_core::errors::DialogResult;
use sip_dialog_core::options::CallOption;
use sip_dialog_core::registry::DialogHandle;
use sip_dialog_core::transaction::{ServerTransaction, TransactionKey};
use sip_dialog_core::transport::{InboundSink, SipTransport};
use sip_dialog_core::ua::UserAgent;

/// One endpoint's half of an in-memory UA-to-UA channel: `local_addr` is
/// the address this transport represents on the wire; `local` is the
/// [`UserAgent`] that owns it (and so is who `deliver_response` reports
/// back to); `remote` is the peer UA an outbound request is forwarded to.
///
/// A request sent through `send_request` is forwarded straight to
/// `remote`'s [`InboundSink`], carrying a [`ServerTransaction`] wired back
/// to *this same transport instance* — so when `remote` eventually calls
/// `respond` on it, that call lands on this transport's `send_response`,
/// which reports the response back to `local`. This mirrors how one real
/// transport connection carries traffic in both directions.
struct RelayTransport {
    local_addr: SocketAddr,
    local: OnceLock<Arc<UserAgent>>,
    remote: OnceLock<Arc<UserAgent>>,
    self_ref: OnceLock<Weak<RelayTransport>>,
}

impl RelayTransport {
    fn new(local_addr: SocketAddr) -> Arc<Self> {
        let transport = Arc::new(Self {
            local_addr,
            local: OnceLock::new(),
            remote: OnceLock::new(),
            self_ref: OnceLock::new(),
        });
        transport.self_ref.set(Arc::downgrade(&transport)).ok().expect("set once");
        transport
    }

    fn wire(&self, local: Arc<UserAgent>, remote: Arc<UserAgent>) {
        self.local.set(local).ok().expect("local set once");
        self.remote.set(remote).ok().expect("remote set once");
    }

    fn local(&self) -> &Arc<UserAgent> {
        self.local.get().expect("transport wired before first message")
    }

    fn remote(&self) -> &Arc<UserAgent> {
        self.remote.get().expect("transport wired before first message")
    }

    fn self_arc(&self) -> Arc<dyn SipTransport> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("transport kept alive by its owning harness")
    }
}

#[async_trait::async_trait]
impl SipTransport for RelayTransport {
    /// Outbound request from `local`: forwarded to `remote`, carrying a
    /// fresh server transaction that answers back through `self`.
    async fn send_request(&self, request: Request, _destination: SocketAddr) -> DialogResult<()> {
        let via = request.header(&HeaderName::Via).cloned();
        let branch = request
            .first_via()
            .and_then(|v| v.branch().map(str::to_string))
            .unwrap_or_default();
        let key = TransactionKey::new_server(branch, request.method.clone());
        let server_tx = ServerTransaction::new(key, self.local_addr, self.self_arc(), via);
        self.remote().deliver_request(request, self.local_addr, server_tx);
        Ok(())
    }

    /// A response handed to the server transaction `send_request` built:
    /// reports back to `local`, the UA that originated the request this
    /// answers.
    async fn send_response(&self, response: Response, _destination: SocketAddr) -> DialogResult<()> {
        let branch = match response.header(&HeaderName::Via) {
            Some(TypedHeader::Via(via)) => via.branch().map(str::to_string).unwrap_or_default(),
            _ => String::new(),
        };
        let method = response
            .cseq()
            .map(|c| c.method().clone())
            .unwrap_or(Method::Invite);
        let key = TransactionKey::new_branch(branch, method);
        self.local().deliver_response(response, key);
        Ok(())
    }
}

struct Harness {
    ua1: Arc<UserAgent>,
    ua2: Arc<UserAgent>,
    addr1: SocketAddr,
    addr2: SocketAddr,
}

impl Harness {
    async fn new() -> Self {
        let addr1 = SocketAddr::from_str("127.0.0.1:5060").unwrap();
        let addr2 = SocketAddr::from_str("127.0.0.1:5062").unwrap();

        let transport1 = RelayTransport::new(addr1);
        let transport2 = RelayTransport::new(addr2);

        let config1 = DialogConfig::new(addr1).without_auto_cleanup();
        let config2 = DialogConfig::new(addr2).without_auto_cleanup();

        let ua1 = UserAgent::new(config1, transport1.clone()).unwrap();
        let ua2 = UserAgent::new(config2, transport2.clone()).unwrap();

        transport1.wire(ua1.clone(), ua2.clone());
        transport2.wire(ua2.clone(), ua1.clone());

        Self { ua1, ua2, addr1, addr2 }
    }
}

async fn wait_for_state(handle: &DialogHandle, state: DialogState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if handle.lock().await.state == state {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scenario A (spec §8): basic call establishment. UA1 INVITEs UA2; UA2
/// auto-accepts from its `on_incoming_invite` handler; UA1 observes
/// `Established` once its ACK has gone out, and UA2 observes
/// `Established` once that ACK arrives.
#[tokio::test]
async fn scenario_a_basic_call_establishes_both_dialogs() {
    let harness = Harness::new().await;
    let ua2 = harness.ua2.clone();
    ua2.on_incoming_invite(Arc::new(move |handle, server_tx, _request| {
        let ua2 = ua2.clone();
        tokio::spawn(async move {
            ua2.accept(&server_tx, &handle, None).await.unwrap();
        });
    }))
    .await;

    let d1 = harness
        .ua1
        .create_dialog(&format!("sip:bob@{}", harness.addr2), CallOption::new())
        .await
        .unwrap();
    harness.ua1.start(&d1, None, Vec::new()).await.unwrap();

    assert!(wait_for_state(&d1, DialogState::Established, Duration::from_secs(2)).await);

    let call_id = { d1.lock().await.call_id.clone() };
    let remote_tag = { d1.lock().await.remote_tag.clone() };
    assert!(!remote_tag.is_empty());

    let d2 = harness
        .ua2
        .registry()
        .by_call_id(&call_id)
        .await
        .into_iter()
        .next()
        .expect("UA2 dialog registered");
    assert!(wait_for_state(&d2, DialogState::Established, Duration::from_secs(2)).await);
}

/// Scenario C (spec §8): a CANCEL sent after 180 Ringing but before the
/// final response terminates the UAC dialog without an ACK ever being
/// owed (487 is not a 2xx).
#[tokio::test]
async fn scenario_c_cancel_after_ringing_terminates_without_ack() {
    let harness = Harness::new().await;
    let ua2 = harness.ua2.clone();
    ua2.on_incoming_invite(Arc::new(move |handle, server_tx, _request| {
        let ua2 = ua2.clone();
        tokio::spawn(async move {
            ua2.provisional(&server_tx, &handle, 180, "Ringing").await.unwrap();
        });
    }))
    .await;

    let d1 = harness
        .ua1
        .create_dialog(&format!("sip:bob@{}", harness.addr2), CallOption::new())
        .await
        .unwrap();
    harness.ua1.start(&d1, None, Vec::new()).await.unwrap();

    assert!(wait_for_state(&d1, DialogState::Early, Duration::from_secs(2)).await);

    harness.ua1.cancel(&d1).await.unwrap();

    assert!(wait_for_state(&d1, DialogState::Terminated, Duration::from_secs(2)).await);
    assert!(d1.lock().await.ack_owed.is_none());
}
