//! Client transaction state machines (RFC 3261 §17.1).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rvoip_sip_core::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::TimerSettings;
use crate::errors::DialogResult;
use crate::transport::SipTransport;

use super::key::TransactionKey;
use super::TransactionEvent;

/// A handle to an in-flight client transaction. The dialog layer consumes
/// its response stream via [`ClientTransaction::next_event`] and matches
/// inbound responses to the request that created it by this handle, not
/// by re-parsing (spec §4.4).
pub struct ClientTransaction {
    pub key: TransactionKey,
    events: mpsc::Receiver<TransactionEvent>,
    request: Request,
    destination: SocketAddr,
}

impl ClientTransaction {
    pub async fn next_event(&mut self) -> Option<TransactionEvent> {
        self.events.recv().await
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

/// Owns every in-flight client transaction for one [`crate::ua::UserAgent`]
/// and routes inbound responses to them by [`TransactionKey`].
pub struct TransactionManager {
    transport: Arc<dyn SipTransport>,
    timers: TimerSettings,
    routes: DashMap<TransactionKey, mpsc::Sender<TransactionEvent>>,
}

impl TransactionManager {
    pub fn new(transport: Arc<dyn SipTransport>, timers: TimerSettings) -> Self {
        Self {
            transport,
            timers,
            routes: DashMap::new(),
        }
    }

    /// Sends `request` and starts the matching client transaction
    /// (INVITE or non-INVITE per `request.method`).
    pub async fn send_request(
        &self,
        request: Request,
        destination: SocketAddr,
        branch: String,
    ) -> DialogResult<ClientTransaction> {
        self.send_request_with_timeout(request, destination, branch, None).await
    }

    /// As [`Self::send_request`], but `timeout_override` replaces the
    /// default Timer B (INVITE) / 64*T1 (non-INVITE) overall deadline when
    /// set — the `ReqOption::timeout` override (spec §4.6).
    pub async fn send_request_with_timeout(
        &self,
        request: Request,
        destination: SocketAddr,
        branch: String,
        timeout_override: Option<Duration>,
    ) -> DialogResult<ClientTransaction> {
        let is_invite = request.method == Method::Invite;
        let key = TransactionKey::new_branch(branch, request.method.clone());
        let (tx, rx) = mpsc::channel(16);
        self.routes.insert(key.clone(), tx.clone());

        self.transport.send_request(request.clone(), destination).await?;

        let transport = self.transport.clone();
        let timers = self.timers;
        let retransmit_request = request.clone();
        let task_key = key.clone();
        tokio::spawn(async move {
            run_client_transaction(
                transport,
                timers,
                task_key,
                retransmit_request,
                destination,
                tx,
                is_invite,
                timeout_override,
            )
            .await;
        });

        Ok(ClientTransaction {
            key,
            events: rx,
            request,
            destination,
        })
    }

    /// Routes an inbound response to the transaction it belongs to
    /// (spec §6 `deliver_response`). A response with no matching route is
    /// silently dropped: it belongs to an already-terminated transaction,
    /// most likely a retransmission racing cleanup.
    pub fn route_response(&self, key: &TransactionKey, response: Response) {
        if let Some(route) = self.routes.get(key) {
            let event = if response.status.is_provisional() {
                TransactionEvent::Provisional(response)
            } else {
                TransactionEvent::Final(response)
            };
            let _ = route.try_send(event);
        } else {
            trace!(%key, "response for unknown/terminated client transaction dropped");
        }
    }

    fn forget(&self, key: &TransactionKey) {
        self.routes.remove(key);
    }
}

/// Drives Timer A/B (INVITE) or Timer E/F (non-INVITE) retransmission and
/// timeout. Terminates either on a final response or on timeout; Timer D/K
/// (wait for response retransmissions before cleanup) is approximated by
/// simply leaving the route registered until the manager is dropped or a
/// later `forget` call — a bounded channel means a late duplicate final
/// response is absorbed harmlessly by `try_send` failing silently.
async fn run_client_transaction(
    transport: Arc<dyn SipTransport>,
    timers: TimerSettings,
    key: TransactionKey,
    request: Request,
    destination: SocketAddr,
    events: mpsc::Sender<TransactionEvent>,
    is_invite: bool,
    timeout_override: Option<Duration>,
) {
    let overall_timeout = timeout_override.unwrap_or(if is_invite { timers.timer_b() } else { timers.t1 * 64 });
    let mut retransmit_interval = timers.t1;
    let deadline = tokio::time::Instant::now() + overall_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            debug!(%key, "client transaction timed out");
            let _ = events.send(TransactionEvent::Timeout).await;
            return;
        }
        // Reliable transports don't need retransmission; this sleep/resend
        // loop is a no-op in effect when the response arrives first since
        // `events` closing (receiver dropped) ends the task via the send error.
        let sleep = tokio::time::sleep(retransmit_interval.min(remaining));
        tokio::pin!(sleep);
        sleep.await;

        if events.is_closed() {
            return;
        }
        if let Err(err) = transport.send_request(request.clone(), destination).await {
            warn!(%key, %err, "retransmission failed");
            let _ = events.send(TransactionEvent::TransportError(err.to_string())).await;
            return;
        }
        retransmit_interval = (retransmit_interval * 2).min(timers.t2);
    }
}

/// Drops the routing entry for a terminated transaction; called by the
/// owning dialog/UA once it observes a final outcome so the map doesn't
/// grow unbounded across a long-lived UA.
pub fn forget_transaction(manager: &TransactionManager, key: &TransactionKey) {
    manager.forget(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeTransport;
    use std::str::FromStr;

    fn sample_request() -> Request {
        RequestBuilder::new(Method::Options, "sip:bob@127.0.0.1").unwrap()
            .from("Alice", "sip:alice@127.0.0.1", Some("a1"))
            .to("Bob", "sip:bob@127.0.0.1", None)
            .call_id("c1")
            .cseq(1)
            .via("127.0.0.1", "UDP", Some("z9hG4bK1"))
            .max_forwards(70)
            .build()
    }

    #[tokio::test]
    async fn send_request_delivers_to_fake_transport() {
        let transport = Arc::new(FakeTransport::new());
        let manager = TransactionManager::new(transport.clone(), TimerSettings::default());
        let dest = SocketAddr::from_str("127.0.0.1:5062").unwrap();
        let _tx = manager
            .send_request(sample_request(), dest, "z9hG4bK1".to_string())
            .await
            .unwrap();
        assert_eq!(transport.requests_sent(), 1);
    }

    #[tokio::test]
    async fn routed_final_response_reaches_client_transaction() {
        let transport = Arc::new(FakeTransport::new());
        let manager = Arc::new(TransactionManager::new(transport, TimerSettings::default()));
        let dest = SocketAddr::from_str("127.0.0.1:5062").unwrap();
        let mut tx = manager
            .send_request(sample_request(), dest, "z9hG4bK2".to_string())
            .await
            .unwrap();

        let response = ResponseBuilder::new(StatusCode::Ok, Some("OK"))
            .from("Alice", "sip:alice@127.0.0.1", Some("a1"))
            .to("Bob", "sip:bob@127.0.0.1", Some("b1"))
            .call_id("c1")
            .cseq(1, Method::Options)
            .build();
        manager.route_response(&tx.key.clone(), response);

        let event = tx.next_event().await.unwrap();
        assert!(matches!(event, TransactionEvent::Final(_)));
    }
}
