//! The UAC/UAS facade (spec §4.5): the public entry point most
//! applications drive calls through.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rvoip_sip_core::prelude::*;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::config::DialogConfig;
use crate::dialog::utils::generate_tag;
use crate::dialog::{Dialog, DialogId, DialogState};
use crate::errors::{DialogError, DialogResult};
use crate::events::{EventSink, RequestOutcome, TracingEventSink};
use crate::media::Body;
use crate::options::{AssertedIdentity, CallOption, HeaderOverride, ReqOption};
use crate::refer::{self, IncomingRefer, ReferSubscription, ReplacesTarget};
use crate::registry::{DialogHandle, DialogRegistry};
use crate::transaction::{ClientTransaction, ServerTransaction, TransactionEvent, TransactionKey, TransactionManager};
use crate::transport::SipTransport;
use crate::{builder, refer as refer_mod};

use super::executor::CallbackExecutor;
use super::glare;
use super::wire;

/// Invoked with `(dialog, server transaction, request)` for every new UAS
/// dialog a fresh inbound INVITE creates (spec §4.5 `on_incoming_invite`).
pub type IncomingInviteHandler = Arc<dyn Fn(DialogHandle, ServerTransaction, Request) + Send + Sync>;

/// Invoked with the parsed [`IncomingRefer`] once an inbound REFER has
/// already been answered 202 (spec §4.7).
pub type IncomingReferHandler = Arc<dyn Fn(DialogHandle, IncomingRefer) + Send + Sync>;

/// The dialog-layer facade for one local SIP identity (spec §4.5).
///
/// Owns the [`DialogRegistry`], the [`TransactionManager`], and the
/// handler dispatch [`CallbackExecutor`]; everything else (bytes on the
/// wire, SDP) is an injected collaborator.
pub struct UserAgent {
    pub(crate) config: DialogConfig,
    pub(crate) registry: Arc<DialogRegistry>,
    pub(crate) transport: Arc<dyn SipTransport>,
    pub(crate) transactions: Arc<TransactionManager>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) executor: Arc<CallbackExecutor>,
    incoming_invite_handler: RwLock<Option<IncomingInviteHandler>>,
    incoming_refer_handler: RwLock<Option<IncomingReferHandler>>,
    /// Extra headers collected from [`CallOption`] at `create_dialog` time,
    /// applied to the initial INVITE only (spec §4.6); keyed by call-id so
    /// a dialog id re-key (spec §4.2 `update_id`) doesn't orphan the entry.
    pending_invite_headers: DashMap<String, Vec<HeaderOverride>>,
    /// The INVITE request this UA sent, kept around for `cancel` (spec
    /// §4.4) and cleared once the dialog leaves Trying/Early.
    pub(crate) pending_invite_requests: DashMap<String, Request>,
    /// The server transaction (and original request, for response
    /// mirroring) for an inbound INVITE not yet accepted or rejected,
    /// kept around so an inbound CANCEL can be answered with the matching
    /// 487 on the right transaction (spec §4.4).
    pub(crate) pending_uas_invite_tx: DashMap<String, (ServerTransaction, Request)>,
    pub(crate) refer_subscriptions: DashMap<DialogId, tokio::sync::Mutex<ReferSubscription>>,
    closed: AtomicBool,
}

impl UserAgent {
    pub fn new(config: DialogConfig, transport: Arc<dyn SipTransport>) -> DialogResult<Arc<Self>> {
        Self::with_event_sink(config, transport, Arc::new(TracingEventSink))
    }

    pub fn with_event_sink(
        config: DialogConfig,
        transport: Arc<dyn SipTransport>,
        events: Arc<dyn EventSink>,
    ) -> DialogResult<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(DialogRegistry::new(config.clone()));
        let transactions = Arc::new(TransactionManager::new(transport.clone(), config.timers));
        let executor = Arc::new(CallbackExecutor::new(events.clone()));

        let ua = Arc::new(Self {
            config: config.clone(),
            registry: registry.clone(),
            transport,
            transactions,
            events,
            executor,
            incoming_invite_handler: RwLock::new(None),
            incoming_refer_handler: RwLock::new(None),
            pending_invite_headers: DashMap::new(),
            pending_invite_requests: DashMap::new(),
            pending_uas_invite_tx: DashMap::new(),
            refer_subscriptions: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        if config.auto_cleanup {
            let background = registry;
            let interval = config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let removed = background.cleanup_terminated().await;
                    if removed > 0 {
                        debug!(removed, "cleanup_terminated reaped stale dialogs");
                    }
                }
            });
        }

        Ok(ua)
    }

    pub fn registry(&self) -> &Arc<DialogRegistry> {
        &self.registry
    }

    /// Installs the handler invoked for every new UAS dialog (spec §4.5).
    pub async fn on_incoming_invite(&self, handler: IncomingInviteHandler) {
        *self.incoming_invite_handler.write().await = Some(handler);
    }

    /// Installs the handler invoked with a validated inbound REFER's
    /// target (and optional Replaces) after the 202 has been sent (spec §4.7).
    pub async fn on_incoming_refer(&self, handler: IncomingReferHandler) {
        *self.incoming_refer_handler.write().await = Some(handler);
    }

    pub(crate) async fn incoming_invite_handler(&self) -> Option<IncomingInviteHandler> {
        self.incoming_invite_handler.read().await.clone()
    }

    pub(crate) async fn incoming_refer_handler(&self) -> Option<IncomingReferHandler> {
        self.incoming_refer_handler.read().await.clone()
    }

    // ---- Dialog creation / initial INVITE -------------------------------

    /// `create_dialog(target, options) -> Dialog`: constructs a UAC
    /// dialog in `Init`. Caller must then call [`UserAgent::start`].
    #[instrument(skip(self, option))]
    pub async fn create_dialog(&self, target: &str, option: CallOption) -> DialogResult<DialogHandle> {
        let mut remote_uri: Uri = target
            .parse()
            .map_err(|_| DialogError::malformed(format!("invalid target URI: {target}")))?;
        if let Some(user) = &option.to_user {
            remote_uri.user = Some(user.clone());
        }

        let mut local_uri: Uri = self
            .config
            .local_identity_or_default()
            .parse()
            .map_err(|_| DialogError::internal("create_dialog", "configured local_identity does not parse as a URI"))?;
        if let Some(user) = &option.from_user {
            local_uri.user = Some(user.clone());
        }

        let local_target: Uri = option
            .contact_uri
            .as_deref()
            .unwrap_or(&self.config.local_identity_or_default())
            .parse()
            .map_err(|_| DialogError::internal("create_dialog", "contact_uri does not parse as a URI"))?;

        let call_id = uuid::Uuid::new_v4().to_string();
        let local_tag = generate_tag();

        let dialog = Dialog::new_uac(call_id.clone(), local_uri, remote_uri, local_tag, local_target);

        let headers = call_option_headers(&option);
        if !headers.is_empty() {
            self.pending_invite_headers.insert(call_id, headers);
        }

        self.registry.register(dialog).await
    }

    /// `start(dialog, body?, headers?)`: sends the initial INVITE. Progress
    /// (1xx/2xx/failure, ACK-for-2xx, Timer-B timeout) is driven by a
    /// background watcher and surfaced through the installed [`EventSink`]
    /// (spec §4.5) rather than returned here, since the same watcher must
    /// keep running for retransmitted 2xxs long after this call returns.
    pub async fn start(
        self: &Arc<Self>,
        handle: &DialogHandle,
        body: Option<Body>,
        extra_headers: Vec<HeaderOverride>,
    ) -> DialogResult<()> {
        let (request, destination, branch, call_id) = {
            let mut dialog = handle.lock().await;
            if dialog.state != DialogState::Init {
                return Err(DialogError::invalid_state(dialog.state, "start"));
            }
            let call_id = dialog.call_id.clone();
            let mut headers = self
                .pending_invite_headers
                .remove(&call_id)
                .map(|(_, v)| v)
                .unwrap_or_default();
            headers.extend(extra_headers);
            let option = ReqOption {
                body,
                headers,
                ..ReqOption::default()
            };
            let request = builder::build_invite(&mut dialog, Some(&option));
            let destination = resolve_destination(&dialog.remote_target)?;
            let branch = builder::branch_of(&request);
            dialog.on_send_invite(TransactionKey::new_branch(branch.clone(), Method::Invite))?;
            (request, destination, branch, call_id)
        };

        self.pending_invite_requests.insert(call_id, request.clone());
        let tx = self.transactions.send_request(request, destination, branch).await?;
        self.spawn_invite_watcher(handle.clone(), tx, true);
        Ok(())
    }

    // ---- UAS responses ---------------------------------------------------

    /// Sends `200 OK` for the pending INVITE; the dialog moves to
    /// `Established` once ACK arrives (spec §4.5). Also valid for a
    /// pending re-INVITE on an already-`Established` dialog, in which
    /// case the dialog stays `Established` and only `pending_invite_tx`
    /// (cleared on the ACK) changes.
    pub async fn accept(self: &Arc<Self>, server_tx: &ServerTransaction, handle: &DialogHandle, body: Option<Body>) -> DialogResult<()> {
        let (response, call_id) = {
            let mut dialog = handle.lock().await;
            let reinvite_pending = dialog.state == DialogState::Established && dialog.pending_invite_tx.is_some();
            if !matches!(dialog.state, DialogState::Trying | DialogState::Early) && !reinvite_pending {
                return Err(DialogError::invalid_state(dialog.state, "accept"));
            }
            let local_tag = if dialog.local_tag.is_empty() {
                generate_tag()
            } else {
                dialog.local_tag.clone()
            };
            dialog.on_send_2xx(local_tag.clone(), dialog.local_target.clone())?;

            let mut builder = ResponseBuilder::new(StatusCode::Ok, Some("OK"))
                .from("", &dialog.remote_uri.to_string(), Some(&dialog.remote_tag))
                .to("", &dialog.local_uri.to_string(), Some(&local_tag))
                .call_id(&dialog.call_id)
                .cseq(dialog.remote_seq, Method::Invite)
                .contact(&dialog.local_target.to_string(), None);
            if let Some(via) = server_tx.request_via() {
                builder = builder.header(via.clone());
            }
            if let Some(body) = &body {
                builder = builder
                    .header(TypedHeader::Other(HeaderName::Other("Content-Type".to_string()), HeaderValue::text(body.content_type.clone())))
                    .body(body.bytes.clone());
            }
            (builder.build(), dialog.call_id.clone())
        };

        server_tx.respond(response).await?;
        self.pending_uas_invite_tx.remove(&call_id);
        self.spawn_ack_timeout_watcher(handle.clone());

        // Replaces (spec §4.4, §8 round-trip law): the target dialog must
        // already be Terminated before this 2xx reaches the upper layer,
        // so the BYE is issued synchronously here rather than queued.
        let replace_target = { handle.lock().await.replaces_target.take() };
        if let Some(target_id) = replace_target {
            if let Some(target) = self.registry.by_id(&target_id).await {
                let established = { target.lock().await.state == DialogState::Established };
                if established {
                    if let Err(err) = self.bye(&target).await {
                        self.notify_error(Some(target_id), "replaces_bye", err).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Sends a `1xx`; allocates the To-tag and moves the dialog to
    /// `Early` once `code > 100` (spec §4.1, §4.5).
    pub async fn provisional(&self, server_tx: &ServerTransaction, handle: &DialogHandle, code: u16, reason: &str) -> DialogResult<()> {
        let status = StatusCode::from_u16(code).map_err(|_| DialogError::internal("provisional", "status code is not a valid 1xx"))?;
        let mut rekey: Option<DialogId> = None;
        let mut transition: Option<(DialogId, DialogState, DialogState)> = None;
        let response = {
            let mut dialog = handle.lock().await;
            let to_tag = if code > 100 {
                let from_state = dialog.state;
                let tag = if dialog.local_tag.is_empty() { generate_tag() } else { dialog.local_tag.clone() };
                let route_set = dialog.route_set.clone();
                rekey = dialog.on_send_provisional_with_tag(tag.clone(), route_set)?;
                transition = Some((dialog.id.clone(), from_state, dialog.state));
                Some(tag)
            } else {
                None
            };

            let mut builder = ResponseBuilder::new(status, Some(reason))
                .from("", &dialog.remote_uri.to_string(), Some(&dialog.remote_tag))
                .to("", &dialog.local_uri.to_string(), to_tag.as_deref())
                .call_id(&dialog.call_id)
                .cseq(dialog.remote_seq, Method::Invite)
                .contact(&dialog.local_target.to_string(), None);
            if let Some(via) = server_tx.request_via() {
                builder = builder.header(via.clone());
            }
            builder.build()
        };
        // Dialog lock released above; `update_id` takes the registry write
        // lock and must never be called while still holding a per-dialog
        // lock (lock-order inversion with `cleanup_terminated`, spec §5).
        if let Some(old) = rekey {
            let new_id = transition.as_ref().expect("rekey implies a recorded transition").0.clone();
            self.registry.update_id(&old, new_id).await?;
        }
        if let Some((id, from_state, to_state)) = transition {
            self.notify_transition(id, from_state, to_state).await;
        }
        server_tx.provisional(response).await
    }

    /// Sends a final non-2xx; terminates the dialog (spec §4.5).
    pub async fn reject(&self, server_tx: &ServerTransaction, handle: &DialogHandle, code: u16, reason: &str) -> DialogResult<()> {
        let status = StatusCode::from_u16(code).map_err(|_| DialogError::internal("reject", "status code is not a valid final status"))?;
        let (response, call_id) = {
            let mut dialog = handle.lock().await;
            let from = dialog.state;
            dialog.on_rx_failure()?;
            self.notify_transition(dialog.id.clone(), from, dialog.state).await;
            let mut builder = ResponseBuilder::new(status, Some(reason))
                .from("", &dialog.remote_uri.to_string(), Some(&dialog.remote_tag))
                .to("", &dialog.local_uri.to_string(), Some(&dialog.local_tag))
                .call_id(&dialog.call_id)
                .cseq(dialog.remote_seq, Method::Invite);
            if let Some(via) = server_tx.request_via() {
                builder = builder.header(via.clone());
            }
            (builder.build(), dialog.call_id.clone())
        };
        server_tx.respond(response).await?;
        self.pending_uas_invite_tx.remove(&call_id);
        Ok(())
    }

    // ---- In-dialog operations --------------------------------------------

    /// Sends BYE in `Established`; moves to `Terminating` (spec §4.5), then
    /// to `Terminated` once the final response arrives (driven by a
    /// background watcher, see [`start`](Self::start) for why this isn't
    /// returned to the caller).
    pub async fn bye(self: &Arc<Self>, handle: &DialogHandle) -> DialogResult<()> {
        let (request, destination, branch) = {
            let mut dialog = handle.lock().await;
            let from = dialog.state;
            let request = builder::build_request(&mut dialog, Method::Bye, None)?;
            dialog.on_bye()?;
            self.notify_transition(dialog.id.clone(), from, dialog.state).await;
            let destination = resolve_destination(&builder::next_hop(&dialog, &request))?;
            let branch = builder::branch_of(&request);
            (request, destination, branch)
        };
        let tx = self.transactions.send_request(request, destination, branch).await?;
        self.spawn_bye_watcher(handle.clone(), tx);
        Ok(())
    }

    /// Valid in `Trying`/`Early` (UAC only); cancels the pending INVITE
    /// (spec §4.4, §4.5).
    pub async fn cancel(&self, handle: &DialogHandle) -> DialogResult<ClientTransaction> {
        let (cancel_request, destination, branch) = {
            let dialog = handle.lock().await;
            dialog.guard_cancel()?;
            let invite = self
                .pending_invite_requests
                .get(&dialog.call_id)
                .ok_or_else(|| DialogError::internal("cancel", "no pending INVITE request recorded for this dialog"))?
                .clone();
            let branch = invite
                .first_via()
                .and_then(|via| via.branch().map(str::to_string))
                .ok_or_else(|| DialogError::internal("cancel", "pending INVITE has no Via branch"))?;
            let cancel_request = builder::build_cancel(&dialog, &branch, &invite.uri)?;
            let destination = resolve_destination(&dialog.remote_target)?;
            (cancel_request, destination, branch)
        };
        self.transactions.send_request(cancel_request, destination, branch).await
    }

    /// Sends a re-INVITE; forbidden if a previous INVITE is pending
    /// (spec §4.3, §4.5). Progress is reported the same way as
    /// [`start`](Self::start).
    pub async fn reinvite(self: &Arc<Self>, handle: &DialogHandle, body: Option<Body>, option: Option<ReqOption>) -> DialogResult<()> {
        let (request, destination, branch, call_id, cancellation, timeout) = {
            let mut dialog = handle.lock().await;
            dialog.guard_new_invite()?;
            let mut option = option.unwrap_or_default();
            if let Some(body) = body {
                option.body = Some(body);
            }
            let request = builder::build_request(&mut dialog, Method::Invite, Some(&option))?;
            let destination = resolve_destination(&builder::next_hop(&dialog, &request))?;
            let branch = builder::branch_of(&request);
            dialog.start_invite(TransactionKey::new_branch(branch.clone(), Method::Invite));
            (request, destination, branch, dialog.call_id.clone(), option.cancellation, option.timeout)
        };
        self.pending_invite_requests.insert(call_id, request.clone());
        let tx = self.send_tracked(request, destination, branch, timeout, cancellation).await?;
        self.spawn_invite_watcher(handle.clone(), tx, false);
        Ok(())
    }

    /// Sends REFER with Refer-To (spec §4.5, §4.7).
    pub async fn refer(&self, handle: &DialogHandle, target_uri: &str, option: Option<ReqOption>) -> DialogResult<ClientTransaction> {
        let (request, destination, branch, cancellation, timeout) = {
            let mut dialog = handle.lock().await;
            let request = refer::build_blind_transfer(&mut dialog, target_uri, option.as_ref())?;
            let destination = resolve_destination(&builder::next_hop(&dialog, &request))?;
            let branch = builder::branch_of(&request);
            let option = option.unwrap_or_default();
            (request, destination, branch, option.cancellation, option.timeout)
        };
        self.send_tracked(request, destination, branch, timeout, cancellation).await
    }

    /// Reports progress of the call triggered by an accepted inbound REFER
    /// (spec §4.7): sends the next NOTIFY on the implicit `refer`
    /// subscription for `dialog_id` carrying `status_line` as a
    /// `message/sipfrag` body (e.g. `"SIP/2.0 180 Ringing"`,
    /// `"SIP/2.0 200 OK"`). The application drives this from whatever it
    /// uses to track the triggered call — its own `on_state_change`
    /// handler or the transaction events of the INVITE it placed — since
    /// this crate never places that call itself. Pass `is_final` for the
    /// triggered call's outcome (2xx or a failure response); the
    /// subscription self-terminates after that NOTIFY and is removed. A
    /// call after termination, or for a dialog with no active REFER
    /// subscription, returns `Ok(())` without sending anything.
    pub async fn notify_refer_progress(&self, dialog_id: &DialogId, status_line: &str, is_final: bool) -> DialogResult<()> {
        let Some(entry) = self.refer_subscriptions.get(dialog_id) else {
            return Ok(());
        };
        let mut subscription = entry.lock().await;
        if !subscription.is_active() {
            return Ok(());
        }
        let notify_request = subscription.notify(status_line, is_final)?;
        let route_first = match self.registry.by_id(dialog_id).await {
            Some(handle) => handle.lock().await.route_set.first().cloned(),
            None => None,
        };
        let destination = resolve_destination(&route_first.unwrap_or_else(|| notify_request.uri.clone()))?;
        let branch = builder::branch_of(&notify_request);
        self.transactions.send_request(notify_request, destination, branch).await?;
        drop(subscription);
        if is_final {
            drop(entry);
            self.refer_subscriptions.remove(dialog_id);
        }
        Ok(())
    }

    /// Sends REFER whose Refer-To embeds a `Replaces` built from
    /// `other` (spec §4.5, §4.7, scenario D).
    pub async fn refer_replace(&self, handle: &DialogHandle, other: &DialogHandle) -> DialogResult<ClientTransaction> {
        let (target_uri, consultation) = {
            let other_dialog = other.lock().await;
            (
                other_dialog.remote_target.to_string(),
                ReplacesTarget {
                    call_id: other_dialog.call_id.clone(),
                    to_tag: other_dialog.remote_tag.clone(),
                    from_tag: other_dialog.local_tag.clone(),
                },
            )
        };
        let (request, destination, branch) = {
            let mut dialog = handle.lock().await;
            let request = refer::build_attended_transfer(&mut dialog, &target_uri, &consultation, None)?;
            let destination = resolve_destination(&builder::next_hop(&dialog, &request))?;
            let branch = builder::branch_of(&request);
            (request, destination, branch)
        };
        self.transactions.send_request(request, destination, branch).await
    }

    /// Generic in-dialog request (UPDATE, INFO, MESSAGE, NOTIFY) (spec §4.5).
    pub async fn send_request(&self, handle: &DialogHandle, method: Method, option: Option<ReqOption>) -> DialogResult<ClientTransaction> {
        let (request, destination, branch, cancellation, timeout) = {
            let mut dialog = handle.lock().await;
            let request = builder::build_request(&mut dialog, method, option.as_ref())?;
            let destination = resolve_destination(&builder::next_hop(&dialog, &request))?;
            let branch = builder::branch_of(&request);
            let option = option.unwrap_or_default();
            (request, destination, branch, option.cancellation, option.timeout)
        };
        self.send_tracked(request, destination, branch, timeout, cancellation).await
    }

    /// Starts a client transaction honoring `ReqOption`'s per-request
    /// `timeout` and `cancellation` overrides (spec §4.6, §5): a token
    /// cancelled before this call races it to completion aborts with
    /// [`DialogError::Cancelled`] without changing any dialog state the
    /// caller already committed.
    async fn send_tracked(
        &self,
        request: Request,
        destination: SocketAddr,
        branch: String,
        timeout: Option<Duration>,
        cancellation: Option<tokio_util::sync::CancellationToken>,
    ) -> DialogResult<ClientTransaction> {
        let send = self.transactions.send_request_with_timeout(request, destination, branch, timeout);
        match cancellation {
            Some(token) => tokio::select! {
                result = send => result,
                _ = token.cancelled() => Err(DialogError::Cancelled),
            },
            None => send.await,
        }
    }

    /// Graceful shutdown: BYE-terminates every Established dialog, waits
    /// up to a bounded deadline for the BYE watchers to observe a final
    /// response, then force-terminates whatever is left. Idempotent
    /// (spec §5).
    pub async fn close(self: &Arc<Self>) -> DialogResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handles = self.registry.all_handles().await;
        for handle in &handles {
            let established = { handle.lock().await.state == DialogState::Established };
            if established {
                if let Err(err) = self.bye(handle).await {
                    self.events.on_error(None, "close", &err);
                }
            }
        }

        let deadline = self.config.dialog_timeout.min(Duration::from_secs(5));
        let wait_all = async {
            loop {
                let all_terminated = {
                    let mut terminated = true;
                    for handle in &handles {
                        if !handle.lock().await.is_terminated() {
                            terminated = false;
                            break;
                        }
                    }
                    terminated
                };
                if all_terminated {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            warn!("close() deadline elapsed with BYEs still outstanding; force-terminating");
        }

        for handle in handles {
            let mut dialog = handle.lock().await;
            let _ = dialog.force_terminate();
        }
        Ok(())
    }

    // ---- Shared plumbing --------------------------------------------------

    pub(crate) async fn notify_transition(&self, dialog_id: DialogId, old: DialogState, new: DialogState) {
        if old == new {
            return;
        }
        let events = self.events.clone();
        self.executor
            .dispatch(Some(dialog_id.clone()), "state_change", move || {
                events.on_state_change(&dialog_id, old, new);
            })
            .await;
    }

    pub(crate) async fn notify_outcome(&self, dialog_id: DialogId, method: &'static str, outcome: RequestOutcome, duration: Duration) {
        let events = self.events.clone();
        self.executor
            .dispatch(Some(dialog_id.clone()), "request_processed", move || {
                events.on_request_processed(&dialog_id, method, &outcome, duration);
            })
            .await;
    }

    pub(crate) async fn notify_error(&self, dialog_id: Option<DialogId>, operation: &'static str, error: DialogError) {
        let events = self.events.clone();
        self.executor
            .dispatch(dialog_id.clone(), operation, move || {
                events.on_error(dialog_id.as_ref(), operation, &error);
            })
            .await;
    }
}

fn call_option_headers(option: &CallOption) -> Vec<HeaderOverride> {
    let mut headers = Vec::new();
    for identity in &option.asserted_identities {
        let value = match identity {
            AssertedIdentity::Sip(uri) => uri.clone(),
            AssertedIdentity::Tel(e164) => format!("tel:{e164}"),
        };
        let value = match &option.asserted_display {
            Some(name) => format!("\"{name}\" <{value}>"),
            None => format!("<{value}>"),
        };
        headers.push(HeaderOverride {
            name: "P-Asserted-Identity".to_string(),
            value,
            replace: false,
        });
    }
    if option.from_as_asserted_identity {
        headers.push(HeaderOverride {
            name: "P-Asserted-Identity".to_string(),
            value: "from".to_string(),
            replace: false,
        });
    }
    if option.privacy {
        headers.push(HeaderOverride {
            name: "Privacy".to_string(),
            value: "id".to_string(),
            replace: false,
        });
    }
    if let Some(session_timer) = &option.session_timer {
        headers.push(HeaderOverride {
            name: "Session-Expires".to_string(),
            value: format!(
                "{};refresher={}",
                session_timer.delta_seconds,
                match session_timer.refresher {
                    crate::options::SessionRefresher::Uac => "uac",
                    crate::options::SessionRefresher::Uas => "uas",
                }
            ),
            replace: false,
        });
    }
    headers.extend(option.custom_headers.clone());
    headers
}

/// Resolves a dialog target/next-hop URI to a transport destination.
/// Only IP-literal hosts are supported here: DNS resolution of domain
/// URIs is a transport-adapter concern (spec §1), not this crate's.
pub(crate) fn resolve_destination(uri: &Uri) -> DialogResult<SocketAddr> {
    match &uri.host {
        Host::Address(ip) => Ok(SocketAddr::new(*ip, uri.port.unwrap_or(5060))),
        Host::Domain(domain) => Err(DialogError::transport_failure(format!(
            "cannot resolve domain target '{domain}' without a DNS-capable transport adapter"
        ))),
    }
}

// Watchers live in `inbound.rs` alongside the `InboundSink` implementation
// since both consume the same transaction-event/response plumbing.
pub(crate) use super::inbound::{spawn_ack_timeout_watcher, spawn_bye_watcher, spawn_invite_watcher};

impl UserAgent {
    fn spawn_invite_watcher(self: &Arc<Self>, handle: DialogHandle, tx: ClientTransaction, is_initial: bool) {
        spawn_invite_watcher(self.clone(), handle, tx, is_initial);
    }

    fn spawn_bye_watcher(self: &Arc<Self>, handle: DialogHandle, tx: ClientTransaction) {
        spawn_bye_watcher(self.clone(), handle, tx);
    }

    fn spawn_ack_timeout_watcher(self: &Arc<Self>, handle: DialogHandle) {
        spawn_ack_timeout_watcher(self.clone(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SessionRefresher;
    use std::time::Duration as StdDuration;

    #[test]
    fn call_option_headers_cover_asserted_identity_and_privacy() {
        let option = CallOption::new()
            .asserted_identity("sip:alice@example.com")
            .privacy(true)
            .session_timer(StdDuration::from_secs(1800), SessionRefresher::Uac);
        let headers = call_option_headers(&option);
        assert!(headers.iter().any(|h| h.name == "P-Asserted-Identity"));
        assert!(headers.iter().any(|h| h.name == "Privacy"));
        assert!(headers.iter().any(|h| h.name == "Session-Expires"));
    }

    #[test]
    fn resolve_destination_accepts_ip_literal_and_rejects_domain() {
        let ip_uri: Uri = "sip:bob@127.0.0.1:5062".parse().unwrap();
        assert!(resolve_destination(&ip_uri).is_ok());

        let domain_uri: Uri = "sip:bob@example.com".parse().unwrap();
        assert!(resolve_destination(&domain_uri).is_err());
    }
}
