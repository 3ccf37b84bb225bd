//! Inbound message dispatch (spec §4.4, §6 `deliver_request`/`deliver_response`).
//!
//! [`UserAgent`] (wrapped in `Arc`) implements [`InboundSink`]: every
//! inbound request is matched against the registry by Call-ID and tag
//! pair, driven through the relevant [`Dialog`] transition, and answered
//! or handed to an application handler. Responses are routed straight
//! into the [`crate::transaction::TransactionManager`] that already owns
//! the client transaction they belong to.
//!
//! The long-running per-operation watchers — INVITE progress (including
//! ACK-for-2xx and glare retry), BYE finality, and the UAS ACK-for-2xx
//! wait — also live here since they consume the same transaction-event
//! stream this module already owns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rvoip_sip_core::prelude::*;
use tracing::{debug, warn};

use crate::dialog::{utils as dialog_utils, Dialog, DialogState};
use crate::errors::DialogError;
use crate::events::RequestOutcome;
use crate::registry::DialogHandle;
use crate::transaction::{ClientTransaction, ServerTransaction, TransactionEvent, TransactionKey};
use crate::transport::InboundSink;

use super::facade::UserAgent;
use super::glare;
use super::wire;

impl InboundSink for Arc<UserAgent> {
    /// Spec §6: must be safe to invoke from any thread/task. The actual
    /// dialog matching and FSM work is async, so this only hands the
    /// message to a fresh task; the transport adapter never blocks on it.
    fn deliver_request(&self, request: Request, source: SocketAddr, server_tx: ServerTransaction) {
        let ua = self.clone();
        tokio::spawn(async move {
            ua.handle_inbound_request(request, source, server_tx).await;
        });
    }

    fn deliver_response(&self, response: Response, client_tx_id: TransactionKey) {
        self.transactions.route_response(&client_tx_id, response);
    }
}

impl UserAgent {
    async fn handle_inbound_request(self: Arc<Self>, request: Request, source: SocketAddr, server_tx: ServerTransaction) {
        let Some(call_id) = wire::call_id_of_request(&request) else {
            let response = mirror_response(&request, request.method.clone(), 400, "Missing Call-ID");
            let _ = server_tx.respond(response).await;
            return;
        };
        let from_tag = wire::from_tag_of_request(&request);
        let to_tag = wire::to_tag_of_request(&request);
        let existing = match (&from_tag, &to_tag) {
            (Some(f), Some(t)) => self.registry.by_tags(&call_id, f, t).await,
            _ => None,
        };

        match request.method {
            Method::Invite => match existing {
                Some(handle) => self.handle_inbound_reinvite(handle, request, server_tx).await,
                None => self.handle_inbound_initial_invite(request, source, server_tx).await,
            },
            Method::Ack => match existing {
                Some(handle) => self.handle_inbound_ack(handle).await,
                None => debug!(%call_id, "ACK for unknown dialog dropped"),
            },
            Method::Cancel => self.handle_inbound_cancel(&call_id, &request, &server_tx).await,
            Method::Bye => match existing {
                Some(handle) => self.handle_inbound_bye(handle, &request, &server_tx).await,
                None => respond_error(&server_tx, &request, 481, "Call/Transaction Does Not Exist").await,
            },
            Method::Refer => match existing {
                Some(handle) => self.handle_inbound_refer(handle, &request, &server_tx).await,
                None => respond_error(&server_tx, &request, 481, "Call/Transaction Does Not Exist").await,
            },
            ref method => match existing {
                Some(handle) => self.handle_inbound_generic(handle, &request, &server_tx, method.clone()).await,
                None => respond_error(&server_tx, &request, 481, "Call/Transaction Does Not Exist").await,
            },
        }
    }

    /// A fresh INVITE with no existing dialog: creates a UAS [`Dialog`]
    /// in `Trying` (spec §4.1 entry condition) and hands it to the
    /// installed `on_incoming_invite` handler, or auto-rejects with 480
    /// if no handler was installed. Honors an incoming `Replaces` header
    /// by pre-validating the target dialog before the new one is even
    /// registered (spec §4.4: absent/wrong-state target is a 481).
    async fn handle_inbound_initial_invite(self: Arc<Self>, request: Request, _source: SocketAddr, server_tx: ServerTransaction) {
        let call_id = wire::call_id_of_request(&request).unwrap_or_default();
        let remote_uri = wire::from_uri_of_request(&request).unwrap_or_else(unknown_uri);
        let local_uri = wire::to_uri_of_request(&request).unwrap_or_else(unknown_uri);
        let remote_target = wire::contact_of_request(&request).unwrap_or_else(|| remote_uri.clone());
        let remote_seq = wire::cseq_of_request(&request).unwrap_or(1);
        let record_route = wire::record_route_of_request(&request);
        let route_set = dialog_utils::route_set_from_record_route(&record_route, false);

        let replaces = wire::replaces_header_of_request(&request);
        let mut replace_target = None;
        if let Some(replaces) = &replaces {
            match self.registry.by_tags(&replaces.call_id, &replaces.to_tag, &replaces.from_tag).await {
                Some(target) => {
                    let established = { target.lock().await.state == DialogState::Established };
                    if !established {
                        respond_error(&server_tx, &request, 481, "Call/Transaction Does Not Exist").await;
                        return;
                    }
                    replace_target = Some(target);
                }
                None => {
                    respond_error(&server_tx, &request, 481, "Call/Transaction Does Not Exist").await;
                    return;
                }
            }
        }

        let dialog = Dialog::new_uas(call_id.clone(), local_uri, remote_uri, remote_target, remote_seq, route_set);
        let handle = match self.registry.register(dialog).await {
            Ok(handle) => handle,
            Err(err) => {
                respond_error(&server_tx, &request, 500, "Server Internal Error").await;
                self.notify_error(None, "inbound_invite", err).await;
                return;
            }
        };

        if let Some(target) = replace_target {
            let target_id = { target.lock().await.id.clone() };
            handle.lock().await.schedule_replaces(target_id);
        }

        self.pending_uas_invite_tx.insert(call_id.clone(), (server_tx.clone(), request.clone()));

        match self.incoming_invite_handler().await {
            Some(handler) => handler(handle, server_tx, request),
            None => {
                let dialog_id = { handle.lock().await.id.clone() };
                self.pending_uas_invite_tx.remove(&call_id);
                self.registry.unregister(&dialog_id).await;
                respond_error(&server_tx, &request, 480, "Temporarily Unavailable").await;
            }
        }
    }

    /// An INVITE matching an existing dialog: a re-INVITE (or, under
    /// glare, a collision with our own pending outbound re-INVITE, which
    /// spec §4.1 requires rejecting with 491 without ever reaching the
    /// application handler).
    async fn handle_inbound_reinvite(self: Arc<Self>, handle: DialogHandle, request: Request, server_tx: ServerTransaction) {
        let cseq = wire::cseq_of_request(&request).unwrap_or(0);
        let call_id = { handle.lock().await.call_id.clone() };

        // A 491-rejected re-INVITE must leave the dialog completely
        // unchanged (no CSeq acceptance, no target refresh), so the glare
        // check, the CSeq guard and every mutation happen under one lock
        // acquisition rather than a check-then-act pair that a concurrent
        // re-INVITE could slip in between.
        let cseq_err = {
            let mut dialog = handle.lock().await;
            if dialog.guard_new_invite().is_err() {
                drop(dialog);
                respond_error(&server_tx, &request, 491, "Request Pending").await;
                return;
            }
            match dialog.accept_remote_seq(cseq) {
                Ok(()) => {
                    dialog.start_invite(TransactionKey::new_server(server_tx.key.branch.clone(), Method::Invite));
                    if let Some(contact) = wire::contact_of_request(&request) {
                        dialog.apply_target_refresh(&contact);
                    }
                    None
                }
                Err(err) => Some(err),
            }
        };
        if let Some(err) = cseq_err {
            respond_error(&server_tx, &request, 500, "Server Internal Error").await;
            self.notify_error(None, "reinvite_cseq", err).await;
            return;
        }

        self.pending_uas_invite_tx.insert(call_id, (server_tx.clone(), request.clone()));
        match self.incoming_invite_handler().await {
            Some(handler) => handler(handle, server_tx, request),
            None => {
                // No application hook to decide hold/renegotiation: keep
                // the existing session by rejecting the change, per the
                // conservative default for an unattended dialog.
                let mut dialog = handle.lock().await;
                dialog.clear_pending_invite();
                drop(dialog);
                respond_error(&server_tx, &request, 488, "Not Acceptable Here").await;
            }
        }
    }

    async fn handle_inbound_ack(self: Arc<Self>, handle: DialogHandle) {
        let outcome = {
            let mut dialog = handle.lock().await;
            let from = dialog.state;
            match dialog.on_rx_ack() {
                Ok(()) => Ok((from, dialog.state, dialog.id.clone(), dialog.call_id.clone())),
                Err(err) => Err(err),
            }
        };
        match outcome {
            Ok((from, to, id, call_id)) => {
                self.pending_uas_invite_tx.remove(&call_id);
                self.notify_transition(id, from, to).await;
            }
            Err(err) => self.notify_error(None, "rx_ack", err).await,
        }
    }

    /// Spec §4.1/§4.4 CANCEL handling: 200 to the CANCEL itself, 487 to
    /// the still-pending INVITE's server transaction, dialog terminated.
    async fn handle_inbound_cancel(self: &Arc<Self>, call_id: &str, request: &Request, server_tx: &ServerTransaction) {
        let _ = server_tx.respond(mirror_response(request, Method::Cancel, 200, "OK")).await;

        if let Some((_, (invite_tx, invite_request))) = self.pending_uas_invite_tx.remove(call_id) {
            let _ = invite_tx.respond(mirror_response(&invite_request, Method::Invite, 487, "Request Terminated")).await;
        }
        for handle in self.registry.by_call_id(call_id).await {
            let transition = {
                let mut dialog = handle.lock().await;
                if dialog.state.is_early_or_trying() {
                    let from = dialog.state;
                    match dialog.on_rx_failure() {
                        Ok(()) => Some((from, dialog.state, dialog.id.clone())),
                        Err(_) => None,
                    }
                } else {
                    None
                }
            };
            if let Some((from, to, id)) = transition {
                self.notify_transition(id, from, to).await;
            }
        }
    }

    async fn handle_inbound_bye(self: &Arc<Self>, handle: DialogHandle, request: &Request, server_tx: &ServerTransaction) {
        let cseq = wire::cseq_of_request(request).unwrap_or(0);
        let outcome = {
            let mut dialog = handle.lock().await;
            match dialog.accept_remote_seq(cseq) {
                Err(err) => Err(err),
                Ok(()) => {
                    let from = dialog.state;
                    if dialog.on_bye().is_err() {
                        Ok(None)
                    } else {
                        let mid = dialog.state;
                        let _ = dialog.on_bye_final();
                        Ok(Some((from, mid, dialog.state, dialog.id.clone())))
                    }
                }
            }
        };

        match outcome {
            Err(err) => {
                respond_error(server_tx, request, 500, "Server Internal Error").await;
                self.notify_error(None, "bye_cseq", err).await;
            }
            Ok(transition) => {
                let _ = server_tx.respond(mirror_response(request, Method::Bye, 200, "OK")).await;
                if let Some((from, mid, to, id)) = transition {
                    self.notify_transition(id.clone(), from, mid).await;
                    self.notify_transition(id, mid, to).await;
                }
            }
        }
    }

    async fn handle_inbound_refer(self: &Arc<Self>, handle: DialogHandle, request: &Request, server_tx: &ServerTransaction) {
        let cseq = wire::cseq_of_request(request).unwrap_or(0);
        {
            let mut dialog = handle.lock().await;
            if let Err(err) = dialog.accept_remote_seq(cseq) {
                drop(dialog);
                respond_error(server_tx, request, 500, "Server Internal Error").await;
                self.notify_error(None, "refer_cseq", err).await;
                return;
            }
        }

        if request.header(&HeaderName::ReferTo).is_none() {
            respond_error(server_tx, request, 400, "Missing Refer-To").await;
            return;
        }
        let incoming = match crate::refer::parse_incoming_refer(request) {
            Ok(incoming) => incoming,
            Err(err) => {
                respond_error(server_tx, request, 400, "Bad Request").await;
                self.notify_error(None, "refer_parse", err).await;
                return;
            }
        };

        let _ = server_tx.respond(mirror_response(request, Method::Refer, 202, "Accepted")).await;

        let dialog_id = { handle.lock().await.id.clone() };
        let subscription = {
            let dialog = handle.lock().await;
            crate::refer::ReferSubscription::new(&dialog)
        };
        self.refer_subscriptions.insert(dialog_id.clone(), tokio::sync::Mutex::new(subscription));

        if let Some(entry) = self.refer_subscriptions.get(&dialog_id) {
            let mut subscription = entry.lock().await;
            if let Ok(notify_request) = subscription.notify("SIP/2.0 100 Trying", false) {
                if let Some(destination) = handle
                    .lock()
                    .await
                    .route_set
                    .first()
                    .cloned()
                    .or_else(|| Some(notify_request.uri.clone()))
                    .and_then(|uri| super::facade::resolve_destination(&uri).ok())
                {
                    let branch = crate::builder::branch_of(&notify_request);
                    let _ = self.transactions.send_request(notify_request, destination, branch).await;
                }
            }
        }

        if let Some(handler) = self.incoming_refer_handler().await {
            handler(handle, incoming);
        }
    }

    /// Generic in-dialog requests this crate doesn't specialize (UPDATE,
    /// INFO, MESSAGE, inbound NOTIFY) (spec §4.5 `send_request`'s inbound
    /// counterpart): validate CSeq, apply target refresh if the method
    /// carries one, and acknowledge with 200 OK.
    async fn handle_inbound_generic(self: &Arc<Self>, handle: DialogHandle, request: &Request, server_tx: &ServerTransaction, method: Method) {
        let cseq = wire::cseq_of_request(request).unwrap_or(0);
        {
            let mut dialog = handle.lock().await;
            if let Err(err) = dialog.accept_remote_seq(cseq) {
                drop(dialog);
                respond_error(server_tx, request, 500, "Server Internal Error").await;
                self.notify_error(None, "generic_cseq", err).await;
                return;
            }
            if crate::builder::is_target_refresh(&method) {
                if let Some(contact) = wire::contact_of_request(request) {
                    dialog.apply_target_refresh(&contact);
                }
            }
        }
        let _ = server_tx.respond(mirror_response(request, method, 200, "OK")).await;
    }
}

async fn respond_error(server_tx: &ServerTransaction, request: &Request, status: u16, reason: &str) {
    let response = mirror_response(request, request.method.clone(), status, reason);
    let _ = server_tx.respond(response).await;
}

fn mirror_response(request: &Request, cseq_method: Method, status: u16, reason: &str) -> Response {
    let status_code = StatusCode::from_u16(status).expect("internally generated status codes are always valid");
    let call_id = wire::call_id_of_request(request).unwrap_or_default();
    let seq = wire::cseq_of_request(request).unwrap_or(1);

    let mut builder = ResponseBuilder::new(status_code, Some(reason)).call_id(&call_id).cseq(seq, cseq_method);
    if let Some(via) = request.header(&HeaderName::Via) {
        builder = builder.header(via.clone());
    }
    if let Some(from) = request.from() {
        builder = builder.from("", &from.address().uri().to_string(), from.tag());
    }
    if let Some(to) = request.to() {
        builder = builder.to("", &to.address().uri().to_string(), to.tag());
    }
    builder.build()
}

fn unknown_uri() -> Uri {
    "sip:unknown@invalid".parse().expect("static literal URI always parses")
}

// ---- Long-running watchers -------------------------------------------------

/// Drives one outbound INVITE (initial or re-INVITE) to a terminal
/// outcome: 1xx/2xx progress, ACK-for-2xx emission and retransmission,
/// glare backoff-and-retry on 491, or failure/timeout termination (spec
/// §4.1, §4.4, §5).
///
/// A forking proxy may deliver 1xx/2xx responses carrying distinct
/// To-tags on this same transaction (spec §4.1 "Forking"); the first
/// such tag claims `handle` itself (the dialog the caller already
/// holds), and any further distinct tag spawns a sibling dialog cloned
/// from the pristine pre-fork snapshot so the registry's Call-ID index
/// holds the full set. Only the branch whose final response arrives
/// first is driven to completion here; siblings left in `Early` are not
/// actively resolved — per spec, the forking proxy's own CANCEL or this
/// dialog's normal timers are what eventually end them, not this watcher.
pub(crate) fn spawn_invite_watcher(ua: Arc<UserAgent>, handle: DialogHandle, mut tx: ClientTransaction, is_initial: bool) {
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let pristine = if is_initial { Some(handle.lock().await.clone()) } else { None };
        let mut branches: HashMap<String, DialogHandle> = HashMap::new();
        loop {
            match tx.next_event().await {
                Some(TransactionEvent::Provisional(response)) => {
                    let to_tag = wire::to_tag_of_response(&response);
                    let contact = wire::contact_of_response(&response);
                    let record_route = wire::record_route_of_response(&response);
                    let Some(tag) = to_tag else { continue };
                    let Some(branch_handle) = resolve_branch(&ua, &handle, &mut branches, &pristine, &tag).await else {
                        continue;
                    };
                    let transition = {
                        let mut dialog = branch_handle.lock().await;
                        let from = dialog.state;
                        match dialog.on_rx_provisional(Some(&tag), contact.as_ref(), &record_route) {
                            Ok(rekeyed) => Some((from, dialog.state, dialog.id.clone(), rekeyed)),
                            Err(_) => None,
                        }
                    };
                    if let Some((from, to, id, rekeyed)) = transition {
                        if let Some(old) = rekeyed {
                            let _ = ua.registry.update_id(&old, id.clone()).await;
                        }
                        ua.notify_transition(id, from, to).await;
                    }
                }
                Some(TransactionEvent::Final(response)) => {
                    let status = response.status.as_u16();
                    let to_tag = wire::to_tag_of_response(&response);
                    let branch_handle = match &to_tag {
                        Some(tag) => resolve_branch(&ua, &handle, &mut branches, &pristine, tag)
                            .await
                            .unwrap_or_else(|| handle.clone()),
                        None => handle.clone(),
                    };
                    if (200..300).contains(&status) {
                        handle_invite_success(&ua, &branch_handle, &response, started).await;
                    } else if !is_initial && status == 491 {
                        handle_glare_retry(&ua, &branch_handle, started).await;
                    } else {
                        handle_invite_failure(&ua, &branch_handle, status, response.status.reason_phrase().to_string(), is_initial, started).await;
                    }
                    return;
                }
                Some(TransactionEvent::Timeout) => {
                    handle_invite_failure(&ua, &handle, 408, "Request Timeout".to_string(), is_initial, started).await;
                    return;
                }
                Some(TransactionEvent::TransportError(detail)) => {
                    warn!(detail, "invite transaction transport failure");
                    handle_invite_failure(&ua, &handle, 503, "Service Unavailable".to_string(), is_initial, started).await;
                    return;
                }
                None => return,
            }
        }
    });
}

/// Looks up the dialog handle `branches` already tracks for `tag`, claims
/// `handle` itself for it if this is the first tag this transaction has
/// seen, or — for a forking proxy's additional branch — registers a
/// fresh sibling dialog for it. The sibling starts from `pristine` (the
/// pre-fork `Trying` snapshot) with a temporary, collision-free id; its
/// real id is whatever the caller's own `on_rx_provisional`/`on_rx_2xx`
/// rekeys it to once it learns `tag`, via the existing `update_id` path.
async fn resolve_branch(
    ua: &Arc<UserAgent>,
    handle: &DialogHandle,
    branches: &mut HashMap<String, DialogHandle>,
    pristine: &Option<Dialog>,
    tag: &str,
) -> Option<DialogHandle> {
    if let Some(existing) = branches.get(tag) {
        return Some(existing.clone());
    }
    if handle.lock().await.remote_tag.is_empty() {
        branches.insert(tag.to_string(), handle.clone());
        return Some(handle.clone());
    }
    let mut forked = pristine.clone()?;
    forked.id = crate::dialog::DialogId::new(forked.call_id.clone(), forked.local_tag.clone(), format!("~forking~{tag}"));
    let registered = ua.registry.register(forked).await.ok()?;
    branches.insert(tag.to_string(), registered.clone());
    Some(registered)
}

async fn handle_invite_success(ua: &Arc<UserAgent>, handle: &DialogHandle, response: &Response, started: tokio::time::Instant) {
    let to_tag = wire::to_tag_of_response(response).unwrap_or_default();
    let record_route = wire::record_route_of_response(response);
    let cseq = wire::cseq_of_response(response).unwrap_or(0);

    // A 2xx with no Contact is malformed (RFC 3261 §12.1.1 requires one
    // on every dialog-establishing response); falling back to a sentinel
    // URI would poison `remote_target`/`ack_owed` and send the ACK into
    // nowhere, so keep whatever target the dialog already has instead.
    let outcome = {
        let mut dialog = handle.lock().await;
        let from = dialog.state;
        let contact = match wire::contact_of_response(response) {
            Some(contact) => contact,
            None => dialog.remote_target.clone(),
        };
        match dialog.on_rx_2xx(&to_tag, &contact, &record_route, cseq) {
            Ok(rekeyed) => Ok((from, dialog.state, dialog.id.clone(), rekeyed)),
            Err(err) => Err(err),
        }
    };
    let (from, to, id, rekeyed) = match outcome {
        Ok(tuple) => tuple,
        Err(err) => {
            ua.notify_error(None, "rx_2xx", err).await;
            return;
        }
    };
    if let Some(old) = rekeyed {
        let _ = ua.registry.update_id(&old, id.clone()).await;
    }

    let ack_destination = {
        let dialog = handle.lock().await;
        super::facade::resolve_destination(&dialog.remote_target).ok()
    };
    if let Some(destination) = ack_destination {
        let ack = {
            let dialog = handle.lock().await;
            crate::builder::build_ack(&dialog)
        };
        match ack {
            Ok(ack) => {
                if ua.transport.send_request(ack, destination).await.is_ok() {
                    handle.lock().await.ack_sent();
                }
            }
            Err(err) => ua.notify_error(Some(id.clone()), "build_ack", err).await,
        }
    }

    ua.notify_transition(id.clone(), from, to).await;
    ua.notify_outcome(id, "INVITE", RequestOutcome::Success { status: 200 }, started.elapsed()).await;
}

async fn handle_invite_failure(
    ua: &Arc<UserAgent>,
    handle: &DialogHandle,
    status: u16,
    reason: String,
    is_initial: bool,
    started: tokio::time::Instant,
) {
    let transition = {
        let mut dialog = handle.lock().await;
        let from = dialog.state;
        if is_initial || status == 481 || status == 408 {
            match dialog.on_rx_failure() {
                Ok(()) => Some((from, dialog.state, dialog.id.clone())),
                Err(_) => None,
            }
        } else {
            dialog.clear_pending_invite();
            None
        }
    };
    if let Some((from, to, id)) = transition {
        ua.notify_transition(id.clone(), from, to).await;
        ua.notify_outcome(id, "INVITE", RequestOutcome::Failure { status, reason }, started.elapsed()).await;
    } else {
        let id = { handle.lock().await.id.clone() };
        ua.notify_outcome(id, "INVITE", RequestOutcome::Failure { status, reason }, started.elapsed()).await;
    }
}

/// RFC 3261 §14.1 glare backoff (spec §4.1 scenario E). Call-ID is shared
/// by both sides of one dialog, so the tie-break this crate implements
/// compares `(local_tag, remote_tag)` instead — a deterministic,
/// consistently-ordered surrogate both sides agree on (documented as an
/// Open Question resolution in DESIGN.md).
async fn handle_glare_retry(ua: &Arc<UserAgent>, handle: &DialogHandle, started: tokio::time::Instant) {
    let (local_tag, remote_tag, id) = {
        let mut dialog = handle.lock().await;
        dialog.clear_pending_invite();
        (dialog.local_tag.clone(), dialog.remote_tag.clone(), dialog.id.clone())
    };
    ua.notify_outcome(
        id.clone(),
        "INVITE",
        RequestOutcome::Failure {
            status: 491,
            reason: "Request Pending".to_string(),
        },
        started.elapsed(),
    )
    .await;

    let ua = ua.clone();
    let handle = handle.clone();
    tokio::spawn(async move {
        let delay = glare::backoff_delay(&local_tag, &remote_tag);
        tokio::time::sleep(delay).await;
        if let Err(err) = ua.reinvite(&handle, None, None).await {
            ua.notify_error(Some(id), "glare_retry", err).await;
        }
    });
}

/// Drives an outbound BYE to its final response (spec §4.1 `send_bye`).
pub(crate) fn spawn_bye_watcher(ua: Arc<UserAgent>, handle: DialogHandle, mut tx: ClientTransaction) {
    tokio::spawn(async move {
        loop {
            match tx.next_event().await {
                Some(TransactionEvent::Provisional(_)) => continue,
                Some(TransactionEvent::Final(response)) => {
                    let transition = {
                        let mut dialog = handle.lock().await;
                        let from = dialog.state;
                        match dialog.on_bye_final() {
                            Ok(()) => Some((from, dialog.state, dialog.id.clone())),
                            Err(_) => None,
                        }
                    };
                    if let Some((from, to, id)) = transition {
                        ua.notify_transition(id, from, to).await;
                    }
                    debug!(status = response.status.as_u16(), "BYE completed");
                    return;
                }
                Some(TransactionEvent::Timeout) | Some(TransactionEvent::TransportError(_)) | None => {
                    let transition = {
                        let mut dialog = handle.lock().await;
                        let from = dialog.state;
                        let _ = dialog.force_terminate();
                        (from, dialog.state, dialog.id.clone())
                    };
                    ua.notify_transition(transition.2, transition.0, transition.1).await;
                    return;
                }
            }
        }
    });
}

/// Timer H (spec §5): if ACK for a sent 2xx never arrives, the UAS
/// dialog (or the pending re-INVITE on an already-established one) is
/// force-terminated / its pending INVITE cleared.
pub(crate) fn spawn_ack_timeout_watcher(ua: Arc<UserAgent>, handle: DialogHandle) {
    tokio::spawn(async move {
        let deadline = ua.config.timers.timer_h();
        let started = tokio::time::Instant::now();
        loop {
            let still_pending = { handle.lock().await.pending_invite_tx.is_some() };
            if !still_pending {
                return;
            }
            if started.elapsed() >= deadline {
                let (from, to, id, call_id, was_initial) = {
                    let mut dialog = handle.lock().await;
                    let from = dialog.state;
                    let was_initial = from != DialogState::Established;
                    let _ = dialog.force_terminate();
                    (from, dialog.state, dialog.id.clone(), dialog.call_id.clone(), was_initial)
                };
                ua.pending_uas_invite_tx.remove(&call_id);
                if was_initial {
                    ua.notify_transition(id.clone(), from, to).await;
                }
                ua.notify_error(Some(id), "ack_timeout", DialogError::timeout("ACK for 2xx (Timer H)")).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(100).min(deadline)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DialogConfig;
    use crate::dialog::DialogId;
    use crate::transport::FakeTransport;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn dest() -> SocketAddr {
        "127.0.0.1:5062".parse().unwrap()
    }

    async fn test_ua() -> (Arc<UserAgent>, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::new());
        let config = DialogConfig::new("127.0.0.1:5060".parse().unwrap()).without_auto_cleanup();
        let ua = UserAgent::new(config, transport.clone() as Arc<dyn crate::transport::SipTransport>).unwrap();
        (ua, transport)
    }

    fn server_tx(transport: &Arc<FakeTransport>, branch: &str, method: Method) -> ServerTransaction {
        ServerTransaction::new(
            TransactionKey::new_server(branch, method),
            dest(),
            transport.clone() as Arc<dyn crate::transport::SipTransport>,
            None,
        )
    }

    fn established_uas_dialog(call_id: &str, local_tag: &str, remote_tag: &str) -> Dialog {
        let mut d = Dialog::new_uas(
            call_id,
            uri("sip:alice@127.0.0.1"),
            uri("sip:bob@127.0.0.1"),
            uri("sip:bob@127.0.0.1:5062"),
            1,
            Vec::new(),
        );
        d.local_tag = local_tag.to_string();
        d.remote_tag = remote_tag.to_string();
        d.id = DialogId::new(call_id, local_tag, remote_tag);
        d.state = DialogState::Established;
        d
    }

    fn in_dialog_request(method: Method, call_id: &str, from_tag: &str, to_tag: &str, cseq: u32) -> Request {
        RequestBuilder::new(method, "sip:alice@127.0.0.1")
            .unwrap()
            .from("", "sip:bob@127.0.0.1", Some(from_tag))
            .to("", "sip:alice@127.0.0.1", Some(to_tag))
            .call_id(call_id)
            .cseq(cseq)
            .build()
    }

    #[tokio::test]
    async fn inbound_bye_terminates_dialog_and_responds_200() {
        let (ua, transport) = test_ua().await;
        let handle = ua.registry.register(established_uas_dialog("c1", "a1", "b1")).await.unwrap();
        let request = in_dialog_request(Method::Bye, "c1", "b1", "a1", 2);
        let tx = server_tx(&transport, "z1", Method::Bye);

        ua.handle_inbound_bye(handle.clone(), &request, &tx).await;

        assert_eq!(handle.lock().await.state, DialogState::Terminated);
        let (response, _) = transport.take_response().expect("BYE must be answered");
        assert_eq!(response.status.as_u16(), 200);
    }

    #[tokio::test]
    async fn inbound_bye_with_stale_cseq_is_rejected_without_terminating() {
        let (ua, transport) = test_ua().await;
        let mut dialog = established_uas_dialog("c1", "a1", "b1");
        dialog.remote_seq = 5;
        let handle = ua.registry.register(dialog).await.unwrap();
        let request = in_dialog_request(Method::Bye, "c1", "b1", "a1", 5);
        let tx = server_tx(&transport, "z1", Method::Bye);

        ua.handle_inbound_bye(handle.clone(), &request, &tx).await;

        assert_eq!(handle.lock().await.state, DialogState::Established);
        let (response, _) = transport.take_response().expect("stale CSeq must still get a response");
        assert_eq!(response.status.as_u16(), 500);
    }

    #[tokio::test]
    async fn inbound_reinvite_during_pending_outbound_invite_is_glare() {
        let (ua, transport) = test_ua().await;
        let mut dialog = established_uas_dialog("c1", "a1", "b1");
        dialog.start_invite(TransactionKey::new_branch("outbound", Method::Invite));
        let handle = ua.registry.register(dialog).await.unwrap();
        let request = in_dialog_request(Method::Invite, "c1", "b1", "a1", 2);
        let tx = server_tx(&transport, "z2", Method::Invite);

        ua.clone().handle_inbound_reinvite(handle.clone(), request, tx).await;

        let (response, _) = transport.take_response().expect("glare must be answered");
        assert_eq!(response.status.as_u16(), 491);
        // Glare leaves the dialog Established; only the pending-INVITE flag changes.
        assert_eq!(handle.lock().await.state, DialogState::Established);
    }

    #[tokio::test]
    async fn inbound_cancel_answers_both_transactions_and_terminates_dialog() {
        let (ua, transport) = test_ua().await;
        let dialog = Dialog::new_uas(
            "c1",
            uri("sip:alice@127.0.0.1"),
            uri("sip:bob@127.0.0.1"),
            uri("sip:bob@127.0.0.1:5062"),
            1,
            Vec::new(),
        );
        let handle = ua.registry.register(dialog).await.unwrap();

        let invite_request = in_dialog_request(Method::Invite, "c1", "b1", "", 1);
        let invite_tx = server_tx(&transport, "z3", Method::Invite);
        ua.pending_uas_invite_tx.insert("c1".to_string(), (invite_tx, invite_request));

        let cancel_request = in_dialog_request(Method::Cancel, "c1", "b1", "", 1);
        let cancel_tx = server_tx(&transport, "z3", Method::Cancel);
        ua.handle_inbound_cancel("c1", &cancel_request, &cancel_tx).await;

        let (first, _) = transport.take_response().expect("CANCEL gets 200");
        assert_eq!(first.status.as_u16(), 200);
        let (second, _) = transport.take_response().expect("pending INVITE gets 487");
        assert_eq!(second.status.as_u16(), 487);
        assert_eq!(handle.lock().await.state, DialogState::Terminated);
        assert!(ua.pending_uas_invite_tx.get("c1").is_none());
    }

    #[tokio::test]
    async fn inbound_refer_without_refer_to_is_rejected() {
        let (ua, transport) = test_ua().await;
        let handle = ua.registry.register(established_uas_dialog("c1", "a1", "b1")).await.unwrap();
        let request = in_dialog_request(Method::Refer, "c1", "b1", "a1", 2);
        let tx = server_tx(&transport, "z4", Method::Refer);

        ua.handle_inbound_refer(handle, &request, &tx).await;

        let (response, _) = transport.take_response().expect("missing Refer-To must be answered");
        assert_eq!(response.status.as_u16(), 400);
    }

    #[tokio::test]
    async fn inbound_generic_request_applies_target_refresh_and_acks_200() {
        let (ua, transport) = test_ua().await;
        let handle = ua.registry.register(established_uas_dialog("c1", "a1", "b1")).await.unwrap();
        let request = RequestBuilder::new(Method::Update, "sip:alice@127.0.0.1")
            .unwrap()
            .from("", "sip:bob@127.0.0.1", Some("b1"))
            .to("", "sip:alice@127.0.0.1", Some("a1"))
            .call_id("c1")
            .cseq(2)
            .contact("sip:bob@127.0.0.1:5099", None)
            .build();
        let tx = server_tx(&transport, "z5", Method::Update);

        ua.handle_inbound_generic(handle.clone(), &request, &tx, Method::Update).await;

        let (response, _) = transport.take_response().expect("UPDATE must be acked");
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(handle.lock().await.remote_target.to_string(), "sip:bob@127.0.0.1:5099");
    }

    #[tokio::test]
    async fn refer_progress_sends_followup_notify_and_terminates_subscription() {
        let (ua, transport) = test_ua().await;
        let handle = ua.registry.register(established_uas_dialog("c1", "a1", "b1")).await.unwrap();
        let dialog_id = { handle.lock().await.id.clone() };
        let request = RequestBuilder::new(Method::Refer, "sip:alice@127.0.0.1")
            .unwrap()
            .from("", "sip:bob@127.0.0.1", Some("b1"))
            .to("", "sip:alice@127.0.0.1", Some("a1"))
            .call_id("c1")
            .cseq(2)
            .refer_to_blind_transfer("sip:carol@127.0.0.1")
            .build();
        let tx = server_tx(&transport, "z6", Method::Refer);

        ua.clone().handle_inbound_refer(handle.clone(), &request, &tx).await;

        let (response, _) = transport.take_response().expect("REFER must be accepted");
        assert_eq!(response.status.as_u16(), 202);
        let (initial_notify, _) = transport.take_request().expect("initial NOTIFY must be sent");
        assert_eq!(initial_notify.method, Method::Notify);

        ua.notify_refer_progress(&dialog_id, "SIP/2.0 200 OK", true).await.unwrap();

        let (notify, _) = transport.take_request().expect("progress NOTIFY must be sent");
        assert_eq!(notify.method, Method::Notify);

        // The subscription already terminated; a further call is a no-op.
        assert!(ua.notify_refer_progress(&dialog_id, "SIP/2.0 200 OK", true).await.is_ok());
        assert!(transport.take_request().is_none());
    }
}
