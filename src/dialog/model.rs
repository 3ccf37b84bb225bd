//! The `Dialog` data record and its state machine (spec §3, §4.1).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rvoip_sip_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{DialogError, DialogResult};
use crate::media::Body;
use crate::transaction::TransactionKey;

use super::id::DialogId;
use super::state::{is_legal_transition, DialogState};

/// Whether a dialog originated locally (sent the INVITE) or remotely
/// (received it). Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogRole {
    Uac,
    Uas,
}

pub type StateChangeHandler = Arc<dyn Fn(DialogState, DialogState) + Send + Sync>;
pub type RequestHandler = Arc<dyn Fn(&Request) + Send + Sync>;
pub type BodyHandler = Arc<dyn Fn(&Body) + Send + Sync>;
pub type ReferHandler = Arc<dyn Fn(crate::refer::IncomingRefer) + Send + Sync>;

/// Per-dialog callbacks (spec §3). Installed via [`crate::ua::UserAgent::on_incoming_invite`]
/// for new UAS dialogs, or directly on a `Dialog` for ones the application
/// already holds. None of these run while the per-dialog lock is held
/// (spec §5): the dialog commits its transition first, then the executor
/// dispatches the handler on its own task.
#[derive(Clone, Default)]
pub struct HandlerSet {
    pub state_change: Option<StateChangeHandler>,
    pub request: Option<RequestHandler>,
    pub body: Option<BodyHandler>,
    pub refer: Option<ReferHandler>,
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("state_change", &self.state_change.is_some())
            .field("request", &self.request.is_some())
            .field("body", &self.body.is_some())
            .field("refer", &self.refer.is_some())
            .finish()
    }
}

/// A SIP dialog: a confirmed or early call leg (spec §3).
#[derive(Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    pub local_target: Uri,
    pub remote_target: Uri,
    pub route_set: Vec<Uri>,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub role: DialogRole,
    pub state: DialogState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub pending_invite_tx: Option<TransactionKey>,
    pub replaces_target: Option<DialogId>,
    /// ACK owed for a received 2xx whose ACK hasn't gone out yet
    /// (invariant 4); carries the To-tag/Contact of that 2xx so a
    /// retransmission can be re-ACKed identically.
    pub ack_owed: Option<AckContext>,
    route_frozen: bool,
    pub handlers: HandlerSet,
}

/// Everything needed to build/re-send the ACK for a 2xx response to an
/// INVITE or re-INVITE, kept distinct from the transaction layer because
/// ACK-for-2xx is dialog-scoped, not transaction-scoped (spec §4.4).
#[derive(Debug, Clone)]
pub struct AckContext {
    pub cseq: u32,
    pub remote_target: Uri,
}

impl fmt::Debug for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialog")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("local_seq", &self.local_seq)
            .field("remote_seq", &self.remote_seq)
            .field("route_set_len", &self.route_set.len())
            .finish()
    }
}

impl Dialog {
    /// Constructs a UAC dialog in `Init`, before the INVITE has been sent.
    pub fn new_uac(
        call_id: impl Into<String>,
        local_uri: Uri,
        remote_uri: Uri,
        local_tag: impl Into<String>,
        local_target: Uri,
    ) -> Self {
        let call_id = call_id.into();
        let local_tag = local_tag.into();
        let now = Utc::now();
        Self {
            id: DialogId::provisional(call_id.clone(), local_tag.clone()),
            call_id,
            local_tag,
            remote_tag: String::new(),
            remote_target: remote_uri.clone(),
            local_uri,
            remote_uri,
            local_target,
            route_set: Vec::new(),
            local_seq: 0,
            remote_seq: 0,
            role: DialogRole::Uac,
            state: DialogState::Init,
            created_at: now,
            last_activity_at: now,
            pending_invite_tx: None,
            replaces_target: None,
            ack_owed: None,
            route_frozen: false,
            handlers: HandlerSet::default(),
        }
    }

    /// Constructs a UAS dialog from an inbound INVITE, already in
    /// `Trying` (spec §4.1 entry condition: "UAS has received INVITE and
    /// not yet sent a provisional with To-tag").
    pub fn new_uas(
        call_id: impl Into<String>,
        local_uri: Uri,
        remote_uri: Uri,
        remote_target: Uri,
        remote_seq: u32,
        route_set: Vec<Uri>,
    ) -> Self {
        let call_id = call_id.into();
        let now = Utc::now();
        Self {
            id: DialogId::provisional(call_id.clone(), String::new()),
            call_id,
            local_tag: String::new(),
            remote_tag: String::new(),
            local_uri,
            remote_uri,
            local_target: remote_target.clone(),
            remote_target,
            route_set,
            local_seq: 0,
            remote_seq,
            role: DialogRole::Uas,
            state: DialogState::Trying,
            created_at: now,
            last_activity_at: now,
            pending_invite_tx: None,
            replaces_target: None,
            ack_owed: None,
            route_frozen: false,
            handlers: HandlerSet::default(),
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    fn transition(&mut self, to: DialogState) -> DialogResult<()> {
        if !is_legal_transition(self.state, to) {
            return Err(DialogError::invalid_state(self.state, "state transition"));
        }
        let from = self.state;
        self.state = to;
        self.touch();
        if from != to {
            if let Some(handler) = &self.handlers.state_change {
                handler(from, to);
            }
        }
        Ok(())
    }

    /// Recomputes `self.id` after the remote tag becomes known, and
    /// returns the previous id so the caller (the registry) can re-key
    /// its indexes atomically (spec §4.2 `update_id`).
    fn rekey(&mut self) -> DialogId {
        let old = self.id.clone();
        self.id = DialogId::new(self.call_id.clone(), self.local_tag.clone(), self.remote_tag.clone());
        old
    }

    // ---- UAC events ----------------------------------------------------

    /// `send_invite`: Init -> Trying.
    pub fn on_send_invite(&mut self, tx: TransactionKey) -> DialogResult<()> {
        self.transition(DialogState::Trying)?;
        self.pending_invite_tx = Some(tx);
        Ok(())
    }

    /// `rx_1xx_no_tag` / `rx_1xx_with_tag`. Returns the previous dialog
    /// id if the tag assignment caused a re-key (caller must forward this
    /// to [`crate::registry::DialogRegistry::update_id`]).
    pub fn on_rx_provisional(
        &mut self,
        to_tag: Option<&str>,
        contact: Option<&Uri>,
        record_route: &[Uri],
    ) -> DialogResult<Option<DialogId>> {
        let Some(tag) = to_tag else {
            // rx_1xx_no_tag: no dialog-creating effect.
            self.touch();
            return Ok(None);
        };
        if self.remote_tag.is_empty() {
            self.remote_tag = tag.to_string();
        }
        if !self.route_frozen {
            self.freeze_route_set(record_route);
        }
        if let Some(contact) = contact {
            self.remote_target = contact.clone();
        }
        self.transition(DialogState::Early)?;
        Ok(Some(self.rekey()))
    }

    /// `rx_2xx`: Trying|Early -> Established. The caller must send ACK
    /// immediately using the To-tag/Contact of this 2xx (spec §4.1); this
    /// method records that obligation in `ack_owed`.
    pub fn on_rx_2xx(
        &mut self,
        to_tag: &str,
        contact: &Uri,
        record_route: &[Uri],
        cseq: u32,
    ) -> DialogResult<Option<DialogId>> {
        let mut rekeyed = None;
        if self.remote_tag.is_empty() {
            self.remote_tag = to_tag.to_string();
            rekeyed = Some(self.rekey());
        }
        if !self.route_frozen {
            self.freeze_route_set(record_route);
        }
        self.remote_target = contact.clone();
        self.transition(DialogState::Established)?;
        self.pending_invite_tx = None;
        self.ack_owed = Some(AckContext {
            cseq,
            remote_target: self.remote_target.clone(),
        });
        Ok(rekeyed)
    }

    /// ACK has gone out for the outstanding 2xx (invariant 4).
    pub fn ack_sent(&mut self) {
        self.ack_owed = None;
        self.touch();
    }

    /// `rx_3xx..6xx`: Trying|Early -> Terminated. The non-2xx ACK is
    /// transaction-scoped and not this dialog's concern.
    pub fn on_rx_failure(&mut self) -> DialogResult<()> {
        self.pending_invite_tx = None;
        self.transition(DialogState::Terminated)
    }

    /// `send_cancel`: valid only in Trying|Early.
    pub fn guard_cancel(&self) -> DialogResult<()> {
        if self.state.is_early_or_trying() {
            Ok(())
        } else {
            Err(DialogError::invalid_state(self.state, "cancel"))
        }
    }

    // ---- UAS events (symmetric) -----------------------------------------

    /// `send_1xx` with a To-tag: Trying -> Early (UAS side of `rx_1xx_with_tag`).
    pub fn on_send_provisional_with_tag(&mut self, local_tag: String, route_set: Vec<Uri>) -> DialogResult<Option<DialogId>> {
        if self.local_tag.is_empty() {
            self.local_tag = local_tag;
        }
        if !self.route_frozen {
            self.route_set = route_set;
            self.route_frozen = true;
        }
        self.transition(DialogState::Early)?;
        Ok(Some(self.rekey()))
    }

    /// `send_2xx`: Trying|Early -> Established is deferred until ACK
    /// arrives on the UAS side; this records the pending 2xx's CSeq so
    /// `on_rx_ack` can validate it, without yet transitioning.
    pub fn on_send_2xx(&mut self, local_tag: String, local_target: Uri) -> DialogResult<()> {
        if self.local_tag.is_empty() {
            self.local_tag = local_tag;
        }
        self.local_target = local_target;
        self.touch();
        Ok(())
    }

    /// `rx_ack`: completes UAS Established transition after a 2xx was sent.
    pub fn on_rx_ack(&mut self) -> DialogResult<()> {
        self.pending_invite_tx = None;
        self.transition(DialogState::Established)
    }

    /// A UAS target-refresh request (re-INVITE/UPDATE) updates the
    /// remote target from its Contact; non-target-refresh methods do not
    /// (spec §4.3).
    pub fn apply_target_refresh(&mut self, contact: &Uri) {
        self.remote_target = contact.clone();
        self.touch();
    }

    // ---- Shared lifecycle -------------------------------------------------

    /// `send_bye` / `rx_bye`: Established -> Terminating.
    pub fn on_bye(&mut self) -> DialogResult<()> {
        self.transition(DialogState::Terminating)
    }

    /// Final response to BYE (or absorption of a retransmitted BYE):
    /// Terminating -> Terminated.
    pub fn on_bye_final(&mut self) -> DialogResult<()> {
        self.transition(DialogState::Terminated)
    }

    /// Any unrecoverable condition (timeout, 481/408 on an in-dialog
    /// request) forces immediate termination regardless of current state,
    /// short of an already-Terminated dialog.
    pub fn force_terminate(&mut self) -> DialogResult<()> {
        if self.state == DialogState::Terminated {
            return Ok(());
        }
        self.pending_invite_tx = None;
        self.transition(DialogState::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    /// Invariant 4: a Terminated dialog accepts no outbound requests
    /// except an owed ACK.
    pub fn accepts_outbound(&self) -> bool {
        self.state == DialogState::Established || self.ack_owed.is_some()
    }

    /// Invariant 7 / `Busy`: reject a concurrent (re-)INVITE attempt.
    pub fn guard_new_invite(&self) -> DialogResult<()> {
        if self.pending_invite_tx.is_some() {
            return Err(DialogError::Busy);
        }
        match self.state {
            DialogState::Established => Ok(()),
            _ => Err(DialogError::invalid_state(self.state, "reinvite")),
        }
    }

    /// Marks a fresh (re-)INVITE as pending, after `guard_new_invite` passed.
    pub fn start_invite(&mut self, tx: TransactionKey) {
        self.pending_invite_tx = Some(tx);
        self.touch();
    }

    /// Clears a pending (re-)INVITE without otherwise changing dialog
    /// state: used when a re-INVITE is rejected (491 glare, or any other
    /// non-2xx) and the dialog simply remains `Established` (spec §4.1
    /// scenario E), unlike [`Dialog::on_rx_failure`] which terminates the
    /// dialog-establishing INVITE's failure.
    pub fn clear_pending_invite(&mut self) {
        self.pending_invite_tx = None;
        self.touch();
    }

    /// Invariant 1: `local_seq` allocation for non-ACK, non-CANCEL
    /// requests the dialog originates. Deterministic wrap-to-1 when the
    /// next value would overflow `u32` (spec §3, §8 boundary behavior;
    /// the alternative saturating-clamp is also spec-legal, this crate
    /// chooses wrap, recorded in DESIGN.md).
    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq = if self.local_seq == u32::MAX {
            1
        } else {
            self.local_seq + 1
        };
        self.touch();
        self.local_seq
    }

    /// ACK reuses the INVITE's CSeq number with method ACK; it does not
    /// allocate a new sequence number.
    pub fn current_local_seq(&self) -> u32 {
        self.local_seq
    }

    /// Out-of-order CSeq guard (spec §4.1): an in-dialog request with
    /// CSeq <= the last accepted `remote_seq` must be rejected with 500.
    /// The first received CSeq is always accepted.
    pub fn accept_remote_seq(&mut self, cseq: u32) -> DialogResult<()> {
        if self.remote_seq != 0 && cseq <= self.remote_seq {
            return Err(DialogError::internal(
                "accept_remote_seq",
                format!("out-of-order CSeq {cseq}, last seen {}", self.remote_seq),
            ));
        }
        self.remote_seq = cseq;
        self.touch();
        Ok(())
    }

    fn freeze_route_set(&mut self, record_route: &[Uri]) {
        let is_uac = matches!(self.role, DialogRole::Uac);
        self.route_set = super::utils::route_set_from_record_route(record_route, is_uac);
        self.route_frozen = true;
    }

    /// Schedules `other` to be locally BYE'd once this dialog's 2xx is
    /// sent, per an inbound REFER/Replaces (spec §4.4).
    pub fn schedule_replaces(&mut self, other: DialogId) {
        self.replaces_target = Some(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn uac_dialog() -> Dialog {
        Dialog::new_uac(
            "c1",
            uri("sip:alice@127.0.0.1"),
            uri("sip:bob@127.0.0.1"),
            "a1",
            uri("sip:alice@127.0.0.1:5060"),
        )
    }

    #[test]
    fn basic_call_reaches_established_with_expected_id() {
        let mut d = uac_dialog();
        d.on_send_invite(TransactionKey::new_branch("z9hG4bK1", Method::Invite)).unwrap();
        assert_eq!(d.state, DialogState::Trying);

        d.on_rx_provisional(Some("b1"), Some(&uri("sip:bob@127.0.0.1:5062")), &[])
            .unwrap();
        assert_eq!(d.state, DialogState::Early);
        assert_eq!(d.remote_tag, "b1");

        d.on_rx_2xx("b1", &uri("sip:bob@127.0.0.1:5062"), &[], 1).unwrap();
        assert_eq!(d.state, DialogState::Established);
        assert_eq!(d.id.to_string(), "c1:a1:b1");
        assert!(d.ack_owed.is_some());
    }

    #[test]
    fn cseq_allocation_is_monotonic_and_wraps_to_one() {
        let mut d = uac_dialog();
        assert_eq!(d.next_local_seq(), 1);
        assert_eq!(d.next_local_seq(), 2);
        d.local_seq = u32::MAX;
        assert_eq!(d.next_local_seq(), 1);
    }

    #[test]
    fn out_of_order_cseq_is_rejected() {
        let mut d = uac_dialog();
        d.accept_remote_seq(5).unwrap();
        assert!(d.accept_remote_seq(5).is_err());
        assert!(d.accept_remote_seq(3).is_err());
        d.accept_remote_seq(6).unwrap();
    }

    #[test]
    fn concurrent_reinvite_is_busy() {
        let mut d = uac_dialog();
        d.state = DialogState::Established;
        d.start_invite(TransactionKey::new_branch("z9hG4bK2", Method::Invite));
        assert!(matches!(d.guard_new_invite(), Err(DialogError::Busy)));
    }

    #[test]
    fn terminated_dialog_rejects_new_requests_unless_ack_owed() {
        let mut d = uac_dialog();
        d.force_terminate().unwrap();
        assert!(!d.accepts_outbound());
        d.ack_owed = Some(AckContext {
            cseq: 1,
            remote_target: uri("sip:bob@127.0.0.1:5062"),
        });
        assert!(d.accepts_outbound());
    }

    #[test]
    fn bye_then_final_response_terminates_exactly_once() {
        let mut d = uac_dialog();
        d.state = DialogState::Established;
        d.on_bye().unwrap();
        assert_eq!(d.state, DialogState::Terminating);
        d.on_bye_final().unwrap();
        assert_eq!(d.state, DialogState::Terminated);
        // A second absorption (e.g. a retransmitted final response) is a
        // harmless self-loop: the state-change notification only fires
        // on an actual `from != to` transition (invariant 5).
        d.on_bye_final().unwrap();
        assert_eq!(d.state, DialogState::Terminated);
    }
}
