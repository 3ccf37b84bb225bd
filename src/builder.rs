//! In-dialog request construction (spec §4.3).
//!
//! Everything here is pure message assembly: given a [`Dialog`] and a
//! method, produce the `Request` RFC 3261 §12.2.1.1 says that method must
//! carry. State transitions and transaction dispatch are the caller's
//! concern ([`crate::ua::UserAgent`]); this module never mutates dialog
//! state beyond CSeq allocation.

use rvoip_sip_core::prelude::*;

use crate::dialog::{utils, Dialog, DialogRole};
use crate::errors::{DialogError, DialogResult};
use crate::options::ReqOption;
use crate::transaction::generate_branch;

const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Builds a generic in-dialog request (BYE, re-INVITE, UPDATE, INFO, ...),
/// allocating a fresh CSeq. Fails if the dialog does not currently accept
/// outbound requests (invariant 4: a Terminated dialog accepts nothing but
/// an owed ACK, which has its own [`build_ack`]).
pub fn build_request(dialog: &mut Dialog, method: Method, option: Option<&ReqOption>) -> DialogResult<Request> {
    if !dialog.accepts_outbound() {
        return Err(DialogError::invalid_state(dialog.state, "build_request"));
    }
    let seq = dialog.next_local_seq();
    Ok(assemble(dialog, method, seq, option))
}

/// Builds the initial (or re-)INVITE that moves a UAC dialog out of
/// `Init`/`Established`. Unlike [`build_request`] this does not gate on
/// `accepts_outbound`: a fresh dialog in `Init` has nothing to gate on
/// yet, and the re-INVITE `Busy` gate is [`crate::dialog::Dialog::guard_new_invite`]'s
/// job, checked by the caller before a transaction is even started.
pub fn build_invite(dialog: &mut Dialog, option: Option<&ReqOption>) -> Request {
    let seq = dialog.next_local_seq();
    assemble(dialog, Method::Invite, seq, option)
}

/// Builds the ACK for the 2xx recorded in `dialog.ack_owed` (invariant 4).
/// Reuses the INVITE's CSeq number with method ACK and targets the exact
/// Contact the 2xx carried, which may differ from `dialog.remote_target`
/// if a later target-refresh raced the ACK.
pub fn build_ack(dialog: &Dialog) -> DialogResult<Request> {
    let ack_context = dialog
        .ack_owed
        .as_ref()
        .ok_or_else(|| DialogError::internal("build_ack", "no 2xx is pending acknowledgement"))?;

    let request_uri = request_uri_for(&dialog.route_set, &ack_context.remote_target);
    let mut builder = RequestBuilder::new(Method::Ack, &request_uri.to_string())
        .map_err(|e| DialogError::internal("build_ack", e.to_string()))?
        .from("", &dialog.local_uri.to_string(), Some(&dialog.local_tag))
        .to("", &dialog.remote_uri.to_string(), Some(&dialog.remote_tag))
        .call_id(&dialog.call_id)
        .cseq(ack_context.cseq)
        .via(&dialog.local_target.to_string(), "UDP", Some(&generate_branch()))
        .max_forwards(DEFAULT_MAX_FORWARDS);

    for route in &dialog.route_set {
        builder = builder.route_uri(route.clone());
    }

    Ok(builder.build())
}

/// Builds the CANCEL for a pending INVITE. CANCEL matches the INVITE it
/// cancels exactly: same branch, same CSeq number, method CANCEL, and a
/// To header with no tag yet (the dialog has none if the INVITE is still
/// unanswered, spec §4.1 `guard_cancel`).
pub fn build_cancel(dialog: &Dialog, invite_branch: &str, invite_request_uri: &Uri) -> DialogResult<Request> {
    dialog.guard_cancel()?;
    let cseq = dialog.current_local_seq();

    let builder = RequestBuilder::new(Method::Cancel, &invite_request_uri.to_string())
        .map_err(|e| DialogError::internal("build_cancel", e.to_string()))?
        .from("", &dialog.local_uri.to_string(), Some(&dialog.local_tag))
        .to("", &dialog.remote_uri.to_string(), None)
        .call_id(&dialog.call_id)
        .cseq(cseq)
        .via(&dialog.local_target.to_string(), "UDP", Some(invite_branch))
        .max_forwards(DEFAULT_MAX_FORWARDS);

    Ok(builder.build())
}

fn assemble(dialog: &Dialog, method: Method, seq: u32, option: Option<&ReqOption>) -> Request {
    let request_uri = request_uri_for(&dialog.route_set, &dialog.remote_target);
    let branch = generate_branch();

    let mut builder = RequestBuilder::new(method, &request_uri.to_string())
        .expect("dialog route set/target always parse back to a valid request URI")
        .from("", &dialog.local_uri.to_string(), Some(&dialog.local_tag))
        .to("", &dialog.remote_uri.to_string(), Some(&dialog.remote_tag))
        .call_id(&dialog.call_id)
        .cseq(seq)
        .contact(&dialog.local_target.to_string(), None)
        .via(&dialog.local_target.to_string(), "UDP", Some(&branch))
        .max_forwards(DEFAULT_MAX_FORWARDS);

    for route in &dialog.route_set {
        builder = builder.route_uri(route.clone());
    }

    if let Some(option) = option {
        for header in &option.headers {
            builder = builder.header(TypedHeader::Other(
                HeaderName::Other(header.name.clone()),
                HeaderValue::Raw(header.value.clone().into_bytes()),
            ));
        }
        if let Some(body) = &option.body {
            builder = builder
                .header(TypedHeader::Other(
                    HeaderName::Other("Content-Type".to_string()),
                    HeaderValue::text(body.content_type.clone()),
                ))
                .body(body.bytes.clone());
        }
    }

    builder.build()
}

/// Reads back the branch `assemble`/`build_invite`/[`crate::refer::build_blind_transfer`]
/// etc. stamped onto a request's top Via, so the caller can key the
/// client transaction by the exact value the wire will carry instead of
/// generating a second, unrelated branch.
pub fn branch_of(request: &Request) -> String {
    request
        .first_via()
        .and_then(|via| via.branch().map(str::to_string))
        .expect("assemble/build_invite/build_refer always attach a Via with a branch")
}

/// RFC 3261 §12.2.1.1: the Request-URI is the dialog's remote target
/// unless the route set's first entry is a strict router, in which case
/// the first hop becomes the Request-URI and the real target is appended
/// to the end of the Route set instead (legacy strict-routing rewrite).
fn request_uri_for(route_set: &[Uri], remote_target: &Uri) -> Uri {
    if utils::first_hop_is_strict_router(route_set) {
        route_set[0].clone()
    } else {
        remote_target.clone()
    }
}

/// Applies the UAC-side route set to a request destined for the first
/// Route entry (or the Request-URI itself if the route set is empty),
/// returning the address the transport should actually send to. Loose
/// routing sends to the first Route URI's host/port; an empty route set
/// sends directly to the Request-URI.
pub fn next_hop(dialog: &Dialog, request: &Request) -> Uri {
    if utils::first_hop_is_strict_router(&dialog.route_set) {
        // Request-URI already is the strict router; the real target was
        // appended as the last Route entry by `assemble`.
        request.uri.clone()
    } else {
        dialog
            .route_set
            .first()
            .cloned()
            .unwrap_or_else(|| request.uri.clone())
    }
}

/// Whether `request.method` is a target-refresh method (spec §4.3): its
/// Contact header updates `remote_target` on receipt. INVITE, UPDATE and
/// re-INVITE-style SUBSCRIBE/REFER are target-refresh; BYE, CANCEL, ACK,
/// INFO and OPTIONS are not (RFC 3261 §12.2).
pub fn is_target_refresh(method: &Method) -> bool {
    matches!(method, Method::Invite | Method::Update | Method::Subscribe)
}

/// Determines this dialog's UAC/UAS role for the purposes of choosing
/// which side of a Record-Route list to reverse when freezing the route
/// set; re-exported here since the builder is the natural call site for
/// callers assembling a route set outside of [`Dialog`] itself.
pub fn is_uac(dialog: &Dialog) -> bool {
    matches!(dialog.role, DialogRole::Uac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::DialogState;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn established_dialog() -> Dialog {
        let mut d = Dialog::new_uac(
            "c1",
            uri("sip:alice@127.0.0.1"),
            uri("sip:bob@127.0.0.1"),
            "a1",
            uri("sip:alice@127.0.0.1:5060"),
        );
        d.remote_tag = "b1".to_string();
        d.state = DialogState::Established;
        d
    }

    #[test]
    fn bye_carries_dialog_identity_and_fresh_cseq() {
        let mut d = established_dialog();
        let request = build_request(&mut d, Method::Bye, None).unwrap();
        assert_eq!(request.method, Method::Bye);
        assert_eq!(request.uri.to_string(), "sip:bob@127.0.0.1");
    }

    #[test]
    fn terminated_dialog_rejects_generic_requests() {
        let mut d = established_dialog();
        d.force_terminate().unwrap();
        assert!(build_request(&mut d, Method::Bye, None).is_err());
    }

    #[test]
    fn strict_router_first_hop_becomes_request_uri() {
        let mut d = established_dialog();
        d.route_set = vec![uri("sip:proxy.example.com")];
        let request = build_request(&mut d, Method::Info, None).unwrap();
        assert_eq!(request.uri.to_string(), "sip:proxy.example.com");
    }

    #[test]
    fn loose_router_first_hop_keeps_remote_target_as_request_uri() {
        let mut d = established_dialog();
        d.route_set = vec![uri("sip:proxy.example.com;lr")];
        let request = build_request(&mut d, Method::Info, None).unwrap();
        assert_eq!(request.uri.to_string(), "sip:bob@127.0.0.1");
    }

    #[test]
    fn ack_uses_the_2xx_contact_not_current_remote_target() {
        let mut d = established_dialog();
        d.ack_owed = Some(crate::dialog::AckContext {
            cseq: 1,
            remote_target: uri("sip:bob@127.0.0.1:5062"),
        });
        let request = build_ack(&d).unwrap();
        assert_eq!(request.method, Method::Ack);
        assert_eq!(request.uri.to_string(), "sip:bob@127.0.0.1:5062");
    }
}
