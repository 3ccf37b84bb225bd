//! The REFER / Replaces subsystem (spec §4.7, RFC 3515 + RFC 3891).
//!
//! Blind transfer sends a bare Refer-To target; attended transfer embeds
//! a `Replaces` parameter naming the consultation dialog to be replaced.
//! Accepting an inbound REFER creates an implicit subscription to the
//! `refer` event package (RFC 3515 §2.4.4): progress of the triggered
//! call is reported back to the referrer as `message/sipfrag` NOTIFYs
//! until a final status is reached.

use rvoip_sip_core::prelude::*;

use crate::dialog::Dialog;
use crate::errors::{DialogError, DialogResult};
use crate::options::ReqOption;
use crate::transaction::generate_branch;

const DEFAULT_MAX_FORWARDS: u32 = 70;

/// The consultation dialog identity carried in an attended transfer's
/// `Replaces` parameter (RFC 3891 §4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacesTarget {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

/// A validated inbound REFER, handed to [`crate::dialog::ReferHandler`]
/// after the 202 has already been queued.
#[derive(Debug, Clone)]
pub struct IncomingRefer {
    pub target: Uri,
    pub replaces: Option<ReplacesTarget>,
}

/// Builds a blind-transfer REFER: Refer-To names the target with no
/// Replaces parameter.
pub fn build_blind_transfer(dialog: &mut Dialog, target_uri: &str, option: Option<&ReqOption>) -> DialogResult<Request> {
    build_refer(dialog, |b| b.refer_to_blind_transfer(target_uri), option)
}

/// Builds an attended-transfer REFER: Refer-To names the target with a
/// `?Replaces=` parameter identifying `consultation`, so the target
/// replaces that dialog instead of placing a fresh call.
pub fn build_attended_transfer(
    dialog: &mut Dialog,
    target_uri: &str,
    consultation: &ReplacesTarget,
    option: Option<&ReqOption>,
) -> DialogResult<Request> {
    build_refer(
        dialog,
        |b| {
            b.refer_to_attended_transfer(
                target_uri,
                consultation.call_id.clone(),
                consultation.to_tag.clone(),
                consultation.from_tag.clone(),
            )
        },
        option,
    )
}

fn build_refer(
    dialog: &mut Dialog,
    apply_refer_to: impl FnOnce(RequestBuilder) -> RequestBuilder,
    option: Option<&ReqOption>,
) -> DialogResult<Request> {
    if !dialog.accepts_outbound() {
        return Err(DialogError::invalid_state(dialog.state, "build_refer"));
    }
    let seq = dialog.next_local_seq();

    let mut builder = RequestBuilder::new(Method::Refer, &dialog.remote_target.to_string())
        .map_err(|e| DialogError::internal("build_refer", e.to_string()))?
        .from("", &dialog.local_uri.to_string(), Some(&dialog.local_tag))
        .to("", &dialog.remote_uri.to_string(), Some(&dialog.remote_tag))
        .call_id(&dialog.call_id)
        .cseq(seq)
        .contact(&dialog.local_target.to_string(), None)
        .via(&dialog.local_target.to_string(), "UDP", Some(&generate_branch()))
        .max_forwards(DEFAULT_MAX_FORWARDS);

    for route in &dialog.route_set {
        builder = builder.route_uri(route.clone());
    }
    builder = apply_refer_to(builder);

    if let Some(option) = option {
        for header in &option.headers {
            builder = builder.header(TypedHeader::Other(
                HeaderName::Other(header.name.clone()),
                HeaderValue::Raw(header.value.clone().into_bytes()),
            ));
        }
    }

    Ok(builder.build())
}

/// Validates an inbound REFER (spec §4.7): a missing or malformed
/// Refer-To is a 400, which the caller must send before this function is
/// even reached for the success path — this returns the error so
/// [`crate::ua::UserAgent`] can map it to that response.
pub fn parse_incoming_refer(request: &Request) -> DialogResult<IncomingRefer> {
    let refer_to = match request.header(&HeaderName::ReferTo) {
        Some(TypedHeader::ReferTo(refer_to)) => refer_to,
        _ => return Err(DialogError::malformed("REFER missing Refer-To header")),
    };

    let raw = refer_to.address().uri.to_string();
    let (target_part, replaces) = match raw.split_once('?') {
        Some((target, query)) => (target, parse_replaces_param(query)),
        None => (raw.as_str(), None),
    };

    let target = target_part
        .parse::<Uri>()
        .map_err(|_| DialogError::malformed("Refer-To target URI is invalid"))?;

    Ok(IncomingRefer { target, replaces })
}

fn parse_replaces_param(query: &str) -> Option<ReplacesTarget> {
    let value = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("Replaces="))?;
    let decoded = percent_decode(value);
    let mut parts = decoded.split(';');
    let call_id = parts.next()?.to_string();
    let mut to_tag = None;
    let mut from_tag = None;
    for part in parts {
        if let Some(v) = part.strip_prefix("to-tag=") {
            to_tag = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("from-tag=") {
            from_tag = Some(v.to_string());
        }
    }
    Some(ReplacesTarget {
        call_id,
        to_tag: to_tag?,
        from_tag: from_tag?,
    })
}

fn percent_decode(value: &str) -> String {
    value
        .replace("%3B", ";")
        .replace("%3D", "=")
        .replace("%40", "@")
        .replace("%25", "%")
}

/// Tracks the implicit `refer` event subscription created when a REFER is
/// accepted (RFC 3515 §2.4.4). One instance per accepted REFER; the
/// owning [`crate::ua::UserAgent`] drives it from the triggered call's
/// transaction events.
pub struct ReferSubscription {
    dialog_call_id: String,
    dialog_local_tag: String,
    dialog_remote_tag: String,
    notify_target: Uri,
    local_contact: Uri,
    notify_seq: u32,
    active: bool,
}

impl ReferSubscription {
    pub fn new(dialog: &Dialog) -> Self {
        Self {
            dialog_call_id: dialog.call_id.clone(),
            dialog_local_tag: dialog.local_tag.clone(),
            dialog_remote_tag: dialog.remote_tag.clone(),
            notify_target: dialog.remote_target.clone(),
            local_contact: dialog.local_target.clone(),
            notify_seq: 0,
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Builds the next NOTIFY carrying `status_line` (e.g. "SIP/2.0 100
    /// Trying", "SIP/2.0 200 OK") as a `message/sipfrag` body. A 2xx or
    /// >=300 final status terminates the subscription after this NOTIFY.
    pub fn notify(&mut self, status_line: &str, is_final: bool) -> DialogResult<Request> {
        if !self.active {
            return Err(DialogError::internal(
                "ReferSubscription::notify",
                "subscription already terminated",
            ));
        }
        self.notify_seq += 1;
        let subscription_state = if is_final { "terminated;reason=noresource" } else { "active" };

        let builder = RequestBuilder::new(Method::Notify, &self.notify_target.to_string())
            .map_err(|e| DialogError::internal("ReferSubscription::notify", e.to_string()))?
            .from("", "sip:anonymous@invalid", Some(&self.dialog_local_tag))
            .to("", "sip:anonymous@invalid", Some(&self.dialog_remote_tag))
            .call_id(&self.dialog_call_id)
            .cseq(self.notify_seq)
            .via(&self.local_contact.to_string(), "UDP", Some(&generate_branch()))
            .max_forwards(DEFAULT_MAX_FORWARDS)
            .header(TypedHeader::Other(
                HeaderName::Other("Event".to_string()),
                HeaderValue::text("refer"),
            ))
            .header(TypedHeader::Other(
                HeaderName::Other("Subscription-State".to_string()),
                HeaderValue::text(subscription_state),
            ))
            .header(TypedHeader::Other(
                HeaderName::Other("Content-Type".to_string()),
                HeaderValue::text("message/sipfrag"),
            ))
            .body(status_line.as_bytes().to_vec());

        if is_final {
            self.active = false;
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attended_transfer_refer_to_embeds_replaces() {
        let mut d = crate::dialog::Dialog::new_uac(
            "c1",
            "sip:alice@127.0.0.1".parse().unwrap(),
            "sip:bob@127.0.0.1".parse().unwrap(),
            "a1",
            "sip:alice@127.0.0.1:5060".parse().unwrap(),
        );
        d.remote_tag = "b1".to_string();
        d.state = crate::dialog::DialogState::Established;

        let consultation = ReplacesTarget {
            call_id: "consult-call-id".to_string(),
            to_tag: "tt".to_string(),
            from_tag: "ft".to_string(),
        };
        let request = build_attended_transfer(&mut d, "sip:carol@127.0.0.1", &consultation, None).unwrap();
        assert_eq!(request.method, Method::Refer);
        let refer_to = match request.header(&HeaderName::ReferTo) {
            Some(TypedHeader::ReferTo(r)) => r.address().uri.to_string(),
            _ => panic!("missing Refer-To"),
        };
        assert!(refer_to.contains("Replaces"));
    }

    #[test]
    fn incoming_refer_without_refer_to_is_malformed() {
        let request = RequestBuilder::new(Method::Refer, "sip:bob@127.0.0.1")
            .unwrap()
            .from("", "sip:alice@127.0.0.1", Some("a1"))
            .to("", "sip:bob@127.0.0.1", Some("b1"))
            .call_id("c1")
            .cseq(1)
            .build();
        assert!(parse_incoming_refer(&request).is_err());
    }

    #[test]
    fn replaces_param_round_trips_through_percent_decoding() {
        let query = "Replaces=abc%40host%3Bto-tag%3Dtt%3Bfrom-tag%3Dft";
        let replaces = parse_replaces_param(query).unwrap();
        assert_eq!(replaces.call_id, "abc@host");
        assert_eq!(replaces.to_tag, "tt");
        assert_eq!(replaces.from_tag, "ft");
    }

    #[test]
    fn notify_subscription_terminates_after_final_status() {
        let d = crate::dialog::Dialog::new_uac(
            "c1",
            "sip:alice@127.0.0.1".parse().unwrap(),
            "sip:bob@127.0.0.1".parse().unwrap(),
            "a1",
            "sip:alice@127.0.0.1:5060".parse().unwrap(),
        );
        let mut sub = ReferSubscription::new(&d);
        sub.notify("SIP/2.0 100 Trying", false).unwrap();
        assert!(sub.is_active());
        sub.notify("SIP/2.0 200 OK", true).unwrap();
        assert!(!sub.is_active());
        assert!(sub.notify("SIP/2.0 200 OK", true).is_err());
    }
}
