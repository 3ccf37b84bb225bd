//! Small accessors for pulling dialog-relevant fields off parsed messages.
//!
//! Nothing here parses SIP syntax — that's `rvoip_sip_core`'s job — this
//! just centralizes the handful of header lookups the facade and inbound
//! dispatch need so they read the same way every time a response or
//! request is matched against a dialog.

use rvoip_sip_core::prelude::*;

use crate::dialog::utils::extract_uri_from_contact;

pub fn to_tag_of_response(response: &Response) -> Option<String> {
    response.to().and_then(|to| to.tag()).map(str::to_string)
}

pub fn from_tag_of_request(request: &Request) -> Option<String> {
    request.from().and_then(|from| from.tag()).map(str::to_string)
}

pub fn to_tag_of_request(request: &Request) -> Option<String> {
    request.to().and_then(|to| to.tag()).map(str::to_string)
}

pub fn contact_of_response(response: &Response) -> Option<Uri> {
    match response.header(&HeaderName::Contact) {
        Some(TypedHeader::Contact(contact)) => extract_uri_from_contact(contact).ok(),
        _ => None,
    }
}

pub fn contact_of_request(request: &Request) -> Option<Uri> {
    match request.header(&HeaderName::Contact) {
        Some(TypedHeader::Contact(contact)) => extract_uri_from_contact(contact).ok(),
        _ => None,
    }
}

pub fn record_route_of_response(response: &Response) -> Vec<Uri> {
    match response.header(&HeaderName::RecordRoute) {
        Some(TypedHeader::RecordRoute(rr)) => rr.iter().map(|entry| entry.uri().clone()).collect(),
        _ => Vec::new(),
    }
}

pub fn record_route_of_request(request: &Request) -> Vec<Uri> {
    match request.header(&HeaderName::RecordRoute) {
        Some(TypedHeader::RecordRoute(rr)) => rr.iter().map(|entry| entry.uri().clone()).collect(),
        _ => Vec::new(),
    }
}

pub fn cseq_of_request(request: &Request) -> Option<u32> {
    request.cseq().map(|c| c.sequence())
}

pub fn cseq_of_response(response: &Response) -> Option<u32> {
    response.cseq().map(|c| c.sequence())
}

pub fn call_id_of_request(request: &Request) -> Option<String> {
    request.call_id().map(|id| id.to_string())
}

pub fn call_id_of_response(response: &Response) -> Option<String> {
    response.call_id().map(|id| id.to_string())
}

/// The bare address-of-record a `From`/`To` header carries, with any
/// display name and tag stripped (used to seed `Dialog::new_uas`'s
/// `remote_uri`, which is identity, not routing, information).
pub fn from_uri_of_request(request: &Request) -> Option<Uri> {
    request.from().map(|from| from.address().uri().clone())
}

pub fn to_uri_of_request(request: &Request) -> Option<Uri> {
    request.to().map(|to| to.address().uri().clone())
}

/// A `message/sipfrag`-style status line for a response, e.g. `SIP/2.0 180
/// Ringing`, as carried in a REFER subscription NOTIFY body (RFC 3515 §2.4.4).
pub fn status_line_of(response: &Response) -> String {
    format!("SIP/2.0 {} {}", response.status.as_u16(), response.status.reason_phrase())
}

/// Parses a `Replaces: call-id;to-tag=T;from-tag=F` header, distinct from
/// the `?Replaces=` query-parameter form a REFER's Refer-To carries (that
/// one is handled by [`crate::refer::parse_incoming_refer`]).
pub fn replaces_header_of_request(request: &Request) -> Option<crate::refer::ReplacesTarget> {
    let raw = request.get_header_value(&HeaderName::Other("Replaces".to_string()))?;
    let mut parts = raw.split(';');
    let call_id = parts.next()?.trim().to_string();
    let mut to_tag = None;
    let mut from_tag = None;
    for part in parts {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("to-tag=") {
            to_tag = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("from-tag=") {
            from_tag = Some(v.to_string());
        }
    }
    Some(crate::refer::ReplacesTarget {
        call_id,
        to_tag: to_tag?,
        from_tag: from_tag?,
    })
}
