//! Small helpers shared by the dialog model, registry and request builder.

use rvoip_sip_core::prelude::*;

use crate::errors::{DialogError, DialogResult};

/// Extracts the URI carried in a `Contact` header value, used to populate
/// `remote_target`/`local_target` on target-refresh.
pub fn extract_uri_from_contact(contact: &Contact) -> DialogResult<Uri> {
    contact
        .addresses()
        .next()
        .map(|addr| addr.uri.clone())
        .ok_or_else(|| DialogError::malformed("Contact header has no address"))
}

/// RFC 3261 §12.1.1/§12.1.2: the route set is built from `Record-Route`
/// headers. For a UAC this is the reversed list (closest proxy first in the
/// response becomes last in the dialog's route set from the UAC's
/// perspective when building requests); for a UAS it is used as received.
pub fn route_set_from_record_route(record_route: &[Uri], is_uac: bool) -> Vec<Uri> {
    let mut route_set: Vec<Uri> = record_route.to_vec();
    if is_uac {
        route_set.reverse();
    }
    route_set
}

/// Whether the first element of a dialog's frozen route set identifies a
/// strict router (an RFC 2543-style proxy with no `lr` parameter), which
/// requires the legacy strict-routing Request-URI rewrite instead of the
/// default loose-routing behavior.
pub fn first_hop_is_strict_router(route_set: &[Uri]) -> bool {
    match route_set.first() {
        Some(uri) => !uri.parameters.iter().any(|p| matches!(p, Param::Lr)),
        None => false,
    }
}

/// Generates a fresh, RFC 3261-valid opaque tag (8 random hex chars,
/// matching the format used elsewhere in this codebase for From/To tags
/// and branch ids).
pub fn generate_tag() -> String {
    let n: u64 = rand::random();
    format!("{n:016x}")[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tags_are_eight_hex_chars() {
        let tag = generate_tag();
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
