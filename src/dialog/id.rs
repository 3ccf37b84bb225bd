//! Canonical dialog identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical identifier for a dialog: `<call-id>:<local-tag>:<remote-tag>`.
///
/// `remote_tag` is empty while the dialog is in [`crate::dialog::DialogState::Init`]
/// or [`crate::dialog::DialogState::Trying`], before the peer's tag is known. The
/// registry re-keys a dialog's id via [`crate::registry::DialogRegistry::update_id`]
/// once the remote tag is learned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// An id with no remote tag yet, used while a dialog is Init/Trying.
    pub fn provisional(call_id: impl Into<String>, local_tag: impl Into<String>) -> Self {
        Self::new(call_id, local_tag, "")
    }

    pub fn has_remote_tag(&self) -> bool {
        !self.remote_tag.is_empty()
    }

    /// The unordered tag-pair key used by the registry's third index: a
    /// request arriving from the peer sees local/remote tags swapped
    /// relative to how this dialog recorded them, so the pair must be
    /// order-independent.
    pub fn tag_pair_key(&self) -> TagPairKey {
        TagPairKey::new(&self.call_id, &self.local_tag, &self.remote_tag)
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// An unordered `(call_id, tag_a, tag_b)` key: `(call_id, a, b)` and
/// `(call_id, b, a)` hash and compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagPairKey {
    call_id: String,
    tags: [String; 2],
}

impl TagPairKey {
    pub fn new(call_id: &str, tag_a: &str, tag_b: &str) -> Self {
        let mut tags = [tag_a.to_string(), tag_b.to_string()];
        tags.sort();
        Self {
            call_id: call_id.to_string(),
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_form_matches_spec() {
        let id = DialogId::new("c1", "a1", "b1");
        assert_eq!(id.to_string(), "c1:a1:b1");
    }

    #[test]
    fn tag_pair_key_is_order_independent() {
        let a = TagPairKey::new("c1", "a1", "b1");
        let b = TagPairKey::new("c1", "b1", "a1");
        assert_eq!(a, b);
    }

    #[test]
    fn tag_pair_key_distinguishes_call_id() {
        let a = TagPairKey::new("c1", "a1", "b1");
        let b = TagPairKey::new("c2", "a1", "b1");
        assert_ne!(a, b);
    }
}
