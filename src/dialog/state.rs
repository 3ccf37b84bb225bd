//! The dialog state machine (spec §4.1).

use serde::{Deserialize, Serialize};

/// A dialog's position in the RFC 3261 lifecycle.
///
/// Transitions are enforced by [`crate::dialog::Dialog`]'s event methods,
/// each of which calls [`is_legal_transition`] before committing a state
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Constructed; no INVITE sent yet (UAC) or no response chosen yet (UAS).
    Init,
    /// UAC sent INVITE and awaits any response; UAS received INVITE and has
    /// not yet sent a provisional carrying a To-tag.
    Trying,
    /// A 1xx (>100) response with To-tag has been sent or received.
    Early,
    /// A 2xx has been exchanged and acknowledged.
    Established,
    /// BYE has been sent or received; awaiting the final response/absorption.
    Terminating,
    /// The dialog is finished; no further signaling will occur.
    Terminated,
}

impl DialogState {
    /// Whether new outbound non-ACK requests may originate from this state.
    pub fn accepts_outbound_requests(self) -> bool {
        matches!(self, DialogState::Established)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DialogState::Terminated)
    }

    pub fn is_early_or_trying(self) -> bool {
        matches!(self, DialogState::Trying | DialogState::Early)
    }
}

/// Whether `to` is a legal destination state from `from`, per the
/// transition table in spec §4.1 (UAC perspective; UAS is symmetric
/// with send/receive swapped for the INVITE, which this table does not
/// distinguish since both sides pass through the same state values).
pub fn is_legal_transition(from: DialogState, to: DialogState) -> bool {
    use DialogState::*;
    if from == to {
        // rx_1xx_no_tag (Trying -> Trying) and 2xx retransmission are
        // legal self-loops; anything else re-entering the same state is
        // a caller bug, but harmless, so self-loops are always allowed.
        return true;
    }
    matches!(
        (from, to),
        (Init, Trying)
            | (Trying, Early)
            | (Trying, Established)
            | (Early, Established)
            | (Trying, Terminated)
            | (Early, Terminated)
            | (Init, Terminated)
            | (Established, Terminating)
            | (Terminating, Terminated)
            | (Established, Terminated) // 481/408 on an in-dialog request
    )
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DialogState::Init => "Init",
            DialogState::Trying => "Trying",
            DialogState::Early => "Early",
            DialogState::Established => "Established",
            DialogState::Terminating => "Terminating",
            DialogState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}
