//! Transaction identity (spec §4.4, ambient stack §10.3).

use rvoip_sip_core::prelude::*;

/// Matches RFC 3261 §17.1.3/§17.2.3 transaction matching: branch plus
/// method (CANCEL and ACK match the branch of the request they cancel/ack
/// but are tracked as their own key here since this crate correlates by
/// exact key, not by branch alone) plus which side owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new_branch(branch: impl Into<String>, method: Method) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server: false,
        }
    }

    pub fn new_server(branch: impl Into<String>, method: Method) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server: true,
        }
    }

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{:?}:{}",
            self.branch,
            self.method,
            if self.is_server { "srv" } else { "cli" }
        )
    }
}

/// Generates an RFC 3261 §8.1.1.7 compliant branch parameter.
pub fn generate_branch() -> String {
    format!("z9hG4bK{:016x}", rand::random::<u64>())
}
