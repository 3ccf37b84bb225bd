//! Glare (simultaneous re-INVITE) backoff (spec §4.1, RFC 3261 §14.1,
//! scenario E).
//!
//! When both sides of an Established dialog attempt a re-INVITE at once,
//! each rejects the other with 491 and one side must retry first. RFC
//! 3261 breaks the tie by Call-ID, but Call-ID is identical on both
//! sides of a single dialog, so this crate compares the dialog's own
//! (local-tag, remote-tag) pair instead — every party computes the same
//! two tags and they can never be equal to each other, giving the same
//! deterministic ordering RFC 3261 intends without a shared Call-ID to
//! sort by. The side whose tag sorts higher retries first, after a short
//! random delay; the other waits a shorter window so the higher side's
//! retry always has a chance to land first.

use std::time::Duration;

use rand::Rng;

/// Whether `local_tag` is the "higher" side of the glare tie-break.
pub fn is_local_higher(local_tag: &str, remote_tag: &str) -> bool {
    local_tag > remote_tag
}

/// The random backoff window before retrying a glared re-INVITE: 2.1-4s
/// for the higher tag, 0-2s for the lower one.
pub fn backoff_delay(local_tag: &str, remote_tag: &str) -> Duration {
    let mut rng = rand::thread_rng();
    if is_local_higher(local_tag, remote_tag) {
        Duration::from_millis(rng.gen_range(2_100..=4_000))
    } else {
        Duration::from_millis(rng.gen_range(0..=2_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_call_id_is_identified_correctly() {
        assert!(is_local_higher("zzz", "aaa"));
        assert!(!is_local_higher("aaa", "zzz"));
    }

    #[test]
    fn backoff_window_matches_role() {
        for _ in 0..50 {
            let higher = backoff_delay("zzz", "aaa");
            assert!(higher >= Duration::from_millis(2_100) && higher <= Duration::from_secs(4));

            let lower = backoff_delay("aaa", "zzz");
            assert!(lower <= Duration::from_secs(2));
        }
    }
}
