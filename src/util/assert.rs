/// Aborts with an internal-assertion message when `condition` does not hold.
///
/// Used for invariants whose violation means the local state can no longer be
/// trusted (for example an overlay that points at a batch the queue no longer
/// holds). These are never surfaced as `FirestoreError`s.
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Unconditionally aborts with an internal-assertion message.
#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message))
}

/// Formats the panic payload used by [`hard_assert`] and [`fail`].
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "firestore-sync-core ({}) INTERNAL ASSERTION FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED")]
    fn hard_assert_panics_on_false() {
        hard_assert(false, "target without key ordering");
    }

    #[test]
    fn hard_assert_passes_on_true() {
        hard_assert(true, "never shown");
    }

    #[test]
    fn assertion_error_carries_message() {
        let message = assertion_error("missing batch 7");
        assert!(message.contains("missing batch 7"));
        assert!(message.contains(env!("CARGO_PKG_VERSION")));
    }
}
