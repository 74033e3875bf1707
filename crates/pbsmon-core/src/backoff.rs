/// Pure backoff policy for pass-level persistence retries.
///
/// SQLite write contention between the daemon and an on-demand
/// invocation resolves quickly, so the ladder stays short:
/// Attempt 1 retry: 100ms
/// Attempt 2 retry: 500ms
/// Attempt 3+: 2s (caller gives up after MAX_PERSIST_ATTEMPTS)
pub fn persist_backoff_ms(attempt: u32) -> u64 {
    match attempt {
        0 | 1 => 100,
        2 => 500,
        _ => 2_000,
    }
}

/// Attempts per pass before the pass is marked failed in its event.
pub const MAX_PERSIST_ATTEMPTS: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder() {
        assert_eq!(persist_backoff_ms(1), 100);
        assert_eq!(persist_backoff_ms(2), 500);
        assert_eq!(persist_backoff_ms(3), 2_000);
        assert_eq!(persist_backoff_ms(10), 2_000);
    }
}
