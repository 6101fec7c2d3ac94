use std::sync::Arc;

/// Shared millisecond clock. Components take one of these so tests can pin time.
pub type ClockFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wall clock backed by `current_unix_timestamp_ms`.
pub fn system_clock() -> ClockFn {
    Arc::new(current_unix_timestamp_ms)
}

/// Returns true when more than `ttl_ms` has elapsed since `issued_at_ms`.
///
/// A timestamp exactly `ttl_ms` old is still live; one millisecond later it is not.
pub fn is_older_than_ttl(issued_at_ms: u64, now_ms: u64, ttl_ms: u64) -> bool {
    now_ms.saturating_sub(issued_at_ms) > ttl_ms
}
