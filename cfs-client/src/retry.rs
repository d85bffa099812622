//! Escalating backoff tables shared by the read and write engines.

use std::time::Duration;

/// Delay before retrying a transient master error (`LOCKED`/`EAGAIN`):
/// `1 ms → 100 ms → 500 ms`, then holds at 500 ms.
pub fn master_retry_delay(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::from_millis(1),
        1 => Duration::from_millis(100),
        _ => Duration::from_millis(500),
    }
}

/// Delay before retrying a chunk-server I/O error:
/// `1 ms + (try_count - 1) * 300 ms`, capped at 10 s. `try_count` is
/// 1-based, matching a request's own `try_count`.
pub fn chunk_server_retry_delay(try_count: u32) -> Duration {
    let millis = 1u64.saturating_add((try_count.saturating_sub(1) as u64).saturating_mul(300));
    Duration::from_millis(millis.min(10_000))
}

/// Delay before the next connection attempt to a chunk server:
/// `200 * 2^(n/2) ms` on even attempts, `300 * 2^(n/2) ms` on odd, up to
/// `MAX_CONNECT_ATTEMPTS`.
pub const MAX_CONNECT_ATTEMPTS: u32 = 10;

pub fn connect_retry_delay(attempt: u32) -> Duration {
    let exp = (attempt / 2).min(16); // guard against overflow on pathological inputs
    let base: u64 = if attempt % 2 == 0 { 200 } else { 300 };
    Duration::from_millis(base.saturating_mul(1u64 << exp))
}

/// On a server-reported "not done yet" status, retry after a fixed delay
/// *without* incrementing `try_count`. See DESIGN.md.
pub const NOT_DONE_RETRY_DELAY: Duration = Duration::from_millis(300);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_retry_delay_ramps_then_holds() {
        assert_eq!(master_retry_delay(0), Duration::from_millis(1));
        assert_eq!(master_retry_delay(1), Duration::from_millis(100));
        assert_eq!(master_retry_delay(2), Duration::from_millis(500));
        assert_eq!(master_retry_delay(10), Duration::from_millis(500));
    }

    #[test]
    fn chunk_server_retry_delay_ramps_and_caps() {
        assert_eq!(chunk_server_retry_delay(1), Duration::from_millis(1));
        assert_eq!(chunk_server_retry_delay(2), Duration::from_millis(301));
        assert_eq!(chunk_server_retry_delay(100), Duration::from_millis(10_000));
    }

    #[test]
    fn connect_retry_delay_alternates_even_and_odd() {
        assert_eq!(connect_retry_delay(0), Duration::from_millis(200));
        assert_eq!(connect_retry_delay(1), Duration::from_millis(300));
        assert_eq!(connect_retry_delay(2), Duration::from_millis(400));
        assert_eq!(connect_retry_delay(3), Duration::from_millis(600));
    }
}
