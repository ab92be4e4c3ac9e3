//! Retry classification and backoff schedule shared by the dispatch loop.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

/// Upper bound on attempts for a single logical call.
pub const RETRY_MAX: u32 = 10;

const MIN_SLEEP: Duration = Duration::from_millis(500);
const MAX_SLEEP: Duration = Duration::from_secs(10);

/// Whether a transport-level failure is worth retrying. Timeouts, connection
/// resets and other mid-flight I/O failures are transient; TLS setup and
/// request-construction failures are not.
pub fn should_retry_transport(error: &reqwest::Error) -> bool {
    if error.is_builder() {
        return false;
    }
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Whether an HTTP status is worth retrying. 429 is paced separately but
/// still counts as retryable here.
pub fn should_retry_status(status: StatusCode) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status.as_u16() >= 500 && status.as_u16() != 501
}

/// Exponential backoff with jitter. The base doubles per attempt and the
/// jitter spreads concurrent retries apart.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = MIN_SLEEP.saturating_mul(2u32.saturating_pow(attempt));
    let capped = base.min(MAX_SLEEP);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
}

/// Attempt budget for bulk transfers, inflated with the number of bytes
/// already moved so that a nearly finished multi-GB transfer is not abandoned
/// on the same budget as a fresh one.
pub fn transfer_attempt_budget(bytes_transferred: u64) -> u32 {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    if bytes_transferred < MIB {
        5
    } else if bytes_transferred < GIB {
        8
    } else {
        RETRY_MAX
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test]
    fn backoff_is_monotonic_until_the_ceiling() {
        let mut last = Duration::ZERO;
        for attempt in 0..8 {
            // Strip jitter by comparing against the deterministic base.
            let base = MIN_SLEEP.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_SLEEP);
            assert!(base >= last);
            let delay = backoff_delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 4 + Duration::from_millis(1));
            last = base;
        }
    }

    #[test_case(499, false)]
    #[test_case(500, true)]
    #[test_case(501, false)]
    #[test_case(502, true)]
    #[test_case(503, true)]
    #[test_case(429, true)]
    #[test_case(404, false)]
    #[test_case(400, false)]
    fn status_classification(status: u16, retry: bool) {
        assert_eq!(
            should_retry_status(StatusCode::from_u16(status).unwrap()),
            retry
        );
    }

    #[test_case(0, 5)]
    #[test_case(512 * 1024, 5)]
    #[test_case(1024 * 1024, 8)]
    #[test_case(900 * 1024 * 1024, 8)]
    #[test_case(2 * 1024 * 1024 * 1024, 10)]
    fn transfer_budget_grows_with_progress(bytes: u64, attempts: u32) {
        assert_eq!(transfer_attempt_budget(bytes), attempts);
    }
}
