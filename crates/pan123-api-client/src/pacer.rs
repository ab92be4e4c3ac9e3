//! Per-endpoint-class rate limiting.
//!
//! The service publishes distinct QPS ceilings for listing, upload-session,
//! slice-upload and auxiliary endpoints. Each class gets its own pacer: a
//! minimum inter-call sleep that stretches toward a 30 second ceiling when the
//! server throttles and decays exponentially back once calls succeed.

use std::time::Duration;

use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

/// Hard ceiling for the inter-call sleep after repeated throttling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacerKind {
    /// ~14 qps: file list v2, move, infos, user info.
    List,
    /// ~4 qps: create, delete, trash, list v1, download_info.
    Strict,
    /// ~5 qps: slice uploads.
    Upload,
    /// ~16 qps: upload_complete, get_upload_url, list_upload_parts,
    /// access_token.
    Download,
}

/// Maps an endpoint path to its pacer class. Unknown paths get the most
/// conservative budget.
pub fn classify(path: &str) -> PacerKind {
    if path.contains("/upload/v2/file/slice") {
        return PacerKind::Upload;
    }
    if path.contains("upload_complete")
        || path.contains("get_upload_url")
        || path.contains("list_upload_parts")
        || path.contains("access_token")
    {
        return PacerKind::Download;
    }
    if path.contains("/api/v2/file/list")
        || path.contains("/file/move")
        || path.contains("/file/infos")
        || path.contains("/user/info")
    {
        return PacerKind::List;
    }
    PacerKind::Strict
}

#[derive(Debug)]
struct PacerState {
    /// Earliest instant the next call may be dispatched.
    next_allowed: Instant,
    /// Current inter-call sleep; min_sleep when healthy.
    current_sleep: Duration,
}

/// Token-bucket-of-one pacer. `acquire` serialises callers and spaces
/// dispatches by `current_sleep`; throttle feedback widens the spacing and
/// successes decay it back toward `min_sleep`.
#[derive(Debug)]
pub struct Pacer {
    min_sleep: Duration,
    state: Mutex<PacerState>,
}

impl Pacer {
    pub fn new(min_sleep: Duration) -> Self {
        // A minimum sleep above the backoff ceiling would invert the clamp.
        let min_sleep = min_sleep.min(MAX_BACKOFF);
        Pacer {
            min_sleep,
            state: Mutex::new(PacerState {
                next_allowed: Instant::now(),
                current_sleep: min_sleep,
            }),
        }
    }

    /// Blocks until this class is allowed to dispatch another call.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let wait = state.next_allowed.saturating_duration_since(now);
            let dispatch_at = now + wait;
            state.next_allowed = dispatch_at + state.current_sleep;
            wait
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// Decays the inter-call sleep toward the minimum after a successful
    /// call.
    pub async fn on_success(&self) {
        let mut state = self.state.lock().await;
        let halved = state.current_sleep / 2;
        state.current_sleep = halved.max(self.min_sleep);
    }

    /// Widens the spacing after a 429 or throttle code. The next call waits
    /// out the full backoff before dispatching.
    pub async fn on_throttle(&self) {
        let mut state = self.state.lock().await;
        let doubled = state
            .current_sleep
            .saturating_mul(2)
            .clamp(self.min_sleep, MAX_BACKOFF);
        // A throttled server wants a real pause, not just wider spacing.
        state.current_sleep = doubled.max(MAX_BACKOFF);
        state.next_allowed = Instant::now() + state.current_sleep;
    }

    #[cfg(test)]
    async fn current_sleep(&self) -> Duration {
        self.state.lock().await.current_sleep
    }
}

/// The four pacers, one per endpoint class.
#[derive(Debug)]
pub struct PacerSet {
    list: Pacer,
    strict: Pacer,
    upload: Pacer,
    download: Pacer,
}

/// Minimum inter-call sleeps per class. Defaults follow the published QPS
/// ceilings with headroom.
#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    pub list_min_sleep: Duration,
    pub strict_min_sleep: Duration,
    pub upload_min_sleep: Duration,
    pub download_min_sleep: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        PacerConfig {
            list_min_sleep: Duration::from_millis(70),
            strict_min_sleep: Duration::from_millis(120),
            upload_min_sleep: Duration::from_millis(200),
            download_min_sleep: Duration::from_millis(60),
        }
    }
}

impl PacerSet {
    pub fn new(config: PacerConfig) -> Self {
        PacerSet {
            list: Pacer::new(config.list_min_sleep),
            strict: Pacer::new(config.strict_min_sleep),
            upload: Pacer::new(config.upload_min_sleep),
            download: Pacer::new(config.download_min_sleep),
        }
    }

    pub fn get(&self, kind: PacerKind) -> &Pacer {
        match kind {
            PacerKind::List => &self.list,
            PacerKind::Strict => &self.strict,
            PacerKind::Upload => &self.upload,
            PacerKind::Download => &self.download,
        }
    }

    pub fn for_path(&self, path: &str) -> &Pacer {
        self.get(classify(path))
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;
    use tokio::time::Instant;

    use super::*;

    #[test_case("/upload/v2/file/slice", PacerKind::Upload ; "slice upload")]
    #[test_case("/upload/v1/file/upload_complete", PacerKind::Download ; "upload complete")]
    #[test_case("/upload/v1/file/get_upload_url", PacerKind::Download ; "presigned url")]
    #[test_case("/upload/v1/file/list_upload_parts", PacerKind::Download ; "list parts")]
    #[test_case("/api/v1/access_token", PacerKind::Download ; "token exchange")]
    #[test_case("/api/v2/file/list", PacerKind::List ; "list v2")]
    #[test_case("/api/v1/file/move", PacerKind::List ; "move file")]
    #[test_case("/api/v1/file/infos", PacerKind::List ; "infos")]
    #[test_case("/api/v1/user/info", PacerKind::List ; "user info")]
    #[test_case("/api/v1/file/list", PacerKind::Strict ; "list v1")]
    #[test_case("/upload/v2/file/create", PacerKind::Strict ; "upload create")]
    #[test_case("/api/v1/file/trash", PacerKind::Strict ; "trash")]
    #[test_case("/api/v1/file/delete", PacerKind::Strict ; "delete")]
    #[test_case("/api/v1/file/download_info", PacerKind::Strict ; "download info")]
    #[test_case("/api/v1/video/transcode/list", PacerKind::Strict ; "transcode list")]
    #[test_case("/api/v9/not/a/thing", PacerKind::Strict ; "unknown falls through")]
    fn classification(path: &str, expected: PacerKind) {
        assert_eq!(classify(path), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_spaces_calls_by_min_sleep() {
        let pacer = Pacer::new(Duration::from_millis(100));
        let start = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        pacer.acquire().await;
        // First call is free, the next two wait 100ms each.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_rate_stays_within_budget() {
        let min = Duration::from_millis(70);
        let pacer = Pacer::new(min);
        let window = Duration::from_secs(1);
        let start = Instant::now();
        let mut dispatched = 0u32;
        loop {
            pacer.acquire().await;
            if start.elapsed() > window {
                break;
            }
            dispatched += 1;
        }
        let budget = (window.as_millis() / min.as_millis()) as u32;
        assert!(
            dispatched <= budget + 1,
            "dispatched {dispatched} > budget {budget} + 1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_backs_off_and_success_decays() {
        let pacer = Pacer::new(Duration::from_millis(100));
        pacer.on_throttle().await;
        assert_eq!(pacer.current_sleep().await, MAX_BACKOFF);

        let mut last = pacer.current_sleep().await;
        for _ in 0..16 {
            pacer.on_success().await;
            let now = pacer.current_sleep().await;
            assert!(now <= last, "decay must be monotonic");
            last = now;
        }
        assert_eq!(last, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_pacer_delays_next_acquire() {
        let pacer = Pacer::new(Duration::from_millis(10));
        pacer.acquire().await;
        pacer.on_throttle().await;
        let start = Instant::now();
        pacer.acquire().await;
        assert!(start.elapsed() >= MAX_BACKOFF);
    }
}
