//! Transfer-aware request timeouts.
//!
//! A fixed HTTP timeout either kills slow large uploads or lets small ones
//! hang forever. The adaptive value scales a base by the transfer type and
//! observed network quality, adds a size bonus, and clamps to sane bounds.

use std::time::Duration;

use crate::strategy::{Strategy, MIB};

const MIN_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const MAX_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);
/// Extra allowance per 50 MiB of payload.
const SIZE_BONUS_STEP: Duration = Duration::from_secs(30);

fn type_factor(strategy: Strategy) -> f64 {
    match strategy {
        Strategy::SingleStep => 0.8,
        Strategy::Streaming => 1.2,
        Strategy::Chunked { concurrent: false } => 1.5,
        Strategy::Chunked { concurrent: true } => 2.0,
    }
}

fn quality_factor(quality: f64) -> f64 {
    if quality < 0.3 {
        3.0
    } else if quality < 0.5 {
        2.0
    } else if quality < 0.7 {
        1.5
    } else {
        1.0
    }
}

pub fn adaptive_timeout(base: Duration, size: u64, strategy: Strategy, quality: f64) -> Duration {
    let scaled = base.mul_f64(type_factor(strategy) * quality_factor(quality));
    let bonus = SIZE_BONUS_STEP * (size / (50 * MIB)) as u32;
    (scaled + bonus).clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::strategy::GIB;

    #[test]
    fn floor_applies_to_small_fast_transfers() {
        let timeout = adaptive_timeout(Duration::from_secs(60), MIB, Strategy::SingleStep, 0.9);
        assert_eq!(timeout, MIN_TIMEOUT);
    }

    #[test]
    fn size_bonus_grows_with_payload() {
        let small = adaptive_timeout(Duration::from_secs(300), 100 * MIB, Strategy::Streaming, 0.9);
        let large = adaptive_timeout(Duration::from_secs(300), GIB, Strategy::Streaming, 0.9);
        assert!(large > small);
        // 1 GiB carries 20 bonus steps of 30s.
        assert_eq!(large - small, Duration::from_secs(30 * 18));
    }

    #[test]
    fn poor_network_triples_the_base() {
        let good = adaptive_timeout(
            Duration::from_secs(600),
            200 * MIB,
            Strategy::Chunked { concurrent: true },
            0.9,
        );
        let bad = adaptive_timeout(
            Duration::from_secs(600),
            200 * MIB,
            Strategy::Chunked { concurrent: true },
            0.2,
        );
        assert!(bad > good);
    }

    #[test]
    fn ceiling_is_four_hours() {
        let timeout = adaptive_timeout(
            Duration::from_secs(3600),
            200 * GIB,
            Strategy::Chunked { concurrent: true },
            0.1,
        );
        assert_eq!(timeout, MAX_TIMEOUT);
    }
}
