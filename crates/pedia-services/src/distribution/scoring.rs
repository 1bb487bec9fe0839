//! Per-peer transfer statistics and the composite score used to rank
//! holders and announcement targets.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pedia_core::PeerId;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::Serialize;

/// Weight of the newest sample in the running averages.
const EWMA_ALPHA: f64 = 0.3;
/// Throughput at which the speed component saturates (10 MiB/s).
const SPEED_CEILING: f64 = 10.0 * 1024.0 * 1024.0;
/// Every candidate keeps some chance of being picked.
const SCORE_FLOOR: f64 = 0.05;

#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    /// Bytes per second.
    pub avg_throughput: f64,
    pub successes: u32,
    pub attempts: u32,
    pub latency_ms: f64,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            avg_throughput: 0.0,
            successes: 0,
            attempts: 0,
            latency_ms: 1000.0,
        }
    }
}

impl PeerStats {
    pub fn reliability(&self) -> f64 {
        if self.attempts == 0 {
            0.5
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// `0.4·speed + 0.4·reliability + 0.2·latency`, each component in [0, 1].
    ///
    /// The latency term is `max(0, 1 - latency_ms / 1000)`, not
    /// `1 / latency`, so it stays within [0, 1] for sub-millisecond replies.
    pub fn score(&self) -> f64 {
        let speed = (self.avg_throughput / SPEED_CEILING).min(1.0);
        let latency = (1.0 - self.latency_ms / 1000.0).max(0.0);
        0.4 * speed + 0.4 * self.reliability() + 0.2 * latency
    }
}

#[derive(Clone, Default)]
pub struct PeerScores {
    stats: Arc<DashMap<PeerId, PeerStats>>,
}

impl PeerScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, peer: &PeerId, bytes: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(1e-3);
        let mut s = self.stats.entry(peer.clone()).or_default();
        let throughput = bytes as f64 / secs;
        let latency = elapsed.as_secs_f64() * 1000.0;
        if s.successes == 0 {
            s.avg_throughput = throughput;
            s.latency_ms = latency;
        } else {
            s.avg_throughput = EWMA_ALPHA * throughput + (1.0 - EWMA_ALPHA) * s.avg_throughput;
            s.latency_ms = EWMA_ALPHA * latency + (1.0 - EWMA_ALPHA) * s.latency_ms;
        }
        s.successes += 1;
        s.attempts += 1;
    }

    pub fn record_failure(&self, peer: &PeerId) {
        self.stats.entry(peer.clone()).or_default().attempts += 1;
    }

    pub fn score(&self, peer: &PeerId) -> f64 {
        self.stats
            .get(peer)
            .map(|s| s.score())
            .unwrap_or_else(|| PeerStats::default().score())
    }

    pub fn stats(&self, peer: &PeerId) -> PeerStats {
        self.stats.get(peer).map(|s| s.clone()).unwrap_or_default()
    }

    /// Peers sorted best first; ties by id for determinism.
    pub fn rank(&self, peers: impl IntoIterator<Item = PeerId>) -> Vec<PeerId> {
        let mut scored: Vec<(f64, PeerId)> =
            peers.into_iter().map(|p| (self.score(&p), p)).collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// Pick one peer with probability proportional to its score.
    pub fn pick_weighted<'a, R: Rng>(&self, pool: &'a [PeerId], rng: &mut R) -> Option<&'a PeerId> {
        if pool.len() <= 1 {
            return pool.first();
        }
        let weights: Vec<f64> = pool.iter().map(|p| self.score(p) + SCORE_FLOOR).collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => pool.get(dist.sample(rng)),
            Err(_) => pool.first(),
        }
    }
}

/// How many of `n` candidates a scored announcement goes to: the top 70%,
/// at most five, never fewer than three when that many exist.
pub fn announcement_width(n: usize) -> usize {
    if n <= 3 {
        return n;
    }
    let top = ((n as f64) * 0.7).ceil() as usize;
    top.min(5).max(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn unknown_peer_has_default_score() {
        let scores = PeerScores::new();
        // speed 0, reliability 0.5, latency 1000ms
        assert!((scores.score(&PeerId::from("x")) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn fast_reliable_peer_outranks_failing_one() {
        let scores = PeerScores::new();
        let good = PeerId::from("good");
        let bad = PeerId::from("bad");
        for _ in 0..3 {
            scores.record_success(&good, 1024 * 1024, Duration::from_millis(50));
            scores.record_failure(&bad);
        }
        assert!(scores.score(&good) > scores.score(&bad));
        assert_eq!(scores.rank([bad.clone(), good.clone()]), vec![good, bad]);
    }

    #[test]
    fn latency_term_is_bounded() {
        let instant = PeerStats {
            latency_ms: 0.0,
            ..PeerStats::default()
        };
        let slow = PeerStats {
            latency_ms: 5000.0,
            ..PeerStats::default()
        };
        // Reliability 0.5 for both, no throughput.
        assert!((instant.score() - 0.4).abs() < 1e-9);
        assert!((slow.score() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn reliability_tracks_attempts() {
        let scores = PeerScores::new();
        let p = PeerId::from("p");
        scores.record_success(&p, 10, Duration::from_millis(10));
        scores.record_failure(&p);
        assert_eq!(scores.stats(&p).reliability(), 0.5);
    }

    #[test]
    fn weighted_pick_never_excludes_sole_candidate() {
        let scores = PeerScores::new();
        let only = vec![PeerId::from("only")];
        for _ in 0..10 {
            scores.record_failure(&only[0]);
        }
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(scores.pick_weighted(&only, &mut rng), Some(&only[0]));
        assert_eq!(scores.pick_weighted(&[], &mut rng), None);
    }

    #[test]
    fn weighted_pick_prefers_better_peers() {
        let scores = PeerScores::new();
        let pool = vec![PeerId::from("fast"), PeerId::from("flaky")];
        for _ in 0..5 {
            scores.record_success(&pool[0], 8 * 1024 * 1024, Duration::from_millis(20));
            scores.record_failure(&pool[1]);
        }
        let mut rng = StdRng::seed_from_u64(1);
        let fast = (0..1000)
            .filter(|_| scores.pick_weighted(&pool, &mut rng) == Some(&pool[0]))
            .count();
        assert!(fast > 700, "fast picked {fast} times");
    }

    #[test]
    fn announcement_width_bounds() {
        assert_eq!(announcement_width(0), 0);
        assert_eq!(announcement_width(2), 2);
        assert_eq!(announcement_width(3), 3);
        assert_eq!(announcement_width(4), 3);
        assert_eq!(announcement_width(6), 5);
        assert_eq!(announcement_width(20), 5);
    }
}
