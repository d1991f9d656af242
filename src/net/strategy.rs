//! Peer-selection strategies used by the request scheduler to pick which
//! online peer(s) to target for a given request (§4.6).

use crate::net::types::NodeIdentity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A candidate peer as seen by a strategy: just enough to rank it.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub identity: NodeIdentity,
    pub trust_score: i32,
}

/// How the scheduler picks among several online peers for a new request.
pub enum RequestStrategy {
    /// Uniformly random among candidates.
    Random,
    /// The candidate with the highest trust score; ties broken by the
    /// first one encountered, matching the teacher's stable-argmax scan.
    BestScore,
    /// Cycles through candidates in order, remembering position per caller.
    RoundRobin(RoundRobinState),
}

#[derive(Default)]
pub struct RoundRobinState {
    cursor: AtomicUsize,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl RequestStrategy {
    /// Select one candidate, or `None` if the list is empty.
    pub fn select(&self, candidates: &[Candidate]) -> Option<NodeIdentity> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            RequestStrategy::Random => {
                let idx = rand::random::<usize>() % candidates.len();
                Some(candidates[idx].identity)
            }
            RequestStrategy::BestScore => candidates
                .iter()
                .fold(None::<Candidate>, |best, c| match best {
                    Some(b) if b.trust_score >= c.trust_score => Some(b),
                    _ => Some(*c),
                })
                .map(|c| c.identity),
            RequestStrategy::RoundRobin(state) => {
                let idx = state.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[idx].identity)
            }
        }
    }
}

/// Weighted random selection over a peer-trust map, used by `PeerDB` to
/// choose which peer to dial next. Non-negative scores grow linearly up to
/// a cap, modelling the teacher's `AddrMan` bucket-probability curve
/// without the bucket mechanism itself (peer count here is small enough
/// for linear scan). A negative ("bad") score is floored at
/// `bad_peer_rehabilitation_chance` rather than driven to zero, so a
/// clamped-bad peer still has the configured non-zero chance of being
/// picked (§4.1).
pub fn trust_weight(score: i32, bad_peer_rehabilitation_chance: f64) -> f64 {
    if score < 0 {
        bad_peer_rehabilitation_chance.max(0.0)
    } else {
        1.0 + (score.min(10) as f64) / 10.0
    }
}

/// Picks a random key from `weights` proportional to its weight, returning
/// `None` if the map is empty or all weights are zero.
pub fn weighted_choice<K: Copy + Eq + std::hash::Hash>(weights: &HashMap<K, f64>) -> Option<K> {
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        return None;
    }
    let mut roll = rand::random::<f64>() * total;
    for (k, w) in weights {
        if roll < *w {
            return Some(*k);
        }
        roll -= w;
    }
    weights.keys().next().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: u8, score: i32) -> Candidate {
        Candidate {
            identity: NodeIdentity([id; 16]),
            trust_score: score,
        }
    }

    #[test]
    fn best_score_picks_highest_trust() {
        let strat = RequestStrategy::BestScore;
        let candidates = vec![cand(1, -5), cand(2, 9), cand(3, 3)];
        assert_eq!(strat.select(&candidates), Some(NodeIdentity([2; 16])));
    }

    #[test]
    fn best_score_ties_prefer_first() {
        let strat = RequestStrategy::BestScore;
        let candidates = vec![cand(1, 5), cand(2, 5)];
        assert_eq!(strat.select(&candidates), Some(NodeIdentity([1; 16])));
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let strat = RequestStrategy::RoundRobin(RoundRobinState::new());
        let candidates = vec![cand(1, 0), cand(2, 0), cand(3, 0)];
        let picks: Vec<_> = (0..4).map(|_| strat.select(&candidates).unwrap()).collect();
        assert_eq!(picks[0], NodeIdentity([1; 16]));
        assert_eq!(picks[1], NodeIdentity([2; 16]));
        assert_eq!(picks[2], NodeIdentity([3; 16]));
        assert_eq!(picks[3], NodeIdentity([1; 16]));
    }

    #[test]
    fn empty_candidates_select_none() {
        assert_eq!(RequestStrategy::Random.select(&[]), None);
    }

    #[test]
    fn trust_weight_increases_with_score() {
        assert!(trust_weight(10, 0.1) > trust_weight(0, 0.1));
        assert!(trust_weight(0, 0.1) > trust_weight(-10, 0.1));
    }

    #[test]
    fn trust_weight_floors_bad_scores_at_the_rehabilitation_chance() {
        assert_eq!(trust_weight(-1, 0.1), 0.1);
        assert_eq!(trust_weight(-10, 0.25), 0.25);
    }
}
