//! Candidate ordering policies.
//!
//! Policies are stateless transforms from a group's item slice to an
//! ordering, except round-robin which rotates from a process-wide counter.
//! Callers supply the RNG so orderings are reproducible in tests.

pub mod iterator;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::{GroupItem, GroupMode};

/// Owns the round-robin cursor. One instance per server; handed by
/// reference into request handling.
#[derive(Debug, Default)]
pub struct Balancers {
    round_robin: AtomicU64,
}

impl Balancers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order candidates for one request. The round-robin counter advances
    /// once per ordering request, not per attempt.
    pub fn candidates<R: Rng>(
        &self,
        mode: GroupMode,
        items: &[GroupItem],
        rng: &mut R,
    ) -> Vec<GroupItem> {
        if items.is_empty() {
            return Vec::new();
        }
        match mode {
            GroupMode::RoundRobin => self.round_robin(items),
            GroupMode::Random => {
                let mut out = items.to_vec();
                out.shuffle(rng);
                out
            }
            GroupMode::Failover => {
                let mut out = items.to_vec();
                out.sort_by_key(|item| item.priority);
                out
            }
            GroupMode::Weighted => weighted(items, rng),
        }
    }

    fn round_robin(&self, items: &[GroupItem]) -> Vec<GroupItem> {
        let n = items.len();
        let start = (self.round_robin.fetch_add(1, Ordering::Relaxed) + 1) as usize % n;
        (0..n).map(|i| items[(start + i) % n].clone()).collect()
    }
}

/// Weighted ordering: each item draws a score U(0,1)·w/Σw and the slice is
/// sorted by score descending, so heavier items tend to sort earlier while
/// every permutation stays reachable. Non-positive weights count as 1.
fn weighted<R: Rng>(items: &[GroupItem], rng: &mut R) -> Vec<GroupItem> {
    let total: i64 = items.iter().map(|item| i64::from(item.weight.max(1))).sum();
    let mut scored: Vec<(f64, GroupItem)> = items
        .iter()
        .map(|item| {
            let weight = f64::from(item.weight.max(1));
            let score = rng.random::<f64>() * weight / total as f64;
            (score, item.clone())
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, item)| item).collect()
}
