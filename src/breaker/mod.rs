//! Sharded per-(channel, model) circuit breakers.
//!
//! One cell per breaker key, lazily created, sharded by a stable FNV-1a
//! hash. Shards take an RwLock for map access; each cell serializes its
//! state transitions behind its own mutex. The half-open probe claim is a
//! compare-and-swap on an atomic flag so snapshot readers observe a
//! coherent probe-in-flight value without the cell mutex.

pub mod config;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::model::{CircuitBreakerConfig, CircuitBreakerState, GroupItem};

const SHARD_COUNT: usize = 64;
const MAX_REASON_BYTES: usize = 512;

/// What the manager decided for one acquire or record call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Disabled,
    ClosedAllow,
    SkipOpen,
    ProbeAllowed,
    ProbeDenied,
    RecordFailure,
    ProbeFailed,
    AllOpen,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Disabled => "disabled",
            Decision::ClosedAllow => "closed_allow",
            Decision::SkipOpen => "skip_open",
            Decision::ProbeAllowed => "probe_allowed",
            Decision::ProbeDenied => "probe_denied",
            Decision::RecordFailure => "record_failure",
            Decision::ProbeFailed => "probe_failed",
            Decision::AllOpen => "all_open",
        }
    }
}

/// Result of [`BreakerManager::acquire`]. Must be passed back into the
/// matching record call so probe ownership is settled correctly.
#[derive(Clone, Debug)]
pub struct AttemptAcquire {
    pub key: String,
    pub allowed: bool,
    pub decision: Decision,
    pub state_before: CircuitBreakerState,
    pub state_after: CircuitBreakerState,
    pub trip_count: u32,
    pub open_until_ms: u64,
    pub probe_granted: bool,
    pub probe_in_flight: bool,
}

impl AttemptAcquire {
    /// Pass-through acquire used when the breaker is disabled.
    fn disabled(key: &str) -> Self {
        Self {
            key: key.to_string(),
            allowed: true,
            decision: Decision::Disabled,
            state_before: CircuitBreakerState::Closed,
            state_after: CircuitBreakerState::Closed,
            trip_count: 0,
            open_until_ms: 0,
            probe_granted: false,
            probe_in_flight: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordResult {
    pub decision: Decision,
    pub state_after: CircuitBreakerState,
    pub trip_count: u32,
    pub open_until_ms: u64,
    pub probe_in_flight: bool,
}

/// Non-destructive view of one cell.
#[derive(Clone, Debug)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub trip_count: u32,
    pub open_until_ms: u64,
    pub last_failure_at_ms: u64,
    pub last_failure_reason: String,
    pub last_trip_at_ms: u64,
    pub probe_in_flight: bool,
}

impl BreakerSnapshot {
    fn closed(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            trip_count: 0,
            open_until_ms: 0,
            last_failure_at_ms: 0,
            last_failure_reason: String::new(),
            last_trip_at_ms: 0,
            probe_in_flight: false,
        }
    }
}

#[derive(Debug, Default)]
struct CellState {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    trip_count: u32,
    open_until_ms: u64,
    last_failure_at_ms: u64,
    last_failure_reason: String,
    last_trip_at_ms: u64,
}

#[derive(Debug, Default)]
struct Cell {
    state: Mutex<CellState>,
    probe_in_flight: AtomicBool,
}

impl Cell {
    fn claim_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    fn probe_in_flight(&self) -> bool {
        self.probe_in_flight.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Shard {
    cells: RwLock<HashMap<String, Arc<Cell>>>,
}

pub struct BreakerManager {
    shards: Vec<Shard>,
}

impl Default for BreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// `"<channel-id>:<trimmed-model-name>"`.
pub fn build_key(channel_id: i64, model_name: &str) -> String {
    format!("{channel_id}:{}", model_name.trim())
}

impl BreakerManager {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.shards[fnv1a_32(key.as_bytes()) as usize % SHARD_COUNT]
    }

    fn cell(&self, key: &str) -> Option<Arc<Cell>> {
        let shard = self.shard(key);
        let cells = shard.cells.read().unwrap_or_else(|err| err.into_inner());
        cells.get(key).cloned()
    }

    fn cell_or_create(&self, key: &str) -> Arc<Cell> {
        if let Some(cell) = self.cell(key) {
            return cell;
        }
        let shard = self.shard(key);
        let mut cells = shard.cells.write().unwrap_or_else(|err| err.into_inner());
        cells.entry(key.to_string()).or_default().clone()
    }

    /// Drop candidates whose breaker is open (or half-open with a probe in
    /// flight) at `now_ms`, and report the earliest instant at which any
    /// skipped candidate becomes probe-eligible. Pure filter: no state
    /// mutates and the result only depends on the cell snapshots.
    pub fn filter_available(
        &self,
        items: &[GroupItem],
        now_ms: u64,
        cfg: &CircuitBreakerConfig,
    ) -> (Vec<GroupItem>, Option<u64>) {
        if !cfg.enabled {
            return (items.to_vec(), None);
        }

        let mut filtered = Vec::with_capacity(items.len());
        let mut earliest: Option<u64> = None;
        for item in items {
            let snap = self.snapshot(&build_key(item.channel_id, &item.model_name));
            match snap.state {
                CircuitBreakerState::Open if now_ms < snap.open_until_ms => {
                    earliest = Some(match earliest {
                        Some(at) => at.min(snap.open_until_ms),
                        None => snap.open_until_ms,
                    });
                    continue;
                }
                CircuitBreakerState::HalfOpen if snap.probe_in_flight => {
                    // No known deadline once half-open; suggest a short retry.
                    let retry_at = if snap.open_until_ms > now_ms {
                        snap.open_until_ms
                    } else {
                        now_ms + 1_000
                    };
                    earliest = Some(match earliest {
                        Some(at) => at.min(retry_at),
                        None => retry_at,
                    });
                    continue;
                }
                _ => {}
            }
            filtered.push(item.clone());
        }
        (filtered, earliest)
    }

    /// Admission decision for one attempt. At most one caller per
    /// half-open window observes `probe_granted = true` until a matching
    /// record call releases the probe.
    pub fn acquire(&self, key: &str, now_ms: u64, cfg: &CircuitBreakerConfig) -> AttemptAcquire {
        if !cfg.enabled {
            return AttemptAcquire::disabled(key);
        }

        let cell = self.cell_or_create(key);
        let mut state = cell.state.lock().unwrap_or_else(|err| err.into_inner());

        let mut result = AttemptAcquire {
            key: key.to_string(),
            allowed: false,
            decision: Decision::SkipOpen,
            state_before: state.state,
            state_after: state.state,
            trip_count: state.trip_count,
            open_until_ms: state.open_until_ms,
            probe_granted: false,
            probe_in_flight: false,
        };

        match state.state {
            CircuitBreakerState::Closed => {
                result.allowed = true;
                result.decision = Decision::ClosedAllow;
            }
            CircuitBreakerState::Open => {
                if now_ms < state.open_until_ms {
                    return result;
                }
                if cell.claim_probe() {
                    state.state = CircuitBreakerState::HalfOpen;
                    result.allowed = true;
                    result.decision = Decision::ProbeAllowed;
                    result.state_after = state.state;
                    result.probe_granted = true;
                }
                if !result.probe_granted {
                    result.decision = Decision::ProbeDenied;
                }
                result.probe_in_flight = true;
            }
            CircuitBreakerState::HalfOpen => {
                if cell.claim_probe() {
                    result.allowed = true;
                    result.decision = Decision::ProbeAllowed;
                    result.probe_granted = true;
                } else {
                    result.decision = Decision::ProbeDenied;
                }
                result.probe_in_flight = true;
            }
        }
        result
    }

    /// Settle a successful forward. A granted probe (or a half-open cell)
    /// closes; consecutive failures reset. The trip count survives so
    /// backoff history is kept until decay erodes it.
    pub fn record_success(
        &self,
        key: &str,
        acquire: &AttemptAcquire,
        cfg: &CircuitBreakerConfig,
        _now_ms: u64,
    ) -> RecordResult {
        let cell = self.cell_or_create(key);
        let mut state = cell.state.lock().unwrap_or_else(|err| err.into_inner());

        if !cfg.enabled {
            cell.release_probe();
            return record_result(&cell, &state, Decision::Disabled);
        }

        if acquire.probe_granted || state.state == CircuitBreakerState::HalfOpen {
            if state.state != CircuitBreakerState::Closed {
                tracing::info!(key, "circuit breaker closed after successful probe");
            }
            state.state = CircuitBreakerState::Closed;
        }
        state.consecutive_failures = 0;
        cell.release_probe();
        record_result(&cell, &state, acquire.decision)
    }

    /// Settle a trippable failure: decay first, then count, then trip when
    /// the threshold is reached or a probe was in play.
    pub fn record_failure(
        &self,
        key: &str,
        reason: &str,
        acquire: &AttemptAcquire,
        cfg: &CircuitBreakerConfig,
        now_ms: u64,
    ) -> RecordResult {
        let cell = self.cell_or_create(key);
        let mut state = cell.state.lock().unwrap_or_else(|err| err.into_inner());

        apply_decay(&mut state, now_ms, cfg.decay_window_ms);
        state.last_failure_at_ms = now_ms;
        state.last_failure_reason = truncate_reason(reason);
        state.consecutive_failures += 1;

        let should_trip = state.consecutive_failures >= cfg.failure_threshold
            || acquire.probe_granted
            || state.state == CircuitBreakerState::HalfOpen;

        let mut decision = Decision::RecordFailure;
        if should_trip {
            state.trip_count += 1;
            let cooldown = cooldown_for_trip(state.trip_count, cfg);
            state.open_until_ms = now_ms + cooldown;
            state.state = CircuitBreakerState::Open;
            state.last_trip_at_ms = now_ms;
            state.consecutive_failures = 0;
            if acquire.probe_granted || acquire.state_before == CircuitBreakerState::HalfOpen {
                decision = Decision::ProbeFailed;
            }
            tracing::warn!(
                key,
                trip_count = state.trip_count,
                cooldown_ms = cooldown,
                "circuit breaker tripped"
            );
        }
        cell.release_probe();
        record_result(&cell, &state, decision)
    }

    /// Settle a retryable-but-not-trippable failure (HTTP 429). The probe
    /// is released and a half-open cell closes; the trip count is left
    /// untouched.
    pub fn record_non_trippable(
        &self,
        key: &str,
        acquire: &AttemptAcquire,
        cfg: &CircuitBreakerConfig,
    ) -> RecordResult {
        let cell = self.cell_or_create(key);
        let mut state = cell.state.lock().unwrap_or_else(|err| err.into_inner());

        cell.release_probe();
        if cfg.enabled && (acquire.probe_granted || state.state == CircuitBreakerState::HalfOpen) {
            state.state = CircuitBreakerState::Closed;
            state.consecutive_failures = 0;
        }
        record_result(&cell, &state, acquire.decision)
    }

    pub fn snapshot(&self, key: &str) -> BreakerSnapshot {
        let Some(cell) = self.cell(key) else {
            return BreakerSnapshot::closed(key);
        };
        let state = cell.state.lock().unwrap_or_else(|err| err.into_inner());
        BreakerSnapshot {
            key: key.to_string(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            trip_count: state.trip_count,
            open_until_ms: state.open_until_ms,
            last_failure_at_ms: state.last_failure_at_ms,
            last_failure_reason: state.last_failure_reason.clone(),
            last_trip_at_ms: state.last_trip_at_ms,
            probe_in_flight: cell.probe_in_flight(),
        }
    }

    /// Delete every cell belonging to a channel; returns the removed keys.
    pub fn reset_channel(&self, channel_id: i64) -> (usize, Vec<String>) {
        let prefix = format!("{channel_id}:");
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut cells = shard.cells.write().unwrap_or_else(|err| err.into_inner());
            cells.retain(|key, _| {
                if key.starts_with(&prefix) {
                    removed.push(key.clone());
                    false
                } else {
                    true
                }
            });
        }
        (removed.len(), removed)
    }

    pub fn reset_key(&self, key: &str) -> bool {
        let shard = self.shard(key);
        let mut cells = shard.cells.write().unwrap_or_else(|err| err.into_inner());
        cells.remove(key).is_some()
    }
}

fn record_result(cell: &Cell, state: &CellState, decision: Decision) -> RecordResult {
    RecordResult {
        decision,
        state_after: state.state,
        trip_count: state.trip_count,
        open_until_ms: state.open_until_ms,
        probe_in_flight: cell.probe_in_flight(),
    }
}

/// A cell that has been stable for whole decay windows since its last trip
/// sheds one trip per elapsed window before the new failure is counted.
fn apply_decay(state: &mut CellState, now_ms: u64, decay_window_ms: u64) {
    if state.trip_count == 0 || state.last_trip_at_ms == 0 || decay_window_ms == 0 {
        return;
    }
    let steps = now_ms.saturating_sub(state.last_trip_at_ms) / decay_window_ms;
    if steps == 0 {
        return;
    }
    state.trip_count = state.trip_count.saturating_sub(steps.min(u64::from(u32::MAX)) as u32);
}

/// `min(base · backoff^(n−1), max) · uniform(jitter_min, jitter_max)`,
/// clamped to at least one millisecond.
fn cooldown_for_trip(trip_count: u32, cfg: &CircuitBreakerConfig) -> u64 {
    let n = trip_count.max(1);
    let base = cfg.base_cooldown_ms as f64;
    let max = cfg.max_cooldown_ms as f64;
    let mut cooldown = base * cfg.backoff_factor.powf(f64::from(n - 1));
    if cooldown > max {
        cooldown = max;
    }
    let mut jitter = if cfg.jitter_max > cfg.jitter_min {
        rand::rng().random_range(cfg.jitter_min..=cfg.jitter_max)
    } else {
        cfg.jitter_min
    };
    if jitter < 0.0 {
        jitter = 0.0;
    }
    cooldown *= jitter;
    if cooldown < 1.0 {
        cooldown = 1.0;
    }
    cooldown as u64
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Truncate to 512 bytes on a char boundary, after trimming whitespace.
fn truncate_reason(reason: &str) -> String {
    let reason = reason.trim();
    if reason.len() <= MAX_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_REASON_BYTES;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
