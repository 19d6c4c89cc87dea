//! Per-request candidate iterator: policy ordering with the sticky channel
//! promoted to the front, a cursor, and the append-only attempt trail that
//! ends up in the relay log.

use std::time::Instant;

use rand::Rng;

use crate::balancer::session::SessionEntry;
use crate::balancer::Balancers;
use crate::breaker::{AttemptAcquire, RecordResult};
use crate::error::RelayError;
use crate::model::{AttemptStatus, ChannelAttempt, GroupItem, GroupMode};
use crate::utils::clock::format_rfc3339_millis;

pub struct CandidateIterator {
    candidates: Vec<GroupItem>,
    cursor: isize,
    sticky_index: isize,
    round: u32,
    count: u32,
    attempts: Vec<ChannelAttempt>,
}

impl CandidateIterator {
    /// Build the ordering for one round. `items` are the breaker-filtered
    /// group items; when a live sticky entry matches a candidate channel it
    /// is moved to position 0 and the displaced prefix shifts right by one.
    pub fn new<R: Rng>(
        balancers: &Balancers,
        mode: GroupMode,
        items: &[GroupItem],
        sticky: Option<&SessionEntry>,
        round: u32,
        rng: &mut R,
    ) -> Self {
        let mut candidates = balancers.candidates(mode, items, rng);

        let mut sticky_index = -1;
        if let Some(sticky) = sticky {
            if let Some(pos) = candidates
                .iter()
                .position(|item| item.channel_id == sticky.channel_id)
            {
                candidates[..=pos].rotate_right(1);
                sticky_index = 0;
            }
        }

        Self {
            candidates,
            cursor: -1,
            sticky_index,
            round,
            count: 0,
            attempts: Vec::new(),
        }
    }

    pub fn advance(&mut self) -> bool {
        self.cursor += 1;
        (self.cursor as usize) < self.candidates.len()
    }

    pub fn current(&self) -> &GroupItem {
        &self.candidates[self.cursor as usize]
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky_index >= 0 && self.cursor == self.sticky_index
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn next_attempt(&mut self, status: AttemptStatus) -> ChannelAttempt {
        self.count += 1;
        let mut attempt = ChannelAttempt::new(self.count, status);
        attempt.round = self.round;
        attempt
    }

    /// Record a candidate skipped before any forward (disabled channel,
    /// missing key, adapter mismatch).
    pub fn skip(
        &mut self,
        channel_id: i64,
        channel_key_id: i64,
        channel_name: &str,
        err: &RelayError,
    ) {
        let mut attempt = self.next_attempt(AttemptStatus::Skipped);
        attempt.channel_id = channel_id;
        attempt.channel_key_id = channel_key_id;
        attempt.channel_name = channel_name.to_string();
        attempt.model_name = self.current().model_name.clone();
        attempt.sticky = self.is_sticky();
        attempt.msg = err.message.clone();
        attempt.relay_status_code = err.status_code;
        attempt.relay_error_source = err.source.as_str().to_string();
        attempt.relay_retryable = err.retryable;
        attempt.relay_trippable = err.trippable;
        self.attempts.push(attempt);
    }

    /// Record a candidate denied by its breaker, with remaining cooldown.
    pub fn record_circuit_break(
        &mut self,
        channel_id: i64,
        channel_key_id: i64,
        channel_name: &str,
        acquire: &AttemptAcquire,
        now_ms: u64,
    ) {
        let mut msg = "circuit breaker tripped".to_string();
        if acquire.open_until_ms > now_ms {
            msg = format!(
                "circuit breaker tripped, remaining cooldown: {}s",
                (acquire.open_until_ms - now_ms).div_ceil(1_000)
            );
        }

        let mut attempt = self.next_attempt(AttemptStatus::CircuitBreak);
        attempt.channel_id = channel_id;
        attempt.channel_key_id = channel_key_id;
        attempt.channel_name = channel_name.to_string();
        attempt.model_name = self.current().model_name.clone();
        attempt.sticky = self.is_sticky();
        attempt.msg = msg;
        attempt.relay_status_code = 503;
        attempt.relay_error_source = "local".to_string();
        attempt.relay_retryable = true;
        attempt.breaker_key = acquire.key.clone();
        attempt.cb_decision = acquire.decision.as_str().to_string();
        attempt.cb_state_before = acquire.state_before.as_str().to_string();
        attempt.cb_state_after = acquire.state_after.as_str().to_string();
        attempt.cb_trip_count = acquire.trip_count;
        attempt.cb_open_until = format_rfc3339_millis(acquire.open_until_ms);
        attempt.probe_in_flight = acquire.probe_in_flight;
        self.attempts.push(attempt);
    }

    /// Record the terminal all-breakers-open decision for a round.
    pub fn record_all_open(&mut self, earliest_retry_at: &str, retry_after_seconds: u64) {
        let mut attempt = self.next_attempt(AttemptStatus::CircuitBreak);
        attempt.msg = "all upstream circuit breakers are open".to_string();
        attempt.relay_status_code = 503;
        attempt.relay_error_source = "local".to_string();
        attempt.relay_retryable = true;
        attempt.cb_decision = "all_open".to_string();
        attempt.earliest_retry_at = earliest_retry_at.to_string();
        attempt.retry_after_seconds = retry_after_seconds;
        self.attempts.push(attempt);
    }

    /// Begin a timed forward attempt for the current candidate.
    pub fn start_attempt(
        &mut self,
        channel_id: i64,
        channel_key_id: i64,
        channel_name: &str,
    ) -> AttemptSpan {
        let mut attempt = self.next_attempt(AttemptStatus::Failed);
        attempt.channel_id = channel_id;
        attempt.channel_key_id = channel_key_id;
        attempt.channel_name = channel_name.to_string();
        attempt.model_name = self.current().model_name.clone();
        attempt.sticky = self.is_sticky();
        AttemptSpan {
            attempt,
            started: Instant::now(),
        }
    }

    /// Finalize a span and append its record.
    pub fn end_attempt(
        &mut self,
        mut span: AttemptSpan,
        status: AttemptStatus,
        status_code: u16,
        msg: &str,
    ) {
        span.attempt.status = status;
        span.attempt.duration_ms = span.started.elapsed().as_millis() as u64;
        span.attempt.relay_status_code = status_code;
        span.attempt.msg = msg.to_string();
        self.attempts.push(span.attempt);
    }

    pub fn attempts(&self) -> &[ChannelAttempt] {
        &self.attempts
    }

    pub fn into_attempts(self) -> Vec<ChannelAttempt> {
        self.attempts
    }
}

/// Lifecycle of one real forward attempt: created by
/// [`CandidateIterator::start_attempt`], annotated as the attempt runs,
/// appended by [`CandidateIterator::end_attempt`].
pub struct AttemptSpan {
    attempt: ChannelAttempt,
    started: Instant,
}

impl AttemptSpan {
    pub fn classify(&mut self, err: &RelayError) {
        self.attempt.relay_error_source = err.source.as_str().to_string();
        self.attempt.relay_retryable = err.retryable;
        self.attempt.relay_trippable = err.trippable;
    }

    pub fn breaker_trace(&mut self, acquire: &AttemptAcquire, result: Option<&RecordResult>) {
        self.attempt.breaker_key = acquire.key.clone();
        self.attempt.cb_state_before = acquire.state_before.as_str().to_string();
        match result {
            Some(result) => {
                self.attempt.cb_decision = result.decision.as_str().to_string();
                self.attempt.cb_state_after = result.state_after.as_str().to_string();
                self.attempt.cb_trip_count = result.trip_count;
                self.attempt.cb_open_until = format_rfc3339_millis(result.open_until_ms);
                self.attempt.probe_in_flight = result.probe_in_flight;
            }
            None => {
                self.attempt.cb_decision = acquire.decision.as_str().to_string();
                self.attempt.cb_state_after = acquire.state_after.as_str().to_string();
                self.attempt.cb_trip_count = acquire.trip_count;
                self.attempt.cb_open_until = format_rfc3339_millis(acquire.open_until_ms);
                self.attempt.probe_in_flight = acquire.probe_in_flight;
            }
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn items(ids: &[i64]) -> Vec<GroupItem> {
        ids.iter()
            .map(|&id| GroupItem {
                id,
                channel_id: id,
                model_name: "m".to_string(),
                priority: id as i32,
                weight: 1,
            })
            .collect()
    }

    fn sticky(channel_id: i64) -> SessionEntry {
        SessionEntry {
            channel_id,
            channel_key_id: channel_id * 10,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn iterates_in_policy_order() {
        let balancers = Balancers::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut it = CandidateIterator::new(
            &balancers,
            GroupMode::Failover,
            &items(&[3, 1, 2]),
            None,
            1,
            &mut rng,
        );

        let mut seen = Vec::new();
        while it.advance() {
            seen.push(it.current().channel_id);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(!it.advance());
    }

    #[test]
    fn sticky_channel_moves_to_front_preserving_rest() {
        let balancers = Balancers::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut it = CandidateIterator::new(
            &balancers,
            GroupMode::Failover,
            &items(&[1, 2, 3, 4]),
            Some(&sticky(3)),
            1,
            &mut rng,
        );

        let mut seen = Vec::new();
        let mut sticky_flags = Vec::new();
        while it.advance() {
            seen.push(it.current().channel_id);
            sticky_flags.push(it.is_sticky());
        }
        assert_eq!(seen, vec![3, 1, 2, 4]);
        assert_eq!(sticky_flags, vec![true, false, false, false]);
    }

    #[test]
    fn unknown_sticky_channel_is_ignored() {
        let balancers = Balancers::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut it = CandidateIterator::new(
            &balancers,
            GroupMode::Failover,
            &items(&[1, 2]),
            Some(&sticky(99)),
            1,
            &mut rng,
        );
        it.advance();
        assert!(!it.is_sticky());
    }

    #[test]
    fn empty_items_yield_nothing() {
        let balancers = Balancers::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut it =
            CandidateIterator::new(&balancers, GroupMode::RoundRobin, &[], None, 1, &mut rng);
        assert!(it.is_empty());
        assert!(!it.advance());
    }

    #[test]
    fn attempt_numbers_are_monotonic_across_kinds() {
        let balancers = Balancers::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut it = CandidateIterator::new(
            &balancers,
            GroupMode::Failover,
            &items(&[1, 2, 3]),
            None,
            2,
            &mut rng,
        );

        it.advance();
        it.skip(1, 0, "a", &RelayError::local(502, "channel a is disabled"));
        it.advance();
        let span = it.start_attempt(2, 20, "b");
        it.end_attempt(span, AttemptStatus::Failed, 500, "upstream error: 500");
        it.advance();
        let span = it.start_attempt(3, 30, "c");
        it.end_attempt(span, AttemptStatus::Success, 200, "");

        let nums: Vec<u32> = it.attempts().iter().map(|a| a.attempt_num).collect();
        assert_eq!(nums, vec![1, 2, 3]);
        assert!(it.attempts().iter().all(|a| a.round == 2));
        assert_eq!(it.attempts()[0].status, AttemptStatus::Skipped);
        assert_eq!(it.attempts()[1].status, AttemptStatus::Failed);
        assert_eq!(it.attempts()[2].status, AttemptStatus::Success);
    }

    #[test]
    fn circuit_break_record_includes_remaining_cooldown() {
        let balancers = Balancers::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut it = CandidateIterator::new(
            &balancers,
            GroupMode::Failover,
            &items(&[1]),
            None,
            1,
            &mut rng,
        );
        it.advance();

        let acquire = AttemptAcquire {
            key: "1:m".to_string(),
            allowed: false,
            decision: crate::breaker::Decision::SkipOpen,
            state_before: crate::model::CircuitBreakerState::Open,
            state_after: crate::model::CircuitBreakerState::Open,
            trip_count: 2,
            open_until_ms: 12_500,
            probe_granted: false,
            probe_in_flight: false,
        };
        it.record_circuit_break(1, 10, "a", &acquire, 10_000);

        let attempt = &it.attempts()[0];
        assert_eq!(attempt.status, AttemptStatus::CircuitBreak);
        assert_eq!(attempt.msg, "circuit breaker tripped, remaining cooldown: 3s");
        assert_eq!(attempt.cb_decision, "skip_open");
        assert_eq!(attempt.cb_trip_count, 2);
    }
}
