//! Per-request metrics: timings, tokens, cost, and the final relay-log
//! record. One recorder is created per inbound request and saved exactly
//! once, on whichever path ends the request.

use std::time::Instant;

use crate::model::{AttemptStatus, ChannelAttempt, RelayLog, StatsMetrics};
use crate::transform::Usage;

use super::RelayState;

pub struct RelayMetrics {
    api_key_id: i64,
    request_model: String,
    group_name: String,
    start_wall_ms: u64,
    started: Instant,
    first_token_ms: u64,
    usage: Option<Usage>,
    actual_model: String,
    channel_id: i64,
    channel_name: String,
}

impl RelayMetrics {
    pub fn new(api_key_id: i64, request_model: &str, start_wall_ms: u64) -> Self {
        Self {
            api_key_id,
            request_model: request_model.to_string(),
            group_name: String::new(),
            start_wall_ms,
            started: Instant::now(),
            first_token_ms: 0,
            usage: None,
            actual_model: String::new(),
            channel_id: 0,
            channel_name: String::new(),
        }
    }

    pub fn set_group(&mut self, name: &str) {
        self.group_name = name.to_string();
    }

    pub fn set_channel(&mut self, channel_id: i64, channel_name: &str, upstream_model: &str) {
        self.channel_id = channel_id;
        self.channel_name = channel_name.to_string();
        self.actual_model = upstream_model.to_string();
    }

    pub fn mark_first_token(&mut self) {
        if self.first_token_ms == 0 {
            self.first_token_ms = self.started.elapsed().as_millis().max(1) as u64;
        }
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.usage = Some(usage);
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    fn costs(&self, state: &RelayState) -> (f64, f64) {
        let usage = self.usage.unwrap_or_default();
        let model = if self.actual_model.is_empty() {
            &self.request_model
        } else {
            &self.actual_model
        };
        match state.prices.llm_price(model) {
            Some(price) => (
                usage.prompt_tokens as f64 * price.input * 1e-6,
                usage.completion_tokens as f64 * price.output * 1e-6,
            ),
            None => (0.0, 0.0),
        }
    }

    /// Cost accumulated so far, for channel-key bookkeeping.
    pub fn total_cost(&self, state: &RelayState) -> f64 {
        let (input_cost, output_cost) = self.costs(state);
        input_cost + output_cost
    }

    /// Assemble the log record, fan counters out to the stats sinks and
    /// hand the record to the relay-log sink.
    pub fn save(
        self,
        state: &RelayState,
        success: bool,
        error: Option<&str>,
        attempts: Vec<ChannelAttempt>,
    ) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let usage = self.usage.unwrap_or_default();
        let (input_cost, output_cost) = self.costs(state);

        let stats = StatsMetrics {
            wait_time_ms: duration_ms,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            input_cost,
            output_cost,
            request_success: u64::from(success),
            request_failed: u64::from(!success),
        };

        let start_secs = (self.start_wall_ms / 1_000) as i64;
        state.stats.update_total(&stats);
        state.stats.update_hourly(start_secs / 3_600, &stats);
        state.stats.update_daily(start_secs / 86_400, &stats);
        state.stats.update_api_key(self.api_key_id, &stats);

        let (channel_id, channel_name) = final_channel(&attempts, self.channel_id, &self.channel_name);
        if channel_id != 0 {
            state.stats.update_channel(channel_id, &stats);
        }

        tracing::info!(
            model = %self.request_model,
            group = %self.group_name,
            channel_id,
            channel = %channel_name,
            success,
            duration_ms,
            first_token_ms = self.first_token_ms,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            cost = input_cost + output_cost,
            attempts = attempts.len(),
            "relay complete"
        );

        let total_attempts = attempts.len();
        state.relay_log.add(RelayLog {
            time: start_secs,
            request_model_name: self.request_model,
            channel_id,
            channel_name,
            actual_model_name: if self.actual_model.is_empty() {
                String::new()
            } else {
                self.actual_model
            },
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            first_token_ms: self.first_token_ms,
            use_time_ms: duration_ms,
            cost: input_cost + output_cost,
            error: error.unwrap_or_default().to_string(),
            attempts,
            total_attempts,
        });
    }
}

/// Channel to attribute the request to: the successful attempt if any,
/// otherwise the last failed forward.
fn final_channel(
    attempts: &[ChannelAttempt],
    fallback_id: i64,
    fallback_name: &str,
) -> (i64, String) {
    let mut last_failed: Option<&ChannelAttempt> = None;
    for attempt in attempts.iter().rev() {
        match attempt.status {
            AttemptStatus::Success => {
                return (attempt.channel_id, attempt.channel_name.clone());
            }
            AttemptStatus::Failed if last_failed.is_none() => last_failed = Some(attempt),
            _ => {}
        }
    }
    match last_failed {
        Some(attempt) => (attempt.channel_id, attempt.channel_name.clone()),
        None => (fallback_id, fallback_name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(status: AttemptStatus, channel_id: i64, name: &str) -> ChannelAttempt {
        let mut attempt = ChannelAttempt::new(1, status);
        attempt.channel_id = channel_id;
        attempt.channel_name = name.to_string();
        attempt
    }

    #[test]
    fn final_channel_prefers_success() {
        let attempts = vec![
            attempt(AttemptStatus::Failed, 1, "a"),
            attempt(AttemptStatus::Success, 2, "b"),
        ];
        assert_eq!(final_channel(&attempts, 0, ""), (2, "b".to_string()));
    }

    #[test]
    fn final_channel_falls_back_to_last_failure() {
        let attempts = vec![
            attempt(AttemptStatus::Failed, 1, "a"),
            attempt(AttemptStatus::Failed, 2, "b"),
            attempt(AttemptStatus::CircuitBreak, 3, "c"),
        ];
        assert_eq!(final_channel(&attempts, 0, ""), (2, "b".to_string()));
    }

    #[test]
    fn final_channel_uses_fallback_when_no_forward_happened() {
        let attempts = vec![attempt(AttemptStatus::Skipped, 1, "a")];
        assert_eq!(final_channel(&attempts, 9, "z"), (9, "z".to_string()));
    }
}
