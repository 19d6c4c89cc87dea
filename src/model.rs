//! Core data model shared across the relay: groups, channels, attempt
//! records and circuit-breaker wire types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Load-balancing mode of a [`Group`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    #[default]
    RoundRobin,
    Random,
    Failover,
    Weighted,
}

/// One (channel, upstream-model) pair inside a group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupItem {
    pub id: i64,
    pub channel_id: i64,
    pub model_name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    1
}

/// A logical model name mapped to an ordered set of candidates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub mode: GroupMode,
    /// Session stickiness TTL in seconds; 0 disables stickiness.
    #[serde(default)]
    pub session_keep_time: u64,
    /// First-token timeout in seconds for streaming; 0 disables the timer.
    #[serde(default)]
    pub first_token_timeout: u64,
    pub items: Vec<GroupItem>,
}

/// Upstream dialect family of a channel. Only types with a registered
/// outbound adapter are forwardable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAi,
    Anthropic,
    Gemini,
}

impl ChannelType {
    pub fn supports_chat(self) -> bool {
        true
    }

    pub fn supports_embeddings(self) -> bool {
        matches!(self, ChannelType::OpenAi | ChannelType::Gemini)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ChannelKey {
    pub id: i64,
    pub secret: String,
    /// Last upstream status observed through this key; 0 = never used.
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub last_use_timestamp_ms: u64,
    #[serde(default)]
    pub total_cost: f64,
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("status_code", &self.status_code)
            .field("last_use_timestamp_ms", &self.last_use_timestamp_ms)
            .field("total_cost", &self.total_cost)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub channel_type: ChannelType,
    pub base_url: String,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub keys: Vec<ChannelKey>,
}

impl Channel {
    /// Next usable key: least recently used wins so traffic rotates across
    /// keys between restarts.
    pub fn pick_key(&self) -> Option<ChannelKey> {
        self.keys
            .iter()
            .min_by_key(|key| key.last_use_timestamp_ms)
            .cloned()
    }
}

/// Outcome of a single candidate decision inside one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
    CircuitBreak,
    Skipped,
}

/// One decision record; a request accumulates one per candidate touched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelAttempt {
    #[serde(default)]
    pub round: u32,
    pub attempt_num: u32,
    #[serde(default)]
    pub channel_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub channel_key_id: i64,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub model_name: String,
    pub status: AttemptStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sticky: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,

    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub relay_status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relay_error_source: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub relay_retryable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub relay_trippable: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub breaker_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cb_decision: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cb_state_before: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cb_state_after: String,
    #[serde(default)]
    pub cb_trip_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cb_open_until: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub probe_in_flight: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub earliest_retry_at: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub retry_after_seconds: u64,
}

impl ChannelAttempt {
    pub fn new(attempt_num: u32, status: AttemptStatus) -> Self {
        Self {
            round: 0,
            attempt_num,
            channel_id: 0,
            channel_key_id: 0,
            channel_name: String::new(),
            model_name: String::new(),
            status,
            duration_ms: 0,
            sticky: false,
            msg: String::new(),
            relay_status_code: 0,
            relay_error_source: String::new(),
            relay_retryable: false,
            relay_trippable: false,
            breaker_key: String::new(),
            cb_decision: String::new(),
            cb_state_before: String::new(),
            cb_state_after: String::new(),
            cb_trip_count: 0,
            cb_open_until: String::new(),
            probe_in_flight: false,
            earliest_retry_at: String::new(),
            retry_after_seconds: 0,
        }
    }
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Finished request record handed to the relay-log sink. Upstream payloads
/// are deliberately not stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayLog {
    /// Unix timestamp (seconds) of request start.
    pub time: i64,
    pub request_model_name: String,
    #[serde(default)]
    pub channel_id: i64,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub actual_model_name: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Time to first streamed token in milliseconds; 0 when not streaming.
    #[serde(default)]
    pub first_token_ms: u64,
    pub use_time_ms: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub attempts: Vec<ChannelAttempt>,
    pub total_attempts: usize,
}

/// Counter deltas merged into the stats sinks after every request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsMetrics {
    pub wait_time_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub request_success: u64,
    pub request_failed: u64,
}

impl StatsMetrics {
    pub fn merge(&mut self, other: &StatsMetrics) {
        self.wait_time_ms += other.wait_time_ms;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
        self.request_success += other.request_success;
        self.request_failed += other.request_failed;
    }
}

/// USD per one million tokens.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub backoff_factor: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub decay_window_ms: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    #[default]
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "CLOSED",
            CircuitBreakerState::Open => "OPEN",
            CircuitBreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Per-item breaker view in the group states admin endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupCircuitBreakerItemState {
    pub group_id: i64,
    pub group_name: String,
    pub channel_id: i64,
    pub channel_name: String,
    pub model_name: String,
    pub breaker_key: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub trip_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_failure_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_failure_reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_trip_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub open_until: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub open_remaining_second: u64,
    pub probe_in_flight: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupCircuitBreakerStatesResponse {
    pub group_id: i64,
    pub group_name: String,
    pub items: Vec<GroupCircuitBreakerItemState>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerResetResponse {
    pub channel_id: i64,
    pub affected_breakers: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaker_keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerAllOpenScope {
    pub group_id: i64,
    pub model_name: String,
}

/// Body of the 503 returned when every candidate breaker is open.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerAllOpenData {
    pub reason: String,
    pub earliest_retry_at: String,
    pub retry_after_seconds: u64,
    pub scope: CircuitBreakerAllOpenScope,
}
