//! Breaker configuration: typed setting keys, defaults, and sanitization.

use crate::model::CircuitBreakerConfig;
use crate::store::SettingStore;

pub const SETTING_CB_ENABLED: &str = "cb_enabled";
pub const SETTING_CB_FAILURE_THRESHOLD: &str = "cb_failure_threshold";
pub const SETTING_CB_BASE_COOLDOWN_MS: &str = "cb_base_cooldown_ms";
pub const SETTING_CB_MAX_COOLDOWN_MS: &str = "cb_max_cooldown_ms";
pub const SETTING_CB_BACKOFF_FACTOR: &str = "cb_backoff_factor";
pub const SETTING_CB_JITTER_MIN: &str = "cb_jitter_min";
pub const SETTING_CB_JITTER_MAX: &str = "cb_jitter_max";
pub const SETTING_CB_DECAY_WINDOW_MS: &str = "cb_decay_window_ms";

pub fn default_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        failure_threshold: 3,
        base_cooldown_ms: 180_000,
        max_cooldown_ms: 3_600_000,
        backoff_factor: 2.0,
        jitter_min: 0.5,
        jitter_max: 1.5,
        decay_window_ms: 21_600_000, // 6h
    }
}

/// Read the effective config from the setting store. Unknown or malformed
/// values fall back to defaults; the result is always sanitized.
pub fn resolve(settings: &dyn SettingStore) -> CircuitBreakerConfig {
    let mut cfg = default_config();

    if let Some(value) = get_parsed::<bool>(settings, SETTING_CB_ENABLED) {
        cfg.enabled = value;
    }
    if let Some(value) = get_parsed::<u32>(settings, SETTING_CB_FAILURE_THRESHOLD) {
        cfg.failure_threshold = value;
    }
    if let Some(value) = get_parsed::<u64>(settings, SETTING_CB_BASE_COOLDOWN_MS) {
        cfg.base_cooldown_ms = value;
    }
    if let Some(value) = get_parsed::<u64>(settings, SETTING_CB_MAX_COOLDOWN_MS) {
        cfg.max_cooldown_ms = value;
    }
    if let Some(value) = get_parsed::<f64>(settings, SETTING_CB_BACKOFF_FACTOR) {
        cfg.backoff_factor = value;
    }
    if let Some(value) = get_parsed::<f64>(settings, SETTING_CB_JITTER_MIN) {
        cfg.jitter_min = value;
    }
    if let Some(value) = get_parsed::<f64>(settings, SETTING_CB_JITTER_MAX) {
        cfg.jitter_max = value;
    }
    if let Some(value) = get_parsed::<u64>(settings, SETTING_CB_DECAY_WINDOW_MS) {
        cfg.decay_window_ms = value;
    }

    sanitize(cfg)
}

/// Clamp invalid values back to defaults and restore the ordering
/// invariants (max ≥ base, jitter_max ≥ jitter_min).
pub fn sanitize(mut cfg: CircuitBreakerConfig) -> CircuitBreakerConfig {
    let defaults = default_config();
    if cfg.failure_threshold == 0 {
        cfg.failure_threshold = defaults.failure_threshold;
    }
    if cfg.base_cooldown_ms == 0 {
        cfg.base_cooldown_ms = defaults.base_cooldown_ms;
    }
    if cfg.max_cooldown_ms == 0 {
        cfg.max_cooldown_ms = defaults.max_cooldown_ms;
    }
    if cfg.max_cooldown_ms < cfg.base_cooldown_ms {
        cfg.max_cooldown_ms = cfg.base_cooldown_ms;
    }
    if cfg.backoff_factor < 1.0 || !cfg.backoff_factor.is_finite() {
        cfg.backoff_factor = defaults.backoff_factor;
    }
    if cfg.jitter_min <= 0.0 || !cfg.jitter_min.is_finite() {
        cfg.jitter_min = defaults.jitter_min;
    }
    if cfg.jitter_max < cfg.jitter_min || !cfg.jitter_max.is_finite() {
        cfg.jitter_max = cfg.jitter_min;
    }
    if cfg.decay_window_ms == 0 {
        cfg.decay_window_ms = defaults.decay_window_ms;
    }
    cfg
}

fn get_parsed<T: std::str::FromStr>(settings: &dyn SettingStore, key: &str) -> Option<T> {
    settings.get(key)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySettingStore;

    #[test]
    fn resolve_uses_defaults_when_store_is_empty() {
        let store = MemorySettingStore::default();
        let cfg = resolve(&store);
        assert!(cfg.enabled);
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.base_cooldown_ms, 180_000);
        assert_eq!(cfg.max_cooldown_ms, 3_600_000);
        assert_eq!(cfg.backoff_factor, 2.0);
        assert_eq!(cfg.decay_window_ms, 21_600_000);
    }

    #[test]
    fn resolve_reads_overrides() {
        let store = MemorySettingStore::default();
        store.set(SETTING_CB_ENABLED, "false");
        store.set(SETTING_CB_FAILURE_THRESHOLD, "5");
        store.set(SETTING_CB_BASE_COOLDOWN_MS, "2500");
        store.set(SETTING_CB_MAX_COOLDOWN_MS, "60000");
        store.set(SETTING_CB_JITTER_MIN, "1");
        store.set(SETTING_CB_JITTER_MAX, "1");

        let cfg = resolve(&store);
        assert!(!cfg.enabled);
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.base_cooldown_ms, 2_500);
        assert_eq!(cfg.max_cooldown_ms, 60_000);
        assert_eq!(cfg.jitter_min, 1.0);
        assert_eq!(cfg.jitter_max, 1.0);
    }

    #[test]
    fn resolve_ignores_malformed_values() {
        let store = MemorySettingStore::default();
        store.set(SETTING_CB_FAILURE_THRESHOLD, "not-a-number");
        store.set(SETTING_CB_BACKOFF_FACTOR, "0.25");

        let cfg = resolve(&store);
        assert_eq!(cfg.failure_threshold, 3);
        // 0.25 parses but is below 1, so the sanitizer restores the default.
        assert_eq!(cfg.backoff_factor, 2.0);
    }

    #[test]
    fn sanitize_restores_jitter_ordering() {
        let mut cfg = default_config();
        cfg.jitter_min = 2.0;
        cfg.jitter_max = 0.5;
        let cfg = sanitize(cfg);
        assert_eq!(cfg.jitter_max, cfg.jitter_min);
    }

    #[test]
    fn sanitize_restores_cooldown_ordering() {
        let mut cfg = default_config();
        cfg.base_cooldown_ms = 5_000;
        cfg.max_cooldown_ms = 1_000;
        let cfg = sanitize(cfg);
        assert_eq!(cfg.max_cooldown_ms, 5_000);
    }
}
