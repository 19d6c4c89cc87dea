//! Server configuration file: channels, groups, api keys, settings and
//! prices, loaded once at startup into the in-memory stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::{Channel, Group, ModelPrice};
use crate::relay::RelayState;
use crate::store::{
    MemoryChannelStore, MemoryGroupStore, MemoryPriceTable, MemoryRelayLog, MemorySettingStore,
    MemoryStats,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Raw settings, e.g. the `cb_*` circuit-breaker keys.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// USD-per-1M-token prices by upstream model name.
    #[serde(default)]
    pub prices: BTreeMap<String, ModelPrice>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: i64,
    pub token: String,
    #[serde(default)]
    pub name: String,
}

impl std::fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}

impl RelayConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn api_key_map(&self) -> HashMap<String, i64> {
        self.api_keys
            .iter()
            .map(|key| (key.token.clone(), key.id))
            .collect()
    }

    /// Move the config into a relay state backed by in-memory stores.
    pub fn into_relay_state(self) -> RelayState {
        RelayState::new(
            Arc::new(MemoryChannelStore::new(self.channels)),
            Arc::new(MemoryGroupStore::new(self.groups)),
            Arc::new(MemorySettingStore::new(self.settings)),
            Arc::new(MemoryRelayLog::default()),
            Arc::new(MemoryStats::default()),
            Arc::new(MemoryPriceTable::new(self.prices)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelType, GroupMode};

    #[test]
    fn parses_full_config() {
        let raw = r#"{
            "listen": "0.0.0.0:9000",
            "api_keys": [{"id": 1, "token": "mk-test", "name": "dev"}],
            "channels": [{
                "id": 1,
                "name": "primary",
                "enabled": true,
                "channel_type": "open_ai",
                "base_url": "https://api.openai.com/v1",
                "keys": [{"id": 10, "secret": "sk-live"}]
            }],
            "groups": [{
                "id": 1,
                "name": "gpt-4o",
                "mode": "failover",
                "session_keep_time": 300,
                "first_token_timeout": 10,
                "items": [
                    {"id": 1, "channel_id": 1, "model_name": "gpt-4o", "priority": 1}
                ]
            }],
            "settings": {"cb_failure_threshold": "2"},
            "prices": {"gpt-4o": {"input": 2.5, "output": 10.0}}
        }"#;

        let config = RelayConfig::from_json(raw).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.api_keys.len(), 1);
        assert_eq!(config.channels[0].channel_type, ChannelType::OpenAi);
        assert_eq!(config.groups[0].mode, GroupMode::Failover);
        assert_eq!(config.groups[0].items[0].weight, 1);
        assert_eq!(config.api_key_map()["mk-test"], 1);
    }

    #[test]
    fn defaults_apply_to_minimal_config() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert!(config.channels.is_empty());
    }

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKeyConfig {
            id: 1,
            token: "mk-secret".to_string(),
            name: "dev".to_string(),
        };
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("mk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
