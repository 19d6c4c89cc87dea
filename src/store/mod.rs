//! Store contracts consumed by the relay core, plus in-memory
//! implementations used by the server binary and the tests. Persistent
//! backends implement the same traits.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{Channel, ChannelKey, Group, ModelPrice, RelayLog, StatsMetrics};

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get(&self, id: i64) -> Option<Channel>;

    /// Persist key bookkeeping (status, last use, accumulated cost).
    async fn update_key(&self, channel_id: i64, key: &ChannelKey);
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn get(&self, id: i64) -> Option<Group>;

    /// Group serving a logical model name.
    async fn get_by_model(&self, model: &str) -> Option<Group>;
}

pub trait SettingStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

pub trait RelayLogSink: Send + Sync {
    fn add(&self, record: RelayLog);
}

/// Aggregated counter sinks. Updates are merges and may be re-applied
/// safely by callers that retry their own persistence.
pub trait StatsSink: Send + Sync {
    fn update_total(&self, metrics: &StatsMetrics);
    fn update_hourly(&self, hour_bucket: i64, metrics: &StatsMetrics);
    fn update_daily(&self, day_bucket: i64, metrics: &StatsMetrics);
    fn update_api_key(&self, api_key_id: i64, metrics: &StatsMetrics);
    fn update_channel(&self, channel_id: i64, metrics: &StatsMetrics);
}

pub trait PriceTable: Send + Sync {
    fn llm_price(&self, model: &str) -> Option<ModelPrice>;
}

#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    channels: RwLock<HashMap<i64, Channel>>,
}

impl MemoryChannelStore {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: RwLock::new(
                channels
                    .into_iter()
                    .map(|channel| (channel.id, channel))
                    .collect(),
            ),
        }
    }

    pub fn insert(&self, channel: Channel) {
        let mut channels = self.channels.write().unwrap_or_else(|err| err.into_inner());
        channels.insert(channel.id, channel);
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn get(&self, id: i64) -> Option<Channel> {
        let channels = self.channels.read().unwrap_or_else(|err| err.into_inner());
        channels.get(&id).cloned()
    }

    async fn update_key(&self, channel_id: i64, key: &ChannelKey) {
        let mut channels = self.channels.write().unwrap_or_else(|err| err.into_inner());
        if let Some(channel) = channels.get_mut(&channel_id) {
            if let Some(stored) = channel.keys.iter_mut().find(|stored| stored.id == key.id) {
                *stored = key.clone();
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    groups: RwLock<Vec<Group>>,
}

impl MemoryGroupStore {
    pub fn new(groups: impl IntoIterator<Item = Group>) -> Self {
        Self {
            groups: RwLock::new(groups.into_iter().collect()),
        }
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn get(&self, id: i64) -> Option<Group> {
        let groups = self.groups.read().unwrap_or_else(|err| err.into_inner());
        groups.iter().find(|group| group.id == id).cloned()
    }

    async fn get_by_model(&self, model: &str) -> Option<Group> {
        let groups = self.groups.read().unwrap_or_else(|err| err.into_inner());
        groups.iter().find(|group| group.name == model).cloned()
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingStore {
    settings: DashMap<String, String>,
}

impl MemorySettingStore {
    pub fn new(settings: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            settings: settings.into_iter().collect(),
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        self.settings.insert(key.to_string(), value.to_string());
    }
}

impl SettingStore for MemorySettingStore {
    fn get(&self, key: &str) -> Option<String> {
        self.settings.get(key).map(|value| value.clone())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRelayLog {
    records: Mutex<Vec<RelayLog>>,
}

impl MemoryRelayLog {
    pub fn records(&self) -> Vec<RelayLog> {
        self.records
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

impl RelayLogSink for MemoryRelayLog {
    fn add(&self, record: RelayLog) {
        self.records
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(record);
    }
}

#[derive(Debug, Default, Clone)]
pub struct StatsAggregates {
    pub total: StatsMetrics,
    pub hourly: HashMap<i64, StatsMetrics>,
    pub daily: HashMap<i64, StatsMetrics>,
    pub per_api_key: HashMap<i64, StatsMetrics>,
    pub per_channel: HashMap<i64, StatsMetrics>,
}

#[derive(Debug, Default)]
pub struct MemoryStats {
    aggregates: Mutex<StatsAggregates>,
}

impl MemoryStats {
    pub fn snapshot(&self) -> StatsAggregates {
        self.aggregates
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

impl StatsSink for MemoryStats {
    fn update_total(&self, metrics: &StatsMetrics) {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(|err| err.into_inner());
        aggregates.total.merge(metrics);
    }

    fn update_hourly(&self, hour_bucket: i64, metrics: &StatsMetrics) {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(|err| err.into_inner());
        aggregates
            .hourly
            .entry(hour_bucket)
            .or_default()
            .merge(metrics);
    }

    fn update_daily(&self, day_bucket: i64, metrics: &StatsMetrics) {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(|err| err.into_inner());
        aggregates
            .daily
            .entry(day_bucket)
            .or_default()
            .merge(metrics);
    }

    fn update_api_key(&self, api_key_id: i64, metrics: &StatsMetrics) {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(|err| err.into_inner());
        aggregates
            .per_api_key
            .entry(api_key_id)
            .or_default()
            .merge(metrics);
    }

    fn update_channel(&self, channel_id: i64, metrics: &StatsMetrics) {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(|err| err.into_inner());
        aggregates
            .per_channel
            .entry(channel_id)
            .or_default()
            .merge(metrics);
    }
}

#[derive(Debug, Default)]
pub struct MemoryPriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl MemoryPriceTable {
    pub fn new(prices: impl IntoIterator<Item = (String, ModelPrice)>) -> Self {
        Self {
            prices: prices.into_iter().collect(),
        }
    }
}

impl PriceTable for MemoryPriceTable {
    fn llm_price(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(model).copied()
    }
}
