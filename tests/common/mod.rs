//! Shared fixtures for the integration tests: in-memory stores wired into
//! a relay state with a manual clock, plus axum request helpers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, Response};
use axum::Router;
use manta_relay::balancer::session::SessionEntry;
use manta_relay::http::{router, AppState};
use manta_relay::model::{Channel, ChannelKey, ChannelType, Group, GroupItem, GroupMode};
use manta_relay::store::{
    MemoryChannelStore, MemoryGroupStore, MemoryPriceTable, MemoryRelayLog, MemorySettingStore,
    MemoryStats,
};
use manta_relay::utils::clock::{Clock, ManualClock};
use manta_relay::RelayState;
use tower::util::ServiceExt;

pub const START_MS: u64 = 1_700_000_000_000;

pub struct Harness {
    pub app: Router,
    pub state: Arc<RelayState>,
    pub clock: Arc<ManualClock>,
    pub logs: Arc<MemoryRelayLog>,
    pub stats: Arc<MemoryStats>,
    pub settings: Arc<MemorySettingStore>,
}

impl Harness {
    pub fn new(channels: Vec<Channel>, groups: Vec<Group>) -> Self {
        let clock = Arc::new(ManualClock::at(START_MS));
        let logs = Arc::new(MemoryRelayLog::default());
        let stats = Arc::new(MemoryStats::default());
        let settings = Arc::new(MemorySettingStore::default());
        // Deterministic cooldowns: jitter pinned to 1.
        settings.set("cb_jitter_min", "1");
        settings.set("cb_jitter_max", "1");

        let state = Arc::new(
            RelayState::new(
                Arc::new(MemoryChannelStore::new(channels)),
                Arc::new(MemoryGroupStore::new(groups)),
                settings.clone(),
                logs.clone(),
                stats.clone(),
                Arc::new(MemoryPriceTable::default()),
            )
            .with_clock(clock.clone()),
        );

        Self {
            app: router(AppState::new(state.clone())),
            state,
            clock,
            logs,
            stats,
            settings,
        }
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub fn sticky(&self, api_key_id: i64, model: &str) -> Option<SessionEntry> {
        self.state
            .sessions
            .get(api_key_id, model, 3_600, self.clock.now_millis())
    }
}

pub fn channel(id: i64, name: &str, base_url: &str) -> Channel {
    Channel {
        id,
        name: name.to_string(),
        enabled: true,
        channel_type: ChannelType::OpenAi,
        base_url: base_url.to_string(),
        custom_headers: BTreeMap::new(),
        keys: vec![ChannelKey {
            id: id * 10,
            secret: format!("sk-{name}"),
            status_code: 0,
            last_use_timestamp_ms: 0,
            total_cost: 0.0,
        }],
    }
}

pub fn group(model: &str, mode: GroupMode, channel_ids: &[i64]) -> Group {
    Group {
        id: 1,
        name: model.to_string(),
        mode,
        session_keep_time: 0,
        first_token_timeout: 0,
        items: channel_ids
            .iter()
            .enumerate()
            .map(|(idx, &channel_id)| GroupItem {
                id: channel_id * 100,
                channel_id,
                model_name: model.to_string(),
                priority: idx as i32 + 1,
                weight: 1,
            })
            .collect(),
    }
}

pub fn chat_body(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello"}]
    })
}

pub fn chat_body_streaming(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "stream": true,
        "messages": [{"role": "user", "content": "hello"}]
    })
}

pub async fn read_body(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn read_body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The driver finishes bookkeeping on its own task shortly after the
/// response head is delivered; poll instead of sleeping a fixed amount.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
