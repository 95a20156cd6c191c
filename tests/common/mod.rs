//! 統合テスト共通のフェイクとヘルパー

#![allow(dead_code)]

use async_trait::async_trait;
use chat_relay::api::innertube::get_live_chat::GetLiveChatResponse;
use chat_relay::api::innertube::{Continuation, InnerTube, UnofficialApi};
use chat_relay::api::youtube::{ApiKey, LiveChatMessagesResponse, OfficialApi, VideoId};
use chat_relay::config::AppConfig;
use chat_relay::database::PersistenceManager;
use chat_relay::{AppContext, RelayError, RelayResult};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const STREAM_ID: &str = "dQw4w9WgXcQ";

/// 待ち時間を短くした設定
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.polling.unofficial_min_interval_ms = 10;
    config.polling.official_min_interval_ms = 10;
    config.polling.max_consecutive_failures = 3;
    config.polling.transient_backoff_base_ms = 10;
    config.polling.transient_backoff_max_ms = 40;
    config.polling.rate_limit_backoff_base_ms = 10;
    config.polling.rate_limit_backoff_max_ms = 40;
    config.polling.backoff_jitter = false;
    config.server.port = 0;
    config
}

pub fn test_context(
    config: AppConfig,
    official: Arc<FakeOfficial>,
    unofficial: Arc<FakeUnofficial>,
) -> AppContext {
    let store = PersistenceManager::in_memory(config.persistence.batch_deadline()).unwrap();
    AppContext::new(config, store, official, unofficial)
}

/// 条件が満たされるまで待つ
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// 公式APIのテキストメッセージ
pub fn official_text(id: &str, body: &str) -> serde_json::Value {
    json!({
        "id": id,
        "snippet": {"type": "textMessageEvent", "publishedAt": "2024-05-01T10:00:00Z", "displayMessage": body},
        "authorDetails": {"channelId": format!("UC-{}", id), "displayName": "viewer"}
    })
}

pub fn official_page(
    items: Vec<serde_json::Value>,
    next_page_token: Option<&str>,
    interval_ms: u64,
) -> LiveChatMessagesResponse {
    serde_json::from_value(json!({
        "pollingIntervalMillis": interval_ms,
        "nextPageToken": next_page_token,
        "items": items,
    }))
    .unwrap()
}

/// 非公式エンドポイントの1ページ（テキストメッセージのみ）
pub fn innertube_page(ids: &[&str], next: &str) -> GetLiveChatResponse {
    let actions: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            json!({"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {
                "id": id,
                "timestampUsec": "1714557600000000",
                "message": {"runs": [{"text": format!("message {}", id)}]},
                "authorName": {"simpleText": "viewer"},
                "authorExternalChannelId": format!("UC-{}", id)
            }}}})
        })
        .collect();

    serde_json::from_value(json!({
        "continuationContents": {"liveChatContinuation": {
            "actions": actions,
            "continuations": [{"timedContinuationData": {"continuation": next, "timeoutMs": 10}}]
        }}
    }))
    .unwrap()
}

/// 公式APIのフェイク
///
/// `list_messages` はスクリプトを先頭から返し、尽きたら空ページを返す。
#[derive(Default)]
pub struct FakeOfficial {
    pub valid: AtomicBool,
    pub resolve_error: Mutex<Option<RelayError>>,
    pub script: Mutex<VecDeque<RelayResult<LiveChatMessagesResponse>>>,
    pub resolve_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub page_tokens: Mutex<Vec<Option<String>>>,
}

impl FakeOfficial {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.valid.store(true, Ordering::SeqCst);
        Arc::new(fake)
    }

    pub fn rejecting(error: RelayError) -> Arc<Self> {
        let fake = Self::default();
        *fake.resolve_error.lock() = Some(error);
        Arc::new(fake)
    }

    pub fn push(&self, result: RelayResult<LiveChatMessagesResponse>) {
        self.script.lock().push_back(result);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OfficialApi for FakeOfficial {
    async fn validate_credential(&self, _key: &ApiKey) -> RelayResult<bool> {
        Ok(self.valid.load(Ordering::SeqCst))
    }

    async fn resolve_live_chat_id(&self, _key: &ApiKey, video_id: &VideoId) -> RelayResult<String> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.resolve_error.lock().take() {
            return Err(error);
        }
        Ok(format!("chat-{}", video_id.0))
    }

    async fn list_messages(
        &self,
        _key: &ApiKey,
        _live_chat_id: &str,
        page_token: Option<&str>,
    ) -> RelayResult<LiveChatMessagesResponse> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.page_tokens.lock().push(page_token.map(str::to_string));
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(official_page(Vec::new(), None, 10)))
    }
}

/// 非公式エンドポイントのフェイク
#[derive(Default)]
pub struct FakeUnofficial {
    pub script: Mutex<VecDeque<RelayResult<GetLiveChatResponse>>>,
    /// trueの間は応答を返さない
    pub hang: AtomicBool,
    /// trueの間は応答を保留し、falseに戻すと続きを返す
    pub hold: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeUnofficial {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, result: RelayResult<GetLiveChatResponse>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnofficialApi for FakeUnofficial {
    async fn open_live_chat(&self, video_id: &VideoId) -> RelayResult<InnerTube> {
        Ok(InnerTube::new(
            video_id.clone(),
            Continuation("cont-0".to_string()),
        ))
    }

    async fn get_live_chat(&self, _inner_tube: &InnerTube) -> RelayResult<GetLiveChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        while self.hold.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(innertube_page(&[], "cont-idle")))
    }
}
