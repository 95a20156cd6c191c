//! InnerTube（非公式・認証なし）クライアント
//!
//! ポップアウトのチャットページからAPIキー・クライアントバージョン・
//! 初期continuationを抜き出し、`get_live_chat` を叩く。

pub mod get_live_chat;

use crate::api::innertube::get_live_chat::GetLiveChatResponse;
use crate::api::youtube::{ApiKey, VideoId};
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const YOUTUBE_ORIGIN: &str = "https://www.youtube.com";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const DEFAULT_CLIENT_VERSION: &str = "2.20231219.01.00";

/// これより短いcontinuationはページ内の別トークン
const MIN_CONTINUATION_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub struct ClientVersion(String);

impl ClientVersion {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl Default for ClientVersion {
    fn default() -> Self {
        Self(DEFAULT_CLIENT_VERSION.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Continuation(pub String);

/// 非公式エンドポイントの接続状態
#[derive(Debug, Clone)]
pub struct InnerTube {
    pub video_id: VideoId,
    pub api_key: Option<ApiKey>,
    pub client_version: ClientVersion,
    pub continuation: Continuation,
    /// サーバーが提示した次回までの待機時間
    pub timeout_ms: Option<u64>,
}

impl InnerTube {
    pub fn new(video_id: VideoId, continuation: Continuation) -> Self {
        Self {
            video_id,
            api_key: None,
            client_version: ClientVersion::default(),
            continuation,
            timeout_ms: None,
        }
    }
}

pub fn extract_api_key(html: &str) -> Option<ApiKey> {
    Regex::new(r#"['"]INNERTUBE_API_KEY['"]\s*:\s*['"]([^'"]+)['"]"#)
        .unwrap()
        .captures(html)
        .and_then(|cap| cap.get(1))
        .map(|m| ApiKey::new(m.as_str()))
}

pub fn extract_client_version(html: &str) -> Option<ClientVersion> {
    Regex::new(r#"['"]INNERTUBE_CLIENT_VERSION['"]\s*:\s*['"]([^'"]+)['"]"#)
        .unwrap()
        .captures(html)
        .and_then(|cap| cap.get(1))
        .map(|m| ClientVersion::new(m.as_str()))
}

/// ページ内で最初に見つかる十分な長さのcontinuation
pub fn extract_continuation(html: &str) -> Option<Continuation> {
    Regex::new(r#"['"]continuation['"]\s*:\s*['"]([^'"]+)['"]"#)
        .unwrap()
        .captures_iter(html)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str())
        .find(|token| token.len() > MIN_CONTINUATION_LEN)
        .map(|token| Continuation(token.to_string()))
}

/// 非公式エンドポイントのHTTPステータスを分類する
///
/// 403もボット判定による遮断なのでレート制限として扱う。
pub fn classify_status(status: StatusCode) -> RelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => RelayError::RateLimited {
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => RelayError::ChannelNotFound("live chat page not found".into()),
        s if s.is_server_error() => RelayError::NetworkError(format!("upstream returned {}", s)),
        s => RelayError::MalformedPayload(format!("unexpected status {}", s)),
    }
}

/// 非公式エンドポイントの抽象
#[async_trait]
pub trait UnofficialApi: Send + Sync {
    /// チャットページを取得して接続状態を初期化
    async fn open_live_chat(&self, video_id: &VideoId) -> RelayResult<InnerTube>;

    /// 現在のcontinuationで1回取得
    async fn get_live_chat(&self, inner_tube: &InnerTube) -> RelayResult<GetLiveChatResponse>;
}

pub struct InnerTubeClient {
    http: reqwest::Client,
    base_url: String,
}

impl InnerTubeClient {
    pub fn new(timeout: Duration) -> RelayResult<Self> {
        Self::with_base_url(YOUTUBE_ORIGIN, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl UnofficialApi for InnerTubeClient {
    async fn open_live_chat(&self, video_id: &VideoId) -> RelayResult<InnerTube> {
        let url = format!(
            "{}/live_chat?is_popout=1&v={}",
            self.base_url,
            urlencoding::encode(&video_id.0)
        );
        tracing::info!("🌐 Fetching live chat page for {}", video_id);

        let response = self.http.get(&url).send().await.map_err(|e| {
            tracing::error!("❌ Failed to fetch live chat page: {}", e);
            RelayError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let html = response.text().await?;
        tracing::debug!("📄 Live chat page length: {} chars", html.len());

        let continuation = extract_continuation(&html).ok_or_else(|| {
            tracing::warn!("❌ continuation not found in live chat page");
            RelayError::ChannelNotFound(video_id.to_string())
        })?;

        let mut inner_tube = InnerTube::new(video_id.clone(), continuation);
        inner_tube.api_key = extract_api_key(&html);
        if let Some(version) = extract_client_version(&html) {
            inner_tube.client_version = version;
        }

        tracing::info!(
            "✅ InnerTube initialized (client {}, key {})",
            inner_tube.client_version,
            if inner_tube.api_key.is_some() { "found" } else { "absent" }
        );
        Ok(inner_tube)
    }

    async fn get_live_chat(&self, inner_tube: &InnerTube) -> RelayResult<GetLiveChatResponse> {
        let mut url = format!("{}/youtubei/v1/live_chat/get_live_chat", self.base_url);
        if let Some(key) = &inner_tube.api_key {
            url.push_str(&format!("?key={}", urlencoding::encode(key.as_str())));
        }

        let payload = serde_json::json!({
            "context": {
                "client": {
                    "clientName": "WEB",
                    "clientVersion": inner_tube.client_version.to_string(),
                    "hl": "ja",
                    "gl": "JP",
                }
            },
            "continuation": inner_tube.continuation.to_string(),
        });

        let response = self
            .http
            .post(&url)
            .header("Origin", YOUTUBE_ORIGIN)
            .header(
                "Referer",
                format!("{}/watch?v={}", YOUTUBE_ORIGIN, inner_tube.video_id),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("❌ get_live_chat request failed: {}", e);
                RelayError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("❌ get_live_chat returned {}", status);
            return Err(classify_status(status));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            tracing::error!("❌ Failed to parse get_live_chat response: {}", e);
            tracing::debug!("🔍 Response preview: {}", text.chars().take(200).collect::<String>());
            RelayError::MalformedPayload(format!("get_live_chat: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_TOKEN: &str = "0ofMyANhGlhDaWtxSndvWVZVTnZVMjlPVWxwVWNsWkpSM1YxTVdsWmFYZElTbkIzRWdzMVRtOXdXa";

    #[test]
    fn test_extract_page_fields() {
        let html = format!(
            r#"ytcfg.set({{"INNERTUBE_API_KEY": "AIzaSyTestKey", "INNERTUBE_CLIENT_VERSION": "2.20240101.01.00"}});
               var x = {{"continuation": "short"}};
               var y = {{"reloadContinuationData": {{"continuation": "{}"}}}};"#,
            LONG_TOKEN
        );

        assert_eq!(extract_api_key(&html).unwrap().as_str(), "AIzaSyTestKey");
        assert_eq!(
            extract_client_version(&html).unwrap().to_string(),
            "2.20240101.01.00"
        );
        assert_eq!(extract_continuation(&html).unwrap().0, LONG_TOKEN);
    }

    #[test]
    fn test_short_continuation_rejected() {
        let html = r#"{"continuation": "0ofMyANBElJDaWtnNVFnPT0%3D"}"#;
        assert!(extract_continuation(html).is_none());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RelayError::RateLimited { status: 429 }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            RelayError::RateLimited { status: 403 }
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RelayError::NetworkError(_)
        ));
        assert!(classify_status(StatusCode::BAD_REQUEST).is_fatal());
    }

    #[test]
    fn test_inner_tube_defaults() {
        let inner_tube = InnerTube::new(
            VideoId("abc".to_string()),
            Continuation("token".to_string()),
        );
        assert!(inner_tube.api_key.is_none());
        assert_eq!(inner_tube.client_version.to_string(), DEFAULT_CLIENT_VERSION);
        assert_eq!(inner_tube.continuation.to_string(), "token");
    }
}
