//! YouTube Data API v3 クライアント（公式・APIキー認証）
//!
//! `videos.list` でライブチャットIDを解決し、`liveChat/messages` を
//! ページトークン付きで取得する。HTTPステータスとエラーボディは
//! [`RelayError`] の分類にそのまま写像する。

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

const DATA_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// 疎通確認に使う公開動画
const PROBE_VIDEO_ID: &str = "dQw4w9WgXcQ";

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub struct VideoId(pub String);

/// APIキー（Debug出力ではマスクする）
#[derive(Clone, PartialEq, Eq, derive_more::Display)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 空白のみのキーはNoneとして扱う
    pub fn from_optional(value: Option<&str>) -> Option<Self> {
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.to_string()))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(4).collect();
        write!(f, "ApiKey({}…)", prefix)
    }
}

/// 配信URLまたは動画IDから動画IDを取り出す
///
/// `watch?v=`, `youtu.be/`, `/live/` 形式のURLと素の11文字IDを受け付ける。
pub fn parse_stream_id(input: &str) -> RelayResult<VideoId> {
    let input = input.trim();
    let bare = Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap();
    if bare.is_match(input) {
        return Ok(VideoId(input.to_string()));
    }

    Regex::new(r"(?:[?&]v=|youtu\.be/|/live/|/shorts/)([A-Za-z0-9_-]{11})")
        .unwrap()
        .captures(input)
        .and_then(|cap| cap.get(1))
        .map(|m| VideoId(m.as_str().to_string()))
        .ok_or_else(|| RelayError::ChannelNotFound(input.to_string()))
}

fn deserialize_string_or_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        Number(u64),
        Text(String),
    }

    match Option::<StringOrNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(StringOrNumber::Number(n)) => Ok(Some(n)),
        Some(StringOrNumber::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// liveChat/messages のレスポンス
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatMessagesResponse {
    #[serde(default, deserialize_with = "deserialize_string_or_u64")]
    pub polling_interval_millis: Option<u64>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub items: Vec<LiveChatMessageItem>,
}

impl LiveChatMessagesResponse {
    /// サーバーが指示したポーリング間隔
    pub fn polling_interval(&self) -> Option<Duration> {
        self.polling_interval_millis.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatMessageItem {
    pub id: String,
    pub snippet: MessageSnippet,
    #[serde(default)]
    pub author_details: Option<AuthorDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnippet {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub display_message: Option<String>,
    #[serde(default)]
    pub super_chat_details: Option<SuperChatDetails>,
    #[serde(default)]
    pub super_sticker_details: Option<SuperStickerDetails>,
    #[serde(default)]
    pub membership_gifting_details: Option<MembershipGiftingDetails>,
    #[serde(default)]
    pub member_milestone_chat_details: Option<MemberMilestoneChatDetails>,
    #[serde(default)]
    pub new_sponsor_details: Option<NewSponsorDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperChatDetails {
    #[serde(default)]
    pub amount_display_string: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_u64")]
    pub amount_micros: Option<u64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub user_comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperStickerDetails {
    #[serde(default)]
    pub super_sticker_metadata: Option<SuperStickerMetadata>,
    #[serde(default)]
    pub amount_display_string: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperStickerMetadata {
    pub sticker_id: String,
    #[serde(default)]
    pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipGiftingDetails {
    #[serde(default)]
    pub gift_memberships_count: Option<u32>,
    #[serde(default)]
    pub gift_memberships_level_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberMilestoneChatDetails {
    #[serde(default)]
    pub member_level_name: Option<String>,
    #[serde(default)]
    pub member_month: Option<u32>,
    #[serde(default)]
    pub user_comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSponsorDetails {
    #[serde(default)]
    pub member_level_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorDetails {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub is_chat_owner: bool,
    #[serde(default)]
    pub is_chat_sponsor: bool,
    #[serde(default)]
    pub is_chat_moderator: bool,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    #[serde(default)]
    live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
    #[serde(default)]
    active_live_chat_id: Option<String>,
}

/// 公式APIの抽象
#[async_trait]
pub trait OfficialApi: Send + Sync {
    /// キーが有効ならtrue、無効ならfalse。判定できない場合はエラー
    async fn validate_credential(&self, key: &ApiKey) -> RelayResult<bool>;

    /// 動画IDからアクティブなライブチャットIDを取得
    async fn resolve_live_chat_id(&self, key: &ApiKey, video_id: &VideoId) -> RelayResult<String>;

    /// チャットメッセージを1ページ取得
    async fn list_messages(
        &self,
        key: &ApiKey,
        live_chat_id: &str,
        page_token: Option<&str>,
    ) -> RelayResult<LiveChatMessagesResponse>;
}

/// エラーレスポンスを分類する
pub fn classify_error_response(status: StatusCode, body: &str) -> RelayError {
    match status {
        StatusCode::UNAUTHORIZED => RelayError::InvalidCredential,
        StatusCode::FORBIDDEN => {
            if body.contains("quotaExceeded") || body.contains("dailyLimitExceeded") {
                RelayError::QuotaExceeded {
                    remaining: 0,
                    required: 0,
                }
            } else if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded")
            {
                RelayError::RateLimited {
                    status: status.as_u16(),
                }
            } else if body.contains("liveChatEnded") || body.contains("liveChatDisabled") {
                RelayError::ChannelNotFound("live chat has ended".to_string())
            } else {
                RelayError::InvalidCredential
            }
        }
        StatusCode::BAD_REQUEST if body.contains("pageTokenInvalid") => {
            RelayError::InvalidPageToken
        }
        StatusCode::BAD_REQUEST if body.contains("keyInvalid") || body.contains("API_KEY_INVALID") => {
            RelayError::InvalidCredential
        }
        StatusCode::NOT_FOUND => RelayError::ChannelNotFound("live chat not found".to_string()),
        StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited {
            status: status.as_u16(),
        },
        s if s.is_server_error() => RelayError::NetworkError(format!("upstream returned {}", s)),
        s => RelayError::MalformedPayload(format!("unexpected status {}", s)),
    }
}

/// Data API v3 のHTTPクライアント
pub struct YouTubeClient {
    http: reqwest::Client,
    base_url: String,
}

impl YouTubeClient {
    pub fn new(timeout: Duration) -> RelayResult<Self> {
        Self::with_base_url(DATA_API_BASE, timeout)
    }

    /// 接続先を差し替える（テスト用のローカルサーバーなど）
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> RelayResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn get_text(&self, url: &str) -> RelayResult<(StatusCode, String)> {
        let response = self.http.get(url).send().await.map_err(|e| {
            tracing::warn!("❌ Data API request failed: {}", e);
            RelayError::from(e)
        })?;
        let status = response.status();
        let body = response.text().await?;
        tracing::debug!("📡 Data API status: {} ({} bytes)", status, body.len());
        Ok((status, body))
    }
}

#[async_trait]
impl OfficialApi for YouTubeClient {
    async fn validate_credential(&self, key: &ApiKey) -> RelayResult<bool> {
        let url = format!(
            "{}/videos?part=id&id={}&key={}",
            self.base_url,
            PROBE_VIDEO_ID,
            urlencoding::encode(key.as_str())
        );
        let (status, body) = self.get_text(&url).await?;
        if status.is_success() {
            return Ok(true);
        }

        match classify_error_response(status, &body) {
            RelayError::InvalidCredential => Ok(false),
            other => Err(other),
        }
    }

    async fn resolve_live_chat_id(&self, key: &ApiKey, video_id: &VideoId) -> RelayResult<String> {
        let url = format!(
            "{}/videos?part=liveStreamingDetails&id={}&key={}",
            self.base_url,
            urlencoding::encode(&video_id.0),
            urlencoding::encode(key.as_str())
        );
        let (status, body) = self.get_text(&url).await?;
        if !status.is_success() {
            return Err(classify_error_response(status, &body));
        }

        let parsed: VideoListResponse = serde_json::from_str(&body)
            .map_err(|e| RelayError::MalformedPayload(format!("videos.list: {}", e)))?;

        parsed
            .items
            .into_iter()
            .next()
            .and_then(|item| item.live_streaming_details)
            .and_then(|details| details.active_live_chat_id)
            .ok_or_else(|| RelayError::ChannelNotFound(video_id.to_string()))
    }

    async fn list_messages(
        &self,
        key: &ApiKey,
        live_chat_id: &str,
        page_token: Option<&str>,
    ) -> RelayResult<LiveChatMessagesResponse> {
        let mut url = format!(
            "{}/liveChat/messages?part=snippet,authorDetails&liveChatId={}&key={}",
            self.base_url,
            urlencoding::encode(live_chat_id),
            urlencoding::encode(key.as_str())
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let (status, body) = self.get_text(&url).await?;
        if !status.is_success() {
            return Err(classify_error_response(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| RelayError::MalformedPayload(format!("liveChat/messages: {}", e)))
    }
}
