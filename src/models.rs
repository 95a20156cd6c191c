//! 正規化済みイベントとセッションのモデル

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// セッションID
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 投稿者のロール
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleFlags {
    pub owner: bool,
    pub moderator: bool,
    pub member: bool,
    pub verified: bool,
}

/// イベント種別
///
/// 種別ごとに必要なフィールドだけを持つ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum EventVariant {
    Text,
    #[serde(rename_all = "camelCase")]
    PaidPromotion { amount: String, currency: String },
    #[serde(rename_all = "camelCase")]
    PaidSticker { sticker_id: String },
    Membership { level: String },
    MembershipGift { count: u32 },
}

impl EventVariant {
    /// DBに保存する短い種別名
    pub fn tag(&self) -> &'static str {
        match self {
            EventVariant::Text => "text",
            EventVariant::PaidPromotion { .. } => "paidPromotion",
            EventVariant::PaidSticker { .. } => "paidSticker",
            EventVariant::Membership { .. } => "membership",
            EventVariant::MembershipGift { .. } => "membershipGift",
        }
    }
}

/// 正規化済みチャットイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    /// プラットフォームが付与したID（セッション内で一意）
    pub id: String,
    pub author_id: String,
    pub author_display_name: String,
    pub author_avatar_url: String,
    pub published_at: DateTime<Utc>,
    pub body_text: String,
    pub role_flags: RoleFlags,
    pub variant: EventVariant,
}

/// 永続化済みイベント（シーケンス番号付き）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// サーバーが付与する単調増加の番号
    pub sequence: i64,
    pub session_id: SessionId,
    pub event: ChatEvent,
}

/// 使用中のポーラー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PollerKind {
    Official,
    Unofficial,
}

impl PollerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollerKind::Official => "official",
            PollerKind::Unofficial => "unofficial",
        }
    }
}

/// セッション状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Polling,
    Stopping,
    Stopped,
}

/// ポーリングセッション
///
/// 変更するのはポーリングループだけ。
#[derive(Debug, Clone)]
pub struct PollSession {
    pub session_id: SessionId,
    pub stream_id: String,
    pub chat_channel_id: String,
    pub poller_kind: PollerKind,
    pub state: SessionState,
    pub next_allowed_poll_at: DateTime<Utc>,
    /// 公式APIのページトークン
    pub continuation_token: Option<String>,
    pub poll_count: u64,
}

impl PollSession {
    pub fn new(
        session_id: SessionId,
        stream_id: impl Into<String>,
        chat_channel_id: impl Into<String>,
        poller_kind: PollerKind,
    ) -> Self {
        Self {
            session_id,
            stream_id: stream_id.into(),
            chat_channel_id: chat_channel_id.into(),
            poller_kind,
            state: SessionState::Idle,
            next_allowed_poll_at: Utc::now(),
            continuation_token: None,
            poll_count: 0,
        }
    }
}

/// バッチ保存の結果
///
/// `saved + failed + skipped` は常にバッチサイズと一致する。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveCommentsResult {
    pub saved: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SaveCommentsResult {
    pub fn total(&self) -> usize {
        self.saved + self.failed + self.skipped
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}
