use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// セッション行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub stream_id: String,
    pub chat_channel_id: String,
    pub poller_kind: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// "stopped" / "failed: ..." など
    pub end_reason: Option<String>,
}

/// 保存済みポーリング状態の有効期限（時間）
pub const POLLING_STATE_EXPIRY_HOURS: i64 = 24;

/// 公式APIのポーリング状態
///
/// セッション終了時と公式APIのポーリングごとに保存し、起動時に読み戻す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingState {
    pub remaining_units: u64,
    pub window_reset_at: DateTime<Utc>,
    pub chat_channel_id: String,
    pub page_token: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl PollingState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.saved_at).num_hours() >= POLLING_STATE_EXPIRY_HOURS
    }
}
