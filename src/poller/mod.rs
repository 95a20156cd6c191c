//! ポーラー
//!
//! 公式API（クォータ制）と非公式エンドポイントの2系統。どちらも
//! [`ChatPoller::poll_once`] で生ペイロードと次回までの間隔を返す。
//! セッション・クォータの書き換えはポーリングループから渡される
//! [`PollContext`] 経由でのみ行う。

pub mod backoff;
pub mod official;
pub mod quota;
pub mod unofficial;

pub use backoff::ExponentialBackoff;
pub use official::OfficialPoller;
pub use quota::QuotaBudget;
pub use unofficial::UnofficialPoller;

use crate::api::innertube::get_live_chat::GetLiveChatResponse;
use crate::api::youtube::LiveChatMessagesResponse;
use crate::error::RelayResult;
use crate::models::{PollSession, PollerKind};
use async_trait::async_trait;
use std::time::Duration;

/// ポーラーが返す正規化前のペイロード
#[derive(Debug, Clone)]
pub enum RawPayload {
    Official(LiveChatMessagesResponse),
    Unofficial(GetLiveChatResponse),
}

/// 1回分のポーリング結果
#[derive(Debug, Clone)]
pub struct PollBatch {
    pub raw: RawPayload,
    /// 次のポーリングまでの待機時間（最小間隔を反映済み）
    pub next_interval: Duration,
}

/// ポーリングループが所有する可変状態への参照
pub struct PollContext<'a> {
    pub session: &'a mut PollSession,
    pub quota: &'a mut QuotaBudget,
}

#[async_trait]
pub trait ChatPoller: Send + Sync {
    fn kind(&self) -> PollerKind;

    /// 1回ポーリングする
    ///
    /// 戻り値のFutureはキャンセル（drop）されうる。その場合も
    /// `ctx` の状態は呼び出し前と変わらないこと。
    async fn poll_once(&mut self, ctx: &mut PollContext<'_>) -> RelayResult<PollBatch>;
}
