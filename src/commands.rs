//! ホストシェル向けのコマンド
//!
//! UI層から呼ばれる狭い入口。引数と戻り値はシリアライズ可能な型に限り、
//! エラーは [`CommandError`] に変換して返す。

use crate::api::youtube::{parse_stream_id, ApiKey};
use crate::app_context::AppContext;
use crate::error::{CommandError, RelayError};
use crate::models::{ChatEvent, SessionId};
use crate::normalizer::normalize_official;
use crate::session::SessionSnapshot;
use crate::settings::OverlaySettings;
use serde::Serialize;
use std::time::Duration;

/// `fetch_events_once` の結果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEventsResponse {
    pub events: Vec<ChatEvent>,
    pub next_page_token: Option<String>,
    pub recommended_interval_ms: u64,
}

fn resolve_key(ctx: &AppContext, key: Option<String>) -> Option<ApiKey> {
    ApiKey::from_optional(key.as_deref()).or_else(|| ctx.credential())
}

/// 以降のセッションで使うAPIキーを設定（Noneで解除）
pub fn set_credential(ctx: &AppContext, key: Option<String>) {
    let key = ApiKey::from_optional(key.as_deref());
    tracing::info!(
        "🔑 Credential {}",
        if key.is_some() { "updated" } else { "cleared" }
    );
    ctx.set_credential(key);
}

pub async fn start_polling(ctx: &AppContext, stream_id: String) -> Result<SessionId, CommandError> {
    let session_id = ctx.controller.start(&stream_id, ctx.credential()).await?;
    Ok(session_id)
}

pub async fn stop_polling(ctx: &AppContext) -> Result<(), CommandError> {
    ctx.controller.stop_active().await?;
    Ok(())
}

pub async fn validate_credential(ctx: &AppContext, key: String) -> Result<bool, CommandError> {
    let Some(key) = ApiKey::from_optional(Some(&key)) else {
        return Ok(false);
    };
    Ok(ctx.official.validate_credential(&key).await?)
}

/// 配信のチャットIDを解決する
///
/// キーがあれば公式APIの `activeLiveChatId`、なければ非公式エンドポイントの
/// 初期continuationを返す。
pub async fn resolve_chat_channel(
    ctx: &AppContext,
    stream_id: String,
    key: Option<String>,
) -> Result<String, CommandError> {
    let video_id = parse_stream_id(&stream_id)?;
    match resolve_key(ctx, key) {
        Some(key) => Ok(ctx.official.resolve_live_chat_id(&key, &video_id).await?),
        None => {
            let inner_tube = ctx.unofficial.open_live_chat(&video_id).await?;
            Ok(inner_tube.continuation.0)
        }
    }
}

/// 公式APIで1回だけ取得する（セッションのクォータには影響しない）
pub async fn fetch_events_once(
    ctx: &AppContext,
    chat_channel_id: String,
    key: Option<String>,
    page_token: Option<String>,
) -> Result<FetchEventsResponse, CommandError> {
    let key = resolve_key(ctx, key).ok_or(RelayError::InvalidCredential)?;
    let response = ctx
        .official
        .list_messages(&key, &chat_channel_id, page_token.as_deref())
        .await?;

    let floor = Duration::from_millis(ctx.config.polling.official_min_interval_ms);
    let interval = response.polling_interval().unwrap_or(floor).max(floor);
    let normalized = normalize_official(&response);
    if normalized.dropped > 0 {
        tracing::debug!("🗑️ Dropped {} unsupported items", normalized.dropped);
    }

    Ok(FetchEventsResponse {
        events: normalized.events,
        next_page_token: response.next_page_token,
        recommended_interval_ms: interval.as_millis() as u64,
    })
}

pub fn get_status(ctx: &AppContext) -> Option<SessionSnapshot> {
    ctx.controller.status()
}

pub async fn get_overlay_settings(ctx: &AppContext) -> Result<OverlaySettings, CommandError> {
    Ok(ctx.store.load_overlay_settings().await?)
}

/// 設定を保存して表示クライアントへ配信する
pub async fn update_overlay_settings(
    ctx: &AppContext,
    settings: OverlaySettings,
) -> Result<OverlaySettings, CommandError> {
    let saved = ctx.store.save_overlay_settings(settings).await?;
    Ok(ctx.hub.broadcast_settings(saved).await)
}
