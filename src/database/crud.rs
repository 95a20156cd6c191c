use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{PollingState, RelayDatabase, SessionRecord};
use crate::error::RelayResult;
use crate::models::{ChatEvent, EventVariant, PollSession, RoleFlags, SessionId, StoredEvent};
use crate::settings::{normalize, OverlaySettings};

const EVENT_COLUMNS: &str = "sequence, session_id, event_id, author_id, author_display_name, \
     author_avatar_url, published_at, body_text, is_owner, is_moderator, is_member, is_verified, \
     variant_data";

/// イベントを1件挿入し、割り当てられたシーケンス番号を返す
///
/// トランザクション内からも呼べるように `Connection` を受け取る。
pub fn insert_event(conn: &Connection, session_id: &SessionId, event: &ChatEvent) -> RelayResult<i64> {
    let variant_data = serde_json::to_string(&event.variant)?;
    let flags = event.role_flags;

    let sequence = conn
        .prepare_cached(
            "INSERT INTO chat_events
             (session_id, event_id, author_id, author_display_name, author_avatar_url,
              published_at, body_text, is_owner, is_moderator, is_member, is_verified,
              variant_tag, variant_data, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?
        .insert(params![
            session_id.as_str(),
            event.id,
            event.author_id,
            event.author_display_name,
            event.author_avatar_url,
            event.published_at,
            event.body_text,
            flags.owner,
            flags.moderator,
            flags.member,
            flags.verified,
            event.variant.tag(),
            variant_data,
            Utc::now(),
        ])?;

    Ok(sequence)
}

fn stored_event_from_row(row: &Row) -> rusqlite::Result<StoredEvent> {
    let variant_data: String = row.get(12)?;
    let variant: EventVariant = serde_json::from_str(&variant_data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e)))?;

    Ok(StoredEvent {
        sequence: row.get(0)?,
        session_id: SessionId(row.get(1)?),
        event: ChatEvent {
            id: row.get(2)?,
            author_id: row.get(3)?,
            author_display_name: row.get(4)?,
            author_avatar_url: row.get(5)?,
            published_at: row.get(6)?,
            body_text: row.get(7)?,
            role_flags: RoleFlags {
                owner: row.get(8)?,
                moderator: row.get(9)?,
                member: row.get(10)?,
                verified: row.get(11)?,
            },
            variant,
        },
    })
}

impl RelayDatabase {
    /// 新しいセッションを記録
    pub fn create_session(&self, session: &PollSession) -> RelayResult<()> {
        self.connection.execute(
            "INSERT INTO sessions (id, stream_id, chat_channel_id, poller_kind, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.session_id.as_str(),
                session.stream_id,
                session.chat_channel_id,
                session.poller_kind.as_str(),
                Utc::now(),
            ],
        )?;

        tracing::info!("Created new session: {}", session.session_id);
        Ok(())
    }

    /// セッションを終了
    pub fn end_session(&self, session_id: &SessionId, reason: &str) -> RelayResult<()> {
        self.connection.execute(
            "UPDATE sessions SET ended_at = ?1, end_reason = ?2 WHERE id = ?3",
            params![Utc::now(), reason, session_id.as_str()],
        )?;

        tracing::info!("Ended session: {} ({})", session_id, reason);
        Ok(())
    }

    pub fn get_session(&self, session_id: &SessionId) -> RelayResult<Option<SessionRecord>> {
        let record = self
            .connection
            .query_row(
                "SELECT id, stream_id, chat_channel_id, poller_kind, started_at, ended_at, end_reason
                 FROM sessions WHERE id = ?1",
                params![session_id.as_str()],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        stream_id: row.get(1)?,
                        chat_channel_id: row.get(2)?,
                        poller_kind: row.get(3)?,
                        started_at: row.get(4)?,
                        ended_at: row.get::<_, Option<DateTime<Utc>>>(5)?,
                        end_reason: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// 指定シーケンスより後のイベントを古い順に取得
    pub fn events_since(&self, after_sequence: i64, limit: usize) -> RelayResult<Vec<StoredEvent>> {
        let mut stmt = self.connection.prepare_cached(&format!(
            "SELECT {} FROM chat_events WHERE sequence > ?1 ORDER BY sequence ASC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![after_sequence, limit as i64], stored_event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// 直近のイベントを古い順に取得
    pub fn recent_events(&self, limit: usize) -> RelayResult<Vec<StoredEvent>> {
        let mut stmt = self.connection.prepare_cached(&format!(
            "SELECT {} FROM chat_events ORDER BY sequence DESC LIMIT ?1",
            EVENT_COLUMNS
        ))?;
        let mut events = stmt
            .query_map(params![limit as i64], stored_event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        events.reverse();
        Ok(events)
    }

    pub fn count_session_events(&self, session_id: &SessionId) -> RelayResult<i64> {
        let count = self.connection.query_row(
            "SELECT COUNT(*) FROM chat_events WHERE session_id = ?1",
            params![session_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// オーバーレイ設定を読み込む（未保存なら既定値）。常に正規化済み
    pub fn load_overlay_settings(&self) -> RelayResult<OverlaySettings> {
        let stored: Option<String> = self
            .connection
            .query_row("SELECT value FROM overlay_settings WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        let settings = match stored {
            Some(json) => serde_json::from_str(&json)?,
            None => OverlaySettings::default(),
        };
        Ok(normalize(settings))
    }

    /// 正規化してから保存し、保存した値を返す
    pub fn save_overlay_settings(&self, settings: &OverlaySettings) -> RelayResult<OverlaySettings> {
        let settings = normalize(settings.clone());
        let json = serde_json::to_string(&settings)?;

        self.connection.execute(
            "INSERT INTO overlay_settings (id, value, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![json, Utc::now()],
        )?;

        tracing::info!("💾 Overlay settings saved");
        Ok(settings)
    }

    /// ポーリング状態を上書き保存
    pub fn save_polling_state(&self, state: &PollingState) -> RelayResult<()> {
        self.connection.execute(
            "INSERT INTO polling_state
             (id, remaining_units, window_reset_at, chat_channel_id, page_token, saved_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                remaining_units = excluded.remaining_units,
                window_reset_at = excluded.window_reset_at,
                chat_channel_id = excluded.chat_channel_id,
                page_token = excluded.page_token,
                saved_at = excluded.saved_at",
            params![
                state.remaining_units as i64,
                state.window_reset_at,
                state.chat_channel_id,
                state.page_token,
                state.saved_at,
            ],
        )?;

        tracing::debug!(
            "💾 Saved polling state ({} units left, chat {})",
            state.remaining_units,
            state.chat_channel_id
        );
        Ok(())
    }

    /// ポーリング状態を読み込む。期限切れなら削除して `None`
    pub fn load_polling_state(&self, now: DateTime<Utc>) -> RelayResult<Option<PollingState>> {
        let state = self
            .connection
            .query_row(
                "SELECT remaining_units, window_reset_at, chat_channel_id, page_token, saved_at
                 FROM polling_state WHERE id = 1",
                [],
                |row| {
                    Ok(PollingState {
                        remaining_units: row.get::<_, i64>(0)?.max(0) as u64,
                        window_reset_at: row.get(1)?,
                        chat_channel_id: row.get(2)?,
                        page_token: row.get(3)?,
                        saved_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        match state {
            Some(state) if state.is_expired(now) => {
                tracing::info!(
                    "🧹 Polling state saved at {} has expired, clearing",
                    state.saved_at
                );
                self.clear_polling_state()?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn clear_polling_state(&self) -> RelayResult<()> {
        self.connection
            .execute("DELETE FROM polling_state WHERE id = 1", [])?;
        Ok(())
    }
}
