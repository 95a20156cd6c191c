//! ポーリングセッションの制御
//!
//! プロセス内でポーリング中のセッションは常に1つだけ。ループは専用タスクで動き、
//! `PollSession`・`QuotaBudget`・`DedupWindow` を所有する唯一の書き手になる。
//! 外からはキャンセルトークンで停止を要求し、状態は `watch` チャネル経由で読む。
//!
//! ループが中断できるのはポーリング中とスリープ中の2箇所だけ。
//! 保存と配信の途中では停止要求を見ないため、バッチは必ずコミットか
//! ロールバックのどちらかで終わってから停止する。

use crate::api::innertube::UnofficialApi;
use crate::api::youtube::{parse_stream_id, ApiKey, OfficialApi, VideoId};
use crate::config::{AppConfig, PollingConfig, QuotaConfig};
use crate::database::{PersistenceManager, PollingState};
use crate::dedup::DedupWindow;
use crate::error::{ErrorClass, RelayError, RelayResult};
use crate::hub::{DistributionHub, StatusEvent};
use crate::models::{PollSession, PollerKind, SessionId, SessionState};
use crate::normalizer::normalize;
use crate::poller::{
    ChatPoller, ExponentialBackoff, OfficialPoller, PollBatch, PollContext, QuotaBudget,
    UnofficialPoller,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// クォータ状況を通知する間隔（公式APIのポーリング回数）
const QUOTA_STATUS_EVERY: u64 = 10;

/// セッション状態の読み取り用コピー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub stream_id: String,
    pub chat_channel_id: String,
    pub poller_kind: PollerKind,
    pub state: SessionState,
    pub poll_count: u64,
    /// 公式APIの場合のみ
    pub remaining_quota_units: Option<u64>,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    fn capture(session: &PollSession, quota: &QuotaBudget, last_error: Option<String>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            stream_id: session.stream_id.clone(),
            chat_channel_id: session.chat_channel_id.clone(),
            poller_kind: session.poller_kind,
            state: session.state,
            poll_count: session.poll_count,
            remaining_quota_units: match session.poller_kind {
                PollerKind::Official => Some(quota.remaining_units()),
                PollerKind::Unofficial => None,
            },
            last_error,
        }
    }
}

/// ループ終了時に返す所有物
struct LoopExit {
    quota: QuotaBudget,
    snapshot: SessionSnapshot,
}

struct ActiveSession {
    session_id: SessionId,
    cancel: CancellationToken,
    handle: JoinHandle<LoopExit>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

enum Slot {
    Idle {
        /// セッションをまたいで引き継ぐクォータ
        quota: QuotaBudget,
        last: Option<SessionSnapshot>,
    },
    /// start/stopの処理中
    Busy,
    Active(ActiveSession),
}

/// セッションコントローラー
///
/// プロセス起動時に1つだけ作り、コマンド層から共有する。
/// 内部のロックは状態の差し替えにだけ使い、await をまたいで保持しない。
pub struct SessionController {
    official: Arc<dyn OfficialApi>,
    unofficial: Arc<dyn UnofficialApi>,
    store: PersistenceManager,
    hub: Arc<DistributionHub>,
    polling: PollingConfig,
    quota_config: QuotaConfig,
    dedup_capacity: usize,
    slot: Mutex<Slot>,
    /// 次の公式セッションで続きから読むためのページトークン
    resume: Mutex<Option<PollingState>>,
}

impl SessionController {
    pub fn new(
        config: &AppConfig,
        official: Arc<dyn OfficialApi>,
        unofficial: Arc<dyn UnofficialApi>,
        store: PersistenceManager,
        hub: Arc<DistributionHub>,
    ) -> Self {
        Self {
            official,
            unofficial,
            store,
            hub,
            polling: config.polling.clone(),
            quota_config: config.quota.clone(),
            dedup_capacity: config.dedup.capacity,
            slot: Mutex::new(Slot::Idle {
                quota: QuotaBudget::from_config(&config.quota),
                last: None,
            }),
            resume: Mutex::new(None),
        }
    }

    /// クォータ残量を指定して作成（テストや残量の復元用）
    pub fn with_quota(self, quota: QuotaBudget) -> Self {
        *self.slot.lock() = Slot::Idle { quota, last: None };
        self
    }

    /// 前回のプロセスが保存したポーリング状態を引き継ぐ
    ///
    /// クォータ残量とリセット時刻はそのまま戻す。ページトークンは次に
    /// 同じチャットIDで公式セッションを始めたときに一度だけ使う。
    pub fn restore_polling_state(&self, state: PollingState) {
        let mut slot = self.slot.lock();
        let Slot::Idle { quota, .. } = &mut *slot else {
            tracing::warn!("⚠️ Session already running, ignoring saved polling state");
            return;
        };

        *quota = QuotaBudget::from_config(&self.quota_config)
            .with_remaining(state.remaining_units)
            .with_window_reset_at(state.window_reset_at);
        tracing::info!(
            "♻️ Restored polling state: {} units left, window resets at {}",
            quota.remaining_units(),
            state.window_reset_at
        );
        *self.resume.lock() = Some(state);
    }

    /// セッションを開始する
    ///
    /// 有効なAPIキーがあり、クォータが足りれば公式APIを使う。
    /// キーが無効またはクォータ不足の場合は非公式エンドポイントに切り替える。
    pub async fn start(&self, stream_id: &str, credential: Option<ApiKey>) -> RelayResult<SessionId> {
        let (mut quota, last) = self.claim_idle().await?;

        let prepared = self.prepare(stream_id, credential, &mut quota).await;
        let (session, poller) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!("❌ Failed to start session for {}: {}", stream_id, e);
                *self.slot.lock() = Slot::Idle { quota, last };
                return Err(e);
            }
        };

        if let Err(e) = self.store.create_session(&session).await {
            *self.slot.lock() = Slot::Idle { quota, last };
            return Err(e);
        }

        let session_id = session.session_id.clone();
        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(SessionSnapshot::capture(&session, &quota, None));

        let state = LoopState {
            session,
            quota,
            poller,
            dedup: DedupWindow::new(self.dedup_capacity),
            transient_backoff: ExponentialBackoff::new(
                Duration::from_millis(self.polling.transient_backoff_base_ms),
                Duration::from_millis(self.polling.transient_backoff_max_ms),
                self.polling.backoff_jitter,
            ),
            rate_limit_backoff: ExponentialBackoff::new(
                Duration::from_millis(self.polling.rate_limit_backoff_base_ms),
                Duration::from_millis(self.polling.rate_limit_backoff_max_ms),
                self.polling.backoff_jitter,
            ),
            consecutive_failures: 0,
            max_consecutive_failures: self.polling.max_consecutive_failures.max(1),
            last_error: None,
        };
        let pipeline = Pipeline {
            store: self.store.clone(),
            hub: Arc::clone(&self.hub),
            snapshot: snapshot_tx,
        };
        let handle = tokio::spawn(run_loop(state, pipeline, cancel.clone()));

        *self.slot.lock() = Slot::Active(ActiveSession {
            session_id: session_id.clone(),
            cancel,
            handle,
            snapshot: snapshot_rx,
        });

        Ok(session_id)
    }

    /// セッションを停止し、ループが終わるまで待つ
    pub async fn stop(&self, session_id: &SessionId) -> RelayResult<()> {
        let active = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Busy) {
                Slot::Active(active) if &active.session_id == session_id => active,
                other => {
                    *slot = other;
                    return Err(RelayError::SessionNotFound(session_id.to_string()));
                }
            }
        };

        tracing::info!("🛑 Stop requested for session {}", session_id);
        active.cancel.cancel();
        let exit = self.join(active).await;
        *self.slot.lock() = Slot::Idle {
            quota: exit.quota,
            last: Some(exit.snapshot),
        };
        Ok(())
    }

    /// 実行中のセッションを停止（IDを知らない呼び出し元向け）
    pub async fn stop_active(&self) -> RelayResult<SessionId> {
        let session_id = match &*self.slot.lock() {
            Slot::Active(active) => active.session_id.clone(),
            _ => return Err(RelayError::SessionNotFound("no active session".to_string())),
        };
        self.stop(&session_id).await?;
        Ok(session_id)
    }

    /// 現在（または直前）のセッション状態
    pub fn status(&self) -> Option<SessionSnapshot> {
        match &*self.slot.lock() {
            Slot::Active(active) => Some(active.snapshot.borrow().clone()),
            Slot::Idle { last, .. } => last.clone(),
            Slot::Busy => None,
        }
    }

    /// ポーリング中のセッションがあるか
    pub fn is_active(&self) -> bool {
        match &*self.slot.lock() {
            Slot::Active(active) => !active.handle.is_finished(),
            Slot::Idle { .. } => false,
            Slot::Busy => true,
        }
    }

    /// Idle状態を取り出す。終了済みのループが残っていれば回収する
    async fn claim_idle(&self) -> RelayResult<(QuotaBudget, Option<SessionSnapshot>)> {
        let finished = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Busy) {
                Slot::Idle { quota, last } => return Ok((quota, last)),
                Slot::Active(active) if active.handle.is_finished() => active,
                Slot::Active(active) => {
                    let id = active.session_id.to_string();
                    *slot = Slot::Active(active);
                    return Err(RelayError::SessionAlreadyActive(id));
                }
                Slot::Busy => {
                    return Err(RelayError::SessionAlreadyActive(
                        "session is starting or stopping".to_string(),
                    ))
                }
            }
        };

        let exit = self.join(finished).await;
        Ok((exit.quota, Some(exit.snapshot)))
    }

    async fn join(&self, mut active: ActiveSession) -> LoopExit {
        let grace = self.polling.cancellation_grace();
        let joined = match tokio::time::timeout(grace, &mut active.handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(
                    "⏱️ Session {} did not stop within {}ms, waiting for in-flight batch",
                    active.session_id,
                    grace.as_millis()
                );
                active.handle.await
            }
        };

        match joined {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!("❌ Poll loop for {} panicked: {}", active.session_id, e);
                let mut snapshot = active.snapshot.borrow().clone();
                snapshot.state = SessionState::Stopped;
                snapshot.last_error = Some(e.to_string());
                LoopExit {
                    quota: QuotaBudget::from_config(&self.quota_config),
                    snapshot,
                }
            }
        }
    }

    async fn prepare(
        &self,
        stream_id: &str,
        credential: Option<ApiKey>,
        quota: &mut QuotaBudget,
    ) -> RelayResult<(PollSession, Box<dyn ChatPoller>)> {
        let video_id = parse_stream_id(stream_id)?;
        let session_id = SessionId::generate();

        if let Some(key) = credential {
            if let Some(chat_id) = self.resolve_official(&key, &video_id, quota).await? {
                tracing::info!("🔑 Using official API for {} (chat {})", video_id.0, chat_id);
                let mut session =
                    PollSession::new(session_id, video_id.0.clone(), chat_id, PollerKind::Official);
                session.continuation_token = self.take_resume_token(&session.chat_channel_id);
                let poller = OfficialPoller::new(
                    Arc::clone(&self.official),
                    key,
                    self.quota_config.list_cost,
                    Duration::from_millis(self.polling.official_min_interval_ms),
                );
                return Ok((session, Box::new(poller)));
            }
        }

        let inner_tube = self.unofficial.open_live_chat(&video_id).await?;
        tracing::info!("🌐 Using unofficial endpoint for {}", video_id.0);
        let session = PollSession::new(
            session_id,
            video_id.0.clone(),
            inner_tube.continuation.0.clone(),
            PollerKind::Unofficial,
        );
        let poller = UnofficialPoller::new(
            Arc::clone(&self.unofficial),
            inner_tube,
            Duration::from_millis(self.polling.unofficial_min_interval_ms),
        );
        Ok((session, Box::new(poller)))
    }

    /// 保存済みのページトークン（チャットIDが一致する場合のみ）
    fn take_resume_token(&self, chat_channel_id: &str) -> Option<String> {
        let saved = self.resume.lock().take()?;
        if saved.chat_channel_id != chat_channel_id {
            return None;
        }
        if saved.page_token.is_some() {
            tracing::info!("⏩ Resuming {} from saved page token", chat_channel_id);
        }
        saved.page_token
    }

    /// 公式APIでチャットIDを解決する。使えない場合は `Ok(None)`
    async fn resolve_official(
        &self,
        key: &ApiKey,
        video_id: &VideoId,
        quota: &mut QuotaBudget,
    ) -> RelayResult<Option<String>> {
        quota.refresh(Utc::now());
        let needed = self.quota_config.resolve_cost + self.quota_config.list_cost;
        if !quota.can_afford(needed) {
            tracing::info!(
                "💸 Quota too low for official API ({} < {}), falling back",
                quota.remaining_units(),
                needed
            );
            return Ok(None);
        }

        match self.official.resolve_live_chat_id(key, video_id).await {
            Ok(chat_id) => {
                quota.consume(self.quota_config.resolve_cost)?;
                Ok(Some(chat_id))
            }
            Err(e @ RelayError::InvalidCredential) | Err(e @ RelayError::QuotaExceeded { .. }) => {
                tracing::warn!("⚠️ Official API unavailable ({}), falling back", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// ループが所有する状態
struct LoopState {
    session: PollSession,
    quota: QuotaBudget,
    poller: Box<dyn ChatPoller>,
    dedup: DedupWindow,
    transient_backoff: ExponentialBackoff,
    rate_limit_backoff: ExponentialBackoff,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
    last_error: Option<String>,
}

impl LoopState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::capture(&self.session, &self.quota, self.last_error.clone())
    }
}

/// ループの出力先
struct Pipeline {
    store: PersistenceManager,
    hub: Arc<DistributionHub>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl Pipeline {
    fn publish(&self, state: &LoopState) {
        // 受信側がいなくても構わない
        let _ = self.snapshot.send(state.snapshot());
    }

    /// 公式APIのクォータとページトークンを書き残す
    async fn save_polling_state(&self, state: &LoopState) {
        if state.session.poller_kind != PollerKind::Official {
            return;
        }
        let saved = PollingState {
            remaining_units: state.quota.remaining_units(),
            window_reset_at: state.quota.window_reset_at(),
            chat_channel_id: state.session.chat_channel_id.clone(),
            page_token: state.session.continuation_token.clone(),
            saved_at: Utc::now(),
        };
        if let Err(e) = self.store.save_polling_state(saved).await {
            tracing::warn!("⚠️ Failed to save polling state: {}", e);
        }
    }

    /// 正規化→重複排除→保存→配信
    async fn deliver(&self, state: &mut LoopState, batch: &PollBatch) {
        let normalized = normalize(&batch.raw);
        if normalized.dropped > 0 {
            tracing::debug!("🗑️ Dropped {} unsupported items", normalized.dropped);
        }

        let admitted = state.dedup.filter(normalized.events);
        if admitted.is_empty() {
            return;
        }

        let persisted = self.store.save(&state.session.session_id, admitted).await;
        // 保存できなかったものは次の重複ポーリングで拾えるように戻す
        state
            .dedup
            .forget(persisted.skipped_ids.iter().map(String::as_str));

        let report = self.hub.broadcast(&persisted.stored).await;
        tracing::debug!(
            "📤 Delivered {} events to {} clients",
            persisted.stored.len(),
            report.delivered
        );
    }
}

async fn run_loop(mut state: LoopState, pipeline: Pipeline, cancel: CancellationToken) -> LoopExit {
    let session_id = state.session.session_id.clone();
    state.session.state = SessionState::Polling;
    pipeline.publish(&state);
    pipeline
        .hub
        .publish_status(StatusEvent::Started {
            session_id: session_id.clone(),
            stream_id: state.session.stream_id.clone(),
            poller: state.poller.kind(),
        })
        .await;
    tracing::info!(
        "▶️ Session {} started ({} poller, stream {})",
        session_id,
        state.poller.kind().as_str(),
        state.session.stream_id
    );

    let outcome: RelayResult<()> = loop {
        let polled = {
            let mut ctx = PollContext {
                session: &mut state.session,
                quota: &mut state.quota,
            };
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = state.poller.poll_once(&mut ctx) => Some(result),
            }
        };
        let Some(result) = polled else {
            break Ok(());
        };

        let delay = match result {
            Ok(batch) => {
                if state.consecutive_failures > 0 {
                    tracing::info!(
                        "✅ Session {} recovered after {} failures",
                        session_id,
                        state.consecutive_failures
                    );
                    pipeline.hub.publish_status(StatusEvent::Resumed).await;
                }
                state.consecutive_failures = 0;
                state.last_error = None;
                state.transient_backoff.reset();
                state.rate_limit_backoff.reset();

                pipeline.deliver(&mut state, &batch).await;

                if state.session.poller_kind == PollerKind::Official
                    && state.session.poll_count % QUOTA_STATUS_EVERY == 0
                {
                    pipeline
                        .hub
                        .publish_status(StatusEvent::Quota {
                            remaining_units: state.quota.remaining_units(),
                            window_reset_at: state.quota.window_reset_at(),
                        })
                        .await;
                }
                batch.next_interval
            }
            Err(e) => {
                let class = e.class();
                if class == ErrorClass::Fatal {
                    break Err(e);
                }

                state.consecutive_failures += 1;
                if state.consecutive_failures >= state.max_consecutive_failures {
                    break Err(RelayError::RetriesExhausted {
                        attempts: state.consecutive_failures,
                        last: Box::new(e),
                    });
                }

                let delay = match class {
                    ErrorClass::Transient => state.transient_backoff.next_delay(),
                    _ => state.rate_limit_backoff.next_delay(),
                };
                tracing::warn!(
                    "⚠️ Poll failed ({:?}): {} - retrying in {}ms (attempt {}/{})",
                    class,
                    e,
                    delay.as_millis(),
                    state.consecutive_failures,
                    state.max_consecutive_failures
                );
                state.last_error = Some(e.to_string());
                pipeline
                    .hub
                    .publish_status(StatusEvent::Paused {
                        reason: e.to_string(),
                        retry_in_ms: delay.as_millis() as u64,
                    })
                    .await;
                delay
            }
        };
        pipeline.publish(&state);
        pipeline.save_polling_state(&state).await;

        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    state.session.state = SessionState::Stopping;
    let (end_reason, error) = match &outcome {
        Ok(()) => ("stopped".to_string(), None),
        Err(e) => {
            tracing::error!("❌ Session {} failed: {}", session_id, e);
            (format!("failed: {}", e), Some(e.to_string()))
        }
    };
    if error.is_some() {
        state.last_error = error.clone();
    }
    pipeline.publish(&state);

    if let Err(e) = pipeline.store.end_session(&session_id, &end_reason).await {
        tracing::warn!("⚠️ Failed to record end of session {}: {}", session_id, e);
    }
    pipeline.save_polling_state(&state).await;
    state.dedup.clear();
    state.session.state = SessionState::Stopped;
    let snapshot = state.snapshot();
    let _ = pipeline.snapshot.send(snapshot.clone());

    pipeline
        .hub
        .publish_status(StatusEvent::Stopped {
            session_id: session_id.clone(),
            reason: if error.is_some() { "failed" } else { "stopped" }.to_string(),
            error,
        })
        .await;
    tracing::info!("⏹️ Session {} ended: {}", session_id, end_reason);

    LoopExit {
        quota: state.quota,
        snapshot,
    }
}
