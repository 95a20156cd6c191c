//! 期限付きバッチ保存
//!
//! 1バッチは1トランザクションで書き込む。期限を過ぎたら残りは
//! 試行せず `skipped` として返す。呼び出し側はさらに外側で
//! ハードタイムアウトを掛け、書き込みスレッドとは [`BatchClaim`]
//! でコミットと放棄のどちらが先かを決める。

use super::{insert_event, PollingState, RelayDatabase};
use crate::config::PersistenceConfig;
use crate::error::{RelayError, RelayResult};
use crate::models::{ChatEvent, PollSession, SaveCommentsResult, SessionId, StoredEvent};
use crate::settings::OverlaySettings;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 書き込みスレッドが詰まった場合に待つ追加時間
const HARD_DEADLINE_SLACK: Duration = Duration::from_millis(500);

/// バッチの残り時間
pub trait BatchBudget: Send + Sync {
    /// `attempted` 件を試行した時点で期限切れか
    fn expired(&self, attempted: usize) -> bool;
}

/// 壁時計の期限
#[derive(Debug, Clone, Copy)]
pub struct DeadlineBudget {
    deadline: Instant,
}

impl DeadlineBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            deadline: Instant::now() + limit,
        }
    }
}

impl BatchBudget for DeadlineBudget {
    fn expired(&self, _attempted: usize) -> bool {
        Instant::now() >= self.deadline
    }
}

const CLAIM_RUNNING: u8 = 0;
const CLAIM_COMMITTING: u8 = 1;
const CLAIM_ABANDONED: u8 = 2;

/// コミットと放棄の排他
///
/// 先に状態を変えた側が勝つ。放棄後にコミットされることはない。
#[derive(Debug, Default)]
pub struct BatchClaim(AtomicU8);

impl BatchClaim {
    pub fn new() -> Self {
        Self(AtomicU8::new(CLAIM_RUNNING))
    }

    pub fn try_commit(&self) -> bool {
        self.0
            .compare_exchange(
                CLAIM_RUNNING,
                CLAIM_COMMITTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn try_abandon(&self) -> bool {
        self.0
            .compare_exchange(
                CLAIM_RUNNING,
                CLAIM_ABANDONED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire) == CLAIM_ABANDONED
    }
}

/// 1バッチの保存結果
#[derive(Debug, Clone, Default)]
pub struct PersistedBatch {
    pub result: SaveCommentsResult,
    /// コミットされたイベント（シーケンス順）
    pub stored: Vec<StoredEvent>,
    /// 試行されなかった、またはロールバックされたイベントのID
    pub skipped_ids: Vec<String>,
}

impl PersistedBatch {
    fn all_skipped(ids: Vec<String>) -> Self {
        Self {
            result: SaveCommentsResult {
                saved: 0,
                failed: 0,
                skipped: ids.len(),
            },
            stored: Vec::new(),
            skipped_ids: ids,
        }
    }

    fn all_failed(count: usize) -> Self {
        Self {
            result: SaveCommentsResult {
                saved: 0,
                failed: count,
                skipped: 0,
            },
            stored: Vec::new(),
            skipped_ids: Vec::new(),
        }
    }
}

/// 1トランザクションでバッチを書き込む（ブロッキング）
pub fn write_batch(
    conn: &mut Connection,
    session_id: &SessionId,
    events: Vec<ChatEvent>,
    budget: &dyn BatchBudget,
    claim: &BatchClaim,
) -> PersistedBatch {
    let total = events.len();
    if claim.is_abandoned() {
        return PersistedBatch::all_skipped(events.into_iter().map(|e| e.id).collect());
    }

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            tracing::error!("❌ Failed to open transaction: {}", e);
            return PersistedBatch::all_failed(total);
        }
    };

    let mut stored = Vec::with_capacity(total);
    let mut skipped_ids = Vec::new();
    let mut failed = 0;

    let mut remaining = events.into_iter();
    let mut attempted = 0;
    for event in remaining.by_ref() {
        if budget.expired(attempted) || claim.is_abandoned() {
            skipped_ids.push(event.id);
            break;
        }
        attempted += 1;

        match insert_event(&tx, session_id, &event) {
            Ok(sequence) => stored.push(StoredEvent {
                sequence,
                session_id: session_id.clone(),
                event,
            }),
            Err(e) => {
                let err = RelayError::PersistenceFailed {
                    event_id: event.id.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!("⚠️ {}", err);
                failed += 1;
            }
        }
    }
    skipped_ids.extend(remaining.map(|e| e.id));

    if !claim.try_commit() {
        // 呼び出し側が既に放棄した。txはdropでロールバック
        tracing::warn!("⏱️ Batch abandoned before commit, rolling back");
        skipped_ids.extend(stored.into_iter().map(|s| s.event.id));
        return PersistedBatch {
            result: SaveCommentsResult {
                saved: 0,
                failed,
                skipped: total - failed,
            },
            stored: Vec::new(),
            skipped_ids,
        };
    }

    if let Err(e) = tx.commit() {
        tracing::error!("❌ Failed to commit batch: {}", e);
        return PersistedBatch {
            result: SaveCommentsResult {
                saved: 0,
                failed: failed + stored.len(),
                skipped: skipped_ids.len(),
            },
            stored: Vec::new(),
            skipped_ids,
        };
    }

    PersistedBatch {
        result: SaveCommentsResult {
            saved: stored.len(),
            failed,
            skipped: skipped_ids.len(),
        },
        stored,
        skipped_ids,
    }
}

/// 永続化マネージャー
///
/// SQLite接続は1本をMutexで共有し、操作はすべて `spawn_blocking` で行う。
#[derive(Clone)]
pub struct PersistenceManager {
    db: Arc<Mutex<RelayDatabase>>,
    deadline: Duration,
}

impl PersistenceManager {
    pub fn new(db: RelayDatabase, config: &PersistenceConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            deadline: config.batch_deadline(),
        }
    }

    /// インメモリDBで作成（テスト用）
    pub fn in_memory(deadline: Duration) -> RelayResult<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(RelayDatabase::new_in_memory()?)),
            deadline,
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn database(&self) -> Arc<Mutex<RelayDatabase>> {
        self.db.clone()
    }

    /// 既定の期限でバッチを保存
    pub async fn save(&self, session_id: &SessionId, events: Vec<ChatEvent>) -> PersistedBatch {
        let budget = DeadlineBudget::new(self.deadline);
        self.save_with_budget(session_id, events, Box::new(budget))
            .await
    }

    /// 任意の期限判定でバッチを保存
    ///
    /// 書き込みスレッドが期限内に戻らない場合は放棄を試み、成功すれば
    /// バッチ全体を `skipped` として返す。既にコミット中なら完了を待つ。
    pub async fn save_with_budget(
        &self,
        session_id: &SessionId,
        events: Vec<ChatEvent>,
        budget: Box<dyn BatchBudget>,
    ) -> PersistedBatch {
        if events.is_empty() {
            return PersistedBatch::default();
        }

        let total = events.len();
        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let claim = Arc::new(BatchClaim::new());

        let db = self.db.clone();
        let writer_claim = claim.clone();
        let writer_session = session_id.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            let mut db = db.lock();
            write_batch(
                &mut db.connection,
                &writer_session,
                events,
                budget.as_ref(),
                &writer_claim,
            )
        });

        let hard_limit = self.deadline + HARD_DEADLINE_SLACK;
        let joined = match tokio::time::timeout(hard_limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                if claim.try_abandon() {
                    let err = RelayError::DeadlineExceeded {
                        deadline_ms: self.deadline.as_millis() as u64,
                    };
                    tracing::warn!("⏱️ {} - {} events skipped", err, total);
                    return PersistedBatch::all_skipped(ids);
                }
                handle.await
            }
        };

        let batch = match joined {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("❌ Persistence task failed: {}", e);
                PersistedBatch::all_failed(total)
            }
        };

        if batch.result.is_clean() {
            tracing::debug!("💾 Saved {} events", batch.result.saved);
        } else {
            tracing::warn!(
                "⚠️ Batch partially saved: saved={}, failed={}, skipped={}",
                batch.result.saved,
                batch.result.failed,
                batch.result.skipped
            );
        }
        batch
    }

    async fn run_blocking<T, F>(&self, f: F) -> RelayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&RelayDatabase) -> RelayResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let db = db.lock();
            f(&db)
        })
        .await
        .map_err(|e| RelayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    pub async fn create_session(&self, session: &PollSession) -> RelayResult<()> {
        let session = session.clone();
        self.run_blocking(move |db| db.create_session(&session))
            .await
    }

    pub async fn end_session(&self, session_id: &SessionId, reason: &str) -> RelayResult<()> {
        let session_id = session_id.clone();
        let reason = reason.to_string();
        self.run_blocking(move |db| db.end_session(&session_id, &reason))
            .await
    }

    pub async fn events_since(&self, after_sequence: i64, limit: usize) -> RelayResult<Vec<StoredEvent>> {
        self.run_blocking(move |db| db.events_since(after_sequence, limit))
            .await
    }

    pub async fn recent_events(&self, limit: usize) -> RelayResult<Vec<StoredEvent>> {
        self.run_blocking(move |db| db.recent_events(limit)).await
    }

    pub async fn load_overlay_settings(&self) -> RelayResult<OverlaySettings> {
        self.run_blocking(|db| db.load_overlay_settings()).await
    }

    pub async fn save_overlay_settings(&self, settings: OverlaySettings) -> RelayResult<OverlaySettings> {
        self.run_blocking(move |db| db.save_overlay_settings(&settings))
            .await
    }

    pub async fn save_polling_state(&self, state: PollingState) -> RelayResult<()> {
        self.run_blocking(move |db| db.save_polling_state(&state))
            .await
    }

    /// 期限内の保存済みポーリング状態
    pub async fn load_polling_state(&self) -> RelayResult<Option<PollingState>> {
        self.run_blocking(|db| db.load_polling_state(Utc::now()))
            .await
    }
}
