//! 統一アプリケーションコンテキスト
//!
//! プロセス起動時に1つだけ作り、終了時に破棄する。セッション・クォータ・
//! 重複排除の状態にはこのコンテキストが持つ [`SessionController`] 経由でのみ届く。

use crate::api::innertube::{InnerTubeClient, UnofficialApi};
use crate::api::youtube::{ApiKey, OfficialApi, YouTubeClient};
use crate::config::AppConfig;
use crate::database::{PersistenceManager, RelayDatabase};
use crate::error::RelayResult;
use crate::hub::DistributionHub;
use crate::session::SessionController;
use parking_lot::RwLock;
use std::sync::Arc;

pub struct AppContext {
    pub config: AppConfig,
    pub store: PersistenceManager,
    pub hub: Arc<DistributionHub>,
    pub official: Arc<dyn OfficialApi>,
    pub unofficial: Arc<dyn UnofficialApi>,
    pub controller: SessionController,
    /// ホストから渡されたAPIキー（設定ファイルには保存しない）
    credential: RwLock<Option<ApiKey>>,
}

impl AppContext {
    /// 依存を指定して組み立てる
    pub fn new(
        config: AppConfig,
        store: PersistenceManager,
        official: Arc<dyn OfficialApi>,
        unofficial: Arc<dyn UnofficialApi>,
    ) -> Self {
        let hub = Arc::new(DistributionHub::new(&config.server));
        let controller = SessionController::new(
            &config,
            Arc::clone(&official),
            Arc::clone(&unofficial),
            store.clone(),
            Arc::clone(&hub),
        );

        Self {
            config,
            store,
            hub,
            official,
            unofficial,
            controller,
            credential: RwLock::new(None),
        }
    }

    /// 実際のHTTPクライアントとSQLiteで初期化
    pub async fn initialize(config: AppConfig) -> RelayResult<Self> {
        let timeout = config.polling.http_timeout();
        let official: Arc<dyn OfficialApi> = Arc::new(YouTubeClient::new(timeout)?);
        let unofficial: Arc<dyn UnofficialApi> = Arc::new(InnerTubeClient::new(timeout)?);

        let persistence = config.persistence.clone();
        let db = tokio::task::spawn_blocking(move || RelayDatabase::open(&persistence))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        let store = PersistenceManager::new(db, &config.persistence);

        let context = Self::new(config, store, official, unofficial);
        let settings = context.store.load_overlay_settings().await?;
        context.hub.set_latest_settings(settings);
        context.restore_polling_state().await?;

        tracing::info!("✅ Application context initialized");
        Ok(context)
    }

    /// 保存済みのクォータ残量とページトークンを読み込む（24時間を過ぎたものは捨てる）
    pub async fn restore_polling_state(&self) -> RelayResult<bool> {
        match self.store.load_polling_state().await? {
            Some(state) => {
                self.controller.restore_polling_state(state);
                Ok(true)
            }
            None => {
                tracing::debug!("📭 No saved polling state");
                Ok(false)
            }
        }
    }

    pub fn set_credential(&self, credential: Option<ApiKey>) {
        *self.credential.write() = credential;
    }

    pub fn credential(&self) -> Option<ApiKey> {
        self.credential.read().clone()
    }

    /// 実行中のセッションを止めて配信クライアントを切り離す
    pub async fn shutdown(&self) {
        if self.controller.is_active() {
            if let Err(e) = self.controller.stop_active().await {
                tracing::warn!("⚠️ Failed to stop session during shutdown: {}", e);
            }
        }
        self.hub.disconnect_all();
        tracing::info!("👋 Application context shut down");
    }
}
