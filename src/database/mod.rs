pub mod crud;
pub mod models;
pub mod persistence;

pub use crud::insert_event;
pub use models::*;
pub use persistence::{
    write_batch, BatchBudget, BatchClaim, DeadlineBudget, PersistedBatch, PersistenceManager,
};

use crate::config::{project_dirs, PersistenceConfig};
use crate::error::{RelayError, RelayResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// chat-relay用データベース接続管理
pub struct RelayDatabase {
    pub connection: rusqlite::Connection,
}

impl RelayDatabase {
    /// 新しいデータベース接続を作成
    pub fn new<P: AsRef<Path>>(db_path: P, busy_timeout: Duration) -> RelayResult<Self> {
        let connection = rusqlite::Connection::open(db_path)?;
        connection.busy_timeout(busy_timeout)?;
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        let mut db = Self { connection };

        db.initialize_schema()?;
        Ok(db)
    }

    /// インメモリデータベースを作成（テスト用）
    pub fn new_in_memory() -> RelayResult<Self> {
        let connection = rusqlite::Connection::open_in_memory()?;
        let mut db = Self { connection };

        db.initialize_schema()?;
        Ok(db)
    }

    /// 設定に従って開く（パス未指定ならXDGデータディレクトリ）
    pub fn open(config: &PersistenceConfig) -> RelayResult<Self> {
        let path = match &config.database_path {
            Some(path) => path.clone(),
            None => get_database_path()?,
        };
        tracing::info!("🗄️ Opening database: {}", path.display());
        Self::new(path, Duration::from_millis(config.busy_timeout_ms))
    }

    /// データベーススキーマを初期化
    fn initialize_schema(&mut self) -> RelayResult<()> {
        self.connection.execute_batch(include_str!("schema.sql"))?;
        tracing::debug!("Database schema initialized successfully");
        Ok(())
    }
}

/// XDGデータディレクトリからデータベースパスを取得
pub fn get_database_path() -> RelayResult<PathBuf> {
    let project_dirs = project_dirs().map_err(|e| RelayError::Config(e.to_string()))?;

    let data_dir = project_dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    Ok(data_dir.join("chat-relay.db"))
}
