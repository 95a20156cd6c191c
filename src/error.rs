//! エラー型定義
//!
//! 取り込みパイプライン全体で共有するエラー分類。ポーリングループは
//! [`RelayError::class`] の結果だけを見てリトライ方針を決める。

use serde::Serialize;
use thiserror::Error;

/// パイプラインのエラー
#[derive(Error, Debug)]
pub enum RelayError {
    /// APIキーが無効
    #[error("API key is invalid or missing")]
    InvalidCredential,

    /// クォータ不足（呼び出しは行われていない）
    #[error("Quota exceeded: {remaining} units left, {required} required")]
    QuotaExceeded { remaining: u64, required: u64 },

    /// レート制限
    #[error("Rate limited by upstream (status {status})")]
    RateLimited { status: u16 },

    /// 一時的なネットワーク障害
    #[error("Network error: {0}")]
    NetworkError(String),

    /// ページトークンが無効（先頭から取り直す）
    #[error("Invalid page token - resetting pagination")]
    InvalidPageToken,

    /// ペイロード形式が想定と異なる（セッション継続不可）
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// ライブチャットが存在しない、または終了した
    #[error("Live chat not found for {0}")]
    ChannelNotFound(String),

    /// 既にセッションがポーリング中
    #[error("Session {0} is already active")]
    SessionAlreadyActive(String),

    /// 指定セッションが存在しない
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 個別イベントの保存失敗
    #[error("Failed to persist event {event_id}: {reason}")]
    PersistenceFailed { event_id: String, reason: String },

    /// バッチ保存の期限切れ
    #[error("Persistence deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    /// 表示クライアントが応答しない
    #[error("Client {0} is unresponsive")]
    ClientUnresponsive(u64),

    /// 一時的エラーのリトライ上限到達
    #[error("Giving up after {attempts} consecutive failures: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<RelayError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// リトライ判定用の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 短いバックオフで再試行
    Transient,
    /// 長めの指数バックオフで再試行
    RateLimited,
    /// セッションを終了する
    Fatal,
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::NetworkError(_) | RelayError::InvalidPageToken => ErrorClass::Transient,
            RelayError::RateLimited { .. } | RelayError::QuotaExceeded { .. } => {
                ErrorClass::RateLimited
            }
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// コマンド層に返す短い種別名
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidCredential => "invalidCredential",
            RelayError::QuotaExceeded { .. } => "quotaExceeded",
            RelayError::RateLimited { .. } => "rateLimited",
            RelayError::NetworkError(_) => "networkError",
            RelayError::InvalidPageToken => "invalidPageToken",
            RelayError::MalformedPayload(_) => "malformedPayload",
            RelayError::ChannelNotFound(_) => "channelNotFound",
            RelayError::SessionAlreadyActive(_) => "sessionAlreadyActive",
            RelayError::SessionNotFound(_) => "sessionNotFound",
            RelayError::PersistenceFailed { .. } => "persistenceFailed",
            RelayError::DeadlineExceeded { .. } => "deadlineExceeded",
            RelayError::ClientUnresponsive(_) => "clientUnresponsive",
            RelayError::RetriesExhausted { .. } => "retriesExhausted",
            RelayError::Database(_) => "database",
            RelayError::Serialization(_) => "serialization",
            RelayError::Io(_) => "io",
            RelayError::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RelayError::MalformedPayload(e.to_string())
        } else {
            RelayError::NetworkError(e.to_string())
        }
    }
}

/// ホストシェルへ返すエラー表現
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub kind: String,
    pub message: String,
}

impl From<RelayError> for CommandError {
    fn from(err: RelayError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<RelayError> for String {
    fn from(err: RelayError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            RelayError::NetworkError("reset".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            RelayError::RateLimited { status: 429 }.class(),
            ErrorClass::RateLimited
        );
        assert_eq!(
            RelayError::QuotaExceeded {
                remaining: 0,
                required: 5
            }
            .class(),
            ErrorClass::RateLimited
        );
        assert!(RelayError::MalformedPayload("shape".into()).is_fatal());
        assert!(RelayError::ChannelNotFound("abc".into()).is_fatal());
        assert!(RelayError::InvalidCredential.is_fatal());
    }

    #[test]
    fn test_retries_exhausted_is_fatal() {
        let err = RelayError::RetriesExhausted {
            attempts: 8,
            last: Box::new(RelayError::NetworkError("timeout".into())),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("8 consecutive failures"));
    }

    #[test]
    fn test_command_error_conversion() {
        let err: CommandError = RelayError::SessionAlreadyActive("s1".into()).into();
        assert_eq!(err.kind, "sessionAlreadyActive");
        assert!(err.message.contains("s1"));

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\""));
        assert!(json.contains("\"message\""));
    }
}
