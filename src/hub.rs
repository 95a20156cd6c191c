//! 表示クライアントへの配信ハブ
//!
//! クライアント集合は `RwLock` で守るが、ロックは集合の変更と
//! 送信先のスナップショット取得の間だけ保持する。送信自体は
//! ロック外でクライアントごとのキューに対して行い、一定時間内に
//! 受け取れないクライアントは切り離す。
//!
//! 1回の `broadcast` は1つの [`HubMessage::Events`] としてキューに入るため、
//! クライアントはバッチ全体を受け取るか、まったく受け取らないかのどちらか。

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::models::{EventVariant, PollerKind, RoleFlags, SessionId, StoredEvent};
use crate::settings::{normalize, OverlaySettings};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 表示クライアントのID
pub type ClientId = u64;

/// セッション状態の通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum StatusEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        session_id: SessionId,
        stream_id: String,
        poller: PollerKind,
    },
    /// バックオフ中
    #[serde(rename_all = "camelCase")]
    Paused { reason: String, retry_in_ms: u64 },
    Resumed,
    #[serde(rename_all = "camelCase")]
    Quota {
        remaining_units: u64,
        window_reset_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Stopped {
        session_id: SessionId,
        reason: String,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundAuthor {
    pub id: String,
    pub name: String,
    pub avatar_url: String,
}

/// 表示クライアントに送るイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    #[serde(rename = "event_id")]
    pub event_id: String,
    /// 再接続時の再送カーソル
    pub sequence: i64,
    pub author: OutboundAuthor,
    pub published_at: DateTime<Utc>,
    pub body: String,
    pub flags: RoleFlags,
    pub variant: EventVariant,
}

impl From<&StoredEvent> for OutboundEvent {
    fn from(stored: &StoredEvent) -> Self {
        let event = &stored.event;
        Self {
            event_id: event.id.clone(),
            sequence: stored.sequence,
            author: OutboundAuthor {
                id: event.author_id.clone(),
                name: event.author_display_name.clone(),
                avatar_url: event.author_avatar_url.clone(),
            },
            published_at: event.published_at,
            body: event.body_text.clone(),
            flags: event.role_flags,
            variant: event.variant.clone(),
        }
    }
}

/// クライアントのキューに入るメッセージ
#[derive(Debug, Clone)]
pub enum HubMessage {
    /// 永続化順に並んだ1バッチ
    Events(Arc<Vec<OutboundEvent>>),
    Status(StatusEvent),
    Settings(OverlaySettings),
}

/// 登録済みクライアントの受信側
#[derive(Debug)]
pub struct OverlayClient {
    pub id: ClientId,
    /// このシーケンスより後のイベントを再送してほしい
    pub replay_cursor: Option<i64>,
    pub receiver: mpsc::Receiver<HubMessage>,
}

/// 1回の配信結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct DistributionHub {
    clients: RwLock<HashMap<ClientId, mpsc::Sender<HubMessage>>>,
    next_client_id: AtomicU64,
    queue_depth: usize,
    send_timeout: Duration,
    latest_settings: RwLock<OverlaySettings>,
}

impl DistributionHub {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_limits(config.client_queue_depth, config.client_send_timeout())
    }

    pub fn with_limits(queue_depth: usize, send_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            send_timeout,
            latest_settings: RwLock::new(OverlaySettings::default()),
        }
    }

    /// クライアントを登録
    pub fn register(&self, replay_cursor: Option<i64>) -> OverlayClient {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.clients.write().insert(id, tx);
        tracing::debug!("Registered overlay client {}", id);

        OverlayClient {
            id,
            replay_cursor,
            receiver: rx,
        }
    }

    pub fn unregister(&self, id: ClientId) {
        if self.clients.write().remove(&id).is_some() {
            tracing::debug!("Unregistered overlay client {}", id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// 永続化済みイベントを全クライアントに配信
    pub async fn broadcast(&self, events: &[StoredEvent]) -> DeliveryReport {
        if events.is_empty() {
            return DeliveryReport::default();
        }
        let batch: Vec<OutboundEvent> = events.iter().map(OutboundEvent::from).collect();
        self.deliver(HubMessage::Events(Arc::new(batch))).await
    }

    pub async fn publish_status(&self, status: StatusEvent) -> DeliveryReport {
        self.deliver(HubMessage::Status(status)).await
    }

    /// 正規化した設定を保持し、全クライアントに配信する
    pub async fn broadcast_settings(&self, settings: OverlaySettings) -> OverlaySettings {
        let settings = normalize(settings);
        *self.latest_settings.write() = settings.clone();
        self.deliver(HubMessage::Settings(settings.clone())).await;
        settings
    }

    /// 配信せずに最新設定だけ差し替える（起動時の読み込み用）
    pub fn set_latest_settings(&self, settings: OverlaySettings) {
        *self.latest_settings.write() = normalize(settings);
    }

    pub fn latest_settings(&self) -> OverlaySettings {
        self.latest_settings.read().clone()
    }

    /// 全クライアントを切り離す
    pub fn disconnect_all(&self) {
        let mut clients = self.clients.write();
        let count = clients.len();
        clients.clear();
        if count > 0 {
            tracing::info!("🔌 Disconnected {} overlay clients", count);
        }
    }

    async fn deliver(&self, message: HubMessage) -> DeliveryReport {
        let targets: Vec<(ClientId, mpsc::Sender<HubMessage>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        if targets.is_empty() {
            return DeliveryReport::default();
        }

        let send_timeout = self.send_timeout;
        let results = join_all(targets.into_iter().map(|(id, tx)| {
            let message = message.clone();
            async move {
                let sent = matches!(
                    tokio::time::timeout(send_timeout, tx.send(message)).await,
                    Ok(Ok(()))
                );
                (id, sent)
            }
        }))
        .await;

        let failed: Vec<ClientId> = results
            .iter()
            .filter(|(_, sent)| !sent)
            .map(|(id, _)| *id)
            .collect();

        if !failed.is_empty() {
            let mut clients = self.clients.write();
            for id in &failed {
                if clients.remove(id).is_some() {
                    tracing::info!("🔌 {} - dropped", RelayError::ClientUnresponsive(*id));
                }
            }
        }

        DeliveryReport {
            delivered: results.len() - failed.len(),
            dropped: failed.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatEvent;
    use crate::settings::LayoutPreset;

    fn stored(sequence: i64, id: &str) -> StoredEvent {
        StoredEvent {
            sequence,
            session_id: SessionId("s1".into()),
            event: ChatEvent {
                id: id.to_string(),
                author_id: "UC1".to_string(),
                author_display_name: "Alice".to_string(),
                author_avatar_url: "https://img/a".to_string(),
                published_at: Utc::now(),
                body_text: "hi".to_string(),
                role_flags: RoleFlags {
                    owner: true,
                    ..RoleFlags::default()
                },
                variant: EventVariant::MembershipGift { count: 5 },
            },
        }
    }

    fn event_ids(message: HubMessage) -> Vec<String> {
        match message {
            HubMessage::Events(batch) => batch.iter().map(|e| e.event_id.clone()).collect(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_outbound_wire_layout() {
        let value = serde_json::to_value(OutboundEvent::from(&stored(7, "e1"))).unwrap();
        assert_eq!(value["event_id"], "e1");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["author"]["avatarUrl"], "https://img/a");
        assert_eq!(value["author"]["name"], "Alice");
        assert_eq!(value["flags"]["owner"], true);
        assert_eq!(value["variant"]["tag"], "membershipGift");
        assert_eq!(value["variant"]["count"], 5);
        assert!(value.get("publishedAt").is_some());
    }

    #[test]
    fn test_status_wire_layout() {
        let value = serde_json::to_value(StatusEvent::Paused {
            reason: "rate limited".into(),
            retry_in_ms: 2000,
        })
        .unwrap();
        assert_eq!(value["state"], "paused");
        assert_eq!(value["retryInMs"], 2000);
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_for_every_client() {
        let hub = DistributionHub::with_limits(8, Duration::from_millis(100));
        let mut a = hub.register(None);
        let mut b = hub.register(Some(3));

        let report = hub
            .broadcast(&[stored(1, "x"), stored(2, "y"), stored(3, "z")])
            .await;
        assert_eq!(report, DeliveryReport { delivered: 2, dropped: 0 });

        for client in [&mut a, &mut b] {
            let ids = event_ids(client.receiver.recv().await.unwrap());
            assert_eq!(ids, vec!["x", "y", "z"]);
        }
        assert_eq!(b.replay_cursor, Some(3));
    }

    #[tokio::test]
    async fn test_unresponsive_client_is_dropped() {
        let hub = DistributionHub::with_limits(1, Duration::from_millis(20));
        let _stuck = hub.register(None);
        let mut live = hub.register(None);

        hub.broadcast(&[stored(1, "a")]).await;
        live.receiver.recv().await.unwrap();

        // stuck のキューは満杯のまま
        let report = hub.broadcast(&[stored(2, "b")]).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(hub.client_count(), 1);
        assert_eq!(event_ids(live.receiver.recv().await.unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_closed_client_is_pruned() {
        let hub = DistributionHub::with_limits(4, Duration::from_millis(50));
        let gone = hub.register(None);
        drop(gone);

        let report = hub.broadcast(&[stored(1, "a")]).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_settings_are_normalized_before_push() {
        let hub = DistributionHub::with_limits(4, Duration::from_millis(50));
        let mut client = hub.register(None);

        let mut settings = OverlaySettings::default();
        settings.layout = LayoutPreset::Unknown;
        let pushed = hub.broadcast_settings(settings).await;
        assert_eq!(pushed.layout, LayoutPreset::Streaming);
        assert_eq!(hub.latest_settings(), pushed);

        match client.receiver.recv().await.unwrap() {
            HubMessage::Settings(s) => assert_eq!(s.layout, LayoutPreset::Streaming),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregister_and_disconnect_all() {
        let hub = DistributionHub::with_limits(4, Duration::from_millis(50));
        let a = hub.register(None);
        let mut b = hub.register(None);
        hub.unregister(a.id);
        assert_eq!(hub.client_count(), 1);

        hub.disconnect_all();
        assert_eq!(hub.client_count(), 0);
        assert!(b.receiver.recv().await.is_none());
    }
}
