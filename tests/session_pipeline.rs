//! ポーリングセッションの統合テスト
//!
//! フェイクのAPIを使い、ポーリング→正規化→重複排除→保存→配信を通しで確認する。

mod common;

use chat_relay::api::youtube::ApiKey;
use chat_relay::commands;
use chat_relay::database::PollingState;
use chat_relay::hub::{HubMessage, OutboundEvent, OverlayClient, StatusEvent};
use chat_relay::models::{PollerKind, SessionId, SessionState};
use chat_relay::poller::QuotaBudget;
use chat_relay::{AppContext, RelayError, SessionController};
use chrono::Utc;
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 指定件数のイベントが届くまで受信し、途中のステータスも返す
async fn collect_events(
    client: &mut OverlayClient,
    count: usize,
) -> (Vec<OutboundEvent>, Vec<StatusEvent>) {
    let mut events = Vec::new();
    let mut statuses = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while events.len() < count {
        let message = tokio::time::timeout_at(deadline, client.receiver.recv())
            .await
            .expect("timed out waiting for events")
            .expect("hub closed the client");
        match message {
            HubMessage::Events(batch) => events.extend(batch.iter().cloned()),
            HubMessage::Status(status) => statuses.push(status),
            HubMessage::Settings(_) => {}
        }
    }
    (events, statuses)
}

async fn wait_for_stop(ctx: &AppContext) {
    let stopped = wait_until(Duration::from_secs(5), || !ctx.controller.is_active()).await;
    assert!(stopped, "session did not stop on its own");
}

#[tokio::test]
async fn test_unofficial_session_delivers_each_event_once() {
    let official = FakeOfficial::new();
    let unofficial = FakeUnofficial::new();
    // 2ページ目の b と c は1ページ目と重複
    unofficial.push(Ok(innertube_page(&["a", "b", "c"], "cont-1")));
    unofficial.push(Ok(innertube_page(&["b", "c", "d", "e", "f"], "cont-2")));

    let ctx = test_context(test_config(), official.clone(), unofficial.clone());
    let mut client = ctx.hub.register(None);

    let session_id = commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();

    let (events, statuses) = collect_events(&mut client, 6).await;
    let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    // 5件中3件だけが新規
    assert_eq!(ids, vec!["a", "b", "c", "d", "e", "f"]);
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(matches!(
        statuses.first(),
        Some(StatusEvent::Started { poller: PollerKind::Unofficial, .. })
    ));

    let status = commands::get_status(&ctx).unwrap();
    assert_eq!(status.session_id, session_id);
    assert_eq!(status.poller_kind, PollerKind::Unofficial);
    assert_eq!(status.chat_channel_id, "cont-0");
    assert_eq!(status.remaining_quota_units, None);

    commands::stop_polling(&ctx).await.unwrap();

    let stored = ctx.store.recent_events(100).await.unwrap();
    assert_eq!(stored.len(), 6);
    assert!(stored.iter().all(|e| e.session_id == session_id));
    assert_eq!(official.list_calls(), 0);
}

#[tokio::test]
async fn test_stop_during_inflight_poll_returns_within_grace() {
    let unofficial = FakeUnofficial::new();
    unofficial.hang.store(true, std::sync::atomic::Ordering::SeqCst);

    let config = test_config();
    let grace = config.polling.cancellation_grace();
    let ctx = test_context(config, FakeOfficial::new(), unofficial.clone());

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || unofficial.calls() > 0).await);

    let started = Instant::now();
    commands::stop_polling(&ctx).await.unwrap();
    assert!(started.elapsed() < grace, "stop took {:?}", started.elapsed());

    let status = commands::get_status(&ctx).unwrap();
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(status.last_error, None);
    assert!(!ctx.controller.is_active());
}

#[tokio::test]
async fn test_malformed_payload_ends_session() {
    let unofficial = FakeUnofficial::new();
    unofficial.push(Ok(innertube_page(&["a"], "cont-1")));
    unofficial.push(Err(RelayError::MalformedPayload("unexpected shape".into())));

    let ctx = test_context(test_config(), FakeOfficial::new(), unofficial.clone());
    let mut client = ctx.hub.register(None);

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    wait_for_stop(&ctx).await;

    let status = commands::get_status(&ctx).unwrap();
    assert_eq!(status.state, SessionState::Stopped);
    assert!(status.last_error.unwrap().contains("unexpected shape"));

    // 終了前に取れたイベントは配信済み
    let (events, _) = collect_events(&mut client, 1).await;
    assert_eq!(events[0].event_id, "a");

    let mut stopped_with_error = false;
    while let Ok(message) = client.receiver.try_recv() {
        if let HubMessage::Status(StatusEvent::Stopped { error, .. }) = message {
            stopped_with_error = error.is_some();
        }
    }
    assert!(stopped_with_error);

    // 終了済みのセッションは次のstartで回収される
    unofficial.push(Ok(innertube_page(&["b"], "cont-2")));
    tokio_test::assert_ok!(commands::start_polling(&ctx, STREAM_ID.to_string()).await);
    commands::stop_polling(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_retry_then_give_up() {
    let unofficial = FakeUnofficial::new();
    unofficial.push(Err(RelayError::NetworkError("reset".into())));
    unofficial.push(Ok(innertube_page(&["a"], "cont-1")));
    for _ in 0..3 {
        unofficial.push(Err(RelayError::NetworkError("unreachable".into())));
    }

    let ctx = test_context(test_config(), FakeOfficial::new(), unofficial.clone());
    let mut client = ctx.hub.register(None);

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();

    let (events, statuses) = collect_events(&mut client, 1).await;
    assert_eq!(events[0].event_id, "a");
    assert!(statuses
        .iter()
        .any(|s| matches!(s, StatusEvent::Paused { .. })));
    assert!(statuses.iter().any(|s| matches!(s, StatusEvent::Resumed)));

    wait_for_stop(&ctx).await;
    let status = commands::get_status(&ctx).unwrap();
    let error = status.last_error.unwrap();
    assert!(error.contains("3 consecutive failures"), "{}", error);
    assert_eq!(unofficial.calls(), 5);
}

#[tokio::test]
async fn test_only_one_session_at_a_time() {
    let unofficial = FakeUnofficial::new();
    let ctx = test_context(test_config(), FakeOfficial::new(), unofficial);

    let first = commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    let second = commands::start_polling(&ctx, STREAM_ID.to_string()).await;
    assert_eq!(second.unwrap_err().kind, "sessionAlreadyActive");

    let unknown = ctx.controller.stop(&SessionId("unknown".into())).await;
    assert!(matches!(unknown, Err(RelayError::SessionNotFound(_))));
    assert!(ctx.controller.is_active());

    ctx.controller.stop(&first).await.unwrap();
    assert_eq!(
        commands::stop_polling(&ctx).await.unwrap_err().kind,
        "sessionNotFound"
    );
}

#[tokio::test]
async fn test_invalid_credential_falls_back_to_unofficial() {
    let official = FakeOfficial::rejecting(RelayError::InvalidCredential);
    let unofficial = FakeUnofficial::new();
    let ctx = test_context(test_config(), official.clone(), unofficial.clone());
    commands::set_credential(&ctx, Some("bad-key".into()));

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || unofficial.calls() > 0).await);

    let status = commands::get_status(&ctx).unwrap();
    assert_eq!(status.poller_kind, PollerKind::Unofficial);
    assert_eq!(official.resolve_calls(), 1);
    assert_eq!(official.list_calls(), 0);

    commands::stop_polling(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_official_session_spends_quota_and_follows_page_tokens() {
    let official = FakeOfficial::new();
    official.push(Ok(official_page(
        vec![official_text("m1", "hi"), official_text("m2", "yo")],
        Some("page-2"),
        10,
    )));
    official.push(Ok(official_page(vec![official_text("m3", "gg")], None, 10)));

    let config = test_config();
    let daily = config.quota.daily_units;
    let ctx = test_context(config, official.clone(), FakeUnofficial::new());
    let mut client = ctx.hub.register(None);
    commands::set_credential(&ctx, Some("good-key".into()));

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    let (events, _) = collect_events(&mut client, 3).await;
    assert_eq!(events.len(), 3);

    commands::stop_polling(&ctx).await.unwrap();

    let status = commands::get_status(&ctx).unwrap();
    assert_eq!(status.poller_kind, PollerKind::Official);
    assert_eq!(status.chat_channel_id, format!("chat-{}", STREAM_ID));
    // 解決1 + 取得5×回数
    let expected = daily - 1 - 5 * status.poll_count;
    assert_eq!(status.remaining_quota_units, Some(expected));

    let tokens = official.page_tokens.lock().clone();
    assert_eq!(tokens[0], None);
    assert_eq!(tokens[1].as_deref(), Some("page-2"));
}

#[tokio::test]
async fn test_exhausted_quota_skips_official_api() {
    let official = FakeOfficial::new();
    let unofficial = FakeUnofficial::new();
    let config = test_config();
    let store = chat_relay::PersistenceManager::in_memory(Duration::from_secs(2)).unwrap();
    let hub = Arc::new(chat_relay::DistributionHub::new(&config.server));
    let controller = SessionController::new(
        &config,
        official.clone(),
        unofficial.clone(),
        store,
        hub,
    )
    .with_quota(QuotaBudget::new(0, chrono::Duration::hours(24)));

    controller
        .start(STREAM_ID, Some(ApiKey::new("good-key")))
        .await
        .unwrap();
    assert_eq!(
        controller.status().unwrap().poller_kind,
        PollerKind::Unofficial
    );
    assert_eq!(official.resolve_calls(), 0);
    assert_eq!(official.list_calls(), 0);

    controller.stop_active().await.unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_inflight_batch_to_commit() {
    let unofficial = FakeUnofficial::new();
    unofficial.hold.store(true, Ordering::SeqCst);
    unofficial.push(Ok(innertube_page(&["a", "b"], "cont-1")));

    let config = test_config();
    let grace = config.polling.cancellation_grace();
    let ctx = test_context(config, FakeOfficial::new(), unofficial.clone());
    let mut client = ctx.hub.register(None);

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || unofficial.calls() > 0).await);

    // DBを掴んだままポーリングを返し、保存の途中で止める
    let db = ctx.store.database();
    let guard = db.lock();
    unofficial.hold.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (stopped_at, released_at) = tokio::join!(
        async {
            commands::stop_polling(&ctx).await.unwrap();
            Instant::now()
        },
        async move {
            // 猶予時間より長く書き込みを止めておく
            tokio::time::sleep(grace + Duration::from_millis(200)).await;
            let released_at = Instant::now();
            drop(guard);
            released_at
        },
    );
    assert!(stopped_at >= released_at, "stop returned before the batch finished");

    // バッチは丸ごとコミットされてから停止している
    let stored = ctx.store.recent_events(100).await.unwrap();
    let (events, _) = collect_events(&mut client, 2).await;
    assert_eq!(stored.len(), events.len());
    assert_eq!(
        stored.iter().map(|e| e.event.id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );

    let status = commands::get_status(&ctx).unwrap();
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(status.last_error, None);
}

#[tokio::test]
async fn test_server_side_quota_exhaustion_stops_official_calls() {
    let official = FakeOfficial::new();
    official.push(Ok(official_page(
        vec![official_text("m1", "hi")],
        Some("page-2"),
        10,
    )));
    official.push(Err(RelayError::QuotaExceeded {
        remaining: 0,
        required: 5,
    }));

    let ctx = test_context(test_config(), official.clone(), FakeUnofficial::new());
    let mut client = ctx.hub.register(None);
    commands::set_credential(&ctx, Some("good-key".into()));

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    let (events, _) = collect_events(&mut client, 1).await;
    assert_eq!(events[0].event_id, "m1");
    wait_for_stop(&ctx).await;

    // 枯渇を知った後は呼び出さずに失敗を数える
    assert_eq!(official.list_calls(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(official.list_calls(), 2);

    let status = commands::get_status(&ctx).unwrap();
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(status.remaining_quota_units, Some(0));
    let error = status.last_error.unwrap();
    assert!(error.contains("consecutive failures"), "{}", error);

    // 残量0は次の起動にも引き継がれる
    let saved = ctx.store.load_polling_state().await.unwrap().unwrap();
    assert_eq!(saved.remaining_units, 0);
}

#[tokio::test]
async fn test_saved_polling_state_carries_over_to_next_start() {
    let chat_id = format!("chat-{}", STREAM_ID);
    let saved = |remaining_units| PollingState {
        remaining_units,
        window_reset_at: Utc::now() + chrono::Duration::hours(5),
        chat_channel_id: chat_id.clone(),
        page_token: Some("saved-page".to_string()),
        saved_at: Utc::now(),
    };

    // 使い切った状態で終わっていれば公式APIを使わない
    let official = FakeOfficial::new();
    let unofficial = FakeUnofficial::new();
    let ctx = test_context(test_config(), official.clone(), unofficial.clone());
    ctx.store.save_polling_state(saved(0)).await.unwrap();
    assert!(ctx.restore_polling_state().await.unwrap());
    commands::set_credential(&ctx, Some("good-key".into()));

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    assert_eq!(
        commands::get_status(&ctx).unwrap().poller_kind,
        PollerKind::Unofficial
    );
    assert_eq!(official.resolve_calls(), 0);
    commands::stop_polling(&ctx).await.unwrap();

    // 残量があれば保存したページから続ける
    let official = FakeOfficial::new();
    let ctx = test_context(test_config(), official.clone(), FakeUnofficial::new());
    ctx.store.save_polling_state(saved(5_000)).await.unwrap();
    assert!(ctx.restore_polling_state().await.unwrap());
    commands::set_credential(&ctx, Some("good-key".into()));

    commands::start_polling(&ctx, STREAM_ID.to_string())
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || official.list_calls() > 0).await);
    commands::stop_polling(&ctx).await.unwrap();

    let tokens = official.page_tokens.lock().clone();
    assert_eq!(tokens[0].as_deref(), Some("saved-page"));

    let status = commands::get_status(&ctx).unwrap();
    let expected = 5_000 - 1 - 5 * status.poll_count;
    assert_eq!(status.remaining_quota_units, Some(expected));

    let persisted = ctx.store.load_polling_state().await.unwrap().unwrap();
    assert_eq!(persisted.chat_channel_id, chat_id);
    assert_eq!(persisted.remaining_units, expected);
}

#[tokio::test]
async fn test_missing_polling_state_keeps_full_quota() {
    let ctx = test_context(test_config(), FakeOfficial::new(), FakeUnofficial::new());
    assert!(!ctx.restore_polling_state().await.unwrap());
}
