use anyhow::Context;
use chat_relay::api::websocket_server::WebSocketServer;
use chat_relay::config::ConfigManager;
use chat_relay::logging::init_logging;
use chat_relay::models::SessionState;
use chat_relay::{commands, AppContext};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// ライブチャットを取り込み、表示クライアントへ中継する
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(author, version, about)]
struct Args {
    /// 配信URLまたは動画ID
    stream: String,

    /// Data API v3 のAPIキー（未指定なら非公式エンドポイントを使用）
    #[arg(long, env = "CHAT_RELAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// 設定ファイル（未指定ならXDG設定ディレクトリ）
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocketの希望ポート
    #[arg(long)]
    port: Option<u16>,

    /// データベースファイル
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_manager = match &args.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };
    let mut config = config_manager.load_config()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db) = &args.db {
        config.persistence.database_path = Some(db.clone());
    }

    let _log_guard = init_logging(&config.log)?;
    tracing::info!("🎬 Starting chat-relay v{}", env!("CARGO_PKG_VERSION"));

    let context = Arc::new(
        AppContext::initialize(config.clone())
            .await
            .context("Failed to initialize application context")?,
    );
    commands::set_credential(&context, args.api_key.clone());

    let server = WebSocketServer::new(
        config.server.clone(),
        Arc::clone(&context.hub),
        context.store.clone(),
    );
    let port = server.start().await?;
    tracing::info!("📡 Overlay clients can connect to ws://127.0.0.1:{}", port);

    let session_id = commands::start_polling(&context, args.stream.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.kind, e.message))?;
    tracing::info!("▶️ Polling {} (session {})", args.stream, session_id);

    let mut status_tick = tokio::time::interval(Duration::from_millis(500));
    let ended_on_its_own = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Ctrl-C received, shutting down");
                break false;
            }
            _ = status_tick.tick() => {
                let stopped = commands::get_status(&context)
                    .map(|s| s.state == SessionState::Stopped)
                    .unwrap_or(false);
                if stopped {
                    tracing::info!("⏹️ Session ended on its own");
                    break true;
                }
            }
        }
    };

    context.shutdown().await;
    server.stop();

    if ended_on_its_own {
        if let Some(error) = commands::get_status(&context).and_then(|s| s.last_error) {
            anyhow::bail!("session ended with error: {}", error);
        }
    }
    Ok(())
}
