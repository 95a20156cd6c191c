pub mod innertube; // 非公式エンドポイント（get_live_chat）
pub mod websocket_server; // 表示クライアント向け配信
pub mod youtube; // Data API v3
