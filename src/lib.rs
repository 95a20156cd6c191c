pub mod api;
pub mod app_context;
pub mod commands;
pub mod config;
pub mod database;
pub mod dedup;
pub mod error;
pub mod hub;
pub mod logging;
pub mod models;
pub mod normalizer;
pub mod poller;
pub mod session;
pub mod settings;

pub use api::innertube::get_live_chat;

// Re-export the main error types for convenience
pub use error::{CommandError, ErrorClass, RelayError, RelayResult};

pub use app_context::AppContext;
pub use database::{PersistenceManager, RelayDatabase};
pub use hub::{DistributionHub, OutboundEvent, StatusEvent};
pub use models::{ChatEvent, EventVariant, PollerKind, SaveCommentsResult, SessionId, StoredEvent};
pub use session::{SessionController, SessionSnapshot};
