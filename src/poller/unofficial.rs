//! InnerTube（非公式）のポーラー

use super::{ChatPoller, PollBatch, PollContext, RawPayload};
use crate::api::innertube::get_live_chat::get_next_continuation;
use crate::api::innertube::{Continuation, InnerTube, UnofficialApi};
use crate::error::{RelayError, RelayResult};
use crate::models::PollerKind;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct UnofficialPoller {
    api: Arc<dyn UnofficialApi>,
    inner_tube: InnerTube,
    /// サーバーのヒントに関わらず守る下限
    min_interval: Duration,
}

impl UnofficialPoller {
    pub fn new(api: Arc<dyn UnofficialApi>, inner_tube: InnerTube, min_interval: Duration) -> Self {
        Self {
            api,
            inner_tube,
            min_interval,
        }
    }
}

#[async_trait]
impl ChatPoller for UnofficialPoller {
    fn kind(&self) -> PollerKind {
        PollerKind::Unofficial
    }

    async fn poll_once(&mut self, ctx: &mut PollContext<'_>) -> RelayResult<PollBatch> {
        let response = self.api.get_live_chat(&self.inner_tube).await?;

        if response.live_chat_continuation().is_none() {
            return Err(RelayError::ChannelNotFound(format!(
                "{} (live chat ended)",
                ctx.session.stream_id
            )));
        }

        match get_next_continuation(&response) {
            Some(next) => {
                self.inner_tube.continuation = Continuation(next.continuation.clone());
                self.inner_tube.timeout_ms = next.timeout_ms;
            }
            None => tracing::warn!("⚠️ No next continuation in response, reusing current token"),
        }

        let hint = self.inner_tube.timeout_ms.map(Duration::from_millis);
        let next_interval = hint.unwrap_or(self.min_interval).max(self.min_interval);

        ctx.session.poll_count += 1;
        ctx.session.next_allowed_poll_at = Utc::now()
            + chrono::Duration::from_std(next_interval).unwrap_or(chrono::Duration::zero());

        Ok(PollBatch {
            raw: RawPayload::Unofficial(response),
            next_interval,
        })
    }
}
