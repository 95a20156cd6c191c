//! 公式API（liveChat/messages）のポーラー

use super::{ChatPoller, PollBatch, PollContext, RawPayload};
use crate::api::youtube::{ApiKey, OfficialApi};
use crate::error::{RelayError, RelayResult};
use crate::models::PollerKind;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct OfficialPoller {
    api: Arc<dyn OfficialApi>,
    api_key: ApiKey,
    list_cost: u64,
    min_interval: Duration,
}

impl OfficialPoller {
    pub fn new(
        api: Arc<dyn OfficialApi>,
        api_key: ApiKey,
        list_cost: u64,
        min_interval: Duration,
    ) -> Self {
        Self {
            api,
            api_key,
            list_cost,
            min_interval,
        }
    }
}

#[async_trait]
impl ChatPoller for OfficialPoller {
    fn kind(&self) -> PollerKind {
        PollerKind::Official
    }

    async fn poll_once(&mut self, ctx: &mut PollContext<'_>) -> RelayResult<PollBatch> {
        ctx.quota.refresh(Utc::now());
        // 失敗した呼び出しや途中で止めた呼び出しも課金されるため、送る前に差し引く。
        // 足りなければ呼び出さない
        ctx.quota.consume(self.list_cost)?;

        let result = self
            .api
            .list_messages(
                &self.api_key,
                &ctx.session.chat_channel_id,
                ctx.session.continuation_token.as_deref(),
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(RelayError::InvalidPageToken) => {
                tracing::warn!("⚠️ Page token rejected, restarting from the latest page");
                ctx.session.continuation_token = None;
                return Err(RelayError::InvalidPageToken);
            }
            Err(RelayError::QuotaExceeded { .. }) => {
                // サーバー側で枯渇している場合は手元の残量も合わせる
                let remaining = ctx.quota.remaining_units();
                *ctx.quota = ctx.quota.clone().with_remaining(0);
                return Err(RelayError::QuotaExceeded {
                    remaining,
                    required: self.list_cost,
                });
            }
            Err(e) => return Err(e),
        };

        ctx.session.continuation_token = response.next_page_token.clone();
        ctx.session.poll_count += 1;

        let next_interval = response
            .polling_interval()
            .unwrap_or(self.min_interval)
            .max(self.min_interval);
        ctx.session.next_allowed_poll_at = Utc::now()
            + chrono::Duration::from_std(next_interval).unwrap_or(chrono::Duration::zero());

        tracing::debug!(
            "📥 Official poll: {} items, next in {}ms, {} units left",
            response.items.len(),
            next_interval.as_millis(),
            ctx.quota.remaining_units()
        );

        Ok(PollBatch {
            raw: RawPayload::Official(response),
            next_interval,
        })
    }
}
