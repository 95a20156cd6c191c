//! 公式APIのクォータ管理

use crate::config::QuotaConfig;
use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Duration, Utc};

/// 残りクォータとウィンドウのリセット時刻
///
/// 残量は符号なしで、足りない場合は呼び出しそのものを拒否する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBudget {
    remaining_units: u64,
    daily_units: u64,
    window: Duration,
    window_reset_at: DateTime<Utc>,
}

impl QuotaBudget {
    pub fn new(daily_units: u64, window: Duration) -> Self {
        Self {
            remaining_units: daily_units,
            daily_units,
            window,
            window_reset_at: Utc::now() + window,
        }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::new(config.daily_units, Duration::hours(config.window_hours))
    }

    /// 残量を指定値にする（永続化した残量の復元やテスト用）
    pub fn with_remaining(mut self, units: u64) -> Self {
        self.remaining_units = units.min(self.daily_units);
        self
    }

    /// リセット時刻を指定値にする（永続化した状態の復元用）
    pub fn with_window_reset_at(mut self, at: DateTime<Utc>) -> Self {
        self.window_reset_at = at;
        self
    }

    pub fn remaining_units(&self) -> u64 {
        self.remaining_units
    }

    pub fn window_reset_at(&self) -> DateTime<Utc> {
        self.window_reset_at
    }

    /// ウィンドウを過ぎていれば残量を戻す
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if now >= self.window_reset_at {
            tracing::info!(
                "🔄 Quota window reset ({} units restored)",
                self.daily_units
            );
            self.remaining_units = self.daily_units;
            self.window_reset_at = now + self.window;
        }
    }

    pub fn can_afford(&self, cost: u64) -> bool {
        self.remaining_units >= cost
    }

    /// 呼び出し前のチェック。残量が足りなければ `QuotaExceeded`
    pub fn ensure_available(&self, cost: u64) -> RelayResult<()> {
        if self.can_afford(cost) {
            Ok(())
        } else {
            Err(RelayError::QuotaExceeded {
                remaining: self.remaining_units,
                required: cost,
            })
        }
    }

    /// 呼び出し1回分のコストを差し引く
    pub fn consume(&mut self, cost: u64) -> RelayResult<()> {
        self.ensure_available(cost)?;
        self.remaining_units -= cost;
        Ok(())
    }
}
