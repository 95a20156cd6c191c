//! 指数バックオフ

use rand::Rng;
use std::time::Duration;

/// ジッタの最大割合（±25%）
const JITTER_FACTOR: f64 = 0.25;

/// リトライ間隔を `base * 2^attempt` で伸ばし、`max` で頭打ちにする
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    current_attempt: u32,
    use_jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, use_jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            current_attempt: 0,
            use_jitter,
        }
    }

    /// 次の待機時間を返し、試行回数を進める
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.current_attempt);
        let delay = self.base_delay.saturating_mul(multiplier).min(self.max_delay);
        self.current_attempt = self.current_attempt.saturating_add(1);

        if self.use_jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// 成功時に呼ぶ
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.current_attempt
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as f64;
    let jitter_range = delay_ms * JITTER_FACTOR;
    if jitter_range <= 0.0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), false);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff.attempt_count(), 6);
    }

    #[test]
    fn test_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(10), false);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(60), true);
        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis();
            assert!((3000..=5000).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), false);
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
    }
}
