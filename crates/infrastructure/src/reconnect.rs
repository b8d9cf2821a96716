use std::time::Duration;

use courier_config::ReconnectConfig;

/// 重连退避策略
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    jitter_factor: f64,
    initial_connect_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor,
            initial_connect_attempts: config.initial_connect_attempts,
        }
    }

    /// 第 `attempt` 次（从0开始）失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.as_secs_f64();
        let max = self.max_interval.as_secs_f64();

        // 指数退避并限制最大间隔
        let exponent = attempt.min(32) as i32;
        let capped = (base * self.multiplier.powi(exponent)).min(max);

        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let delay = (capped + jitter).clamp(base, max);

        Duration::from_secs_f64(delay)
    }

    pub fn initial_connect_attempts(&self) -> u32 {
        self.initial_connect_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
