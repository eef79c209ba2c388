// 恢复策略：退避档位选择与连接内快速重启预算

use common::BackoffTier;
use std::time::Duration;
use tracing::debug;

use crate::config::{DeviceConfig, PolicyConfig};
use crate::control::ControlConnector;

/// 连接内快速重启预算
///
/// 每次建立连接时重置；快速重启后只要有新帧到达也会重置。
#[derive(Debug, Clone)]
pub struct QuickRestartBudget {
    limit: u32,
    used: u32,
}

impl QuickRestartBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// 申请一次快速重启；预算耗尽时返回false
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    /// 媒体流已经恢复
    pub fn recovered(&mut self) {
        if self.used > 0 {
            debug!("Stream recovered after {} quick restart(s)", self.used);
            self.used = 0;
        }
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// 选择退避档位
///
/// 控制通道仍然在线，或者控制端口可以建立TCP连接，说明设备在线、只是媒体通道异常，
/// 使用短间隔；否则认为设备完全离线。
pub async fn choose_tier(
    control_connected: bool,
    connector: &dyn ControlConnector,
    device: &DeviceConfig,
) -> BackoffTier {
    if control_connected {
        return BackoffTier::Short;
    }
    if connector.probe(device).await {
        BackoffTier::Short
    } else {
        BackoffTier::Long
    }
}

pub fn backoff_interval(policy: &PolicyConfig, tier: BackoffTier) -> Duration {
    match tier {
        BackoffTier::Short => policy.short_backoff,
        BackoffTier::Long => policy.long_backoff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausts_and_recovers() {
        let mut budget = QuickRestartBudget::new(3);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 3);

        budget.recovered();
        assert_eq!(budget.used(), 0);
        assert!(budget.try_consume());
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let mut budget = QuickRestartBudget::new(0);
        assert!(!budget.try_consume());
    }

    #[test]
    fn test_backoff_interval_per_tier() {
        let policy = PolicyConfig::default();
        assert_eq!(backoff_interval(&policy, BackoffTier::Short), Duration::from_secs(5));
        assert_eq!(backoff_interval(&policy, BackoffTier::Long), Duration::from_secs(60));
    }
}
