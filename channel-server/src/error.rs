// 统一低延迟视频流传输系统 - 错误类型定义
//
// 本模块定义了客户端会话可能出现的错误类型，
// 并提供了等待数据时使用的退避策略。

use std::time::Duration;
use thiserror::Error;

/// 客户端会话错误类型
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// 频道不存在
    #[error("Channel not found: {0}")]
    ChannelNotFound(u32),

    /// 频道输出编码器故障
    #[error("Channel {0} is faulted")]
    ChannelFaulted(u32),

    /// 频道尚未产生输出参数
    #[error("Channel {0} has no output yet")]
    NotReady(u32),

    /// 频道或服务关闭
    #[error("Session cancelled")]
    Cancelled,
}

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// 指数退避
    ExponentialBackoff,
    /// 线性退避
    LinearBackoff,
}

/// 退避策略配置
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// 重试策略
    pub retry_strategy: RetryStrategy,
    /// 基础退避时间
    pub backoff_base: Duration,
    /// 最大退避时间
    pub backoff_max: Duration,
}

impl BackoffPolicy {
    /// 计算重试延迟
    ///
    /// # 参数
    ///
    /// - `attempt`: 当前重试次数（从0开始）
    ///
    /// # 返回
    ///
    /// 返回应该等待的时间，不超过 `backoff_max`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self.retry_strategy {
            RetryStrategy::LinearBackoff => {
                let delay = self.backoff_base.saturating_mul(attempt.saturating_add(1));
                delay.min(self.backoff_max)
            }

            RetryStrategy::ExponentialBackoff => {
                let multiplier = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                let delay = self.backoff_base.saturating_mul(multiplier);
                delay.min(self.backoff_max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            SessionError::ChannelNotFound(3),
            SessionError::ChannelFaulted(1),
            SessionError::NotReady(2),
            SessionError::Cancelled,
        ];

        for error in errors {
            let msg = error.to_string();
            assert!(!msg.is_empty());
        }
    }

    #[test]
    fn test_retry_policy_linear_is_capped() {
        let policy = BackoffPolicy {
            retry_strategy: RetryStrategy::LinearBackoff,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(25),
        };

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(20));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(25));
        assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_millis(25));
    }

    #[test]
    fn test_retry_policy_exponential() {
        let policy = BackoffPolicy {
            retry_strategy: RetryStrategy::ExponentialBackoff,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
        };

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(800));
        // 应该被限制在最大值
        assert_eq!(policy.calculate_delay(40), Duration::from_secs(1));
    }

}
