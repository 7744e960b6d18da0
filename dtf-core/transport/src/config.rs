//! 通信层配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 通信层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// 同步请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// 连续失败多少次后判定 Agent 不可达
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// 退避配置 (调度器重试使用)
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// 退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 最大重试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// 初始延迟（毫秒）
    #[serde(default = "default_initial_delay")]
    pub initial_delay: u64,

    /// 最大延迟（毫秒）
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,

    /// 退避倍数
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_consecutive_failures: default_max_consecutive_failures(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl ReconnectConfig {
    /// 第 `attempt` 次重试前的等待时间 (从 0 开始)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = (self.initial_delay as f64 * factor).min(self.max_delay as f64);
        Duration::from_millis(delay as u64)
    }
}

// 默认值函数
fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
