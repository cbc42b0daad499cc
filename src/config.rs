//! 计算节点配置
//!
//! JSON 加载, 缺省字段取默认值. 存储路径可由环境变量覆盖.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capacity;
use crate::drone::selection::JobSelectionPolicy;
use crate::ConfigError;

/// 覆盖 `storage_path` 的环境变量
pub const STORAGE_PATH_ENV: &str = "ZERG_COMPUTE_STORAGE_PATH";

pub const DEFAULT_CONTROL_LOOP_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SHARD_STATE_LOG_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_LOCK_TRACE_THRESHOLD_MS: u64 = 10;
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_JOB_NEGOTIATION_TIMEOUT_SECS: f64 = 180.0;

/// 任务超时设置(秒), 0 表示不限制
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub min_job_execution_timeout: f64,
    pub max_job_execution_timeout: f64,
    /// 分片排队加投标最多等这么久, 请求方一直不回复就放弃
    pub job_negotiation_timeout: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            min_job_execution_timeout: 0.0,
            max_job_execution_timeout: 0.0,
            job_negotiation_timeout: DEFAULT_JOB_NEGOTIATION_TIMEOUT_SECS,
        }
    }
}

impl TimeoutConfig {
    pub fn negotiation(&self) -> Duration {
        secs(self.job_negotiation_timeout)
    }

    pub fn min(&self) -> Duration {
        secs(self.min_job_execution_timeout)
    }

    pub fn max(&self) -> Duration {
        secs(self.max_job_execution_timeout)
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeNodeConfig {
    pub capacity: capacity::Config,
    pub job_selection_policy: JobSelectionPolicy,
    pub timeouts: TimeoutConfig,
    pub control_loop_interval_ms: u64,
    pub shard_state_log_interval_secs: u64,
    pub timeout_check_interval_ms: u64,
    /// 估计的网络节点数, 用来算投标前的距离延迟
    pub network_size: usize,
    /// 计算剩余磁盘空间时看这个路径所在的盘
    pub storage_path: PathBuf,
    pub lock_trace_threshold_ms: u64,
}

impl Default for ComputeNodeConfig {
    fn default() -> Self {
        Self {
            capacity: capacity::Config::default(),
            job_selection_policy: JobSelectionPolicy::default(),
            timeouts: TimeoutConfig::default(),
            control_loop_interval_ms: DEFAULT_CONTROL_LOOP_INTERVAL_MS,
            shard_state_log_interval_secs: DEFAULT_SHARD_STATE_LOG_INTERVAL_SECS,
            timeout_check_interval_ms: DEFAULT_TIMEOUT_CHECK_INTERVAL_MS,
            network_size: 1,
            storage_path: std::env::temp_dir(),
            lock_trace_threshold_ms: DEFAULT_LOCK_TRACE_THRESHOLD_MS,
        }
    }
}

impl ComputeNodeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: ComputeNodeConfig = serde_json::from_str(raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(STORAGE_PATH_ENV) {
            if !path.is_empty() {
                self.storage_path = PathBuf::from(path);
            }
        }
    }

    pub fn control_loop_interval(&self) -> Duration {
        Duration::from_millis(self.control_loop_interval_ms.max(1))
    }

    pub fn shard_state_log_interval(&self) -> Duration {
        Duration::from_secs(self.shard_state_log_interval_secs.max(1))
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms.max(1))
    }

    pub fn lock_trace_threshold(&self) -> Duration {
        Duration::from_millis(self.lock_trace_threshold_ms)
    }
}
