//! ZergCompute 计算节点(Drone)核心库
//!
//! 负责三件事: 容量管理(capacity)、任务分片状态机(drone::shard_fsm)、
//! 以及把传输层事件接到策略和状态机上的编排节点(drone::ComputeNode)。

pub mod capacity;
pub mod config;
pub mod drone;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod plugins;
pub mod resource;
pub mod sync;
pub mod system;
pub mod transport;

use thiserror::Error;

/// 容量配置/系统探测错误, 只在构造阶段出现
#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("单任务资源上限 {dimension} {job} 超过了系统总上限 {total}")]
    JobLimitExceedsTotal {
        dimension: &'static str,
        job: String,
        total: String,
    },

    #[error("任务默认资源 {dimension} {default} 超过了单任务上限 {limit}")]
    DefaultExceedsJobLimit {
        dimension: &'static str,
        default: String,
        limit: String,
    },

    #[error("配置的 {dimension} 超过了本机实际拥有的: 配置 {configured}, 实际 {physical}")]
    ExceedsPhysical {
        dimension: &'static str,
        configured: String,
        physical: String,
    },

    #[error("系统资源探测失败: {0}")]
    SystemProbe(String),
}

/// 执行器/验证器/传输层等外部协作者的错误
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("本机没有匹配的执行器: {0}")]
    ExecutorNotFound(String),

    #[error("执行器未安装: {0}")]
    ExecutorNotInstalled(String),

    #[error("本机没有匹配的验证器: {0}")]
    VerifierNotFound(String),

    #[error("验证器未安装: {0}")]
    VerifierNotInstalled(String),

    #[error("任务执行失败: {0}")]
    Execution(String),

    #[error("结果验证失败: {0}")]
    Verification(String),

    #[error("传输层错误: {0}")]
    Transport(String),

    #[error("任务执行超时({0:?})")]
    Timeout(std::time::Duration),
}

/// 任务选择策略错误. 探针明确回答"不投标"不算错误
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("探针数据序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("探针命令启动失败: {0}")]
    ProbeLaunch(#[from] std::io::Error),

    #[error("http 探针请求失败: {0}")]
    ProbeHttp(#[from] reqwest::Error),

    #[error("外部选择超时({0:?})")]
    Timeout(std::time::Duration),

    #[error("检查输入数据位置出错: {0}")]
    Storage(#[from] PluginError),
}

/// 配置加载错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("解析配置失败: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 计算节点顶层错误
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("容量配置错误: {0}")]
    Capacity(#[from] CapacityError),

    #[error("插件错误: {0}")]
    Plugin(#[from] PluginError),

    #[error("任务选择策略出错: {0}")]
    Selection(#[from] SelectionError),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("指标注册失败: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, ComputeError>;

// 公开导出模块的公共接口
pub use capacity::{CapacityManager, CapacityManagerItem, CapacityTracker};
pub use config::ComputeNodeConfig;
pub use drone::{ComputeNode, ShardState, ShardStateMachineManager};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use resource::{ResourceUsageConfig, ResourceUsageData};
