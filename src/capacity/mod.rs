//! 容量管理模块
//!
//! 持有总量上限 / 单任务上限 / 单任务默认需求三组数值, 构造后不再变化.
//! 当前占用从不缓存: 每次 `get_free_space` / `get_next_items` 都实时遍历
//! `CapacityTracker`.

pub mod store;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::resource::{
    check_resource_usage, parse_resource_usage_config, ResourceUsageConfig, ResourceUsageData,
};
use crate::system::{get_system_resources, HostResources, SystemResources};
use crate::CapacityError;

pub use store::{ItemList, ItemMap, ItemStoreTracker};

pub const DEFAULT_JOB_CPU: &str = "100m";
pub const DEFAULT_JOB_MEMORY: &str = "100Mb";
pub const DEFAULT_JOB_GPU: &str = "0";

/// 设置后忽略"配置总量不得超过物理资源"的检查, 主要给测试用
pub const OVER_COMMIT_ENV: &str = "BACALHAU_CAPACITY_MANAGER_OVER_COMMIT";

pub fn set_ignore_physical_resources(ignore: bool) {
    if ignore {
        std::env::set_var(OVER_COMMIT_ENV, "1");
    } else {
        std::env::remove_var(OVER_COMMIT_ENV);
    }
}

pub fn should_ignore_physical_resources() -> bool {
    std::env::var(OVER_COMMIT_ENV)
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

/// 容量配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 所有任务加起来最多能用多少
    pub resource_limit_total: ResourceUsageConfig,
    /// 单个任务最多能用多少
    pub resource_limit_job: ResourceUsageConfig,
    /// 任务没有声明需求时按这个算
    pub resource_requirements_default: ResourceUsageConfig,
}

/// 容量管理器眼中的一个工作单元(任务分片)
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityManagerItem {
    pub id: String,
    pub requirements: ResourceUsageData,
}

/// 由分片状态机管理器实现, 容量管理器只读不写
pub trait CapacityTracker: Send + Sync {
    /// 可以投标但还没投标的分片
    fn backlog_iterator(&self, handler: &mut dyn FnMut(&CapacityManagerItem));
    /// 正在投标或正在运行的分片
    fn active_iterator(&self, handler: &mut dyn FnMut(&CapacityManagerItem));
}

pub struct CapacityManager {
    tracker: Arc<dyn CapacityTracker>,
    resource_limits_total: ResourceUsageData,
    resource_limits_job: ResourceUsageData,
    resource_requirements_job_default: ResourceUsageData,
}

fn check_not_greater<T: PartialOrd + ToString>(
    dimension: &'static str,
    lower: T,
    upper: T,
    err: impl FnOnce(&'static str, String, String) -> CapacityError,
) -> Result<(), CapacityError> {
    if lower > upper {
        return Err(err(dimension, lower.to_string(), upper.to_string()));
    }
    Ok(())
}

impl CapacityManager {
    /// 用本机资源(临时目录所在磁盘)构造
    pub fn new(tracker: Arc<dyn CapacityTracker>, config: &Config) -> Result<Self, CapacityError> {
        let host = HostResources::new(std::env::temp_dir());
        Self::with_system(tracker, config, &host)
    }

    pub fn with_system(
        tracker: Arc<dyn CapacityTracker>,
        config: &Config,
        system: &dyn SystemResources,
    ) -> Result<Self, CapacityError> {
        let mut defaults = config.resource_requirements_default.clone();
        if defaults.cpu.is_empty() {
            defaults.cpu = DEFAULT_JOB_CPU.to_string();
        }
        if defaults.memory.is_empty() {
            defaults.memory = DEFAULT_JOB_MEMORY.to_string();
        }
        if defaults.gpu.is_empty() {
            defaults.gpu = DEFAULT_JOB_GPU.to_string();
        }

        let physical = system.physical_resources()?;
        let resource_limits_total = get_system_resources(
            &config.resource_limit_total,
            physical,
            should_ignore_physical_resources(),
        )?;

        // 没配置单任务上限的维度直接用总量
        let mut resource_limits_job = parse_resource_usage_config(&config.resource_limit_job);
        if resource_limits_job.cpu <= 0.0 {
            resource_limits_job.cpu = resource_limits_total.cpu;
        }
        if resource_limits_job.memory == 0 {
            resource_limits_job.memory = resource_limits_total.memory;
        }
        if resource_limits_job.disk == 0 {
            resource_limits_job.disk = resource_limits_total.disk;
        }
        if resource_limits_job.gpu == 0 {
            resource_limits_job.gpu = resource_limits_total.gpu;
        }

        let resource_requirements_job_default = parse_resource_usage_config(&defaults);

        let too_big = |dimension: &'static str, job: String, total: String| CapacityError::JobLimitExceedsTotal {
            dimension,
            job,
            total,
        };
        check_not_greater("CPU", resource_limits_job.cpu, resource_limits_total.cpu, too_big)?;
        check_not_greater("memory", resource_limits_job.memory, resource_limits_total.memory, too_big)?;
        check_not_greater("disk", resource_limits_job.disk, resource_limits_total.disk, too_big)?;
        check_not_greater("GPU", resource_limits_job.gpu, resource_limits_total.gpu, too_big)?;

        // 默认需求比单任务上限还大, 就永远接不到任务, 视为配置错误
        let bad_default = |dimension: &'static str, default: String, limit: String| CapacityError::DefaultExceedsJobLimit {
            dimension,
            default,
            limit,
        };
        let d = &resource_requirements_job_default;
        check_not_greater("CPU", d.cpu, resource_limits_job.cpu, bad_default)?;
        check_not_greater("memory", d.memory, resource_limits_job.memory, bad_default)?;
        check_not_greater("disk", d.disk, resource_limits_job.disk, bad_default)?;
        check_not_greater("GPU", d.gpu, resource_limits_job.gpu, bad_default)?;

        log::debug!(
            "capacity manager limits: total [{}] job [{}] default [{}]",
            resource_limits_total,
            resource_limits_job,
            resource_requirements_job_default
        );

        Ok(Self {
            tracker,
            resource_limits_total,
            resource_limits_job,
            resource_requirements_job_default,
        })
    }

    pub fn resource_limits_total(&self) -> ResourceUsageData {
        self.resource_limits_total
    }

    pub fn resource_limits_job(&self) -> ResourceUsageData {
        self.resource_limits_job
    }

    pub fn resource_requirements_job_default(&self) -> ResourceUsageData {
        self.resource_requirements_job_default
    }

    /// 为空的维度补上默认值, 再和单任务上限比较.
    ///
    /// 比的是单任务上限而不是剩余量: 现在忙不代表以后跑不了.
    pub fn filter_requirements(
        &self,
        mut requirements: ResourceUsageData,
    ) -> (bool, ResourceUsageData) {
        let defaults = &self.resource_requirements_job_default;
        if requirements.cpu <= 0.0 {
            requirements.cpu = defaults.cpu;
        }
        if requirements.memory == 0 {
            requirements.memory = defaults.memory;
        }
        if requirements.disk == 0 {
            requirements.disk = defaults.disk;
        }
        if requirements.gpu == 0 {
            requirements.gpu = defaults.gpu;
        }
        let ok = check_resource_usage(&requirements, &self.resource_limits_job);
        (ok, requirements)
    }

    /// 总量减去所有活跃分片的需求
    pub fn get_free_space(&self) -> ResourceUsageData {
        let mut current = ResourceUsageData::default();
        self.tracker.active_iterator(&mut |item| {
            current = current.add(&item.requirements);
        });
        self.resource_limits_total.saturating_sub(&current)
    }

    /// 按到达顺序(FIFO)挑出现在放得下的积压分片.
    ///
    /// 放不下的跳过但继续往后看, 后面小的分片仍然可以被选中.
    pub fn get_next_items(&self) -> Vec<String> {
        let mut ids = Vec::new();
        let mut free_space = self.get_free_space();

        self.tracker.backlog_iterator(&mut |item| {
            if check_resource_usage(&item.requirements, &free_space) {
                ids.push(item.id.clone());
                free_space = free_space.saturating_sub(&item.requirements);
            }
        });

        ids
    }
}

/// 打乱分片顺序, 避免网络里所有节点都抢同一个分片
pub fn generate_shard_indexes(shard_count: usize) -> Vec<usize> {
    let mut indexes: Vec<usize> = (0..shard_count).collect();
    indexes.shuffle(&mut rand::rng());
    indexes
}
