//! 任务/事件/分片数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::resource::ResourceUsageConfig;

/// 日志里节点 id 只显示前几位
pub const SHORT_ID_LENGTH: usize = 8;

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LENGTH) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// 任务输入存储描述
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSpec {
    pub engine: String,
    pub cid: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub engine: String,
    pub verifier: String,
    pub resources: ResourceUsageConfig,
    pub inputs: Vec<StorageSpec>,
    /// 秒, 0 表示没有声明
    pub timeout: f64,
}

impl JobSpec {
    pub fn get_timeout(&self) -> Duration {
        if self.timeout.is_finite() && self.timeout > 0.0 {
            Duration::from_secs_f64(self.timeout)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutionPlan {
    pub total_shards: usize,
}

impl JobExecutionPlan {
    /// 至少一个分片
    pub fn total_shards(&self) -> usize {
        self.total_shards.max(1)
    }
}

/// 请求方希望多少个节点参与
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDeal {
    pub concurrency: usize,
    /// 至少要收到这么多投标
    pub min_bids: usize,
}

impl JobDeal {
    /// 计算距离延迟时用的并发度, 至少为 1
    pub fn bid_concurrency(&self) -> usize {
        self.concurrency.max(self.min_bids).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub client_id: String,
    pub spec: JobSpec,
    #[serde(default)]
    pub deal: JobDeal,
    pub execution_plan: JobExecutionPlan,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            id: id.into(),
            client_id: String::new(),
            spec,
            deal: JobDeal::default(),
            execution_plan: JobExecutionPlan::default(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventType {
    Created,
    Bid,
    BidAccepted,
    BidRejected,
    ResultsProposed,
    ResultsAccepted,
    ResultsRejected,
    ResultsPublished,
    InvalidRequest,
    Error,
    ComputeError,
}

impl fmt::Display for JobEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 传输层投递过来的任务事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub event_name: JobEventType,
    pub job_id: String,
    /// 事件针对的节点, 为空表示广播
    pub node_id: String,
    pub shard_index: usize,
    pub status: String,
    pub spec: JobSpec,
    pub execution_plan: JobExecutionPlan,
    pub event_time: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(event_name: JobEventType, job_id: impl Into<String>) -> Self {
        Self {
            event_name,
            job_id: job_id.into(),
            node_id: String::new(),
            shard_index: 0,
            status: String::new(),
            spec: JobSpec::default(),
            execution_plan: JobExecutionPlan::default(),
            event_time: Utc::now(),
        }
    }

    pub fn for_node(mut self, node_id: impl Into<String>, shard_index: usize) -> Self {
        self.node_id = node_id.into();
        self.shard_index = shard_index;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// 执行器跑完一个分片的输出, 随结果或错误一起交给请求方
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCommandResult {
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub exit_code: i32,
    /// 执行器自身的错误, 不是任务进程的
    pub runner_error: String,
}

impl RunCommandResult {
    pub fn from_error(msg: impl Into<String>) -> Self {
        Self {
            runner_error: msg.into(),
            ..Self::default()
        }
    }
}

/// 把任务 id 和分片序号拼成状态机索引
pub fn flat_shard_id(job_id: &str, shard_index: usize) -> String {
    format!("{}:{}", job_id, shard_index)
}

/// `flat_shard_id` 的逆操作
pub fn explode_shard_id(flat_id: &str) -> Option<(&str, usize)> {
    let (job_id, index) = flat_id.rsplit_once(':')?;
    Some((job_id, index.parse().ok()?))
}

/// 分配到本节点的一个任务分片
#[derive(Debug, Clone)]
pub struct JobShard {
    pub job: Arc<Job>,
    pub index: usize,
}

impl JobShard {
    pub fn new(job: Arc<Job>, index: usize) -> Self {
        Self { job, index }
    }

    pub fn id(&self) -> String {
        flat_shard_id(&self.job.id, self.index)
    }
}

impl fmt::Display for JobShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job.id, self.index)
    }
}
