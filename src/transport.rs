//! 传输层接口
//!
//! 投递任务生命周期事件, 并把投标/结果/错误发回请求方.
//! `InProcessTransport` 是进程内实现, 用于本地调试和测试.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{Job, JobEvent, RunCommandResult};
use crate::sync::TracedMutex;
use crate::PluginError;

/// 订阅通道容量
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn host_id(&self) -> Result<String, PluginError>;

    async fn subscribe(&self) -> Result<mpsc::Receiver<(JobEvent, Job)>, PluginError>;

    async fn bid_job(&self, job_id: &str, shard_index: usize) -> Result<(), PluginError>;

    /// 把执行结果提案交给请求方的验证流程
    async fn submit_result(
        &self,
        job_id: &str,
        shard_index: usize,
        status: &str,
        proposal: &[u8],
        run_output: Option<&RunCommandResult>,
    ) -> Result<(), PluginError>;

    /// 验证通过后发布结果
    async fn publish_result(
        &self,
        job_id: &str,
        shard_index: usize,
        result_path: &Path,
    ) -> Result<(), PluginError>;

    async fn error_job(
        &self,
        job_id: &str,
        shard_index: usize,
        status: &str,
        run_output: Option<&RunCommandResult>,
    ) -> Result<(), PluginError>;
}

/// 节点发出去的消息
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Bid {
        job_id: String,
        shard_index: usize,
    },
    Result {
        job_id: String,
        shard_index: usize,
        status: String,
        proposal: Vec<u8>,
        run_output: Option<RunCommandResult>,
    },
    Published {
        job_id: String,
        shard_index: usize,
        result_path: PathBuf,
    },
    Error {
        job_id: String,
        shard_index: usize,
        status: String,
        run_output: Option<RunCommandResult>,
    },
}

/// 进程内传输
#[derive(Debug)]
pub struct InProcessTransport {
    host_id: String,
    subscribers: TracedMutex<Vec<mpsc::Sender<(JobEvent, Job)>>>,
    outbound: TracedMutex<Vec<OutboundMessage>>,
}

impl InProcessTransport {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            subscribers: TracedMutex::new("InProcessTransport.subscribers", Vec::new()),
            outbound: TracedMutex::new("InProcessTransport.outbound", Vec::new()),
        }
    }

    /// 随机节点 id
    pub fn with_random_id() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// 向所有订阅者广播一条事件
    pub async fn publish(&self, event: JobEvent, job: Job) {
        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            if let Err(e) = subscriber.send((event.clone(), job.clone())).await {
                log::warn!("dropping event {} for closed subscriber: {}", event.event_name, e);
            }
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.outbound.lock().clone()
    }

    /// 轮询等待满足条件的出站消息
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<OutboundMessage>
    where
        F: Fn(&OutboundMessage) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let found = self.outbound.lock().iter().find(|m| predicate(m)).cloned();
            if let Some(found) = found {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn record(&self, message: OutboundMessage) {
        log::debug!("[{}] outbound {:?}", self.host_id, message);
        self.outbound.lock().push(message);
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn host_id(&self) -> Result<String, PluginError> {
        Ok(self.host_id.clone())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<(JobEvent, Job)>, PluginError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.subscribers.lock().push(tx);
        Ok(rx)
    }

    async fn bid_job(&self, job_id: &str, shard_index: usize) -> Result<(), PluginError> {
        self.record(OutboundMessage::Bid {
            job_id: job_id.to_string(),
            shard_index,
        });
        Ok(())
    }

    async fn submit_result(
        &self,
        job_id: &str,
        shard_index: usize,
        status: &str,
        proposal: &[u8],
        run_output: Option<&RunCommandResult>,
    ) -> Result<(), PluginError> {
        self.record(OutboundMessage::Result {
            job_id: job_id.to_string(),
            shard_index,
            status: status.to_string(),
            proposal: proposal.to_vec(),
            run_output: run_output.cloned(),
        });
        Ok(())
    }

    async fn publish_result(
        &self,
        job_id: &str,
        shard_index: usize,
        result_path: &Path,
    ) -> Result<(), PluginError> {
        self.record(OutboundMessage::Published {
            job_id: job_id.to_string(),
            shard_index,
            result_path: result_path.to_path_buf(),
        });
        Ok(())
    }

    async fn error_job(
        &self,
        job_id: &str,
        shard_index: usize,
        status: &str,
        run_output: Option<&RunCommandResult>,
    ) -> Result<(), PluginError> {
        self.record(OutboundMessage::Error {
            job_id: job_id.to_string(),
            shard_index,
            status: status.to_string(),
            run_output: run_output.cloned(),
        });
        Ok(())
    }
}
