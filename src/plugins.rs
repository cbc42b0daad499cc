//! 执行器/验证器插件接口
//!
//! 真正跑任务、验证结果的插件在本 crate 之外, 这里只定义契约和按名字查找.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::{JobShard, RunCommandResult, StorageSpec};
use crate::PluginError;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn is_installed(&self) -> Result<bool, PluginError>;

    /// 输入数据是否已经在本地
    async fn has_storage_locally(&self, input: &StorageSpec) -> Result<bool, PluginError>;

    /// 输入卷大小(字节), 不知道时为 0
    async fn get_volume_size(&self, _input: &StorageSpec) -> Result<u64, PluginError> {
        Ok(0)
    }

    /// 运行分片, 结果写到 `result_path` 下
    async fn run_job(
        &self,
        shard: &JobShard,
        result_path: &Path,
    ) -> Result<RunCommandResult, PluginError>;

    /// 停掉正在跑的分片. 只在进程内跑的执行器不需要额外动作
    async fn cancel_job(&self, _shard: &JobShard) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn is_installed(&self) -> Result<bool, PluginError>;

    /// 分片结果应该写到哪个目录
    async fn get_shard_result_path(&self, shard: &JobShard) -> Result<PathBuf, PluginError>;

    /// 把结果目录处理成要提交给请求方的提案
    async fn process_results_folder(
        &self,
        job_id: &str,
        result_path: &Path,
    ) -> Result<Vec<u8>, PluginError>;
}

/// 按引擎名查找执行器
#[derive(Clone, Default)]
pub struct ExecutorProvider {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(name.into(), executor);
        self
    }

    /// 找不到或没安装都是错误
    pub async fn get_executor(&self, name: &str) -> Result<Arc<dyn Executor>, PluginError> {
        let executor = self
            .executors
            .get(name)
            .ok_or_else(|| PluginError::ExecutorNotFound(name.to_string()))?;
        if !executor.is_installed().await? {
            return Err(PluginError::ExecutorNotInstalled(name.to_string()));
        }
        Ok(Arc::clone(executor))
    }
}

/// 按名字查找验证器
#[derive(Clone, Default)]
pub struct VerifierProvider {
    verifiers: HashMap<String, Arc<dyn Verifier>>,
}

impl VerifierProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.insert(name.into(), verifier);
        self
    }

    pub async fn get_verifier(&self, name: &str) -> Result<Arc<dyn Verifier>, PluginError> {
        let verifier = self
            .verifiers
            .get(name)
            .ok_or_else(|| PluginError::VerifierNotFound(name.to_string()))?;
        if !verifier.is_installed().await? {
            return Err(PluginError::VerifierNotInstalled(name.to_string()));
        }
        Ok(Arc::clone(verifier))
    }
}
