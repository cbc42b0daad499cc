//! 任务选择策略
//!
//! 决定是否对一个任务投标. 优先级: exec 探针 > http 探针 > 内置规则.
//! 另外按节点和任务 id 的哈希距离决定投标前等多久, 太远的直接不投.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::model::{JobExecutionPlan, JobSpec};
use crate::plugins::Executor;
use crate::SelectionError;

/// exec 探针通过这个环境变量拿到探针数据(同时也写到 stdin)
pub const SELECTION_DATA_ENV: &str = "BACALHAU_JOB_SELECTION_PROBE_DATA";

/// exec 和 http 探针的默认超时
pub const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// 距离延迟超过这个值就不投标
pub const MAX_DISTANCE_DELAY: Duration = Duration::from_secs(1);

/// 数据位置要求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSelectionDataLocality {
    /// 所有输入必须已经在本地
    Local,
    #[default]
    Anywhere,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSelectionPolicy {
    pub locality: JobSelectionDataLocality,
    /// 拒绝没有输入的任务
    pub reject_stateless_jobs: bool,
    /// POST 探针数据, 返回 200 才投标
    pub probe_http: Option<String>,
    /// 执行 shell 命令, 退出码 0 才投标
    pub probe_exec: Option<String>,
    /// 外部选择超时(秒), 不填用 [`DEFAULT_SELECTION_TIMEOUT`]
    pub selection_timeout_secs: Option<f64>,
}

impl JobSelectionPolicy {
    pub fn selection_timeout(&self) -> Duration {
        match self.selection_timeout_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
            _ => DEFAULT_SELECTION_TIMEOUT,
        }
    }
}

/// 交给外部探针的数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSelectionPolicyProbeData {
    pub node_id: String,
    pub job_id: String,
    pub spec: JobSpec,
    pub execution_plan: JobExecutionPlan,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub async fn apply_job_selection_policy(
    policy: &JobSelectionPolicy,
    executor: &dyn Executor,
    data: &JobSelectionPolicyProbeData,
) -> Result<bool, SelectionError> {
    if let Some(command) = non_empty(&policy.probe_exec) {
        return run_exec_check(command, data, policy.selection_timeout()).await;
    }

    if let Some(url) = non_empty(&policy.probe_http) {
        return run_http_check(url, data, policy.selection_timeout()).await;
    }

    let inputs = &data.spec.inputs;
    if inputs.is_empty() {
        if policy.reject_stateless_jobs {
            log::info!("Job {} has no inputs - rejecting stateless job", data.job_id);
            return Ok(false);
        }
        return Ok(true);
    }

    if policy.locality == JobSelectionDataLocality::Anywhere {
        return Ok(true);
    }

    let mut found = 0;
    for input in inputs {
        if executor.has_storage_locally(input).await? {
            found += 1;
        }
    }

    if found >= inputs.len() {
        log::info!("Found {} of {} inputs - accepting job {}", found, inputs.len(), data.job_id);
        Ok(true)
    } else {
        log::info!("Found {} of {} inputs - passing on job {}", found, inputs.len(), data.job_id);
        Ok(false)
    }
}

/// 退出码非 0 是"不投标", 不是错误. 超时的探针会被杀掉
async fn run_exec_check(
    command: &str,
    data: &JobSelectionPolicyProbeData,
    timeout: Duration,
) -> Result<bool, SelectionError> {
    let payload = serde_json::to_string(data)?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env(SELECTION_DATA_ENV, &payload)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take();
    let waited = tokio::time::timeout(timeout, async {
        if let Some(mut stdin) = stdin {
            // 探针可能不读 stdin 就退出了
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                log::debug!("selection command did not consume stdin: {}", e);
            }
        }
        child.wait().await
    })
    .await;

    let status = match waited {
        Ok(status) => status?,
        Err(_) => {
            log::warn!("selection command for job {} timed out after {:?}", data.job_id, timeout);
            if let Err(e) = child.kill().await {
                log::debug!("failed to kill selection command: {}", e);
            }
            return Err(SelectionError::Timeout(timeout));
        }
    };
    log::debug!("selection command for job {} exited with {}", data.job_id, status);
    Ok(status.success())
}

async fn run_http_check(
    url: &str,
    data: &JobSelectionPolicyProbeData,
    timeout: Duration,
) -> Result<bool, SelectionError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.post(url).json(data).send().await?;
    log::debug!("selection endpoint for job {} answered {}", data.job_id, response.status());
    Ok(response.status() == reqwest::StatusCode::OK)
}

fn fnv1a_32(value: &str) -> u32 {
    value.bytes().fold(0x811c_9dc5, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// 投标前的等待时间, `None` 表示离得太远, 不投.
///
/// 把节点和任务 id 哈希到同一个 32 位空间, 按 `concurrency / network_size`
/// 把空间切块, 每隔一块多等一秒. 这样大网络里平均只有 `concurrency` 个
/// 节点会立即投标, 其余的看到别人的投标后就不用再凑热闹了.
pub fn calculate_job_node_distance_delay(
    network_size: usize,
    node_id: &str,
    job_id: &str,
    concurrency: usize,
) -> Option<Duration> {
    let node_hash = fnv1a_32(node_id);
    let job_hash = fnv1a_32(job_id);
    let distance = u64::from(node_hash.abs_diff(job_hash));

    let share = concurrency.max(1) as f64 / network_size.max(1) as f64;
    let chunk = ((share * f64::from(u32::MAX)) as u64).max(1);
    let delay = Duration::from_millis((distance / chunk).saturating_mul(1000));

    log::trace!(
        "node/job {}/{}, {}/{}, dist={}, chunk={}, delay={:?}",
        node_id,
        job_id,
        node_hash,
        job_hash,
        distance,
        chunk,
        delay
    );
    if delay > MAX_DISTANCE_DELAY {
        log::debug!("dropped job: node/job {}/{}, delay={:?}", node_id, job_id, delay);
        return None;
    }
    Some(delay)
}
