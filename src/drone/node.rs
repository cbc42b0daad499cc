//! 计算节点编排
//!
//! 订阅传输层事件, 对新任务跑选择策略, 为选中的任务每个分片起一个状态机,
//! 再把后续事件(投标接受/拒绝、结果接受/拒绝、错误)转成对应分片的动作.
//! 新任务事件在独立任务里处理, 距离延迟和探针不会卡住后续事件.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};

use crate::capacity::{generate_shard_indexes, CapacityManager};
use crate::config::ComputeNodeConfig;
use crate::drone::control_loop::{
    run_shard_state_logger, run_shard_timeout_checker, BacklogControlLoop, Shutdown,
};
use crate::drone::selection::{
    apply_job_selection_policy, calculate_job_node_distance_delay, JobSelectionPolicyProbeData,
};
use crate::drone::shard_fsm::{ShardHandler, ShardRunOutput, ShardState, ShardStateMachine};
use crate::drone::shard_manager::ShardStateMachineManager;
use crate::logging::{log_job_event, JobLogEvent};
use crate::metrics::MetricsSink;
use crate::model::{
    flat_shard_id, short_id, Job, JobEvent, JobEventType, JobShard, RunCommandResult,
};
use crate::plugins::{ExecutorProvider, VerifierProvider};
use crate::resource::{parse_resource_usage_config, ResourceUsageData};
use crate::system::{HostResources, SystemResources};
use crate::transport::Transport;
use crate::PluginError;

pub const EVENT_BID: &str = "compute_node:bid";
pub const EVENT_RUN: &str = "compute_node:run";
pub const EVENT_RESULT: &str = "compute_node:result";
pub const EVENT_ERROR: &str = "compute_node:error";

/// 正在投标或运行的分片
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveJob {
    pub shard_id: String,
    pub state: ShardState,
    pub capacity_requirements: ResourceUsageData,
}

pub struct ComputeNode {
    id: String,
    config: ComputeNodeConfig,
    transport: Arc<dyn Transport>,
    executors: ExecutorProvider,
    verifiers: VerifierProvider,
    metrics: Arc<dyn MetricsSink>,
    capacity: Arc<CapacityManager>,
    shards: Arc<ShardStateMachineManager>,
    control_trigger: Arc<Notify>,
    shutdown: Arc<Shutdown>,
    me: Weak<ComputeNode>,
}

impl ComputeNode {
    /// 用本机资源创建并启动节点
    pub async fn new(
        config: ComputeNodeConfig,
        transport: Arc<dyn Transport>,
        executors: ExecutorProvider,
        verifiers: VerifierProvider,
        metrics: Arc<dyn MetricsSink>,
    ) -> crate::Result<Arc<Self>> {
        let host = HostResources::new(config.storage_path.clone());
        Self::with_system(config, transport, executors, verifiers, metrics, &host).await
    }

    /// 指定物理资源来源, 方便在不同机器上得到一致的结果
    pub async fn with_system(
        config: ComputeNodeConfig,
        transport: Arc<dyn Transport>,
        executors: ExecutorProvider,
        verifiers: VerifierProvider,
        metrics: Arc<dyn MetricsSink>,
        system: &dyn SystemResources,
    ) -> crate::Result<Arc<Self>> {
        let id = transport.host_id().await?;
        let shards = Arc::new(
            ShardStateMachineManager::with_threshold(config.lock_trace_threshold())
                .with_negotiation_timeout(config.timeouts.negotiation()),
        );
        let capacity = Arc::new(CapacityManager::with_system(
            shards.clone(),
            &config.capacity,
            system,
        )?);

        let node = Arc::new_cyclic(|me| Self {
            id,
            config,
            transport,
            executors,
            verifiers,
            metrics,
            capacity,
            shards,
            control_trigger: Arc::new(Notify::new()),
            shutdown: Arc::new(Shutdown::new()),
            me: me.clone(),
        });

        node.start().await?;
        Ok(node)
    }

    async fn start(self: &Arc<Self>) -> crate::Result<()> {
        let events = self.transport.subscribe().await?;
        tokio::spawn(Arc::clone(self).subscription_loop(events));

        let control_loop = BacklogControlLoop::new(
            self.id.clone(),
            self.capacity.clone(),
            self.shards.clone(),
            self.control_trigger.clone(),
            self.shutdown.clone(),
            self.config.control_loop_interval(),
        );
        tokio::spawn(control_loop.run());

        tokio::spawn(run_shard_state_logger(
            self.id.clone(),
            self.shards.clone(),
            self.shutdown.clone(),
            self.config.shard_state_log_interval(),
        ));

        tokio::spawn(run_shard_timeout_checker(
            self.id.clone(),
            self.shards.clone(),
            self.shutdown.clone(),
            self.config.timeout_check_interval(),
        ));

        log::info!("[{}] compute node started", short_id(&self.id));
        Ok(())
    }

    async fn subscription_loop(self: Arc<Self>, mut events: mpsc::Receiver<(JobEvent, Job)>) {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Some((event, job)) if event.event_name == JobEventType::Created => {
                        let node = Arc::clone(&self);
                        tokio::spawn(async move { node.handle_job_event(event, job).await });
                    }
                    Some((event, job)) => self.handle_job_event(event, job).await,
                    None => {
                        log::info!("[{}] event subscription closed", short_id(&self.id));
                        break;
                    }
                },
                _ = self.shutdown.wait() => break,
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> &CapacityManager {
        &self.capacity
    }

    pub fn shards(&self) -> &ShardStateMachineManager {
        &self.shards
    }

    /// 停掉后台循环并取消还没投标的分片. 已经投标或在跑的分片不受影响.
    /// 需要在 tokio 运行时里调用
    pub fn shutdown(&self) {
        log::info!("[{}] shutting down compute node", short_id(&self.id));
        self.shutdown.trigger();
        for machine in self.shards.get_enqueued() {
            tokio::spawn(async move { machine.cancel("compute node shutting down").await });
        }
    }

    pub fn get_active_jobs(&self) -> Vec<ActiveJob> {
        self.shards
            .get_active()
            .iter()
            .map(|machine| ActiveJob {
                shard_id: machine.shard().id(),
                state: machine.current_state(),
                capacity_requirements: machine.capacity().requirements,
            })
            .collect()
    }

    pub fn get_available_capacity(&self) -> ResourceUsageData {
        self.capacity.get_free_space()
    }

    /// 处理一条事件. 这里的错误只记日志, 不会往外抛
    pub async fn handle_job_event(&self, event: JobEvent, job: Job) {
        let job = Arc::new(job);

        if event.event_name == JobEventType::Created {
            self.metrics.inc_jobs_received(&self.id, &job.client_id);
            if let Err(e) = self.on_job_created(job.clone()).await {
                log::error!("[{}] error considering job {}: {}", short_id(&self.id), job.id, e);
            }
            return;
        }

        // 其余事件只关心发给本节点的
        if event.node_id != self.id {
            return;
        }

        let shard_id = flat_shard_id(&event.job_id, event.shard_index);
        let Some(machine) = self.shards.get(&shard_id) else {
            log::debug!(
                "[{}] received {} for unknown shard {}",
                short_id(&self.id),
                event.event_name,
                shard_id
            );
            return;
        };

        match event.event_name {
            JobEventType::BidAccepted => {
                self.metrics
                    .inc_jobs_accepted(&self.id, event.shard_index, &job.client_id);
                dispatch(machine, |m| async move { m.execute().await });
            }
            JobEventType::BidRejected => {
                dispatch(machine, |m| async move { m.bid_rejected().await });
            }
            JobEventType::ResultsAccepted => {
                dispatch(machine, |m| async move { m.publish().await });
            }
            JobEventType::ResultsRejected => {
                dispatch(machine, |m| async move { m.results_rejected().await });
            }
            JobEventType::Error | JobEventType::InvalidRequest => {
                let reason = requester_failure_reason(&event);
                dispatch(machine, |m| async move { m.fail_silently(reason).await });
            }
            other => log::debug!("[{}] ignoring {} for shard {}", short_id(&self.id), other, shard_id),
        }
    }

    async fn on_job_created(&self, job: Arc<Job>) -> crate::Result<()> {
        // 大网络里离任务远的节点不用都来投标
        let Some(delay) = calculate_job_node_distance_delay(
            self.config.network_size,
            &self.id,
            &job.id,
            job.deal.bid_concurrency(),
        ) else {
            log::debug!("[{}] too far from job {}, dropping", short_id(&self.id), job.id);
            return Ok(());
        };
        if !delay.is_zero() {
            log::debug!(
                "[{}] waiting {:?} before selecting job {}",
                short_id(&self.id),
                delay,
                job.id
            );
            tokio::time::sleep(delay).await;
        }

        let Some(requirements) = self.select_job(&job).await? else {
            log::debug!("[{}] passing on job {}", short_id(&self.id), job.id);
            return Ok(());
        };
        let Some(handler) = self.handler() else {
            return Ok(());
        };

        let total_shards = job.execution_plan.total_shards();
        log::info!(
            "[{}] selected job {} ({} shards)",
            short_id(&self.id),
            job.id,
            total_shards
        );
        for index in generate_shard_indexes(total_shards) {
            self.shards.start_shard_state_if_necessary(
                JobShard::new(job.clone(), index),
                handler.clone(),
                requirements,
            );
        }
        Ok(())
    }

    /// 决定要不要接这个任务. 接的话返回每个分片的资源需求.
    ///
    /// 执行器/验证器缺失或没安装是错误, 超时不合要求、资源超过单任务上限、
    /// 策略拒绝都是正常的"不接".
    pub async fn select_job(&self, job: &Job) -> crate::Result<Option<ResourceUsageData>> {
        let timeout = job.spec.get_timeout();
        let bounds = &self.config.timeouts;
        if !bounds.max().is_zero() && timeout > bounds.max() {
            log::info!(
                "[{}] job {} timeout {:?} is above the maximum {:?}",
                short_id(&self.id),
                job.id,
                timeout,
                bounds.max()
            );
            return Ok(None);
        }
        if timeout < bounds.min() {
            log::info!(
                "[{}] job {} timeout {:?} is below the minimum {:?}",
                short_id(&self.id),
                job.id,
                timeout,
                bounds.min()
            );
            return Ok(None);
        }

        let executor = self.executors.get_executor(&job.spec.engine).await?;
        self.verifiers.get_verifier(&job.spec.verifier).await?;

        let mut requirements = parse_resource_usage_config(&job.spec.resources);
        let mut volume_total = 0u64;
        for input in &job.spec.inputs {
            volume_total = volume_total.saturating_add(executor.get_volume_size(input).await?);
        }
        if volume_total > 0 {
            requirements.disk = volume_total / job.execution_plan.total_shards() as u64;
        }

        let (fits, requirements) = self.capacity.filter_requirements(requirements);
        if !fits {
            log::info!(
                "[{}] job {} requirements [{}] exceed the per job limit [{}]",
                short_id(&self.id),
                job.id,
                requirements,
                self.capacity.resource_limits_job()
            );
            return Ok(None);
        }

        let data = JobSelectionPolicyProbeData {
            node_id: self.id.clone(),
            job_id: job.id.clone(),
            spec: job.spec.clone(),
            execution_plan: job.execution_plan,
        };
        let accepted =
            apply_job_selection_policy(&self.config.job_selection_policy, executor.as_ref(), &data)
                .await?;
        Ok(accepted.then_some(requirements))
    }

    fn handler(&self) -> Option<Arc<dyn ShardHandler>> {
        let node: Arc<dyn ShardHandler> = self.me.upgrade()?;
        Some(node)
    }
}

/// 请求方发起的失败, 原因里带上来源
fn requester_failure_reason(event: &JobEvent) -> String {
    match event.event_name {
        JobEventType::InvalidRequest => format!("Request rejected due to: {}", event.status),
        _ => format!("Requester triggered failure due to: {}", event.status),
    }
}

/// 异步投递动作, 状态机忙的时候不会卡住事件循环
fn dispatch<F, Fut>(machine: Arc<ShardStateMachine>, action: F)
where
    F: FnOnce(Arc<ShardStateMachine>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(action(machine));
}

#[async_trait]
impl ShardHandler for ComputeNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    async fn notify_bid_job(&self, shard: &JobShard) -> Result<(), PluginError> {
        log_job_event(&JobLogEvent::new(&self.id, EVENT_BID, &shard.job.id).shard(shard.index));
        self.transport.bid_job(&shard.job.id, shard.index).await
    }

    async fn run_shard(&self, shard: &JobShard) -> Result<ShardRunOutput, PluginError> {
        log_job_event(&JobLogEvent::new(&self.id, EVENT_RUN, &shard.job.id).shard(shard.index));

        let spec = &shard.job.spec;
        let verifier = self.verifiers.get_verifier(&spec.verifier).await?;
        let result_path = verifier.get_shard_result_path(shard).await?;
        let executor = self.executors.get_executor(&spec.engine).await?;

        let timeout = spec.get_timeout();
        let run_output = if timeout.is_zero() {
            executor.run_job(shard, &result_path).await?
        } else {
            tokio::time::timeout(timeout, executor.run_job(shard, &result_path))
                .await
                .map_err(|_| PluginError::Timeout(timeout))??
        };

        let proposal = verifier
            .process_results_folder(&shard.job.id, &result_path)
            .await?;

        Ok(ShardRunOutput {
            result_path,
            proposal,
            run_output: Some(run_output),
        })
    }

    async fn cancel_shard(&self, shard: &JobShard) -> Result<(), PluginError> {
        let executor = self.executors.get_executor(&shard.job.spec.engine).await?;
        executor.cancel_job(shard).await
    }

    async fn notify_shard_execution_finished(
        &self,
        shard: &JobShard,
        status: &str,
        output: &ShardRunOutput,
    ) -> Result<(), PluginError> {
        log_job_event(
            &JobLogEvent::new(&self.id, EVENT_RESULT, &shard.job.id)
                .shard(shard.index)
                .data(serde_json::json!({ "status": status })),
        );
        self.transport
            .submit_result(
                &shard.job.id,
                shard.index,
                status,
                &output.proposal,
                output.run_output.as_ref(),
            )
            .await
    }

    async fn publish_shard(
        &self,
        shard: &JobShard,
        output: &ShardRunOutput,
    ) -> Result<(), PluginError> {
        self.transport
            .publish_result(&shard.job.id, shard.index, &output.result_path)
            .await?;
        self.metrics
            .inc_jobs_completed(&self.id, shard.index, &shard.job.client_id);
        Ok(())
    }

    async fn notify_shard_error(
        &self,
        shard: &JobShard,
        status: &str,
        run_output: Option<&RunCommandResult>,
    ) -> Result<(), PluginError> {
        log_job_event(
            &JobLogEvent::new(&self.id, EVENT_ERROR, &shard.job.id)
                .shard(shard.index)
                .data(serde_json::json!({ "status": status })),
        );
        self.metrics
            .inc_jobs_failed(&self.id, shard.index, &shard.job.client_id);
        self.transport
            .error_job(&shard.job.id, shard.index, status, run_output)
            .await
    }

    fn trigger_backlog_evaluation(&self) {
        self.control_trigger.notify_one();
    }
}
