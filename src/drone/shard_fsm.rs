//! 任务分片状态机
//!
//! 每个分片一个 tokio 任务, 通过自己的请求通道接收动作, 按下面的生命周期推进:
//!
//! ```text
//! Enqueued -> Bidding -> Running -> PublishingToVerifier -> VerifyingResults
//!          -> PublishingToRequester -> Completed
//! Enqueued -> Cancelled -> Completed
//! 任意阶段失败 -> Error -> Completed
//! ```
//!
//! 状态迁移本身是纯函数 [`transition`], 副作用(投标、执行、发布)由任务循环完成.
//! Running 期间收到 Fail 会取消执行, 不再提交结果.
//! Enqueued 和 Bidding 有协商截止时间, 过期后由节点的超时检查让它失败.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::capacity::CapacityManagerItem;
use crate::model::{short_id, JobShard, RunCommandResult};
use crate::sync::TracedMutex;
use crate::PluginError;

/// 请求通道容量. 发送方在状态机忙时会等待
pub const REQUEST_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ShardState {
    /// 已选中, 等待容量后再投标
    Enqueued,
    /// 已投标, 等待接受或拒绝
    Bidding,
    Running,
    PublishingToVerifier,
    VerifyingResults,
    PublishingToRequester,
    /// 投标前被取消, 不需要通知任何人
    Cancelled,
    Error,
    /// 终态, 无论成功还是失败
    Completed,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardAction {
    /// 容量已就绪, 去投标
    Bid,
    BidRejected,
    /// 只在投标前有效, 之后会被忽略
    Cancel,
    /// 投标被接受, 开始执行
    Run,
    /// 请求方拒绝了结果提案
    ResultsRejected,
    /// 结果验证通过, 发布
    Publish,
    Fail,
}

impl fmt::Display for ShardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRequest {
    pub action: ShardAction,
    pub reason: String,
    pub skip_notify_on_failure: bool,
}

impl ShardRequest {
    pub fn new(action: ShardAction) -> Self {
        Self {
            action,
            reason: String::new(),
            skip_notify_on_failure: false,
        }
    }

    pub fn with_reason(action: ShardAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            skip_notify_on_failure: false,
        }
    }

    pub fn fail(reason: impl Into<String>, skip_notify_on_failure: bool) -> Self {
        Self {
            action: ShardAction::Fail,
            reason: reason.into(),
            skip_notify_on_failure,
        }
    }
}

/// 驱动状态迁移的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEvent {
    /// 外部发来的动作
    Request(ShardRequest),
    /// 当前状态的副作用成功完成
    Succeeded,
    /// 当前状态的副作用失败
    Failed(String),
}

/// 状态迁移表. 返回 None 表示该事件在此状态下被忽略
pub fn transition(state: ShardState, event: &ShardEvent) -> Option<ShardState> {
    use ShardAction as A;
    use ShardState as S;

    let action = match event {
        ShardEvent::Request(request) => Some(request.action),
        _ => None,
    };

    match (state, event, action) {
        (S::Completed, _, _) => None,
        (_, _, Some(A::Fail)) => Some(S::Error),

        // 投标已发出
        (S::Enqueued, ShardEvent::Succeeded, _) => Some(S::Bidding),
        (S::Enqueued, ShardEvent::Failed(_), _) => Some(S::Error),
        (S::Enqueued, _, Some(A::Cancel)) => Some(S::Cancelled),
        (S::Cancelled, ShardEvent::Succeeded, _) => Some(S::Completed),

        (S::Bidding, _, Some(A::Run)) => Some(S::Running),
        (S::Bidding, _, Some(A::BidRejected)) => Some(S::Completed),

        (S::Running, ShardEvent::Succeeded, _) => Some(S::PublishingToVerifier),
        (S::Running, ShardEvent::Failed(_), _) => Some(S::Error),

        (S::PublishingToVerifier, ShardEvent::Succeeded, _) => Some(S::VerifyingResults),
        (S::PublishingToVerifier, ShardEvent::Failed(_), _) => Some(S::Error),

        (S::VerifyingResults, _, Some(A::Publish)) => Some(S::PublishingToRequester),
        (S::VerifyingResults, _, Some(A::ResultsRejected)) => Some(S::Completed),

        (S::PublishingToRequester, ShardEvent::Succeeded, _) => Some(S::Completed),
        (S::PublishingToRequester, ShardEvent::Failed(_), _) => Some(S::Error),

        (S::Error, ShardEvent::Succeeded, _) => Some(S::Completed),

        _ => None,
    }
}

/// 执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardRunOutput {
    pub result_path: PathBuf,
    pub proposal: Vec<u8>,
    pub run_output: Option<RunCommandResult>,
}

/// 状态机在各个阶段回调所属节点
#[async_trait]
pub trait ShardHandler: Send + Sync {
    fn node_id(&self) -> &str;

    async fn notify_bid_job(&self, shard: &JobShard) -> Result<(), PluginError>;

    async fn run_shard(&self, shard: &JobShard) -> Result<ShardRunOutput, PluginError>;

    /// 停掉正在跑的分片
    async fn cancel_shard(&self, shard: &JobShard) -> Result<(), PluginError>;

    async fn notify_shard_execution_finished(
        &self,
        shard: &JobShard,
        status: &str,
        output: &ShardRunOutput,
    ) -> Result<(), PluginError>;

    async fn publish_shard(&self, shard: &JobShard, output: &ShardRunOutput)
        -> Result<(), PluginError>;

    async fn notify_shard_error(
        &self,
        shard: &JobShard,
        status: &str,
        run_output: Option<&RunCommandResult>,
    ) -> Result<(), PluginError>;

    /// 进入 Enqueued 或 Completed 时调用, 触发积压重新评估. 不能阻塞
    fn trigger_backlog_evaluation(&self);
}

#[derive(Debug)]
struct MachineState {
    current: ShardState,
    previous: ShardState,
    bid_sent: bool,
    skip_notify_on_failure: bool,
    error_msg: String,
    output: ShardRunOutput,
    /// 过了这个时间还没离开当前状态就算超时
    deadline: Option<Instant>,
}

pub struct ShardStateMachine {
    shard: JobShard,
    capacity: CapacityManagerItem,
    handler: Arc<dyn ShardHandler>,
    negotiation_timeout: Duration,
    req: mpsc::Sender<ShardRequest>,
    state: TracedMutex<MachineState>,
}

impl fmt::Display for ShardStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] shard: {} at state: {}",
            short_id(self.handler.node_id()),
            self.shard,
            self.current_state()
        )
    }
}

impl ShardStateMachine {
    /// 创建状态机, 返回的接收端交给 [`ShardStateMachine::run`]. 没有协商超时
    pub fn new(
        shard: JobShard,
        handler: Arc<dyn ShardHandler>,
        capacity: CapacityManagerItem,
    ) -> (Arc<Self>, mpsc::Receiver<ShardRequest>) {
        Self::with_negotiation_timeout(shard, handler, capacity, Duration::ZERO)
    }

    /// 在 Enqueued/Bidding 停留超过 `negotiation_timeout` 就算超时, 0 表示不限
    pub fn with_negotiation_timeout(
        shard: JobShard,
        handler: Arc<dyn ShardHandler>,
        capacity: CapacityManagerItem,
        negotiation_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<ShardRequest>) {
        let (req, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let deadline = deadline_after(negotiation_timeout);
        let machine = Arc::new(Self {
            shard,
            capacity,
            handler,
            negotiation_timeout,
            req,
            state: TracedMutex::new(
                "ComputeNode.ShardStateMachineMu",
                MachineState {
                    current: ShardState::Enqueued,
                    previous: ShardState::Enqueued,
                    bid_sent: false,
                    skip_notify_on_failure: false,
                    error_msg: String::new(),
                    output: ShardRunOutput::default(),
                    deadline,
                },
            ),
        });
        (machine, rx)
    }

    pub fn shard(&self) -> &JobShard {
        &self.shard
    }

    pub fn capacity(&self) -> &CapacityManagerItem {
        &self.capacity
    }

    pub fn current_state(&self) -> ShardState {
        self.state.lock().current
    }

    pub fn previous_state(&self) -> ShardState {
        self.state.lock().previous
    }

    pub fn bid_sent(&self) -> bool {
        self.state.lock().bid_sent
    }

    pub fn error_msg(&self) -> String {
        self.state.lock().error_msg.clone()
    }

    pub fn result_proposal(&self) -> Vec<u8> {
        self.state.lock().output.proposal.clone()
    }

    pub fn run_output(&self) -> Option<RunCommandResult> {
        self.state.lock().output.run_output.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// 截止时间已过且还没结束时返回 true, 同时清掉截止时间, 每次超时只报告一次
    pub fn take_expired(&self, now: Instant) -> bool {
        let mut inner = self.state.lock();
        match inner.deadline {
            Some(deadline) if deadline <= now && inner.current != ShardState::Completed => {
                inner.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// 跑完整个生命周期, 结束后关闭请求通道
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ShardRequest>) {
        let mut state = ShardState::Enqueued;
        log::debug!("{} enqueued", self);
        self.handler.trigger_backlog_evaluation();

        while state != ShardState::Completed {
            let event = self.step(state, &mut rx).await;
            match transition(state, &event) {
                Some(next) => {
                    let reason = self.apply(state, &event);
                    self.transitioned_to(next, reason.as_deref());
                    state = next;
                }
                None => log::warn!("{} ignoring unknown action: {:?}", self, event),
            }
        }

        // 之后再发来的动作会在 send_request 里被丢弃
        rx.close();
        self.handler.trigger_backlog_evaluation();
    }

    /// 执行当前状态的副作用, 或者等待下一个动作
    async fn step(&self, state: ShardState, rx: &mut mpsc::Receiver<ShardRequest>) -> ShardEvent {
        match state {
            ShardState::Enqueued => {
                let request = Self::read_request(rx).await;
                if request.action != ShardAction::Bid {
                    return ShardEvent::Request(request);
                }
                match self.handler.notify_bid_job(&self.shard).await {
                    Ok(()) => ShardEvent::Succeeded,
                    Err(e) => ShardEvent::Failed(e.to_string()),
                }
            }
            ShardState::Bidding | ShardState::VerifyingResults => {
                ShardEvent::Request(Self::read_request(rx).await)
            }
            ShardState::Running => self.run_cancellable(rx).await,
            ShardState::PublishingToVerifier => {
                let output = self.state.lock().output.clone();
                let status = format!("Got results proposal of length: {}", output.proposal.len());
                match self
                    .handler
                    .notify_shard_execution_finished(&self.shard, &status, &output)
                    .await
                {
                    Ok(()) => ShardEvent::Succeeded,
                    Err(e) => ShardEvent::Failed(e.to_string()),
                }
            }
            ShardState::PublishingToRequester => {
                let output = self.state.lock().output.clone();
                match self.handler.publish_shard(&self.shard, &output).await {
                    Ok(()) => ShardEvent::Succeeded,
                    Err(e) => ShardEvent::Failed(e.to_string()),
                }
            }
            ShardState::Error => {
                self.report_error().await;
                ShardEvent::Succeeded
            }
            ShardState::Cancelled | ShardState::Completed => ShardEvent::Succeeded,
        }
    }

    /// 执行分片, 同时监听请求通道. 执行中收到 Fail 就取消执行, 结果不再提交
    async fn run_cancellable(&self, rx: &mut mpsc::Receiver<ShardRequest>) -> ShardEvent {
        let request = {
            let mut run = self.handler.run_shard(&self.shard);
            loop {
                tokio::select! {
                    result = &mut run => return self.record_run(result),
                    request = rx.recv() => match request {
                        Some(request) if request.action == ShardAction::Fail => break request,
                        Some(request) => {
                            log::warn!("{} ignoring unknown action: {}", self, request.action)
                        }
                        None => break ShardRequest::fail("request channel closed", true),
                    },
                }
            }
        };

        // 执行 future 已经丢弃, 再让执行器清理它在进程外的资源
        match self.handler.cancel_shard(&self.shard).await {
            Ok(()) => log::info!("{} execution cancelled: {}", self, request.reason),
            Err(e) => log::error!("{} failed to cancel a running shard, resources may leak: {}", self, e),
        }
        ShardEvent::Request(request)
    }

    fn record_run(&self, result: Result<ShardRunOutput, PluginError>) -> ShardEvent {
        let mut inner = self.state.lock();
        match result {
            Ok(output) => {
                inner.output = output;
                ShardEvent::Succeeded
            }
            Err(e) => {
                let msg = e.to_string();
                inner.output.run_output = Some(RunCommandResult::from_error(msg.clone()));
                ShardEvent::Failed(msg)
            }
        }
    }

    async fn read_request(rx: &mut mpsc::Receiver<ShardRequest>) -> ShardRequest {
        match rx.recv().await {
            Some(request) => request,
            None => ShardRequest::fail("request channel closed", true),
        }
    }

    /// 记录事件带来的数据变化, 返回迁移原因
    fn apply(&self, state: ShardState, event: &ShardEvent) -> Option<String> {
        let mut inner = self.state.lock();
        match event {
            ShardEvent::Succeeded if state == ShardState::Enqueued => {
                // 投标已经发出, 之后失败都要通知请求方
                inner.bid_sent = true;
                None
            }
            ShardEvent::Failed(msg) => {
                inner.error_msg = msg.clone();
                Some(msg.clone())
            }
            ShardEvent::Request(request) => {
                match request.action {
                    ShardAction::Fail => {
                        inner.error_msg = request.reason.clone();
                        inner.skip_notify_on_failure = request.skip_notify_on_failure;
                    }
                    // 请求方已经发布过失败事件了
                    ShardAction::ResultsRejected => inner.bid_sent = false,
                    _ => {}
                }
                (!request.reason.is_empty()).then(|| request.reason.clone())
            }
            _ => None,
        }
    }

    fn transitioned_to(&self, next: ShardState, reason: Option<&str>) {
        let previous = {
            let mut inner = self.state.lock();
            inner.previous = inner.current;
            inner.current = next;
            // 执行阶段由任务自身的超时约束
            inner.deadline = match next {
                ShardState::Enqueued | ShardState::Bidding => {
                    deadline_after(self.negotiation_timeout)
                }
                _ => None,
            };
            inner.previous
        };
        let reason = reason.map(|r| format!(" due to {}", r)).unwrap_or_default();
        log::debug!(
            "[{}] shard: {} transitioning from {} -> {}{}",
            short_id(self.handler.node_id()),
            self.shard,
            previous,
            next,
            reason
        );
    }

    /// 只有投过标才需要告诉请求方
    async fn report_error(&self) {
        let (error_msg, notify, run_output) = {
            let inner = self.state.lock();
            (
                inner.error_msg.clone(),
                inner.bid_sent && !inner.skip_notify_on_failure,
                inner.output.run_output.clone(),
            )
        };
        let status = format!("error completing job due to: {}", error_msg);
        log::error!("{} {}", self, status);

        if notify {
            if let Err(e) = self
                .handler
                .notify_shard_error(&self.shard, &status, run_output.as_ref())
                .await
            {
                log::error!("{} failed to report error of job due to {}", self, e);
            }
        }
    }

    pub async fn bid(&self) {
        self.send_request(ShardRequest::new(ShardAction::Bid)).await;
    }

    /// 控制循环用: 不等待, 已经有待处理的投标时直接跳过
    pub fn try_bid(&self) -> bool {
        match self.req.try_send(ShardRequest::new(ShardAction::Bid)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::trace!("{} already has a pending request", self);
                false
            }
            Err(TrySendError::Closed(request)) => {
                log::warn!("{} ignoring action after channel closed: {}", self, request.action);
                false
            }
        }
    }

    pub async fn bid_rejected(&self) {
        self.send_request(ShardRequest::new(ShardAction::BidRejected)).await;
    }

    pub async fn execute(&self) {
        self.send_request(ShardRequest::new(ShardAction::Run)).await;
    }

    pub async fn results_rejected(&self) {
        self.send_request(ShardRequest::new(ShardAction::ResultsRejected)).await;
    }

    pub async fn publish(&self) {
        self.send_request(ShardRequest::new(ShardAction::Publish)).await;
    }

    /// 投标前放弃这个分片. 已经投过标的话不起作用
    pub async fn cancel(&self, reason: impl Into<String>) {
        self.send_request(ShardRequest::with_reason(ShardAction::Cancel, reason))
            .await;
    }

    /// 进入 Error, 投过标的话通知请求方. 正在执行的会被取消
    pub async fn fail(&self, reason: impl Into<String>) {
        self.send_request(ShardRequest::fail(reason, false)).await;
    }

    /// 进入 Error 但不通知请求方, 用于请求方自己发起的失败
    pub async fn fail_silently(&self, reason: impl Into<String>) {
        self.send_request(ShardRequest::fail(reason, true)).await;
    }

    /// 状态机结束后通道已关闭, 迟到的动作(比如重复的网络事件)记一条警告后丢弃
    async fn send_request(&self, request: ShardRequest) {
        if let Err(e) = self.req.send(request).await {
            log::warn!("{} ignoring action after channel closed: {}", self, e.0.action);
        }
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}
