//! 节点后台循环
//!
//! - 积压投标循环: 定时或被唤醒时, 挑出放得下的积压分片去投标
//! - 分片状态日志: 定期把活跃分片状态以 JSON 打到日志
//! - 超时检查: 定期让超过截止时间的分片失败

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::capacity::CapacityManager;
use crate::drone::shard_fsm::ShardState;
use crate::drone::shard_manager::ShardStateMachineManager;
use crate::model::short_id;
use crate::resource::ResourceUsageData;

/// 停止信号. 置位后再唤醒, 错过唤醒的循环也会在下一轮看到标记
#[derive(Debug, Default)]
pub struct Shutdown {
    stopped: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// 积压投标循环
pub struct BacklogControlLoop {
    node_id: String,
    capacity: Arc<CapacityManager>,
    shards: Arc<ShardStateMachineManager>,
    trigger: Arc<Notify>,
    shutdown: Arc<Shutdown>,
    interval: Duration,
}

impl BacklogControlLoop {
    pub fn new(
        node_id: impl Into<String>,
        capacity: Arc<CapacityManager>,
        shards: Arc<ShardStateMachineManager>,
        trigger: Arc<Notify>,
        shutdown: Arc<Shutdown>,
        interval: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            capacity,
            shards,
            trigger,
            shutdown,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.shutdown.is_triggered() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
                _ = self.shutdown.wait() => break,
            }
            self.bid_on_backlog();
        }
        log::debug!("[{}] backlog control loop stopped", short_id(&self.node_id));
    }

    /// 给放得下且仍在排队的分片发投标动作, 返回发出的数量.
    ///
    /// 用 try_send: 已经有一个投标在通道里等着的分片直接跳过, 循环本身永不阻塞.
    pub fn bid_on_backlog(&self) -> usize {
        let mut sent = 0;
        for id in self.capacity.get_next_items() {
            let Some(machine) = self.shards.get(&id) else {
                continue;
            };
            if machine.current_state() != ShardState::Enqueued {
                continue;
            }
            if machine.try_bid() {
                log::debug!("[{}] shard {} admitted, bidding", short_id(&self.node_id), id);
                sent += 1;
            }
        }
        sent
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStateLogEntry {
    pub shard_id: String,
    pub state: ShardState,
    pub requirements: ResourceUsageData,
}

/// 当前所有未清理分片的状态
pub fn shard_state_snapshot(shards: &ShardStateMachineManager) -> Vec<ShardStateLogEntry> {
    shards
        .get_all()
        .iter()
        .map(|machine| ShardStateLogEntry {
            shard_id: machine.shard().id(),
            state: machine.current_state(),
            requirements: machine.capacity().requirements,
        })
        .collect()
}

/// 定期打印分片状态
pub async fn run_shard_state_logger(
    node_id: String,
    shards: Arc<ShardStateMachineManager>,
    shutdown: Arc<Shutdown>,
    interval: Duration,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即返回, 跳过
    ticker.tick().await;

    while !shutdown.is_triggered() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        let snapshot = shard_state_snapshot(&shards);
        if snapshot.is_empty() {
            continue;
        }
        match serde_json::to_string(&snapshot) {
            Ok(json) => log::info!("[{}] shard states: {}", short_id(&node_id), json),
            Err(e) => log::error!("failed to marshal shard states: {}", e),
        }
    }
}

/// 让所有超时的分片失败, 返回数量. 投过标的会通知请求方
pub fn fail_timed_out_shards(node_id: &str, shards: &ShardStateMachineManager) -> usize {
    let timed_out = shards.take_timed_out(Instant::now());
    let count = timed_out.len();
    for machine in timed_out {
        let reason = format!("shard timed out while in state {}", machine.current_state());
        log::warn!("[{}] {} {}", short_id(node_id), machine.shard(), reason);
        tokio::spawn(async move { machine.fail(reason).await });
    }
    count
}

/// 定期检查分片超时
pub async fn run_shard_timeout_checker(
    node_id: String,
    shards: Arc<ShardStateMachineManager>,
    shutdown: Arc<Shutdown>,
    interval: Duration,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !shutdown.is_triggered() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => break,
        }
        fail_timed_out_shards(&node_id, &shards);
    }
    log::debug!("[{}] shard timeout checker stopped", short_id(&node_id));
}
