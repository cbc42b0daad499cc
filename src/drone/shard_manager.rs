//! 分片状态机管理器
//!
//! 按到达顺序保存所有状态机, 同时按扁平分片 id 建索引.
//! 对容量管理器来说它就是 `CapacityTracker`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::capacity::{CapacityManagerItem, CapacityTracker};
use crate::drone::shard_fsm::{ShardHandler, ShardState, ShardStateMachine};
use crate::model::JobShard;
use crate::resource::ResourceUsageData;
use crate::sync::TracedMutex;

#[derive(Default)]
struct Machines {
    by_id: HashMap<String, Arc<ShardStateMachine>>,
    order: VecDeque<Arc<ShardStateMachine>>,
}

impl Machines {
    /// 只从队头删除已完成的, 遇到第一个未完成的就停
    fn cleanup_completed(&mut self) {
        while let Some(front) = self.order.front() {
            if front.current_state() != ShardState::Completed {
                break;
            }
            let id = front.shard().id();
            self.by_id.remove(&id);
            self.order.pop_front();
        }
    }

    fn filter(&mut self, pred: impl Fn(ShardState) -> bool) -> Vec<Arc<ShardStateMachine>> {
        self.cleanup_completed();
        self.order
            .iter()
            .filter(|m| pred(m.current_state()))
            .cloned()
            .collect()
    }
}

pub struct ShardStateMachineManager {
    machines: TracedMutex<Machines>,
    negotiation_timeout: Duration,
}

impl Default for ShardStateMachineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardStateMachineManager {
    pub fn new() -> Self {
        Self::with_threshold(crate::sync::DEFAULT_TRACE_THRESHOLD)
    }

    /// 锁持有超过 `threshold` 时告警
    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            machines: TracedMutex::with_threshold(
                "ComputeNode.ShardStateMachineManagerMu",
                threshold,
                Machines::default(),
            ),
            negotiation_timeout: Duration::ZERO,
        }
    }

    /// 新建的状态机在投标阶段最多停留这么久, 0 表示不限
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// 没有对应状态机时创建一个并启动它的任务. 返回是否新建了
    pub fn start_shard_state_if_necessary(
        &self,
        shard: JobShard,
        handler: Arc<dyn ShardHandler>,
        requirements: ResourceUsageData,
    ) -> bool {
        let id = shard.id();
        let mut machines = self.machines.lock();
        if machines.by_id.contains_key(&id) {
            return false;
        }

        let capacity = CapacityManagerItem {
            id: id.clone(),
            requirements,
        };
        let (machine, rx) = ShardStateMachine::with_negotiation_timeout(
            shard,
            handler,
            capacity,
            self.negotiation_timeout,
        );
        machines.by_id.insert(id, Arc::clone(&machine));
        machines.order.push_back(Arc::clone(&machine));
        drop(machines);

        tokio::spawn(machine.run(rx));
        true
    }

    pub fn get(&self, shard_id: &str) -> Option<Arc<ShardStateMachine>> {
        self.machines.lock().by_id.get(shard_id).cloned()
    }

    pub fn has(&self, shard_id: &str) -> bool {
        self.machines.lock().by_id.contains_key(shard_id)
    }

    /// 还没被清理掉的状态机数量(可能包含已完成的)
    pub fn len(&self) -> usize {
        self.machines.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 积压: 还在 Enqueued 的
    pub fn get_enqueued(&self) -> Vec<Arc<ShardStateMachine>> {
        self.machines
            .lock()
            .filter(|state| state == ShardState::Enqueued)
    }

    /// 活跃: 正在投标或正在运行的
    pub fn get_active(&self) -> Vec<Arc<ShardStateMachine>> {
        self.machines
            .lock()
            .filter(|state| matches!(state, ShardState::Bidding | ShardState::Running))
    }

    /// 所有未清理的状态机, 按到达顺序
    pub fn get_all(&self) -> Vec<Arc<ShardStateMachine>> {
        self.machines.lock().filter(|_| true)
    }

    /// 截止时间已过的未完成状态机. 同一次超时只返回一次
    pub fn take_timed_out(&self, now: Instant) -> Vec<Arc<ShardStateMachine>> {
        self.get_all()
            .into_iter()
            .filter(|machine| machine.take_expired(now))
            .collect()
    }
}

impl CapacityTracker for ShardStateMachineManager {
    fn backlog_iterator(&self, handler: &mut dyn FnMut(&CapacityManagerItem)) {
        for machine in self.get_enqueued() {
            handler(machine.capacity());
        }
    }

    fn active_iterator(&self, handler: &mut dyn FnMut(&CapacityManagerItem)) {
        for machine in self.get_active() {
            handler(machine.capacity());
        }
    }
}
