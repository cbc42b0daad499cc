//! 计算节点(Drone)实现模块

pub mod control_loop;
pub mod node;
pub mod selection;
pub mod shard_fsm;
pub mod shard_manager;

pub use control_loop::{fail_timed_out_shards, BacklogControlLoop, Shutdown};
pub use node::{ActiveJob, ComputeNode};
pub use selection::{
    apply_job_selection_policy, calculate_job_node_distance_delay, JobSelectionDataLocality,
    JobSelectionPolicy, JobSelectionPolicyProbeData,
};
pub use shard_fsm::{
    transition, ShardAction, ShardEvent, ShardHandler, ShardRequest, ShardRunOutput, ShardState,
    ShardStateMachine,
};
pub use shard_manager::ShardStateMachineManager;
