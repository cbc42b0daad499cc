//! 计算节点指标
//!
//! 指标通过 `MetricsSink` 注入, 不使用全局计数器.

use prometheus::{IntCounterVec, Opts, Registry};

pub trait MetricsSink: Send + Sync {
    fn inc_jobs_received(&self, node_id: &str, client_id: &str);
    fn inc_jobs_accepted(&self, node_id: &str, shard_index: usize, client_id: &str);
    fn inc_jobs_completed(&self, node_id: &str, shard_index: usize, client_id: &str);
    fn inc_jobs_failed(&self, node_id: &str, shard_index: usize, client_id: &str);
}

/// 什么都不做
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_jobs_received(&self, _node_id: &str, _client_id: &str) {}
    fn inc_jobs_accepted(&self, _node_id: &str, _shard_index: usize, _client_id: &str) {}
    fn inc_jobs_completed(&self, _node_id: &str, _shard_index: usize, _client_id: &str) {}
    fn inc_jobs_failed(&self, _node_id: &str, _shard_index: usize, _client_id: &str) {}
}

/// Prometheus 计数器
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    jobs_received: IntCounterVec,
    jobs_accepted: IntCounterVec,
    jobs_completed: IntCounterVec,
    jobs_failed: IntCounterVec,
}

impl PrometheusMetrics {
    /// 创建并注册到给定 registry
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let jobs_received = IntCounterVec::new(
            Opts::new("zerg_compute_jobs_received", "Jobs received by the compute node"),
            &["node_id", "client_id"],
        )?;
        let shard_labels = &["node_id", "shard_index", "client_id"];
        let jobs_accepted = IntCounterVec::new(
            Opts::new("zerg_compute_jobs_accepted", "Job shards whose bid was accepted"),
            shard_labels,
        )?;
        let jobs_completed = IntCounterVec::new(
            Opts::new("zerg_compute_jobs_completed", "Job shards executed successfully"),
            shard_labels,
        )?;
        let jobs_failed = IntCounterVec::new(
            Opts::new("zerg_compute_jobs_failed", "Job shards that failed after bidding"),
            shard_labels,
        )?;

        registry.register(Box::new(jobs_received.clone()))?;
        registry.register(Box::new(jobs_accepted.clone()))?;
        registry.register(Box::new(jobs_completed.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;

        Ok(Self {
            jobs_received,
            jobs_accepted,
            jobs_completed,
            jobs_failed,
        })
    }

    pub fn jobs_received(&self, node_id: &str, client_id: &str) -> u64 {
        self.jobs_received.with_label_values(&[node_id, client_id]).get()
    }

    pub fn jobs_accepted(&self, node_id: &str, shard_index: usize, client_id: &str) -> u64 {
        let shard = shard_index.to_string();
        self.jobs_accepted
            .with_label_values(&[node_id, shard.as_str(), client_id])
            .get()
    }

    pub fn jobs_completed(&self, node_id: &str, shard_index: usize, client_id: &str) -> u64 {
        let shard = shard_index.to_string();
        self.jobs_completed
            .with_label_values(&[node_id, shard.as_str(), client_id])
            .get()
    }

    pub fn jobs_failed(&self, node_id: &str, shard_index: usize, client_id: &str) -> u64 {
        let shard = shard_index.to_string();
        self.jobs_failed
            .with_label_values(&[node_id, shard.as_str(), client_id])
            .get()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn inc_jobs_received(&self, node_id: &str, client_id: &str) {
        self.jobs_received.with_label_values(&[node_id, client_id]).inc();
    }

    fn inc_jobs_accepted(&self, node_id: &str, shard_index: usize, client_id: &str) {
        let shard = shard_index.to_string();
        self.jobs_accepted
            .with_label_values(&[node_id, shard.as_str(), client_id])
            .inc();
    }

    fn inc_jobs_completed(&self, node_id: &str, shard_index: usize, client_id: &str) {
        let shard = shard_index.to_string();
        self.jobs_completed
            .with_label_values(&[node_id, shard.as_str(), client_id])
            .inc();
    }

    fn inc_jobs_failed(&self, node_id: &str, shard_index: usize, client_id: &str) {
        let shard = shard_index.to_string();
        self.jobs_failed
            .with_label_values(&[node_id, shard.as_str(), client_id])
            .inc();
    }
}
