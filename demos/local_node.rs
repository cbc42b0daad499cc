//! 单机演示: 进程内传输 + 空执行器, 走完一个任务的完整生命周期
//!
//! cargo run --example local_node

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zerg_compute::capacity;
use zerg_compute::logging::init_logger;
use zerg_compute::model::{
    Job, JobEvent, JobEventType, JobShard, JobSpec, RunCommandResult, StorageSpec,
};
use zerg_compute::plugins::{Executor, ExecutorProvider, Verifier, VerifierProvider};
use zerg_compute::transport::{InProcessTransport, OutboundMessage};
use zerg_compute::{ComputeNode, ComputeNodeConfig, NoopMetrics, PluginError, ResourceUsageConfig};

const WAIT: Duration = Duration::from_secs(5);

/// 什么都不跑, 只把结果目录建出来
struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn is_installed(&self) -> Result<bool, PluginError> {
        Ok(true)
    }

    async fn has_storage_locally(&self, _input: &StorageSpec) -> Result<bool, PluginError> {
        Ok(true)
    }

    async fn run_job(
        &self,
        shard: &JobShard,
        result_path: &Path,
    ) -> Result<RunCommandResult, PluginError> {
        std::fs::create_dir_all(result_path).map_err(|e| PluginError::Execution(e.to_string()))?;
        Ok(RunCommandResult {
            stdout: format!("ran {}", shard),
            ..RunCommandResult::default()
        })
    }
}

struct NoopVerifier;

#[async_trait]
impl Verifier for NoopVerifier {
    async fn is_installed(&self) -> Result<bool, PluginError> {
        Ok(true)
    }

    async fn get_shard_result_path(&self, shard: &JobShard) -> Result<PathBuf, PluginError> {
        Ok(std::env::temp_dir().join(format!("zerg-compute-{}-{}", shard.job.id, shard.index)))
    }

    async fn process_results_folder(
        &self,
        job_id: &str,
        result_path: &Path,
    ) -> Result<Vec<u8>, PluginError> {
        Ok(format!("{}@{}", job_id, result_path.display()).into_bytes())
    }
}

async fn expect(transport: &InProcessTransport, what: &str, predicate: impl Fn(&OutboundMessage) -> bool) {
    match transport.wait_for(predicate, WAIT).await {
        Some(message) => println!("<- {:?}", message),
        None => eprintln!("no {} within {:?}", what, WAIT),
    }
}

#[tokio::main]
async fn main() -> zerg_compute::Result<()> {
    init_logger();

    let transport = Arc::new(InProcessTransport::with_random_id());
    let config = ComputeNodeConfig {
        capacity: capacity::Config {
            resource_limit_total: ResourceUsageConfig::new("1", "1Gb", "", ""),
            ..capacity::Config::default()
        },
        ..ComputeNodeConfig::default()
    };

    let node = ComputeNode::new(
        config,
        transport.clone(),
        ExecutorProvider::new().with("noop", Arc::new(NoopExecutor)),
        VerifierProvider::new().with("noop", Arc::new(NoopVerifier)),
        Arc::new(NoopMetrics),
    )
    .await?;
    let node_id = node.id().to_string();

    let job = Job::new(
        "demo-job",
        JobSpec {
            engine: "noop".to_string(),
            verifier: "noop".to_string(),
            resources: ResourceUsageConfig::new("500m", "128Mb", "", ""),
            ..JobSpec::default()
        },
    );

    println!("-> Created {}", job.id);
    transport
        .publish(JobEvent::new(JobEventType::Created, job.id.clone()), job.clone())
        .await;
    expect(&transport, "bid", |m| matches!(m, OutboundMessage::Bid { .. })).await;

    println!("-> BidAccepted");
    transport
        .publish(
            JobEvent::new(JobEventType::BidAccepted, job.id.clone()).for_node(node_id.clone(), 0),
            job.clone(),
        )
        .await;
    expect(&transport, "result", |m| matches!(m, OutboundMessage::Result { .. })).await;

    println!("-> ResultsAccepted");
    transport
        .publish(
            JobEvent::new(JobEventType::ResultsAccepted, job.id.clone()).for_node(node_id.clone(), 0),
            job.clone(),
        )
        .await;
    expect(&transport, "publish", |m| matches!(m, OutboundMessage::Published { .. })).await;

    println!("free capacity: {}", node.get_available_capacity());
    node.shutdown();
    Ok(())
}
