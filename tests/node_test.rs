
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{eventually, init_logging, providers, test_machine, FakeExecutor, FakeVerifier, ENGINE, VERIFIER};
use zerg_compute::capacity;
use zerg_compute::model::{Job, JobEvent, JobEventType, JobExecutionPlan, JobSpec, StorageSpec};
use zerg_compute::transport::{InProcessTransport, OutboundMessage};
use zerg_compute::{ComputeError, ComputeNode, ComputeNodeConfig, PluginError, PrometheusMetrics, ResourceUsageConfig, ShardState};

const NODE: &str = "node-1";
const WAIT: Duration = Duration::from_secs(5);
const GB: u64 = 1024 * 1024 * 1024;

struct Harness {
    node: Arc<ComputeNode>,
    transport: Arc<InProcessTransport>,
    executor: Arc<FakeExecutor>,
    metrics: Arc<PrometheusMetrics>,
}

impl Harness {
    async fn new(executor: FakeExecutor, total: ResourceUsageConfig) -> Self {
        Self::with_config(executor, node_config(total)).await
    }

    async fn with_config(executor: FakeExecutor, config: ComputeNodeConfig) -> Self {
        init_logging();
        let transport = Arc::new(InProcessTransport::new(NODE));
        let executor = Arc::new(executor);
        let (executors, verifiers) = providers(executor.clone(), Arc::new(FakeVerifier::default()));
        let metrics = Arc::new(PrometheusMetrics::new(&Registry::new()).expect("register metrics"));

        let node = ComputeNode::with_system(
            config,
            transport.clone(),
            executors,
            verifiers,
            metrics.clone(),
            &test_machine(),
        )
        .await
        .expect("start compute node");

        Self {
            node,
            transport,
            executor,
            metrics,
        }
    }

    async fn send(&self, event_name: JobEventType, job: &Job, shard_index: usize) {
        self.send_with_status(event_name, job, shard_index, "").await;
    }

    async fn send_with_status(&self, event_name: JobEventType, job: &Job, shard_index: usize, status: &str) {
        let event = JobEvent::new(event_name, job.id.clone())
            .for_node(NODE, shard_index)
            .with_status(status);
        self.transport.publish(event, job.clone()).await;
    }

    async fn create(&self, job: &Job) {
        let mut event = JobEvent::new(JobEventType::Created, job.id.clone());
        event.spec = job.spec.clone();
        event.execution_plan = job.execution_plan;
        self.transport.publish(event, job.clone()).await;
    }

    async fn wait_for(&self, predicate: impl Fn(&OutboundMessage) -> bool) -> OutboundMessage {
        match self.transport.wait_for(predicate, WAIT).await {
            Some(message) => message,
            None => panic!("timed out, sent so far: {:?}", self.transport.sent()),
        }
    }

    fn bids(&self) -> Vec<usize> {
        self.transport
            .sent()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Bid { shard_index, .. } => Some(*shard_index),
                _ => None,
            })
            .collect()
    }
}

fn node_config(total: ResourceUsageConfig) -> ComputeNodeConfig {
    ComputeNodeConfig {
        capacity: capacity::Config {
            resource_limit_total: total,
            ..capacity::Config::default()
        },
        control_loop_interval_ms: 10,
        ..ComputeNodeConfig::default()
    }
}

fn roomy() -> ResourceUsageConfig {
    ResourceUsageConfig::new("4", "4Gb", "10Gb", "")
}

fn job(id: &str, cpu: &str, shards: usize) -> Job {
    let mut job = Job::new(
        id,
        JobSpec {
            engine: ENGINE.to_string(),
            verifier: VERIFIER.to_string(),
            resources: ResourceUsageConfig::new(cpu, "1Gb", "", ""),
            ..JobSpec::default()
        },
    );
    job.client_id = "client-1".to_string();
    job.execution_plan = JobExecutionPlan { total_shards: shards };
    job
}

fn is_bid(job_id: &'static str) -> impl Fn(&OutboundMessage) -> bool {
    move |m| matches!(m, OutboundMessage::Bid { job_id: id, .. } if id == job_id)
}

#[tokio::test]
async fn job_runs_from_bid_to_publish() {
    let h = Harness::new(FakeExecutor::default(), roomy()).await;
    let job = job("job-happy", "1", 1);

    h.create(&job).await;
    h.wait_for(is_bid("job-happy")).await;
    assert_eq!(h.metrics.jobs_received(NODE, "client-1"), 1);

    assert!(eventually(WAIT, || h.node.get_active_jobs().len() == 1).await);
    let active = h.node.get_active_jobs();
    assert_eq!(active[0].shard_id, "job-happy:0");
    assert_eq!(active[0].state, ShardState::Bidding);
    assert!((h.node.get_available_capacity().cpu - 3.0).abs() < 1e-9);

    h.send(JobEventType::BidAccepted, &job, 0).await;
    let result = h
        .wait_for(|m| matches!(m, OutboundMessage::Result { .. }))
        .await;
    match result {
        OutboundMessage::Result {
            proposal,
            status,
            run_output,
            ..
        } => {
            assert_eq!(proposal, b"/results/job-happy:0".to_vec());
            assert!(status.contains("length"));
            let run_output = run_output.expect("run output travels with the result");
            assert_eq!(run_output.stdout, "ran job-happy:0");
            assert_eq!(run_output.exit_code, 0);
        }
        other => panic!("unexpected message {:?}", other),
    }
    assert_eq!(h.executor.runs(), 1);
    assert_eq!(h.metrics.jobs_accepted(NODE, 0, "client-1"), 1);

    h.send(JobEventType::ResultsAccepted, &job, 0).await;
    h.wait_for(|m| matches!(m, OutboundMessage::Published { .. }))
        .await;
    assert!(eventually(WAIT, || h.metrics.jobs_completed(NODE, 0, "client-1") == 1).await);
    assert!(eventually(WAIT, || h.node.get_active_jobs().is_empty()).await);
    assert!(h
        .transport
        .sent()
        .iter()
        .all(|m| !matches!(m, OutboundMessage::Error { .. })));
}

#[tokio::test]
async fn execution_failure_is_reported() {
    let executor = FakeExecutor {
        fail_run: true,
        ..FakeExecutor::default()
    };
    let h = Harness::new(executor, roomy()).await;
    let job = job("job-broken", "1", 1);

    h.create(&job).await;
    h.wait_for(is_bid("job-broken")).await;
    h.send(JobEventType::BidAccepted, &job, 0).await;

    let error = h
        .wait_for(|m| matches!(m, OutboundMessage::Error { .. }))
        .await;
    match error {
        OutboundMessage::Error {
            status,
            shard_index,
            run_output,
            ..
        } => {
            assert_eq!(shard_index, 0);
            assert!(status.contains("exploded"));
            let run_output = run_output.expect("failed run still reports its output");
            assert!(run_output.runner_error.contains("exploded"));
        }
        other => panic!("unexpected message {:?}", other),
    }
    assert!(eventually(WAIT, || h.metrics.jobs_failed(NODE, 0, "client-1") == 1).await);
}

#[tokio::test]
async fn execution_timeout_fails_shard() {
    let executor = FakeExecutor {
        run_delay: Duration::from_secs(2),
        ..FakeExecutor::default()
    };
    let h = Harness::new(executor, roomy()).await;
    let mut job = job("job-slow", "1", 1);
    job.spec.timeout = 0.05;

    h.create(&job).await;
    h.wait_for(is_bid("job-slow")).await;
    h.send(JobEventType::BidAccepted, &job, 0).await;

    let error = h
        .wait_for(|m| matches!(m, OutboundMessage::Error { .. }))
        .await;
    assert!(matches!(error, OutboundMessage::Error { status, .. } if status.contains("超时")));
}

#[tokio::test]
async fn capacity_gates_bidding() {
    let h = Harness::new(FakeExecutor::default(), ResourceUsageConfig::new("1", "4Gb", "", "")).await;
    let job = job("job-wide", "1", 2);

    h.create(&job).await;
    h.wait_for(is_bid("job-wide")).await;
    // 只放得下一个分片
    tokio::time::sleep(Duration::from_millis(100)).await;
    let bids = h.bids();
    assert_eq!(bids.len(), 1);

    // 拒掉第一个, 空出来的容量给另一个
    let first = bids[0];
    h.send(JobEventType::BidRejected, &job, first).await;
    assert!(eventually(WAIT, || h.bids().len() == 2).await);
    let bids = h.bids();
    assert_ne!(bids[0], bids[1]);
}

#[tokio::test]
async fn events_for_other_nodes_are_ignored() {
    let h = Harness::new(FakeExecutor::default(), roomy()).await;
    let job = job("job-other", "1", 1);

    h.create(&job).await;
    h.wait_for(is_bid("job-other")).await;

    let event = JobEvent::new(JobEventType::BidAccepted, job.id.clone()).for_node("node-2", 0);
    h.transport.publish(event, job.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.executor.runs(), 0);
    assert_eq!(
        h.node.shards().get("job-other:0").map(|m| m.current_state()),
        Some(ShardState::Bidding)
    );
}

#[tokio::test]
async fn requester_error_fails_silently() {
    let h = Harness::new(FakeExecutor::default(), roomy()).await;
    let job = job("job-cancel", "1", 1);

    h.create(&job).await;
    h.wait_for(is_bid("job-cancel")).await;
    let machine = h.node.shards().get("job-cancel:0").expect("shard started");
    h.send_with_status(JobEventType::Error, &job, 0, "client went away").await;

    assert!(eventually(WAIT, || machine.current_state() == ShardState::Completed).await);
    assert_eq!(machine.error_msg(), "Requester triggered failure due to: client went away");
    assert!(h.node.get_active_jobs().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h
        .transport
        .sent()
        .iter()
        .all(|m| !matches!(m, OutboundMessage::Error { .. })));
}

#[tokio::test]
async fn invalid_request_names_its_source() {
    let h = Harness::new(FakeExecutor::default(), roomy()).await;
    let job = job("job-invalid", "1", 1);

    h.create(&job).await;
    h.wait_for(is_bid("job-invalid")).await;
    let machine = h.node.shards().get("job-invalid:0").expect("shard started");
    h.send_with_status(JobEventType::InvalidRequest, &job, 0, "bad spec").await;

    assert!(eventually(WAIT, || machine.current_state() == ShardState::Completed).await);
    assert_eq!(machine.error_msg(), "Request rejected due to: bad spec");
}

#[tokio::test]
async fn requester_error_while_running_cancels_execution() {
    let executor = FakeExecutor {
        run_delay: Duration::from_millis(400),
        ..FakeExecutor::default()
    };
    let h = Harness::new(executor, roomy()).await;
    let job = job("job-abandoned", "1", 1);

    h.create(&job).await;
    h.wait_for(is_bid("job-abandoned")).await;
    let machine = h.node.shards().get("job-abandoned:0").expect("shard started");
    h.send(JobEventType::BidAccepted, &job, 0).await;
    assert!(eventually(WAIT, || h.executor.runs() == 1).await);
    assert_eq!(machine.current_state(), ShardState::Running);

    h.send(JobEventType::Error, &job, 0).await;
    assert!(eventually(WAIT, || machine.current_state() == ShardState::Completed).await);
    assert_eq!(machine.previous_state(), ShardState::Error);
    assert_eq!(h.executor.cancels(), 1);

    // 原本的执行时间过去后也不会提交结果
    tokio::time::sleep(Duration::from_millis(800)).await;
    let sent = h.transport.sent();
    assert!(sent.iter().all(|m| !matches!(m, OutboundMessage::Result { .. })));
    assert!(sent.iter().all(|m| !matches!(m, OutboundMessage::Error { .. })));
}

#[tokio::test]
async fn unanswered_bid_times_out_and_frees_capacity() {
    let mut config = node_config(roomy());
    config.timeouts.job_negotiation_timeout = 0.2;
    config.timeout_check_interval_ms = 20;
    let h = Harness::with_config(FakeExecutor::default(), config).await;
    let job = job("job-ghosted", "1", 1);

    h.create(&job).await;
    h.wait_for(is_bid("job-ghosted")).await;
    assert!(eventually(WAIT, || h.node.get_active_jobs().len() == 1).await);
    assert!((h.node.get_available_capacity().cpu - 3.0).abs() < 1e-9);

    // 请求方一直不回复
    let error = h
        .wait_for(|m| matches!(m, OutboundMessage::Error { .. }))
        .await;
    assert!(matches!(error, OutboundMessage::Error { status, .. }
        if status.contains("shard timed out while in state Bidding")));
    assert!(eventually(WAIT, || h.node.get_active_jobs().is_empty()).await);
    assert!((h.node.get_available_capacity().cpu - 4.0).abs() < 1e-9);
    assert!(eventually(WAIT, || h.metrics.jobs_failed(NODE, 0, "client-1") == 1).await);
}

#[tokio::test]
async fn distant_jobs_are_dropped_or_delayed() {
    let mut config = node_config(roomy());
    config.network_size = 10;
    let h = Harness::with_config(FakeExecutor::default(), config).await;

    // node-1 离 job-far 有四个块远, 直接放弃
    h.create(&job("job-far", "1", 1)).await;
    // 离 job-0 一个块, 等一秒再投
    let started = tokio::time::Instant::now();
    h.create(&job("job-0", "1", 1)).await;
    // 和 job-10 在同一个块里, 立即投
    h.create(&job("job-10", "1", 1)).await;

    h.wait_for(is_bid("job-10")).await;
    assert!(h.transport.wait_for(is_bid("job-0"), Duration::from_millis(500)).await.is_none());
    h.wait_for(is_bid("job-0")).await;
    assert!(started.elapsed() >= Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.transport.sent().iter().all(|m| !is_bid("job-far")(m)));
    assert!(!h.node.shards().has("job-far:0"));
}

#[tokio::test]
async fn higher_concurrency_widens_the_bidding_set() {
    let mut config = node_config(roomy());
    config.network_size = 10;
    let h = Harness::with_config(FakeExecutor::default(), config).await;

    // job-drop 在并发度 1 时太远, 并发度 3 时落在同一个块里
    let mut wide = job("job-drop", "1", 1);
    wide.deal.concurrency = 3;
    h.create(&wide).await;
    h.wait_for(is_bid("job-drop")).await;
}

#[tokio::test]
async fn shutdown_cancels_queued_shards() {
    let h = Harness::new(FakeExecutor::default(), ResourceUsageConfig::new("1", "4Gb", "", "")).await;
    let job = job("job-queued", "1", 2);

    h.create(&job).await;
    h.wait_for(is_bid("job-queued")).await;
    let bid_index = h.bids()[0];
    let bidding = h.node.shards().get(&format!("job-queued:{}", bid_index)).expect("shard started");
    let queued = h
        .node
        .shards()
        .get(&format!("job-queued:{}", 1 - bid_index))
        .expect("shard started");
    assert_eq!(queued.current_state(), ShardState::Enqueued);

    h.node.shutdown();
    assert!(eventually(WAIT, || queued.current_state() == ShardState::Completed).await);
    assert_eq!(queued.previous_state(), ShardState::Cancelled);
    assert_eq!(bidding.current_state(), ShardState::Bidding);
    assert_eq!(h.bids().len(), 1);
}

#[tokio::test]
async fn select_job_requires_installed_plugins() {
    let h = Harness::new(
        FakeExecutor {
            installed: false,
            ..FakeExecutor::default()
        },
        roomy(),
    )
    .await;

    let err = h.node.select_job(&job("job-x", "1", 1)).await.unwrap_err();
    assert!(matches!(
        err,
        ComputeError::Plugin(PluginError::ExecutorNotInstalled(_))
    ));

    let mut unknown = job("job-y", "1", 1);
    unknown.spec.engine = "docker".to_string();
    let err = h.node.select_job(&unknown).await.unwrap_err();
    assert!(matches!(err, ComputeError::Plugin(PluginError::ExecutorNotFound(_))));
}

#[tokio::test]
async fn select_job_passes_on_oversized_jobs() {
    let h = Harness::new(FakeExecutor::default(), roomy()).await;

    assert!(h.node.select_job(&job("job-big", "8", 1)).await.unwrap().is_none());

    let requirements = h
        .node
        .select_job(&job("job-fits", "500m", 1))
        .await
        .unwrap()
        .expect("job fits");
    assert!((requirements.cpu - 0.5).abs() < 1e-9);
    assert_eq!(requirements.memory, GB);
}

#[tokio::test]
async fn select_job_respects_timeout_bounds() {
    let mut config = node_config(roomy());
    config.timeouts.min_job_execution_timeout = 10.0;
    config.timeouts.max_job_execution_timeout = 60.0;
    let h = Harness::with_config(FakeExecutor::default(), config).await;

    let mut job = job("job-timeout", "1", 1);
    job.spec.timeout = 120.0;
    assert!(h.node.select_job(&job).await.unwrap().is_none());
    job.spec.timeout = 5.0;
    assert!(h.node.select_job(&job).await.unwrap().is_none());
    job.spec.timeout = 30.0;
    assert!(h.node.select_job(&job).await.unwrap().is_some());
}

#[tokio::test]
async fn select_job_splits_disk_between_shards() {
    let executor = FakeExecutor {
        volume_size: 2 * GB,
        ..FakeExecutor::default()
    };
    let h = Harness::new(executor, roomy()).await;

    let mut job = job("job-data", "1", 2);
    job.spec.inputs = vec![StorageSpec::default(), StorageSpec::default()];
    let requirements = h.node.select_job(&job).await.unwrap().expect("job fits");
    assert_eq!(requirements.disk, 2 * GB);
}

#[tokio::test]
async fn shutdown_stops_event_handling() {
    let h = Harness::new(FakeExecutor::default(), roomy()).await;
    h.node.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.create(&job("job-late", "1", 1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.bids().is_empty());
    assert!(h.node.shards().is_empty());
}
