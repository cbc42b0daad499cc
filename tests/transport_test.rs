use std::path::Path;
use std::time::Duration;
use zerg_compute::model::{Job, JobEvent, JobEventType, JobSpec, RunCommandResult};
use zerg_compute::transport::{InProcessTransport, OutboundMessage, Transport};

#[tokio::test]
async fn random_ids_are_unique() {
    let a = InProcessTransport::with_random_id().host_id().await.unwrap();
    let b = InProcessTransport::with_random_id().host_id().await.unwrap();
    assert_ne!(a, b);
    assert_eq!(a.len(), 36);
}

#[tokio::test]
async fn events_reach_every_subscriber() {
    let transport = InProcessTransport::new("node-1");
    let mut first = transport.subscribe().await.unwrap();
    let mut second = transport.subscribe().await.unwrap();

    let job = Job::new("job-1", JobSpec::default());
    transport
        .publish(JobEvent::new(JobEventType::Created, "job-1"), job)
        .await;

    let (event, job) = first.recv().await.unwrap();
    assert_eq!(event.event_name, JobEventType::Created);
    assert_eq!(job.id, "job-1");
    assert_eq!(second.recv().await.unwrap().0.job_id, "job-1");
}

#[tokio::test]
async fn outbound_messages_are_recorded_in_order() {
    let transport = InProcessTransport::new("node-1");
    transport.bid_job("job-1", 0).await.unwrap();
    let output = RunCommandResult {
        stdout: "hello".to_string(),
        ..RunCommandResult::default()
    };
    transport
        .submit_result("job-1", 0, "ok", b"proposal", Some(&output))
        .await
        .unwrap();
    transport.publish_result("job-1", 0, Path::new("/results")).await.unwrap();
    transport.error_job("job-2", 1, "boom", None).await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 4);
    assert_eq!(
        sent[0],
        OutboundMessage::Bid {
            job_id: "job-1".to_string(),
            shard_index: 0
        }
    );
    assert!(matches!(&sent[1], OutboundMessage::Result { run_output: Some(o), .. } if o.stdout == "hello"));
    assert!(matches!(&sent[3], OutboundMessage::Error { shard_index: 1, run_output: None, .. }));

    let missing = transport
        .wait_for(|m| matches!(m, OutboundMessage::Bid { shard_index: 9, .. }), Duration::from_millis(30))
        .await;
    assert!(missing.is_none());
}
