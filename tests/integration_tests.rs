use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use ticket_queue::audit::{MemoryRecorder, RocksDbRecorder, StateRecorder};
use ticket_queue::directory::StaticDirectory;
use ticket_queue::ingress::{IngressAdapter, IngressOutcome, IngressParts, IngressSettings};
use ticket_queue::retry::RetryConfig;
use ticket_queue::*;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};

enum Scripted {
    Fail,
    Deliver(KafkaMessage),
}

#[derive(Default)]
struct MockState {
    script: VecDeque<Scripted>,
    subscriptions: Vec<Vec<String>>,
    commits: Vec<i64>,
    paused: Vec<(String, i32, i64)>,
    resumed: Vec<(String, i32)>,
}

/// In-memory broker double; clones share state so tests can inspect it
/// after the adapter has taken ownership.
#[derive(Clone, Default)]
struct MockConsumer {
    state: Arc<Mutex<MockState>>,
}

impl MockConsumer {
    fn push(&self, scripted: Scripted) {
        self.state.lock().unwrap().script.push_back(scripted);
    }

    fn commits(&self) -> Vec<i64> {
        self.state.lock().unwrap().commits.clone()
    }

    fn paused(&self) -> Vec<(String, i32, i64)> {
        self.state.lock().unwrap().paused.clone()
    }

    fn resumed(&self) -> Vec<(String, i32)> {
        self.state.lock().unwrap().resumed.clone()
    }

    fn subscriptions(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().subscriptions.clone()
    }
}

#[async_trait]
impl BrokerConsumer for MockConsumer {
    fn subscribe(&self, topics: &[String]) -> Result<()> {
        self.state.lock().unwrap().subscriptions.push(topics.to_vec());
        Ok(())
    }

    async fn recv_message(&self, timeout_duration: Duration) -> Result<Option<KafkaMessage>> {
        let next = self.state.lock().unwrap().script.pop_front();
        match next {
            Some(Scripted::Deliver(message)) => Ok(Some(message)),
            Some(Scripted::Fail) => Err(TicketQueueError::BrokerUnavailable("connection refused".to_string())),
            None => {
                sleep(timeout_duration).await;
                Ok(None)
            }
        }
    }

    fn commit_message(&self, message: &KafkaMessage) -> Result<()> {
        self.state.lock().unwrap().commits.push(message.offset);
        Ok(())
    }

    fn pause_at(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .paused
            .push((topic.to_string(), partition, offset));
        Ok(())
    }

    fn resume(&self, topic: &str, partition: i32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .resumed
            .push((topic.to_string(), partition));
        Ok(())
    }
}

struct Harness {
    adapter: IngressAdapter<MockConsumer>,
    consumer: MockConsumer,
    queue: Arc<AdmissionQueue>,
    registry: Arc<ConnectionRegistry>,
    promoter: Arc<Promoter>,
    recorder: Arc<MemoryRecorder>,
    metrics: Metrics,
}

fn harness(capacity: usize, groups: Vec<GroupKey>) -> Harness {
    let metrics = Metrics::new().unwrap();
    let (queue, resume_signals) = AdmissionQueue::new(capacity, metrics.clone());
    let queue = Arc::new(queue);
    let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
    let recorder = Arc::new(MemoryRecorder::new());
    let promoter = Arc::new(Promoter::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        recorder.clone() as Arc<dyn StateRecorder>,
        metrics.clone(),
        None,
    ));
    let consumer = MockConsumer::default();

    let parts = IngressParts {
        queue: Arc::clone(&queue),
        resume_signals,
        registry: Arc::clone(&registry),
        promoter: Arc::clone(&promoter),
        recorder: recorder.clone() as Arc<dyn StateRecorder>,
        directory: Arc::new(StaticDirectory::new(groups)),
        metrics: metrics.clone(),
    };
    let settings = IngressSettings {
        poll_timeout: Duration::from_millis(100),
        refresh_interval: Duration::from_secs(30),
        reconnect: RetryConfig::broker_reconnect(),
    };

    Harness {
        adapter: IngressAdapter::new(consumer.clone(), parts, settings),
        consumer,
        queue,
        registry,
        promoter,
        recorder,
        metrics,
    }
}

fn join(topic: &str, offset: i64, request_id: &str, user: &str) -> KafkaMessage {
    KafkaMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: Some(request_id.to_string()),
        payload: Some(format!(r#"{{"request_id":"{}","user_identity":"{}"}}"#, request_id, user)),
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut received = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        received.push(notification);
    }
    received
}

fn statuses(recorder: &MemoryRecorder, request_id: &str) -> Vec<RequestStatus> {
    recorder
        .transitions()
        .into_iter()
        .filter(|t| t.request_id == request_id)
        .map(|t| t.status)
        .collect()
}

#[tokio::test]
async fn test_admitted_join_is_committed_and_promoted() {
    let mut h = harness(5, vec![]);
    let group = GroupKey::new("42", "vip");
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.registry.register("req1", tx);

    let outcome = h.adapter.handle_message(&join("match.42.vip", 0, "req1", "alice")).await;

    assert_eq!(outcome, IngressOutcome::Admitted { position: 1 });
    assert_eq!(h.consumer.commits(), vec![0]);
    assert_eq!(
        drain(&mut rx),
        vec![
            Notification::StartSelection {
                group: group.clone(),
                position: 1
            },
            Notification::YourTurn { group: group.clone() },
        ]
    );
    assert_eq!(h.promoter.active_selection(&group).unwrap().request_id, "req1");
    assert_eq!(
        statuses(&h.recorder, "req1"),
        vec![RequestStatus::InQueue, RequestStatus::Selecting]
    );
    assert_eq!(h.metrics.admissions.get(), 1.0);
}

#[tokio::test]
async fn test_full_queue_pauses_partition_until_promotion() {
    let mut h = harness(1, vec![]);
    let group = GroupKey::new("7", "standard");
    let topic = group.topic();
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.registry.register("req3", tx);

    // req1 goes straight to selecting, req2 fills the single slot
    assert_eq!(
        h.adapter.handle_message(&join(&topic, 0, "req1", "a")).await,
        IngressOutcome::Admitted { position: 1 }
    );
    assert_eq!(
        h.adapter.handle_message(&join(&topic, 1, "req2", "b")).await,
        IngressOutcome::Admitted { position: 1 }
    );

    // req3 is rejected: no commit, partition rewound to its offset
    assert_eq!(
        h.adapter.handle_message(&join(&topic, 2, "req3", "c")).await,
        IngressOutcome::Rejected
    );
    assert_eq!(h.consumer.commits(), vec![0, 1]);
    assert_eq!(h.consumer.paused(), vec![(topic.clone(), 0, 2)]);
    assert_eq!(h.adapter.paused_partitions(), vec![(topic.clone(), 0, 2)]);
    assert!(h.queue.is_paused(&group));
    assert_eq!(drain(&mut rx), vec![Notification::QueueFull { group: group.clone() }]);

    // A prefetched later message is held back as well
    assert_eq!(
        h.adapter.handle_message(&join(&topic, 3, "req4", "d")).await,
        IngressOutcome::Deferred
    );
    assert_eq!(h.consumer.commits(), vec![0, 1]);

    // Nothing resumes while the queue is still full
    assert_eq!(h.adapter.apply_resume_signals(), 0);

    // req1 finishes, req2 is promoted, the group drops below capacity
    let promotion = h.promoter.finish(&group, SelectionOutcome::Reserved).await;
    assert_eq!(promotion.finished.unwrap().request_id, "req1");
    assert_eq!(promotion.promoted.unwrap().request_id, "req2");

    assert_eq!(h.adapter.apply_resume_signals(), 1);
    assert_eq!(h.adapter.apply_resume_signals(), 0);
    assert_eq!(h.consumer.resumed(), vec![(topic.clone(), 0)]);
    assert!(h.adapter.paused_partitions().is_empty());

    // Redelivery of the rejected message now succeeds
    assert_eq!(
        h.adapter.handle_message(&join(&topic, 2, "req3", "c")).await,
        IngressOutcome::Admitted { position: 1 }
    );
    assert_eq!(h.consumer.commits(), vec![0, 1, 2]);
    assert_eq!(h.metrics.rejections.get(), 1.0);
}

#[tokio::test]
async fn test_duplicate_delivery_is_acknowledged_quietly() {
    let mut h = harness(5, vec![]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.registry.register("req1", tx);
    let message = join("match.1.vip", 4, "req1", "alice");

    h.adapter.handle_message(&message).await;
    let first = drain(&mut rx);

    assert_eq!(h.adapter.handle_message(&message).await, IngressOutcome::Duplicate);
    assert_eq!(h.consumer.commits(), vec![4, 4]);
    assert_eq!(first.len(), 2);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(h.metrics.duplicates.get(), 1.0);
}

#[tokio::test]
async fn test_malformed_messages_are_skipped_and_committed() {
    let mut h = harness(5, vec![]);

    let mut bad_payload = join("match.1.vip", 0, "x", "y");
    bad_payload.payload = Some("{not json".to_string());
    let bad_topic = join("orders", 1, "req1", "alice");
    let mut empty = join("match.1.vip", 2, "x", "y");
    empty.payload = None;

    assert_eq!(h.adapter.handle_message(&bad_payload).await, IngressOutcome::Malformed);
    assert_eq!(h.adapter.handle_message(&bad_topic).await, IngressOutcome::Malformed);
    assert_eq!(h.adapter.handle_message(&empty).await, IngressOutcome::Malformed);

    assert_eq!(h.consumer.commits(), vec![0, 1, 2]);
    assert_eq!(h.metrics.malformed_messages.get(), 3.0);
    assert_eq!(h.queue.total_pending(), 0);
}

#[tokio::test]
async fn test_refresh_subscribes_to_discovered_groups() {
    let groups = vec![GroupKey::new("2", "standard"), GroupKey::new("1", "VIP")];
    let mut h = harness(5, groups);

    h.adapter.refresh_groups().await;
    h.adapter.refresh_groups().await;

    // Unchanged discovery does not resubscribe
    assert_eq!(
        h.consumer.subscriptions(),
        vec![vec!["match.1.vip".to_string(), "match.2.standard".to_string()]]
    );
    assert_eq!(
        h.queue.groups(),
        vec![GroupKey::new("1", "vip"), GroupKey::new("2", "standard")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_run_reconnects_with_backoff_and_keeps_ingesting() {
    let group = GroupKey::new("9", "premium");
    let h = harness(5, vec![group.clone()]);
    h.consumer.push(Scripted::Fail);
    h.consumer.push(Scripted::Fail);
    h.consumer.push(Scripted::Deliver(join(&group.topic(), 0, "req1", "alice")));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let consumer = h.consumer.clone();
    let task = tokio::spawn(h.adapter.run(shutdown_rx));

    // 1s + 2s of backoff, then the message
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.metrics.broker_reconnects.get(), 2.0);
    assert_eq!(consumer.commits(), vec![0]);
    assert_eq!(h.promoter.active_selection(&group).unwrap().request_id, "req1");
    // initial subscription plus one per reconnect
    assert_eq!(consumer.subscriptions().len(), 3);

    shutdown_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_finish_on_empty_group_is_a_no_op() {
    let h = harness(5, vec![]);
    let group = GroupKey::new("1", "vip");

    let promotion = h.promoter.finish(&group, SelectionOutcome::Reserved).await;

    assert_eq!(promotion, Promotion::default());
    assert!(h.recorder.transitions().is_empty());
    assert_eq!(h.queue.depth(&group), 0);
    assert!(!h.queue.is_paused(&group));
}

#[tokio::test]
async fn test_finish_promotes_in_fifo_order() {
    let h = harness(5, vec![]);
    let group = GroupKey::new("3", "vip");
    for id in ["a", "b", "c"] {
        h.queue.enqueue(AdmissionRequest::new(id, group.clone(), id));
    }

    let mut order = Vec::new();
    for _ in 0..4 {
        if let Some(request) = h.promoter.finish(&group, SelectionOutcome::Reserved).await.promoted {
            order.push(request.request_id);
        }
    }

    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(statuses(&h.recorder, "a"), vec![RequestStatus::Selecting, RequestStatus::Reserved]);
    assert!(h.promoter.active_selection(&group).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_selection_deadline_times_out_and_promotes_next() {
    let metrics = Metrics::new().unwrap();
    let (queue, _resume) = AdmissionQueue::new(5, metrics.clone());
    let queue = Arc::new(queue);
    let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
    let recorder = Arc::new(MemoryRecorder::new());
    let promoter = Arc::new(Promoter::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        recorder.clone() as Arc<dyn StateRecorder>,
        metrics.clone(),
        Some(Duration::from_secs(10)),
    ));
    let group = GroupKey::new("5", "vip");
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register("slow", tx);

    queue.enqueue(AdmissionRequest::new("slow", group.clone(), "alice"));
    queue.enqueue(AdmissionRequest::new("next", group.clone(), "bob"));
    assert_eq!(promoter.kick(&group).await.unwrap().request_id, "slow");

    sleep(Duration::from_secs(11)).await;

    assert_eq!(
        statuses(&recorder, "slow"),
        vec![RequestStatus::Selecting, RequestStatus::TimedOut]
    );
    assert_eq!(promoter.active_selection(&group).unwrap().request_id, "next");
    assert_eq!(
        drain(&mut rx),
        vec![
            Notification::YourTurn { group: group.clone() },
            Notification::SelectionTimeout { group: group.clone() },
        ]
    );
    assert_eq!(metrics.selection_timeouts.get(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_finish_before_deadline_disarms_the_timer() {
    let metrics = Metrics::new().unwrap();
    let (queue, _resume) = AdmissionQueue::new(5, metrics.clone());
    let queue = Arc::new(queue);
    let recorder = Arc::new(MemoryRecorder::new());
    let promoter = Arc::new(Promoter::new(
        Arc::clone(&queue),
        Arc::new(ConnectionRegistry::new(metrics.clone())),
        recorder.clone() as Arc<dyn StateRecorder>,
        metrics.clone(),
        Some(Duration::from_secs(10)),
    ));
    let group = GroupKey::new("5", "vip");

    queue.enqueue(AdmissionRequest::new("quick", group.clone(), "alice"));
    promoter.kick(&group).await;
    sleep(Duration::from_secs(3)).await;
    promoter.finish(&group, SelectionOutcome::Reserved).await;

    sleep(Duration::from_secs(20)).await;

    assert_eq!(
        statuses(&recorder, "quick"),
        vec![RequestStatus::Selecting, RequestStatus::Reserved]
    );
    assert_eq!(metrics.selection_timeouts.get(), 0.0);
}

#[tokio::test]
async fn test_cancel_queued_request_ends_pause_episode() {
    let metrics = Metrics::new().unwrap();
    let (queue, mut resume) = AdmissionQueue::new(1, metrics.clone());
    let queue = Arc::new(queue);
    let recorder = Arc::new(MemoryRecorder::new());
    let promoter = Arc::new(Promoter::new(
        Arc::clone(&queue),
        Arc::new(ConnectionRegistry::new(metrics.clone())),
        recorder.clone() as Arc<dyn StateRecorder>,
        metrics,
        None,
    ));
    let group = GroupKey::new("8", "vip");

    queue.enqueue(AdmissionRequest::new("first", group.clone(), "a"));
    assert!(!queue.enqueue(AdmissionRequest::new("second", group.clone(), "b")).is_accepted());
    assert!(queue.is_paused(&group));

    assert!(promoter.cancel(&group, "first").await);
    assert!(!promoter.cancel(&group, "unknown").await);

    assert_eq!(resume.try_recv().unwrap(), group);
    assert!(!queue.is_paused(&group));
    assert_eq!(statuses(&recorder, "first"), vec![RequestStatus::Cancelled]);
}

#[tokio::test]
async fn test_cancel_selecting_request_promotes_next() {
    let h = harness(5, vec![]);
    let group = GroupKey::new("8", "vip");
    h.queue.enqueue(AdmissionRequest::new("first", group.clone(), "a"));
    h.queue.enqueue(AdmissionRequest::new("second", group.clone(), "b"));
    h.promoter.kick(&group).await;

    assert!(h.promoter.cancel(&group, "first").await);

    assert_eq!(h.promoter.active_selection(&group).unwrap().request_id, "second");
    assert_eq!(
        statuses(&h.recorder, "first"),
        vec![RequestStatus::Selecting, RequestStatus::Cancelled]
    );
}

#[tokio::test]
async fn test_rocksdb_recorder_history_integration() {
    let temp_dir = tempdir().unwrap();
    let recorder = RocksDbRecorder::open(temp_dir.path().join(Stores::TRANSITIONS)).unwrap();

    for status in [RequestStatus::InQueue, RequestStatus::Selecting, RequestStatus::Reserved] {
        recorder.record(StateTransition::new("r1", status)).await.unwrap();
    }
    // Shares a textual prefix with r1 but must not leak into its history
    recorder
        .record(StateTransition::new("r10", RequestStatus::InQueue))
        .await
        .unwrap();

    let history = recorder.history("r1").await.unwrap();
    let statuses: Vec<RequestStatus> = history.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![RequestStatus::InQueue, RequestStatus::Selecting, RequestStatus::Reserved]
    );
    assert!(history.iter().all(|t| t.request_id == "r1"));
    assert_eq!(recorder.history("r10").await.unwrap().len(), 1);
    assert!(recorder.history("missing").await.unwrap().is_empty());

    recorder.flush().await.unwrap();
}

#[tokio::test]
async fn test_config_parsing_integration() {
    let config_content = r#"
bootstrap.servers=localhost:9092,localhost:9093
security.protocol=PLAINTEXT
queue.capacity=3
queue.categories=vip, standard
queue.groups=10:vip,11:standard
queue.selection.timeout.ms=0
workers.count=2
workers.source.address=10.0.0.5:5000
linger.ms=5
"#;

    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("test.properties");
    std::fs::write(&config_path, config_content).unwrap();

    let config = parse_properties_file(&config_path, "queue-service").unwrap();

    assert_eq!(config.application_id, "queue-service");
    assert_eq!(config.kafka.bootstrap_servers, "localhost:9092,localhost:9093");
    assert_eq!(config.kafka.security_protocol, Some("PLAINTEXT".to_string()));
    assert_eq!(config.queue.capacity, 3);
    assert_eq!(config.queue.categories, vec!["vip", "standard"]);
    assert_eq!(
        config.queue.groups,
        vec![GroupKey::new("10", "vip"), GroupKey::new("11", "standard")]
    );
    assert_eq!(config.queue.selection_timeout(), None);
    assert_eq!(config.workers.count, 2);
    assert_eq!(config.workers.source_address, "10.0.0.5:5000");
    assert_eq!(
        config.kafka.additional_properties.get("linger.ms"),
        Some(&"5".to_string())
    );

    // Later files override earlier ones
    let override_path = temp_dir.path().join("override.properties");
    std::fs::write(&override_path, "queue.capacity=9\n").unwrap();
    let merged = merge_properties_file(config, &override_path).unwrap();
    assert_eq!(merged.queue.capacity, 9);
    assert_eq!(merged.workers.count, 2);

    let consumer = merged.to_consumer_config();
    assert_eq!(consumer.get("enable.auto.commit"), Some("false"));
    assert_eq!(consumer.get("group.id"), Some("queue-service"));
}
