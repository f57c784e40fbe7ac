use crate::audit::{record_transition, StateRecorder};
use crate::directory::GroupDirectory;
use crate::queue::{AdmissionQueue, EnqueueOutcome, ResumeSignals};
use crate::retry::{Backoff, RetryConfig};
use crate::{
    AdmissionRequest, BrokerConsumer, ConnectionRegistry, GroupKey, JoinEvent, KafkaMessage, Metrics,
    Notification, Promoter, QueueSettings, RequestStatus, StateTransition, TicketQueueError,
    TopicProvisioner,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IngressSettings {
    pub poll_timeout: Duration,
    pub refresh_interval: Duration,
    pub reconnect: RetryConfig,
}

impl From<&QueueSettings> for IngressSettings {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            poll_timeout: settings.poll_timeout(),
            refresh_interval: settings.refresh_interval(),
            reconnect: RetryConfig::broker_reconnect(),
        }
    }
}

/// What happened to one broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    Admitted { position: usize },
    Duplicate,
    /// Queue full: offset left uncommitted and the partition paused.
    Rejected,
    /// Arrived on a partition that is held back; left for redelivery.
    Deferred,
    /// Unparseable; committed so it cannot stall the partition.
    Malformed,
}

/// Collaborators the adapter drives.
pub struct IngressParts {
    pub queue: Arc<AdmissionQueue>,
    pub resume_signals: ResumeSignals,
    pub registry: Arc<ConnectionRegistry>,
    pub promoter: Arc<Promoter>,
    pub recorder: Arc<dyn StateRecorder>,
    pub directory: Arc<dyn GroupDirectory>,
    pub metrics: Metrics,
}

/// Bridges join events from the broker into admission attempts.
///
/// Owns all broker state: subscription, paused partitions and commits.
/// Offsets are committed only once a message is admitted (or is malformed).
/// A rejected message pauses its partition rewound to that offset, so it is
/// delivered again once the queue signals resume.
pub struct IngressAdapter<C: BrokerConsumer> {
    consumer: C,
    queue: Arc<AdmissionQueue>,
    resume_signals: ResumeSignals,
    registry: Arc<ConnectionRegistry>,
    promoter: Arc<Promoter>,
    recorder: Arc<dyn StateRecorder>,
    directory: Arc<dyn GroupDirectory>,
    provisioner: Option<TopicProvisioner>,
    metrics: Metrics,
    settings: IngressSettings,
    /// Held-back partitions per group with the offset to redeliver from.
    paused: HashMap<GroupKey, BTreeMap<(String, i32), i64>>,
    groups: BTreeSet<GroupKey>,
    promote_on_admit: bool,
}

impl<C: BrokerConsumer> IngressAdapter<C> {
    pub fn new(consumer: C, parts: IngressParts, settings: IngressSettings) -> Self {
        Self {
            consumer,
            queue: parts.queue,
            resume_signals: parts.resume_signals,
            registry: parts.registry,
            promoter: parts.promoter,
            recorder: parts.recorder,
            directory: parts.directory,
            provisioner: None,
            metrics: parts.metrics,
            settings,
            paused: HashMap::new(),
            groups: BTreeSet::new(),
            promote_on_admit: true,
        }
    }

    /// Create topics for newly discovered groups before subscribing.
    pub fn with_provisioner(mut self, provisioner: TopicProvisioner) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Leave promotion to a worker pool pulling from the queue.
    pub fn without_immediate_promotion(mut self) -> Self {
        self.promote_on_admit = false;
        self
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn groups(&self) -> &BTreeSet<GroupKey> {
        &self.groups
    }

    /// Paused partitions as `(topic, partition, redelivery offset)`.
    pub fn paused_partitions(&self) -> Vec<(String, i32, i64)> {
        let mut paused: Vec<(String, i32, i64)> = self
            .paused
            .values()
            .flat_map(|partitions| {
                partitions
                    .iter()
                    .map(|((topic, partition), offset)| (topic.clone(), *partition, *offset))
            })
            .collect();
        paused.sort();
        paused
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> crate::Result<()> {
        info!("Ingress adapter is running...");
        self.refresh_groups().await;

        let period = self.settings.refresh_interval;
        let mut refresh = interval_at(Instant::now() + period, period);
        let mut backoff = Backoff::new(self.settings.reconnect.clone());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Ingress adapter received shutdown signal");
                    break;
                }

                Some(group) = self.resume_signals.recv() => {
                    self.resume_group(&group);
                }

                _ = refresh.tick() => {
                    self.refresh_groups().await;
                }

                received = self.consumer.recv_message(self.settings.poll_timeout) => {
                    match received {
                        Ok(Some(message)) => {
                            backoff.reset();
                            let outcome = self.handle_message(&message).await;
                            debug!(topic = %message.topic, offset = message.offset, ?outcome, "Handled join event");
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            if !self.reconnect(&mut backoff, e, &mut shutdown).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Ingress adapter shutting down...");
        Ok(())
    }

    /// Attempt admission for one join event.
    pub async fn handle_message(&mut self, message: &KafkaMessage) -> IngressOutcome {
        self.metrics.join_messages_received.inc();

        let group = match message.group_key() {
            Ok(group) => group,
            Err(e) => return self.skip_malformed(message, e),
        };

        if let Some(offset) = self.paused_offset(&group, &message.topic, message.partition) {
            // Prefetched past the rejected message; rewind again.
            if let Err(e) = self.consumer.pause_at(&message.topic, message.partition, offset) {
                warn!(topic = %message.topic, partition = message.partition, "Failed to re-pause partition: {}", e);
            }
            return IngressOutcome::Deferred;
        }

        let event: JoinEvent = match message.deserialize_value() {
            Ok(event) => event,
            Err(e) => return self.skip_malformed(message, e),
        };

        let request = AdmissionRequest::from_join(group.clone(), event);
        let request_id = request.request_id.clone();

        match self.queue.enqueue(request) {
            EnqueueOutcome::Admitted { position } => {
                self.commit(message);
                info!(group = %group, request_id = %request_id, position, "Admitted");
                record_transition(
                    self.recorder.as_ref(),
                    StateTransition::new(&request_id, RequestStatus::InQueue),
                )
                .await;
                self.registry.send(
                    &request_id,
                    Notification::StartSelection {
                        group: group.clone(),
                        position,
                    },
                );
                if self.promote_on_admit {
                    self.promoter.kick(&group).await;
                }
                IngressOutcome::Admitted { position }
            }
            EnqueueOutcome::AlreadyAdmitted { .. } => {
                debug!(group = %group, request_id = %request_id, "Duplicate delivery acknowledged");
                self.commit(message);
                IngressOutcome::Duplicate
            }
            EnqueueOutcome::Rejected(full) => {
                info!(group = %group, request_id = %request_id, capacity = full.capacity, "Queue full");
                self.pause(&group, message);
                self.registry.send(&request_id, Notification::QueueFull { group });
                IngressOutcome::Rejected
            }
        }
    }

    /// Apply every resume signal already raised by the queue.
    pub fn apply_resume_signals(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(group) = self.resume_signals.try_recv() {
            self.resume_group(&group);
            applied += 1;
        }
        applied
    }

    fn paused_offset(&self, group: &GroupKey, topic: &str, partition: i32) -> Option<i64> {
        self.paused
            .get(group)
            .and_then(|partitions| partitions.get(&(topic.to_string(), partition)))
            .copied()
    }

    fn pause(&mut self, group: &GroupKey, message: &KafkaMessage) {
        let offset = *self
            .paused
            .entry(group.clone())
            .or_default()
            .entry((message.topic.clone(), message.partition))
            .or_insert(message.offset);

        match self.consumer.pause_at(&message.topic, message.partition, offset) {
            Ok(()) => info!(group = %group, partition = message.partition, offset, "Paused partition"),
            Err(e) => error!(group = %group, partition = message.partition, "Failed to pause partition: {}", e),
        }
    }

    fn resume_group(&mut self, group: &GroupKey) {
        let Some(partitions) = self.paused.remove(group) else {
            debug!(group = %group, "Resume signal for a group that is not paused");
            return;
        };
        for (topic, partition) in partitions.keys() {
            match self.consumer.resume(topic, *partition) {
                Ok(()) => info!(group = %group, partition = *partition, "Resumed partition"),
                Err(e) => error!(group = %group, partition = *partition, "Failed to resume partition: {}", e),
            }
        }
    }

    fn commit(&self, message: &KafkaMessage) {
        if let Err(e) = self.consumer.commit_message(message) {
            // The message will come back and be acknowledged as a duplicate.
            error!(topic = %message.topic, offset = message.offset, "Error committing message: {}", e);
        }
    }

    fn skip_malformed(&self, message: &KafkaMessage, e: TicketQueueError) -> IngressOutcome {
        warn!(topic = %message.topic, offset = message.offset, "Skipping malformed message: {}", e);
        self.metrics.malformed_messages.inc();
        self.commit(message);
        IngressOutcome::Malformed
    }

    /// Re-derive the ingested groups and resubscribe when the set changed.
    pub async fn refresh_groups(&mut self) {
        let discovered = match self.directory.groups().await {
            Ok(groups) => groups,
            Err(e) => {
                warn!("Group discovery failed, keeping current subscription: {}", e);
                return;
            }
        };
        if discovered == self.groups {
            return;
        }

        let added: Vec<GroupKey> = discovered.difference(&self.groups).cloned().collect();
        if let Some(provisioner) = &self.provisioner {
            if let Err(e) = provisioner.ensure_topics(&added).await {
                warn!("Topic provisioning failed: {}", e);
            }
        }
        for group in &added {
            self.queue.ensure_group(group);
        }

        info!(groups = discovered.len(), added = added.len(), "Group set changed, resubscribing");
        self.groups = discovered;
        self.resubscribe();
    }

    fn resubscribe(&self) {
        let topics: Vec<String> = self.groups.iter().map(GroupKey::topic).collect();
        if let Err(e) = self.consumer.subscribe(&topics) {
            error!("Failed to subscribe: {}", e);
            return;
        }
        // A new assignment forgets pauses; put them back.
        for partitions in self.paused.values() {
            for ((topic, partition), offset) in partitions {
                if let Err(e) = self.consumer.pause_at(topic, *partition, *offset) {
                    warn!(topic = %topic, partition = *partition, "Failed to re-apply pause: {}", e);
                }
            }
        }
    }

    /// Wait out the backoff and re-establish the subscription. Returns false
    /// if shutdown was requested meanwhile.
    async fn reconnect(
        &mut self,
        backoff: &mut Backoff,
        cause: TicketQueueError,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        self.metrics.broker_reconnects.inc();
        let delay = backoff.next_delay();
        warn!(attempt = backoff.attempts(), ?delay, "Broker unavailable ({}), reconnecting", cause);

        tokio::select! {
            _ = shutdown.recv() => return false,
            _ = sleep(delay) => {}
        }

        self.resubscribe();
        true
    }
}
