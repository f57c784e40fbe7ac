use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use ticket_queue::audit::{MemoryRecorder, RocksDbRecorder, StateRecorder};
use ticket_queue::coordinator::{QueueWorkSource, WorkSourceServer};
use ticket_queue::directory::{GroupDirectory, HttpMatchDirectory, StaticDirectory};
use ticket_queue::ingress::{IngressAdapter, IngressParts, IngressSettings};
use ticket_queue::{
    AdmissionQueue, ClientAction, ConnectionRegistry, ConnectionSender, GroupKey, JoinEvent, KafkaConsumer,
    KafkaProducer, Metrics, Notification, Promoter, ResumeSignals, Result, ServiceConfig, Stores,
    TicketQueueError, TopicProvisioner,
};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub resource_id: String,
    pub category: String,
    pub user_identity: String,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub request_id: String,
    pub topic: String,
}

pub struct QueueService {
    pub config: ServiceConfig,
    pub metrics: Metrics,
    pub queue: Arc<AdmissionQueue>,
    pub registry: Arc<ConnectionRegistry>,
    pub promoter: Arc<Promoter>,
    pub recorder: Arc<dyn StateRecorder>,
    pub producer: KafkaProducer,
}

impl QueueService {
    pub fn new(config: ServiceConfig, ephemeral: bool) -> Result<(Self, ResumeSignals)> {
        let metrics = Metrics::new()?;
        let (queue, resume_signals) = AdmissionQueue::new(config.queue.capacity, metrics.clone());
        let queue = Arc::new(queue.with_dedup_window(config.queue.dedup_window));
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));

        let recorder: Arc<dyn StateRecorder> = if ephemeral {
            info!("Using in-memory audit log");
            Arc::new(MemoryRecorder::new())
        } else {
            let path = Path::new(&config.state_dir).join(Stores::TRANSITIONS);
            info!("Audit log at {:?}", path);
            Arc::new(RocksDbRecorder::open(path)?)
        };

        let promoter = Arc::new(Promoter::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&recorder),
            metrics.clone(),
            config.queue.selection_timeout(),
        ));
        let producer = KafkaProducer::new(config.to_kafka_config())?;

        let service = Self {
            config,
            metrics,
            queue,
            registry,
            promoter,
            recorder,
            producer,
        };
        Ok((service, resume_signals))
    }

    /// True when a worker pool pulls from this queue instead of the
    /// finish-driven promotion.
    pub fn serves_worker_pool(&self) -> bool {
        self.config.workers.source_listen.is_some()
    }

    pub fn ingress(&self, resume_signals: ResumeSignals) -> Result<IngressAdapter<KafkaConsumer>> {
        let consumer = KafkaConsumer::new(self.config.to_consumer_config())?;
        let directory: Arc<dyn GroupDirectory> = match &self.config.queue.matches_api_url {
            Some(url) => {
                info!("Discovering groups from {}", url);
                Arc::new(HttpMatchDirectory::new(url.clone(), self.config.queue.categories.clone()))
            }
            None => Arc::new(StaticDirectory::new(self.config.queue.groups.clone())),
        };

        let parts = IngressParts {
            queue: Arc::clone(&self.queue),
            resume_signals,
            registry: Arc::clone(&self.registry),
            promoter: Arc::clone(&self.promoter),
            recorder: Arc::clone(&self.recorder),
            directory,
            metrics: self.metrics.clone(),
        };
        let adapter = IngressAdapter::new(consumer, parts, IngressSettings::from(&self.config.queue))
            .with_provisioner(TopicProvisioner::new(self.config.to_kafka_config())?);

        if self.serves_worker_pool() {
            Ok(adapter.without_immediate_promotion())
        } else {
            Ok(adapter)
        }
    }

    pub fn work_source_server(&self) -> WorkSourceServer {
        let source = QueueWorkSource::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::clone(&self.recorder),
            self.metrics.clone(),
        );
        WorkSourceServer::new(Arc::new(source))
    }

    /// Publish a join event for a new request id.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishResponse> {
        if request.user_identity.is_empty() {
            return Err(TicketQueueError::InvalidArgument("user_identity is required".to_string()));
        }
        let group = GroupKey::checked(request.resource_id, &request.category)?;
        let event = JoinEvent {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_identity: request.user_identity,
        };

        let topic = self.producer.publish_join(&group, &event).await?;
        info!(group = %group, request_id = %event.request_id, "Published join event");
        Ok(PublishResponse {
            request_id: event.request_id,
            topic,
        })
    }

    /// Apply one client action; the returned notification goes back to the
    /// same connection.
    pub async fn handle_action(&self, action: ClientAction, channel: &ConnectionSender) -> Option<Notification> {
        match action {
            ClientAction::Register { request_id } => {
                self.registry.register(request_id.clone(), channel.clone());
                Some(Notification::Registered { request_id })
            }
            ClientAction::Finish { .. } if self.serves_worker_pool() => Some(Notification::Error {
                message: "selections end through the worker pool here".to_string(),
            }),
            ClientAction::Finish {
                resource_id,
                category,
                outcome,
            } => {
                let group = GroupKey::new(resource_id, &category);
                let promotion = self.promoter.finish(&group, outcome).await;
                info!(
                    group = %group,
                    finished = ?promotion.finished.map(|r| r.request_id),
                    promoted = ?promotion.promoted.map(|r| r.request_id),
                    "Finish handled"
                );
                None
            }
            ClientAction::Cancel {
                request_id,
                resource_id,
                category,
            } => {
                let group = GroupKey::new(resource_id, &category);
                if self.promoter.cancel(&group, &request_id).await {
                    None
                } else {
                    Some(Notification::Error {
                        message: format!("request {} is not queued or selecting in {}", request_id, group),
                    })
                }
            }
            ClientAction::Select { .. } => Some(Notification::Error {
                message: "seat picks are taken by the coordinator service".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticket_queue::{AdmissionRequest, SelectionOutcome};
    use tokio::sync::mpsc;

    fn service(worker_pool: bool) -> QueueService {
        let mut config = ServiceConfig::new("queue-service-test");
        if worker_pool {
            config.workers.source_listen = Some("127.0.0.1:0".to_string());
        }
        let (service, _resume_signals) = QueueService::new(config, true).unwrap();
        service
    }

    fn finish(resource_id: &str, category: &str) -> ClientAction {
        ClientAction::Finish {
            resource_id: resource_id.to_string(),
            category: category.to_string(),
            outcome: SelectionOutcome::default(),
        }
    }

    #[tokio::test]
    async fn finish_is_refused_when_a_worker_pool_drives_selection() {
        let service = service(true);
        let group = GroupKey::new("1", "vip");
        service.queue.enqueue(AdmissionRequest::new("r1", group.clone(), "alice"));
        let (tx, _rx) = mpsc::unbounded_channel();

        let reply = service.handle_action(finish("1", "vip"), &tx).await;

        assert!(matches!(reply, Some(Notification::Error { .. })));
        assert_eq!(service.queue.depth(&group), 1);
    }

    #[tokio::test]
    async fn finish_promotes_without_a_worker_pool() {
        let service = service(false);
        let group = GroupKey::new("1", "vip");
        service.queue.enqueue(AdmissionRequest::new("r1", group.clone(), "alice"));
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(service.handle_action(finish("1", "vip"), &tx).await, None);
        assert_eq!(service.queue.depth(&group), 0);
    }

    #[tokio::test]
    async fn publish_rejects_ids_that_cannot_form_a_topic() {
        let service = service(false);
        let result = service
            .publish(PublishRequest {
                resource_id: "1.5".to_string(),
                category: "vip".to_string(),
                user_identity: "alice".to_string(),
            })
            .await;

        assert!(matches!(result, Err(TicketQueueError::InvalidTopic(_))));
    }
}
