use crate::audit::StateRecorder;
use crate::{KafkaProducer, Result, TicketQueueError};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    components: Arc<Mutex<Vec<Arc<dyn ShutdownComponent>>>>,
    shutdown_timeout: Duration,
}

/// Trait for components that need graceful shutdown
#[async_trait::async_trait]
pub trait ShutdownComponent: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
    fn name(&self) -> &str;
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            components: Arc::new(Mutex::new(Vec::new())),
            shutdown_timeout,
        }
    }

    /// Register a component for graceful shutdown
    pub async fn register_component(&self, component: Arc<dyn ShutdownComponent>) {
        let mut components = self.components.lock().await;
        info!("Registering component '{}' for graceful shutdown", component.name());
        components.push(component);
    }

    /// Get a shutdown signal receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every subscriber, then shut components down within the timeout.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if self.shutdown_tx.send(()).is_err() {
            warn!("No tasks were listening for the shutdown signal");
        }

        let components: Vec<Arc<dyn ShutdownComponent>> = self.components.lock().await.clone();
        let mut shutdown_tasks = Vec::new();

        for component in components {
            shutdown_tasks.push(tokio::spawn(async move {
                let name = component.name().to_string();
                info!("Shutting down component '{}'", name);
                match component.shutdown().await {
                    Ok(()) => info!("Component '{}' shutdown successfully", name),
                    Err(e) => error!("Component '{}' shutdown failed: {}", name, e),
                }
            }));
        }

        let shutdown_future = async {
            for task in shutdown_tasks {
                if let Err(e) = task.await {
                    error!("Shutdown task failed: {}", e);
                }
            }
        };

        match tokio::time::timeout(self.shutdown_timeout, shutdown_future).await {
            Ok(()) => {
                info!("All components shutdown successfully");
                Ok(())
            }
            Err(_) => {
                error!("Shutdown timeout exceeded");
                Err(TicketQueueError::InvalidArgument(
                    "Shutdown timeout exceeded".to_string(),
                ))
            }
        }
    }
}

/// Flushes pending join events on the way out.
pub struct ProducerShutdown {
    producer: KafkaProducer,
}

impl ProducerShutdown {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for ProducerShutdown {
    async fn shutdown(&self) -> Result<()> {
        info!("Flushing Kafka producer...");
        self.producer.flush(Duration::from_secs(10)).await?;
        info!("Kafka producer flushed successfully");
        Ok(())
    }

    fn name(&self) -> &str {
        "kafka-producer"
    }
}

/// Flushes the audit log.
pub struct RecorderShutdown {
    recorder: Arc<dyn StateRecorder>,
}

impl RecorderShutdown {
    pub fn new(recorder: Arc<dyn StateRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for RecorderShutdown {
    async fn shutdown(&self) -> Result<()> {
        info!("Flushing audit recorder...");
        self.recorder.flush().await?;
        info!("Audit recorder flushed successfully");
        Ok(())
    }

    fn name(&self) -> &str {
        "audit-recorder"
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

/// Run a service until it ends or a signal arrives, then shut down.
pub async fn run_with_graceful_shutdown<Fut>(
    service_name: &str,
    service_future: Fut,
    shutdown_coordinator: ShutdownCoordinator,
) -> Result<()>
where
    Fut: std::future::Future<Output = Result<()>>,
{
    info!("Starting service '{}'", service_name);

    let service_result = tokio::select! {
        result = service_future => {
            info!("Service '{}' completed", service_name);
            result
        }
        signal = wait_for_signal() => {
            info!("Service '{}' received shutdown signal", service_name);
            signal
        }
    };

    if let Err(e) = shutdown_coordinator.shutdown().await {
        error!("Failed to shutdown service '{}': {}", service_name, e);
        return Err(e);
    }

    service_result
}
