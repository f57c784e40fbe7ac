use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use ticket_queue::shutdown::{run_with_graceful_shutdown, ProducerShutdown, RecorderShutdown, ShutdownCoordinator};
use ticket_queue::{parse_properties_file, Result, ServiceConfig, TicketQueueError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod gateway;
mod service;

use gateway::AppState;
use service::QueueService;

#[derive(Parser, Debug)]
#[command(name = "queue-service")]
#[command(about = "Admission queue: ingests join events and pushes queue updates to clients")]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8080")]
    port: u16,

    /// Config file path
    #[arg(short = 'c', long = "config", default_value = "client.dev.properties")]
    config: PathBuf,

    /// Directory for the audit log
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,

    /// Serve the worker-pool request source on this address
    #[arg(long = "source-listen")]
    source_listen: Option<String>,

    /// Keep the audit log in memory
    #[arg(long = "ephemeral")]
    ephemeral: bool,
}

fn load_config(args: &Args) -> Result<ServiceConfig> {
    let config = if args.config.exists() {
        info!("Config file: {:?}", args.config);
        parse_properties_file(&args.config, "queue-service")?
    } else {
        warn!("Config file {:?} not found, using defaults", args.config);
        ServiceConfig::new("queue-service")
    };

    let mut config = config.apply_env_overrides()?;
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.display().to_string();
    }
    if let Some(listen) = &args.source_listen {
        config.workers.source_listen = Some(listen.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(
        capacity = config.queue.capacity,
        bootstrap = %config.kafka.bootstrap_servers,
        "Starting queue service on port {}",
        args.port
    );

    let (service, resume_signals) = QueueService::new(config, args.ephemeral)?;
    let service = Arc::new(service);

    let shutdown = ShutdownCoordinator::default();
    shutdown
        .register_component(Arc::new(RecorderShutdown::new(Arc::clone(&service.recorder))))
        .await;
    shutdown
        .register_component(Arc::new(ProducerShutdown::new(service.producer.clone())))
        .await;

    let ingress = service.ingress(resume_signals)?;
    let ingress_task = tokio::spawn(ingress.run(shutdown.subscribe()));

    if let Some(listen) = &service.config.workers.source_listen {
        let listener = TcpListener::bind(listen).await?;
        let server = service.work_source_server();
        let source_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener, source_shutdown).await {
                error!("Request source stopped: {}", e);
            }
        });
    }

    let app = gateway::router(AppState {
        service: Arc::clone(&service),
        metrics: service.metrics.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Queue service listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    let mut http_shutdown = shutdown.subscribe();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await?;
        Ok::<(), TicketQueueError>(())
    };

    run_with_graceful_shutdown("queue-service", server, shutdown).await?;

    match ingress_task.await {
        Ok(Err(e)) => error!("Ingress adapter failed: {}", e),
        Err(e) => error!("Ingress task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
