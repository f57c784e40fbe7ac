use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use ticket_queue::shutdown::{run_with_graceful_shutdown, RecorderShutdown, ShutdownCoordinator};
use ticket_queue::{parse_properties_file, Result, ServiceConfig, TicketQueueError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod service;

use service::{AppState, CoordinatorService};

#[derive(Parser, Debug)]
#[command(name = "coordinator-service")]
#[command(about = "Worker pool bounding concurrent seat selections")]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8081")]
    port: u16,

    /// Config file path
    #[arg(short = 'c', long = "config", default_value = "client.dev.properties")]
    config: PathBuf,

    /// Number of workers, overrides workers.count
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Request source address, overrides workers.source.address
    #[arg(long = "source")]
    source: Option<String>,

    /// Directory for the audit log
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,

    /// Keep the audit log in memory
    #[arg(long = "ephemeral")]
    ephemeral: bool,
}

fn load_config(args: &Args) -> Result<ServiceConfig> {
    let config = if args.config.exists() {
        parse_properties_file(&args.config, "coordinator-service")?
    } else {
        warn!("Config file {:?} not found, using defaults", args.config);
        ServiceConfig::new("coordinator-service")
    };

    let mut config = config.apply_env_overrides()?;
    if let Some(workers) = args.workers {
        config.workers.count = workers;
    }
    if let Some(source) = &args.source {
        config.workers.source_address = source.clone();
    }
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.display().to_string();
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
        workers = config.workers.count,
        source = %config.workers.source_address,
        "Starting coordinator service on port {}",
        args.port
    );

    let service = Arc::new(CoordinatorService::new(config, args.ephemeral)?);

    let shutdown = ShutdownCoordinator::default();
    shutdown
        .register_component(Arc::new(RecorderShutdown::new(Arc::clone(&service.recorder))))
        .await;

    let coordinator_task = tokio::spawn(Arc::clone(&service.coordinator).run(shutdown.subscribe()));

    let app = service::router(AppState {
        service: Arc::clone(&service),
        metrics: service.metrics.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Coordinator service listening on {}", addr);
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

    run_with_graceful_shutdown("coordinator-service", server, shutdown).await?;

    if let Err(e) = coordinator_task.await {
        error!("Coordinator task panicked: {}", e);
    }
    Ok(())
}
