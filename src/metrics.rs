use prometheus::{
    Counter, Histogram, HistogramOpts, IntGauge, IntGaugeVec, Opts, Registry, Encoder, TextEncoder,
    register_counter_with_registry, register_histogram_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry,
};
use std::sync::Arc;
use crate::{GroupKey, Result, TicketQueueError};

/// Metrics collector for the admission and worker-pool services
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Ingress metrics
    pub join_messages_received: Counter,
    pub malformed_messages: Counter,
    pub broker_reconnects: Counter,

    // Admission metrics
    pub admissions: Counter,
    pub rejections: Counter,
    pub duplicates: Counter,
    pub queue_depth: IntGaugeVec,
    pub paused_groups: IntGauge,

    // Selection metrics
    pub promotions: Counter,
    pub selection_timeouts: Counter,
    pub active_sessions: IntGauge,
    pub selection_duration: Histogram,

    // Connection metrics
    pub active_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let join_messages_received = register_counter_with_registry!(
            Opts::new("join_messages_received_total", "Join events read from the broker"),
            registry
        )?;

        let malformed_messages = register_counter_with_registry!(
            Opts::new("malformed_messages_total", "Join events that failed to parse"),
            registry
        )?;

        let broker_reconnects = register_counter_with_registry!(
            Opts::new("broker_reconnects_total", "Broker reconnect attempts"),
            registry
        )?;

        let admissions = register_counter_with_registry!(
            Opts::new("admissions_total", "Requests admitted into a group queue"),
            registry
        )?;

        let rejections = register_counter_with_registry!(
            Opts::new("rejections_total", "Admissions rejected because the group queue was full"),
            registry
        )?;

        let duplicates = register_counter_with_registry!(
            Opts::new("duplicate_admissions_total", "Redelivered join events for already admitted requests"),
            registry
        )?;

        let queue_depth = register_int_gauge_vec_with_registry!(
            Opts::new("queue_depth", "Pending requests per group"),
            &["group"],
            registry
        )?;

        let paused_groups = register_int_gauge_with_registry!(
            Opts::new("paused_groups", "Groups whose ingestion is paused by backpressure"),
            registry
        )?;

        let promotions = register_counter_with_registry!(
            Opts::new("promotions_total", "Requests promoted to the selecting state"),
            registry
        )?;

        let selection_timeouts = register_counter_with_registry!(
            Opts::new("selection_timeouts_total", "Selections that ran past their deadline"),
            registry
        )?;

        let active_sessions = register_int_gauge_with_registry!(
            Opts::new("active_selection_sessions", "Worker selection sessions in flight"),
            registry
        )?;

        let selection_duration = register_histogram_with_registry!(
            HistogramOpts::new("selection_duration_seconds", "Time from promotion to terminal outcome")
                .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0]),
            registry
        )?;

        let active_connections = register_int_gauge_with_registry!(
            Opts::new("active_connections", "Registered client connections"),
            registry
        )?;

        Ok(Self {
            registry,
            join_messages_received,
            malformed_messages,
            broker_reconnects,
            admissions,
            rejections,
            duplicates,
            queue_depth,
            paused_groups,
            promotions,
            selection_timeouts,
            active_sessions,
            selection_duration,
            active_connections,
        })
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TicketQueueError::InvalidArgument(e.to_string()))
    }

    pub fn set_queue_depth(&self, group: &GroupKey, depth: usize) {
        self.queue_depth
            .with_label_values(&[&group.to_string()])
            .set(depth as i64);
    }

    pub fn record_selection_finished(&self, duration: std::time::Duration, timed_out: bool) {
        self.selection_duration.observe(duration.as_secs_f64());
        if timed_out {
            self.selection_timeouts.inc();
        }
    }
}

/// Metrics endpoint for Prometheus scraping
pub async fn metrics_endpoint(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> std::result::Result<String, axum::http::StatusCode> {
    match metrics.export() {
        Ok(metrics_data) => Ok(metrics_data),
        Err(e) => {
            tracing::error!("Failed to export metrics: {}", e);
            Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Health check endpoint
pub async fn health_check() -> String {
    serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "ticket-queue"
    })
    .to_string()
}
