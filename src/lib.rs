pub mod domain;
pub mod kafka;
pub mod error;
pub mod config;
pub mod config_parser;
pub mod metrics;
pub mod retry;
pub mod shutdown;
pub mod queue;
pub mod registry;
pub mod audit;
pub mod directory;
pub mod promotion;
pub mod ingress;
pub mod coordinator;

pub use domain::*;
pub use error::*;
pub use crate::config::*;
pub use kafka::*;
pub use config_parser::{merge_properties_file, parse_properties_file};
pub use metrics::Metrics;
pub use queue::{AdmissionQueue, EnqueueOutcome, QueueFull, ResumeSignals};
pub use registry::{ConnectionRegistry, ConnectionSender, Delivery};
pub use promotion::{Promoter, Promotion};
