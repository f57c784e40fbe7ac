use crate::{GroupKey, Result, ServiceConfig, TicketQueueError};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

fn read_properties<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let file = File::open(&path).map_err(|e| {
        TicketQueueError::InvalidArgument(format!("Failed to open config file {:?}: {}", path.as_ref(), e))
    })?;

    let reader = BufReader::new(file);
    java_properties::read(reader)
        .map_err(|e| TicketQueueError::InvalidArgument(format!("Failed to parse properties: {}", e)))
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TicketQueueError::InvalidArgument(format!("Invalid value for {}: '{}'", key, value)))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse Java properties file into ServiceConfig
pub fn parse_properties_file<P: AsRef<Path>>(path: P, application_id: &str) -> Result<ServiceConfig> {
    let properties = read_properties(path)?;
    let mut config = ServiceConfig::new(application_id);
    apply_properties(&mut config, properties)?;
    Ok(config)
}

/// Merge an extra properties file (e.g. consumer tuning) over a base config
pub fn merge_properties_file<P: AsRef<Path>>(mut config: ServiceConfig, path: P) -> Result<ServiceConfig> {
    let properties = read_properties(path)?;
    apply_properties(&mut config, properties)?;
    Ok(config)
}

fn apply_properties(config: &mut ServiceConfig, properties: HashMap<String, String>) -> Result<()> {
    for (key, value) in properties {
        match key.as_str() {
            "bootstrap.servers" => config.kafka.bootstrap_servers = value,
            "security.protocol" => config.kafka.security_protocol = Some(value),
            "sasl.mechanism" => config.kafka.sasl_mechanism = Some(value),
            "sasl.username" => config.kafka.sasl_username = Some(value),
            "sasl.password" => config.kafka.sasl_password = Some(value),
            "ssl.ca.location" => config.kafka.ssl_ca_location = Some(value),
            "group.id" => config.application_id = value,
            "state.dir" => config.state_dir = value,
            "queue.capacity" => config.queue.capacity = parse_value(&key, &value)?,
            "queue.categories" => {
                config.queue.categories = parse_list(&value).into_iter().map(|c| c.to_lowercase()).collect();
            }
            "queue.groups" => {
                config.queue.groups = parse_list(&value)
                    .iter()
                    .map(|pair| GroupKey::parse_pair(pair))
                    .collect::<Result<Vec<_>>>()?;
            }
            "queue.poll.timeout.ms" => config.queue.poll_timeout_ms = parse_value(&key, &value)?,
            "queue.refresh.interval.ms" => config.queue.refresh_interval_ms = parse_value(&key, &value)?,
            "queue.selection.timeout.ms" => {
                let timeout: u64 = parse_value(&key, &value)?;
                config.queue.selection_timeout_ms = (timeout > 0).then_some(timeout);
            }
            "queue.dedup.window" => config.queue.dedup_window = parse_value(&key, &value)?,
            "matches.api.url" => config.queue.matches_api_url = Some(value),
            "workers.count" => config.workers.count = parse_value(&key, &value)?,
            "workers.selection.timeout.ms" => config.workers.selection_timeout_ms = parse_value(&key, &value)?,
            "workers.source.address" => config.workers.source_address = value,
            "workers.source.listen" => config.workers.source_listen = Some(value),
            _ => {
                config.kafka.additional_properties.insert(key, value);
            }
        }
    }

    config.validate()
}
