use super::models::Config;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("model.width must be at least 1")]
    InvalidWidth,

    #[error("model.max_depth must be at least 1")]
    InvalidMaxDepth,

    #[error("subprocess.timeout_secs must be positive")]
    InvalidTimeout,

    #[error("broker.prefetch must be positive")]
    InvalidPrefetch,

    #[error("Queue name for '{field}' is empty")]
    EmptyQueueName { field: &'static str },

    #[error("Queue '{name}' is configured more than once")]
    DuplicateQueueName { name: String },

    #[error("Invalid broker URL scheme in '{url}', expected 'amqp://' or 'amqps://'")]
    InvalidBrokerScheme { url: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_model(config)?;
    validate_subprocess(config)?;
    validate_queues(config)?;
    validate_broker(config)?;
    Ok(())
}

fn validate_model(config: &Config) -> Result<(), ValidationError> {
    if config.model.width == 0 {
        return Err(ValidationError::InvalidWidth);
    }
    if config.model.max_depth == 0 {
        return Err(ValidationError::InvalidMaxDepth);
    }
    Ok(())
}

fn validate_subprocess(config: &Config) -> Result<(), ValidationError> {
    if config.subprocess.timeout_secs == 0 {
        return Err(ValidationError::InvalidTimeout);
    }
    Ok(())
}

/// Queue names must be non-empty and pairwise distinct, otherwise stages
/// would consume their own output.
fn validate_queues(config: &Config) -> Result<(), ValidationError> {
    const FIELDS: [&str; 5] = ["scan_specs", "conversions", "matches", "problems", "handles"];

    let mut seen = HashSet::new();
    for (field, name) in FIELDS.into_iter().zip(config.queues.all()) {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyQueueName { field });
        }
        if !seen.insert(name) {
            return Err(ValidationError::DuplicateQueueName {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_broker(config: &Config) -> Result<(), ValidationError> {
    let url = &config.broker.url;
    if !(url.starts_with("amqp://") || url.starts_with("amqps://")) {
        return Err(ValidationError::InvalidBrokerScheme { url: url.clone() });
    }
    if config.broker.prefetch == 0 {
        return Err(ValidationError::InvalidPrefetch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_width_rejected() {
        let mut config = Config::default();
        config.model.width = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidWidth)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.subprocess.timeout_secs = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidTimeout)));
    }

    #[test]
    fn test_duplicate_queue_rejected() {
        let mut config = Config::default();
        config.queues.matches = config.queues.conversions.clone();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::DuplicateQueueName { .. })
        ));
    }

    #[test]
    fn test_empty_queue_rejected() {
        let mut config = Config::default();
        config.queues.handles = " ".to_string();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::EmptyQueueName { field: "handles" })
        ));
    }

    #[test]
    fn test_http_broker_rejected() {
        let mut config = Config::default();
        config.broker.url = "http://rabbit".to_string();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidBrokerScheme { .. })
        ));
    }
}
