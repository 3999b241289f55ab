use thiserror::Error;

use crate::config::Settings;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(settings: &Settings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if settings.server.host.is_empty() {
            errors.push(ValidationError::MissingField("server.host".to_string()));
        }
        if settings.server.port == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "server.port".to_string(),
                reason: "port must be greater than 0".to_string(),
            });
        }

        if settings.counter_store.url.is_empty() {
            errors.push(ValidationError::MissingField(
                "counter_store.url".to_string(),
            ));
        }
        if settings.database.url.is_empty() {
            errors.push(ValidationError::MissingField("database.url".to_string()));
        }

        if settings.tracker.timezone().is_err() {
            errors.push(ValidationError::InvalidValue {
                field: "tracker.timezone".to_string(),
                reason: format!("'{}' is not a known IANA zone", settings.tracker.timezone),
            });
        }
        if settings.tracker.spend_workers == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "tracker.spend_workers".to_string(),
                reason: "at least one spend worker is required".to_string(),
            });
        }
        if settings.tracker.spend_queue_capacity == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "tracker.spend_queue_capacity".to_string(),
                reason: "queue capacity must be greater than 0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&settings.breaker.budget_threshold)
            || settings.breaker.budget_threshold == 0.0
        {
            errors.push(ValidationError::InvalidValue {
                field: "breaker.budget_threshold".to_string(),
                reason: "threshold must be in (0, 1]".to_string(),
            });
        }
        if settings.breaker.max_failures == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "breaker.max_failures".to_string(),
                reason: "must tolerate at least one failure".to_string(),
            });
        }
        if settings.breaker.success_threshold == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "breaker.success_threshold".to_string(),
                reason: "at least one probe success is required to close".to_string(),
            });
        }

        if let Some(rate_limit) = &settings.rate_limit {
            if rate_limit.enabled && rate_limit.requests_per_second == 0 {
                errors.push(ValidationError::InvalidValue {
                    field: "rate_limit.requests_per_second".to_string(),
                    reason: "must be greater than 0 when enabled".to_string(),
                });
            }
            if rate_limit.enabled && rate_limit.burst_size == 0 {
                errors.push(ValidationError::InvalidValue {
                    field: "rate_limit.burst_size".to_string(),
                    reason: "must be greater than 0 when enabled".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
