use crate::config::types::{
    Config, CrawlerConfig, OutputConfig, TelemetryConfig, UserAgentConfig, WorkflowConfig,
};
use crate::document::ExportFormat;
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_telemetry_config(&config.telemetry)?;
    validate_workflow_config(&config.workflow)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_fetches < 1 || config.max_concurrent_fetches > 100 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_fetches must be between 1 and 100, got {}",
            config.max_concurrent_fetches
        )));
    }

    if config.fetch_timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "fetch_timeout_ms must be >= 100ms, got {}ms",
            config.fetch_timeout_ms
        )));
    }

    Ok(())
}

/// Validates circuit breaker and backoff settings
fn validate_telemetry_config(config: &TelemetryConfig) -> Result<(), ConfigError> {
    if config.circuit_breaker_threshold < 1 {
        return Err(ConfigError::Validation(
            "circuit_breaker_threshold must be >= 1".to_string(),
        ));
    }

    if config.retry_backoff_ms > config.max_retry_backoff_ms {
        return Err(ConfigError::Validation(format!(
            "retry_backoff_ms ({}) cannot exceed max_retry_backoff_ms ({})",
            config.retry_backoff_ms, config.max_retry_backoff_ms
        )));
    }

    Ok(())
}

/// Validates outline and drafting defaults
fn validate_workflow_config(config: &WorkflowConfig) -> Result<(), ConfigError> {
    if config.sections_count < 1 || config.sections_count > 50 {
        return Err(ConfigError::Validation(format!(
            "sections_count must be between 1 and 50, got {}",
            config.sections_count
        )));
    }

    if config.outline_depth < 1 || config.outline_depth > 3 {
        return Err(ConfigError::Validation(format!(
            "outline_depth must be between 1 and 3, got {}",
            config.outline_depth
        )));
    }

    if config.draft_timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "draft_timeout_ms must be >= 100ms, got {}ms",
            config.draft_timeout_ms
        )));
    }

    config
        .export_format
        .parse::<ExportFormat>()
        .map_err(|e| ConfigError::Validation(e.to_string()))?;

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    // Must contain exactly one @ with text on both sides
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
