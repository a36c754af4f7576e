//! Configuration module for Ripple-Research
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every section has defaults, so an absent file yields a usable configuration.
//!
//! # Example
//!
//! ```no_run
//! use ripple_research::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("research.toml")).unwrap();
//! println!("Workers: {}", config.crawler.max_concurrent_fetches);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CrawlerConfig, ExportConfig, OutputConfig, TelemetryConfig, UserAgentConfig,
    WorkflowConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
