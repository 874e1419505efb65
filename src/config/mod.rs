//! Configuration module for tronclass-enhancer.
//!
//! This module provides configuration management for an enhancer session,
//! including:
//! - Loading settings from files (TOML/JSON)
//! - Environment variable overrides
//! - CLI argument overrides
//! - Validation and defaults
//!
//! # Example
//!
//! ```rust,no_run
//! use tronclass_enhancer::config::EnhancerSettings;
//!
//! // Create with defaults
//! let settings = EnhancerSettings::default();
//!
//! // Load from a specific file
//! let settings = EnhancerSettings::from_file("enhancer.toml").unwrap();
//!
//! // Override with environment variables
//! let settings = settings.merge_with_env();
//! ```

mod settings;

pub use settings::{CliArgs, ConfigError, EnhancerSettings, ENV_PREFIX};
