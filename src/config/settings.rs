//! Enhancer settings and configuration management.
//!
//! Settings come from several sources, applied in order of precedence.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::feature::{resolve_language, DEFAULT_ROUTE_DEBOUNCE, DEFAULT_ROUTE_THROTTLE};
use crate::services::{DEFAULT_DOM_WAIT_TIMEOUT, DEFAULT_STORAGE_PREFIX};

/// Prefix of the environment variables read by [`EnhancerSettings::from_env`].
pub const ENV_PREFIX: &str = "TC_ENHANCER_";

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    /// Failed to serialize TOML configuration.
    #[error("Failed to serialize TOML configuration: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    /// Failed to parse JSON configuration.
    #[error("Failed to parse JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Unsupported file format.
    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

/// Settings of one enhancer session.
///
/// # Configuration Precedence
///
/// Settings are applied in the following order (later sources override earlier):
/// 1. Default values
/// 2. Configuration file (TOML or JSON)
/// 3. Environment variables
/// 4. CLI arguments
///
/// # Example
///
/// ```rust
/// use tronclass_enhancer::config::EnhancerSettings;
///
/// let settings = EnhancerSettings::default()
///     .with_page_url("https://lms.example.edu/course/12/learning-activity")
///     .with_language("en-US");
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancerSettings {
    /// URL of the page the features run on.
    #[serde(default = "default_page_url")]
    pub page_url: String,

    /// Directory holding persisted state. In-memory storage when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,

    /// Prefix of module storage keys.
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,

    /// Quiet window that ends a burst of route changes.
    #[serde(default = "default_route_debounce_ms")]
    pub route_debounce_ms: u64,

    /// Minimum spacing of immediate route re-evaluations.
    #[serde(default = "default_route_throttle_ms")]
    pub route_throttle_ms: u64,

    /// How long features wait for page elements.
    #[serde(default = "default_dom_wait_timeout_ms")]
    pub dom_wait_timeout_ms: u64,

    /// UI language. The page language when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

// Default value functions for serde
fn default_page_url() -> String {
    "https://tronclass.com.tw/user/index".to_string()
}

fn default_storage_prefix() -> String {
    DEFAULT_STORAGE_PREFIX.to_string()
}

fn default_route_debounce_ms() -> u64 {
    DEFAULT_ROUTE_DEBOUNCE.as_millis() as u64
}

fn default_route_throttle_ms() -> u64 {
    DEFAULT_ROUTE_THROTTLE.as_millis() as u64
}

fn default_dom_wait_timeout_ms() -> u64 {
    DEFAULT_DOM_WAIT_TIMEOUT.as_millis() as u64
}

impl Default for EnhancerSettings {
    fn default() -> Self {
        Self {
            page_url: default_page_url(),
            storage_dir: None,
            storage_prefix: default_storage_prefix(),
            route_debounce_ms: default_route_debounce_ms(),
            route_throttle_ms: default_route_throttle_ms(),
            dom_wait_timeout_ms: default_dom_wait_timeout_ms(),
            language: None,
        }
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

impl EnhancerSettings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from a configuration file.
    ///
    /// Supports both TOML and JSON formats, detected by file extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        match extension_of(path).as_str() {
            "toml" => Ok(toml::from_str(&content)?),
            "json" => Ok(serde_json::from_str(&content)?),
            ext => Err(ConfigError::UnsupportedFormat(ext.to_string())),
        }
    }

    /// Saves settings to a configuration file, formatted by extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = match extension_of(path).as_str() {
            "toml" => toml::to_string_pretty(self)?,
            "json" => serde_json::to_string_pretty(self)?,
            ext => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
        };

        fs::write(path, content)?;
        Ok(())
    }

    /// Loads settings from environment variables.
    ///
    /// Variables are prefixed with `TC_ENHANCER_`, for example
    /// `TC_ENHANCER_PAGE_URL` or `TC_ENHANCER_ROUTE_DEBOUNCE_MS`.
    pub fn from_env() -> Self {
        Self::default().merge_with_env()
    }

    /// Merges current settings with environment variable overrides.
    pub fn merge_with_env(self) -> Self {
        self.merge_with_vars(|name| env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    /// Applies overrides looked up by unprefixed variable name.
    pub fn merge_with_vars<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PAGE_URL") {
            self.page_url = val;
        }

        if let Some(val) = lookup("STORAGE_DIR") {
            self.storage_dir = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("STORAGE_PREFIX") {
            self.storage_prefix = val;
        }

        if let Some(ms) = lookup("ROUTE_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.route_debounce_ms = ms;
        }

        if let Some(ms) = lookup("ROUTE_THROTTLE_MS").and_then(|v| v.parse().ok()) {
            self.route_throttle_ms = ms;
        }

        if let Some(ms) = lookup("DOM_WAIT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.dom_wait_timeout_ms = ms;
        }

        if let Some(val) = lookup("LANGUAGE") {
            self.language = Some(val);
        }

        self
    }

    /// Merges settings with CLI arguments.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tronclass_enhancer::config::{CliArgs, EnhancerSettings};
    ///
    /// let args = CliArgs {
    ///     language: Some("en-US".to_string()),
    ///     ..Default::default()
    /// };
    ///
    /// let settings = EnhancerSettings::default().merge_with_args(&args);
    /// assert_eq!(settings.language.as_deref(), Some("en-US"));
    /// ```
    pub fn merge_with_args(mut self, args: &CliArgs) -> Self {
        if let Some(ref url) = args.page_url {
            self.page_url = url.clone();
        }
        if let Some(ref dir) = args.storage_dir {
            self.storage_dir = Some(dir.clone());
        }
        if let Some(ref language) = args.language {
            self.language = Some(language.clone());
        }
        self
    }

    /// Validates all settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.page_url).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid page URL {}: {}", self.page_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "Page URL must be http or https, got {}",
                url.scheme()
            )));
        }

        if self.storage_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "Storage prefix cannot be empty".to_string(),
            ));
        }

        if self.route_debounce_ms > self.route_throttle_ms {
            return Err(ConfigError::ValidationError(format!(
                "Route debounce ({}ms) cannot exceed the throttle interval ({}ms)",
                self.route_debounce_ms, self.route_throttle_ms
            )));
        }

        if self.dom_wait_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "DOM wait timeout must be at least 1ms".to_string(),
            ));
        }

        if let Some(ref path) = self.storage_dir {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(ConfigError::ValidationError(format!(
                        "Storage directory parent does not exist: {}",
                        parent.display()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Route debounce window.
    pub fn route_debounce(&self) -> Duration {
        Duration::from_millis(self.route_debounce_ms)
    }

    /// Route throttle interval.
    pub fn route_throttle(&self) -> Duration {
        Duration::from_millis(self.route_throttle_ms)
    }

    /// DOM wait timeout.
    pub fn dom_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.dom_wait_timeout_ms)
    }

    /// Configured language mapped to a supported one.
    pub fn resolved_language(&self) -> Option<&'static str> {
        self.language.as_deref().map(resolve_language)
    }

    // Builder-style methods for convenient configuration

    /// Sets the page URL.
    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = url.into();
        self
    }

    /// Sets the storage directory.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Sets the storage key prefix.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Sets route debounce and throttle in milliseconds.
    pub fn with_route_timing(mut self, debounce_ms: u64, throttle_ms: u64) -> Self {
        self.route_debounce_ms = debounce_ms;
        self.route_throttle_ms = throttle_ms;
        self
    }

    /// Sets the DOM wait timeout in milliseconds.
    pub fn with_dom_wait_timeout(mut self, timeout_ms: u64) -> Self {
        self.dom_wait_timeout_ms = timeout_ms;
        self
    }

    /// Sets the language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Command-line overrides.
///
/// Filled from the parsed `clap` matches. All fields are optional to allow
/// partial overrides.
#[derive(Debug, Default, Clone)]
pub struct CliArgs {
    /// Page URL.
    pub page_url: Option<String>,
    /// Storage directory.
    pub storage_dir: Option<PathBuf>,
    /// Language.
    pub language: Option<String>,
    /// Configuration file path.
    pub config_file: Option<PathBuf>,
}

impl CliArgs {
    /// Creates an empty CliArgs instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the final settings by applying the full configuration chain.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tronclass_enhancer::config::CliArgs;
    ///
    /// let args = CliArgs {
    ///     config_file: Some("enhancer.toml".into()),
    ///     ..Default::default()
    /// };
    ///
    /// let settings = args.load_settings().unwrap();
    /// ```
    pub fn load_settings(&self) -> Result<EnhancerSettings, ConfigError> {
        let settings = match self.config_file {
            Some(ref config_file) => EnhancerSettings::from_file(config_file)?,
            None => EnhancerSettings::default(),
        };

        let settings = settings.merge_with_env().merge_with_args(self);
        settings.validate()?;
        Ok(settings)
    }
}
