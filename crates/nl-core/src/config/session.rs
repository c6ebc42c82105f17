//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs, option_duration_secs};
use crate::error::ConfigError;
use crate::rental::PricingLimits;
use crate::types::LineSource;

/// Configuration for one orchestrated session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// What to rent
    pub rental: RentalConfig,
    /// What to run on the rented node
    pub process: ProcessConfig,
    /// Local exposure of the remote service
    pub tunnel: TunnelConfig,
    /// Market connection behaviour
    pub market: MarketConfig,
    /// Cleanup behaviour
    pub shutdown: ShutdownConfig,
}

impl SessionConfig {
    /// Check values that would make the session unrunnable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.process.command.trim().is_empty() {
            return Err(ConfigError::Invalid("process.command is empty".to_string()));
        }
        if self.process.readiness_marker.is_empty() {
            return Err(ConfigError::Invalid(
                "process.readiness_marker is empty".to_string(),
            ));
        }
        if self.process.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "process.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.tunnel.remote_port == 0 {
            return Err(ConfigError::Invalid("tunnel.remote_port is 0".to_string()));
        }
        if self.market.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "market.connect_attempts must be at least 1".to_string(),
            ));
        }
        self.market.backoff.validate()?;
        Ok(())
    }
}

/// Node constraints and negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RentalConfig {
    /// Image hash the node must run
    pub image_hash: String,

    /// Execution engine
    pub engine: String,

    /// Minimum memory in GiB
    pub min_mem_gib: f64,

    /// Lease length in hours
    pub rent_hours: u64,

    /// Private network CIDR
    pub network: Option<String>,

    /// How long to wait for an acceptable offer
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,

    /// Provider names to accept; empty accepts every provider
    pub preferred_providers: Vec<String>,

    /// Price limits
    pub pricing: PricingLimits,
}

impl Default for RentalConfig {
    fn default() -> Self {
        Self {
            // ollama with llama3.1
            image_hash: "79675c7e9a967bcd3e58051b92c858c2358d39284a0accd7b6e199cf".to_string(),
            engine: "vm".to_string(),
            min_mem_gib: 16.0,
            rent_hours: 5,
            network: Some("192.168.7.0/24".to_string()),
            negotiation_timeout: Duration::from_secs(180),
            preferred_providers: Vec::new(),
            pricing: PricingLimits::default(),
        }
    }
}

/// Which output stream the readiness marker is looked for on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessSource {
    Stdout,
    Stderr,
    Any,
}

impl ReadinessSource {
    /// Whether lines from `source` should be scanned
    pub fn includes(&self, source: LineSource) -> bool {
        match self {
            ReadinessSource::Any => true,
            ReadinessSource::Stdout => source == LineSource::Stdout,
            ReadinessSource::Stderr => source == LineSource::Stderr,
        }
    }
}

/// Remote command and readiness detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Shell command started on the node
    pub command: String,

    /// Substring that marks the remote service as ready
    pub readiness_marker: String,

    /// Stream(s) scanned for the marker
    pub readiness_source: ReadinessSource,

    /// Interval between readiness / completion checks
    #[serde(rename = "poll_interval_ms", with = "duration_millis")]
    pub poll_interval: Duration,

    /// Give up waiting for readiness after this long (unbounded when absent)
    #[serde(
        default,
        with = "option_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_timeout: Option<Duration>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: "sleep 1 && /usr/bin/ollama serve".to_string(),
            readiness_marker: "Listening on [::]:11434".to_string(),
            readiness_source: ReadinessSource::Any,
            poll_interval: Duration::from_millis(3000),
            readiness_timeout: None,
        }
    }
}

/// Local listener and remote target port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Address the local listener binds to
    pub bind_address: String,

    /// Local listener port
    pub local_port: u16,

    /// Port on the remote node
    pub remote_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            local_port: 11111,
            remote_port: 11434,
        }
    }
}

impl TunnelConfig {
    /// Get the local listen address (bind_address:local_port)
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.local_port)
    }
}

/// Market connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Connection attempts before giving up
    pub connect_attempts: u32,

    /// Backoff between connection attempts
    pub backoff: BackoffConfig,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "market.backoff.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "market.backoff.jitter must be between 0 and 1, got {}",
                self.jitter
            )));
        }
        if self.initial > self.max {
            return Err(ConfigError::Invalid(
                "market.backoff.initial exceeds market.backoff.max".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Cleanup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound for each cleanup step
    #[serde(with = "duration_secs")]
    pub cleanup_step_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            cleanup_step_timeout: Duration::from_secs(30),
        }
    }
}
