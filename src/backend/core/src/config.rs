//! Configuration management.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{GuardError, Result};
use crate::middleware::client_key::DEFAULT_UA_FRAGMENT_LEN;
use crate::middleware::csrf::CsrfConfig;
use crate::middleware::input_sanitizer::SanitizeConfig;
use crate::middleware::pipeline::{default_routes, RouteRule};
use crate::middleware::rate_limit::{PolicyTable, TrafficClass};
use crate::middleware::request_size::{default_payload_limits, PayloadLimit, DEFAULT_LIMIT_KEY};
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "MENU_GUARD";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration. Without a URL the distributed tier is off.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging, tracing and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Request defense pipeline
    #[serde(default)]
    pub defense: DefenseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: Option<String>,

    /// Prefix for every rate limit key in Redis
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,

    /// Delay between health checks after a failure
    #[serde(default = "default_recheck_interval", with = "humantime_serde")]
    pub recheck_interval: Duration,

    /// Upper bound on a single rate limit command
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Upper bound on the startup connection and handshake
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_redis_key_prefix(),
            recheck_interval: default_recheck_interval(),
            command_timeout: default_command_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefenseConfig {
    /// Rate limit policy per traffic class
    #[serde(default)]
    pub policies: PolicyTable,

    /// Payload limit per content type; must contain `default`
    #[serde(default = "default_payload_limits")]
    pub payload_limits: HashMap<String, PayloadLimit>,

    /// Path prefix to traffic class, first match wins
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteRule>,

    /// Paths that skip the pipeline entirely
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    #[serde(default)]
    pub csrf: CsrfConfig,

    #[serde(default)]
    pub sanitizer: SanitizeConfig,

    /// How often the local limiter evicts expired windows
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Characters of user-agent kept in a client key
    #[serde(default = "default_ua_fragment_len")]
    pub user_agent_fragment_len: usize,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            policies: PolicyTable::default(),
            payload_limits: default_payload_limits(),
            routes: default_routes(),
            exempt_paths: default_exempt_paths(),
            csrf: CsrfConfig::default(),
            sanitizer: SanitizeConfig::default(),
            sweep_interval: default_sweep_interval(),
            user_agent_fragment_len: default_ua_fragment_len(),
        }
    }
}

impl DefenseConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.payload_limits.contains_key(DEFAULT_LIMIT_KEY) {
            return Err(GuardError::configuration(
                "defense.payload_limits must contain a `default` entry",
            ));
        }

        for class in TrafficClass::ALL {
            let policy = self.policies.get(class);
            if policy.max_requests == 0 {
                return Err(GuardError::configuration(format!(
                    "defense.policies.{class}.max_requests must be greater than zero"
                )));
            }
            if policy.window.is_zero() {
                return Err(GuardError::configuration(format!(
                    "defense.policies.{class}.window must be non-zero"
                )));
            }
            if policy.key_prefix.trim().is_empty() {
                return Err(GuardError::configuration(format!(
                    "defense.policies.{class}.key_prefix must not be empty"
                )));
            }
        }

        if let Some(rule) = self.routes.iter().find(|r| !r.path_prefix.starts_with('/')) {
            return Err(GuardError::configuration(format!(
                "route prefix `{}` must start with `/`",
                rule.path_prefix
            )));
        }

        if self.sweep_interval.is_zero() {
            return Err(GuardError::configuration("defense.sweep_interval must be non-zero"));
        }

        Ok(())
    }
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_redis_key_prefix() -> String { "menu-guard:ratelimit:".to_string() }
fn default_recheck_interval() -> Duration { Duration::from_secs(5) }
fn default_command_timeout() -> Duration { Duration::from_millis(250) }
fn default_connect_timeout() -> Duration { Duration::from_secs(5) }
fn default_exempt_paths() -> Vec<String> { vec!["/health".to_string(), "/metrics".to_string()] }
fn default_sweep_interval() -> Duration { Duration::from_secs(60) }
fn default_ua_fragment_len() -> usize { DEFAULT_UA_FRAGMENT_LEN }

impl Config {
    /// Load configuration from environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.redis.command_timeout.is_zero() {
            return Err(GuardError::configuration("redis.command_timeout must be non-zero"));
        }
        self.defense.validate()
    }
}
