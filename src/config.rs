//! # Runtime Configuration
//!
//! A [`RuntimeConfig`] is read from TOML and can then be overridden from the
//! environment. Durations use human-readable strings (`"50ms"`, `"5s"`).
//!
//! ```toml
//! [scheduler]
//! fixed_step = "50ms"
//! frame_interval = "50ms"
//! max_catch_up = 5
//!
//! [coordination]
//! role = "follower"
//! name = "f1"
//! endpoint = "tcp://127.0.0.1:5555"
//! connect_timeout = "5s"
//!
//! [agent]
//! speed = 2.5
//! ```
//!
//! ## Environment Variables
//!
//! - `HANS_FIXED_STEP` - Fixed simulation step, e.g. `20ms`
//! - `HANS_FRAME_INTERVAL` - Minimum time between `update` calls
//! - `HANS_MAX_CATCH_UP` - Fixed steps allowed per pass
//! - `HANS_ROLE` - `plain`, `leader` or `follower`
//! - `HANS_FOLLOWER_NAME` - Registration name of a follower
//! - `HANS_ENDPOINT` - Rendezvous address, `tcp://host:port` or `ipc://path`

use std::path::{Path, PathBuf};
use std::time::Duration;

use hans_core::{SchedulerConfig, SchedulerConfigError, SetupArgs};
use hans_mesh::{DEFAULT_ENDPOINT, Endpoint, FollowerName, RelayPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Invalid scheduler configuration: {0}")]
    Scheduler(#[from] SchedulerConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Coordination role of this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    Leader,
    Follower { name: String },
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower { .. } => "follower",
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(100)
}

/// Leader/follower settings; absent for a plain agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(flatten)]
    pub role: Role,
    /// Rendezvous address; the well-known local endpoint when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout", with = "hans_core::duration")]
    pub connect_timeout: Duration,
    #[serde(default = "default_retry_interval", with = "hans_core::duration")]
    pub retry_interval: Duration,
    #[serde(default)]
    pub relay_policy: RelayPolicy,
}

impl CoordinationConfig {
    pub fn leader() -> Self {
        Self::with_role(Role::Leader)
    }

    pub fn follower(name: impl Into<String>) -> Self {
        Self::with_role(Role::Follower { name: name.into() })
    }

    fn with_role(role: Role) -> Self {
        Self {
            role,
            endpoint: None,
            connect_timeout: default_connect_timeout(),
            retry_interval: default_retry_interval(),
            relay_policy: RelayPolicy::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_relay_policy(mut self, policy: RelayPolicy) -> Self {
        self.relay_policy = policy;
        self
    }

    /// The parsed rendezvous address
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let raw = self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        Endpoint::parse(raw).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// The validated follower name; `None` for a leader
    pub fn follower_name(&self) -> Result<Option<FollowerName>, ConfigError> {
        match &self.role {
            Role::Leader => Ok(None),
            Role::Follower { name } => FollowerName::parse(name)
                .map(Some)
                .map_err(|e| ConfigError::ValidationError(format!("follower name '{name}': {e}"))),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        self.follower_name()?;
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "retry_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything an [`AgentRuntime`](crate::AgentRuntime) needs besides the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordination: Option<CoordinationConfig>,
    /// Keyword arguments handed to the agent's `setup`
    pub agent: SetupArgs,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_coordination(mut self, coordination: CoordinationConfig) -> Self {
        self.coordination = Some(coordination);
        self
    }

    pub fn with_agent_args(mut self, args: SetupArgs) -> Self {
        self.agent = args;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&content)
    }

    /// Apply overrides from the process environment
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply `HANS_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(step) = env_duration(&lookup, "HANS_FIXED_STEP")? {
            self.scheduler.fixed_step = step;
        }
        if let Some(interval) = env_duration(&lookup, "HANS_FRAME_INTERVAL")? {
            self.scheduler.frame_interval = interval;
        }
        if let Some(raw) = lookup("HANS_MAX_CATCH_UP") {
            self.scheduler.max_catch_up =
                raw.trim().parse().map_err(|e| ConfigError::InvalidEnvVar {
                    key: "HANS_MAX_CATCH_UP".to_string(),
                    message: format!("'{raw}' is not a step count: {e}"),
                })?;
        }

        let name = lookup("HANS_FOLLOWER_NAME");
        if let Some(role) = lookup("HANS_ROLE") {
            self.coordination = match role.trim().to_lowercase().as_str() {
                "plain" | "none" => None,
                "leader" => Some(self.retarget(Role::Leader)),
                "follower" => {
                    let name = name.clone().or_else(|| self.current_follower_name()).ok_or_else(|| {
                        ConfigError::InvalidEnvVar {
                            key: "HANS_ROLE".to_string(),
                            message: "follower role needs HANS_FOLLOWER_NAME".to_string(),
                        }
                    })?;
                    Some(self.retarget(Role::Follower { name }))
                }
                other => {
                    return Err(ConfigError::InvalidEnvVar {
                        key: "HANS_ROLE".to_string(),
                        message: format!("unknown role '{other}', expected plain, leader or follower"),
                    });
                }
            };
        }

        if let Some(name) = name {
            match self.coordination.as_mut().map(|c| &mut c.role) {
                Some(Role::Follower { name: current }) => *current = name,
                _ => {
                    return Err(ConfigError::InvalidEnvVar {
                        key: "HANS_FOLLOWER_NAME".to_string(),
                        message: "only valid for the follower role".to_string(),
                    });
                }
            }
        }

        if let Some(endpoint) = lookup("HANS_ENDPOINT") {
            let coordination = self.coordination.as_mut().ok_or_else(|| ConfigError::InvalidEnvVar {
                key: "HANS_ENDPOINT".to_string(),
                message: "a plain agent has no coordination endpoint".to_string(),
            })?;
            coordination.endpoint = Some(endpoint);
        }

        self.validate()
    }

    fn current_follower_name(&self) -> Option<String> {
        match self.coordination.as_ref().map(|c| &c.role) {
            Some(Role::Follower { name }) => Some(name.clone()),
            _ => None,
        }
    }

    /// Keep endpoint and timings when only the role changes
    fn retarget(&self, role: Role) -> CoordinationConfig {
        match &self.coordination {
            Some(existing) => CoordinationConfig {
                role,
                ..existing.clone()
            },
            None => CoordinationConfig::with_role(role),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if let Some(coordination) = &self.coordination {
            coordination.validate()?;
        }
        Ok(())
    }
}

fn env_duration<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            hans_core::duration::parse(&raw).map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("'{raw}' is not a duration: {e}"),
            })
        })
        .transpose()
}
