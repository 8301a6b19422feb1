//! Coordination endpoint owned by a runtime

use std::sync::Arc;

use hans_mesh::{FollowerConfig, FollowerEndpoint, LeaderConfig, LeaderEndpoint};

use crate::config::{ConfigError, CoordinationConfig, Role, RuntimeConfig};
use crate::error::{RuntimeError, RuntimeResult};

/// Which side of the coordination bus this process is on
///
/// Endpoints outlive rounds: a follower stays registered and a leader keeps
/// its followers between rounds.
#[derive(Debug)]
pub enum Coordination {
    Plain,
    Leader(Arc<LeaderEndpoint>),
    Follower(Arc<FollowerEndpoint>),
}

impl Coordination {
    pub fn name(&self) -> &'static str {
        match self {
            Coordination::Plain => "plain",
            Coordination::Leader(_) => "leader",
            Coordination::Follower(_) => "follower",
        }
    }

    pub(crate) fn bind_leader(config: &RuntimeConfig) -> RuntimeResult<Arc<LeaderEndpoint>> {
        let coordination = expect_role(config, "leader")?;
        let leader = LeaderEndpoint::bind(leader_config(coordination)?)?;
        Ok(Arc::new(leader))
    }

    pub(crate) fn connect_follower(config: &RuntimeConfig) -> RuntimeResult<Arc<FollowerEndpoint>> {
        let coordination = expect_role(config, "follower")?;
        let follower = FollowerEndpoint::connect(follower_config(coordination)?)?;
        Ok(Arc::new(follower))
    }
}

pub(crate) fn expect_plain(config: &RuntimeConfig) -> RuntimeResult<()> {
    match &config.coordination {
        None => Ok(()),
        Some(coordination) => Err(RuntimeError::RoleMismatch(format!(
            "a plain agent cannot run as {}",
            coordination.role.as_str()
        ))),
    }
}

fn expect_role<'a>(config: &'a RuntimeConfig, wanted: &str) -> RuntimeResult<&'a CoordinationConfig> {
    match &config.coordination {
        Some(coordination) if coordination.role.as_str() == wanted => Ok(coordination),
        Some(coordination) => Err(RuntimeError::RoleMismatch(format!(
            "a {wanted} agent cannot run as {}",
            coordination.role.as_str()
        ))),
        None => Err(RuntimeError::RoleMismatch(format!(
            "a {wanted} agent needs a [coordination] section"
        ))),
    }
}

pub fn leader_config(coordination: &CoordinationConfig) -> Result<LeaderConfig, ConfigError> {
    Ok(LeaderConfig::new(coordination.endpoint()?).with_relay_policy(coordination.relay_policy))
}

pub fn follower_config(coordination: &CoordinationConfig) -> Result<FollowerConfig, ConfigError> {
    let name = match &coordination.role {
        Role::Follower { .. } => coordination.follower_name()?,
        Role::Leader => None,
    }
    .ok_or_else(|| ConfigError::ValidationError("a follower needs a name".to_string()))?;

    Ok(FollowerConfig::new(name)
        .with_endpoint(coordination.endpoint()?)
        .with_connect_timeout(coordination.connect_timeout)
        .with_retry_interval(coordination.retry_interval))
}
