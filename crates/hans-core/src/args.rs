//! Agent keyword arguments forwarded verbatim to `setup`

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, AgentResult};

/// Named arguments for [`Agent::setup`](crate::Agent::setup)
///
/// Arguments come from the `[agent]` table of the runtime configuration or are
/// built in code. They are handed to every new agent instance unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetupArgs(Map<String, Value>);

impl SetupArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Typed access to a required argument
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> AgentResult<T> {
        let value = self.0.get(key).ok_or_else(|| AgentError::InvalidArgument {
            key: key.to_string(),
            reason: "missing".to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| AgentError::InvalidArgument {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Typed access with a fallback when the argument is absent
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> AgentResult<T> {
        if self.contains(key) {
            self.get(key)
        } else {
            Ok(default)
        }
    }

    /// Deserialize all arguments into one struct
    pub fn parse<T: DeserializeOwned>(&self) -> AgentResult<T> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| {
            AgentError::InvalidArgument {
                key: "*".to_string(),
                reason: e.to_string(),
            }
        })
    }
}

impl From<Map<String, Value>> for SetupArgs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
