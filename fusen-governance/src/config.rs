use std::{collections::BTreeMap, time::Duration};

use fusen_governance_common::{
    config::get_config_by_file,
    url::{parse_url, ConfigUrl},
    GovernanceError, Result,
};
use serde::{Deserialize, Serialize};

use crate::{model::DEFAULT_NAMESPACE, watcher::RetryPolicy};

pub const CONFIG_URL_SCHEME: &str = "governance";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub address: String,
    pub namespace: String,
    pub token: Option<String>,
    pub group: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub query_parser: String,
    pub include_circuit_broken: bool,
    pub watch_retry_initial_ms: u64,
    pub watch_retry_max_ms: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            address: Default::default(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            token: None,
            group: None,
            username: None,
            password: None,
            query_parser: "object".to_owned(),
            include_circuit_broken: false,
            watch_retry_initial_ms: 100,
            watch_retry_max_ms: 5000,
        }
    }
}

impl GovernanceConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Reads a `.toml`, `.yaml` or `.yml` file.
    pub fn from_file(path: &str) -> Result<Self> {
        let config: Self = get_config_by_file(path)?;
        config.validate()
    }

    /// `governance://host:port?namespace=ns&token=t`
    pub fn from_url(url: &str) -> Result<Self> {
        let ConfigUrl {
            scheme,
            address,
            params,
        } = parse_url(url)?;
        if scheme != CONFIG_URL_SCHEME {
            return Err(GovernanceError::Config(format!(
                "unsupported scheme {:?} in {}",
                scheme, url
            )));
        }
        let mut object = serde_json::Map::new();
        object.insert("address".to_owned(), address.into());
        for (key, value) in params {
            let value = match key.as_str() {
                "include_circuit_broken" => serde_json::Value::Bool(
                    value.parse().map_err(|_| invalid(&key, &value))?,
                ),
                "watch_retry_initial_ms" | "watch_retry_max_ms" => {
                    let millis: u64 = value.parse().map_err(|_| invalid(&key, &value))?;
                    millis.into()
                }
                _ => value.into(),
            };
            object.insert(key, value);
        }
        let config: Self = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| GovernanceError::Config(e.to_string()))?;
        config.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.address.trim().is_empty() {
            return Err(GovernanceError::Config("address is empty".to_owned()));
        }
        if self.watch_retry_initial_ms == 0 || self.watch_retry_max_ms < self.watch_retry_initial_ms {
            return Err(GovernanceError::Config(format!(
                "invalid watch retry {}ms..{}ms",
                self.watch_retry_initial_ms, self.watch_retry_max_ms
            )));
        }
        Ok(self)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.watch_retry_initial_ms),
            max: Duration::from_millis(self.watch_retry_max_ms),
        }
    }

    /// Clients with equal keys share one backend connection.
    pub fn client_key(&self) -> String {
        let mut params = BTreeMap::new();
        params.insert("namespace", Some(self.namespace.as_str()));
        params.insert("token", self.token.as_deref());
        params.insert("group", self.group.as_deref());
        params.insert("username", self.username.as_deref());
        let params: Vec<String> = params
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| format!("{}={}", key, value)))
            .collect();
        format!("{}|{}", self.address, params.join("&"))
    }
}

fn invalid(key: &str, value: &str) -> GovernanceError {
    GovernanceError::Config(format!("invalid {} : {:?}", key, value))
}
