use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::Arc,
};

pub mod label;
pub mod rule;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Metadata key carrying the encoded circuit breaker statuses of an instance.
pub const INSTANCE_KEY_CIRCUIT_BREAKER: &str = "_internal_circuit_breaker";

const SEP_CIRCUIT_BREAKER: &str = ",";
const SEP_CIRCUIT_BREAKER_VALUE: &str = ":";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
        }
    }
}

impl Display for ServiceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerStatus {
    Close,
    HalfOpen,
    Open,
    Destroy,
}

impl CircuitBreakerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerStatus::Close => "CLOSE",
            CircuitBreakerStatus::HalfOpen => "HALF_OPEN",
            CircuitBreakerStatus::Open => "OPEN",
            CircuitBreakerStatus::Destroy => "DESTROY",
        }
    }
}

impl FromStr for CircuitBreakerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLOSE" => Ok(CircuitBreakerStatus::Close),
            "HALF_OPEN" => Ok(CircuitBreakerStatus::HalfOpen),
            "OPEN" => Ok(CircuitBreakerStatus::Open),
            "DESTROY" => Ok(CircuitBreakerStatus::Destroy),
            other => Err(format!("unknown circuit breaker status {:?}", other)),
        }
    }
}

/// A service instance as handed out by the discovery backend.
///
/// `circuit_breakers` is keyed by method name; the empty key holds the
/// instance level status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub version: String,
    pub weight: u32,
    pub healthy: bool,
    pub isolated: bool,
    pub metadata: HashMap<String, String>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStatus>,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            id: Default::default(),
            host: Default::default(),
            port: 0,
            protocol: Default::default(),
            version: Default::default(),
            weight: 100,
            healthy: true,
            isolated: false,
            metadata: Default::default(),
            circuit_breakers: Default::default(),
        }
    }
}

impl Instance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_circuit_breaker(mut self, method: &str, status: CircuitBreakerStatus) -> Self {
        self.circuit_breakers.insert(method.to_owned(), status);
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn circuit_breaker_status(&self) -> Option<CircuitBreakerStatus> {
        self.circuit_breakers.get("").copied()
    }

    pub fn method_circuit_breaker_status(&self, method: &str) -> Option<CircuitBreakerStatus> {
        self.circuit_breakers.get(method).copied()
    }

    pub fn parse_circuit_breakers(value: &str) -> BTreeMap<String, CircuitBreakerStatus> {
        let mut values = BTreeMap::new();
        for token in value.split(SEP_CIRCUIT_BREAKER).filter(|e| !e.is_empty()) {
            let splits: Vec<&str> = token.split(SEP_CIRCUIT_BREAKER_VALUE).collect();
            if splits.len() != 2 {
                continue;
            }
            if let Ok(status) = splits[1].parse() {
                values.insert(splits[0].to_owned(), status);
            }
        }
        values
    }

    /// Restores circuit breaker statuses carried in metadata, if any.
    pub fn load_circuit_breakers_from_metadata(&mut self) {
        if let Some(value) = self.metadata.get(INSTANCE_KEY_CIRCUIT_BREAKER) {
            let statuses = Self::parse_circuit_breakers(value);
            self.circuit_breakers.extend(statuses);
        }
    }
}

/// Snapshot of a service's instances. Replaced wholesale, never patched.
pub type InstanceSet = Arc<Vec<Arc<Instance>>>;

pub fn instance_set(instances: Vec<Instance>) -> InstanceSet {
    Arc::new(instances.into_iter().map(Arc::new).collect())
}
