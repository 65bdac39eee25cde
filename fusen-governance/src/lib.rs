pub mod backend;
pub mod circuit;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod label_cache;
pub mod model;
pub mod ratelimit;
pub mod resolver;
pub mod router;
pub mod support;
pub mod value;
pub mod watcher;

pub use client::{GovernanceClient, GovernanceClientBuilder, GovernanceClients};
pub use config::GovernanceConfig;
pub use context::CallContext;
pub use fusen_governance_common;
pub use fusen_governance_common::{BoxError, BoxFuture, GovernanceError, Result};
pub use value::{Record, Value};
