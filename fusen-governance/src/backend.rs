use std::{collections::BTreeSet, sync::Arc};

use fusen_governance_common::{BoxFuture, Result};

use crate::model::{
    label::Argument,
    rule::{RuleRef, RuleType},
    InstanceSet, ServiceKey,
};

/// Called by the discovery backend whenever the instances of a watched
/// service may have changed. Carries no payload; the watcher refetches.
pub trait ServiceChangeListener: Send + Sync {
    fn on_change(&self, service: &ServiceKey);
}

pub trait Discovery: Send + Sync {
    fn fetch_instances(
        &self,
        service: ServiceKey,
        include_circuit_broken: bool,
    ) -> BoxFuture<Result<InstanceSet>>;

    fn register_watch(
        &self,
        service: ServiceKey,
        listener: Arc<dyn ServiceChangeListener>,
    ) -> BoxFuture<Result<()>>;

    fn unregister_watch(&self, service: ServiceKey) -> BoxFuture<Result<()>>;
}

pub trait RuleSource: Send + Sync {
    /// `None` when the service has no rule of this type.
    fn fetch_rule(
        &self,
        service: ServiceKey,
        rule_type: RuleType,
    ) -> BoxFuture<Result<Option<Arc<RuleRef>>>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRequest {
    pub service: ServiceKey,
    pub method: String,
    pub arguments: BTreeSet<Argument>,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaResponse {
    pub limited: bool,
    pub info: String,
}

pub trait QuotaService: Send + Sync {
    fn check_quota(&self, request: QuotaRequest) -> BoxFuture<Result<QuotaResponse>>;
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub service: ServiceKey,
    pub method: String,
    pub arguments: BTreeSet<Argument>,
    pub instances: InstanceSet,
}

/// Applies routing rules to a candidate list. Rule evaluation lives in the
/// backend client.
pub trait RouteService: Send + Sync {
    fn route(&self, request: RouteRequest) -> BoxFuture<Result<InstanceSet>>;
}
