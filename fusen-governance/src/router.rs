use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use crate::{
    backend::{RouteRequest, RouteService, RuleSource},
    circuit::CircuitGate,
    context::CallContext,
    label_cache::RuleLabelCache,
    model::{rule::RuleType, Instance, InstanceSet},
    resolver::QueryParser,
};

/// Narrows the instance list of a call: circuit breaker first, then the
/// routing rule of the callee.
#[derive(Clone)]
pub struct GovernanceRouter {
    gate: CircuitGate,
    rules: Arc<dyn RuleSource>,
    route: Option<Arc<dyn RouteService>>,
    labels: Arc<RuleLabelCache>,
    parser: Arc<dyn QueryParser>,
}

impl GovernanceRouter {
    pub fn new(
        gate: CircuitGate,
        rules: Arc<dyn RuleSource>,
        route: Option<Arc<dyn RouteService>>,
        labels: Arc<RuleLabelCache>,
        parser: Arc<dyn QueryParser>,
    ) -> Self {
        Self {
            gate,
            rules,
            route,
            labels,
            parser,
        }
    }

    pub async fn route(&self, context: &CallContext, instances: InstanceSet) -> InstanceSet {
        if instances.is_empty() {
            return instances;
        }
        let service = &context.service;
        let all = instances.clone();
        let instances = self.gate.filter_method(service, &context.method, &instances);
        let Some(route) = &self.route else {
            return instances;
        };
        let rule = match self
            .rules
            .fetch_rule(service.clone(), RuleType::Routing)
            .await
        {
            Ok(Some(rule)) => rule,
            Ok(None) => return instances,
            Err(error) => {
                warn!("fetch routing rule of {} fail: {}", service, error);
                return instances;
            }
        };
        let labels = self.labels.labels_for(&rule);
        let arguments = context.build_arguments(&labels, self.parser.as_ref());
        let request = RouteRequest {
            service: service.clone(),
            method: context.method.clone(),
            arguments,
            instances: instances.clone(),
        };
        match route.route(request).await {
            Ok(routed) if routed.is_empty() => {
                warn!(
                    "route {} matched none of {} instances, use them all",
                    service,
                    instances.len()
                );
                all
            }
            Ok(routed) => {
                debug!(
                    "route {} to {} of {} instances",
                    service,
                    routed.len(),
                    instances.len()
                );
                routed
            }
            Err(error) => {
                warn!("route {} fail: {}", service, error);
                instances
            }
        }
    }

    /// Weighted random pick. Zero weight instances are only chosen when every
    /// weight is zero.
    pub fn select(&self, instances: &InstanceSet) -> Option<Arc<Instance>> {
        select(instances)
    }
}

pub fn select(instances: &InstanceSet) -> Option<Arc<Instance>> {
    if instances.is_empty() {
        return None;
    }
    let total: u64 = instances.iter().map(|e| e.weight as u64).sum();
    let mut rng = rand::thread_rng();
    if total == 0 {
        return instances.get(rng.gen_range(0..instances.len())).cloned();
    }
    let mut offset = rng.gen_range(0..total);
    for instance in instances.iter() {
        let weight = instance.weight as u64;
        if offset < weight {
            return Some(instance.clone());
        }
        offset -= weight;
    }
    instances.last().cloned()
}
