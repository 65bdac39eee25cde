use std::{sync::Arc, time::Duration};

use fusen_governance_common::{GovernanceError, Result};
use tracing::{debug, warn};

use crate::model::{CircuitBreakerStatus, Instance, InstanceSet, ServiceKey};

/// Unit of circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub service: ServiceKey,
    pub host: String,
    pub port: u16,
    pub method: Option<String>,
}

impl Resource {
    pub fn instance(service: &ServiceKey, instance: &Instance) -> Self {
        Self {
            service: service.clone(),
            host: instance.host.clone(),
            port: instance.port,
            method: None,
        }
    }

    /// An empty method names the instance itself.
    pub fn method(service: &ServiceKey, instance: &Instance, method: &str) -> Self {
        Self {
            method: (!method.is_empty()).then(|| method.to_owned()),
            ..Self::instance(service, instance)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub pass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetStatus {
    Success,
    Fail,
    Timeout,
    /// Rejected by rate limiting. Not counted as a failure.
    FlowControl,
}

impl RetStatus {
    pub fn of(result: std::result::Result<(), &GovernanceError>) -> Self {
        match result {
            Ok(()) => RetStatus::Success,
            Err(error) if error.is_rate_limited() => RetStatus::FlowControl,
            Err(error) if error.is_timeout() => RetStatus::Timeout,
            Err(_) => RetStatus::Fail,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            RetStatus::Success => 0,
            _ => -1,
        }
    }
}

/// Outcome of one call, fed back into the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStat {
    pub resource: Resource,
    pub code: i32,
    pub delay: Duration,
    pub status: RetStatus,
}

/// The per process circuit breaker state machine, owned by the backend client.
pub trait CircuitBreakerFlow: Send + Sync {
    fn check(&self, resource: &Resource) -> Result<CheckResult>;

    fn report(&self, stat: &ResourceStat) -> Result<()>;
}

/// Embedded status wins; otherwise the flow decides; without a flow, or when
/// the flow cannot answer, the instance stays eligible.
pub fn is_eligible(
    service: &ServiceKey,
    instance: &Instance,
    flow: Option<&dyn CircuitBreakerFlow>,
) -> bool {
    if let Some(status) = instance.circuit_breaker_status() {
        return status != CircuitBreakerStatus::Open;
    }
    check_flow(flow, &Resource::instance(service, instance))
}

/// A method broken on the instance excludes it for that method only. The
/// instance itself must be eligible as well.
pub fn is_method_eligible(
    service: &ServiceKey,
    instance: &Instance,
    method: &str,
    flow: Option<&dyn CircuitBreakerFlow>,
) -> bool {
    if method.is_empty() {
        return is_eligible(service, instance, flow);
    }
    match instance.method_circuit_breaker_status(method) {
        Some(CircuitBreakerStatus::Open) => {
            debug!(
                "method {} of {} {} is {}",
                method,
                service,
                instance.addr(),
                CircuitBreakerStatus::Open.as_str()
            );
            false
        }
        Some(_) => is_eligible(service, instance, flow),
        None => {
            is_eligible(service, instance, flow)
                && check_flow(flow, &Resource::method(service, instance, method))
        }
    }
}

fn check_flow(flow: Option<&dyn CircuitBreakerFlow>, resource: &Resource) -> bool {
    let Some(flow) = flow else {
        return true;
    };
    match flow.check(resource) {
        Ok(result) => result.pass,
        Err(error) => {
            warn!(
                "circuit breaker check fail for {} {}:{}: {}",
                resource.service, resource.host, resource.port, error
            );
            true
        }
    }
}

#[derive(Clone, Default)]
pub struct CircuitGate {
    flow: Option<Arc<dyn CircuitBreakerFlow>>,
}

impl CircuitGate {
    pub fn new(flow: Option<Arc<dyn CircuitBreakerFlow>>) -> Self {
        Self { flow }
    }

    pub fn is_eligible(&self, service: &ServiceKey, instance: &Instance) -> bool {
        is_eligible(service, instance, self.flow.as_deref())
    }

    pub fn is_method_eligible(&self, service: &ServiceKey, instance: &Instance, method: &str) -> bool {
        is_method_eligible(service, instance, method, self.flow.as_deref())
    }

    /// Drops circuit broken instances. When that would leave nothing, the
    /// full list is returned instead.
    pub fn filter(&self, service: &ServiceKey, instances: &InstanceSet) -> InstanceSet {
        self.retain(service, instances, |instance| self.is_eligible(service, instance))
    }

    /// Like [`CircuitGate::filter`], also dropping instances whose `method` is broken.
    pub fn filter_method(&self, service: &ServiceKey, method: &str, instances: &InstanceSet) -> InstanceSet {
        self.retain(service, instances, |instance| {
            self.is_method_eligible(service, instance, method)
        })
    }

    /// Hands one call outcome to the flow. Reporting never fails the call.
    pub fn report(&self, stat: ResourceStat) {
        let Some(flow) = &self.flow else {
            return;
        };
        if let Err(error) = flow.report(&stat) {
            warn!(
                "report {:?} of {} {}:{} fail: {}",
                stat.status, stat.resource.service, stat.resource.host, stat.resource.port, error
            );
        }
    }

    fn retain(
        &self,
        service: &ServiceKey,
        instances: &InstanceSet,
        eligible: impl Fn(&Instance) -> bool,
    ) -> InstanceSet {
        let eligible: Vec<Arc<Instance>> = instances
            .iter()
            .filter(|instance| eligible(instance))
            .cloned()
            .collect();
        if eligible.len() == instances.len() {
            return instances.clone();
        }
        if eligible.is_empty() {
            warn!(
                "all {} instances of {} are circuit broken, use them all",
                instances.len(),
                service
            );
            return instances.clone();
        }
        debug!(
            "{} of {} instances of {} pass circuit breaker",
            eligible.len(),
            instances.len(),
            service
        );
        Arc::new(eligible)
    }
}
