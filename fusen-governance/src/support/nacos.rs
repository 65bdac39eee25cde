use std::sync::Arc;

use dashmap::DashMap;
use fusen_governance_common::{BoxFuture, GovernanceError, Result};
use nacos_sdk::api::{
    naming::{
        NamingChangeEvent, NamingEventListener, NamingService, NamingServiceBuilder,
        ServiceInstance,
    },
    props::ClientProps,
};
use tracing::{debug, error, info};

use crate::{
    backend::{Discovery, ServiceChangeListener},
    config::GovernanceConfig,
    model::{Instance, InstanceSet, ServiceKey},
};

const APP_NAME: &str = "fusen-governance";

/// [`Discovery`] over the nacos naming service. The nacos namespace is the
/// one of the client config; [`ServiceKey::service`] is the nacos service name.
#[derive(Clone)]
pub struct NacosDiscovery {
    naming_service: Arc<dyn NamingService + Sync + Send + 'static>,
    group: Option<String>,
    listeners: Arc<DashMap<ServiceKey, Arc<NacosChangeListener>>>,
}

impl NacosDiscovery {
    pub fn init(config: &GovernanceConfig) -> Result<Self> {
        let mut client_props = ClientProps::new();
        client_props = client_props
            .server_addr(config.address.clone())
            .namespace(config.namespace.clone())
            .app_name(APP_NAME.to_owned())
            .auth_username(config.username.clone().unwrap_or_default())
            .auth_password(config.password.clone().unwrap_or_default());
        let builder = NamingServiceBuilder::new(client_props);
        let builder = if config.username.is_some() {
            builder.enable_auth_plugin_http()
        } else {
            builder
        };
        let naming_service = builder
            .build()
            .map_err(|e| GovernanceError::Error(Box::new(e)))?;
        Ok(Self {
            naming_service: Arc::new(naming_service),
            group: config.group.clone(),
            listeners: Default::default(),
        })
    }
}

impl Discovery for NacosDiscovery {
    fn fetch_instances(
        &self,
        service: ServiceKey,
        include_circuit_broken: bool,
    ) -> BoxFuture<Result<InstanceSet>> {
        let nacos = self.clone();
        Box::pin(async move {
            let service_instances = nacos
                .naming_service
                .get_all_instances(service.service.clone(), nacos.group.clone(), Vec::new(), false)
                .await
                .map_err(|error| {
                    error!("nacos fetch {} occur an error: {:?}", service, error);
                    GovernanceError::Error(Box::new(error))
                })?;
            Ok(to_instances(service_instances, include_circuit_broken))
        })
    }

    fn register_watch(
        &self,
        service: ServiceKey,
        listener: Arc<dyn ServiceChangeListener>,
    ) -> BoxFuture<Result<()>> {
        let nacos = self.clone();
        Box::pin(async move {
            info!("nacos subscribe service: {} - group: {:?}", service, nacos.group);
            let event_listener = Arc::new(NacosChangeListener {
                service: service.clone(),
                listener,
            });
            nacos
                .naming_service
                .subscribe(
                    service.service.clone(),
                    nacos.group.clone(),
                    Vec::new(),
                    event_listener.clone(),
                )
                .await
                .map_err(|error| GovernanceError::Error(Box::new(error)))?;
            nacos.listeners.insert(service, event_listener);
            Ok(())
        })
    }

    fn unregister_watch(&self, service: ServiceKey) -> BoxFuture<Result<()>> {
        let nacos = self.clone();
        Box::pin(async move {
            let Some((_, event_listener)) = nacos.listeners.remove(&service) else {
                return Ok(());
            };
            info!("nacos unsubscribe service: {} - group: {:?}", service, nacos.group);
            nacos
                .naming_service
                .unsubscribe(
                    service.service.clone(),
                    nacos.group.clone(),
                    Vec::new(),
                    event_listener,
                )
                .await
                .map_err(|error| GovernanceError::Error(Box::new(error)))
        })
    }
}

struct NacosChangeListener {
    service: ServiceKey,
    listener: Arc<dyn ServiceChangeListener>,
}

impl NamingEventListener for NacosChangeListener {
    fn event(&self, event: Arc<NamingChangeEvent>) {
        debug!("nacos event: {:?}", event);
        // 只通知变更，实例列表由 fetch 重新拉取
        self.listener.on_change(&self.service);
    }
}

fn to_instances(service_instances: Vec<ServiceInstance>, include_circuit_broken: bool) -> InstanceSet {
    let instances: Vec<Arc<Instance>> = service_instances
        .into_iter()
        .filter(|e| include_circuit_broken || e.healthy)
        .map(|e| Arc::new(to_instance(e)))
        .collect();
    Arc::new(instances)
}

fn to_instance(service_instance: ServiceInstance) -> Instance {
    let port = u16::try_from(service_instance.port).unwrap_or_default();
    let id = service_instance
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("{}:{}", service_instance.ip, port));
    let mut instance = Instance::new(id, service_instance.ip, port);
    instance.weight = (service_instance.weight.max(0.0) * 100.0).round() as u32;
    instance.healthy = service_instance.healthy;
    instance.isolated = !service_instance.enabled;
    instance.protocol = service_instance
        .metadata
        .get("protocol")
        .cloned()
        .unwrap_or_default();
    instance.version = service_instance
        .metadata
        .get("version")
        .cloned()
        .unwrap_or_default();
    instance.metadata = service_instance.metadata;
    instance.load_circuit_breakers_from_metadata();
    instance
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::{CircuitBreakerStatus, INSTANCE_KEY_CIRCUIT_BREAKER};

    fn service_instance(ip: &str, healthy: bool) -> ServiceInstance {
        ServiceInstance {
            ip: ip.to_owned(),
            port: 8080,
            weight: 0.5,
            healthy,
            enabled: true,
            metadata: HashMap::from([
                ("version".to_owned(), "1.0.0".to_owned()),
                (INSTANCE_KEY_CIRCUIT_BREAKER.to_owned(), ":OPEN".to_owned()),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn convert_instance() {
        let instance = to_instance(service_instance("10.0.0.1", true));
        assert_eq!(instance.id, "10.0.0.1:8080");
        assert_eq!(instance.addr(), "10.0.0.1:8080");
        assert_eq!(instance.weight, 50);
        assert_eq!(instance.version, "1.0.0");
        assert!(!instance.isolated);
        assert_eq!(instance.circuit_breaker_status(), Some(CircuitBreakerStatus::Open));
    }

    #[test]
    fn drop_unhealthy_instances() {
        let instances = vec![
            service_instance("10.0.0.1", true),
            service_instance("10.0.0.2", false),
        ];
        assert_eq!(to_instances(instances.clone(), false).len(), 1);
        assert_eq!(to_instances(instances, true).len(), 2);
    }
}
