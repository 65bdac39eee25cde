use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use fusen_governance_common::{GovernanceError, Result};
use tracing::{debug, info};

use crate::{
    backend::{Discovery, QuotaService, RouteService, RuleSource},
    circuit::{CircuitBreakerFlow, CircuitGate, Resource, ResourceStat, RetStatus},
    config::GovernanceConfig,
    context::CallContext,
    dispatcher::WatchDispatcher,
    label_cache::RuleLabelCache,
    model::Instance,
    ratelimit::RateLimiter,
    resolver,
    router::GovernanceRouter,
    watcher::TopologyWatcher,
};

#[derive(Default)]
pub struct GovernanceClientBuilder {
    config: GovernanceConfig,
    discovery: Option<Arc<dyn Discovery>>,
    rule_source: Option<Arc<dyn RuleSource>>,
    quota_service: Option<Arc<dyn QuotaService>>,
    circuit_breaker_flow: Option<Arc<dyn CircuitBreakerFlow>>,
    route_service: Option<Arc<dyn RouteService>>,
}

impl GovernanceClientBuilder {
    pub fn config(mut self, config: GovernanceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn rule_source(mut self, rule_source: Arc<dyn RuleSource>) -> Self {
        self.rule_source = Some(rule_source);
        self
    }

    pub fn quota_service(mut self, quota_service: Arc<dyn QuotaService>) -> Self {
        self.quota_service = Some(quota_service);
        self
    }

    pub fn circuit_breaker_flow(mut self, flow: Arc<dyn CircuitBreakerFlow>) -> Self {
        self.circuit_breaker_flow = Some(flow);
        self
    }

    pub fn route_service(mut self, route_service: Arc<dyn RouteService>) -> Self {
        self.route_service = Some(route_service);
        self
    }

    /// Starts the dispatcher lanes, so it must run inside a tokio runtime.
    pub fn build(self) -> Result<GovernanceClient> {
        let discovery = self
            .discovery
            .ok_or_else(|| GovernanceError::Config("discovery is required".to_owned()))?;
        let rule_source = self
            .rule_source
            .ok_or_else(|| GovernanceError::Config("rule source is required".to_owned()))?;
        let config = self.config;
        let parser = resolver::load(&config.query_parser);
        let labels = Arc::new(RuleLabelCache::default());
        let gate = CircuitGate::new(self.circuit_breaker_flow);
        let dispatcher = Arc::new(WatchDispatcher::new());
        let watcher = TopologyWatcher::new(
            discovery,
            dispatcher.clone(),
            config.include_circuit_broken,
            config.retry_policy(),
        );
        let rate_limiter = RateLimiter::new(
            rule_source.clone(),
            self.quota_service,
            labels.clone(),
            parser.clone(),
        );
        let router = GovernanceRouter::new(
            gate.clone(),
            rule_source,
            self.route_service,
            labels.clone(),
            parser,
        );
        info!(
            "governance client {} namespace {} started",
            config.address, config.namespace
        );
        Ok(GovernanceClient {
            config,
            dispatcher,
            watcher,
            labels,
            gate,
            rate_limiter,
            router,
        })
    }
}

/// Everything one governance backend connection needs, created once and
/// handed to the registry, router and rate limit integrations.
pub struct GovernanceClient {
    config: GovernanceConfig,
    dispatcher: Arc<WatchDispatcher>,
    watcher: TopologyWatcher,
    labels: Arc<RuleLabelCache>,
    gate: CircuitGate,
    rate_limiter: RateLimiter,
    router: GovernanceRouter,
}

impl GovernanceClient {
    pub fn builder() -> GovernanceClientBuilder {
        GovernanceClientBuilder::default()
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn watcher(&self) -> &TopologyWatcher {
        &self.watcher
    }

    pub fn label_cache(&self) -> &Arc<RuleLabelCache> {
        &self.labels
    }

    pub fn circuit_gate(&self) -> &CircuitGate {
        &self.gate
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn router(&self) -> &GovernanceRouter {
        &self.router
    }

    pub fn is_destroyed(&self) -> bool {
        self.dispatcher.is_shutdown()
    }

    /// Feeds the outcome of a call made to `instance` back into the circuit
    /// breaker. Rate limit rejections count as flow control.
    pub fn report_call(
        &self,
        context: &CallContext,
        instance: &Instance,
        delay: Duration,
        result: std::result::Result<(), &GovernanceError>,
    ) {
        let status = RetStatus::of(result);
        self.gate.report(ResourceStat {
            resource: Resource::method(&context.service, instance, &context.method),
            code: status.code(),
            delay,
            status,
        });
    }

    /// Drains the dispatcher, then drops every subscription and cancels its
    /// backend watch. Safe to call more than once.
    pub async fn destroy(&self) {
        if self.dispatcher.is_shutdown() {
            return;
        }
        self.dispatcher.shutdown().await;
        self.watcher.close().await;
        info!("governance client {} destroyed", self.config.address);
    }
}

/// Clients shared by config, one per backend address and parameters.
#[derive(Default)]
pub struct GovernanceClients {
    clients: DashMap<String, Arc<GovernanceClient>>,
}

impl GovernanceClients {
    /// Returns the client for `config`, building it with `factory` the first
    /// time. A failed build stores nothing. `factory` runs outside the map
    /// lock; when two builds race, the first one stored wins.
    pub fn load_or_store<F>(&self, config: &GovernanceConfig, factory: F) -> Result<Arc<GovernanceClient>>
    where
        F: FnOnce(&GovernanceConfig) -> Result<GovernanceClient>,
    {
        if let Some(client) = self.get(config) {
            return Ok(client);
        }
        let client = Arc::new(factory(config)?);
        match self.clients.entry(config.client_key()) {
            Entry::Occupied(entry) => {
                debug!("governance client {} already stored, drop the new one", config.address);
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                entry.insert(client.clone());
                Ok(client)
            }
        }
    }

    pub fn get(&self, config: &GovernanceConfig) -> Option<Arc<GovernanceClient>> {
        self.clients
            .get(&config.client_key())
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub async fn remove(&self, config: &GovernanceConfig) -> bool {
        let Some((_, client)) = self.clients.remove(&config.client_key()) else {
            return false;
        };
        client.destroy().await;
        true
    }

    pub async fn destroy_all(&self) {
        let keys: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, client)) = self.clients.remove(&key) {
                client.destroy().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fusen_governance_common::BoxFuture;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        backend::ServiceChangeListener,
        circuit::{CheckResult, Resource},
        model::{
            instance_set,
            rule::{RuleRef, RuleType},
            InstanceSet, ServiceKey,
        },
    };

    #[derive(Default)]
    struct OneInstance {
        unregisters: AtomicUsize,
    }

    impl Discovery for OneInstance {
        fn fetch_instances(
            &self,
            _service: ServiceKey,
            _include_circuit_broken: bool,
        ) -> BoxFuture<Result<InstanceSet>> {
            Box::pin(async { Ok(instance_set(vec![Instance::new("1", "10.0.0.1", 80)])) })
        }

        fn register_watch(
            &self,
            _service: ServiceKey,
            _listener: Arc<dyn ServiceChangeListener>,
        ) -> BoxFuture<Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn unregister_watch(&self, _service: ServiceKey) -> BoxFuture<Result<()>> {
            self.unregisters.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    struct Stats(Mutex<Vec<ResourceStat>>);

    impl CircuitBreakerFlow for Stats {
        fn check(&self, _resource: &Resource) -> Result<CheckResult> {
            Ok(CheckResult { pass: true })
        }

        fn report(&self, stat: &ResourceStat) -> Result<()> {
            self.0.lock().push(stat.clone());
            Ok(())
        }
    }

    struct NoRules;

    impl RuleSource for NoRules {
        fn fetch_rule(
            &self,
            _service: ServiceKey,
            _rule_type: RuleType,
        ) -> BoxFuture<Result<Option<Arc<RuleRef>>>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn build(config: &GovernanceConfig) -> Result<GovernanceClient> {
        GovernanceClient::builder()
            .config(config.clone())
            .discovery(Arc::new(OneInstance::default()))
            .rule_source(Arc::new(NoRules))
            .build()
    }

    #[tokio::test]
    async fn build_requires_backends() {
        let missing_rules = GovernanceClient::builder()
            .discovery(Arc::new(OneInstance::default()))
            .build();
        assert!(matches!(missing_rules, Err(GovernanceError::Config(_))));
        let missing_discovery = GovernanceClient::builder()
            .rule_source(Arc::new(NoRules))
            .build();
        assert!(missing_discovery.is_err());
    }

    #[tokio::test]
    async fn destroy_cancels_watches() {
        let discovery = Arc::new(OneInstance::default());
        let client = GovernanceClient::builder()
            .discovery(discovery.clone())
            .rule_source(Arc::new(NoRules))
            .build()
            .unwrap();
        let orders = ServiceKey::new("default", "orders");
        let listener = |_: &ServiceKey, _: InstanceSet| {};
        client
            .watcher()
            .subscribe(orders.clone(), Arc::new(listener))
            .await
            .unwrap();
        for _ in 0..200 {
            if client.watcher().is_registered(&orders) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.watcher().is_registered(&orders));

        client.destroy().await;
        assert_eq!(discovery.unregisters.load(Ordering::SeqCst), 1);
        client.destroy().await;
        assert_eq!(discovery.unregisters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn report_call_outcomes() {
        let stats = Arc::new(Stats::default());
        let client = GovernanceClient::builder()
            .discovery(Arc::new(OneInstance::default()))
            .rule_source(Arc::new(NoRules))
            .circuit_breaker_flow(stats.clone())
            .build()
            .unwrap();
        let call = CallContext::new(ServiceKey::new("default", "orders"), "create");
        let instance = Instance::new("1", "10.0.0.1", 80);
        let limited = GovernanceError::RateLimited {
            service: "default/orders".to_owned(),
            info: "quota exhausted".to_owned(),
        };
        client.report_call(&call, &instance, Duration::from_millis(8), Ok(()));
        client.report_call(&call, &instance, Duration::ZERO, Err(&limited));
        client.report_call(
            &call,
            &instance,
            Duration::from_millis(30),
            Err(&GovernanceError::Backend("reset".to_owned())),
        );

        let stats = stats.0.lock();
        let statuses: Vec<RetStatus> = stats.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![RetStatus::Success, RetStatus::FlowControl, RetStatus::Fail]
        );
        assert_eq!(stats[0].code, 0);
        assert_eq!(stats[1].code, -1);
        assert_eq!(stats[2].delay, Duration::from_millis(30));
        assert_eq!(stats[0].resource.method.as_deref(), Some("create"));
        assert_eq!(stats[0].resource.port, 80);
        client.destroy().await;
    }

    #[tokio::test]
    async fn destroy_twice() {
        let client = build(&GovernanceConfig::new("127.0.0.1:8848")).unwrap();
        let orders = ServiceKey::new("default", "orders");
        let listener = |_: &ServiceKey, _: InstanceSet| {};
        client
            .watcher()
            .subscribe(orders.clone(), Arc::new(listener))
            .await
            .unwrap();
        assert_eq!(client.watcher().instances(&orders).unwrap().len(), 1);
        client.destroy().await;
        client.destroy().await;
        assert!(client.is_destroyed());
        assert!(client.watcher().instances(&orders).is_none());
    }

    #[tokio::test]
    async fn shared_by_config() {
        let clients = GovernanceClients::default();
        let config = GovernanceConfig::new("127.0.0.1:8848");
        let first = clients.load_or_store(&config, build).unwrap();
        let second = clients
            .load_or_store(&config, |_| Err(GovernanceError::Config("unused".to_owned())))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut other = config.clone();
        other.namespace = "prod".to_owned();
        assert!(clients
            .load_or_store(&other, |_| Err(GovernanceError::Config("down".to_owned())))
            .is_err());
        assert_eq!(clients.len(), 1);

        assert!(clients.remove(&config).await);
        assert!(first.is_destroyed());
        assert!(clients.is_empty());
        assert!(!clients.remove(&config).await);
    }

    #[tokio::test]
    async fn factory_reads_registry() {
        let clients = GovernanceClients::default();
        let config = GovernanceConfig::new("127.0.0.1:8848");
        let client = clients
            .load_or_store(&config, |config| {
                assert!(clients.get(config).is_none());
                assert!(clients.is_empty());
                build(config)
            })
            .unwrap();
        let again = clients
            .load_or_store(&config, |config| {
                assert_eq!(clients.len(), 1);
                build(config)
            })
            .unwrap();
        assert!(Arc::ptr_eq(&client, &again));
        clients.destroy_all().await;
    }
}
