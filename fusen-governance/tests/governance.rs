use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use fusen_governance::{
    backend::{
        Discovery, QuotaRequest, QuotaResponse, QuotaService, RuleSource, ServiceChangeListener,
    },
    fusen_governance_common::logs::init_log,
    model::{
        instance_set,
        rule::{
            ArgumentType, MatchArgument, RateLimitClause, RateLimitRule, Rule, RuleRef, RuleType,
        },
        Instance, InstanceSet, ServiceKey,
    },
    watcher::InstanceListener,
    BoxFuture, CallContext, GovernanceClient, GovernanceConfig, GovernanceError, Record, Result,
};
use futures::future::join_all;
use parking_lot::Mutex;

const SLOW: &str = "inventory";

#[derive(Default)]
struct MockBackend {
    instances: Mutex<HashMap<String, Vec<Instance>>>,
    listeners: Mutex<HashMap<ServiceKey, Arc<dyn ServiceChangeListener>>>,
    register_attempts: AtomicUsize,
}

impl MockBackend {
    fn set(&self, service: &str, ids: &[&str]) {
        let instances = ids
            .iter()
            .enumerate()
            .map(|(i, id)| Instance::new(*id, format!("10.0.0.{}", i + 1), 8080))
            .collect();
        self.instances.lock().insert(service.to_owned(), instances);
    }

    fn emit(&self, service: &ServiceKey) {
        let listener = self.listeners.lock().get(service).cloned();
        if let Some(listener) = listener {
            listener.on_change(service);
        }
    }
}

impl Discovery for MockBackend {
    fn fetch_instances(
        &self,
        service: ServiceKey,
        _include_circuit_broken: bool,
    ) -> BoxFuture<Result<InstanceSet>> {
        let instances = self
            .instances
            .lock()
            .get(&service.service)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(instance_set(instances)) })
    }

    fn register_watch(
        &self,
        service: ServiceKey,
        listener: Arc<dyn ServiceChangeListener>,
    ) -> BoxFuture<Result<()>> {
        self.register_attempts.fetch_add(1, Ordering::SeqCst);
        if service.service == SLOW {
            return Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Err(GovernanceError::Backend("watch timeout".to_owned()))
            });
        }
        self.listeners.lock().insert(service, listener);
        Box::pin(async { Ok(()) })
    }

    fn unregister_watch(&self, service: ServiceKey) -> BoxFuture<Result<()>> {
        self.listeners.lock().remove(&service);
        Box::pin(async { Ok(()) })
    }
}

impl RuleSource for MockBackend {
    fn fetch_rule(
        &self,
        _service: ServiceKey,
        rule_type: RuleType,
    ) -> BoxFuture<Result<Option<Arc<RuleRef>>>> {
        let rule = (rule_type == RuleType::RateLimiting).then(|| {
            Arc::new(RuleRef::new(
                "rate-v1",
                Rule::RateLimit(RateLimitRule {
                    rules: vec![RateLimitClause {
                        arguments: vec![MatchArgument {
                            argument_type: ArgumentType::Query,
                            key: "param.user.level".to_owned(),
                            value: Default::default(),
                        }],
                        ..Default::default()
                    }],
                }),
            ))
        });
        Box::pin(async move { Ok(rule) })
    }
}

/// Allows three calls per user level.
#[derive(Default)]
struct CountingQuota {
    used: Mutex<HashMap<String, u32>>,
}

impl QuotaService for CountingQuota {
    fn check_quota(&self, request: QuotaRequest) -> BoxFuture<Result<QuotaResponse>> {
        let key = request
            .arguments
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut used = self.used.lock();
        let count = used.entry(key).or_default();
        *count += request.count;
        let response = QuotaResponse {
            limited: *count > 3,
            info: format!("used {}", count),
        };
        Box::pin(async move { Ok(response) })
    }
}

type Received = Arc<Mutex<Vec<Vec<String>>>>;

fn recorder() -> (Received, Arc<dyn InstanceListener>) {
    let received: Received = Default::default();
    let sink = received.clone();
    let listener = move |_: &ServiceKey, instances: InstanceSet| {
        sink.lock()
            .push(instances.iter().map(|e| e.id.clone()).collect());
    };
    (received, Arc::new(listener))
}

fn client(backend: Arc<MockBackend>) -> GovernanceClient {
    let mut config = GovernanceConfig::new("127.0.0.1:8848");
    config.watch_retry_initial_ms = 5;
    config.watch_retry_max_ms = 20;
    GovernanceClient::builder()
        .config(config)
        .discovery(backend.clone())
        .rule_source(backend)
        .quota_service(Arc::new(CountingQuota::default()))
        .build()
        .unwrap()
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn service(name: &str) -> ServiceKey {
    ServiceKey::new("default", name)
}

#[tokio::test]
async fn orders_follow_backend_changes() {
    init_log();
    let backend = Arc::new(MockBackend::default());
    backend.set("orders", &["a", "b"]);
    let client = client(backend.clone());
    let orders = service("orders");
    let (received, listener) = recorder();

    client
        .watcher()
        .subscribe(orders.clone(), listener)
        .await
        .unwrap();
    assert_eq!(received.lock()[0], vec!["a", "b"]);
    wait_until(|| client.watcher().is_registered(&orders)).await;

    backend.set("orders", &["a"]);
    backend.emit(&orders);
    wait_until(|| received.lock().last().is_some_and(|e| e == &vec!["a"])).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let received = received.lock();
    let first_update = received
        .iter()
        .position(|e| e == &vec!["a"])
        .unwrap();
    assert!(received[first_update..].iter().all(|e| e == &vec!["a"]));
    assert_eq!(client.watcher().instances(&orders).unwrap().len(), 1);
    drop(received);
    client.destroy().await;
}

#[tokio::test]
async fn slow_registration_does_not_delay_fetch() {
    init_log();
    let backend = Arc::new(MockBackend::default());
    backend.set(SLOW, &["i1"]);
    backend.set("orders", &["a", "b"]);
    let client = client(backend.clone());
    let (_, slow_listener) = recorder();
    let (received, listener) = recorder();

    let subscribed = join_all(vec![
        client.watcher().subscribe(service(SLOW), slow_listener),
        client.watcher().subscribe(service("orders"), listener),
    ])
    .await;
    assert!(subscribed.iter().all(|e| e.is_ok()));

    backend.set("orders", &["c"]);
    assert!(client.watcher().refresh(&service("orders")));
    tokio::time::timeout(Duration::from_millis(150), async {
        while received.lock().last() != Some(&vec!["c".to_owned()]) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    assert!(!client.watcher().is_registered(&service(SLOW)));

    // 注册失败会一直重试
    wait_until(|| backend.register_attempts.load(Ordering::SeqCst) >= 3).await;
    assert!(!client.watcher().is_registered(&service(SLOW)));
    client.destroy().await;
}

#[tokio::test]
async fn rate_limit_by_argument() {
    init_log();
    let backend = Arc::new(MockBackend::default());
    let client = client(backend);
    let call = |level: &str| {
        CallContext::new(service("orders"), "create")
            .argument(Record::new("Order").field("user", Record::new("User").field("level", level)))
    };

    for _ in 0..3 {
        assert!(client.rate_limiter().check(&call("vip")).await.is_ok());
    }
    let error = client.rate_limiter().check(&call("vip")).await.unwrap_err();
    assert!(error.is_rate_limited());
    assert!(client.rate_limiter().check(&call("normal")).await.is_ok());
    assert_eq!(client.label_cache().computed(), 1);

    let instances = instance_set(vec![Instance::new("a", "10.0.0.1", 8080)]);
    let routed = client.router().route(&call("vip"), instances.clone()).await;
    assert!(Arc::ptr_eq(&routed, &instances));
    assert_eq!(client.router().select(&routed).unwrap().id, "a");
    client.destroy().await;
}
