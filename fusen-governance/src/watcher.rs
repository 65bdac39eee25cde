use std::{
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use fusen_governance_common::{GovernanceError, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{Discovery, ServiceChangeListener},
    dispatcher::{Lane, Task, WatchDispatcher},
    model::{InstanceSet, ServiceKey},
};

/// Receives the full instance list of a service on every change.
pub trait InstanceListener: Send + Sync {
    fn on_instances(&self, service: &ServiceKey, instances: InstanceSet);
}

impl<F> InstanceListener for F
where
    F: Fn(&ServiceKey, InstanceSet) + Send + Sync,
{
    fn on_instances(&self, service: &ServiceKey, instances: InstanceSet) {
        self(service, instances)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delay before retrying a failed watch registration: `initial`, doubled per
/// attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

struct Subscription {
    service: ServiceKey,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn InstanceListener>)>>,
    instances: RwLock<Option<InstanceSet>>,
    registered: AtomicBool,
    fetch_pending: AtomicBool,
}

impl Subscription {
    fn new(service: ServiceKey) -> Self {
        Self {
            service,
            listeners: RwLock::new(vec![]),
            instances: RwLock::new(None),
            registered: AtomicBool::new(false),
            fetch_pending: AtomicBool::new(false),
        }
    }

    fn add_listener(&self, id: ListenerId, listener: Arc<dyn InstanceListener>) {
        self.listeners.write().push((id, listener));
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let len = listeners.len();
        listeners.retain(|(e, _)| *e != id);
        listeners.len() != len
    }

    fn is_idle(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Option<InstanceSet> {
        self.instances.read().clone()
    }
}

struct Inner {
    discovery: Arc<dyn Discovery>,
    dispatcher: Arc<WatchDispatcher>,
    subscriptions: DashMap<ServiceKey, Arc<Subscription>>,
    include_circuit_broken: bool,
    retry: RetryPolicy,
}

/// Handed to the discovery backend; turns change notifications into fetches.
struct WatchListener {
    inner: Weak<Inner>,
}

impl ServiceChangeListener for WatchListener {
    fn on_change(&self, service: &ServiceKey) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(subscription) = inner.subscription(service) else {
            debug!("change of unsubscribed service {} ignored", service);
            return;
        };
        inner.schedule_fetch(subscription);
    }
}

impl Inner {
    fn subscription(&self, service: &ServiceKey) -> Option<Arc<Subscription>> {
        self.subscriptions.get(service).map(|e| e.value().clone())
    }

    fn is_current(&self, subscription: &Arc<Subscription>) -> bool {
        self.subscriptions
            .get(&subscription.service)
            .is_some_and(|e| Arc::ptr_eq(e.value(), subscription))
    }

    fn schedule_fetch(self: &Arc<Self>, subscription: Arc<Subscription>) {
        // 已经有一个未执行的 fetch，它会拉到最新的全量
        if subscription.fetch_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.clone();
        let task_subscription = subscription.clone();
        let submitted = self.dispatcher.submit(
            Lane::Fetch,
            Box::pin(async move { inner.fetch(task_subscription).await }),
        );
        if !submitted {
            subscription.fetch_pending.store(false, Ordering::Release);
        }
    }

    async fn fetch(self: Arc<Self>, subscription: Arc<Subscription>) {
        subscription.fetch_pending.store(false, Ordering::Release);
        if !self.is_current(&subscription) {
            return;
        }
        let service = subscription.service.clone();
        match self
            .discovery
            .fetch_instances(service.clone(), self.include_circuit_broken)
            .await
        {
            Ok(instances) => self.publish(&subscription, instances),
            Err(error) => warn!("fetch instances of {} fail: {}", service, error),
        }
    }

    fn publish(&self, subscription: &Arc<Subscription>, instances: InstanceSet) {
        if !self.is_current(subscription) {
            debug!("drop instances of unsubscribed {}", subscription.service);
            return;
        }
        debug!(
            "publish {} instances of {}",
            instances.len(),
            subscription.service
        );
        *subscription.instances.write() = Some(instances.clone());
        let listeners: Vec<Arc<dyn InstanceListener>> = subscription
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_instances(&subscription.service, instances.clone());
        }
    }

    fn watch_task(self: &Arc<Self>, subscription: Arc<Subscription>, attempt: u32) -> Task {
        let inner = self.clone();
        Box::pin(async move { inner.watch(subscription, attempt).await })
    }

    async fn watch(self: Arc<Self>, subscription: Arc<Subscription>, attempt: u32) {
        if !self.is_current(&subscription) {
            return;
        }
        let service = subscription.service.clone();
        let listener: Arc<dyn ServiceChangeListener> = Arc::new(WatchListener {
            inner: Arc::downgrade(&self),
        });
        match self.discovery.register_watch(service.clone(), listener).await {
            Ok(()) => {
                subscription.registered.store(true, Ordering::Release);
                if !self.is_current(&subscription) {
                    if subscription.registered.swap(false, Ordering::AcqRel) {
                        self.unregister(service).await;
                    }
                    return;
                }
                info!("watch service {} registered", service);
                // 注册前的变更没有通知，补一次拉取
                self.schedule_fetch(subscription);
            }
            Err(error) => {
                let delay = self.retry.delay(attempt);
                warn!(
                    "watch service {} fail: {}, retry {} in {:?}",
                    service,
                    error,
                    attempt + 1,
                    delay
                );
                let task = self.watch_task(subscription, attempt + 1);
                self.dispatcher
                    .submit_delayed(Lane::Registration, delay, task);
            }
        }
    }

    async fn unregister(&self, service: ServiceKey) {
        match self.discovery.unregister_watch(service.clone()).await {
            Ok(()) => info!("unwatch service {}", service),
            Err(error) => warn!("unwatch service {} fail: {}", service, error),
        }
    }
}

/// Keeps one subscription per service, refreshed in the background.
///
/// The first fetch happens inline in [`subscribe`](Self::subscribe). Watch
/// registration and later fetches run on the dispatcher lanes.
#[derive(Clone)]
pub struct TopologyWatcher {
    inner: Arc<Inner>,
}

impl TopologyWatcher {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        dispatcher: Arc<WatchDispatcher>,
        include_circuit_broken: bool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                discovery,
                dispatcher,
                subscriptions: DashMap::new(),
                include_circuit_broken,
                retry,
            }),
        }
    }

    /// Adds `listener` to the subscription of `service`, creating it when it
    /// does not exist yet. A listener joining an existing subscription gets
    /// the cached instances right away.
    pub async fn subscribe(
        &self,
        service: ServiceKey,
        listener: Arc<dyn InstanceListener>,
    ) -> Result<ListenerId> {
        if self.inner.dispatcher.is_shutdown() {
            return Err(GovernanceError::Shutdown);
        }
        let id = ListenerId::new();
        let (subscription, created) = match self.inner.subscriptions.entry(service.clone()) {
            Entry::Occupied(entry) => {
                entry.get().add_listener(id, listener.clone());
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                let subscription = Arc::new(Subscription::new(service.clone()));
                subscription.add_listener(id, listener.clone());
                entry.insert(subscription.clone());
                (subscription, true)
            }
        };
        if !created {
            if let Some(instances) = subscription.snapshot() {
                listener.on_instances(&service, instances);
            }
            return Ok(id);
        }
        info!("subscribe service {}", service);
        self.inner.clone().fetch(subscription.clone()).await;
        let task = self.inner.watch_task(subscription, 0);
        if !self.inner.dispatcher.submit(Lane::Registration, task) {
            warn!("dispatcher shut down, service {} not watched", service);
        }
        Ok(id)
    }

    /// Removes one listener. The backend watch is cancelled in the
    /// background once the last listener of a service leaves.
    pub fn unsubscribe(&self, service: &ServiceKey, id: ListenerId) -> bool {
        let Some(subscription) = self.inner.subscription(service) else {
            return false;
        };
        if !subscription.remove_listener(id) {
            return false;
        }
        let removed = self.inner.subscriptions.remove_if(service, |_, current| {
            Arc::ptr_eq(current, &subscription) && current.is_idle()
        });
        if let Some((_, subscription)) = removed {
            info!("unsubscribe service {}", service);
            if subscription.registered.swap(false, Ordering::AcqRel) {
                let inner = self.inner.clone();
                let service = service.clone();
                self.inner.dispatcher.submit(
                    Lane::Registration,
                    Box::pin(async move { inner.unregister(service).await }),
                );
            }
        }
        true
    }

    /// Queues a fetch as if the backend had reported a change.
    pub fn refresh(&self, service: &ServiceKey) -> bool {
        let Some(subscription) = self.inner.subscription(service) else {
            return false;
        };
        self.inner.schedule_fetch(subscription);
        true
    }

    /// Last published instances of `service`.
    pub fn instances(&self, service: &ServiceKey) -> Option<InstanceSet> {
        self.inner.subscription(service)?.snapshot()
    }

    pub fn is_registered(&self, service: &ServiceKey) -> bool {
        self.inner
            .subscription(service)
            .is_some_and(|e| e.registered.load(Ordering::Acquire))
    }

    pub fn services(&self) -> Vec<ServiceKey> {
        self.inner
            .subscriptions
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drops every subscription and cancels the backend watches that were
    /// registered. Fetches still queued become no-ops.
    pub async fn close(&self) {
        for service in self.services() {
            let Some((_, subscription)) = self.inner.subscriptions.remove(&service) else {
                continue;
            };
            if subscription.registered.swap(false, Ordering::AcqRel) {
                self.inner.unregister(service).await;
            }
        }
    }
}
