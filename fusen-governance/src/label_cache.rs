use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::model::{
    label::{Label, LabelSet},
    rule::{Rule, RuleRef, RuleType},
};

pub const LABEL_CACHE_EXPIRE: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct TimedCache<T> {
    value: T,
    created_at: Instant,
}

impl<T> TimedCache<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            created_at: Instant::now(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_after(LABEL_CACHE_EXPIRE)
    }

    fn is_expired_after(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

/// Label sets per rule revision.
///
/// Reads go straight to the map. A miss takes the lock and checks again
/// before computing, so one revision is computed once no matter how many
/// callers race on it. Expired entries are overwritten on the next access.
pub struct RuleLabelCache {
    entries: DashMap<(RuleType, String), TimedCache<LabelSet>>,
    lock: Mutex<()>,
    ttl: Duration,
    computed: AtomicU64,
}

impl Default for RuleLabelCache {
    fn default() -> Self {
        Self::with_ttl(LABEL_CACHE_EXPIRE)
    }
}

impl RuleLabelCache {
    pub(crate) fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            lock: Mutex::new(()),
            ttl,
            computed: AtomicU64::new(0),
        }
    }

    pub fn labels_for(&self, rule: &RuleRef) -> LabelSet {
        let key = (rule.rule_type(), rule.revision.clone());
        if let Some(labels) = self.lookup(&key) {
            return labels;
        }
        let _guard = self.lock.lock();
        if let Some(labels) = self.lookup(&key) {
            return labels;
        }
        let labels: LabelSet = Arc::new(build_labels(&rule.rule));
        self.computed.fetch_add(1, Ordering::Relaxed);
        debug!(
            "build labels for {:?} rule revision {}: {:?}",
            key.0, rule.revision, labels
        );
        self.entries.insert(key, TimedCache::new(labels.clone()));
        labels
    }

    /// How many times a label set was built rather than served from cache.
    pub fn computed(&self) -> u64 {
        self.computed.load(Ordering::Relaxed)
    }

    fn lookup(&self, key: &(RuleType, String)) -> Option<LabelSet> {
        let entry = self.entries.get(key)?;
        if entry.is_expired_after(self.ttl) {
            return None;
        }
        Some(entry.value.clone())
    }
}

pub fn build_labels(rule: &Rule) -> BTreeSet<Label> {
    match rule {
        Rule::Routing(routing) => routing
            .inbounds
            .iter()
            .chain(routing.outbounds.iter())
            .flat_map(|route| route.sources.iter())
            .flat_map(|source| source.metadata.keys())
            .filter_map(|key| Label::parse(key))
            .collect(),
        Rule::RateLimit(rate_limit) => rate_limit
            .rules
            .iter()
            .flat_map(|clause| clause.arguments.iter())
            .filter_map(Label::from_match_argument)
            .collect(),
    }
}
