use std::sync::Arc;

use fusen_governance_common::{GovernanceError, Result};
use tracing::{debug, warn};

use crate::{
    backend::{QuotaRequest, QuotaService, RuleSource},
    context::CallContext,
    label_cache::RuleLabelCache,
    model::{
        label::{Argument, Label},
        rule::RuleType,
    },
    resolver::QueryParser,
};

#[derive(Clone)]
pub struct RateLimiter {
    rules: Arc<dyn RuleSource>,
    quota: Option<Arc<dyn QuotaService>>,
    labels: Arc<RuleLabelCache>,
    parser: Arc<dyn QueryParser>,
}

impl RateLimiter {
    pub fn new(
        rules: Arc<dyn RuleSource>,
        quota: Option<Arc<dyn QuotaService>>,
        labels: Arc<RuleLabelCache>,
        parser: Arc<dyn QueryParser>,
    ) -> Self {
        Self {
            rules,
            quota,
            labels,
            parser,
        }
    }

    /// `Err(GovernanceError::RateLimited)` when the quota is exhausted. Any
    /// backend failure lets the call through.
    pub async fn check(&self, context: &CallContext) -> Result<()> {
        let Some(quota) = &self.quota else {
            return Ok(());
        };
        let service = &context.service;
        let rule = match self
            .rules
            .fetch_rule(service.clone(), RuleType::RateLimiting)
            .await
        {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                debug!("no rate limit rule for {}", service);
                return Ok(());
            }
            Err(error) => {
                warn!("fetch rate limit rule of {} fail: {}", service, error);
                return Ok(());
            }
        };
        let labels = self.labels.labels_for(&rule);
        let mut arguments = context.build_arguments(&labels, self.parser.as_ref());
        if !context.method.is_empty() {
            arguments.insert(Argument::new(Label::Method, context.method.clone()));
        }
        let request = QuotaRequest {
            service: service.clone(),
            method: context.method.clone(),
            arguments,
            count: 1,
        };
        match quota.check_quota(request).await {
            Ok(response) if response.limited => {
                debug!("{}#{} limited: {}", service, context.method, response.info);
                Err(GovernanceError::RateLimited {
                    service: service.to_string(),
                    info: response.info,
                })
            }
            Ok(_) => Ok(()),
            Err(error) => {
                warn!("check quota of {} fail: {}", service, error);
                Ok(())
            }
        }
    }
}
