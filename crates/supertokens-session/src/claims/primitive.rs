use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ClaimCore, ClaimValidationResult, SessionClaim, SessionClaimValidator};
use crate::error::Result;

/// A claim holding a single JSON value
#[derive(Clone)]
pub struct PrimitiveClaim {
    inner: Arc<ClaimCore>,
}

impl fmt::Debug for PrimitiveClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrimitiveClaim").field(&self.inner).finish()
    }
}

impl PrimitiveClaim {
    /// Create a claim stored under `key` whose value comes from `fetch(user_id, tenant_id)`
    pub fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self {
            inner: Arc::new(ClaimCore::new(key, fetch)),
        }
    }

    /// Freshness window applied by validators that do not name their own
    #[must_use]
    pub fn with_default_max_age(mut self, max_age_secs: u64) -> Self {
        Arc::make_mut(&mut self.inner).default_max_age_secs = Some(max_age_secs);
        self
    }

    pub(super) fn core(&self) -> Arc<ClaimCore> {
        Arc::clone(&self.inner)
    }

    /// Validator: the claim equals `expected`, and is no older than `max_age_secs` when given
    pub fn has_value(&self, expected: Value, max_age_secs: Option<u64>) -> SessionClaimValidator {
        let max_age = max_age_secs.or(self.inner.default_max_age_secs);
        has_value_validator(
            Arc::clone(&self.inner),
            Arc::new(self.clone()),
            self.inner.key.clone(),
            expected,
            max_age,
        )
    }

    /// Validator: like [`has_value`](Self::has_value) with a mandatory freshness window
    pub fn has_fresh_value(&self, expected: Value, max_age_secs: u64) -> SessionClaimValidator {
        has_value_validator(
            Arc::clone(&self.inner),
            Arc::new(self.clone()),
            format!("{}-fresh-{max_age_secs}", self.inner.key),
            expected,
            Some(max_age_secs),
        )
    }
}

pub(super) fn has_value_validator(
    core: Arc<ClaimCore>,
    claim: Arc<dyn SessionClaim>,
    id: String,
    expected: Value,
    max_age_secs: Option<u64>,
) -> SessionClaimValidator {
    let refetch_core = Arc::clone(&core);
    SessionClaimValidator::new(
        id,
        claim,
        move |payload| refetch_core.needs_refetch(payload, max_age_secs),
        move |payload| {
            let Some(actual) = core.value(payload) else {
                return ClaimValidationResult::invalid(json!({
                    "message": "value does not exist",
                    "expectedValue": expected,
                    "actualValue": null,
                }));
            };
            if let Some(reason) = core.expired_reason(payload, max_age_secs) {
                return ClaimValidationResult::invalid(reason);
            }
            if actual != expected {
                return ClaimValidationResult::invalid(json!({
                    "message": "wrong value",
                    "expectedValue": expected,
                    "actualValue": actual,
                }));
            }
            ClaimValidationResult::valid()
        },
    )
}

#[async_trait]
impl SessionClaim for PrimitiveClaim {
    fn key(&self) -> &str {
        &self.inner.key
    }

    async fn fetch_value(&self, user_id: &str, tenant_id: &str) -> Result<Option<Value>> {
        (self.inner.fetch)(user_id.to_string(), tenant_id.to_string()).await
    }
}
