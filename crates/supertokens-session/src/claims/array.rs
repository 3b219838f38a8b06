use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ClaimCore, ClaimValidationResult, SessionClaim, SessionClaimValidator};
use crate::error::Result;

/// A claim holding a list of JSON values, such as roles or permissions
#[derive(Clone)]
pub struct PrimitiveArrayClaim {
    inner: Arc<ClaimCore>,
}

impl fmt::Debug for PrimitiveArrayClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrimitiveArrayClaim").field(&self.inner).finish()
    }
}

#[derive(Clone, Copy)]
enum Expectation {
    Include,
    Exclude,
}

impl Expectation {
    fn reason_key(self) -> &'static str {
        match self {
            Self::Include => "expectedToInclude",
            Self::Exclude => "expectedToNotInclude",
        }
    }
}

impl PrimitiveArrayClaim {
    /// Create an array claim stored under `key`
    ///
    /// `fetch` should resolve to a JSON array, or `None` when the claim does not apply.
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

    /// Validator: the list contains `value`
    pub fn includes(&self, value: Value, max_age_secs: Option<u64>) -> SessionClaimValidator {
        let expected = value.clone();
        self.validator(Expectation::Include, value, max_age_secs, move |actual| {
            actual.contains(&expected)
        })
    }

    /// Validator: the list does not contain `value`
    pub fn excludes(&self, value: Value, max_age_secs: Option<u64>) -> SessionClaimValidator {
        let unexpected = value.clone();
        self.validator(Expectation::Exclude, value, max_age_secs, move |actual| {
            !actual.contains(&unexpected)
        })
    }

    /// Validator: the list contains every one of `values`
    pub fn includes_all(&self, values: Vec<Value>, max_age_secs: Option<u64>) -> SessionClaimValidator {
        let expected = values.clone();
        self.validator(
            Expectation::Include,
            Value::Array(values),
            max_age_secs,
            move |actual| expected.iter().all(|value| actual.contains(value)),
        )
    }

    /// Validator: the list contains none of `values`
    pub fn excludes_all(&self, values: Vec<Value>, max_age_secs: Option<u64>) -> SessionClaimValidator {
        let unexpected = values.clone();
        self.validator(
            Expectation::Exclude,
            Value::Array(values),
            max_age_secs,
            move |actual| !unexpected.iter().any(|value| actual.contains(value)),
        )
    }

    fn validator(
        &self,
        expectation: Expectation,
        expected: Value,
        max_age_secs: Option<u64>,
        check: impl Fn(&[Value]) -> bool + Send + Sync + 'static,
    ) -> SessionClaimValidator {
        let max_age = max_age_secs.or(self.inner.default_max_age_secs);
        let core = Arc::clone(&self.inner);
        let refetch_core = Arc::clone(&self.inner);
        let reason_key = expectation.reason_key();

        SessionClaimValidator::new(
            self.inner.key.clone(),
            Arc::new(self.clone()),
            move |payload| refetch_core.needs_refetch(payload, max_age),
            move |payload| {
                let Some(actual) = core.value(payload) else {
                    return ClaimValidationResult::invalid(json!({
                        "message": "value does not exist",
                        reason_key: expected,
                        "actualValue": null,
                    }));
                };
                if let Some(reason) = core.expired_reason(payload, max_age) {
                    return ClaimValidationResult::invalid(reason);
                }
                let items = actual.as_array().map(Vec::as_slice).unwrap_or_default();
                if !check(items) {
                    return ClaimValidationResult::invalid(json!({
                        "message": "wrong value",
                        reason_key: expected,
                        "actualValue": actual,
                    }));
                }
                ClaimValidationResult::valid()
            },
        )
    }
}

#[async_trait]
impl SessionClaim for PrimitiveArrayClaim {
    fn key(&self) -> &str {
        &self.inner.key
    }

    async fn fetch_value(&self, user_id: &str, tenant_id: &str) -> Result<Option<Value>> {
        (self.inner.fetch)(user_id.to_string(), tenant_id.to_string()).await
    }
}
