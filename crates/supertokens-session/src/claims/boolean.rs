use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::primitive::has_value_validator;
use super::{PrimitiveClaim, SessionClaim, SessionClaimValidator};
use crate::error::Result;
use crate::payload::AccessTokenPayload;

/// A claim holding `true` or `false`
#[derive(Debug, Clone)]
pub struct BooleanClaim {
    inner: PrimitiveClaim,
}

impl BooleanClaim {
    /// Create a boolean claim stored under `key`
    pub fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<bool>>> + Send + 'static,
    {
        Self {
            inner: PrimitiveClaim::new(key, move |user_id, tenant_id| {
                let value = fetch(user_id, tenant_id);
                async move { Ok(value.await?.map(Value::Bool)) }
            }),
        }
    }

    /// Freshness window applied by validators that do not name their own
    #[must_use]
    pub fn with_default_max_age(self, max_age_secs: u64) -> Self {
        Self {
            inner: self.inner.with_default_max_age(max_age_secs),
        }
    }

    /// Validator: the claim is `true`
    pub fn is_true(&self, max_age_secs: Option<u64>) -> SessionClaimValidator {
        self.expect(true, max_age_secs)
    }

    /// Validator: the claim is `false`
    pub fn is_false(&self, max_age_secs: Option<u64>) -> SessionClaimValidator {
        self.expect(false, max_age_secs)
    }

    /// The claim as a boolean, if present
    pub fn get_bool(&self, payload: &AccessTokenPayload) -> Option<bool> {
        self.get_value_from_payload(payload)
            .and_then(|value| value.as_bool())
    }

    fn expect(&self, expected: bool, max_age_secs: Option<u64>) -> SessionClaimValidator {
        let core = self.inner.core();
        let max_age = max_age_secs.or(core.default_max_age_secs);
        has_value_validator(
            Arc::clone(&core),
            Arc::new(self.clone()),
            core.key.clone(),
            Value::Bool(expected),
            max_age,
        )
    }
}

#[async_trait]
impl SessionClaim for BooleanClaim {
    fn key(&self) -> &str {
        self.inner.key()
    }

    async fn fetch_value(&self, user_id: &str, tenant_id: &str) -> Result<Option<Value>> {
        self.inner.fetch_value(user_id, tenant_id).await
    }
}
