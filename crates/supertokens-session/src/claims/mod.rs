//! Session claims
//!
//! A claim is a value derived from the user (a role list, a verified flag, ...)
//! that is embedded in the access token payload under its own key as
//! `{"v": value, "t": fetchedAtMillis}`. Validators check claims against the
//! payload; a validator may ask for the claim to be refetched first when it is
//! missing or older than its freshness window.
//!
//! Validation never short-circuits: every failing validator is reported, in the
//! order the validators were supplied.

mod array;
mod boolean;
mod primitive;

pub use array::PrimitiveArrayClaim;
pub use boolean::BooleanClaim;
pub use primitive::PrimitiveClaim;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::payload::AccessTokenPayload;
use crate::utils::now_ms;

/// Async lookup of a claim's current value for `(user_id, tenant_id)`
pub type FetchValueFn =
    Arc<dyn Fn(String, String) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// A value that can be embedded in, read from and removed from the payload
#[async_trait]
pub trait SessionClaim: Send + Sync {
    /// Payload key the claim lives under
    fn key(&self) -> &str;

    /// Fetch the current value; `None` means the claim does not apply
    async fn fetch_value(&self, user_id: &str, tenant_id: &str) -> Result<Option<Value>>;

    /// Write `{v: value, t: now}` under the claim key
    fn add_to_payload(&self, payload: &mut AccessTokenPayload, value: Value) -> Result<()> {
        add_to_payload_at(payload, self.key(), value, now_ms())
    }

    /// Delete the claim key locally
    fn remove_from_payload(&self, payload: &mut AccessTokenPayload) {
        payload.remove(self.key());
    }

    /// Write a `null` tombstone, so a merge into the stored payload deletes the claim
    fn remove_from_payload_by_merge(&self, payload: &mut AccessTokenPayload) -> Result<()> {
        payload.insert(self.key(), Value::Null).map(|_| ())
    }

    /// The claim's value, if present
    fn get_value_from_payload(&self, payload: &AccessTokenPayload) -> Option<Value> {
        payload
            .get(self.key())
            .and_then(|entry| entry.get("v"))
            .filter(|value| !value.is_null())
            .cloned()
    }

    /// When the value was fetched (ms epoch), if present
    fn get_last_refetch_time(&self, payload: &AccessTokenPayload) -> Option<u64> {
        payload
            .get(self.key())
            .and_then(|entry| entry.get("t"))
            .and_then(crate::access_token::json_number_as_u64)
    }

    /// Fetch the value and add it to the payload; a `None` value leaves the payload untouched
    async fn build(
        &self,
        user_id: &str,
        tenant_id: &str,
        payload: &mut AccessTokenPayload,
    ) -> Result<()> {
        match self.fetch_value(user_id, tenant_id).await? {
            Some(value) => self.add_to_payload(payload, value),
            None => Ok(()),
        }
    }
}

/// Write a claim entry with an explicit fetch time
pub fn add_to_payload_at(
    payload: &mut AccessTokenPayload,
    key: &str,
    value: Value,
    fetched_at_ms: u64,
) -> Result<()> {
    payload
        .insert(key, json!({ "v": value, "t": fetched_at_ms }))
        .map(|_| ())
}

/// Result of a single validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimValidationResult {
    /// Whether the claim passed
    pub is_valid: bool,
    /// Structured failure reason, consumed by frontend SDKs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
}

impl ClaimValidationResult {
    /// Passing result
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            reason: None,
        }
    }

    /// Failing result with a reason
    pub fn invalid(reason: Value) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
        }
    }
}

/// A failed validator, as reported to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimValidationError {
    /// Validator id
    pub id: String,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
}

type ShouldRefetchFn = Arc<dyn Fn(&AccessTokenPayload) -> bool + Send + Sync>;
type ValidateFn = Arc<dyn Fn(&AccessTokenPayload) -> ClaimValidationResult + Send + Sync>;

/// A check over the access token payload
#[derive(Clone)]
pub struct SessionClaimValidator {
    /// Id reported on failure
    pub id: String,
    /// Claim refetched when `should_refetch` says so
    pub claim: Option<Arc<dyn SessionClaim>>,
    should_refetch: Option<ShouldRefetchFn>,
    validate: ValidateFn,
}

impl fmt::Debug for SessionClaimValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClaimValidator")
            .field("id", &self.id)
            .field("claim", &self.claim.as_ref().map(|claim| claim.key().to_string()))
            .field("refetches", &self.should_refetch.is_some())
            .finish()
    }
}

impl SessionClaimValidator {
    /// Validator bound to a claim that can be refetched
    pub fn new(
        id: impl Into<String>,
        claim: Arc<dyn SessionClaim>,
        should_refetch: impl Fn(&AccessTokenPayload) -> bool + Send + Sync + 'static,
        validate: impl Fn(&AccessTokenPayload) -> ClaimValidationResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            claim: Some(claim),
            should_refetch: Some(Arc::new(should_refetch)),
            validate: Arc::new(validate),
        }
    }

    /// Validator that only inspects the payload
    pub fn custom(
        id: impl Into<String>,
        validate: impl Fn(&AccessTokenPayload) -> ClaimValidationResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            claim: None,
            should_refetch: None,
            validate: Arc::new(validate),
        }
    }

    /// Replace the reported id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Whether the claim should be refetched before validating
    pub fn should_refetch(&self, payload: &AccessTokenPayload) -> bool {
        self.should_refetch
            .as_ref()
            .is_some_and(|should_refetch| should_refetch(payload))
    }

    /// Run the check
    pub fn validate(&self, payload: &AccessTokenPayload) -> ClaimValidationResult {
        (self.validate)(payload)
    }
}

/// Outcome of [`validate_claims`]
#[derive(Debug, Clone, Default)]
pub struct ClaimsValidation {
    /// Failures, in validator order
    pub invalid_claims: Vec<ClaimValidationError>,
    /// The payload after refetching, when any claim was refetched
    pub access_token_payload_update: Option<AccessTokenPayload>,
}

/// Run validators over a payload without refetching
pub fn validate_claims_in_payload(
    validators: &[SessionClaimValidator],
    payload: &AccessTokenPayload,
) -> Vec<ClaimValidationError> {
    validators
        .iter()
        .filter_map(|validator| {
            let result = validator.validate(payload);
            debug!(id = %validator.id, valid = result.is_valid, "Claim validator ran");
            (!result.is_valid).then(|| ClaimValidationError {
                id: validator.id.clone(),
                reason: result.reason,
            })
        })
        .collect()
}

/// Refetch stale claims, then run every validator
///
/// # Errors
///
/// Propagates fetch failures. A validator that asks for a refetch without
/// naming a claim is an invariant violation.
pub async fn validate_claims(
    user_id: &str,
    tenant_id: &str,
    payload: &AccessTokenPayload,
    validators: &[SessionClaimValidator],
) -> Result<ClaimsValidation> {
    let mut current = payload.clone();
    let mut refetched = false;

    for validator in validators {
        if !validator.should_refetch(&current) {
            continue;
        }
        let claim = validator.claim.as_ref().ok_or_else(|| {
            SessionError::invariant(format!(
                "validator '{}' requested a refetch but has no claim",
                validator.id
            ))
        })?;
        debug!(id = %validator.id, key = claim.key(), "Refetching claim before validation");
        if let Some(value) = claim.fetch_value(user_id, tenant_id).await? {
            claim.add_to_payload(&mut current, value)?;
            refetched = true;
        }
    }

    Ok(ClaimsValidation {
        invalid_claims: validate_claims_in_payload(validators, &current),
        access_token_payload_update: refetched.then_some(current),
    })
}

/// Shared state of the built-in claim types
#[derive(Clone)]
pub(crate) struct ClaimCore {
    pub(crate) key: String,
    pub(crate) fetch: FetchValueFn,
    pub(crate) default_max_age_secs: Option<u64>,
}

impl ClaimCore {
    pub(crate) fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self {
            key: key.into(),
            fetch: Arc::new(
                move |user_id: String, tenant_id: String| -> BoxFuture<'static, Result<Option<Value>>> {
                    Box::pin(fetch(user_id, tenant_id))
                },
            ),
            default_max_age_secs: None,
        }
    }

    pub(crate) fn value(&self, payload: &AccessTokenPayload) -> Option<Value> {
        payload
            .get(&self.key)
            .and_then(|entry| entry.get("v"))
            .filter(|value| !value.is_null())
            .cloned()
    }

    pub(crate) fn fetched_at(&self, payload: &AccessTokenPayload) -> Option<u64> {
        payload
            .get(&self.key)
            .and_then(|entry| entry.get("t"))
            .and_then(crate::access_token::json_number_as_u64)
    }

    /// Missing, or older than `max_age_secs`
    pub(crate) fn needs_refetch(
        &self,
        payload: &AccessTokenPayload,
        max_age_secs: Option<u64>,
    ) -> bool {
        if self.value(payload).is_none() {
            return true;
        }
        match (max_age_secs, self.fetched_at(payload)) {
            (Some(max_age), Some(fetched_at)) => {
                fetched_at < now_ms().saturating_sub(max_age.saturating_mul(1000))
            }
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// `Some(reason)` when the value is older than `max_age_secs`
    pub(crate) fn expired_reason(
        &self,
        payload: &AccessTokenPayload,
        max_age_secs: Option<u64>,
    ) -> Option<Value> {
        let max_age = max_age_secs?;
        let fetched_at = self.fetched_at(payload).unwrap_or(0);
        let age_secs = now_ms().saturating_sub(fetched_at) / 1000;
        (age_secs > max_age).then(|| {
            json!({
                "message": "expired",
                "ageInSeconds": age_secs,
                "maxAgeInSeconds": max_age,
            })
        })
    }
}

impl fmt::Debug for ClaimCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimCore")
            .field("key", &self.key)
            .field("default_max_age_secs", &self.default_max_age_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn passing(id: &str) -> SessionClaimValidator {
        SessionClaimValidator::custom(id, |_| ClaimValidationResult::valid())
    }

    fn failing(id: &str, reason: Value) -> SessionClaimValidator {
        SessionClaimValidator::custom(id, move |_| ClaimValidationResult::invalid(reason.clone()))
    }

    #[test]
    fn test_composition_collects_failures_only() {
        let payload = AccessTokenPayload::new();
        let errors = validate_claims_in_payload(
            &[passing("ok"), failing("bad", json!({"message": "nope"}))],
            &payload,
        );
        assert_eq!(
            errors,
            vec![ClaimValidationError {
                id: "bad".into(),
                reason: Some(json!({"message": "nope"})),
            }]
        );
        assert!(validate_claims_in_payload(&[], &payload).is_empty());
    }

    #[test]
    fn test_composition_keeps_order_and_does_not_short_circuit() {
        let payload = AccessTokenPayload::new();
        let errors = validate_claims_in_payload(
            &[
                failing("first", json!(1)),
                passing("middle"),
                failing("last", json!(2)),
            ],
            &payload,
        );
        let ids: Vec<&str> = errors.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["first", "last"]);
    }

    #[tokio::test]
    async fn test_refetch_without_claim_is_invariant_violation() {
        let mut validator = passing("broken");
        validator.should_refetch = Some(Arc::new(|_: &AccessTokenPayload| true));
        let err = validate_claims("u", "public", &AccessTokenPayload::new(), &[validator])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "GENERAL_ERROR");
    }

    #[test]
    fn test_error_serialization() {
        let error = ClaimValidationError {
            id: "st-role".into(),
            reason: Some(json!({"message": "wrong value"})),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"id": "st-role", "reason": {"message": "wrong value"}})
        );
    }
}
