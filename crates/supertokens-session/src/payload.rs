//! Typed access token payload
//!
//! The payload is an ordered JSON object. A fixed set of keys is owned by the
//! core (subject, expiry, session handle, refresh-chain hashes, ...); user code
//! and claims may not write them. Writes through [`AccessTokenPayload::insert`]
//! and [`AccessTokenPayload::merge`] are checked, so a collision fails when the
//! payload is built instead of being silently dropped later.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GeneralError, Result};

/// Payload keys reserved for the core
pub const PROTECTED_PROPS: &[&str] = &[
    "sub",
    "iat",
    "exp",
    "sessionHandle",
    "parentRefreshTokenHash1",
    "refreshTokenHash1",
    "antiCsrfToken",
    "rsub",
    "tId",
    "iss",
];

/// True for keys only the core may set
pub fn is_protected(key: &str) -> bool {
    PROTECTED_PROPS.contains(&key)
}

/// Ordered key/value payload carried inside the access token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessTokenPayload(Map<String, Value>);

impl AccessTokenPayload {
    /// Empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a payload decoded from a verified token or a core response
    ///
    /// Reserved keys are kept as they are; the source is trusted.
    pub fn from_token(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build a payload from user supplied data
    ///
    /// # Errors
    ///
    /// [`GeneralError::ProtectedPayloadKey`] when the data uses a reserved key.
    pub fn from_user(map: Map<String, Value>) -> Result<Self> {
        if let Some(key) = map.keys().find(|key| is_protected(key)) {
            return Err(GeneralError::ProtectedPayloadKey(key.clone()).into());
        }
        Ok(Self(map))
    }

    /// Build a payload from a JSON value; `null` means empty
    ///
    /// # Errors
    ///
    /// Fails for non-object values and reserved keys.
    pub fn from_user_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Self::from_user(map),
            other => Err(GeneralError::UnexpectedResponse {
                path: "accessTokenPayload".into(),
                message: format!("expected a JSON object, got {other}"),
            }
            .into()),
        }
    }

    /// Set `key` to `value`, returning the previous value
    ///
    /// # Errors
    ///
    /// [`GeneralError::ProtectedPayloadKey`] for reserved keys.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<Option<Value>> {
        let key = key.into();
        if is_protected(&key) {
            return Err(GeneralError::ProtectedPayloadKey(key).into());
        }
        Ok(self.0.insert(key, value))
    }

    /// Remove `key`
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Apply a partial update; `null` values delete their key
    ///
    /// # Errors
    ///
    /// [`GeneralError::ProtectedPayloadKey`] when the update touches a reserved key.
    /// The payload is left unchanged in that case.
    pub fn merge(&mut self, update: &Map<String, Value>) -> Result<()> {
        if let Some(key) = update.keys().find(|key| is_protected(key)) {
            return Err(GeneralError::ProtectedPayloadKey(key.clone()).into());
        }
        for (key, value) in update {
            if value.is_null() {
                self.0.remove(key);
            } else {
                self.0.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The payload without reserved keys, as sent back to the core on updates
    pub fn user_payload(&self) -> Map<String, Value> {
        self.0
            .iter()
            .filter(|(key, _)| !is_protected(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the underlying map
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Convert into a JSON object value
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}
