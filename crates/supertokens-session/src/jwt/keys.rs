//! Signing key cache
//!
//! Public keys are fetched from the core's `GET /recipe/jwt/jwks.json` and
//! cached per key id until the refresh interval passes. Stale entries are not
//! evicted eagerly; they are refreshed on the next lookup.
//!
//! Concurrent lookups that miss the cache collapse into one in-flight fetch:
//! callers queue on a gate and re-check a generation counter once they hold
//! it, so only the first caller talks to the core. Nothing is spawned; with a
//! refresh interval of zero every lookup fetches inline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{GeneralError, Result};
use crate::querier::CoreQuerier;
use crate::utils::now_ms;

/// Core path serving the signing keys
pub const JWKS_PATH: &str = "/recipe/jwt/jwks.json";

/// Prefix of the static signing key id
pub const STATIC_KEY_PREFIX: &str = "s-";

/// Prefix of rotating signing key ids
pub const DYNAMIC_KEY_PREFIX: &str = "d-";

/// True when the key id names a rotating signing key
pub fn is_dynamic_key_id(kid: Option<&str>) -> bool {
    kid.is_some_and(|kid| kid.starts_with(DYNAMIC_KEY_PREFIX))
}

/// One JSON Web Key as returned by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreJwk {
    /// Key type; only `RSA` is used for access tokens
    pub kty: String,
    /// Key id
    #[serde(default)]
    pub kid: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default)]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default)]
    pub e: Option<String>,
    /// Algorithm hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Public key use
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
}

/// JWKS document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreJwkSet {
    /// Keys in the order the core listed them
    pub keys: Vec<CoreJwk>,
}

impl CoreJwk {
    fn to_decoding_key(&self) -> std::result::Result<DecodingKey, String> {
        if self.kty != "RSA" {
            return Err(format!("unsupported key type {}", self.kty));
        }
        let (Some(n), Some(e)) = (&self.n, &self.e) else {
            return Err("RSA key is missing 'n' or 'e'".into());
        };
        DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())
    }
}

/// A cached public key
#[derive(Clone)]
pub struct CachedKey {
    /// Key id
    pub key_id: String,
    /// Verification key
    pub key: Arc<DecodingKey>,
    /// First time this SDK saw the key (ms epoch)
    pub created_at: u64,
    /// When the entry must be refetched (ms epoch)
    pub expires_at: u64,
}

impl CachedKey {
    fn is_fresh(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for CachedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedKey")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct KeyState {
    entries: HashMap<String, CachedKey>,
    order: Vec<String>,
    generation: u64,
    fresh_until: u64,
    signing_key_last_updated: u64,
}

impl KeyState {
    fn fresh_key(&self, kid: &str, now: u64) -> Option<Arc<DecodingKey>> {
        self.entries
            .get(kid)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| Arc::clone(&entry.key))
    }

    fn key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.entries.get(kid).map(|entry| Arc::clone(&entry.key))
    }

    fn all_keys(&self) -> Vec<Arc<DecodingKey>> {
        self.order
            .iter()
            .filter_map(|kid| self.key(kid))
            .collect()
    }
}

/// Lazily refreshed cache of the core's public signing keys
pub struct SigningKeyCache {
    querier: Arc<CoreQuerier>,
    refresh_interval: Duration,
    state: RwLock<KeyState>,
    fetch_gate: Mutex<()>,
}

impl fmt::Debug for SigningKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyCache")
            .field("refresh_interval", &self.refresh_interval)
            .field("state", &"<cached keys>")
            .finish_non_exhaustive()
    }
}

impl SigningKeyCache {
    /// Create an empty cache
    pub fn new(querier: Arc<CoreQuerier>, refresh_interval: Duration) -> Self {
        Self {
            querier,
            refresh_interval,
            state: RwLock::new(KeyState::default()),
            fetch_gate: Mutex::new(()),
        }
    }

    /// Freshness window of fetched keys
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Public key for `kid`, fetching the key set when the id is unknown or stale
    ///
    /// Returns `Ok(None)` when the core does not list the key either.
    ///
    /// # Errors
    ///
    /// Propagates core communication failures.
    pub async fn get_key(&self, kid: &str) -> Result<Option<Arc<DecodingKey>>> {
        if let Some(key) = self.state.read().await.fresh_key(kid, now_ms()) {
            debug!(kid, "Using cached signing key");
            return Ok(Some(key));
        }

        self.refresh_coalesced().await?;
        Ok(self.state.read().await.key(kid))
    }

    /// Every known key, in core order; used for tokens that carry no key id
    ///
    /// # Errors
    ///
    /// Propagates core communication failures.
    pub async fn get_all_keys(&self) -> Result<Vec<Arc<DecodingKey>>> {
        {
            let state = self.state.read().await;
            if now_ms() < state.fresh_until {
                return Ok(state.all_keys());
            }
        }

        self.refresh_coalesced().await?;
        Ok(self.state.read().await.all_keys())
    }

    /// Time (ms epoch) a previously unseen key id last appeared; `0` before any fetch
    ///
    /// Informational only. Verification of legacy tokens compares their issue
    /// time against the refresh interval, not against this value.
    pub async fn signing_key_last_updated(&self) -> u64 {
        self.state.read().await.signing_key_last_updated
    }

    /// Snapshot of the cached entries
    pub async fn entries(&self) -> Vec<CachedKey> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|kid| state.entries.get(kid).cloned())
            .collect()
    }

    /// Drop every cached key
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.order.clear();
        state.fresh_until = 0;
        debug!("Signing key cache cleared");
    }

    async fn refresh_coalesced(&self) -> Result<()> {
        let seen = self.state.read().await.generation;
        let _gate = self.fetch_gate.lock().await;

        if self.state.read().await.generation != seen {
            debug!("Signing keys were refreshed by a concurrent lookup");
            return Ok(());
        }

        self.fetch_and_cache().await
    }

    async fn fetch_and_cache(&self) -> Result<()> {
        info!(path = JWKS_PATH, "Fetching signing keys from core");

        let response = self.querier.send_get(JWKS_PATH, &[]).await?;
        let set: CoreJwkSet = serde_json::from_value(response).map_err(|e| {
            GeneralError::UnexpectedResponse {
                path: JWKS_PATH.to_string(),
                message: format!("invalid JWKS document: {e}"),
            }
        })?;

        let now = now_ms();
        let expires_at = now.saturating_add(self.refresh_interval.as_millis() as u64);

        let mut state = self.state.write().await;
        let mut entries = HashMap::with_capacity(set.keys.len());
        let mut order = Vec::with_capacity(set.keys.len());
        let mut saw_new_key = false;

        for jwk in &set.keys {
            let Some(kid) = jwk.kid.clone() else {
                warn!("Skipping signing key without kid");
                continue;
            };
            let key = match jwk.to_decoding_key() {
                Ok(key) => key,
                Err(e) => {
                    warn!(kid = %kid, error = %e, "Skipping unusable signing key");
                    continue;
                }
            };
            let created_at = match state.entries.get(&kid) {
                Some(existing) => existing.created_at,
                None => {
                    saw_new_key = true;
                    now
                }
            };
            order.push(kid.clone());
            entries.insert(
                kid.clone(),
                CachedKey {
                    key_id: kid,
                    key: Arc::new(key),
                    created_at,
                    expires_at,
                },
            );
        }

        if saw_new_key {
            state.signing_key_last_updated = now;
        }
        state.entries = entries;
        state.order = order;
        state.fresh_until = expires_at;
        state.generation = state.generation.wrapping_add(1);

        info!(
            key_count = state.entries.len(),
            new_key = saw_new_key,
            "Successfully fetched signing keys"
        );
        Ok(())
    }
}
