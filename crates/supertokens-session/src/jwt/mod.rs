//! Access token signatures
//!
//! - `codec` - splitting, decoding and RS256 verification of the token string
//! - `keys` - the core's public signing keys, cached by key id

pub mod codec;
pub mod keys;

pub use codec::{CodecError, ParsedJwt, parse_without_verification};
pub use keys::{
    CachedKey, CoreJwk, CoreJwkSet, DYNAMIC_KEY_PREFIX, JWKS_PATH, STATIC_KEY_PREFIX,
    SigningKeyCache, is_dynamic_key_id,
};
