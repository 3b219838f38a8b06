//! Access token wire codec
//!
//! Tokens are three base64url segments, `header.payload.signature`. The
//! signature is RSA-PKCS1v15 over `SHA256(header + "." + payload)`. Only RS256
//! is accepted; any other header is rejected as malformed.
//!
//! Tokens minted before key ids existed carry one of two fixed header strings
//! and are treated as version 2.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde_json::{Map, Value};
use thiserror::Error;

/// Fixed header of legacy tokens stamped `"version":"1"`
pub const LEGACY_HEADER_V1: &str =
    "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCIsInZlcnNpb24iOiIxIn0=";

/// Fixed header of legacy tokens stamped `"version":"2"`
pub const LEGACY_HEADER_V2: &str =
    "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCIsInZlcnNpb24iOiIyIn0=";

/// Version assumed for tokens whose header names no version
pub const LATEST_ACCESS_TOKEN_VERSION: u32 = 4;

/// Codec failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The string is not a token this SDK understands
    #[error("malformed access token: {0}")]
    Malformed(String),
    /// The signature does not match the signing input
    #[error("invalid access token signature")]
    SignatureInvalid,
}

/// A token split into its segments, with header and payload decoded
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJwt {
    /// Raw header segment
    pub raw_header: String,
    /// Raw payload segment
    pub raw_payload: String,
    /// Raw signature segment
    pub signature: String,
    /// Structural version of the token
    pub version: u32,
    /// Key id from the header; `None` for legacy tokens
    pub kid: Option<String>,
    /// Decoded payload object
    pub payload: Map<String, Value>,
}

impl ParsedJwt {
    /// The bytes the signature covers
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.raw_header, self.raw_payload)
    }

    /// Verify the RS256 signature against a public key
    ///
    /// # Errors
    ///
    /// [`CodecError::SignatureInvalid`] when the key did not produce the signature.
    pub fn verify_signature(&self, key: &DecodingKey) -> Result<(), CodecError> {
        let signature = self
            .signature
            .trim_end_matches('=')
            .replace('+', "-")
            .replace('/', "_");
        match jsonwebtoken::crypto::verify(
            &signature,
            self.signing_input().as_bytes(),
            key,
            Algorithm::RS256,
        ) {
            Ok(true) => Ok(()),
            _ => Err(CodecError::SignatureInvalid),
        }
    }

    /// True when the header predates key ids
    pub fn is_legacy(&self) -> bool {
        self.version < 3
    }
}

/// Decode one segment, accepting both base64url and standard alphabets with or without padding
pub fn decode_segment(segment: &str) -> Result<Vec<u8>, CodecError> {
    let trimmed = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|_| CodecError::Malformed("segment is not valid base64".into()))
}

/// Split and decode a token without checking its signature
///
/// # Errors
///
/// [`CodecError::Malformed`] when the token has the wrong shape, an unsupported
/// header, or a payload that is not a JSON object.
pub fn parse_without_verification(token: &str) -> Result<ParsedJwt, CodecError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header, payload, signature] = parts.as_slice() else {
        return Err(CodecError::Malformed("invalid jwt".into()));
    };

    let (version, kid) = if *header == LEGACY_HEADER_V1 || *header == LEGACY_HEADER_V2 {
        (2, None)
    } else {
        parse_header(header)?
    };

    let payload_bytes = decode_segment(payload)?;
    let payload_value: Value = serde_json::from_slice(&payload_bytes)
        .map_err(|_| CodecError::Malformed("payload is not valid JSON".into()))?;
    let Value::Object(payload_object) = payload_value else {
        return Err(CodecError::Malformed("payload is not a JSON object".into()));
    };

    Ok(ParsedJwt {
        raw_header: (*header).to_string(),
        raw_payload: (*payload).to_string(),
        signature: (*signature).to_string(),
        version,
        kid,
        payload: payload_object,
    })
}

fn parse_header(segment: &str) -> Result<(u32, Option<String>), CodecError> {
    let mismatch = || CodecError::Malformed("JWT header mismatch".into());

    let bytes = decode_segment(segment)?;
    let header: Map<String, Value> = serde_json::from_slice(&bytes).map_err(|_| mismatch())?;

    let version = match header.get("version") {
        None => LATEST_ACCESS_TOKEN_VERSION,
        Some(Value::String(raw)) => raw.parse::<u32>().map_err(|_| mismatch())?,
        Some(_) => return Err(mismatch()),
    };
    if version < 3 {
        return Err(mismatch());
    }

    if header.get("typ").and_then(Value::as_str) != Some("JWT")
        || header.get("alg").and_then(Value::as_str) != Some("RS256")
    {
        return Err(mismatch());
    }

    let kid = header
        .get("kid")
        .and_then(Value::as_str)
        .ok_or_else(mismatch)?
        .to_string();

    Ok((version, Some(kid)))
}
