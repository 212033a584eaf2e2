//! Process-wide signing secret for finalization tokens.
//!
//! The secret lives in a file (base64-encoded, 32 bytes once decoded)
//! whose path is configured at startup. The file is read lazily and the
//! decoded bytes are cached; `reset()` discards the cache so a rotated
//! secret is picked up on the next signature.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Issuer recorded in every token this process signs.
pub const ISSUER: &str = "windlass";

/// Signed tokens stay valid this long; the application consumes them
/// within the lifetime of the proxied request.
const TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Decoded secret length the signer insists on.
const SECRET_LENGTH: usize = 32;

static SECRET_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);
static SECRET_CACHE: RwLock<Option<Vec<u8>>> = RwLock::new(None);

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("signing secret path is not configured")]
    NotConfigured,

    #[error("read signing secret: {0}")]
    Io(#[from] std::io::Error),

    #[error("signing secret is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("signing secret must decode to {SECRET_LENGTH} bytes, got {0}")]
    InvalidLength(usize),

    #[error("sign token: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

/// Configure where the signing secret lives. Clears any cached value.
pub fn set_path(path: impl Into<PathBuf>) {
    *SECRET_PATH.write().unwrap() = Some(path.into());
    reset();
}

/// Drop the cached secret so the next use re-reads the file.
pub fn reset() {
    *SECRET_CACHE.write().unwrap() = None;
}

/// The decoded secret bytes, reading and caching the file on first use.
pub fn bytes() -> Result<Vec<u8>, SecretError> {
    if let Some(cached) = SECRET_CACHE.read().unwrap().as_ref() {
        return Ok(cached.clone());
    }

    let path = SECRET_PATH
        .read()
        .unwrap()
        .clone()
        .ok_or(SecretError::NotConfigured)?;
    let encoded = std::fs::read_to_string(&path)?;
    let decoded = BASE64.decode(encoded.trim())?;
    if decoded.len() != SECRET_LENGTH {
        return Err(SecretError::InvalidLength(decoded.len()));
    }

    *SECRET_CACHE.write().unwrap() = Some(decoded.clone());
    Ok(decoded)
}

/// Sign `claims` as a compact HS256 token with the process secret.
pub fn sign<T: Serialize>(claims: &T) -> Result<String, SecretError> {
    let key = EncodingKey::from_secret(&bytes()?);
    Ok(encode(&Header::default(), claims, &key)?)
}

/// Expiry timestamp for tokens issued now.
pub fn token_expiry() -> u64 {
    (SystemTime::now() + TOKEN_TTL)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
