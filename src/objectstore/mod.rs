//! Object storage uploaders.
//!
//! Three ways to make the inbound byte stream durable on an S3-compatible
//! store: a single presigned PUT (`Object`), a presigned multipart
//! session (`Multipart`), and a natively-signed client (`S3Object`).
//! All three consume the write half of a [`crate::pipe`] and settle into
//! a verified-or-failed state the caller observes through `close()`.

use async_trait::async_trait;
use bytes::Bytes;
use lazy_static::lazy_static;
use std::time::Duration;
use thiserror::Error;

pub mod multipart;
pub mod object;
pub mod s3_object;
mod uploader;

pub use multipart::{CompleteMultipartUpload, CompletePart, Multipart};
pub use object::Object;
pub use s3_object::S3Object;

/// Upload errors. Cleanup failures are deliberately absent: aborts and
/// deletes are best-effort and only ever logged.
#[derive(Error, Debug, Clone)]
pub enum ObjectStoreError {
    #[error("PUT request returned: {status}")]
    StatusCode { status: u16 },

    #[error("etag mismatch: expected {expected:?} got {actual:?}")]
    ETagMismatch { expected: String, actual: String },

    #[error("not enough parts")]
    NotEnoughParts,

    #[error("upload deadline exceeded")]
    DeadlineExceeded,

    #[error("upload canceled")]
    Canceled,

    #[error("request failed: {0}")]
    Request(String),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("decode completion response: {0}")]
    Xml(String),

    #[error("invalid part etag: {0}")]
    InvalidETag(String),

    #[error("invalid upload configuration: {0}")]
    Configuration(String),

    #[error("io: {0}")]
    Io(String),
}

impl ObjectStoreError {
    /// HTTP status the remote answered with, when that is what failed.
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            ObjectStoreError::StatusCode { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(err: reqwest::Error) -> Self {
        ObjectStoreError::Request(err.to_string())
    }
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(err: std::io::Error) -> Self {
        ObjectStoreError::Io(err.to_string())
    }
}

lazy_static! {
    /// Shared client tuned for short-lived large PUTs: aggressive idle
    /// reaping keeps descriptor usage low between uploads. Proxy selection
    /// follows the standard environment variables.
    static ref HTTP_CLIENT: reqwest::Client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(2)
        .tcp_keepalive(Duration::from_secs(10))
        .build()
        .expect("construct object storage HTTP client");
}

/// The tuned process-wide HTTP client for presigned-URL traffic.
pub(crate) fn http_client() -> &'static reqwest::Client {
    &HTTP_CLIENT
}

/// A remote destination for one upload: bytes in, then a close that
/// settles the transfer and exposes the remote ETag.
#[async_trait]
pub trait RemoteUpload: Send {
    /// Forward one chunk. Fails once the driver has recorded an error.
    async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError>;

    /// Signal end-of-stream and wait for the driver to settle.
    async fn close(&mut self) -> Result<(), ObjectStoreError>;

    /// Remote ETag, meaningful only after a successful `close()`.
    fn etag(&self) -> String;
}

/// Strip surrounding quotes some servers put around ETag header values.
pub(crate) fn strip_etag_quotes(raw: &str) -> &str {
    raw.trim_matches('"')
}

/// Case-insensitive hex comparison between a locally computed digest and
/// the remote ETag.
pub(crate) fn compare_md5(local: &str, remote: &str) -> Result<(), ObjectStoreError> {
    if local.eq_ignore_ascii_case(remote) {
        Ok(())
    } else {
        Err(ObjectStoreError::ETagMismatch {
            expected: local.to_string(),
            actual: remote.to_string(),
        })
    }
}
