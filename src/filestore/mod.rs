//! Saving an upload to its destinations and describing the result.
//!
//! [`save_file_from_reader`] tees one inbound byte stream to content
//! hashes, an optional local temp file, and at most one object storage
//! uploader, then hands back a [`FileHandler`] the surrounding request
//! handler forwards to the application as signed finalization fields.

use crate::objectstore::ObjectStoreError;
use crate::secret::{self, SecretError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

mod preparer;
mod save_file;
mod save_opts;

pub use preparer::{ChecksumVerifier, ObjectStoragePreparer, UploadPreparer, UploadVerifier};
pub use save_file::{save_file_from_disk, save_file_from_reader};
pub use save_opts::{SaveFileOpts, DEFAULT_OBJECT_STORE_TIMEOUT};

/// Form field carrying the signed finalization token.
pub const SIGNED_UPLOAD_FIELD: &str = "windlass-upload";

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("expected {expected} bytes but got {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error("entity is too large")]
    EntityTooLarge,

    #[error("missing upload destination")]
    MissingDestination,

    #[error("upload verification failed: {0}")]
    Verification(String),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("local file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sign(#[from] SecretError),
}

/// Claims of the finalization token: the upload fields under `upload`,
/// plus standard issuer and expiry.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadClaims {
    pub upload: BTreeMap<String, String>,
    pub iss: String,
    pub exp: u64,
}

/// A file that went through the pipeline: where it landed, how big it
/// was, and what it hashed to.
#[derive(Debug, Default)]
pub struct FileHandler {
    /// Path of the local temporary copy, when one was written.
    pub local_path: Option<String>,

    /// Object id the application claims the upload under.
    pub remote_id: String,

    /// URL the application reads the object from.
    pub remote_url: String,

    /// Bytes actually copied; every sink observed exactly this count.
    pub size: i64,

    /// Resource name reported back to the application. Distinct from any
    /// real file name so concurrent uploads cannot collide.
    pub name: String,

    pub(crate) hashes: HashMap<String, String>,
}

impl FileHandler {
    /// MD5 hash of the handled file.
    pub fn md5(&self) -> &str {
        self.hash("md5")
    }

    /// SHA256 hash of the handled file.
    pub fn sha256(&self) -> &str {
        self.hash("sha256")
    }

    /// ETag the remote assigned, when a remote sink was used.
    pub fn etag(&self) -> &str {
        self.hash("etag")
    }

    fn hash(&self, name: &str) -> &str {
        self.hashes.get(name).map(String::as_str).unwrap_or("")
    }

    /// The field map the request handler merges into the outbound request
    /// to the application, including the signed token under
    /// `<prefix>` + [`SIGNED_UPLOAD_FIELD`].
    pub fn finalize_fields(&self, prefix: &str) -> Result<HashMap<String, String>, FileStoreError> {
        let key = |field: &str| {
            if prefix.is_empty() {
                field.to_string()
            } else {
                format!("{prefix}.{field}")
            }
        };

        let mut data = HashMap::new();
        let mut signed = BTreeMap::new();

        let size = self.size.to_string();
        let path = self.local_path.clone().unwrap_or_default();
        for (field, value) in [
            ("name", self.name.as_str()),
            ("path", path.as_str()),
            ("remote_url", self.remote_url.as_str()),
            ("remote_id", self.remote_id.as_str()),
            ("size", size.as_str()),
        ] {
            data.insert(key(field), value.to_string());
            signed.insert(field.to_string(), value.to_string());
        }

        for (name, hash) in &self.hashes {
            data.insert(key(name), hash.clone());
            signed.insert(name.clone(), hash.clone());
        }

        let claims = UploadClaims {
            upload: signed,
            iss: secret::ISSUER.to_string(),
            exp: secret::token_expiry(),
        };
        data.insert(key(SIGNED_UPLOAD_FIELD), secret::sign(&claims)?);

        Ok(data)
    }
}
