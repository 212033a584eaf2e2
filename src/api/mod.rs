//! Authorization response the application returns when asked whether an
//! upload may proceed. The preparer translates this into the pipeline's
//! ticket.

use crate::config::S3Config;
use serde::Deserialize;
use std::collections::HashMap;

/// Top-level authorization response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Response {
    /// Directory for a local temporary copy; empty disables the local sink.
    #[serde(default)]
    pub temp_path: String,

    #[serde(default)]
    pub remote_object: RemoteObject,
}

/// Where and how the object lands in remote storage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteObject {
    /// Opaque id the application uses to claim the uploaded object.
    #[serde(default)]
    pub id: String,

    /// URL the application will later read the object from.
    #[serde(default)]
    pub get_url: String,

    /// Presigned single-PUT URL.
    #[serde(default)]
    pub store_url: String,

    /// Presigned delete URL invoked on cleanup.
    #[serde(default)]
    pub delete_url: String,

    /// Headers applied to every PUT.
    #[serde(default)]
    pub put_headers: HashMap<String, String>,

    /// Whether `put_headers` was deliberately set by the application.
    /// Responses from servers predating that field get a default
    /// `Content-Type` instead.
    #[serde(default)]
    pub custom_put_headers: bool,

    /// Presigned multipart session, when the object is too large for a
    /// single PUT.
    #[serde(default)]
    pub multipart_upload: Option<MultipartUploadParams>,

    /// Disable the MD5/ETag comparison for providers that do not return
    /// content MD5s as ETags.
    #[serde(default)]
    pub skip_etag_verify: bool,

    /// Bypass presigned URLs and write with direct credentials.
    #[serde(default)]
    pub use_native_client: bool,

    /// Temporary object name for the native client.
    #[serde(default)]
    pub remote_temp_object_id: String,

    /// Storage destination for the native client.
    #[serde(default)]
    pub object_storage: Option<ObjectStorageParams>,

    /// Upload deadline in seconds; zero selects the default.
    #[serde(default)]
    pub timeout: u64,
}

/// Presigned multipart session parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultipartUploadParams {
    /// Exact size of every part; only the last may be smaller.
    #[serde(default)]
    pub part_size: i64,

    /// Ordered presigned URLs, one per part.
    #[serde(default)]
    pub part_urls: Vec<String>,

    #[serde(default)]
    pub complete_url: String,

    #[serde(default)]
    pub abort_url: String,
}

/// Native-client storage selection.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStorageParams {
    /// Name of the `[object_storage.<name>]` config table holding the
    /// credentials.
    #[serde(default = "default_storage_name")]
    pub name: String,

    #[serde(default)]
    pub provider: String,

    /// Destination overrides; fields left empty fall back to the config
    /// table.
    #[serde(default)]
    pub s3_config: S3Config,
}

impl Default for ObjectStorageParams {
    fn default() -> Self {
        Self {
            name: default_storage_name(),
            provider: String::new(),
            s3_config: S3Config::default(),
        }
    }
}

fn default_storage_name() -> String {
    "default".to_string()
}
