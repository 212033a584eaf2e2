//! The upload ticket: everything the pipeline needs to know about where
//! one upload goes.

use crate::api;
use crate::config::S3Config;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Uploads that do not declare their own timeout get this one.
pub const DEFAULT_OBJECT_STORE_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// All the options available for saving a file.
///
/// Exactly one of the presigned PUT, the presigned multipart session, or
/// the native client is the primary destination; the local temp copy is
/// independent of all three.
#[derive(Debug, Clone)]
pub struct SaveFileOpts {
    /// Prefix for the local temporary file name.
    pub temp_file_prefix: String,

    /// Directory for the local copy; `None` disables the local sink.
    pub local_temp_path: Option<PathBuf>,

    /// Object id the application claims the upload under.
    pub remote_id: String,

    /// Final URL of the file.
    pub remote_url: String,

    /// Presigned single-PUT URL.
    pub presigned_put: String,

    /// Presigned delete URL, invoked on cleanup.
    pub presigned_delete: String,

    /// Headers sent with every PUT.
    pub put_headers: HashMap<String, String>,

    /// Skip the MD5/ETag comparison, including per part.
    pub skip_etag_verify: bool,

    /// Write with direct credentials instead of presigned URLs.
    pub use_native_client: bool,

    /// Temporary object name for the native client.
    pub remote_temp_object_id: String,

    /// Destination for the native client, credentials merged in by the
    /// preparer.
    pub object_storage_config: S3Config,

    /// The upload is aborted if not complete by this point.
    pub deadline: Instant,

    /// Exact size of each multipart part; only the last may be smaller.
    pub part_size: i64,

    /// Presigned URLs for each part, in order.
    pub presigned_parts: Vec<String>,

    /// Presigned CompleteMultipartUpload URL.
    pub presigned_complete_multipart: String,

    /// Presigned AbortMultipartUpload URL.
    pub presigned_abort_multipart: String,
}

impl SaveFileOpts {
    /// Translate an application authorization response into a ticket.
    pub fn from_response(response: &api::Response) -> SaveFileOpts {
        let remote = &response.remote_object;

        let timeout = if remote.timeout > 0 {
            Duration::from_secs(remote.timeout)
        } else {
            DEFAULT_OBJECT_STORE_TIMEOUT
        };

        // Applications predating deliberate header control get the
        // original default content type.
        let put_headers = if remote.custom_put_headers {
            remote.put_headers.clone()
        } else {
            let mut headers = HashMap::new();
            headers.insert(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            );
            headers
        };

        let mut opts = SaveFileOpts {
            temp_file_prefix: String::new(),
            local_temp_path: if response.temp_path.is_empty() {
                None
            } else {
                Some(PathBuf::from(&response.temp_path))
            },
            remote_id: remote.id.clone(),
            remote_url: remote.get_url.clone(),
            presigned_put: remote.store_url.clone(),
            presigned_delete: remote.delete_url.clone(),
            put_headers,
            skip_etag_verify: remote.skip_etag_verify,
            use_native_client: remote.use_native_client,
            remote_temp_object_id: remote.remote_temp_object_id.clone(),
            object_storage_config: S3Config::default(),
            deadline: Instant::now() + timeout,
            part_size: 0,
            presigned_parts: Vec::new(),
            presigned_complete_multipart: String::new(),
            presigned_abort_multipart: String::new(),
        };

        if let Some(params) = &remote.object_storage {
            if opts.use_native_client {
                opts.object_storage_config = params.s3_config.clone();
                if !params.provider.is_empty() {
                    opts.object_storage_config.provider = params.provider.clone();
                }
            }
        }

        if let Some(multipart) = &remote.multipart_upload {
            opts.part_size = multipart.part_size;
            opts.presigned_parts = multipart.part_urls.clone();
            opts.presigned_complete_multipart = multipart.complete_url.clone();
            opts.presigned_abort_multipart = multipart.abort_url.clone();
        }

        opts
    }

    /// Whether a local copy is written.
    pub fn is_local(&self) -> bool {
        self.local_temp_path.is_some()
    }

    /// Whether the upload goes to remote storage via presigned URLs.
    pub fn is_remote(&self) -> bool {
        !self.presigned_put.is_empty() || self.is_multipart()
    }

    /// Whether the presigned multipart session is in play.
    pub fn is_multipart(&self) -> bool {
        self.part_size > 0
    }

    /// Whether the ticket is complete enough for the native client.
    pub fn use_native_client_enabled(&self) -> bool {
        self.use_native_client
            && self.object_storage_config.is_valid()
            && !self.remote_temp_object_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MultipartUploadParams, ObjectStorageParams, RemoteObject, Response};

    fn base_response() -> Response {
        Response {
            temp_path: String::new(),
            remote_object: RemoteObject {
                id: "oid".into(),
                get_url: "https://store/read".into(),
                store_url: "https://store/put".into(),
                delete_url: "https://store/delete".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn defaults_content_type_without_custom_headers() {
        let opts = SaveFileOpts::from_response(&base_response());
        assert_eq!(
            opts.put_headers.get("Content-Type").map(String::as_str),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn keeps_custom_headers_when_declared() {
        let mut response = base_response();
        response.remote_object.custom_put_headers = true;
        response
            .remote_object
            .put_headers
            .insert("Content-Type".into(), "image/png".into());

        let opts = SaveFileOpts::from_response(&response);
        assert_eq!(
            opts.put_headers.get("Content-Type").map(String::as_str),
            Some("image/png")
        );
    }

    #[test]
    fn classifies_destinations() {
        let mut response = base_response();
        response.temp_path = "/var/tmp/uploads".into();
        let opts = SaveFileOpts::from_response(&response);
        assert!(opts.is_local());
        assert!(opts.is_remote());
        assert!(!opts.is_multipart());

        response.remote_object.store_url.clear();
        response.remote_object.multipart_upload = Some(MultipartUploadParams {
            part_size: 1024,
            part_urls: vec!["https://s3/p1".into()],
            complete_url: "https://s3/complete".into(),
            abort_url: "https://s3/abort".into(),
        });
        let opts = SaveFileOpts::from_response(&response);
        assert!(opts.is_multipart());
        assert!(opts.is_remote());
    }

    #[test]
    fn native_client_needs_valid_destination() {
        let mut response = base_response();
        response.remote_object.use_native_client = true;
        response.remote_object.remote_temp_object_id = "tmp/object".into();
        let opts = SaveFileOpts::from_response(&response);
        assert!(!opts.use_native_client_enabled());

        response.remote_object.object_storage = Some(ObjectStorageParams {
            name: "default".into(),
            provider: "AWS".into(),
            s3_config: crate::config::S3Config {
                region: "us-east-1".into(),
                bucket: "uploads".into(),
                ..Default::default()
            },
        });
        let opts = SaveFileOpts::from_response(&response);
        assert!(opts.use_native_client_enabled());
    }
}
