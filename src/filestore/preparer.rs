//! Seams between the authorization round-trip and the pipeline.

use super::{FileHandler, FileStoreError, SaveFileOpts};
use crate::api;
use crate::config::Config;

/// Post-upload validation hook. Runs after the tee completed and can
/// reject the upload before a finalization record is produced.
pub trait UploadVerifier: Send + Sync {
    fn verify(&self, handler: &FileHandler) -> Result<(), FileStoreError>;
}

/// Requires the streamed content to match the object id (`sha256`) and
/// size that a content-addressed transfer protocol declared up front.
pub struct ChecksumVerifier {
    pub oid: String,
    pub size: i64,
}

impl UploadVerifier for ChecksumVerifier {
    fn verify(&self, handler: &FileHandler) -> Result<(), FileStoreError> {
        if !handler.sha256().eq_ignore_ascii_case(&self.oid) {
            return Err(FileStoreError::Verification(format!(
                "sha256 mismatch: expected {}, got {}",
                self.oid,
                handler.sha256()
            )));
        }
        if handler.size != self.size {
            return Err(FileStoreError::Verification(format!(
                "size mismatch: expected {}, got {}",
                self.size, handler.size
            )));
        }
        Ok(())
    }
}

/// Turns an authorization response into the ticket the pipeline runs on,
/// optionally with a verifier to run afterwards.
pub trait UploadPreparer: Send + Sync {
    fn prepare(
        &self,
        response: &api::Response,
    ) -> Result<(SaveFileOpts, Option<Box<dyn UploadVerifier>>), FileStoreError>;
}

/// The default preparer: builds the ticket from the response and merges
/// in the process-level storage credentials for the native client.
pub struct ObjectStoragePreparer {
    config: Config,
}

impl ObjectStoragePreparer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl UploadPreparer for ObjectStoragePreparer {
    fn prepare(
        &self,
        response: &api::Response,
    ) -> Result<(SaveFileOpts, Option<Box<dyn UploadVerifier>>), FileStoreError> {
        let mut opts = SaveFileOpts::from_response(response);

        if opts.use_native_client {
            let name = response
                .remote_object
                .object_storage
                .as_ref()
                .map(|params| params.name.as_str())
                .unwrap_or("default");

            if let Some(table) = self.config.object_storage(name) {
                let dest = &mut opts.object_storage_config;
                // The application never ships secrets; credentials always
                // come from the table. Destination fields it left empty
                // fall back to the table as well.
                dest.access_key = table.access_key.clone();
                dest.secret_key = table.secret_key.clone();
                if dest.region.is_empty() {
                    dest.region = table.region.clone();
                }
                if dest.bucket.is_empty() {
                    dest.bucket = table.bucket.clone();
                }
                if dest.endpoint.is_none() {
                    dest.endpoint = table.endpoint.clone();
                }
                if !dest.path_style {
                    dest.path_style = table.path_style;
                }
            }
        }

        Ok((opts, None))
    }
}
