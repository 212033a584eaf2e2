//! Natively-signed S3 upload, used when the ticket carries credentials
//! instead of presigned URLs.

use super::uploader::{drive, UploadHandle, UploadState};
use super::{ObjectStoreError, RemoteUpload};
use crate::config::S3Config;
use crate::metrics;
use crate::pipe;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Smallest part the store accepts for a non-final multipart part.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Build the store client from the ticket's S3 configuration.
fn build_store(config: &S3Config) -> Result<AmazonS3, ObjectStoreError> {
    if !config.is_valid() {
        return Err(ObjectStoreError::Configuration(
            "object storage config needs a bucket and a region".into(),
        ));
    }

    let mut builder = AmazonS3Builder::new()
        .with_region(&config.region)
        .with_bucket_name(&config.bucket)
        .with_virtual_hosted_style_request(!config.path_style);

    if let Some(endpoint) = &config.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }

    // Fall back to ambient credentials (instance profiles) when no static
    // keys were supplied.
    if !config.access_key.is_empty() || !config.secret_key.is_empty() {
        builder = builder
            .with_access_key_id(&config.access_key)
            .with_secret_access_key(&config.secret_key);
    }

    builder
        .build()
        .map_err(|err| ObjectStoreError::Configuration(err.to_string()))
}

/// Streams an upload to `bucket/object_name` with the store's own
/// multipart framing. On failure, or once the surrounding scope ends,
/// the stored object is deleted by key; that is how orphans left behind
/// by an application-side failure get collected.
pub struct S3Object {
    handle: UploadHandle,
}

impl S3Object {
    pub fn new(
        scope: &CancellationToken,
        object_name: String,
        config: S3Config,
        deadline: Instant,
    ) -> Result<S3Object, ObjectStoreError> {
        let store = build_store(&config)?;
        let (writer, reader) = pipe::pipe();
        let state = UploadState::new();

        metrics::OBJECT_STORAGE_UPLOADS_OPEN.inc();

        {
            let state = state.clone();
            let scope = scope.clone();
            let store = store.clone();
            let path = Path::from(object_name.clone());
            let started = Instant::now();
            tokio::spawn(async move {
                state.done.cancelled().await;
                metrics::observe_upload_time(started.elapsed().as_secs_f64());

                if state.error().is_some() {
                    metrics::record_request_failed();
                    delete_object(&store, &path).await;
                    return;
                }

                scope.cancelled().await;
                delete_object(&store, &path).await;
            });
        }

        {
            let state = state.clone();
            let scope = scope.clone();
            let path = Path::from(object_name);
            tokio::spawn(async move {
                let result = drive(&scope, deadline, async {
                    let mut upload = store
                        .put_multipart(&path)
                        .await
                        .map_err(|err| ObjectStoreError::Request(err.to_string()))?;

                    match stream_parts(upload.as_mut(), reader).await {
                        Ok(()) => {
                            upload
                                .complete()
                                .await
                                .map_err(|err| ObjectStoreError::Request(err.to_string()))?;
                            Ok(())
                        }
                        Err(err) => {
                            if let Err(abort_err) = upload.abort().await {
                                tracing::warn!(error = %abort_err, "abort native multipart upload failed");
                            }
                            Err(err)
                        }
                    }
                })
                .await;

                if result.is_err() {
                    tracing::info!(error = ?result.as_ref().err(), "native S3 upload failed");
                }
                metrics::OBJECT_STORAGE_UPLOADS_OPEN.dec();
                state.settle(result);
            });
        }

        Ok(S3Object {
            handle: UploadHandle::new(writer, state),
        })
    }
}

/// Buffer pipe chunks into store-sized parts and hand them to the upload.
async fn stream_parts(
    upload: &mut dyn MultipartUpload,
    mut reader: pipe::PipeReader,
) -> Result<(), ObjectStoreError> {
    let mut buffer: Vec<u8> = Vec::with_capacity(MIN_PART_SIZE);
    let mut parts = 0usize;

    while let Some(chunk) = reader.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        while buffer.len() >= MIN_PART_SIZE {
            let part: Vec<u8> = buffer.drain(..MIN_PART_SIZE).collect();
            upload
                .put_part(PutPayload::from(part))
                .await
                .map_err(|err| ObjectStoreError::Request(err.to_string()))?;
            parts += 1;
        }
    }

    // The store wants at least one part, even for an empty object.
    if !buffer.is_empty() || parts == 0 {
        upload
            .put_part(PutPayload::from(std::mem::take(&mut buffer)))
            .await
            .map_err(|err| ObjectStoreError::Request(err.to_string()))?;
    }

    Ok(())
}

async fn delete_object(store: &AmazonS3, path: &Path) {
    match tokio::time::timeout(Duration::from_secs(60), store.delete(path)).await {
        Ok(Ok(())) => {}
        Ok(Err(object_store::Error::NotFound { .. })) => {}
        Ok(Err(err)) => {
            tracing::warn!(key = %path, error = %err, "delete stored object failed");
        }
        Err(_) => {
            tracing::warn!(key = %path, "delete stored object timed out");
        }
    }
}

#[async_trait]
impl RemoteUpload for S3Object {
    async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError> {
        self.handle.write(chunk).await
    }

    async fn close(&mut self) -> Result<(), ObjectStoreError> {
        self.handle.close().await
    }

    fn etag(&self) -> String {
        self.handle.etag()
    }
}
