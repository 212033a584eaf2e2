//! Single presigned PUT upload.

use super::uploader::{best_effort_delete, drive, UploadHandle, UploadState};
use super::{compare_md5, http_client, strip_etag_quotes, ObjectStoreError, RemoteUpload};
use crate::metrics;
use crate::pipe;
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use reqwest::header::{CONTENT_LENGTH, ETAG};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Streams an upload to one presigned PUT URL.
///
/// Bytes written here flow through a pipe into the HTTP request body; the
/// request is driven by a background task that settles once the remote
/// answered. Unless disabled, the remote ETag must equal the MD5 of the
/// streamed bytes. When the surrounding scope ends the object is removed
/// via the presigned delete URL, whether or not the upload succeeded.
pub struct Object {
    handle: UploadHandle,
    md5: Arc<Mutex<Md5>>,
}

impl Object {
    /// Open the upload. The HTTP request starts immediately and consumes
    /// the pipe until [`RemoteUpload::close`] is called.
    pub fn new(
        scope: &CancellationToken,
        put_url: String,
        delete_url: String,
        put_headers: &HashMap<String, String>,
        deadline: Instant,
        size: i64,
        skip_etag_verify: bool,
    ) -> Object {
        Self::new_inner(
            scope,
            put_url,
            delete_url,
            put_headers,
            deadline,
            size,
            skip_etag_verify,
            true,
        )
    }

    /// Variant used for the parts of a multipart session: no cleanup URL
    /// and no per-upload metrics, which belong to the session as a whole.
    pub(crate) fn new_part(
        scope: &CancellationToken,
        put_url: String,
        put_headers: &HashMap<String, String>,
        deadline: Instant,
        size: i64,
        skip_etag_verify: bool,
    ) -> Object {
        Self::new_inner(
            scope,
            put_url,
            String::new(),
            put_headers,
            deadline,
            size,
            skip_etag_verify,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new_inner(
        scope: &CancellationToken,
        put_url: String,
        delete_url: String,
        put_headers: &HashMap<String, String>,
        deadline: Instant,
        size: i64,
        skip_etag_verify: bool,
        with_metrics: bool,
    ) -> Object {
        let (writer, reader) = pipe::pipe();
        let state = UploadState::new();
        let md5 = Arc::new(Mutex::new(Md5::new()));

        if with_metrics {
            metrics::OBJECT_STORAGE_UPLOADS_OPEN.inc();
        }

        // Cleanup: wait for the driver to settle, then for the request
        // scope to end, then remove the remote object.
        {
            let state = state.clone();
            let scope = scope.clone();
            let started = Instant::now();
            tokio::spawn(async move {
                state.done.cancelled().await;
                if with_metrics {
                    metrics::observe_upload_time(started.elapsed().as_secs_f64());
                }
                scope.cancelled().await;
                best_effort_delete(&delete_url).await;
            });
        }

        // Driver: run the PUT with the pipe as its body.
        {
            let state = state.clone();
            let scope = scope.clone();
            let md5 = md5.clone();
            let headers = put_headers.clone();
            tokio::spawn(async move {
                let result = drive(&scope, deadline, async {
                    let mut req = http_client().put(&put_url);
                    for (name, value) in &headers {
                        req = req.header(name.as_str(), value.as_str());
                    }
                    if size >= 0 {
                        req = req.header(CONTENT_LENGTH, size);
                    }

                    let resp = req
                        .body(reqwest::Body::wrap_stream(reader))
                        .send()
                        .await
                        .map_err(|err| {
                            metrics::record_request_failed();
                            ObjectStoreError::from(err)
                        })?;

                    if !resp.status().is_success() {
                        metrics::record_invalid_status();
                        return Err(ObjectStoreError::StatusCode {
                            status: resp.status().as_u16(),
                        });
                    }

                    let etag = resp
                        .headers()
                        .get(ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(strip_etag_quotes)
                        .unwrap_or_default()
                        .to_string();
                    state.set_etag(&etag);

                    if !skip_etag_verify {
                        let local = hex::encode(md5.lock().unwrap().clone().finalize());
                        compare_md5(&local, &etag)?;
                    }
                    Ok(())
                })
                .await;

                if result.is_err() {
                    tracing::info!(error = ?result.as_ref().err(), "object storage PUT failed");
                }
                if with_metrics {
                    metrics::OBJECT_STORAGE_UPLOADS_OPEN.dec();
                }
                state.settle(result);
            });
        }

        Object {
            handle: UploadHandle::new(writer, state),
            md5,
        }
    }
}

#[async_trait]
impl RemoteUpload for Object {
    async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError> {
        self.md5.lock().unwrap().update(&chunk);
        self.handle.write(chunk).await
    }

    async fn close(&mut self) -> Result<(), ObjectStoreError> {
        self.handle.close().await
    }

    fn etag(&self) -> String {
        self.handle.etag()
    }
}
