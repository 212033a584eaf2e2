//! Presigned multipart upload session.

use super::object::Object;
use super::uploader::{best_effort_delete, drive, UploadHandle, UploadState};
use super::{compare_md5, http_client, strip_etag_quotes, ObjectStoreError, RemoteUpload};
use crate::metrics;
use crate::pipe::{self, CHUNK_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One entry of the completion document: the 1-based part number and the
/// ETag the remote returned for that part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePart {
    #[serde(rename = "PartNumber")]
    pub part_number: usize,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// The `CompleteMultipartUpload` document POSTed once every part is in.
#[derive(Debug, Default, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUpload {
    #[serde(rename = "Part")]
    pub parts: Vec<CompletePart>,
}

impl CompleteMultipartUpload {
    /// The composite ETag S3 assigns a multipart object:
    /// `hex(md5(concat(md5(part_1) .. md5(part_n)))) + "-" + n`,
    /// computed here from the recorded part ETags.
    pub fn build_etag(&self) -> Result<String, ObjectStoreError> {
        let mut hasher = Md5::new();
        for part in &self.parts {
            let digest = hex::decode(strip_etag_quotes(&part.etag)).map_err(|err| {
                ObjectStoreError::InvalidETag(format!(
                    "part {}: {} ({err})",
                    part.part_number, part.etag
                ))
            })?;
            hasher.update(&digest);
        }
        Ok(format!(
            "{}-{}",
            hex::encode(hasher.finalize()),
            self.parts.len()
        ))
    }
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

/// Decode the completion response. Some S3-compatible servers answer
/// HTTP 200 with an `<Error>` document instead of a result; both roots
/// are accepted and the error shape is treated as a failure.
fn decode_complete_response(body: &str) -> Result<String, ObjectStoreError> {
    let mut doc = body.trim_start();
    if doc.starts_with("<?xml") {
        match doc.find("?>") {
            Some(end) => doc = doc[end + 2..].trim_start(),
            None => return Err(ObjectStoreError::Xml("unterminated declaration".into())),
        }
    }

    if doc.starts_with("<Error") {
        let err: RemoteErrorBody =
            quick_xml::de::from_str(doc).map_err(|e| ObjectStoreError::Xml(e.to_string()))?;
        return Err(ObjectStoreError::Remote {
            code: err.code,
            message: err.message,
        });
    }

    let result: CompleteMultipartUploadResult =
        quick_xml::de::from_str(doc).map_err(|e| ObjectStoreError::Xml(e.to_string()))?;
    Ok(strip_etag_quotes(&result.etag).to_string())
}

/// Streams an upload as a presigned multipart session.
///
/// Bytes are sliced into `part_size` runs, each buffered to disk and PUT
/// to its own presigned URL. Writing more than
/// `part_size * part_urls.len()` bytes fails the session with
/// [`ObjectStoreError::NotEnoughParts`]. On any failure the abort URL and
/// then the delete URL are invoked; on success the delete URL is invoked
/// once the surrounding scope ends.
pub struct Multipart {
    handle: UploadHandle,
}

impl Multipart {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: &CancellationToken,
        part_urls: Vec<String>,
        complete_url: String,
        abort_url: String,
        delete_url: String,
        put_headers: &HashMap<String, String>,
        deadline: Instant,
        part_size: i64,
        skip_etag_verify: bool,
    ) -> Multipart {
        let (writer, reader) = pipe::pipe();
        let state = UploadState::new();

        metrics::OBJECT_STORAGE_UPLOADS_OPEN.inc();

        {
            let state = state.clone();
            let scope = scope.clone();
            let started = Instant::now();
            tokio::spawn(async move {
                state.done.cancelled().await;
                metrics::observe_upload_time(started.elapsed().as_secs_f64());

                if state.error().is_some() {
                    metrics::record_request_failed();
                    best_effort_delete(&abort_url).await;
                    best_effort_delete(&delete_url).await;
                    return;
                }

                // The upload is durable; the object is handed off to the
                // application. Delete it once the scope is done with it.
                scope.cancelled().await;
                best_effort_delete(&delete_url).await;
            });
        }

        {
            let state = state.clone();
            let scope = scope.clone();
            let headers = put_headers.clone();
            tokio::spawn(async move {
                let driver_scope = scope.clone();
                let result = drive(&scope, deadline, async {
                    let mut src = reader.into_async_read();
                    let mut cmu = CompleteMultipartUpload::default();

                    for (index, part_url) in part_urls.iter().enumerate() {
                        let part = upload_one_part(
                            &driver_scope,
                            part_url,
                            &headers,
                            &mut src,
                            index + 1,
                            deadline,
                            part_size,
                            skip_etag_verify,
                        )
                        .await?;
                        match part {
                            Some(part) => cmu.parts.push(part),
                            None => break,
                        }
                    }

                    let surplus = tokio::io::copy(&mut src, &mut tokio::io::sink()).await?;
                    if surplus > 0 {
                        return Err(ObjectStoreError::NotEnoughParts);
                    }

                    let remote_etag = complete_session(&complete_url, &cmu).await?;
                    state.set_etag(&remote_etag);

                    if !skip_etag_verify {
                        compare_md5(&cmu.build_etag()?, &remote_etag)?;
                    }
                    Ok(())
                })
                .await;

                if result.is_err() {
                    tracing::info!(error = ?result.as_ref().err(), "multipart upload failed");
                }
                metrics::OBJECT_STORAGE_UPLOADS_OPEN.dec();
                state.settle(result);
            });
        }

        Multipart {
            handle: UploadHandle::new(writer, state),
        }
    }
}

#[async_trait]
impl RemoteUpload for Multipart {
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

/// Buffer up to `part_size` bytes to disk and PUT them to the part URL.
/// Returns `None` when the source was already exhausted.
#[allow(clippy::too_many_arguments)]
async fn upload_one_part<R: AsyncRead + Unpin>(
    scope: &CancellationToken,
    part_url: &str,
    put_headers: &HashMap<String, String>,
    src: &mut R,
    part_number: usize,
    deadline: Instant,
    part_size: i64,
    skip_etag_verify: bool,
) -> Result<Option<CompletePart>, ObjectStoreError> {
    let path = std::env::temp_dir().join(format!("part-buffer-{}", Uuid::new_v4()));

    let outcome = buffer_and_put(
        scope,
        part_url,
        put_headers,
        src,
        part_number,
        deadline,
        part_size,
        skip_etag_verify,
        &path,
    )
    .await;

    if let Err(err) = tokio::fs::remove_file(&path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file = %path.display(), error = %err, "unable to delete part buffer");
        }
    }

    outcome
}

#[allow(clippy::too_many_arguments)]
async fn buffer_and_put<R: AsyncRead + Unpin>(
    scope: &CancellationToken,
    part_url: &str,
    put_headers: &HashMap<String, String>,
    src: &mut R,
    part_number: usize,
    deadline: Instant,
    part_size: i64,
    skip_etag_verify: bool,
    path: &PathBuf,
) -> Result<Option<CompletePart>, ObjectStoreError> {
    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let mut limited = src.take(part_size as u64);
    let buffered = tokio::io::copy(&mut limited, &mut file).await?;
    if buffered == 0 {
        return Ok(None);
    }
    file.flush().await?;
    file.seek(SeekFrom::Start(0)).await?;

    let mut part = Object::new_part(
        scope,
        part_url.to_string(),
        put_headers,
        deadline,
        buffered as i64,
        skip_etag_verify,
    );

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        part.write(Bytes::copy_from_slice(&buf[..read])).await?;
    }
    part.close().await?;

    Ok(Some(CompletePart {
        part_number,
        etag: part.etag(),
    }))
}

/// POST the completion document and return the remote's composite ETag.
async fn complete_session(
    complete_url: &str,
    cmu: &CompleteMultipartUpload,
) -> Result<String, ObjectStoreError> {
    let body =
        quick_xml::se::to_string(cmu).map_err(|err| ObjectStoreError::Xml(err.to_string()))?;

    let resp = http_client()
        .post(complete_url)
        .header(CONTENT_TYPE, "application/xml")
        .body(body)
        .send()
        .await?;

    if !resp.status().is_success() {
        metrics::record_invalid_status();
        return Err(ObjectStoreError::StatusCode {
            status: resp.status().as_u16(),
        });
    }

    let text = resp.text().await?;
    decode_complete_response(&text)
}
