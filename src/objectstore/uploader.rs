//! Shared chassis for the upload drivers.
//!
//! Every uploader pairs a pipe writer (fed by the tee) with a background
//! driver task that consumes the read half. The chassis owns the settled
//! state: the recorded error, the remote ETag, and the `done` token that
//! flips once the driver finished. `close()` waits on that token, which
//! gives the ordering the pipeline relies on: the ETag is readable only
//! after the driver settled, and a finalization record can only be built
//! after `close()` returned.

use super::ObjectStoreError;
use crate::pipe::PipeWriter;
use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) struct UploadState {
    etag: Mutex<String>,
    error: Mutex<Option<ObjectStoreError>>,
    /// Cancelled when the driver task has settled, success or not.
    pub(crate) done: CancellationToken,
}

impl UploadState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            etag: Mutex::new(String::new()),
            error: Mutex::new(None),
            done: CancellationToken::new(),
        })
    }

    pub(crate) fn set_etag(&self, etag: &str) {
        *self.etag.lock().unwrap() = etag.to_string();
    }

    pub(crate) fn etag(&self) -> String {
        self.etag.lock().unwrap().clone()
    }

    pub(crate) fn error(&self) -> Option<ObjectStoreError> {
        self.error.lock().unwrap().clone()
    }

    /// Record the driver outcome and release everyone waiting on `done`.
    pub(crate) fn settle(&self, result: Result<(), ObjectStoreError>) {
        if let Err(err) = result {
            *self.error.lock().unwrap() = Some(err);
        }
        self.done.cancel();
    }
}

/// Writer-side handle the tee drives; the embedding uploader forwards its
/// `RemoteUpload` calls here.
pub(crate) struct UploadHandle {
    writer: Option<PipeWriter>,
    pub(crate) state: Arc<UploadState>,
}

impl UploadHandle {
    pub(crate) fn new(writer: PipeWriter, state: Arc<UploadState>) -> Self {
        Self {
            writer: Some(writer),
            state,
        }
    }

    pub(crate) async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| ObjectStoreError::Io("write after close".into()))?;
        if let Err(err) = writer.write(chunk).await {
            // The driver dropped the read half; surface its recorded error
            // rather than the bare broken pipe.
            return Err(self
                .state
                .error()
                .unwrap_or_else(|| ObjectStoreError::Io(err.to_string())));
        }
        Ok(())
    }

    /// Close the pipe and wait for the driver to settle.
    pub(crate) async fn close(&mut self) -> Result<(), ObjectStoreError> {
        if let Some(writer) = self.writer.take() {
            writer.close();
        }
        self.state.done.cancelled().await;
        match self.state.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn etag(&self) -> String {
        self.state.etag()
    }
}

/// Run a driver future bounded by the upload deadline and the surrounding
/// request scope. Deadline expiry and scope cancellation are both fatal
/// to the transfer and map to their own error kinds.
pub(crate) async fn drive<F>(
    scope: &CancellationToken,
    deadline: Instant,
    fut: F,
) -> Result<(), ObjectStoreError>
where
    F: Future<Output = Result<(), ObjectStoreError>>,
{
    tokio::select! {
        _ = scope.cancelled() => Err(ObjectStoreError::Canceled),
        outcome = tokio::time::timeout_at(deadline, fut) => match outcome {
            Err(_) => Err(ObjectStoreError::DeadlineExceeded),
            Ok(result) => result,
        },
    }
}

/// Best-effort DELETE used by the cleanup tasks. Runs on its own timeout
/// so it still completes after the request context is long gone.
pub(crate) async fn best_effort_delete(url: &str) {
    if url.is_empty() {
        return;
    }

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(60),
        super::http_client().delete(url).send(),
    )
    .await;

    match outcome {
        Ok(Ok(resp)) if resp.status().is_success() => {}
        Ok(Ok(resp)) => {
            tracing::warn!(status = %resp.status(), "object storage cleanup DELETE was rejected");
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "object storage cleanup DELETE failed");
        }
        Err(_) => {
            tracing::warn!("object storage cleanup DELETE timed out");
        }
    }
}
