//! The tee: copy one inbound stream to every configured sink.

use super::{FileHandler, FileStoreError, SaveFileOpts};
use crate::hash::MultiHash;
use crate::objectstore::{Multipart, Object, ObjectStoreError, RemoteUpload, S3Object};
use crate::pipe::CHUNK_SIZE;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Persist `reader` to every destination the ticket configures and
/// return the description of what was stored.
///
/// `size` is the declared content length, or `-1` when unknown; a
/// declared size that does not match the observed byte count fails the
/// upload. `scope` is the surrounding request scope: the caller cancels
/// it once the application has claimed (or abandoned) the object, which
/// releases the local temp file and the remote copy. Cancelling it
/// mid-copy aborts the upload.
#[tracing::instrument(
    name = "filestore.save_file",
    skip(scope, reader, opts),
    fields(
        upload.remote_id = %opts.remote_id,
        upload.declared_size = size,
        upload.size = tracing::field::Empty,
    ),
    err
)]
pub async fn save_file_from_reader<R>(
    scope: &CancellationToken,
    mut reader: R,
    size: i64,
    opts: &SaveFileOpts,
) -> Result<FileHandler, FileStoreError>
where
    R: AsyncRead + Unpin,
{
    let mut fh = FileHandler {
        name: opts.temp_file_prefix.clone(),
        remote_id: opts.remote_id.clone(),
        remote_url: opts.remote_url.clone(),
        ..Default::default()
    };

    let mut remote = open_remote(scope, size, opts)?;

    let mut local = match &opts.local_temp_path {
        Some(dir) => {
            let sink = LocalFileSink::create(scope, dir, &opts.temp_file_prefix).await?;
            fh.local_path = Some(sink.path.to_string_lossy().into_owned());
            Some(sink)
        }
        None => None,
    };

    if remote.is_none() && local.is_none() {
        return Err(FileStoreError::MissingDestination);
    }

    // The tee proper: each chunk goes to the hashes, then the local
    // copy, then the remote, in that order, so no sink ever sees bytes
    // another has not.
    let mut hashes = MultiHash::new();
    let mut copied: i64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        hashes.update(&chunk);
        if let Some(local) = &mut local {
            local.write(&chunk).await?;
        }
        if let Some(remote) = &mut remote {
            remote.write(chunk).await?;
        }
        copied += n as i64;
    }

    fh.size = copied;
    tracing::Span::current().record("upload.size", copied);

    if size != -1 && size != copied {
        return Err(FileStoreError::SizeMismatch {
            expected: size,
            actual: copied,
        });
    }

    fh.hashes = hashes.finish();

    if let Some(local) = &mut local {
        local.close().await?;
    }

    if let Some(remote) = &mut remote {
        // Closing settles the transfer; only then is the ETag readable.
        match remote.close().await {
            Err(ObjectStoreError::NotEnoughParts) => return Err(FileStoreError::EntityTooLarge),
            Err(err) => return Err(err.into()),
            Ok(()) => {
                let etag = remote.etag();
                if !etag.is_empty() {
                    fh.hashes.insert("etag".to_string(), etag);
                }
            }
        }
    }

    Ok(fh)
}

/// Open the local file `path` and run it through the pipeline.
pub async fn save_file_from_disk(
    scope: &CancellationToken,
    path: impl AsRef<Path>,
    opts: &SaveFileOpts,
) -> Result<FileHandler, FileStoreError> {
    let file = tokio::fs::File::open(path.as_ref()).await?;
    let size = file.metadata().await?.len() as i64;
    save_file_from_reader(scope, file, size, opts).await
}

/// Pick the primary remote destination the ticket configures.
fn open_remote(
    scope: &CancellationToken,
    size: i64,
    opts: &SaveFileOpts,
) -> Result<Option<Box<dyn RemoteUpload>>, FileStoreError> {
    if opts.use_native_client_enabled() {
        let upload = S3Object::new(
            scope,
            opts.remote_temp_object_id.clone(),
            opts.object_storage_config.clone(),
            opts.deadline,
        )?;
        return Ok(Some(Box::new(upload)));
    }

    if opts.is_multipart() {
        let upload = Multipart::new(
            scope,
            opts.presigned_parts.clone(),
            opts.presigned_complete_multipart.clone(),
            opts.presigned_abort_multipart.clone(),
            opts.presigned_delete.clone(),
            &opts.put_headers,
            opts.deadline,
            opts.part_size,
            opts.skip_etag_verify,
        );
        return Ok(Some(Box::new(upload)));
    }

    if !opts.presigned_put.is_empty() {
        let upload = Object::new(
            scope,
            opts.presigned_put.clone(),
            opts.presigned_delete.clone(),
            &opts.put_headers,
            opts.deadline,
            size,
            opts.skip_etag_verify,
        );
        return Ok(Some(Box::new(upload)));
    }

    Ok(None)
}

/// Local temp copy of the upload. The file is removed by a background
/// task once the surrounding scope ends; by then the application has
/// either moved it or no longer wants it.
struct LocalFileSink {
    file: tokio::fs::File,
    path: PathBuf,
}

impl LocalFileSink {
    async fn create(
        scope: &CancellationToken,
        dir: &Path,
        prefix: &str,
    ) -> Result<LocalFileSink, FileStoreError> {
        create_private_dir(dir)?;

        let path = dir.join(format!("{prefix}{}", Uuid::new_v4()));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        {
            let scope = scope.clone();
            let path = path.clone();
            tokio::spawn(async move {
                scope.cancelled().await;
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove local temp file");
                    }
                }
            });
        }

        Ok(LocalFileSink { file, path })
    }

    async fn write(&mut self, chunk: &Bytes) -> Result<(), FileStoreError> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FileStoreError> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Create the temp directory with owner-only access if it is missing.
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::time::{Duration, Instant};

    fn local_only_opts(dir: PathBuf) -> SaveFileOpts {
        SaveFileOpts {
            temp_file_prefix: "upload".into(),
            local_temp_path: Some(dir),
            remote_id: String::new(),
            remote_url: String::new(),
            presigned_put: String::new(),
            presigned_delete: String::new(),
            put_headers: HashMap::new(),
            skip_etag_verify: false,
            use_native_client: false,
            remote_temp_object_id: String::new(),
            object_storage_config: Default::default(),
            deadline: Instant::now() + Duration::from_secs(60),
            part_size: 0,
            presigned_parts: Vec::new(),
            presigned_complete_multipart: String::new(),
            presigned_abort_multipart: String::new(),
        }
    }

    #[tokio::test]
    async fn local_copy_and_hashes() {
        let dir = std::env::temp_dir().join(format!("windlass-test-{}", Uuid::new_v4()));
        let scope = CancellationToken::new();
        let opts = local_only_opts(dir.clone());

        let fh = save_file_from_reader(&scope, &b"hello"[..], 5, &opts)
            .await
            .unwrap();

        assert_eq!(fh.size, 5);
        assert_eq!(fh.md5(), "5d41402abc4b2a76b9719d911017c592");
        let path = fh.local_path.clone().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        // Ending the scope removes the temp copy.
        scope.cancel();
        for _ in 0..50 {
            if !std::path::Path::new(&path).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!std::path::Path::new(&path).exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn declared_size_is_enforced() {
        let dir = std::env::temp_dir().join(format!("windlass-test-{}", Uuid::new_v4()));
        let scope = CancellationToken::new();
        let opts = local_only_opts(dir.clone());

        let err = save_file_from_reader(&scope, &b"hello"[..], 42, &opts)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FileStoreError::SizeMismatch {
                expected: 42,
                actual: 5
            }
        ));

        scope.cancel();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_size_is_accepted() {
        let dir = std::env::temp_dir().join(format!("windlass-test-{}", Uuid::new_v4()));
        let scope = CancellationToken::new();
        let opts = local_only_opts(dir.clone());

        let fh = save_file_from_reader(&scope, &b"stream of unknown length"[..], -1, &opts)
            .await
            .unwrap();
        assert_eq!(fh.size, 24);

        scope.cancel();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_destination_is_rejected() {
        let scope = CancellationToken::new();
        let mut opts = local_only_opts(PathBuf::from("/nonexistent"));
        opts.local_temp_path = None;

        let err = save_file_from_reader(&scope, &b""[..], 0, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, FileStoreError::MissingDestination));
    }

    #[tokio::test]
    async fn save_from_disk_reads_the_whole_file() {
        let dir = std::env::temp_dir().join(format!("windlass-test-{}", Uuid::new_v4()));
        let src = std::env::temp_dir().join(format!("windlass-src-{}", Uuid::new_v4()));
        std::fs::write(&src, b"content from disk").unwrap();

        let scope = CancellationToken::new();
        let opts = local_only_opts(dir.clone());
        let fh = save_file_from_disk(&scope, &src, &opts).await.unwrap();
        assert_eq!(fh.size, 17);

        scope.cancel();
        std::fs::remove_file(&src).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn temp_dir_is_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("windlass-test-{}", Uuid::new_v4()));
        let scope = CancellationToken::new();
        let opts = local_only_opts(dir.clone());

        save_file_from_reader(&scope, &b"x"[..], 1, &opts)
            .await
            .unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        scope.cancel();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
