//! Native-client upload tests against a mock S3 endpoint.
//!
//! The mock speaks just enough of the S3 multipart API for the store
//! client: initiate, part PUT, complete, and the delete used for orphan
//! collection.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use windlass::config::S3Config;
use windlass::filestore::{save_file_from_reader, SaveFileOpts};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUCKET: &str = "uploads";
const KEY: &str = "incoming-upload";

fn native_opts(server: &MockServer) -> SaveFileOpts {
    SaveFileOpts {
        temp_file_prefix: "upload".into(),
        local_temp_path: None,
        remote_id: "object-id".into(),
        remote_url: format!("{}/read/object", server.uri()),
        presigned_put: String::new(),
        presigned_delete: String::new(),
        put_headers: HashMap::new(),
        skip_etag_verify: false,
        use_native_client: true,
        remote_temp_object_id: KEY.into(),
        object_storage_config: S3Config {
            provider: "AWS".into(),
            region: "us-east-1".into(),
            bucket: BUCKET.into(),
            endpoint: Some(server.uri()),
            path_style: true,
            access_key: "test-access".into(),
            secret_key: "test-secret".into(),
        },
        deadline: Instant::now() + Duration::from_secs(60),
        part_size: 0,
        presigned_parts: Vec::new(),
        presigned_complete_multipart: String::new(),
        presigned_abort_multipart: String::new(),
    }
}

/// Mount the multipart surface of a mock S3 server. Mount order matters:
/// the complete mock (with its uploadId) must be tried before the
/// catch-all initiate mock.
async fn mount_s3_stub(server: &MockServer) {
    let object_path = format!("/{BUCKET}/{KEY}");

    Mock::given(method("POST"))
        .and(path(object_path.clone()))
        .and(query_param("uploadId", "upload-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<CompleteMultipartUploadResult><Bucket>{BUCKET}</Bucket><Key>{KEY}</Key><ETag>\"stub-etag-1\"</ETag></CompleteMultipartUploadResult>"
        )))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(object_path.clone()))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<InitiateMultipartUploadResult><Bucket>{BUCKET}</Bucket><Key>{KEY}</Key><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>"
        )))
        .mount(server)
        .await;

    Mock::given(method("PUT"))
        .and(path(object_path.clone()))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part-etag-1\""))
        .mount(server)
        .await;

    Mock::given(method("DELETE"))
        .and(path(object_path))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

async fn count_requests(server: &MockServer, http_method: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.to_string() == http_method)
        .count()
}

#[tokio::test]
async fn native_upload_streams_and_is_deleted_after_scope_ends() {
    let server = MockServer::start().await;
    mount_s3_stub(&server).await;

    let body = vec![b'n'; 100 * 1024];
    let scope = CancellationToken::new();
    let opts = native_opts(&server);

    let fh = save_file_from_reader(&scope, body.as_slice(), body.len() as i64, &opts)
        .await
        .unwrap();
    assert_eq!(fh.size, body.len() as i64);

    // Object exists: completed, not yet deleted.
    assert_eq!(count_requests(&server, "DELETE").await, 0);

    // Application is done with the object; cleanup removes it.
    scope.cancel();
    for _ in 0..200 {
        if count_requests(&server, "DELETE").await >= 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("stored object was not deleted after the scope ended");
}

#[tokio::test]
async fn invalid_native_config_is_rejected_up_front() {
    let server = MockServer::start().await;
    let scope = CancellationToken::new();

    let mut opts = native_opts(&server);
    opts.object_storage_config.bucket.clear();

    // An unusable destination disables the native client; with nothing
    // else configured the pipeline has no destination at all.
    let err = save_file_from_reader(&scope, &b"x"[..], 1, &opts)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        windlass::filestore::FileStoreError::MissingDestination
    ));
}

#[tokio::test]
async fn native_upload_failure_deletes_the_orphan() {
    let server = MockServer::start().await;
    let object_path = format!("/{BUCKET}/{KEY}");

    // Initiate succeeds, the part PUT is rejected.
    Mock::given(method("POST"))
        .and(path(object_path.clone()))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<InitiateMultipartUploadResult><Bucket>{BUCKET}</Bucket><Key>{KEY}</Key><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>"
        )))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(object_path.clone()))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(object_path))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let scope = CancellationToken::new();
    let opts = native_opts(&server);

    let result = save_file_from_reader(&scope, &b"doomed"[..], 6, &opts).await;
    assert!(result.is_err());

    // Failure triggers the object delete without waiting for the scope.
    // The session abort also DELETEs, but carries the uploadId query.
    for _ in 0..200 {
        let object_deletes = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| {
                r.method.to_string() == "DELETE"
                    && !r.url.query().unwrap_or_default().contains("uploadId")
            })
            .count();
        if object_deletes >= 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("orphaned object was not deleted after the failed upload");
}
