//! Windlass Library
//!
//! Upload accelerator core: streams an inbound request body once while
//! simultaneously hashing it, writing an optional local temp copy, and
//! pushing the same bytes to S3-compatible object storage.
//!
//! # Features
//!
//! - **Single pass**: one read of the body feeds every destination
//! - **Presigned PUT**: streaming upload with MD5/ETag verification
//! - **Presigned multipart**: part framing, completion XML, composite ETag
//! - **Native client**: direct-credential S3 upload, no presigned URLs
//! - **Guaranteed cleanup**: abort/delete on cancellation, deadline or failure
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use windlass::filestore::{
//!     save_file_from_reader, ObjectStoragePreparer, UploadPreparer, UploadVerifier,
//! };
//!
//! # async fn example(response: windlass::api::Response, body: tokio::io::DuplexStream) -> Result<(), Box<dyn std::error::Error>> {
//! let config = windlass::Config::load("windlass.toml")?;
//! let preparer = ObjectStoragePreparer::new(config);
//! let (opts, verifier) = preparer.prepare(&response)?;
//!
//! let scope = CancellationToken::new();
//! let handler = save_file_from_reader(&scope, body, 1024, &opts).await?;
//! if let Some(verifier) = verifier {
//!     verifier.verify(&handler)?;
//! }
//! let fields = handler.finalize_fields("file")?;
//! // ... forward `fields` to the application, then:
//! scope.cancel();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod filestore;
pub mod hash;
pub mod metrics;
pub mod objectstore;
pub mod pipe;
pub mod secret;

// Re-export commonly used types
pub use config::Config;
pub use filestore::{FileHandler, SaveFileOpts};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
