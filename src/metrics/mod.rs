//! Prometheus instruments for the upload pipeline.
//!
//! Registration happens once at first use; the surrounding process decides
//! how (and whether) the default registry is exported.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

lazy_static! {
    /// Uploads currently streaming to an object store.
    pub static ref OBJECT_STORAGE_UPLOADS_OPEN: IntGauge = register_int_gauge!(
        "windlass_object_storage_uploads_open",
        "Number of object storage uploads in flight"
    ).unwrap();

    /// Wall-clock duration of an upload, from open until the driver settles.
    pub static ref OBJECT_STORAGE_UPLOAD_TIME: Histogram = register_histogram!(
        "windlass_object_storage_upload_time_seconds",
        "Time spent uploading to object storage",
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0, 600.0]
    ).unwrap();

    /// Upload attempts that failed at the transport or driver level.
    pub static ref OBJECT_STORAGE_UPLOAD_REQUESTS_FAILED: IntCounter = register_int_counter!(
        "windlass_object_storage_upload_requests_failed_total",
        "Number of failed object storage upload requests"
    ).unwrap();

    /// Upload attempts rejected by the remote with a non-success status.
    pub static ref OBJECT_STORAGE_UPLOAD_INVALID_STATUS: IntCounter = register_int_counter!(
        "windlass_object_storage_upload_invalid_status_total",
        "Number of object storage upload requests answered with an unexpected HTTP status"
    ).unwrap();
}

/// Record that an upload driver settled after `seconds` of wall-clock time.
pub fn observe_upload_time(seconds: f64) {
    OBJECT_STORAGE_UPLOAD_TIME.observe(seconds);
}

/// Record a transport-level upload failure.
pub fn record_request_failed() {
    OBJECT_STORAGE_UPLOAD_REQUESTS_FAILED.inc();
}

/// Record a non-success HTTP status from the remote.
pub fn record_invalid_status() {
    OBJECT_STORAGE_UPLOAD_INVALID_STATUS.inc();
}
