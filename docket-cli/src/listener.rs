use docket_core::engine::TrackingListener;
use docket_core::error::{FetchError, TrackerError};
use docket_core::recorder::RecordId;

/// Turns engine lifecycle events into log lines.
pub struct LogListener;

impl TrackingListener for LogListener {
    fn on_first_snapshot_recorded(&self, service_id: &str, document_type: &str, id: &RecordId) {
        tracing::info!(%id, "started tracking snapshots of {service_id} {document_type}");
    }

    fn on_snapshot_recorded(&self, service_id: &str, document_type: &str, id: &RecordId) {
        tracing::info!(%id, "recorded snapshot of {service_id} {document_type}");
    }

    fn on_snapshot_not_changed(&self, service_id: &str, document_type: &str) {
        tracing::info!("snapshot of {service_id} {document_type} has not changed");
    }

    fn on_first_version_recorded(&self, service_id: &str, document_type: &str, id: &RecordId) {
        tracing::info!(%id, "started tracking versions of {service_id} {document_type}");
    }

    fn on_version_recorded(&self, service_id: &str, document_type: &str, id: &RecordId) {
        tracing::info!(%id, "recorded version of {service_id} {document_type}");
    }

    fn on_version_not_changed(&self, service_id: &str, document_type: &str) {
        tracing::info!("version of {service_id} {document_type} has not changed");
    }

    fn on_records_published(&self) {
        tracing::info!("records published");
    }

    fn on_inaccessible_content(&self, error: &FetchError, service_id: &str, document_type: &str) {
        tracing::warn!(%error, "could not reach {service_id} {document_type}");
    }

    fn on_error(&self, error: &TrackerError, service_id: &str, document_type: &str) {
        tracing::error!(%error, "failed tracking {service_id} {document_type}");
    }
}
