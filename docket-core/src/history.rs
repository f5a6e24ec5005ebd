use chrono::{DateTime, Utc};

use crate::config::HistoryConfig;
use crate::error::TrackerError;
use crate::recorder::{LatestRecord, RecordId, RecordOutcome, RecordRequest, Recorder};
use crate::vcs::Gitdir;

const SNAPSHOTS_DEFAULT_EXTENSION: &str = "html";
const VERSIONS_DEFAULT_EXTENSION: &str = "md";
const VERSION_MIME_TYPE: &str = "text/markdown";

fn changelog(prefix: &str, service_id: &str, document_type: &str) -> String {
    format!("{prefix} {service_id} {document_type}")
}

/// The two record repositories plus the domain rules that bind them:
/// changelog prefixes, first-record detection, and the invariant that every
/// version references the snapshot it was filtered from.
pub struct History {
    snapshots: Recorder,
    versions: Recorder,
    publish_enabled: bool,
    snapshots_base_url: Option<String>,
}

impl History {
    pub fn open(config: &HistoryConfig) -> Result<Self, TrackerError> {
        let snapshots = Gitdir::open(&config.snapshots_path, config.remotes.snapshots.as_deref())?;
        let versions = Gitdir::open(&config.versions_path, config.remotes.versions.as_deref())?;

        Ok(Self {
            snapshots: Recorder::new(snapshots, SNAPSHOTS_DEFAULT_EXTENSION),
            versions: Recorder::new(versions, VERSIONS_DEFAULT_EXTENSION),
            publish_enabled: config.publish,
            snapshots_base_url: config.snapshots_base_url.clone(),
        })
    }

    pub async fn record_snapshot(
        &self,
        service_id: &str,
        document_type: &str,
        content: Vec<u8>,
        mime_type: &str,
    ) -> Result<RecordOutcome, TrackerError> {
        let prefix = if self.snapshots.is_tracked(service_id, document_type).await? {
            "Update"
        } else {
            "Start tracking"
        };

        self.snapshots
            .record(RecordRequest {
                service_id: service_id.to_string(),
                document_type: document_type.to_string(),
                content,
                changelog: changelog(prefix, service_id, document_type),
                mime_type: mime_type.to_string(),
                document_date: None,
            })
            .await
    }

    pub async fn record_version(
        &self,
        service_id: &str,
        document_type: &str,
        content: String,
        snapshot_id: &RecordId,
        snapshot_date: DateTime<Utc>,
    ) -> Result<RecordOutcome, TrackerError> {
        let prefix = if self.versions.is_tracked(service_id, document_type).await? {
            "Update"
        } else {
            "Start tracking"
        };

        self.record_version_with_prefix(
            prefix,
            service_id,
            document_type,
            content,
            snapshot_id,
            snapshot_date,
        )
        .await
    }

    /// Re-derive a version from an already-archived snapshot. Identical
    /// filter output produces no commit.
    pub async fn record_refilter(
        &self,
        service_id: &str,
        document_type: &str,
        content: String,
        snapshot_id: &RecordId,
        snapshot_date: DateTime<Utc>,
    ) -> Result<RecordOutcome, TrackerError> {
        let prefix = if self.versions.is_tracked(service_id, document_type).await? {
            "Refilter"
        } else {
            "Start tracking"
        };

        self.record_version_with_prefix(
            prefix,
            service_id,
            document_type,
            content,
            snapshot_id,
            snapshot_date,
        )
        .await
    }

    async fn record_version_with_prefix(
        &self,
        prefix: &str,
        service_id: &str,
        document_type: &str,
        content: String,
        snapshot_id: &RecordId,
        snapshot_date: DateTime<Utc>,
    ) -> Result<RecordOutcome, TrackerError> {
        if snapshot_id.is_empty() {
            return Err(TrackerError::MissingSnapshotBinding {
                service_id: service_id.to_string(),
                document_type: document_type.to_string(),
            });
        }

        let changelog = format!(
            "{}\n\nThis version was recorded after filtering snapshot {}",
            changelog(prefix, service_id, document_type),
            self.snapshot_reference(snapshot_id),
        );

        self.versions
            .record(RecordRequest {
                service_id: service_id.to_string(),
                document_type: document_type.to_string(),
                content: content.into_bytes(),
                changelog,
                mime_type: VERSION_MIME_TYPE.to_string(),
                document_date: Some(snapshot_date),
            })
            .await
    }

    /// Downstream tooling parses this reference out of version messages;
    /// with publication enabled it points at the published commit.
    fn snapshot_reference(&self, snapshot_id: &RecordId) -> String {
        match (&self.snapshots_base_url, self.publish_enabled) {
            (Some(base), true) => format!("{}/commit/{snapshot_id}", base.trim_end_matches('/')),
            _ => snapshot_id.to_string(),
        }
    }

    pub async fn get_latest_snapshot(
        &self,
        service_id: &str,
        document_type: &str,
    ) -> Result<Option<LatestRecord>, TrackerError> {
        self.snapshots
            .get_latest_record(service_id, document_type)
            .await
    }

    /// Author date of a snapshot commit, used to align version history with
    /// snapshot history.
    pub async fn snapshot_date(&self, id: &RecordId) -> Result<DateTime<Utc>, TrackerError> {
        self.snapshots.record_date(id).await
    }

    /// Push both repositories. A no-op when publication is disabled.
    pub async fn publish(&self) -> Result<(), TrackerError> {
        if !self.publish_enabled {
            return Ok(());
        }

        tokio::try_join!(self.snapshots.publish(), self.versions.publish())?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn versions(&self) -> &Recorder {
        &self.versions
    }
}
