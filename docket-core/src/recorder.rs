use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::TrackerError;
use crate::vcs::Gitdir;

/// Opaque record id. Underneath it is the commit hash, stable once issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordId(String);

impl RecordId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        RecordId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What `record` did. Unchanged content never produces a commit.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Unchanged,
    Recorded { id: RecordId, is_first_record: bool },
}

pub struct RecordRequest {
    pub service_id: String,
    pub document_type: String,
    pub content: Vec<u8>,
    pub changelog: String,
    pub mime_type: String,
    /// Used as both author and committer date; `None` means now.
    pub document_date: Option<DateTime<Utc>>,
}

/// The file currently at HEAD for a `(service, document)` pair.
#[derive(Debug, Clone)]
pub struct LatestRecord {
    pub id: RecordId,
    pub date: DateTime<Utc>,
    pub content: Vec<u8>,
    pub mime_type: String,
}

/// A record read back out of history by id.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: RecordId,
    pub date: DateTime<Utc>,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub relative_file_path: PathBuf,
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "text/html" => Some("html"),
        "application/pdf" => Some("pdf"),
        "text/markdown" => Some("md"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}

fn mime_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "html" => Some("text/html"),
        "pdf" => Some("application/pdf"),
        "md" => Some("text/markdown"),
        "txt" => Some("text/plain"),
        _ => None,
    }
}

/// Typed read/write access to one record repository (snapshots or versions).
/// Knows the `<service>/<document>.<ext>` layout and the mime/extension
/// mapping; everything else is delegated to the underlying `Gitdir`.
///
/// The `Gitdir` sits behind a mutex: commits, checkouts, and index reads on
/// one repository form a single critical section even though the pipelines
/// around them run in parallel.
pub struct Recorder {
    gitdir: Mutex<Gitdir>,
    default_extension: String,
}

impl Recorder {
    pub fn new(gitdir: Gitdir, default_extension: &str) -> Self {
        Self {
            gitdir: Mutex::new(gitdir),
            default_extension: default_extension.to_string(),
        }
    }

    fn extension(&self, mime_type: &str) -> &str {
        extension_for_mime(mime_type).unwrap_or(&self.default_extension)
    }

    fn mime(&self, path: &Path) -> String {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(mime_for_extension)
            .unwrap_or("text/html")
            .to_string()
    }

    /// Write and commit one record. Idempotent: content equal to the file at
    /// HEAD produces `RecordOutcome::Unchanged` and no commit.
    pub async fn record(&self, request: RecordRequest) -> Result<RecordOutcome, TrackerError> {
        let rel = PathBuf::from(&request.service_id).join(format!(
            "{}.{}",
            request.document_type,
            self.extension(&request.mime_type)
        ));

        let gitdir = self.gitdir.lock().await;

        // First-record detection happens before staging; afterwards the
        // index already contains the file.
        let is_first_record = !gitdir.is_tracked(&request.service_id, &request.document_type)?;

        let abs = gitdir.workdir().join(&rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|err| TrackerError::io(parent, err))?;
        }
        std::fs::write(&abs, &request.content).map_err(|err| TrackerError::io(&abs, err))?;

        gitdir.add(&rel)?;

        let date = request.document_date.unwrap_or_else(Utc::now);
        match gitdir.commit(&rel, &request.changelog, date)? {
            None => Ok(RecordOutcome::Unchanged),
            Some(hash) => Ok(RecordOutcome::Recorded {
                id: RecordId::new(hash),
                is_first_record,
            }),
        }
    }

    pub async fn get_latest_record(
        &self,
        service_id: &str,
        document_type: &str,
    ) -> Result<Option<LatestRecord>, TrackerError> {
        let gitdir = self.gitdir.lock().await;

        let Some((commit, rel)) = gitdir.find_unique(service_id, document_type)? else {
            return Ok(None);
        };

        let content = gitdir.read_file(&rel)?;
        Ok(Some(LatestRecord {
            id: RecordId::new(commit.hash),
            date: commit.date,
            content,
            mime_type: self.mime(&rel),
        }))
    }

    /// Read a record by commit id. The commit must have changed exactly one
    /// file; anything else is a `MalformedRecord`. HEAD is restored to the
    /// default branch before returning.
    pub async fn get_record(&self, id: &RecordId) -> Result<Record, TrackerError> {
        let gitdir = self.gitdir.lock().await;

        let info = gitdir.commit_info(id.as_str())?;
        if info.files.len() != 1 {
            return Err(TrackerError::MalformedRecord {
                id: id.to_string(),
                files: info.files.len(),
            });
        }
        let rel = PathBuf::from(&info.files[0]);

        gitdir.checkout(id.as_str())?;
        let content = gitdir.read_file(&rel);
        let restored = gitdir.checkout_default();

        let content = content?;
        restored?;

        Ok(Record {
            id: id.clone(),
            date: info.date,
            content,
            mime_type: self.mime(&rel),
            relative_file_path: rel,
        })
    }

    pub async fn is_tracked(
        &self,
        service_id: &str,
        document_type: &str,
    ) -> Result<bool, TrackerError> {
        let gitdir = self.gitdir.lock().await;
        gitdir.is_tracked(service_id, document_type)
    }

    /// Author date of an already-issued record id.
    pub async fn record_date(&self, id: &RecordId) -> Result<DateTime<Utc>, TrackerError> {
        let gitdir = self.gitdir.lock().await;
        Ok(gitdir.commit_info(id.as_str())?.date)
    }

    pub async fn publish(&self) -> Result<(), TrackerError> {
        let gitdir = self.gitdir.lock().await;
        gitdir.push()
    }
}
