use std::fmt;
use std::path::Path;

/// Upstream fetch failures, split by whether the batch survives them.
#[derive(Debug)]
pub enum FetchError {
    /// The document could not be retrieved for reasons outside our control
    /// (4xx/5xx, timeout, connection refused). Reported, never fatal.
    InaccessibleContent { location: String, reason: String },
    /// A malformed location or a broken client build. This is a bug in the
    /// declaration or in us, so it aborts the batch.
    Invalid { location: String, detail: String },
}

impl FetchError {
    pub fn inaccessible<L: Into<String>, R: Into<String>>(location: L, reason: R) -> Self {
        FetchError::InaccessibleContent {
            location: location.into(),
            reason: reason.into(),
        }
    }

    pub fn is_inaccessible(&self) -> bool {
        matches!(self, FetchError::InaccessibleContent { .. })
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::InaccessibleContent { location, reason } => {
                write!(f, "content at {location} is inaccessible: {reason}")
            }
            FetchError::Invalid { location, detail } => {
                write!(f, "cannot fetch {location}: {detail}")
            }
        }
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug)]
pub enum FilterError {
    UnsupportedMime { mime: String },
    Selector { selector: String },
    Encoding { detail: String },
    UnknownTransform { name: String },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::UnsupportedMime { mime } => {
                write!(f, "no filter available for mime type {mime}")
            }
            FilterError::Selector { selector } => {
                write!(f, "invalid CSS selector `{selector}`")
            }
            FilterError::Encoding { detail } => write!(f, "content is not valid UTF-8: {detail}"),
            FilterError::UnknownTransform { name } => {
                write!(f, "unknown filter transform `{name}`")
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// Everything that aborts a batch. `FetchError::InaccessibleContent` never
/// appears here; it is converted to an event at the queue boundary.
#[derive(Debug)]
pub enum TrackerError {
    /// A git operation failed, tagged with the path it concerned.
    Storage {
        path: String,
        source: git2::Error,
    },
    Io {
        path: String,
        source: std::io::Error,
    },
    /// A version was about to be recorded without its source snapshot id.
    MissingSnapshotBinding {
        service_id: String,
        document_type: String,
    },
    /// A record commit touched zero or several files when exactly one was
    /// expected.
    MalformedRecord {
        id: String,
        files: usize,
    },
    /// A path pattern resolved to more than one tracked file.
    AmbiguousPath {
        pattern: String,
        matches: Vec<String>,
    },
    Config {
        path: String,
        detail: String,
    },
    Declarations {
        path: String,
        detail: String,
    },
    Filter(FilterError),
    Fetch(FetchError),
    Worker {
        detail: String,
    },
}

impl TrackerError {
    pub fn storage<P: AsRef<Path>>(path: P, source: git2::Error) -> Self {
        TrackerError::Storage {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn io<P: AsRef<Path>>(path: P, source: std::io::Error) -> Self {
        TrackerError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Storage { path, source } => {
                write!(f, "storage failure on {path}: {}", source.message())
            }
            TrackerError::Io { path, source } => write!(f, "io failure on {path}: {source}"),
            TrackerError::MissingSnapshotBinding {
                service_id,
                document_type,
            } => write!(
                f,
                "refusing to record a version of {service_id} {document_type} without a snapshot id"
            ),
            TrackerError::MalformedRecord { id, files } => {
                write!(f, "record {id} changed {files} files, expected exactly one")
            }
            TrackerError::AmbiguousPath { pattern, matches } => write!(
                f,
                "pattern {pattern} matches {} tracked files: {}",
                matches.len(),
                matches.join(", ")
            ),
            TrackerError::Config { path, detail } => {
                write!(f, "invalid configuration {path}: {detail}")
            }
            TrackerError::Declarations { path, detail } => {
                write!(f, "invalid service declaration {path}: {detail}")
            }
            TrackerError::Filter(err) => write!(f, "{err}"),
            TrackerError::Fetch(err) => write!(f, "{err}"),
            TrackerError::Worker { detail } => write!(f, "worker failure: {detail}"),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::Storage { source, .. } => Some(source),
            TrackerError::Io { source, .. } => Some(source),
            TrackerError::Filter(err) => Some(err),
            TrackerError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FilterError> for TrackerError {
    fn from(err: FilterError) -> Self {
        TrackerError::Filter(err)
    }
}
