//! Core engine for tracking the evolution of legal documents.
//!
//! Given a set of service declarations, the [`engine::Tracker`] fetches each
//! declared document, archives the raw bytes as a snapshot, extracts the
//! legally meaningful text through the declaration's filters, and archives
//! that text as a version. Both archives are git repositories: every record
//! is a commit and the commit hash is the record id.

pub mod config;
pub mod declarations;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod history;
pub mod recorder;
pub mod vcs;
