use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    Cred, Delta, DiffOptions, ErrorCode, Oid, PushOptions, RemoteCallbacks, Repository, Signature,
    Sort, Time,
};

use crate::error::TrackerError;

const FALLBACK_AUTHOR: (&str, &str) = ("Docket", "docket@local");
const REMOTE_NAME: &str = "origin";

/// One commit, with the list of files it changed relative to its parent.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub hash: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub files: Vec<String>,
}

/// A local git working directory used as an append-only, content-addressed
/// record store. Commit hashes are the record ids.
///
/// `Gitdir` is not concurrency-safe: the index and working tree are shared
/// mutable state, so callers hold each instance behind a single lock and
/// treat every operation as part of one critical section per repository.
pub struct Gitdir {
    repo: Repository,
    workdir: PathBuf,
    default_ref: String,
}

impl Gitdir {
    /// Open `path` as a repository, initializing it on first use. When
    /// `remote_url` is given, the `origin` remote is created or re-pointed.
    pub fn open(path: &Path, remote_url: Option<&str>) -> Result<Self, TrackerError> {
        std::fs::create_dir_all(path).map_err(|err| TrackerError::io(path, err))?;

        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(_) => Repository::init(path).map_err(|err| TrackerError::storage(path, err))?,
        };

        let default_ref = repo
            .find_reference("HEAD")
            .ok()
            .and_then(|head| head.symbolic_target().map(str::to_string))
            .unwrap_or_else(|| "refs/heads/main".to_string());

        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf());

        let gitdir = Self {
            repo,
            workdir,
            default_ref,
        };

        if let Some(url) = remote_url {
            gitdir
                .configure_remote(url)
                .map_err(|err| TrackerError::storage(path, err))?;
        }

        Ok(gitdir)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn configure_remote(&self, url: &str) -> Result<(), git2::Error> {
        match self.repo.find_remote(REMOTE_NAME) {
            Ok(remote) if remote.url() == Some(url) => Ok(()),
            Ok(_) => self.repo.remote_set_url(REMOTE_NAME, url),
            Err(_) => self.repo.remote(REMOTE_NAME, url).map(|_| ()),
        }
    }

    /// Stage a single file, mirroring `git add <path>`.
    pub fn add(&self, rel_path: &Path) -> Result<(), TrackerError> {
        self.add_impl(rel_path)
            .map_err(|err| TrackerError::storage(rel_path, err))
    }

    fn add_impl(&self, rel_path: &Path) -> Result<(), git2::Error> {
        let mut index = self.repo.index()?;
        index.add_path(rel_path)?;
        index.write()
    }

    /// Commit the staged state with `message`, setting both author and
    /// committer timestamps to `date` so history orders by document date
    /// rather than wall clock. Returns `None` when the staged tree is
    /// identical to HEAD's, in which case no commit is created.
    pub fn commit(
        &self,
        rel_path: &Path,
        message: &str,
        date: DateTime<Utc>,
    ) -> Result<Option<String>, TrackerError> {
        self.commit_impl(message, date)
            .map_err(|err| TrackerError::storage(rel_path, err))
    }

    fn commit_impl(
        &self,
        message: &str,
        date: DateTime<Utc>,
    ) -> Result<Option<String>, git2::Error> {
        let mut index = self.repo.index()?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent_commit = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());

        match parent_commit.as_ref() {
            Some(parent) if parent.tree_id() == tree_id => return Ok(None),
            None if index.is_empty() => return Ok(None),
            _ => {}
        }

        let tree = self.repo.find_tree(tree_id)?;
        let signature = self.signature(date)?;
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();

        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;

        Ok(Some(oid.to_string()))
    }

    fn signature(&self, date: DateTime<Utc>) -> Result<Signature<'static>, git2::Error> {
        let (name, email) = match self.repo.signature() {
            Ok(sig) => (
                sig.name().unwrap_or(FALLBACK_AUTHOR.0).to_string(),
                sig.email().unwrap_or(FALLBACK_AUTHOR.1).to_string(),
            ),
            Err(_) => (FALLBACK_AUTHOR.0.to_string(), FALLBACK_AUTHOR.1.to_string()),
        };

        Signature::new(&name, &email, &Time::new(date.timestamp(), 0))
    }

    /// Push the current branch to `origin`. A repository without a configured
    /// remote is already "published" as far as this store is concerned, so
    /// that case is a no-op. Pushing an already-synced branch is idempotent.
    pub fn push(&self) -> Result<(), TrackerError> {
        self.push_impl()
            .map_err(|err| TrackerError::storage(&self.workdir, err))
    }

    fn push_impl(&self) -> Result<(), git2::Error> {
        let mut remote = match self.repo.find_remote(REMOTE_NAME) {
            Ok(remote) => remote,
            Err(_) => {
                tracing::debug!(workdir = %self.workdir.display(), "no remote configured, skipping push");
                return Ok(());
            }
        };

        let head = self.repo.head()?;
        if !head.is_branch() {
            return Err(git2::Error::from_str(
                "cannot push because HEAD is not pointing to a branch",
            ));
        }
        let branch_ref = head
            .name()
            .ok_or_else(|| git2::Error::from_str("current branch name is not valid UTF-8"))?
            .to_string();
        let branch_name = head
            .shorthand()
            .ok_or_else(|| git2::Error::from_str("unable to determine branch name"))?
            .to_string();
        let head_oid = head
            .target()
            .ok_or_else(|| git2::Error::from_str("HEAD does not reference a commit"))?;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, _allowed| match username_from_url {
            Some(name) => Cred::ssh_key_from_agent(name),
            None => Cred::default(),
        });

        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let refspec = format!("{branch_ref}:{branch_ref}");
        remote.push(&[refspec.as_str()], Some(&mut push_opts))?;
        remote.disconnect()?;

        let tracking_ref = format!("refs/remotes/{REMOTE_NAME}/{branch_name}");
        self.repo.reference(
            &tracking_ref,
            head_oid,
            true,
            "docket: update remote tracking ref after push",
        )?;

        Ok(())
    }

    /// Resolve the single tracked file matching `<dir>/<stem>.*`, together
    /// with the newest commit touching it. More than one match is an
    /// `AmbiguousPath` error; no match resolves to `None`.
    pub fn find_unique(
        &self,
        dir: &str,
        stem: &str,
    ) -> Result<Option<(CommitInfo, PathBuf)>, TrackerError> {
        let matches = self.tracked_matches(dir, stem)?;

        let rel = match matches.len() {
            0 => return Ok(None),
            1 => PathBuf::from(&matches[0]),
            _ => {
                return Err(TrackerError::AmbiguousPath {
                    pattern: format!("{dir}/{stem}.*"),
                    matches,
                });
            }
        };

        let latest = self.log(&rel)?.into_iter().next();
        Ok(latest.map(|commit| (commit, rel)))
    }

    pub fn is_tracked(&self, dir: &str, stem: &str) -> Result<bool, TrackerError> {
        Ok(!self.tracked_matches(dir, stem)?.is_empty())
    }

    fn tracked_matches(&self, dir: &str, stem: &str) -> Result<Vec<String>, TrackerError> {
        let index = self
            .repo
            .index()
            .map_err(|err| TrackerError::storage(dir, err))?;

        let mut matches = Vec::new();
        for entry in index.iter() {
            let path = String::from_utf8_lossy(&entry.path).into_owned();
            let p = Path::new(&path);
            let stem_matches = p.file_stem().and_then(|s| s.to_str()) == Some(stem);
            if stem_matches && p.parent() == Some(Path::new(dir)) {
                matches.push(path);
            }
        }

        matches.sort();
        Ok(matches)
    }

    /// Commits touching `rel_path`, newest first, each with its full
    /// changed-file list.
    pub fn log(&self, rel_path: &Path) -> Result<Vec<CommitInfo>, TrackerError> {
        self.log_impl(rel_path)
            .map_err(|err| TrackerError::storage(rel_path, err))
    }

    fn log_impl(&self, rel_path: &Path) -> Result<Vec<CommitInfo>, git2::Error> {
        let mut walk = self.repo.revwalk()?;
        match walk.push_head() {
            Ok(()) => {}
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        }
        walk.set_sorting(Sort::TIME)?;

        let mut out = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            let files = self.changed_files(&commit)?;
            if files.iter().any(|f| Path::new(f) == rel_path) {
                out.push(self.commit_info_for(&commit, files));
            }
        }

        Ok(out)
    }

    /// Metadata for a single commit identified by its hash.
    pub fn commit_info(&self, hash: &str) -> Result<CommitInfo, TrackerError> {
        self.commit_info_impl(hash)
            .map_err(|err| TrackerError::storage(hash, err))
    }

    fn commit_info_impl(&self, hash: &str) -> Result<CommitInfo, git2::Error> {
        let commit = self.repo.find_commit(Oid::from_str(hash)?)?;
        let files = self.changed_files(&commit)?;
        Ok(self.commit_info_for(&commit, files))
    }

    fn commit_info_for(&self, commit: &git2::Commit, files: Vec<String>) -> CommitInfo {
        let seconds = commit.author().when().seconds();
        let date = DateTime::<Utc>::from_timestamp(seconds, 0).unwrap_or(DateTime::UNIX_EPOCH);

        CommitInfo {
            hash: commit.id().to_string(),
            date,
            message: commit.message().unwrap_or_default().to_string(),
            files,
        }
    }

    fn changed_files(&self, commit: &git2::Commit) -> Result<Vec<String>, git2::Error> {
        let tree = commit.tree()?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };

        let mut opts = DiffOptions::new();
        let diff =
            self.repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;

        let mut files = Vec::new();
        for delta in diff.deltas() {
            if delta.status() == Delta::Unmodified {
                continue;
            }
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().into_owned());
            if let Some(path) = path {
                files.push(path);
            }
        }

        Ok(files)
    }

    /// Detach HEAD at `hash` and force the working tree to match. Only used
    /// by historical reads, under the repository lock, and always paired
    /// with `checkout_default`.
    pub fn checkout(&self, hash: &str) -> Result<(), TrackerError> {
        self.checkout_impl(hash)
            .map_err(|err| TrackerError::storage(hash, err))
    }

    fn checkout_impl(&self, hash: &str) -> Result<(), git2::Error> {
        let oid = Oid::from_str(hash)?;
        self.repo.set_head_detached(oid)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_head(Some(&mut checkout))
    }

    /// Re-attach HEAD to the default branch after a historical read.
    pub fn checkout_default(&self) -> Result<(), TrackerError> {
        self.checkout_default_impl()
            .map_err(|err| TrackerError::storage(&self.workdir, err))
    }

    fn checkout_default_impl(&self) -> Result<(), git2::Error> {
        self.repo.set_head(&self.default_ref)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_head(Some(&mut checkout))
    }

    /// Bytes of `rel_path` in the working tree at the current HEAD.
    pub fn read_file(&self, rel_path: &Path) -> Result<Vec<u8>, TrackerError> {
        let abs = self.workdir.join(rel_path);
        std::fs::read(&abs).map_err(|err| TrackerError::io(&abs, err))
    }
}
