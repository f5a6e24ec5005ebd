use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use docket_core::config::{Config, HistoryConfig, RemotesConfig};
use docket_core::engine::{MAX_PARALLEL_DOCUMENT_TRACKS, Tracker, TrackingListener};
use docket_core::error::{FetchError, TrackerError};
use docket_core::fetcher::{FetchedDocument, Fetcher};
use docket_core::recorder::RecordId;

#[derive(Clone)]
enum StubResponse {
    Html(String),
    Inaccessible(String),
    Broken(String),
}

#[derive(Default)]
struct FetchStats {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct StubFetcher {
    responses: HashMap<String, StubResponse>,
    delay: Option<Duration>,
    stats: Arc<FetchStats>,
}

impl StubFetcher {
    fn new<I, L>(responses: I) -> Self
    where
        I: IntoIterator<Item = (L, StubResponse)>,
        L: Into<String>,
    {
        Self {
            responses: responses
                .into_iter()
                .map(|(location, response)| (location.into(), response))
                .collect(),
            delay: None,
            stats: Arc::new(FetchStats::default()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn stats(&self) -> Arc<FetchStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, location: &str) -> Result<FetchedDocument, FetchError> {
        let current = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match self.responses.get(location) {
            Some(StubResponse::Html(body)) => Ok(FetchedDocument {
                mime_type: "text/html".to_string(),
                content: body.clone().into_bytes(),
            }),
            Some(StubResponse::Inaccessible(reason)) => {
                Err(FetchError::inaccessible(location, reason.clone()))
            }
            Some(StubResponse::Broken(detail)) => Err(FetchError::Invalid {
                location: location.to_string(),
                detail: detail.clone(),
            }),
            None => Err(FetchError::inaccessible(location, "no stub response")),
        };

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn push(&self, event: String) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn count_of(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl TrackingListener for RecordingListener {
    fn on_first_snapshot_recorded(&self, service_id: &str, document_type: &str, _id: &RecordId) {
        self.push(format!("first_snapshot_recorded {service_id} {document_type}"));
    }

    fn on_snapshot_recorded(&self, service_id: &str, document_type: &str, _id: &RecordId) {
        self.push(format!("snapshot_recorded {service_id} {document_type}"));
    }

    fn on_snapshot_not_changed(&self, service_id: &str, document_type: &str) {
        self.push(format!("snapshot_not_changed {service_id} {document_type}"));
    }

    fn on_first_version_recorded(&self, service_id: &str, document_type: &str, _id: &RecordId) {
        self.push(format!("first_version_recorded {service_id} {document_type}"));
    }

    fn on_version_recorded(&self, service_id: &str, document_type: &str, _id: &RecordId) {
        self.push(format!("version_recorded {service_id} {document_type}"));
    }

    fn on_version_not_changed(&self, service_id: &str, document_type: &str) {
        self.push(format!("version_not_changed {service_id} {document_type}"));
    }

    fn on_records_published(&self) {
        self.push("records_published".to_string());
    }

    fn on_inaccessible_content(&self, _error: &FetchError, service_id: &str, document_type: &str) {
        self.push(format!("inaccessible_content {service_id} {document_type}"));
    }

    fn on_error(&self, _error: &TrackerError, service_id: &str, document_type: &str) {
        self.push(format!("error {service_id} {document_type}"));
    }
}

struct Workspace {
    tempdir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let tempdir = tempfile::TempDir::new().expect("tempdir");
        std::fs::create_dir_all(tempdir.path().join("declarations")).unwrap();
        Self { tempdir }
    }

    fn config(&self, publish: bool) -> Config {
        Config {
            service_declarations_path: self.tempdir.path().join("declarations"),
            history: HistoryConfig {
                snapshots_path: self.snapshots(),
                versions_path: self.versions(),
                publish,
                snapshots_base_url: None,
                remotes: RemotesConfig::default(),
            },
        }
    }

    fn snapshots(&self) -> PathBuf {
        self.tempdir.path().join("snapshots")
    }

    fn versions(&self) -> PathBuf {
        self.tempdir.path().join("versions")
    }

    fn declare(&self, service_id: &str, body: &str) {
        std::fs::write(
            self.tempdir
                .path()
                .join("declarations")
                .join(format!("{service_id}.json")),
            body,
        )
        .unwrap();
    }
}

fn tracker_for(
    ws: &Workspace,
    publish: bool,
    fetcher: StubFetcher,
) -> (Tracker<StubFetcher>, Arc<RecordingListener>) {
    let listener = Arc::new(RecordingListener::default());
    let mut tracker = Tracker::new(ws.config(publish), fetcher).expect("tracker");
    tracker.init().expect("init");
    tracker.attach(listener.clone());
    (tracker, listener)
}

fn commit_count(repo_path: &Path) -> usize {
    let repo = git2::Repository::open(repo_path).unwrap();
    let mut walk = repo.revwalk().unwrap();
    match walk.push_head() {
        Ok(()) => walk.count(),
        Err(_) => 0,
    }
}

fn head_hash(repo_path: &Path) -> String {
    let repo = git2::Repository::open(repo_path).unwrap();
    repo.head().unwrap().target().unwrap().to_string()
}

fn head_message(repo_path: &Path) -> String {
    let repo = git2::Repository::open(repo_path).unwrap();
    let commit = repo.head().unwrap().peel_to_commit().unwrap();
    commit.message().unwrap().to_string()
}

fn file_content(repo_path: &Path, rel: &str) -> String {
    std::fs::read_to_string(repo_path.join(rel)).unwrap()
}

const ACME_TOS: &str =
    r#"{"documents": {"TOS": {"fetch": "http://acme.example/tos", "select": ["main"]}}}"#;

#[tokio::test]
async fn first_time_tracking_records_one_snapshot_and_one_bound_version() {
    let ws = Workspace::new();
    ws.declare("acme", ACME_TOS);

    let fetcher = StubFetcher::new([(
        "http://acme.example/tos",
        StubResponse::Html("<html><main>Hello</main></html>".to_string()),
    )]);
    let (tracker, listener) = tracker_for(&ws, true, fetcher);

    tracker.track_changes(&[]).await.expect("batch succeeds");

    assert_eq!(commit_count(&ws.snapshots()), 1);
    assert_eq!(commit_count(&ws.versions()), 1);

    assert_eq!(head_message(&ws.snapshots()), "Start tracking acme TOS");
    let snapshot_hash = head_hash(&ws.snapshots());
    assert_eq!(
        head_message(&ws.versions()),
        format!(
            "Start tracking acme TOS\n\nThis version was recorded after filtering snapshot {snapshot_hash}"
        )
    );

    assert_eq!(file_content(&ws.versions(), "acme/TOS.md"), "Hello");

    let events = listener.events();
    assert!(events.contains(&"first_snapshot_recorded acme TOS".to_string()));
    assert!(events.contains(&"first_version_recorded acme TOS".to_string()));
    assert_eq!(listener.count_of("records_published"), 1);
}

#[tokio::test]
async fn unchanged_content_produces_no_commits() {
    let ws = Workspace::new();
    ws.declare("acme", ACME_TOS);

    let page = "<html><main>Hello</main></html>";
    let fetcher = StubFetcher::new([("http://acme.example/tos", StubResponse::Html(page.to_string()))]);
    let (tracker, _) = tracker_for(&ws, true, fetcher);
    tracker.track_changes(&[]).await.unwrap();

    let fetcher = StubFetcher::new([("http://acme.example/tos", StubResponse::Html(page.to_string()))]);
    let (tracker, listener) = tracker_for(&ws, true, fetcher);
    tracker.track_changes(&[]).await.unwrap();

    assert_eq!(commit_count(&ws.snapshots()), 1);
    assert_eq!(commit_count(&ws.versions()), 1);

    let events = listener.events();
    assert!(events.contains(&"snapshot_not_changed acme TOS".to_string()));
    assert!(events.contains(&"version_not_changed acme TOS".to_string()));
    assert_eq!(listener.count_of("records_published"), 1);
}

#[tokio::test]
async fn noise_only_changes_record_a_snapshot_but_not_a_version() {
    let ws = Workspace::new();
    ws.declare(
        "acme",
        r#"{"documents": {"TOS": {"fetch": "http://acme.example/tos", "select": ["main"], "remove": [".ad-banner"]}}}"#,
    );

    let with_banner = |banner: &str| {
        format!("<html><main><p>Hello</p><div class=\"ad-banner\">{banner}</div></main></html>")
    };

    let fetcher = StubFetcher::new([(
        "http://acme.example/tos",
        StubResponse::Html(with_banner("Buy one")),
    )]);
    let (tracker, _) = tracker_for(&ws, true, fetcher);
    tracker.track_changes(&[]).await.unwrap();

    let fetcher = StubFetcher::new([(
        "http://acme.example/tos",
        StubResponse::Html(with_banner("Buy another")),
    )]);
    let (tracker, listener) = tracker_for(&ws, true, fetcher);
    tracker.track_changes(&[]).await.unwrap();

    assert_eq!(commit_count(&ws.snapshots()), 2);
    assert_eq!(commit_count(&ws.versions()), 1);

    let events = listener.events();
    assert!(events.contains(&"snapshot_recorded acme TOS".to_string()));
    assert!(events.contains(&"version_not_changed acme TOS".to_string()));
    assert_eq!(file_content(&ws.versions(), "acme/TOS.md"), "Hello");
}

#[tokio::test]
async fn inaccessible_documents_do_not_abort_the_batch() {
    let ws = Workspace::new();
    ws.declare("acme", ACME_TOS);
    ws.declare(
        "globex",
        r#"{"documents": {"Privacy Policy": {"fetch": "http://globex.example/privacy", "select": ["main"]}}}"#,
    );

    let fetcher = StubFetcher::new([
        (
            "http://acme.example/tos",
            StubResponse::Html("<html><main>Hello</main></html>".to_string()),
        ),
        (
            "http://globex.example/privacy",
            StubResponse::Inaccessible("http 503".to_string()),
        ),
    ]);
    let (tracker, listener) = tracker_for(&ws, true, fetcher);

    tracker.track_changes(&[]).await.expect("batch still succeeds");

    // The accessible service is fully recorded, the other only reported.
    assert_eq!(commit_count(&ws.snapshots()), 1);
    assert_eq!(commit_count(&ws.versions()), 1);
    assert_eq!(
        listener.count_of("inaccessible_content globex Privacy Policy"),
        1
    );
    assert!(
        listener
            .events()
            .contains(&"first_version_recorded acme TOS".to_string())
    );
    assert_eq!(listener.count_of("records_published"), 1);
}

#[tokio::test]
async fn refiltering_binds_a_new_version_to_the_existing_snapshot() {
    let ws = Workspace::new();
    ws.declare("acme", ACME_TOS);

    let fetcher = StubFetcher::new([(
        "http://acme.example/tos",
        StubResponse::Html(
            "<html><main><p>Hello</p><p class=\"promo\">Promotional aside</p></main></html>"
                .to_string(),
        ),
    )]);
    let (tracker, _) = tracker_for(&ws, true, fetcher);
    tracker.track_changes(&[]).await.unwrap();

    assert_eq!(
        file_content(&ws.versions(), "acme/TOS.md"),
        "Hello\n\nPromotional aside"
    );
    let snapshot_hash = head_hash(&ws.snapshots());

    // The declaration learns to strip the promo; no new fetch happens.
    ws.declare(
        "acme",
        r#"{"documents": {"TOS": {"fetch": "http://acme.example/tos", "select": ["main"], "remove": [".promo"]}}}"#,
    );
    let (tracker, listener) = tracker_for(&ws, true, StubFetcher::new(Vec::<(String, StubResponse)>::new()));
    tracker
        .refilter_and_record(&["acme".to_string()])
        .await
        .unwrap();

    assert_eq!(commit_count(&ws.snapshots()), 1, "refilter never snapshots");
    assert_eq!(commit_count(&ws.versions()), 2);

    let message = head_message(&ws.versions());
    assert!(message.starts_with("Refilter acme TOS"));
    assert!(message.contains(&snapshot_hash));
    assert_eq!(file_content(&ws.versions(), "acme/TOS.md"), "Hello");

    assert_eq!(listener.count_of("version_recorded acme TOS"), 1);
    assert_eq!(listener.count_of("records_published"), 1);
}

#[tokio::test]
async fn version_commits_inherit_the_snapshot_author_date() {
    let ws = Workspace::new();
    ws.declare("acme", ACME_TOS);

    let fetcher = StubFetcher::new([(
        "http://acme.example/tos",
        StubResponse::Html("<html><main>Hello</main></html>".to_string()),
    )]);
    let (tracker, _) = tracker_for(&ws, false, fetcher);
    tracker.track_changes(&[]).await.unwrap();

    let snapshot_repo = git2::Repository::open(ws.snapshots()).unwrap();
    let snapshot_when = snapshot_repo
        .head()
        .unwrap()
        .peel_to_commit()
        .unwrap()
        .author()
        .when();

    let version_repo = git2::Repository::open(ws.versions()).unwrap();
    let version_when = version_repo
        .head()
        .unwrap()
        .peel_to_commit()
        .unwrap()
        .author()
        .when();

    assert_eq!(version_when.seconds(), snapshot_when.seconds());
}

#[tokio::test]
async fn only_requested_services_are_tracked() {
    let ws = Workspace::new();
    ws.declare("acme", ACME_TOS);
    ws.declare(
        "globex",
        r#"{"documents": {"Privacy Policy": {"fetch": "http://globex.example/privacy", "select": ["main"]}}}"#,
    );

    let fetcher = StubFetcher::new([
        (
            "http://acme.example/tos",
            StubResponse::Html("<html><main>Hello</main></html>".to_string()),
        ),
        (
            "http://globex.example/privacy",
            StubResponse::Html("<html><main>Privacy</main></html>".to_string()),
        ),
    ]);
    let (tracker, _) = tracker_for(&ws, false, fetcher);

    tracker.track_changes(&["acme".to_string()]).await.unwrap();

    assert!(ws.snapshots().join("acme/TOS.html").exists());
    assert!(!ws.snapshots().join("globex").exists());
}

#[tokio::test]
async fn a_fatal_worker_error_aborts_the_batch_without_publishing() {
    let ws = Workspace::new();
    ws.declare("acme", ACME_TOS);

    let fetcher = StubFetcher::new([(
        "http://acme.example/tos",
        StubResponse::Broken("malformed location".to_string()),
    )]);
    let (tracker, listener) = tracker_for(&ws, true, fetcher);

    let result = tracker.track_changes(&[]).await;
    assert!(result.is_err());

    assert_eq!(listener.count_of("error acme TOS"), 1);
    assert_eq!(listener.count_of("records_published"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_tracking_is_capped_at_the_pool_size() {
    let ws = Workspace::new();
    let mut responses = Vec::new();

    for service in 0..10 {
        let mut documents = Vec::new();
        for doc in 0..10 {
            let location = format!("http://svc{service}.example/doc{doc}");
            documents.push(format!(
                r#""Doc {doc}": {{"fetch": "{location}", "select": ["main"]}}"#
            ));
            responses.push((
                location,
                StubResponse::Html(format!(
                    "<html><main>Body {service} {doc}</main></html>"
                )),
            ));
        }
        ws.declare(
            &format!("svc{service}"),
            &format!(r#"{{"documents": {{{}}}}}"#, documents.join(",")),
        );
    }

    let fetcher = StubFetcher::new(responses).with_delay(Duration::from_millis(100));
    let stats = fetcher.stats();
    let (tracker, _) = tracker_for(&ws, false, fetcher);

    let started = Instant::now();
    tracker.track_changes(&[]).await.unwrap();
    let elapsed = started.elapsed();

    let max_observed = stats.max_in_flight.load(Ordering::SeqCst);
    assert!(
        max_observed <= MAX_PARALLEL_DOCUMENT_TRACKS,
        "observed {max_observed} concurrent fetches"
    );
    assert!(max_observed >= 5, "observed only {max_observed} concurrent fetches");

    assert_eq!(commit_count(&ws.snapshots()), 100);
    assert_eq!(commit_count(&ws.versions()), 100);

    // 100 documents at 100ms each through 20 workers is five fetch waves;
    // anywhere near the serial ten seconds means the cap is broken.
    assert!(elapsed < Duration::from_secs(8), "batch took {elapsed:?}");
}
