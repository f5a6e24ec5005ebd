use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::declarations::{self, DocumentDeclaration, ServiceDeclaration, ServiceId};
use crate::error::{FetchError, TrackerError};
use crate::fetcher::Fetcher;
use crate::filter;
use crate::history::History;
use crate::recorder::{RecordId, RecordOutcome};

pub const MAX_PARALLEL_DOCUMENT_TRACKS: usize = 20;
pub const MAX_PARALLEL_REFILTERS: usize = 20;

/// Lifecycle notifications, one method per event. Every handler has an
/// empty default body, so listeners implement only the events they care
/// about.
pub trait TrackingListener: Send + Sync {
    fn on_first_snapshot_recorded(&self, _service_id: &str, _document_type: &str, _id: &RecordId) {}
    fn on_snapshot_recorded(&self, _service_id: &str, _document_type: &str, _id: &RecordId) {}
    fn on_snapshot_not_changed(&self, _service_id: &str, _document_type: &str) {}
    fn on_first_version_recorded(&self, _service_id: &str, _document_type: &str, _id: &RecordId) {}
    fn on_version_recorded(&self, _service_id: &str, _document_type: &str, _id: &RecordId) {}
    fn on_version_not_changed(&self, _service_id: &str, _document_type: &str) {}
    fn on_records_published(&self) {}
    fn on_inaccessible_content(&self, _error: &FetchError, _service_id: &str, _document_type: &str) {
    }
    fn on_error(&self, _error: &TrackerError, _service_id: &str, _document_type: &str) {}
}

#[derive(Clone, Copy)]
enum Operation {
    Track,
    Refilter,
}

/// One `(service, document)` unit of work, self-contained so workers never
/// reach back into the declarations map.
struct WorkItem {
    service_id: String,
    document_type: String,
    declaration: DocumentDeclaration,
}

struct WorkerContext<F> {
    history: Arc<History>,
    fetcher: Arc<F>,
    listeners: Arc<Vec<Arc<dyn TrackingListener>>>,
}

impl<F> Clone for WorkerContext<F> {
    fn clone(&self) -> Self {
        Self {
            history: Arc::clone(&self.history),
            fetcher: Arc::clone(&self.fetcher),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<F> WorkerContext<F> {
    fn emit(&self, notify: impl Fn(&dyn TrackingListener)) {
        for listener in self.listeners.iter() {
            notify(listener.as_ref());
        }
    }
}

/// The orchestrator: holds the declarations loaded at `init`, fans
/// documents out through a bounded worker pool, and publishes after every
/// clean batch.
///
/// Parallelism lives in fetching and filtering. Commits are serialized per
/// repository inside the recorders, so workers contend only there.
pub struct Tracker<F> {
    config: Config,
    fetcher: Arc<F>,
    history: Arc<History>,
    services: BTreeMap<ServiceId, ServiceDeclaration>,
    initialized: bool,
    listeners: Vec<Arc<dyn TrackingListener>>,
}

impl<F: Fetcher + 'static> Tracker<F> {
    pub fn new(config: Config, fetcher: F) -> Result<Self, TrackerError> {
        let history = Arc::new(History::open(&config.history)?);
        Ok(Self {
            config,
            fetcher: Arc::new(fetcher),
            history,
            services: BTreeMap::new(),
            initialized: false,
            listeners: Vec::new(),
        })
    }

    /// Load service declarations from disk. The map is never mutated after
    /// this; a second call is a no-op.
    pub fn init(&mut self) -> Result<(), TrackerError> {
        if self.initialized {
            return Ok(());
        }

        self.services = declarations::load_declarations(&self.config.service_declarations_path)?;
        self.initialized = true;
        tracing::info!(services = self.services.len(), "loaded service declarations");
        Ok(())
    }

    pub fn attach(&mut self, listener: Arc<dyn TrackingListener>) {
        self.listeners.push(listener);
    }

    pub fn service_ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.services.keys()
    }

    /// Fetch, snapshot, filter, and version every declared document of the
    /// given services (all services when empty), then publish.
    pub async fn track_changes(&self, service_ids: &[String]) -> Result<(), TrackerError> {
        self.run_batch(service_ids, Operation::Track, MAX_PARALLEL_DOCUMENT_TRACKS)
            .await
    }

    /// Re-derive versions from the latest archived snapshots without
    /// fetching, then publish.
    pub async fn refilter_and_record(&self, service_ids: &[String]) -> Result<(), TrackerError> {
        self.run_batch(service_ids, Operation::Refilter, MAX_PARALLEL_REFILTERS)
            .await
    }

    fn work_items(&self, service_ids: &[String]) -> Vec<WorkItem> {
        for requested in service_ids {
            if !self.services.contains_key(requested) {
                tracing::warn!(service_id = %requested, "no declaration for requested service");
            }
        }

        let mut items = Vec::new();
        for service in self.services.values() {
            if !service_ids.is_empty() && !service_ids.contains(&service.id) {
                continue;
            }
            for (document_type, declaration) in &service.documents {
                items.push(WorkItem {
                    service_id: service.id.clone(),
                    document_type: document_type.clone(),
                    declaration: declaration.clone(),
                });
            }
        }
        items
    }

    async fn run_batch(
        &self,
        service_ids: &[String],
        operation: Operation,
        max_parallel: usize,
    ) -> Result<(), TrackerError> {
        let context = WorkerContext {
            history: Arc::clone(&self.history),
            fetcher: Arc::clone(&self.fetcher),
            listeners: Arc::new(self.listeners.clone()),
        };

        drain_queue(&context, self.work_items(service_ids), operation, max_parallel).await?;

        // Only a clean drain publishes; an aborted batch never pushes.
        self.history.publish().await?;
        context.emit(|listener| listener.on_records_published());
        Ok(())
    }
}

/// Fixed worker pool over a FIFO channel. Submission is unbounded; the pool
/// size caps in-flight documents. Drain closes the channel and joins every
/// worker; the first hard error aborts the rest of the batch.
async fn drain_queue<F: Fetcher + 'static>(
    context: &WorkerContext<F>,
    items: Vec<WorkItem>,
    operation: Operation,
    max_parallel: usize,
) -> Result<(), TrackerError> {
    if items.is_empty() {
        return Ok(());
    }

    let worker_count = max_parallel.min(items.len());
    let (tx, rx) = mpsc::unbounded_channel();
    for item in items {
        // Receiver outlives this loop, so the sends cannot fail.
        let _ = tx.send(item);
    }
    drop(tx);

    let queue = Arc::new(Mutex::new(rx));
    let mut workers: JoinSet<Result<(), TrackerError>> = JoinSet::new();
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let context = context.clone();
        workers.spawn(async move {
            loop {
                let item = queue.lock().await.recv().await;
                let Some(item) = item else {
                    return Ok(());
                };
                process_item(&context, operation, item).await?;
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                    workers.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(TrackerError::Worker {
                        detail: join_err.to_string(),
                    });
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn process_item<F: Fetcher>(
    context: &WorkerContext<F>,
    operation: Operation,
    item: WorkItem,
) -> Result<(), TrackerError> {
    let result = match operation {
        Operation::Track => track_document(context, &item).await,
        Operation::Refilter => refilter_document(context, &item).await,
    };

    if let Err(err) = &result {
        tracing::error!(
            service_id = %item.service_id,
            document_type = %item.document_type,
            error = %err,
            "document pipeline failed"
        );
        context.emit(|listener| listener.on_error(err, &item.service_id, &item.document_type));
    }

    result
}

async fn track_document<F: Fetcher>(
    context: &WorkerContext<F>,
    item: &WorkItem,
) -> Result<(), TrackerError> {
    let fetched = match context.fetcher.fetch(&item.declaration.location).await {
        Ok(fetched) => fetched,
        Err(err) if err.is_inaccessible() => {
            tracing::warn!(
                service_id = %item.service_id,
                document_type = %item.document_type,
                error = %err,
                "content inaccessible"
            );
            context.emit(|listener| {
                listener.on_inaccessible_content(&err, &item.service_id, &item.document_type)
            });
            return Ok(());
        }
        Err(err) => return Err(TrackerError::Fetch(err)),
    };

    if fetched.content.is_empty() {
        tracing::debug!(
            service_id = %item.service_id,
            document_type = %item.document_type,
            "fetch returned no content"
        );
        return Ok(());
    }

    let outcome = context
        .history
        .record_snapshot(
            &item.service_id,
            &item.document_type,
            fetched.content.clone(),
            &fetched.mime_type,
        )
        .await?;

    let snapshot_id = match outcome {
        RecordOutcome::Unchanged => {
            context.emit(|listener| {
                listener.on_snapshot_not_changed(&item.service_id, &item.document_type)
            });
            return Ok(());
        }
        RecordOutcome::Recorded {
            id,
            is_first_record,
        } => {
            if is_first_record {
                context.emit(|listener| {
                    listener.on_first_snapshot_recorded(&item.service_id, &item.document_type, &id)
                });
            } else {
                context.emit(|listener| {
                    listener.on_snapshot_recorded(&item.service_id, &item.document_type, &id)
                });
            }
            id
        }
    };

    let cleaned = filter::extract(
        &fetched.content,
        &fetched.mime_type,
        &item.declaration,
        false,
    )?;

    // The version commit is dated to its snapshot, keeping both histories
    // chronologically aligned.
    let snapshot_date = context.history.snapshot_date(&snapshot_id).await?;
    let outcome = context
        .history
        .record_version(
            &item.service_id,
            &item.document_type,
            cleaned,
            &snapshot_id,
            snapshot_date,
        )
        .await?;

    emit_version_outcome(context, item, outcome);
    Ok(())
}

async fn refilter_document<F: Fetcher>(
    context: &WorkerContext<F>,
    item: &WorkItem,
) -> Result<(), TrackerError> {
    let Some(snapshot) = context
        .history
        .get_latest_snapshot(&item.service_id, &item.document_type)
        .await?
    else {
        tracing::debug!(
            service_id = %item.service_id,
            document_type = %item.document_type,
            "nothing to refilter"
        );
        return Ok(());
    };

    let cleaned = filter::extract(
        &snapshot.content,
        &snapshot.mime_type,
        &item.declaration,
        true,
    )?;

    let outcome = context
        .history
        .record_refilter(
            &item.service_id,
            &item.document_type,
            cleaned,
            &snapshot.id,
            snapshot.date,
        )
        .await?;

    emit_version_outcome(context, item, outcome);
    Ok(())
}

fn emit_version_outcome<F>(context: &WorkerContext<F>, item: &WorkItem, outcome: RecordOutcome) {
    match outcome {
        RecordOutcome::Unchanged => {
            context.emit(|listener| {
                listener.on_version_not_changed(&item.service_id, &item.document_type)
            });
        }
        RecordOutcome::Recorded {
            id,
            is_first_record: true,
        } => {
            context.emit(|listener| {
                listener.on_first_version_recorded(&item.service_id, &item.document_type, &id)
            });
        }
        RecordOutcome::Recorded { id, .. } => {
            context.emit(|listener| {
                listener.on_version_recorded(&item.service_id, &item.document_type, &id)
            });
        }
    }
}
