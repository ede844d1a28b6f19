//! Store change notifications and their routing to the aggregation engine.
//!
//! Events for one repository are applied strictly in arrival order; events for
//! different repositories are applied concurrently on the blocking pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::aggregator::{Aggregator, Outcome};
use crate::model::{DescriptorKind, Fragment, IndexOperation, RepoPath};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Stored,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub repository_id: String,
    pub path: RepoPath,
    pub kind: StoreEventKind,
    /// Last known content; delete notifications carry it so removal still works
    /// once the item is gone.
    pub content: Option<Vec<u8>>,
}

impl StoreEvent {
    pub fn stored(repository_id: impl Into<String>, path: RepoPath) -> Self {
        Self {
            repository_id: repository_id.into(),
            path,
            kind: StoreEventKind::Stored,
            content: None,
        }
    }

    pub fn deleted(
        repository_id: impl Into<String>,
        path: RepoPath,
        snapshot: Option<Vec<u8>>,
    ) -> Self {
        Self {
            repository_id: repository_id.into(),
            path,
            kind: StoreEventKind::Deleted,
            content: snapshot,
        }
    }

    fn fragment(&self) -> Fragment {
        Fragment {
            repository_id: self.repository_id.clone(),
            path: self.path.clone(),
            content: self.content.clone(),
        }
    }
}

/// Decides which engine operation, if any, a store event triggers.
pub struct EventInspector {
    aggregator: Arc<Aggregator>,
}

impl EventInspector {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }

    /// `None` for events that do not concern a fragment.
    pub fn classify(event: &StoreEvent) -> Option<(DescriptorKind, IndexOperation)> {
        if event.path.is_hidden() {
            return None;
        }
        let kind = DescriptorKind::classify(&event.path)?;
        let operation = match event.kind {
            StoreEventKind::Stored => IndexOperation::Merge,
            StoreEventKind::Deleted => IndexOperation::Remove,
        };
        Some((kind, operation))
    }

    /// Runs the matching operation. Blocks on the repository's index lock.
    pub fn inspect(&self, event: &StoreEvent) -> Option<Outcome> {
        let Some((kind, operation)) = Self::classify(event) else {
            trace!(repository = %event.repository_id, path = %event.path, "ignoring event");
            return None;
        };
        let fragment = event.fragment();
        let outcome = match (kind, operation) {
            (DescriptorKind::Artifacts, IndexOperation::Merge) => {
                self.aggregator.update_artifacts(&fragment)
            }
            (DescriptorKind::Artifacts, IndexOperation::Remove) => {
                self.aggregator.remove_artifacts(&fragment)
            }
            (DescriptorKind::Metadata, IndexOperation::Merge) => {
                self.aggregator.update_metadata(&fragment)
            }
            (DescriptorKind::Metadata, IndexOperation::Remove) => {
                self.aggregator.remove_metadata(&fragment)
            }
        };
        Some(outcome)
    }
}

struct Worker {
    sender: mpsc::UnboundedSender<StoreEvent>,
    handle: JoinHandle<()>,
}

/// Fans events out to one sequential worker per repository.
///
/// A worker that sees no event for the idle timeout exits; the next event for
/// its repository starts a fresh one, so the worker set tracks active
/// repositories rather than every repository ever seen.
pub struct EventRouter {
    sender: mpsc::Sender<StoreEvent>,
    dispatcher: JoinHandle<()>,
}

impl EventRouter {
    /// Starts the dispatcher on the current tokio runtime.
    pub fn spawn(inspector: Arc<EventInspector>) -> Self {
        Self::with_capacity(inspector, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(inspector: Arc<EventInspector>, capacity: usize) -> Self {
        Self::with_limits(inspector, capacity, DEFAULT_WORKER_IDLE_TIMEOUT)
    }

    pub fn with_limits(
        inspector: Arc<EventInspector>,
        capacity: usize,
        worker_idle_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let dispatcher = tokio::spawn(dispatch(inspector, receiver, worker_idle_timeout));
        Self { sender, dispatcher }
    }

    /// Handle for producers; events queue while the dispatcher is busy.
    pub fn sender(&self) -> mpsc::Sender<StoreEvent> {
        self.sender.clone()
    }

    /// Queues an event. Returns `false` when the router has shut down.
    pub async fn publish(&self, event: StoreEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }

    /// Stops accepting events and waits until every queued event was applied.
    /// Clones handed out by [`EventRouter::sender`] must be dropped first.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(err) = self.dispatcher.await {
            warn!(error = %err, "event dispatcher terminated abnormally");
        }
    }
}

async fn dispatch(
    inspector: Arc<EventInspector>,
    mut receiver: mpsc::Receiver<StoreEvent>,
    idle_timeout: Duration,
) {
    let mut workers: HashMap<String, Worker> = HashMap::new();

    while let Some(event) = receiver.recv().await {
        if EventInspector::classify(&event).is_none() {
            trace!(repository = %event.repository_id, path = %event.path, "ignoring event");
            continue;
        }
        workers.retain(|_, worker| !worker.handle.is_finished());

        let repository_id = event.repository_id.clone();
        let worker = workers.entry(repository_id.clone()).or_insert_with(|| {
            debug!(repository = %repository_id, "starting repository worker");
            spawn_worker(inspector.clone(), repository_id.clone(), idle_timeout)
        });
        let event = match worker.sender.send(event) {
            Ok(()) => continue,
            Err(mpsc::error::SendError(event)) => event,
        };

        // the worker closed its queue on idle timeout but is still draining it;
        // its replacement may only start once it is done
        if let Some(stale) = workers.remove(&repository_id) {
            join_worker(&repository_id, stale).await;
        }
        debug!(repository = %repository_id, "restarting repository worker");
        let worker = spawn_worker(inspector.clone(), repository_id.clone(), idle_timeout);
        if let Err(mpsc::error::SendError(event)) = worker.sender.send(event) {
            warn!(
                repository = %repository_id,
                path = %event.path,
                "repository worker is gone, dropping event"
            );
        }
        workers.insert(repository_id, worker);
    }

    for (repository_id, worker) in workers {
        join_worker(&repository_id, worker).await;
    }
}

async fn join_worker(repository_id: &str, worker: Worker) {
    drop(worker.sender);
    if let Err(err) = worker.handle.await {
        warn!(repository = %repository_id, error = %err, "repository worker terminated abnormally");
    }
}

fn spawn_worker(
    inspector: Arc<EventInspector>,
    repository_id: String,
    idle_timeout: Duration,
) -> Worker {
    let (sender, mut receiver) = mpsc::unbounded_channel::<StoreEvent>();
    let handle = tokio::spawn(async move {
        loop {
            match time::timeout(idle_timeout, receiver.recv()).await {
                Ok(Some(event)) => run_event(&inspector, &repository_id, event).await,
                Ok(None) => break,
                Err(_) => {
                    receiver.close();
                    while let Ok(event) = receiver.try_recv() {
                        run_event(&inspector, &repository_id, event).await;
                    }
                    debug!(repository = %repository_id, "repository worker idle, exiting");
                    break;
                }
            }
        }
    });
    Worker { sender, handle }
}

async fn run_event(inspector: &Arc<EventInspector>, repository_id: &str, event: StoreEvent) {
    let path = event.path.clone();
    let result = task::spawn_blocking({
        let inspector = inspector.clone();
        move || inspector.inspect(&event)
    })
    .await;
    match result {
        Ok(outcome) => trace!(
            repository = %repository_id,
            path = %path,
            outcome = outcome.map(Outcome::as_str).unwrap_or("ignored"),
            "event applied"
        ),
        Err(err) => warn!(
            repository = %repository_id,
            path = %path,
            error = %err,
            "event handler panicked"
        ),
    }
}
