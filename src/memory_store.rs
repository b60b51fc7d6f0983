use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::event_store::AggregateStore;
use crate::{
    Aggregate, AggregateId, AggregateRoot, AggregateVersion, Error, Event, Snapshot, SnapshotPolicy,
};

const SUBSCRIPTION_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Streams {
    events: HashMap<AggregateId, Vec<Event>>,
    snapshots: HashMap<AggregateId, Snapshot>,
}

/// An in-process [`AggregateStore`].
///
/// Streams live in a shared map behind a `RwLock`, so clones of a
/// `MemoryStore` see the same data. Appends check the expected version and
/// write the whole batch under one write lock.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    streams: Arc<RwLock<Streams>>,
    snapshot_policy: SnapshotPolicy,
    committed: broadcast::Sender<Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (committed, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        Self {
            streams: Arc::new(RwLock::new(Streams::default())),
            snapshot_policy: SnapshotPolicy::default(),
            committed,
        }
    }

    pub fn with_snapshot_policy(mut self, snapshot_policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = snapshot_policy;
        self
    }

    /// All events stored for `aggregate_id`, in stream order.
    pub async fn events(&self, aggregate_id: &AggregateId) -> Vec<Event> {
        let streams = self.streams.read().await;
        streams
            .events
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The latest snapshot taken for `aggregate_id`, if any.
    pub async fn snapshot(&self, aggregate_id: &AggregateId) -> Option<Snapshot> {
        let streams = self.streams.read().await;
        streams.snapshots.get(aggregate_id).cloned()
    }

    /// Every event committed after the call, across all streams.
    ///
    /// A subscriber that falls too far behind skips the events it missed.
    pub fn subscribe(&self) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.committed.subscribe()).filter_map(|received| match received {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Subscriber lagged behind committed events");
                None
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateStore for MemoryStore {
    async fn exists(&self, aggregate_id: &AggregateId) -> Result<(), Error> {
        let streams = self.streams.read().await;
        match streams.events.get(aggregate_id) {
            Some(events) if !events.is_empty() => Ok(()),
            _ => Err(Error::AggregateNotFound(aggregate_id.clone())),
        }
    }

    #[tracing::instrument(skip(self, aggregate), fields(aggregate_id = %aggregate.id()))]
    async fn load<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        let streams = self.streams.read().await;

        if let Some(snapshot) = streams.snapshots.get(aggregate.id()) {
            if aggregate.is_new() && !aggregate.has_uncommitted_events() {
                tracing::debug!(version = %snapshot.version, "Restoring from snapshot");
                aggregate.restore(snapshot)?;
            }
        }

        let from = aggregate.version();
        let tail: Vec<Event> = streams
            .events
            .get(aggregate.id())
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.version() > from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        tracing::debug!(events = tail.len(), "Replaying stream");
        aggregate.load(tail)
    }

    #[tracing::instrument(skip(self, aggregate), fields(aggregate_id = %aggregate.id()))]
    async fn save<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        if !aggregate.has_uncommitted_events() {
            return Ok(());
        }

        let mut streams = self.streams.write().await;

        let expected = aggregate.original_version();
        let current = streams
            .events
            .get(aggregate.id())
            .and_then(|events| events.last())
            .map(Event::version)
            .unwrap_or(AggregateVersion::NEW);

        if current != expected {
            tracing::debug!(%expected, %current, "Stream moved since load");
            return Err(Error::WrongExpectedVersion {
                stream: aggregate.id().clone(),
                expected: (!expected.is_new()).then_some(expected),
                actual: (!current.is_new()).then_some(current),
            });
        }

        let snapshot = if self
            .snapshot_policy
            .should_snapshot(expected, aggregate.version())
        {
            Some(aggregate.snapshot()?)
        } else {
            None
        };

        let committed = aggregate.commit();
        streams
            .events
            .entry(aggregate.id().clone())
            .or_default()
            .extend(committed.iter().cloned());

        if let Some(snapshot) = snapshot {
            tracing::debug!(version = %snapshot.version, "Snapshot taken");
            streams.snapshots.insert(aggregate.id().clone(), snapshot);
        }

        tracing::debug!(
            events = committed.len(),
            version = %aggregate.version(),
            "Events appended"
        );

        for event in committed {
            // Nobody listening is fine.
            let _ = self.committed.send(event);
        }

        Ok(())
    }
}
