mod settings;
mod stream;

pub use settings::{ConnectionSettings, ConnectionSettingsBuilder};
pub use stream::EventStream;

use eventstore::{
    AppendToStreamOptions, Client, CurrentRevision, EventData, ExpectedRevision,
    ReadStreamOptions, StreamPosition,
};

use crate::event_store::AggregateStore;
use crate::{
    Aggregate, AggregateId, AggregateRoot, AggregateVersion, Error, Event, Snapshot, SnapshotPolicy,
};

const SNAPSHOT_EVENT_TYPE: &str = "$anamnesis-snapshot";

/// An [`AggregateStore`] backed by KurrentDB (formerly EventStoreDB).
///
/// Each aggregate is one stream named after its [`AggregateId`]. Event
/// payloads are written as JSON and [`crate::EventMetadata`] as JSON custom
/// metadata. Snapshots go to a `$snapshot-{aggregate_id}` stream, which no
/// derived [`AggregateId`] can name. Streams starting with `$` are system
/// streams, so the connecting user needs access to them.
#[derive(Clone)]
pub struct Kurrent {
    client: Client,
    snapshot_policy: SnapshotPolicy,
}

impl Kurrent {
    pub fn new(settings: &ConnectionSettings) -> Result<Self, Error> {
        let client = Client::new(settings.client_settings()?).map_err(|e| Error::InvalidConfig {
            message: format!("Failed to create KurrentDB client: {e}"),
            parameter: None,
        })?;
        Ok(Kurrent {
            client,
            snapshot_policy: SnapshotPolicy::default(),
        })
    }

    pub fn with_snapshot_policy(mut self, snapshot_policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = snapshot_policy;
        self
    }

    /// Reads `aggregate_id` forwards, starting at `from`.
    pub async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &'static str,
        from: StreamPosition<u64>,
    ) -> Result<EventStream, Error> {
        let options = ReadStreamOptions::default().forwards().position(from);
        let stream = self.client.read_stream(aggregate_id, &options).await?;
        Ok(EventStream {
            stream,
            aggregate_type,
        })
    }

    /// The latest snapshot written for `aggregate_id`, if any.
    pub async fn read_snapshot(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Option<Snapshot>, Error> {
        let options = ReadStreamOptions::default()
            .backwards()
            .position(StreamPosition::End)
            .max_count(1);

        let mut stream = self
            .client
            .read_stream(snapshot_stream(aggregate_id), &options)
            .await?;

        match stream.next().await {
            Ok(None) | Err(eventstore::Error::ResourceNotFound) => Ok(None),
            Err(other) => Err(Error::EventStoreOther(other)),
            Ok(Some(resolved)) => {
                let snapshot = resolved
                    .get_original_event()
                    .as_json::<Snapshot>()
                    .map_err(|source| Error::Deserialization {
                        event_type: SNAPSHOT_EVENT_TYPE.to_string(),
                        source,
                    })?;
                Ok(Some(snapshot))
            }
        }
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let data = EventData::json(SNAPSHOT_EVENT_TYPE, snapshot).map_err(|source| {
            Error::Serialization {
                event_type: SNAPSHOT_EVENT_TYPE.to_string(),
                source,
            }
        })?;
        let options = AppendToStreamOptions::default().expected_revision(ExpectedRevision::Any);
        self.client
            .append_to_stream(snapshot_stream(&snapshot.aggregate_id), &options, data)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Kurrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kurrent")
            .field("snapshot_policy", &self.snapshot_policy)
            .finish_non_exhaustive()
    }
}

impl AggregateStore for Kurrent {
    #[tracing::instrument(skip(self, aggregate_id), fields(aggregate_id = %aggregate_id))]
    async fn exists(&self, aggregate_id: &AggregateId) -> Result<(), Error> {
        let options = ReadStreamOptions::default()
            .forwards()
            .position(StreamPosition::Start)
            .max_count(1);
        let mut stream = self.client.read_stream(aggregate_id, &options).await?;

        match stream.next().await {
            Ok(Some(_)) => Ok(()),
            Ok(None) | Err(eventstore::Error::ResourceNotFound) => {
                Err(Error::AggregateNotFound(aggregate_id.clone()))
            }
            Err(other) => Err(Error::EventStoreOther(other)),
        }
    }

    #[tracing::instrument(skip(self, aggregate), fields(aggregate_id = %aggregate.id()))]
    async fn load<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        if aggregate.is_new() && !aggregate.has_uncommitted_events() {
            if let Some(snapshot) = self.read_snapshot(aggregate.id()).await? {
                tracing::debug!(version = %snapshot.version, "Restoring from snapshot");
                aggregate.restore(&snapshot)?;
            }
        }

        let from = aggregate.version().next().revision().unwrap_or(0);
        let mut stream = self
            .read_stream(aggregate.id(), A::AGGREGATE_TYPE, StreamPosition::Position(from))
            .await?;

        let mut replayed = 0usize;
        while let Some(event) = stream.next().await? {
            aggregate.load(std::iter::once(event))?;
            replayed += 1;
        }

        tracing::debug!(events = replayed, version = %aggregate.version(), "Replayed stream");
        Ok(())
    }

    #[tracing::instrument(skip(self, aggregate), fields(aggregate_id = %aggregate.id()))]
    async fn save<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        if !aggregate.has_uncommitted_events() {
            return Ok(());
        }

        let expected = aggregate.original_version();
        let expected_revision = match expected.revision() {
            Some(revision) => ExpectedRevision::Exact(revision),
            None => ExpectedRevision::NoStream,
        };

        let events = aggregate
            .uncommitted_events()
            .iter()
            .map(event_data)
            .collect::<Result<Vec<_>, _>>()?;

        let options = AppendToStreamOptions::default().expected_revision(expected_revision);

        match self
            .client
            .append_to_stream(aggregate.id(), &options, events)
            .await
        {
            Ok(_) => {}
            Err(eventstore::Error::WrongExpectedVersion { current, .. }) => {
                let actual = match current {
                    CurrentRevision::Current(revision) => {
                        Some(AggregateVersion::from_revision(revision))
                    }
                    CurrentRevision::NoStream => None,
                };
                tracing::debug!(%expected, ?actual, "Stream moved since load");
                return Err(Error::WrongExpectedVersion {
                    stream: aggregate.id().clone(),
                    expected: (!expected.is_new()).then_some(expected),
                    actual,
                });
            }
            Err(other) => return Err(Error::EventStoreOther(other)),
        }

        let committed = aggregate.commit();
        tracing::debug!(
            events = committed.len(),
            version = %aggregate.version(),
            "Events appended"
        );

        if self
            .snapshot_policy
            .should_snapshot(expected, aggregate.version())
        {
            // The events are durable at this point; a missing snapshot only
            // costs a longer replay next time.
            let written = match aggregate.snapshot() {
                Ok(snapshot) => self.write_snapshot(&snapshot).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!(error = %e, "Failed to write snapshot");
            }
        }

        Ok(())
    }
}

fn snapshot_stream(aggregate_id: &AggregateId) -> String {
    format!("$snapshot-{aggregate_id}")
}

fn event_data(event: &Event) -> Result<EventData, Error> {
    let serialization = |source| Error::Serialization {
        event_type: event.event_type().to_string(),
        source,
    };

    let payload = if event.data().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice::<serde_json::Value>(event.data()).map_err(serialization)?
    };

    let data = EventData::json(event.event_type(), &payload)
        .map_err(serialization)?
        .id(event.event_id());

    match event.metadata() {
        Some(metadata) => data.metadata_as_json(metadata).map_err(serialization),
        None => Ok(data),
    }
}
