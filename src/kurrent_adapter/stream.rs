use eventstore::RecordedEvent;

use crate::error::Error;
use crate::event::{Event, EventMetadata};
use crate::{AggregateId, AggregateVersion};

/// Events of one aggregate stream as they come back from KurrentDB.
pub struct EventStream {
    pub(crate) stream: eventstore::ReadStream,
    pub(crate) aggregate_type: &'static str,
}

impl EventStream {
    /// The next event, or `None` at the end of the stream. A stream that was
    /// never written to reads as empty.
    pub async fn next(&mut self) -> Result<Option<Event>, Error> {
        match self.stream.next().await {
            Ok(None) | Err(eventstore::Error::ResourceNotFound) => Ok(None),
            Err(other) => Err(Error::EventStoreOther(other)),
            Ok(Some(resolved)) => {
                let recorded = resolved.get_original_event();
                to_event(recorded, self.aggregate_type).map(Some)
            }
        }
    }
}

pub(crate) fn to_event(recorded: &RecordedEvent, aggregate_type: &str) -> Result<Event, Error> {
    let metadata = if recorded.custom_metadata.is_empty() {
        None
    } else {
        let metadata = serde_json::from_slice::<EventMetadata>(&recorded.custom_metadata)
            .map_err(|source| Error::Deserialization {
                event_type: recorded.event_type.clone(),
                source,
            })?;
        Some(metadata)
    };

    Ok(Event::from_stored(
        recorded.id,
        AggregateId::from_stream_name(recorded.stream_id.clone()),
        aggregate_type,
        recorded.event_type.clone(),
        AggregateVersion::from_revision(recorded.revision),
        recorded.data.clone(),
        metadata,
        recorded.created,
    ))
}
