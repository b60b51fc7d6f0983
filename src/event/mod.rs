//! Event envelopes and domain event decoding.
//!
//! Every fact persisted by the runtime travels inside an [`Event`] envelope:
//! the owning stream, a versioned type tag, the JSON payload and the metadata
//! stamped on by the command that produced it. Each aggregate kind describes
//! the payloads it understands as one closed enum implementing
//! [`DomainEvent`].
//!
//! # Examples
//!
//! ```rust
//! use anamnesis::DomainEvent;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum OrderEvent {
//!     #[serde(rename = "V1_ORDER_CREATE")]
//!     Created { customer_id: String },
//!     #[serde(rename = "V1_ORDER_CANCEL")]
//!     Cancelled { reason: String },
//! }
//!
//! impl DomainEvent for OrderEvent {
//!     const EVENT_TYPES: &'static [&'static str] = &["V1_ORDER_CREATE", "V1_ORDER_CANCEL"];
//!
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             OrderEvent::Created { .. } => "V1_ORDER_CREATE",
//!             OrderEvent::Cancelled { .. } => "V1_ORDER_CANCEL",
//!         }
//!     }
//! }
//! ```
//!
//! # Schema Evolution
//!
//! The version lives in the tag. A breaking payload change gets a new tag
//! (`V2_ORDER_CREATE`) and a new variant, while the old variant stays so that
//! existing streams keep replaying.

mod metadata;

pub use metadata::{EventMetadata, enrich_event_with_metadata};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::error::Error;
use crate::{AggregateId, AggregateVersion};

/// Prefix of event types the store writes for its own bookkeeping.
pub const INTERNAL_EVENT_PREFIX: &str = "$";

/// One durable fact about an aggregate.
///
/// Envelopes are immutable once built, except for `version`, which is assigned
/// exactly once when the event enters an aggregate's uncommitted buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: Uuid,
    aggregate_id: AggregateId,
    aggregate_type: String,
    event_type: String,
    version: AggregateVersion,
    data: Bytes,
    metadata: Option<EventMetadata>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an empty envelope addressed to `aggregate`.
    pub fn new<A: Aggregate>(aggregate: &AggregateRoot<A>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate.id().clone(),
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            event_type: event_type.into(),
            version: AggregateVersion::NEW,
            data: Bytes::new(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Rebuilds an envelope read back from a store.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored(
        event_id: Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        version: AggregateVersion,
        data: Bytes,
        metadata: Option<EventMetadata>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            version,
            data,
            metadata,
            timestamp,
        }
    }

    /// Serializes `payload` as the event data.
    pub fn set_json_data<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<(), Error> {
        let encoded = serde_json::to_vec(payload).map_err(|source| Error::Serialization {
            event_type: self.event_type.clone(),
            source,
        })?;
        self.data = Bytes::from(encoded);
        Ok(())
    }

    /// Deserializes the event data into `T`.
    pub fn get_json_data<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.data).map_err(|source| Error::Deserialization {
            event_type: self.event_type.clone(),
            source,
        })
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> AggregateVersion {
        self.version
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> Option<&EventMetadata> {
        self.metadata.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the store wrote this event for its own bookkeeping.
    pub fn is_internal(&self) -> bool {
        self.event_type.starts_with(INTERNAL_EVENT_PREFIX)
    }

    pub(crate) fn set_version(&mut self, version: AggregateVersion) {
        self.version = version;
    }

    pub(crate) fn set_metadata(&mut self, metadata: EventMetadata) {
        self.metadata = Some(metadata);
    }
}

/// The closed set of payloads one aggregate kind can record.
///
/// Implementors are serde enums tagged adjacently with
/// `#[serde(tag = "type", content = "data")]`, one variant per versioned
/// event type. [`DomainEvent::decode`] refuses any tag outside
/// [`DomainEvent::EVENT_TYPES`], so a stream written by a newer deployment
/// fails loudly instead of being half-applied.
pub trait DomainEvent: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + Sized {
    /// Every event type tag this enum has a variant for.
    const EVENT_TYPES: &'static [&'static str];

    /// Returns the type tag of this value.
    fn event_type(&self) -> &'static str;

    /// Serializes only the variant's content, without the tag.
    fn to_json_data(&self) -> Result<serde_json::Value, Error> {
        let tagged = serde_json::to_value(self).map_err(|source| Error::Serialization {
            event_type: self.event_type().to_string(),
            source,
        })?;
        Ok(match tagged {
            serde_json::Value::Object(mut map) => {
                map.remove("data").unwrap_or(serde_json::Value::Null)
            }
            other => other,
        })
    }

    /// Decodes an envelope produced for this aggregate kind.
    fn decode(event: &Event, aggregate_type: &str) -> Result<Self, Error> {
        decode_tagged(
            Self::EVENT_TYPES,
            event.event_type(),
            event.data(),
            |tag| Error::InvalidEventType {
                aggregate_type: aggregate_type.to_string(),
                event_type: tag.to_string(),
            },
        )
    }
}

/// Reassembles an adjacently tagged value from a tag and its raw JSON content.
pub(crate) fn decode_tagged<T: DeserializeOwned>(
    known: &[&str],
    tag: &str,
    data: &[u8],
    unknown: impl FnOnce(&str) -> Error,
) -> Result<T, Error> {
    if !known.contains(&tag) {
        return Err(unknown(tag));
    }

    let content = if data.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice::<serde_json::Value>(data).map_err(|source| {
            Error::Deserialization {
                event_type: tag.to_string(),
                source,
            }
        })?
    };

    let tagged = if content.is_null() {
        serde_json::json!({ "type": tag })
    } else {
        serde_json::json!({ "type": tag, "data": content })
    };

    serde_json::from_value(tagged).map_err(|source| Error::Deserialization {
        event_type: tag.to_string(),
        source,
    })
}
