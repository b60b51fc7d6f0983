//! Aggregates and the replay engine.
//!
//! An aggregate has no stored row of its own. Its state is the fold of its
//! event stream through [`Aggregate::when`], recomputed every time a command
//! targets it. [`AggregateRoot`] carries the bookkeeping shared by every
//! aggregate kind (stream id, tenant, version, uncommitted events) and wraps
//! the kind-specific state.
//!
//! Replay ([`AggregateRoot::load`]) and business logic
//! ([`AggregateRoot::apply`]) go through the same `when` dispatch, so the
//! in-memory state right after a command is exactly what a later replay of
//! the saved events produces.

mod id;
mod snapshot;

pub use id::{AggregateId, AggregateVersion, Tenant};
pub use snapshot::{Snapshot, SnapshotPolicy};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use crate::command::{CommandEnvelope, DomainCommand};
use crate::error::Error;
use crate::event::{DomainEvent, Event, EventMetadata, enrich_event_with_metadata};

/// Projected state of one aggregate kind.
///
/// # Examples
///
/// ```rust
/// use anamnesis::{
///     Aggregate, AggregateRoot, CommandEnvelope, DomainCommand, DomainEvent, Error, EventMetadata,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum CounterEvent {
///     #[serde(rename = "V1_COUNTER_INCREMENT")]
///     Incremented { by: u32 },
/// }
///
/// impl DomainEvent for CounterEvent {
///     const EVENT_TYPES: &'static [&'static str] = &["V1_COUNTER_INCREMENT"];
///     fn event_type(&self) -> &'static str {
///         "V1_COUNTER_INCREMENT"
///     }
/// }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum CounterCommand {
///     #[serde(rename = "Increment")]
///     Increment { by: u32 },
/// }
///
/// impl DomainCommand for CounterCommand {
///     const COMMAND_TYPES: &'static [&'static str] = &["Increment"];
///     fn command_type(&self) -> &'static str {
///         "Increment"
///     }
/// }
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Counter {
///     total: u64,
/// }
///
/// impl Aggregate for Counter {
///     const AGGREGATE_TYPE: &'static str = "counter";
///     type Event = CounterEvent;
///     type Command = CounterCommand;
///
///     fn when(&mut self, event: CounterEvent) -> Result<(), Error> {
///         match event {
///             CounterEvent::Incremented { by } => self.total += u64::from(by),
///         }
///         Ok(())
///     }
///
///     fn handle(
///         root: &mut AggregateRoot<Self>,
///         command: &CommandEnvelope<CounterCommand>,
///     ) -> Result<(), Error> {
///         let metadata = EventMetadata::from_command(command);
///         match &command.payload {
///             CounterCommand::Increment { by: 0 } => Ok(()),
///             CounterCommand::Increment { by } => {
///                 root.raise(&CounterEvent::Incremented { by: *by }, &metadata)
///             }
///         }
///     }
/// }
/// ```
pub trait Aggregate:
    Debug + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Tag identifying this aggregate kind; first segment of its stream ids.
    const AGGREGATE_TYPE: &'static str;

    /// The events this aggregate records.
    type Event: DomainEvent;

    /// The commands this aggregate accepts.
    type Command: DomainCommand;

    /// Folds one event into the state.
    ///
    /// Must be deterministic and free of side effects.
    fn when(&mut self, event: Self::Event) -> Result<(), Error>;

    /// Decides which events `command` produces given the current state and
    /// applies them to `root`.
    ///
    /// Producing no events is a successful no-op.
    fn handle(root: &mut AggregateRoot<Self>, command: &CommandEnvelope<Self::Command>)
    -> Result<(), Error>;
}

/// An aggregate instance together with its stream bookkeeping.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    tenant: Tenant,
    version: AggregateVersion,
    retain_applied_events: bool,
    applied_events: Vec<Event>,
    uncommitted_events: Vec<Event>,
    state: A,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A not-yet-loaded aggregate for `object_id` within `tenant`.
    pub fn new(tenant: Tenant, object_id: &str) -> Self {
        let id = AggregateId::new(A::AGGREGATE_TYPE, &tenant, object_id);
        Self {
            id,
            tenant,
            version: AggregateVersion::NEW,
            retain_applied_events: false,
            applied_events: Vec::new(),
            uncommitted_events: Vec::new(),
            state: A::default(),
        }
    }

    /// Restores an aggregate from a snapshot; replay continues with the
    /// events after the snapshot's version.
    pub fn from_snapshot(tenant: Tenant, snapshot: &Snapshot) -> Result<Self, Error> {
        let object_id = snapshot.aggregate_id.object_id(A::AGGREGATE_TYPE, &tenant).to_string();
        let mut root = Self::new(tenant, &object_id);
        root.restore(snapshot)?;
        Ok(root)
    }

    /// Keeps loaded and saved events in [`AggregateRoot::applied_events`].
    pub fn with_applied_events_retention(mut self) -> Self {
        self.retain_applied_events = true;
        self
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    pub fn object_id(&self) -> &str {
        self.id.object_id(A::AGGREGATE_TYPE, &self.tenant)
    }

    pub fn version(&self) -> AggregateVersion {
        self.version
    }

    /// True while the aggregate has neither loaded nor applied any event.
    pub fn is_new(&self) -> bool {
        self.version.is_new()
    }

    /// The version the store must still be at for a save to succeed.
    pub fn original_version(&self) -> AggregateVersion {
        let pending = i64::try_from(self.uncommitted_events.len()).unwrap_or(i64::MAX);
        AggregateVersion::new(self.version.value() - pending)
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn applied_events(&self) -> &[Event] {
        &self.applied_events
    }

    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted_events
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted_events.is_empty()
    }

    /// Replays history onto the aggregate.
    ///
    /// Every event must belong to this stream and carry the next version.
    /// Store-internal events advance the version without being dispatched.
    pub fn load<I>(&mut self, events: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Event>,
    {
        for event in events {
            self.check_aggregate_id(&event)?;

            let expected = self.version.next();
            if event.version() != expected {
                return Err(Error::InvalidEventVersion {
                    aggregate_id: self.id.clone(),
                    expected,
                    actual: event.version(),
                });
            }

            self.when(&event)?;
            self.version = expected;

            if self.retain_applied_events {
                self.applied_events.push(event);
            }
        }
        Ok(())
    }

    /// Applies a freshly produced event and buffers it for saving.
    ///
    /// The event's version is assigned here, once, in application order.
    pub fn apply(&mut self, mut event: Event) -> Result<(), Error> {
        self.check_aggregate_id(&event)?;
        self.when(&event)?;

        self.version = self.version.next();
        event.set_version(self.version);
        self.uncommitted_events.push(event);
        Ok(())
    }

    /// Applies `events` in order, stopping at the first failure.
    ///
    /// Events applied before the failure stay applied; discard the instance
    /// after an error.
    pub fn apply_all<I>(&mut self, events: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Event>,
    {
        events.into_iter().try_for_each(|event| self.apply(event))
    }

    /// Builds an envelope for `payload` addressed to this aggregate.
    pub fn new_event(&self, payload: &A::Event) -> Result<Event, Error> {
        let mut event = Event::new(self, payload.event_type());
        event.set_json_data(&payload.to_json_data()?)?;
        Ok(event)
    }

    /// Builds, enriches and applies an event in one step.
    pub fn raise(&mut self, payload: &A::Event, metadata: &EventMetadata) -> Result<(), Error> {
        let mut event = self.new_event(payload)?;
        enrich_event_with_metadata(&mut event, metadata);
        self.apply(event)
    }

    /// Materializes the current state at the current version.
    pub fn snapshot(&self) -> Result<Snapshot, Error> {
        Snapshot::capture(&self.id, A::AGGREGATE_TYPE, self.version, &self.state)
    }

    /// Marks the uncommitted events as durable.
    pub(crate) fn commit(&mut self) -> Vec<Event> {
        let committed = std::mem::take(&mut self.uncommitted_events);
        if self.retain_applied_events {
            self.applied_events.extend(committed.iter().cloned());
        }
        committed
    }

    /// Replaces the state of a not-yet-loaded aggregate with `snapshot`.
    pub(crate) fn restore(&mut self, snapshot: &Snapshot) -> Result<(), Error> {
        if snapshot.aggregate_id != self.id {
            return Err(Error::InvalidAggregateId {
                expected: self.id.clone(),
                actual: snapshot.aggregate_id.clone(),
            });
        }
        self.state = snapshot.state()?;
        self.version = snapshot.version;
        Ok(())
    }

    fn check_aggregate_id(&self, event: &Event) -> Result<(), Error> {
        if event.aggregate_id() != &self.id {
            return Err(Error::InvalidAggregateId {
                expected: self.id.clone(),
                actual: event.aggregate_id().clone(),
            });
        }
        Ok(())
    }

    fn when(&mut self, event: &Event) -> Result<(), Error> {
        if event.is_internal() {
            return Ok(());
        }
        let domain_event = A::Event::decode(event, A::AGGREGATE_TYPE)?;
        self.state.when(domain_event)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum NoteEvent {
        #[serde(rename = "V1_NOTE_CREATE")]
        Created { text: String },
        #[serde(rename = "V1_NOTE_APPEND")]
        Appended { text: String },
    }

    impl DomainEvent for NoteEvent {
        const EVENT_TYPES: &'static [&'static str] = &["V1_NOTE_CREATE", "V1_NOTE_APPEND"];

        fn event_type(&self) -> &'static str {
            match self {
                NoteEvent::Created { .. } => "V1_NOTE_CREATE",
                NoteEvent::Appended { .. } => "V1_NOTE_APPEND",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum NoteCommand {
        #[serde(rename = "AppendNote")]
        Append { text: String },
    }

    impl DomainCommand for NoteCommand {
        const COMMAND_TYPES: &'static [&'static str] = &["AppendNote"];

        fn command_type(&self) -> &'static str {
            "AppendNote"
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Note {
        pub(crate) text: String,
        pub(crate) edits: u32,
    }

    impl Aggregate for Note {
        const AGGREGATE_TYPE: &'static str = "note";
        type Event = NoteEvent;
        type Command = NoteCommand;

        fn when(&mut self, event: NoteEvent) -> Result<(), Error> {
            match event {
                NoteEvent::Created { text } => self.text = text,
                NoteEvent::Appended { text } => {
                    self.text.push_str(&text);
                    self.edits += 1;
                }
            }
            Ok(())
        }

        fn handle(
            root: &mut AggregateRoot<Self>,
            command: &CommandEnvelope<NoteCommand>,
        ) -> Result<(), Error> {
            let metadata = EventMetadata::from_command(command);
            let NoteCommand::Append { text } = &command.payload;
            if root.is_new() {
                root.raise(&NoteEvent::Created { text: text.clone() }, &metadata)
            } else {
                root.raise(&NoteEvent::Appended { text: text.clone() }, &metadata)
            }
        }
    }

    pub(crate) fn tenant() -> Tenant {
        Tenant::try_new("acme").unwrap()
    }

    fn stored(root: &AggregateRoot<Note>, version: i64, payload: &NoteEvent) -> Event {
        let event = root.new_event(payload).unwrap();
        Event::from_stored(
            Uuid::new_v4(),
            root.id().clone(),
            Note::AGGREGATE_TYPE,
            payload.event_type(),
            AggregateVersion::new(version),
            event.data().clone(),
            None,
            Utc::now(),
        )
    }

    fn history(root: &AggregateRoot<Note>) -> Vec<Event> {
        vec![
            stored(root, 0, &NoteEvent::Created { text: "a".to_string() }),
            stored(root, 1, &NoteEvent::Appended { text: "b".to_string() }),
            stored(root, 2, &NoteEvent::Appended { text: "c".to_string() }),
        ]
    }

    #[test]
    fn replay_is_deterministic() {
        let template = AggregateRoot::<Note>::new(tenant(), "n-1");
        let events = history(&template);

        let mut first = AggregateRoot::<Note>::new(tenant(), "n-1");
        first.load(events.clone()).unwrap();
        let mut second = AggregateRoot::<Note>::new(tenant(), "n-1");
        second.load(events).unwrap();

        assert_eq!(first.state(), second.state());
        assert_eq!(first.version(), second.version());
        assert_eq!(first.version(), AggregateVersion::new(2));
        assert_eq!(first.state().text, "abc");
        assert!(!first.has_uncommitted_events());
    }

    #[test]
    fn load_rejects_events_of_another_stream() {
        let other = AggregateRoot::<Note>::new(tenant(), "n-2");
        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1");
        match root.load(history(&other)) {
            Err(Error::InvalidAggregateId { expected, actual }) => {
                assert_eq!(&expected, root.id());
                assert_eq!(&actual, other.id());
            }
            other => panic!("Expected InvalidAggregateId, got {:?}", other),
        }
    }

    #[test]
    fn load_rejects_version_gaps() {
        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1");
        let mut events = history(&root);
        events.remove(1);
        match root.load(events) {
            Err(Error::InvalidEventVersion {
                expected, actual, ..
            }) => {
                assert_eq!(expected, AggregateVersion::new(1));
                assert_eq!(actual, AggregateVersion::new(2));
            }
            other => panic!("Expected InvalidEventVersion, got {:?}", other),
        }
    }

    #[test]
    fn load_rejects_unknown_event_types() {
        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1");
        let event = Event::from_stored(
            Uuid::new_v4(),
            root.id().clone(),
            Note::AGGREGATE_TYPE,
            "V9_NOTE_SHRED",
            AggregateVersion::new(0),
            Bytes::from_static(b"{}"),
            None,
            Utc::now(),
        );
        assert!(matches!(
            root.load(vec![event]),
            Err(Error::InvalidEventType { .. })
        ));
        assert!(root.is_new());
    }

    #[test]
    fn internal_events_advance_the_version_only() {
        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1");
        let mut events = history(&root);
        events.push(Event::from_stored(
            Uuid::new_v4(),
            root.id().clone(),
            Note::AGGREGATE_TYPE,
            "$metadata",
            AggregateVersion::new(3),
            Bytes::new(),
            None,
            Utc::now(),
        ));
        root.load(events).unwrap();
        assert_eq!(root.version(), AggregateVersion::new(3));
        assert_eq!(root.state().text, "abc");
    }

    #[test]
    fn apply_assigns_next_version_and_buffers_event() {
        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1");
        let metadata = EventMetadata::new(tenant());

        root.raise(&NoteEvent::Created { text: "x".to_string() }, &metadata)
            .unwrap();
        assert_eq!(root.version(), AggregateVersion::new(0));
        assert_eq!(root.uncommitted_events()[0].version(), root.version());

        let before = root.version();
        root.raise(&NoteEvent::Appended { text: "y".to_string() }, &metadata)
            .unwrap();
        assert_eq!(root.version(), before.next());
        assert_eq!(root.uncommitted_events()[1].version(), root.version());
        assert_eq!(root.original_version(), AggregateVersion::NEW);
        assert_eq!(root.state().text, "xy");
    }

    #[test]
    fn applied_state_matches_replayed_state() {
        let mut writer = AggregateRoot::<Note>::new(tenant(), "n-1");
        let metadata = EventMetadata::new(tenant());
        writer
            .raise(&NoteEvent::Created { text: "x".to_string() }, &metadata)
            .unwrap();
        writer
            .raise(&NoteEvent::Appended { text: "y".to_string() }, &metadata)
            .unwrap();

        let mut reader = AggregateRoot::<Note>::new(tenant(), "n-1");
        reader.load(writer.commit()).unwrap();

        assert_eq!(reader.state(), writer.state());
        assert_eq!(reader.version(), writer.version());
    }

    #[test]
    fn apply_rejects_event_for_other_aggregate() {
        let other = AggregateRoot::<Note>::new(tenant(), "n-2");
        let event = other
            .new_event(&NoteEvent::Created { text: "x".to_string() })
            .unwrap();

        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1");
        assert!(matches!(
            root.apply(event),
            Err(Error::InvalidAggregateId { .. })
        ));
        assert!(root.is_new());
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn apply_all_stops_at_first_failure() {
        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1");
        let other = AggregateRoot::<Note>::new(tenant(), "n-2");

        let events = vec![
            root.new_event(&NoteEvent::Created { text: "x".to_string() })
                .unwrap(),
            other
                .new_event(&NoteEvent::Appended { text: "y".to_string() })
                .unwrap(),
            root.new_event(&NoteEvent::Appended { text: "z".to_string() })
                .unwrap(),
        ];

        assert!(root.apply_all(events).is_err());
        assert_eq!(root.uncommitted_events().len(), 1);
        assert_eq!(root.state().text, "x");
    }

    #[test]
    fn commit_moves_events_into_history_when_retained() {
        let mut root = AggregateRoot::<Note>::new(tenant(), "n-1").with_applied_events_retention();
        root.raise(
            &NoteEvent::Created { text: "x".to_string() },
            &EventMetadata::new(tenant()),
        )
        .unwrap();

        let committed = root.commit();
        assert_eq!(committed.len(), 1);
        assert!(!root.has_uncommitted_events());
        assert_eq!(root.applied_events().len(), 1);
        assert_eq!(root.original_version(), root.version());
    }

    #[test]
    fn snapshot_plus_tail_equals_full_replay() {
        let template = AggregateRoot::<Note>::new(tenant(), "n-1");
        let events = history(&template);

        let mut full = AggregateRoot::<Note>::new(tenant(), "n-1");
        full.load(events.clone()).unwrap();

        let mut head = AggregateRoot::<Note>::new(tenant(), "n-1");
        head.load(events[..2].to_vec()).unwrap();
        let snapshot = head.snapshot().unwrap();

        let mut restored = AggregateRoot::<Note>::from_snapshot(tenant(), &snapshot).unwrap();
        restored.load(events[2..].to_vec()).unwrap();

        assert_eq!(restored.state(), full.state());
        assert_eq!(restored.version(), full.version());
    }
}
