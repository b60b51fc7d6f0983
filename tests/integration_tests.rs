use anamnesis::domain::contact::{Contact, ContactCommand, ContactFields, UpsertContact};
use anamnesis::domain::opportunity::{InternalStage, Opportunity, OpportunityCommand};
use anamnesis::{
    Aggregate, AggregateId, AggregateRoot, AggregateStore, CancellationToken, CommandEnvelope,
    Error, ExecuteConfig, LoadOptions, MemoryStore, RawCommand, SnapshotPolicy, Tenant, execute,
    execute_cancellable, load_aggregate,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

mod test_helpers {
    use super::*;

    pub fn tenant() -> Tenant {
        Tenant::try_new("acme").expect("Failed to build tenant")
    }

    pub fn fast_config() -> ExecuteConfig {
        ExecuteConfig::default()
            .with_base_delay(1)
            .expect("Failed to set base_delay")
            .with_max_delay(10)
            .expect("Failed to set max_delay")
    }

    pub fn upsert(object_id: &str, first_name: &str) -> CommandEnvelope<ContactCommand> {
        CommandEnvelope::new(
            tenant(),
            object_id,
            "web",
            ContactCommand::Upsert(UpsertContact {
                fields: ContactFields {
                    first_name: first_name.to_string(),
                    ..ContactFields::default()
                },
                ..UpsertContact::default()
            }),
        )
        .with_actor("user-1")
    }

    pub fn add_tag(object_id: &str, tag_id: &str) -> CommandEnvelope<ContactCommand> {
        CommandEnvelope::new(
            tenant(),
            object_id,
            "web",
            ContactCommand::AddTag {
                tag_id: tag_id.to_string(),
            },
        )
    }

    pub fn opportunity(
        object_id: &str,
        payload: OpportunityCommand,
    ) -> CommandEnvelope<OpportunityCommand> {
        CommandEnvelope::new(tenant(), object_id, "web", payload)
    }

    pub fn create_renewal() -> OpportunityCommand {
        OpportunityCommand::CreateRenewal {
            contract_id: "k-1".to_string(),
            renewal_likelihood: None,
            renewal_approved: false,
            renewed_at: None,
            renewal_adjusted_rate: 0,
            source: Default::default(),
        }
    }

    pub fn contact_id(object_id: &str) -> AggregateId {
        AggregateId::new(Contact::AGGREGATE_TYPE, &tenant(), object_id)
    }
}

use test_helpers::*;

/// Runs a competing write right before its first save goes through.
struct RacingStore {
    inner: MemoryStore,
    before_first_save: Mutex<Option<BoxFuture<'static, Result<(), Error>>>>,
}

impl RacingStore {
    fn new<F>(inner: MemoryStore, competing_write: F) -> Self
    where
        F: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self {
            inner,
            before_first_save: Mutex::new(Some(Box::pin(competing_write))),
        }
    }
}

impl AggregateStore for RacingStore {
    async fn exists(&self, aggregate_id: &AggregateId) -> Result<(), Error> {
        self.inner.exists(aggregate_id).await
    }

    async fn load<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        self.inner.load(aggregate).await
    }

    async fn save<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        let hook = self.before_first_save.lock().await.take();
        if let Some(hook) = hook {
            hook.await?;
        }
        self.inner.save(aggregate).await
    }
}

/// Loses every race it enters.
#[derive(Default)]
struct ConflictingStore {
    inner: MemoryStore,
    loads: AtomicU32,
    saves: AtomicU32,
}

impl AggregateStore for ConflictingStore {
    async fn exists(&self, aggregate_id: &AggregateId) -> Result<(), Error> {
        self.inner.exists(aggregate_id).await
    }

    async fn load<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(aggregate).await
    }

    async fn save<A: Aggregate>(&self, aggregate: &mut AggregateRoot<A>) -> Result<(), Error> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Err(Error::WrongExpectedVersion {
            stream: aggregate.id().clone(),
            expected: None,
            actual: Some(aggregate.version().next()),
        })
    }
}

#[tokio::test]
async fn test_execute_creates_and_updates_contact() {
    let store = MemoryStore::new();

    let created = execute::<Contact, _>(&store, upsert("c-1", "John"), fast_config())
        .await
        .expect("Failed to create contact");
    assert_eq!(created.version().value(), 0);
    assert!(!created.has_uncommitted_events());

    let updated = execute::<Contact, _>(&store, upsert("c-1", "Johnny"), fast_config())
        .await
        .expect("Failed to update contact");
    assert_eq!(updated.version().value(), 1);
    assert_eq!(updated.state().fields.first_name, "Johnny");

    let events = store.events(&contact_id("c-1")).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type(), "V1_CONTACT_CREATE");
    assert_eq!(events[1].event_type(), "V1_CONTACT_UPDATE");
    assert_eq!(
        events[1].metadata().and_then(|m| m.user_id.as_deref()),
        Some("user-1")
    );

    store
        .exists(&contact_id("c-1"))
        .await
        .expect("Contact stream should exist");
}

#[tokio::test]
async fn test_no_op_command_writes_nothing() {
    let store = MemoryStore::new();
    execute::<Contact, _>(&store, upsert("c-1", "John"), fast_config())
        .await
        .expect("Failed to create contact");

    let unchanged = execute::<Contact, _>(&store, upsert("c-1", "John"), fast_config())
        .await
        .expect("Identical upsert should succeed");

    assert_eq!(unchanged.version().value(), 0);
    assert_eq!(store.events(&contact_id("c-1")).await.len(), 1);
}

#[tokio::test]
async fn test_retries_after_concurrent_modification() {
    let store = MemoryStore::new();
    execute::<Contact, _>(&store, upsert("c-1", "John"), fast_config())
        .await
        .expect("Failed to create contact");

    let competitor = store.clone();
    let racing = RacingStore::new(store.clone(), async move {
        execute::<Contact, _>(&competitor, add_tag("c-1", "churn-risk"), fast_config())
            .await
            .map(|_| ())
    });

    let result = execute::<Contact, _>(&racing, add_tag("c-1", "vip"), fast_config())
        .await
        .expect("Command should win on the second attempt");

    assert_eq!(result.version().value(), 2);
    assert!(result.state().tag_ids.contains("vip"));
    assert!(result.state().tag_ids.contains("churn-risk"));

    let events = store.events(&contact_id("c-1")).await;
    let versions: Vec<i64> = events.iter().map(|e| e.version().value()).collect();
    assert_eq!(versions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_concurrent_commands_all_land() {
    let store = MemoryStore::new();
    execute::<Contact, _>(&store, upsert("c-1", "John"), fast_config())
        .await
        .expect("Failed to create contact");

    let config = fast_config()
        .with_max_retries(20)
        .expect("Failed to set max_retries");

    let handles: Vec<_> = (0..5)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move {
                execute::<Contact, _>(&store, add_tag("c-1", &format!("tag-{n}")), config).await
            })
        })
        .collect();

    for handle in handles {
        handle
            .await
            .expect("Task panicked")
            .expect("Command should eventually succeed");
    }

    let reloaded = load_aggregate::<Contact, _>(&store, tenant(), "c-1", LoadOptions::required())
        .await
        .expect("Failed to load contact");
    assert_eq!(reloaded.state().tag_ids.len(), 5);
    assert_eq!(reloaded.version().value(), 5);
}

#[tokio::test]
async fn test_max_retries_exceeded() {
    let store = ConflictingStore::default();
    let config = fast_config()
        .with_max_retries(3)
        .expect("Failed to set max_retries");

    let result = execute::<Contact, _>(&store, upsert("c-1", "John"), config).await;

    match result {
        Err(Error::MaxRetriesExceeded {
            stream,
            max_retries,
            source,
        }) => {
            assert_eq!(stream, contact_id("c-1").to_string());
            assert_eq!(max_retries, 3);
            assert!(source.is_conflict());
        }
        other => panic!("Expected MaxRetriesExceeded error, got {:?}", other),
    }
    assert_eq!(store.saves.load(Ordering::SeqCst), 3);
    assert_eq!(store.loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancelled_before_first_attempt() {
    let store = ConflictingStore::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result =
        execute_cancellable::<Contact, _>(&store, upsert("c-1", "John"), fast_config(), &cancel)
            .await;

    match result {
        Err(Error::Cancelled { attempts, .. }) => assert_eq!(attempts, 0),
        other => panic!("Expected Cancelled error, got {:?}", other),
    }
    assert_eq!(store.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let store = Arc::new(ConflictingStore::default());
    let config = ExecuteConfig::default()
        .with_max_retries(u32::MAX)
        .expect("Failed to set max_retries")
        .with_max_delay(60_000)
        .expect("Failed to set max_delay")
        .with_base_delay(30_000)
        .expect("Failed to set base_delay");
    let cancel = CancellationToken::new();

    let task = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            execute_cancellable::<Contact, _>(&*store, upsert("c-1", "John"), config, &cancel).await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .expect("Cancellation should end the backoff")
        .expect("Task panicked");

    match result {
        Err(Error::Cancelled { attempts, .. }) => assert!(attempts >= 1),
        other => panic!("Expected Cancelled error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_command_is_not_executed() {
    let store = ConflictingStore::default();

    let result = execute::<Contact, _>(&store, add_tag("c-1", " "), fast_config()).await;

    match result {
        Err(Error::Validation { field, .. }) => assert_eq!(field, "tag_id"),
        other => panic!("Expected Validation error, got {:?}", other),
    }
    assert_eq!(store.loads.load(Ordering::SeqCst), 0);
    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejected_command_is_not_retried() {
    let store = ConflictingStore::default();
    let close = opportunity("o-1", OpportunityCommand::CloseWin { closed_at: None });

    let result = execute::<Opportunity, _>(&store, close, fast_config()).await;

    match result {
        Err(Error::CommandFailed {
            attempt, source, ..
        }) => {
            assert_eq!(attempt, 1);
            assert!(matches!(*source, Error::Rejected { .. }));
        }
        other => panic!("Expected CommandFailed error, got {:?}", other),
    }
    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_closing_twice_writes_once() {
    let store = MemoryStore::new();
    execute::<Opportunity, _>(&store, opportunity("o-1", create_renewal()), fast_config())
        .await
        .expect("Failed to create renewal");

    for _ in 0..2 {
        let closed = execute::<Opportunity, _>(
            &store,
            opportunity("o-1", OpportunityCommand::CloseWin { closed_at: None }),
            fast_config(),
        )
        .await
        .expect("Failed to close opportunity");
        assert_eq!(closed.state().fields.internal_stage, InternalStage::ClosedWon);
        assert_eq!(closed.version().value(), 1);
    }

    let id = AggregateId::new(Opportunity::AGGREGATE_TYPE, &tenant(), "o-1");
    assert_eq!(store.events(&id).await.len(), 2);
}

#[tokio::test]
async fn test_load_options() {
    let store = MemoryStore::new();

    match load_aggregate::<Contact, _>(&store, tenant(), "c-1", LoadOptions::required()).await {
        Err(Error::AggregateNotFound(id)) => assert_eq!(id, contact_id("c-1")),
        other => panic!("Expected AggregateNotFound error, got {:?}", other),
    }

    match store.exists(&contact_id("c-1")).await {
        Err(Error::AggregateNotFound(_)) => {}
        other => panic!("Expected AggregateNotFound error, got {:?}", other),
    }

    execute::<Contact, _>(&store, upsert("c-1", "John"), fast_config())
        .await
        .expect("Failed to create contact");

    let skipped =
        load_aggregate::<Contact, _>(&store, tenant(), "c-1", LoadOptions::skip_load_events())
            .await
            .expect("Skipping the load should not fail");
    assert!(skipped.is_new());

    let optional = load_aggregate::<Contact, _>(&store, tenant(), "c-2", LoadOptions::default())
        .await
        .expect("Optional load of a missing stream should not fail");
    assert!(optional.is_new());
}

#[tokio::test]
async fn test_snapshot_load_matches_full_replay() {
    let store = MemoryStore::new().with_snapshot_policy(SnapshotPolicy::Every(2));

    execute::<Contact, _>(&store, upsert("c-1", "John"), fast_config())
        .await
        .expect("Failed to create contact");
    for tag in ["a", "b", "c", "d"] {
        execute::<Contact, _>(&store, add_tag("c-1", tag), fast_config())
            .await
            .expect("Failed to add tag");
    }

    let snapshot = store
        .snapshot(&contact_id("c-1"))
        .await
        .expect("A snapshot should have been taken");
    assert!(snapshot.version.value() < 4);

    let from_snapshot =
        load_aggregate::<Contact, _>(&store, tenant(), "c-1", LoadOptions::required())
            .await
            .expect("Failed to load contact");

    let mut replayed = AggregateRoot::<Contact>::new(tenant(), "c-1");
    replayed
        .load(store.events(&contact_id("c-1")).await)
        .expect("Failed to replay contact");

    assert_eq!(from_snapshot.version(), replayed.version());
    assert_eq!(from_snapshot.state(), replayed.state());
}

#[tokio::test]
async fn test_raw_command_executes_after_decoding() {
    let store = MemoryStore::new();
    let raw = CommandEnvelope::new(
        tenant(),
        "c-1",
        "sync",
        RawCommand {
            command_type: "UpsertContact".to_string(),
            payload: serde_json::json!({
                "firstName": "Jane",
                "lastName": "Doe",
                "source": { "source": "hubspot" }
            }),
        },
    );

    let command = raw
        .decode::<ContactCommand>(Contact::AGGREGATE_TYPE)
        .expect("Failed to decode raw command");
    let contact = execute::<Contact, _>(&store, command, fast_config())
        .await
        .expect("Failed to execute decoded command");

    assert_eq!(contact.state().fields.first_name, "Jane");
    assert_eq!(contact.state().fields.last_name, "Doe");
    assert_eq!(contact.state().source.source, "hubspot");
    assert_eq!(contact.state().source.app_source, "sync");
}
