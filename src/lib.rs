//! Event-sourced aggregates with optimistic concurrency.
//!
//! Aggregates are rebuilt from their event streams on every command, mutated
//! only by appending events, and saved under an expected-version check. A
//! command that loses a race against another writer is reloaded and
//! re-evaluated by [`execute`] until it wins or runs out of attempts.

mod aggregate;
mod command;
mod config;
mod delay;
pub mod domain;
mod error;
mod event;
mod event_store;
mod kurrent_adapter;
mod memory_store;

pub use aggregate::{
    Aggregate, AggregateId, AggregateRoot, AggregateVersion, Snapshot, SnapshotPolicy, Tenant,
};
pub use command::{CommandEnvelope, DomainCommand, RawCommand};
pub use config::ExecuteConfig;
pub use delay::RetryDelay;
pub use error::Error;
pub use event::{
    DomainEvent, Event, EventMetadata, INTERNAL_EVENT_PREFIX, enrich_event_with_metadata,
};
pub use event_store::{AggregateStore, LoadOptions, load_aggregate};
pub use kurrent_adapter::{ConnectionSettings, ConnectionSettingsBuilder, EventStream, Kurrent};
pub use memory_store::MemoryStore;
pub use tokio_util::sync::CancellationToken;

use std::future::Future;

/// Runs one load / handle / save cycle per attempt until the save goes
/// through.
///
/// Only write conflicts ([`Error::is_conflict`]) start another attempt, after
/// a jittered exponential backoff. Every attempt begins with a fresh `load`,
/// so `handle` always decides against the latest state. Errors from `handle`
/// come back wrapped in [`Error::CommandFailed`]; errors from `load` and
/// non-conflict errors from `save` are returned untouched. `cancel` is
/// checked before each attempt and interrupts the backoff sleep.
#[tracing::instrument(skip_all, fields(stream = %stream, max_attempts = config.max_retries()))]
pub async fn with_optimistic_retry<T, L, LF, H, S, SF>(
    config: ExecuteConfig,
    cancel: &CancellationToken,
    stream: &str,
    mut load: L,
    mut handle: H,
    mut save: S,
) -> Result<T, Error>
where
    L: FnMut() -> LF,
    LF: Future<Output = Result<T, Error>>,
    H: FnMut(&mut T) -> Result<(), Error>,
    S: FnMut(T) -> SF,
    SF: Future<Output = Result<T, Error>>,
{
    let max_attempts = config.max_retries();
    let mut attempt = 0;

    let result = loop {
        if cancel.is_cancelled() {
            break Err(Error::Cancelled {
                stream: stream.to_string(),
                attempts: attempt,
            });
        }

        attempt += 1;
        tracing::debug!(attempt, "Executing command");

        let mut aggregate = match load().await {
            Ok(aggregate) => aggregate,
            Err(e) => break Err(e),
        };

        if let Err(e) = handle(&mut aggregate) {
            break Err(Error::CommandFailed {
                message: e.to_string(),
                attempt,
                max_attempts,
                source: Box::new(e),
            });
        }

        match save(aggregate).await {
            Ok(aggregate) => {
                break Ok(aggregate);
            }
            Err(e) if e.is_conflict() => {
                if attempt >= max_attempts {
                    tracing::error!(
                        attempt,
                        error = %e,
                        "Giving up after repeated write conflicts"
                    );
                    break Err(Error::MaxRetriesExceeded {
                        stream: stream.to_string(),
                        max_retries: max_attempts,
                        source: Box::new(e),
                    });
                }

                let delay = config.retry_delay().calculate_delay(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Write conflict, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        break Err(Error::Cancelled {
                            stream: stream.to_string(),
                            attempts: attempt,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                break Err(e);
            }
        }
    };

    result
}

/// Validates `command`, then lets aggregate `A` handle it against `store`,
/// retrying on write conflicts as configured.
///
/// Returns the aggregate as saved. A command that produces no events is a
/// successful no-op and writes nothing.
pub async fn execute<A, S>(
    store: &S,
    command: CommandEnvelope<A::Command>,
    config: ExecuteConfig,
) -> Result<AggregateRoot<A>, Error>
where
    A: Aggregate,
    S: AggregateStore,
{
    execute_cancellable(store, command, config, &CancellationToken::new()).await
}

/// [`execute`], giving up between attempts once `cancel` fires.
pub async fn execute_cancellable<A, S>(
    store: &S,
    command: CommandEnvelope<A::Command>,
    config: ExecuteConfig,
    cancel: &CancellationToken,
) -> Result<AggregateRoot<A>, Error>
where
    A: Aggregate,
    S: AggregateStore,
{
    command.validate()?;

    let stream = AggregateId::new(A::AGGREGATE_TYPE, &command.tenant, &command.object_id);
    let tenant = &command.tenant;
    let object_id = command.object_id.as_str();
    let command = &command;

    with_optimistic_retry(
        config,
        cancel,
        stream.as_str(),
        move || load_aggregate::<A, S>(store, tenant.clone(), object_id, LoadOptions::default()),
        |aggregate: &mut AggregateRoot<A>| A::handle(aggregate, command),
        move |mut aggregate: AggregateRoot<A>| async move {
            store.save(&mut aggregate).await?;
            Ok::<_, Error>(aggregate)
        },
    )
    .await
}
