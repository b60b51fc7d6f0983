use std::future::Future;

use crate::{Aggregate, AggregateId, AggregateRoot, Error, Tenant};

/// The durable boundary of the runtime.
///
/// A store persists aggregate streams and nothing else: it knows how to
/// replay a stream into an [`AggregateRoot`] and how to append the root's
/// uncommitted events under an expected-version check.
pub trait AggregateStore: Send + Sync {
    /// Succeeds if the stream holds at least one event, fails with
    /// [`Error::AggregateNotFound`] otherwise.
    fn exists(&self, aggregate_id: &AggregateId) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replays the stream of `aggregate` (snapshot plus tail where the store
    /// keeps snapshots). A stream without events leaves the root untouched.
    fn load<A: Aggregate>(
        &self,
        aggregate: &mut AggregateRoot<A>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Appends the uncommitted events of `aggregate` as one batch.
    ///
    /// The stream must still be at [`AggregateRoot::original_version`],
    /// otherwise nothing is written and [`Error::WrongExpectedVersion`] is
    /// returned. On success the buffer is cleared. Saving a root without
    /// uncommitted events does nothing.
    fn save<A: Aggregate>(
        &self,
        aggregate: &mut AggregateRoot<A>,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// How [`load_aggregate`] treats the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Fail with [`Error::AggregateNotFound`] when the stream is empty.
    pub required: bool,
    /// Hand back a fresh root without reading the stream.
    pub skip_load_events: bool,
}

impl LoadOptions {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn skip_load_events() -> Self {
        Self {
            skip_load_events: true,
            ..Self::default()
        }
    }
}

/// Builds the root for `object_id` and loads it from `store`.
#[tracing::instrument(skip(store), fields(aggregate_type = A::AGGREGATE_TYPE))]
pub async fn load_aggregate<A, S>(
    store: &S,
    tenant: Tenant,
    object_id: &str,
    options: LoadOptions,
) -> Result<AggregateRoot<A>, Error>
where
    A: Aggregate,
    S: AggregateStore,
{
    let mut aggregate = AggregateRoot::<A>::new(tenant, object_id);

    if options.skip_load_events {
        return Ok(aggregate);
    }

    store.load(&mut aggregate).await?;

    if options.required && aggregate.is_new() {
        return Err(Error::AggregateNotFound(aggregate.id().clone()));
    }

    Ok(aggregate)
}
