use bytes::Bytes;
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// The tenant owning an aggregate stream.
///
/// Tenants are trimmed on construction and must be non-empty.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Display, AsRef, Serialize, Deserialize)
)]
pub struct Tenant(String);

/// Stream identifier of one aggregate instance.
///
/// The id is derived as `{aggregate_type}-{tenant}-{object_id}` so that every
/// caller addressing the same logical entity lands on the same stream without
/// a lookup.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AggregateId(String);

impl AggregateId {
    /// Derives the stream id for `object_id`.
    ///
    /// An `object_id` that already carries the `{aggregate_type}-{tenant}-`
    /// prefix is taken as is.
    pub fn new(aggregate_type: &str, tenant: &Tenant, object_id: &str) -> Self {
        let prefix = Self::prefix(aggregate_type, tenant);
        if object_id.starts_with(&prefix) {
            Self(object_id.to_string())
        } else {
            Self(format!("{prefix}{object_id}"))
        }
    }

    /// Wraps an id read back from a store.
    pub fn from_stream_name(stream_name: impl Into<String>) -> Self {
        Self(stream_name.into())
    }

    /// Returns the object id the stream was derived from.
    pub fn object_id(&self, aggregate_type: &str, tenant: &Tenant) -> &str {
        let prefix = Self::prefix(aggregate_type, tenant);
        self.0.strip_prefix(&prefix).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn prefix(aggregate_type: &str, tenant: &Tenant) -> String {
        format!("{aggregate_type}-{}-", tenant.as_ref())
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl eventstore::StreamName for AggregateId {
    fn into_stream_name(self) -> Bytes {
        Bytes::from(self.0)
    }
}

impl eventstore::StreamName for &AggregateId {
    fn into_stream_name(self) -> Bytes {
        Bytes::from(self.0.clone())
    }
}

/// Position of the last event applied to an aggregate.
///
/// Versions are zero-based so they line up with stream revisions.
/// [`AggregateVersion::NEW`] marks an aggregate without any events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateVersion(i64);

impl AggregateVersion {
    pub const NEW: AggregateVersion = AggregateVersion(-1);

    pub fn new(version: i64) -> Self {
        Self(version)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// True while no event has been applied.
    pub fn is_new(&self) -> bool {
        self.0 < 0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The stream revision this version corresponds to, if any.
    pub fn revision(&self) -> Option<u64> {
        u64::try_from(self.0).ok()
    }

    pub fn from_revision(revision: u64) -> Self {
        Self(i64::try_from(revision).unwrap_or(i64::MAX))
    }
}

impl Default for AggregateVersion {
    fn default() -> Self {
        Self::NEW
    }
}

impl std::fmt::Display for AggregateVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
