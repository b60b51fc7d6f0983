//! Reference aggregates built on the runtime.
//!
//! [`contact::Contact`] and [`opportunity::Opportunity`] are ordinary users
//! of the public API. They show idempotent no-op commands, precondition
//! checks against projected state and commands that emit several ordered
//! events.

pub mod contact;
pub mod opportunity;

use serde::{Deserialize, Serialize};

use crate::{Aggregate, AggregateRoot, Error};

/// The source of truth that outranks every integration.
pub const SOURCE_OPENLINE: &str = "openline";

/// Where a piece of data came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_of_truth: String,
    #[serde(default)]
    pub app_source: String,
}

impl Source {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Fills the blanks: `openline` as source, the source as source of
    /// truth and `app_source` as originating application.
    pub fn with_defaults(mut self, app_source: &str) -> Self {
        if self.source.is_empty() {
            self.source = SOURCE_OPENLINE.to_string();
        }
        if self.source_of_truth.is_empty() {
            self.source_of_truth = self.source.clone();
        }
        if self.app_source.is_empty() {
            self.app_source = app_source.to_string();
        }
        self
    }

    /// Whether data owned by this source only accepts blanks being filled
    /// by an update coming from `incoming`.
    pub fn protects_against(&self, incoming: &str) -> bool {
        self.source_of_truth == SOURCE_OPENLINE && incoming != SOURCE_OPENLINE
    }
}

fn rejected<A: Aggregate>(root: &AggregateRoot<A>, reason: impl Into<String>) -> Error {
    Error::Rejected {
        aggregate_id: root.id().clone(),
        reason: reason.into(),
    }
}

fn required(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::validation(field, "must not be empty"));
    }
    Ok(())
}
