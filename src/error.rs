//! Error types for the anamnesis aggregate runtime.
//!
//! Every fallible operation in the crate returns this single error type. The
//! variants group into validation failures, structural failures (a stream that
//! does not belong to the aggregate, an unknown event tag, a version gap),
//! write conflicts and backend failures. Only [`Error::WrongExpectedVersion`]
//! is ever retried, and only by the command loop.

use eventstore::ClientSettingsParseError;
use thiserror::Error;

use crate::{AggregateId, AggregateVersion};

/// Represents errors that can occur in the anamnesis runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Indicates a failure to parse event store connection settings
    #[error(transparent)]
    EventStoreSettings(#[from] ClientSettingsParseError),

    /// An event payload could not be encoded
    #[error("Failed to serialize payload of event '{event_type}'")]
    Serialization {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// An event payload did not match the schema of its event type
    #[error("Failed to deserialize payload of event '{event_type}'")]
    Deserialization {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// A command or one of its fields failed validation
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// No events exist for an aggregate the caller required to exist
    #[error("Aggregate not found: {0}")]
    AggregateNotFound(AggregateId),

    /// An event addressed to another stream was handed to an aggregate
    #[error("Event for aggregate '{actual}' cannot be applied to aggregate '{expected}'")]
    InvalidAggregateId {
        expected: AggregateId,
        actual: AggregateId,
    },

    /// An event arrived out of order during replay
    #[error("Event version {actual} out of order for aggregate '{aggregate_id}', expected {expected}")]
    InvalidEventVersion {
        aggregate_id: AggregateId,
        expected: AggregateVersion,
        actual: AggregateVersion,
    },

    /// The aggregate does not know how to apply this event type
    #[error("Unknown event type '{event_type}' for aggregate type '{aggregate_type}'")]
    InvalidEventType {
        aggregate_type: String,
        event_type: String,
    },

    /// The aggregate does not know how to handle this command type
    #[error("Unknown command type '{command_type}' for aggregate type '{aggregate_type}'")]
    InvalidCommandType {
        aggregate_type: String,
        command_type: String,
    },

    /// The aggregate refused the command given its current state
    #[error("Command rejected by aggregate '{aggregate_id}': {reason}")]
    Rejected {
        aggregate_id: AggregateId,
        reason: String,
    },

    /// Indicates a version mismatch when appending to a stream
    #[error("Version mismatch for stream '{stream}': {}", match (.expected, .actual) {
        (Some(e), Some(a)) => format!("expected version {e}, but stream is at version {a}"),
        (Some(e), None) => format!("expected version {e}, but stream does not exist"),
        (None, Some(a)) => format!("stream exists at version {a}, but no stream was expected"),
        (None, None) => "invalid version state".to_string()
    })]
    WrongExpectedVersion {
        stream: AggregateId,
        expected: Option<AggregateVersion>,
        actual: Option<AggregateVersion>,
    },

    /// Indicates a general event store error
    #[error(transparent)]
    EventStoreOther(#[from] eventstore::Error),

    /// Indicates a failure in command execution
    #[error("Command failed (attempt {attempt} of {max_attempts}): {message}")]
    CommandFailed {
        message: String,
        attempt: u32,
        max_attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Indicates that maximum retry attempts were exceeded
    #[error("Command execution exceeded maximum retries ({max_retries}) for stream '{stream}'")]
    MaxRetriesExceeded {
        stream: String,
        max_retries: u32,
        #[source]
        source: Box<Error>,
    },

    /// The caller cancelled the command between two attempts
    #[error("Command execution for stream '{stream}' cancelled after {attempts} attempt(s)")]
    Cancelled { stream: String, attempts: u32 },

    /// Indicates an invalid configuration parameter
    #[error("Invalid configuration{}: {message}", .parameter.as_ref().map(|p| format!(" parameter '{p}'")).unwrap_or_default())]
    InvalidConfig {
        message: String,
        parameter: Option<String>,
    },
}

impl Error {
    /// Whether a fresh load and another attempt may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::WrongExpectedVersion { .. })
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tenant;

    fn stream() -> AggregateId {
        let tenant = Tenant::try_new("acme").unwrap();
        AggregateId::new("contact", &tenant, "c-1")
    }

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let error = Error::WrongExpectedVersion {
            stream: stream(),
            expected: Some(AggregateVersion::new(2)),
            actual: Some(AggregateVersion::new(3)),
        };
        assert_eq!(
            error.to_string(),
            "Version mismatch for stream 'contact-acme-c-1': expected version 2, but stream is at version 3"
        );
        assert!(error.is_conflict());
    }

    #[test]
    fn only_version_mismatch_is_a_conflict() {
        assert!(!Error::AggregateNotFound(stream()).is_conflict());
        assert!(!Error::validation("object_id", "must not be empty").is_conflict());
    }

    #[test]
    fn invalid_config_message_includes_parameter() {
        let error = Error::InvalidConfig {
            message: "max_retries cannot be 0".to_string(),
            parameter: Some("max_retries".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration parameter 'max_retries': max_retries cannot be 0"
        );
    }
}
