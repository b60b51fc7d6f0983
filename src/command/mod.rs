//! Commands addressed to aggregates.
//!
//! A command is a request to change one aggregate. The fields every command
//! shares (tenant, target object, actor, originating application and the
//! tracing ids) live in [`CommandEnvelope`]; what is specific to one kind of
//! change lives in its payload, a closed enum per aggregate kind implementing
//! [`DomainCommand`].
//!
//! # Examples
//!
//! ```rust
//! use anamnesis::{CommandEnvelope, DomainCommand, Error, Tenant};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum OrderCommand {
//!     #[serde(rename = "CreateOrder")]
//!     Create { customer_id: String },
//! }
//!
//! impl DomainCommand for OrderCommand {
//!     const COMMAND_TYPES: &'static [&'static str] = &["CreateOrder"];
//!
//!     fn command_type(&self) -> &'static str {
//!         "CreateOrder"
//!     }
//!
//!     fn validate(&self) -> Result<(), Error> {
//!         match self {
//!             OrderCommand::Create { customer_id } if customer_id.is_empty() => {
//!                 Err(Error::validation("customer_id", "must not be empty"))
//!             }
//!             _ => Ok(()),
//!         }
//!     }
//! }
//!
//! let tenant = Tenant::try_new("acme").unwrap();
//! let command = CommandEnvelope::new(
//!     tenant,
//!     "order-1",
//!     "checkout",
//!     OrderCommand::Create { customer_id: "c-1".to_string() },
//! )
//! .with_actor("user-7");
//!
//! assert!(command.validate().is_ok());
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

use crate::Tenant;
use crate::error::Error;
use crate::event::decode_tagged;

/// Intent to change one aggregate, plus the context it was issued in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope<P> {
    /// Unique id of this command; recorded as the causation id of its events.
    pub command_id: Uuid,
    /// Id shared by every command and event of one logical operation.
    pub correlation_id: Uuid,
    pub tenant: Tenant,
    /// Id of the target entity, before stream id derivation.
    pub object_id: String,
    pub actor_user_id: Option<String>,
    pub app_source: String,
    pub payload: P,
}

impl<P> CommandEnvelope<P> {
    pub fn new(
        tenant: Tenant,
        object_id: impl Into<String>,
        app_source: impl Into<String>,
        payload: P,
    ) -> Self {
        let command_id = Uuid::new_v4();
        Self {
            command_id,
            correlation_id: command_id,
            tenant,
            object_id: object_id.into(),
            actor_user_id: None,
            app_source: app_source.into(),
            payload,
        }
    }

    pub fn with_actor(mut self, user_id: impl Into<String>) -> Self {
        self.actor_user_id = Some(user_id.into());
        self
    }

    /// Joins this command to an operation started elsewhere.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

impl<P: DomainCommand> CommandEnvelope<P> {
    /// Checks the command's own fields. Never depends on aggregate state.
    pub fn validate(&self) -> Result<(), Error> {
        if self.object_id.trim().is_empty() {
            return Err(Error::validation("object_id", "must not be empty"));
        }
        if self.app_source.trim().is_empty() {
            return Err(Error::validation("app_source", "must not be empty"));
        }
        if let Some(actor) = &self.actor_user_id {
            if actor.trim().is_empty() {
                return Err(Error::validation(
                    "actor_user_id",
                    "must not be blank when present",
                ));
            }
        }
        self.payload.validate()
    }
}

/// The closed set of commands one aggregate kind accepts.
pub trait DomainCommand: Debug + Clone + Serialize + DeserializeOwned + Send + Sync {
    /// Every command type tag this enum has a variant for.
    const COMMAND_TYPES: &'static [&'static str];

    fn command_type(&self) -> &'static str;

    /// Field-level checks on the payload.
    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// A command as it arrives from an untyped boundary: a type tag and a JSON
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommand {
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope<RawCommand> {
    /// Resolves the tag against `P`'s closed set of commands.
    pub fn decode<P: DomainCommand>(
        self,
        aggregate_type: &str,
    ) -> Result<CommandEnvelope<P>, Error> {
        let data = if self.payload.payload.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.payload.payload).map_err(|source| Error::Serialization {
                event_type: self.payload.command_type.clone(),
                source,
            })?
        };
        let payload = decode_tagged(
            P::COMMAND_TYPES,
            &self.payload.command_type,
            &data,
            |tag| Error::InvalidCommandType {
                aggregate_type: aggregate_type.to_string(),
                command_type: tag.to_string(),
            },
        )?;

        Ok(CommandEnvelope {
            command_id: self.command_id,
            correlation_id: self.correlation_id,
            tenant: self.tenant,
            object_id: self.object_id,
            actor_user_id: self.actor_user_id,
            app_source: self.app_source,
            payload,
        })
    }
}
