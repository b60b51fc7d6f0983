use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Event;
use crate::Tenant;
use crate::command::CommandEnvelope;

/// Audit and tracing context recorded with every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub tenant: Tenant,
    #[serde(rename = "user-id", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(rename = "causation-id", default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(rename = "correlation-id", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl EventMetadata {
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            user_id: None,
            app: None,
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Metadata for events caused by `command`.
    ///
    /// The command id becomes the causation id and the command's correlation
    /// id is carried over unchanged.
    pub fn from_command<P>(command: &CommandEnvelope<P>) -> Self {
        Self::new(command.tenant.clone())
            .with_user_id(command.actor_user_id.as_deref().unwrap_or_default())
            .with_app(&command.app_source)
            .with_causation_id(command.command_id)
            .with_correlation_id(command.correlation_id)
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = non_empty(user_id);
        self
    }

    pub fn with_app(mut self, app: &str) -> Self {
        self.app = non_empty(app);
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Stamps `metadata` onto `event`, replacing whatever was there.
pub fn enrich_event_with_metadata(event: &mut Event, metadata: &EventMetadata) {
    event.set_metadata(metadata.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> Tenant {
        Tenant::try_new("acme").unwrap()
    }

    #[test]
    fn serializes_with_dashed_keys_and_skips_missing_values() {
        let causation = Uuid::new_v4();
        let metadata = EventMetadata::new(tenant())
            .with_user_id("user-1")
            .with_app("customer-os-api")
            .with_causation_id(causation);

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tenant": "acme",
                "user-id": "user-1",
                "app": "customer-os-api",
                "causation-id": causation,
            })
        );
    }

    #[test]
    fn blank_user_and_app_are_left_out() {
        let metadata = EventMetadata::new(tenant()).with_user_id("  ").with_app("");
        assert_eq!(metadata.user_id, None);
        assert_eq!(metadata.app, None);
    }

    #[test]
    fn from_command_links_causation_and_correlation() {
        let command = CommandEnvelope::new(tenant(), "c-1", "web", ())
            .with_actor("user-9");
        let metadata = EventMetadata::from_command(&command);

        assert_eq!(metadata.tenant, tenant());
        assert_eq!(metadata.user_id.as_deref(), Some("user-9"));
        assert_eq!(metadata.app.as_deref(), Some("web"));
        assert_eq!(metadata.causation_id, Some(command.command_id));
        assert_eq!(metadata.correlation_id, Some(command.correlation_id));
    }
}
