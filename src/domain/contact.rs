//! A person known to a tenant, with the phone numbers, emails and tags
//! linked to them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Source, required};
use crate::{
    Aggregate, AggregateRoot, CommandEnvelope, DomainCommand, DomainEvent, Error, EventMetadata,
};

pub const CONTACT_AGGREGATE_TYPE: &str = "contact";

/// The descriptive fields of a contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactFields {
    pub first_name: String,
    pub last_name: String,
    pub prefix: String,
    pub name: String,
    pub description: String,
    pub timezone: String,
    pub profile_photo_url: String,
}

/// A field of [`ContactFields`], as named in an update mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContactField {
    FirstName,
    LastName,
    Prefix,
    Name,
    Description,
    Timezone,
    ProfilePhotoUrl,
}

/// Changes to a contact. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_photo_url: Option<String>,
}

impl ContactChanges {
    /// The fields of `incoming` named in `mask` that differ from `current`.
    /// An empty mask names every field.
    pub fn between(
        current: &ContactFields,
        incoming: &ContactFields,
        mask: &[ContactField],
    ) -> Self {
        let pick = |field: ContactField, current: &String, incoming: &String| {
            let masked = mask.is_empty() || mask.contains(&field);
            (masked && current != incoming).then(|| incoming.clone())
        };
        Self {
            first_name: pick(ContactField::FirstName, &current.first_name, &incoming.first_name),
            last_name: pick(ContactField::LastName, &current.last_name, &incoming.last_name),
            prefix: pick(ContactField::Prefix, &current.prefix, &incoming.prefix),
            name: pick(ContactField::Name, &current.name, &incoming.name),
            description: pick(
                ContactField::Description,
                &current.description,
                &incoming.description,
            ),
            timezone: pick(ContactField::Timezone, &current.timezone, &incoming.timezone),
            profile_photo_url: pick(
                ContactField::ProfilePhotoUrl,
                &current.profile_photo_url,
                &incoming.profile_photo_url,
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Writes the present fields into `fields`. With `blanks_only`, a field
    /// is only written while it is empty and the description is left alone.
    fn apply_to(self, fields: &mut ContactFields, blanks_only: bool) {
        let set = |current: &mut String, incoming: Option<String>| {
            if let Some(incoming) = incoming {
                if !blanks_only || current.is_empty() {
                    *current = incoming;
                }
            }
        };
        set(&mut fields.first_name, self.first_name);
        set(&mut fields.last_name, self.last_name);
        set(&mut fields.prefix, self.prefix);
        set(&mut fields.name, self.name);
        set(&mut fields.timezone, self.timezone);
        set(&mut fields.profile_photo_url, self.profile_photo_url);
        if !blanks_only {
            set(&mut fields.description, self.description);
        }
    }
}

/// A phone number or email as linked to a contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub label: String,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactCreateEvent {
    #[serde(flatten)]
    pub fields: ContactFields,
    #[serde(flatten)]
    pub source: Source,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdateEvent {
    #[serde(flatten)]
    pub changes: ContactChanges,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactLinkPhoneNumberEvent {
    pub phone_number_id: String,
    pub label: String,
    pub primary: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactLinkEmailEvent {
    pub email_id: String,
    pub label: String,
    pub primary: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactTagEvent {
    pub tag_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ContactEvent {
    #[serde(rename = "V1_CONTACT_CREATE")]
    Created(ContactCreateEvent),
    #[serde(rename = "V1_CONTACT_UPDATE")]
    Updated(ContactUpdateEvent),
    #[serde(rename = "V1_CONTACT_PHONE_NUMBER_LINK")]
    PhoneNumberLinked(ContactLinkPhoneNumberEvent),
    #[serde(rename = "V1_CONTACT_EMAIL_LINK")]
    EmailLinked(ContactLinkEmailEvent),
    #[serde(rename = "V1_CONTACT_ADD_TAG")]
    TagAdded(ContactTagEvent),
    #[serde(rename = "V1_CONTACT_REMOVE_TAG")]
    TagRemoved(ContactTagEvent),
}

impl DomainEvent for ContactEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "V1_CONTACT_CREATE",
        "V1_CONTACT_UPDATE",
        "V1_CONTACT_PHONE_NUMBER_LINK",
        "V1_CONTACT_EMAIL_LINK",
        "V1_CONTACT_ADD_TAG",
        "V1_CONTACT_REMOVE_TAG",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            ContactEvent::Created(_) => "V1_CONTACT_CREATE",
            ContactEvent::Updated(_) => "V1_CONTACT_UPDATE",
            ContactEvent::PhoneNumberLinked(_) => "V1_CONTACT_PHONE_NUMBER_LINK",
            ContactEvent::EmailLinked(_) => "V1_CONTACT_EMAIL_LINK",
            ContactEvent::TagAdded(_) => "V1_CONTACT_ADD_TAG",
            ContactEvent::TagRemoved(_) => "V1_CONTACT_REMOVE_TAG",
        }
    }
}

/// Creates the contact when it does not exist yet, updates it otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertContact {
    #[serde(flatten)]
    pub fields: ContactFields,
    /// Fields an update may touch; empty means all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields_mask: Vec<ContactField>,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ContactCommand {
    #[serde(rename = "UpsertContact")]
    Upsert(UpsertContact),
    #[serde(rename = "LinkPhoneNumber", rename_all = "camelCase")]
    LinkPhoneNumber {
        phone_number_id: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        primary: bool,
    },
    #[serde(rename = "LinkEmail", rename_all = "camelCase")]
    LinkEmail {
        email_id: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        primary: bool,
    },
    #[serde(rename = "AddTag", rename_all = "camelCase")]
    AddTag { tag_id: String },
    #[serde(rename = "RemoveTag", rename_all = "camelCase")]
    RemoveTag { tag_id: String },
}

impl DomainCommand for ContactCommand {
    const COMMAND_TYPES: &'static [&'static str] = &[
        "UpsertContact",
        "LinkPhoneNumber",
        "LinkEmail",
        "AddTag",
        "RemoveTag",
    ];

    fn command_type(&self) -> &'static str {
        match self {
            ContactCommand::Upsert(_) => "UpsertContact",
            ContactCommand::LinkPhoneNumber { .. } => "LinkPhoneNumber",
            ContactCommand::LinkEmail { .. } => "LinkEmail",
            ContactCommand::AddTag { .. } => "AddTag",
            ContactCommand::RemoveTag { .. } => "RemoveTag",
        }
    }

    fn validate(&self) -> Result<(), Error> {
        match self {
            ContactCommand::Upsert(_) => Ok(()),
            ContactCommand::LinkPhoneNumber {
                phone_number_id, ..
            } => required("phone_number_id", phone_number_id),
            ContactCommand::LinkEmail { email_id, .. } => required("email_id", email_id),
            ContactCommand::AddTag { tag_id } | ContactCommand::RemoveTag { tag_id } => {
                required("tag_id", tag_id)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub fields: ContactFields,
    pub source: Source,
    pub phone_numbers: BTreeMap<String, ContactPoint>,
    pub emails: BTreeMap<String, ContactPoint>,
    pub tag_ids: BTreeSet<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Contact {
    fn has_point(
        points: &BTreeMap<String, ContactPoint>,
        id: &str,
        label: &str,
        primary: bool,
    ) -> bool {
        points
            .get(id)
            .is_some_and(|point| point.label == label && point.primary == primary)
    }

    fn other_primaries(points: &BTreeMap<String, ContactPoint>, id: &str) -> Vec<(String, String)> {
        points
            .iter()
            .filter(|(other, point)| other.as_str() != id && point.primary)
            .map(|(other, point)| (other.clone(), point.label.clone()))
            .collect()
    }
}

impl Aggregate for Contact {
    const AGGREGATE_TYPE: &'static str = CONTACT_AGGREGATE_TYPE;
    type Event = ContactEvent;
    type Command = ContactCommand;

    fn when(&mut self, event: ContactEvent) -> Result<(), Error> {
        match event {
            ContactEvent::Created(created) => {
                self.fields = created.fields;
                self.source = created.source;
                self.created_at = Some(created.created_at);
                self.updated_at = Some(created.updated_at);
            }
            ContactEvent::Updated(updated) => {
                let blanks_only = self.source.protects_against(&updated.source);
                updated.changes.apply_to(&mut self.fields, blanks_only);
                if updated.source == super::SOURCE_OPENLINE {
                    self.source.source_of_truth = updated.source;
                }
                self.updated_at = Some(updated.updated_at);
            }
            ContactEvent::PhoneNumberLinked(linked) => {
                self.phone_numbers.insert(
                    linked.phone_number_id,
                    ContactPoint {
                        label: linked.label,
                        primary: linked.primary,
                    },
                );
                self.updated_at = Some(linked.updated_at);
            }
            ContactEvent::EmailLinked(linked) => {
                self.emails.insert(
                    linked.email_id,
                    ContactPoint {
                        label: linked.label,
                        primary: linked.primary,
                    },
                );
                self.updated_at = Some(linked.updated_at);
            }
            ContactEvent::TagAdded(tag) => {
                self.tag_ids.insert(tag.tag_id);
            }
            ContactEvent::TagRemoved(tag) => {
                self.tag_ids.remove(&tag.tag_id);
            }
        }
        Ok(())
    }

    fn handle(
        root: &mut AggregateRoot<Self>,
        command: &CommandEnvelope<ContactCommand>,
    ) -> Result<(), Error> {
        let metadata = EventMetadata::from_command(command);
        let now = Utc::now();

        match &command.payload {
            ContactCommand::Upsert(upsert) if root.is_new() => {
                let created_at = upsert.created_at.unwrap_or(now);
                let event = ContactEvent::Created(ContactCreateEvent {
                    fields: upsert.fields.clone(),
                    source: upsert.source.clone().with_defaults(&command.app_source),
                    created_at,
                    updated_at: upsert.updated_at.unwrap_or(created_at),
                });
                root.raise(&event, &metadata)
            }
            ContactCommand::Upsert(upsert) => {
                let changes = ContactChanges::between(
                    &root.state().fields,
                    &upsert.fields,
                    &upsert.fields_mask,
                );
                if changes.is_empty() {
                    return Ok(());
                }
                let source = upsert.source.clone().with_defaults(&command.app_source);
                let event = ContactEvent::Updated(ContactUpdateEvent {
                    changes,
                    source: source.source,
                    updated_at: upsert.updated_at.unwrap_or(now),
                });
                root.raise(&event, &metadata)
            }
            ContactCommand::LinkPhoneNumber {
                phone_number_id,
                label,
                primary,
            } => {
                if Contact::has_point(
                    &root.state().phone_numbers,
                    phone_number_id,
                    label,
                    *primary,
                ) {
                    return Ok(());
                }
                root.raise(
                    &ContactEvent::PhoneNumberLinked(ContactLinkPhoneNumberEvent {
                        phone_number_id: phone_number_id.clone(),
                        label: label.clone(),
                        primary: *primary,
                        updated_at: now,
                    }),
                    &metadata,
                )?;
                if !*primary {
                    return Ok(());
                }
                let others = Contact::other_primaries(&root.state().phone_numbers, phone_number_id);
                for (other, label) in others {
                    root.raise(
                        &ContactEvent::PhoneNumberLinked(ContactLinkPhoneNumberEvent {
                            phone_number_id: other,
                            label,
                            primary: false,
                            updated_at: now,
                        }),
                        &metadata,
                    )?;
                }
                Ok(())
            }
            ContactCommand::LinkEmail {
                email_id,
                label,
                primary,
            } => {
                if Contact::has_point(&root.state().emails, email_id, label, *primary) {
                    return Ok(());
                }
                root.raise(
                    &ContactEvent::EmailLinked(ContactLinkEmailEvent {
                        email_id: email_id.clone(),
                        label: label.clone(),
                        primary: *primary,
                        updated_at: now,
                    }),
                    &metadata,
                )?;
                if !*primary {
                    return Ok(());
                }
                for (other, label) in Contact::other_primaries(&root.state().emails, email_id) {
                    root.raise(
                        &ContactEvent::EmailLinked(ContactLinkEmailEvent {
                            email_id: other,
                            label,
                            primary: false,
                            updated_at: now,
                        }),
                        &metadata,
                    )?;
                }
                Ok(())
            }
            ContactCommand::AddTag { tag_id } => {
                if root.state().tag_ids.contains(tag_id) {
                    return Ok(());
                }
                root.raise(
                    &ContactEvent::TagAdded(ContactTagEvent {
                        tag_id: tag_id.clone(),
                        at: now,
                    }),
                    &metadata,
                )
            }
            ContactCommand::RemoveTag { tag_id } => {
                if !root.state().tag_ids.contains(tag_id) {
                    return Ok(());
                }
                root.raise(
                    &ContactEvent::TagRemoved(ContactTagEvent {
                        tag_id: tag_id.clone(),
                        at: now,
                    }),
                    &metadata,
                )
            }
        }
    }
}
