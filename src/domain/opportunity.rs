//! Sales opportunities and the renewals generated from contracts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SOURCE_OPENLINE, Source, rejected, required};
use crate::{
    Aggregate, AggregateRoot, CommandEnvelope, DomainCommand, DomainEvent, Error, EventMetadata,
};

pub const OPPORTUNITY_AGGREGATE_TYPE: &str = "opportunity";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalType {
    #[default]
    Nbo,
    Upsell,
    CrossSell,
    Renewal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalStage {
    #[default]
    Open,
    ClosedWon,
    ClosedLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenewalLikelihood {
    #[default]
    High,
    Medium,
    Low,
    Zero,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalDetails {
    pub renewal_likelihood: RenewalLikelihood,
    pub renewal_approved: bool,
    pub renewed_at: Option<DateTime<Utc>>,
    pub renewal_adjusted_rate: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpportunityFields {
    pub organization_id: String,
    pub name: String,
    pub amount: f64,
    pub internal_type: InternalType,
    pub external_type: String,
    pub internal_stage: InternalStage,
    pub external_stage: String,
    pub estimated_closed_at: Option<DateTime<Utc>>,
    pub owner_user_id: String,
    pub general_notes: String,
    pub next_steps: String,
}

/// Changes to an opportunity. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpportunityChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_stage: Option<InternalStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityCreateEvent {
    #[serde(flatten)]
    pub fields: OpportunityFields,
    pub created_by_user_id: String,
    #[serde(flatten)]
    pub source: Source,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityCreateRenewalEvent {
    pub contract_id: String,
    pub internal_stage: InternalStage,
    #[serde(flatten)]
    pub renewal: RenewalDetails,
    #[serde(flatten)]
    pub source: Source,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityUpdateEvent {
    #[serde(flatten)]
    pub changes: OpportunityChanges,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

/// Renewal terms revised on an existing renewal. The likelihood is always
/// present; the other fields only when they change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityUpdateRenewalEvent {
    pub renewal_likelihood: RenewalLikelihood,
    #[serde(default)]
    pub renewal_approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_adjusted_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityUpdateNextCycleDateEvent {
    pub renewed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityCloseEvent {
    pub closed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OpportunityEvent {
    #[serde(rename = "V1_OPPORTUNITY_CREATE")]
    Created(OpportunityCreateEvent),
    #[serde(rename = "V1_OPPORTUNITY_CREATE_RENEWAL")]
    RenewalCreated(OpportunityCreateRenewalEvent),
    #[serde(rename = "V1_OPPORTUNITY_UPDATE")]
    Updated(OpportunityUpdateEvent),
    #[serde(rename = "V1_OPPORTUNITY_UPDATE_RENEWAL")]
    RenewalUpdated(OpportunityUpdateRenewalEvent),
    #[serde(rename = "V1_OPPORTUNITY_UPDATE_NEXT_CYCLE_DATE")]
    NextCycleDateUpdated(OpportunityUpdateNextCycleDateEvent),
    #[serde(rename = "V1_OPPORTUNITY_CLOSE_WIN")]
    ClosedWon(OpportunityCloseEvent),
    #[serde(rename = "V1_OPPORTUNITY_CLOSE_LOOSE")]
    ClosedLost(OpportunityCloseEvent),
}

impl DomainEvent for OpportunityEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "V1_OPPORTUNITY_CREATE",
        "V1_OPPORTUNITY_CREATE_RENEWAL",
        "V1_OPPORTUNITY_UPDATE",
        "V1_OPPORTUNITY_UPDATE_RENEWAL",
        "V1_OPPORTUNITY_UPDATE_NEXT_CYCLE_DATE",
        "V1_OPPORTUNITY_CLOSE_WIN",
        "V1_OPPORTUNITY_CLOSE_LOOSE",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            OpportunityEvent::Created(_) => "V1_OPPORTUNITY_CREATE",
            OpportunityEvent::RenewalCreated(_) => "V1_OPPORTUNITY_CREATE_RENEWAL",
            OpportunityEvent::Updated(_) => "V1_OPPORTUNITY_UPDATE",
            OpportunityEvent::RenewalUpdated(_) => "V1_OPPORTUNITY_UPDATE_RENEWAL",
            OpportunityEvent::NextCycleDateUpdated(_) => "V1_OPPORTUNITY_UPDATE_NEXT_CYCLE_DATE",
            OpportunityEvent::ClosedWon(_) => "V1_OPPORTUNITY_CLOSE_WIN",
            OpportunityEvent::ClosedLost(_) => "V1_OPPORTUNITY_CLOSE_LOOSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OpportunityCommand {
    #[serde(rename = "CreateOpportunity", rename_all = "camelCase")]
    Create {
        #[serde(flatten)]
        fields: OpportunityFields,
        #[serde(default)]
        source: Source,
    },
    #[serde(rename = "CreateRenewalOpportunity", rename_all = "camelCase")]
    CreateRenewal {
        contract_id: String,
        #[serde(default)]
        renewal_likelihood: Option<RenewalLikelihood>,
        #[serde(default)]
        renewal_approved: bool,
        #[serde(default)]
        renewed_at: Option<DateTime<Utc>>,
        #[serde(default)]
        renewal_adjusted_rate: i64,
        #[serde(default)]
        source: Source,
    },
    #[serde(rename = "UpdateOpportunity", rename_all = "camelCase")]
    Update {
        #[serde(flatten)]
        changes: OpportunityChanges,
        #[serde(default)]
        source: Source,
    },
    #[serde(rename = "UpdateRenewalOpportunity", rename_all = "camelCase")]
    UpdateRenewal {
        /// Defaults to high, which also resets the adjusted rate to 100.
        #[serde(default)]
        renewal_likelihood: Option<RenewalLikelihood>,
        #[serde(default)]
        renewal_approved: bool,
        #[serde(default)]
        renewed_at: Option<DateTime<Utc>>,
        #[serde(default)]
        renewal_adjusted_rate: Option<i64>,
        #[serde(default)]
        amount: Option<f64>,
        #[serde(default)]
        comments: Option<String>,
        #[serde(default)]
        owner_user_id: Option<String>,
        #[serde(default)]
        source: Source,
    },
    #[serde(rename = "UpdateRenewalOpportunityNextCycleDate", rename_all = "camelCase")]
    UpdateNextCycleDate { renewed_at: Option<DateTime<Utc>> },
    #[serde(rename = "CloseWinOpportunity", rename_all = "camelCase")]
    CloseWin {
        #[serde(default)]
        closed_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "CloseLooseOpportunity", rename_all = "camelCase")]
    CloseLoose {
        #[serde(default)]
        closed_at: Option<DateTime<Utc>>,
    },
}

impl DomainCommand for OpportunityCommand {
    const COMMAND_TYPES: &'static [&'static str] = &[
        "CreateOpportunity",
        "CreateRenewalOpportunity",
        "UpdateOpportunity",
        "UpdateRenewalOpportunity",
        "UpdateRenewalOpportunityNextCycleDate",
        "CloseWinOpportunity",
        "CloseLooseOpportunity",
    ];

    fn command_type(&self) -> &'static str {
        match self {
            OpportunityCommand::Create { .. } => "CreateOpportunity",
            OpportunityCommand::CreateRenewal { .. } => "CreateRenewalOpportunity",
            OpportunityCommand::Update { .. } => "UpdateOpportunity",
            OpportunityCommand::UpdateRenewal { .. } => "UpdateRenewalOpportunity",
            OpportunityCommand::UpdateNextCycleDate { .. } => {
                "UpdateRenewalOpportunityNextCycleDate"
            }
            OpportunityCommand::CloseWin { .. } => "CloseWinOpportunity",
            OpportunityCommand::CloseLoose { .. } => "CloseLooseOpportunity",
        }
    }

    fn validate(&self) -> Result<(), Error> {
        match self {
            OpportunityCommand::CreateRenewal { contract_id, .. } => {
                required("contract_id", contract_id)
            }
            OpportunityCommand::Create { fields, .. } if fields.amount < 0.0 => {
                Err(Error::validation("amount", "must not be negative"))
            }
            OpportunityCommand::UpdateRenewal {
                amount: Some(amount),
                ..
            } if *amount < 0.0 => Err(Error::validation("amount", "must not be negative")),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub fields: OpportunityFields,
    pub max_amount: f64,
    pub contract_id: String,
    pub created_by_user_id: String,
    pub renewal: RenewalDetails,
    #[serde(default)]
    pub comments: String,
    pub source: Source,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Opportunity {
    pub fn is_renewal(&self) -> bool {
        self.fields.internal_type == InternalType::Renewal
    }

    pub fn is_open(&self) -> bool {
        self.fields.internal_stage == InternalStage::Open
    }
}

impl Aggregate for Opportunity {
    const AGGREGATE_TYPE: &'static str = OPPORTUNITY_AGGREGATE_TYPE;
    type Event = OpportunityEvent;
    type Command = OpportunityCommand;

    fn when(&mut self, event: OpportunityEvent) -> Result<(), Error> {
        match event {
            OpportunityEvent::Created(created) => {
                self.fields = created.fields;
                self.created_by_user_id = created.created_by_user_id;
                self.source = created.source;
                self.created_at = Some(created.created_at);
                self.updated_at = Some(created.updated_at);
            }
            OpportunityEvent::RenewalCreated(created) => {
                self.contract_id = created.contract_id;
                self.fields.internal_type = InternalType::Renewal;
                self.fields.internal_stage = created.internal_stage;
                self.renewal = created.renewal;
                self.source = created.source;
                self.created_at = Some(created.created_at);
                self.updated_at = Some(created.updated_at);
            }
            OpportunityEvent::Updated(updated) => {
                if updated.source == SOURCE_OPENLINE {
                    self.source.source_of_truth = updated.source.clone();
                }
                let changes = updated.changes;
                if self.source.protects_against(&updated.source) {
                    if self.fields.name.is_empty() {
                        if let Some(name) = changes.name {
                            self.fields.name = name;
                        }
                    }
                } else {
                    if let Some(name) = changes.name {
                        self.fields.name = name;
                    }
                    if let Some(amount) = changes.amount {
                        self.fields.amount = amount;
                    }
                    if let Some(max_amount) = changes.max_amount {
                        self.max_amount = max_amount;
                    }
                    if let Some(external_stage) = changes.external_stage {
                        self.fields.external_stage = external_stage;
                    }
                    if let Some(external_type) = changes.external_type {
                        self.fields.external_type = external_type;
                    }
                    if changes.estimated_closed_at.is_some() {
                        self.fields.estimated_closed_at = changes.estimated_closed_at;
                    }
                    if let Some(owner_user_id) = changes.owner_user_id {
                        self.fields.owner_user_id = owner_user_id;
                    }
                    if let Some(internal_stage) = changes.internal_stage {
                        self.fields.internal_stage = internal_stage;
                    }
                }
                self.updated_at = Some(updated.updated_at);
            }
            OpportunityEvent::RenewalUpdated(updated) => {
                if updated.source == SOURCE_OPENLINE {
                    self.source.source_of_truth = updated.source;
                }
                self.renewal.renewal_likelihood = updated.renewal_likelihood;
                if updated.renewal_approved {
                    self.renewal.renewal_approved = true;
                }
                if updated.renewed_at.is_some() {
                    self.renewal.renewed_at = updated.renewed_at;
                }
                if let Some(rate) = updated.renewal_adjusted_rate {
                    self.renewal.renewal_adjusted_rate = rate;
                }
                if let Some(amount) = updated.amount {
                    self.fields.amount = amount;
                }
                if let Some(comments) = updated.comments {
                    self.comments = comments;
                }
                if let Some(owner_user_id) = updated.owner_user_id {
                    self.fields.owner_user_id = owner_user_id;
                }
                self.updated_at = Some(updated.updated_at);
            }
            OpportunityEvent::NextCycleDateUpdated(updated) => {
                self.renewal.renewed_at = updated.renewed_at;
                self.updated_at = Some(updated.updated_at);
            }
            OpportunityEvent::ClosedWon(closed) => {
                self.fields.internal_stage = InternalStage::ClosedWon;
                self.closed_at = Some(closed.closed_at);
                self.updated_at = Some(closed.updated_at);
            }
            OpportunityEvent::ClosedLost(closed) => {
                self.fields.internal_stage = InternalStage::ClosedLost;
                self.closed_at = Some(closed.closed_at);
                self.updated_at = Some(closed.updated_at);
            }
        }
        Ok(())
    }

    fn handle(
        root: &mut AggregateRoot<Self>,
        command: &CommandEnvelope<OpportunityCommand>,
    ) -> Result<(), Error> {
        let metadata = EventMetadata::from_command(command);
        let now = Utc::now();

        let creating = matches!(
            command.payload,
            OpportunityCommand::Create { .. } | OpportunityCommand::CreateRenewal { .. }
        );
        if creating && !root.is_new() {
            return Err(rejected(root, "opportunity already exists"));
        }
        if !creating && root.is_new() {
            return Err(rejected(root, "opportunity does not exist"));
        }

        match &command.payload {
            OpportunityCommand::Create { fields, source } => {
                let event = OpportunityEvent::Created(OpportunityCreateEvent {
                    fields: fields.clone(),
                    created_by_user_id: command.actor_user_id.clone().unwrap_or_default(),
                    source: source.clone().with_defaults(&command.app_source),
                    created_at: now,
                    updated_at: now,
                });
                root.raise(&event, &metadata)
            }
            OpportunityCommand::CreateRenewal {
                contract_id,
                renewal_likelihood,
                renewal_approved,
                renewed_at,
                renewal_adjusted_rate,
                source,
            } => {
                let renewal_likelihood = renewal_likelihood.unwrap_or_default();
                let mut adjusted_rate = *renewal_adjusted_rate;
                if renewal_likelihood == RenewalLikelihood::High && adjusted_rate == 0 {
                    adjusted_rate = 100;
                }
                let event = OpportunityEvent::RenewalCreated(OpportunityCreateRenewalEvent {
                    contract_id: contract_id.clone(),
                    internal_stage: InternalStage::Open,
                    renewal: RenewalDetails {
                        renewal_likelihood,
                        renewal_approved: *renewal_approved,
                        renewed_at: *renewed_at,
                        renewal_adjusted_rate: adjusted_rate.clamp(0, 100),
                    },
                    source: source.clone().with_defaults(&command.app_source),
                    created_at: now,
                    updated_at: now,
                });
                root.raise(&event, &metadata)
            }
            OpportunityCommand::Update { changes, source } => {
                let source = source.clone().with_defaults(&command.app_source);
                let event = OpportunityEvent::Updated(OpportunityUpdateEvent {
                    changes: changes.clone(),
                    source: source.source,
                    updated_at: now,
                });
                root.raise(&event, &metadata)
            }
            OpportunityCommand::UpdateRenewal {
                renewal_likelihood,
                renewal_approved,
                renewed_at,
                renewal_adjusted_rate,
                amount,
                comments,
                owner_user_id,
                source,
            } => {
                if !root.state().is_renewal() {
                    return Err(rejected(root, "opportunity is not a renewal"));
                }
                let (renewal_likelihood, renewal_adjusted_rate) = match renewal_likelihood {
                    Some(likelihood) => (*likelihood, *renewal_adjusted_rate),
                    None => (RenewalLikelihood::High, Some(100)),
                };
                let source = source.clone().with_defaults(&command.app_source);
                let event = OpportunityEvent::RenewalUpdated(OpportunityUpdateRenewalEvent {
                    renewal_likelihood,
                    renewal_approved: *renewal_approved,
                    renewed_at: *renewed_at,
                    renewal_adjusted_rate: renewal_adjusted_rate.map(|rate| rate.clamp(0, 100)),
                    amount: *amount,
                    comments: comments.clone(),
                    owner_user_id: owner_user_id.clone().filter(|id| !id.is_empty()),
                    source: source.source,
                    updated_at: now,
                });
                root.raise(&event, &metadata)
            }
            OpportunityCommand::UpdateNextCycleDate { renewed_at } => {
                if !root.state().is_renewal() {
                    return Err(rejected(root, "opportunity is not a renewal"));
                }
                if !root.state().is_open() {
                    return Err(rejected(root, "opportunity is closed"));
                }
                let event =
                    OpportunityEvent::NextCycleDateUpdated(OpportunityUpdateNextCycleDateEvent {
                        renewed_at: *renewed_at,
                        updated_at: now,
                    });
                root.raise(&event, &metadata)
            }
            OpportunityCommand::CloseWin { closed_at } => {
                if root.state().fields.internal_stage == InternalStage::ClosedWon {
                    return Ok(());
                }
                let event = OpportunityEvent::ClosedWon(OpportunityCloseEvent {
                    closed_at: closed_at.unwrap_or(now),
                    updated_at: now,
                });
                root.raise(&event, &metadata)
            }
            OpportunityCommand::CloseLoose { closed_at } => {
                if root.state().fields.internal_stage == InternalStage::ClosedLost {
                    return Ok(());
                }
                let event = OpportunityEvent::ClosedLost(OpportunityCloseEvent {
                    closed_at: closed_at.unwrap_or(now),
                    updated_at: now,
                });
                root.raise(&event, &metadata)
            }
        }
    }
}
