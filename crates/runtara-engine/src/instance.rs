// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance data model: status, log event kinds, metadata and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// KV key holding the [`InstanceMetadata`] snapshot.
pub const INSTANCE_METADATA_KEY: &str = "INSTANCE_METADATA";

/// KV key holding the current [`InstanceStatus`].
pub const ENGINE_STATUS_KEY: &str = "ENGINE_STATUS";

/// Lifecycle status of the workflow instance.
///
/// ```text
/// QUEUED ──init──▶ RUNNING ──success──▶ COMPLETE
///    │                │
///    │                └──error──▶ ERRORED
///    └──────terminate─────▶ TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Created, the run has not started yet.
    Queued,
    /// The run is in progress.
    Running,
    /// The run finished successfully.
    Complete,
    /// The run failed.
    Errored,
    /// The run was terminated by the user.
    Terminated,
}

impl InstanceStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Errored => "errored",
            Self::Terminated => "terminated",
        }
    }

    /// Complete, Errored and Terminated admit no outgoing transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Errored | Self::Terminated)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Complete | Self::Errored | Self::Terminated => 2,
        }
    }

    /// Whether a write of `next` is allowed while in this status.
    ///
    /// Statuses only move forward. Re-writing the same non-terminal status is
    /// allowed so a resumed run can mark itself running again.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a durable log entry. Stored as an integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceEvent {
    /// The instance was queued.
    WorkflowQueued,
    /// The run started for the first time.
    WorkflowStart,
    /// The run completed.
    WorkflowSuccess,
    /// The run failed.
    WorkflowFailure,
    /// The run was terminated.
    WorkflowTerminated,
    /// A step started.
    StepStart,
    /// A step succeeded.
    StepSuccess,
    /// A step failed.
    StepFailure,
    /// A durable sleep started.
    SleepStart,
    /// A durable sleep elapsed.
    SleepComplete,
    /// A step attempt started.
    AttemptStart,
    /// A step attempt succeeded.
    AttemptSuccess,
    /// A step attempt failed.
    AttemptFailure,
    /// A wait for an external event started.
    WaitStart,
    /// A wait for an external event was satisfied.
    WaitComplete,
}

impl InstanceEvent {
    const ALL: [InstanceEvent; 15] = [
        Self::WorkflowQueued,
        Self::WorkflowStart,
        Self::WorkflowSuccess,
        Self::WorkflowFailure,
        Self::WorkflowTerminated,
        Self::StepStart,
        Self::StepSuccess,
        Self::StepFailure,
        Self::SleepStart,
        Self::SleepComplete,
        Self::AttemptStart,
        Self::AttemptSuccess,
        Self::AttemptFailure,
        Self::WaitStart,
        Self::WaitComplete,
    ];

    /// Integer code stored in the `event` column.
    pub fn code(&self) -> i64 {
        match self {
            Self::WorkflowQueued => 0,
            Self::WorkflowStart => 1,
            Self::WorkflowSuccess => 2,
            Self::WorkflowFailure => 3,
            Self::WorkflowTerminated => 4,
            Self::StepStart => 5,
            Self::StepSuccess => 6,
            Self::StepFailure => 7,
            Self::SleepStart => 8,
            Self::SleepComplete => 9,
            Self::AttemptStart => 10,
            Self::AttemptSuccess => 11,
            Self::AttemptFailure => 12,
            Self::WaitStart => 13,
            Self::WaitComplete => 14,
        }
    }

    /// Parse a stored code.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.code() == code)
    }
}

/// How the instance was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceTrigger {
    /// Created through the API.
    Api,
    /// Created by a worker binding.
    Binding,
    /// Created by an event.
    Event,
    /// Created by a cron schedule.
    Cron,
}

/// The workflow definition the instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    /// Workflow ID.
    pub id: String,
    /// Workflow name, used in logs.
    pub name: String,
    /// Script that hosts the workflow class.
    pub script_name: String,
    /// Entrypoint class name, if bound.
    pub class_name: Option<String>,
    /// Creation time.
    pub created_on: DateTime<Utc>,
    /// Last modification time.
    pub modified_on: DateTime<Utc>,
    /// Last time an instance was triggered.
    pub triggered_on: Option<DateTime<Utc>>,
}

/// The workflow version the instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    /// Version ID.
    pub id: String,
    /// Owning workflow ID.
    pub workflow_id: String,
    /// Entrypoint class name of this version.
    pub class_name: String,
    /// Creation time.
    pub created_on: DateTime<Utc>,
    /// Last modification time.
    pub modified_on: DateTime<Utc>,
    /// Pipeline the version was deployed from.
    pub mutable_pipeline_id: String,
}

/// The instance as known by the control plane when it was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Instance ID; also the actor identity.
    pub id: String,
    /// Owning workflow ID.
    pub workflow_id: String,
    /// Version the instance runs.
    pub version_id: String,
    /// Status when the descriptor was captured.
    pub status: InstanceStatus,
    /// Creation time.
    pub created_on: DateTime<Utc>,
    /// Last modification time.
    pub modified_on: DateTime<Utc>,
    /// Start time, if started.
    pub started_on: Option<DateTime<Utc>>,
    /// End time, if finished.
    pub ended_on: Option<DateTime<Utc>>,
}

/// The event that triggered the instance, handed to the workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Parameters of the run.
    pub payload: Value,
    /// When the instance was triggered.
    pub timestamp: DateTime<Utc>,
    /// The instance ID.
    pub instance_id: String,
}

/// Durable snapshot of identity and trigger, written once on first start.
///
/// Its presence in storage is the only signal that a run has ever started;
/// a cold engine rebuilds its cached identity from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// Owning account.
    pub account_id: i64,
    /// Workflow definition.
    pub workflow: WorkflowDescriptor,
    /// Workflow version.
    pub version: VersionDescriptor,
    /// Instance descriptor.
    pub instance: InstanceDescriptor,
    /// Triggering event.
    pub event: TriggerEvent,
}

/// An external event delivered to the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type used for correlation with waiters.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arrival timestamp.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary payload.
    pub payload: Value,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// A log entry about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Event kind.
    pub event: InstanceEvent,
    /// Optional group (usually a step cache key).
    pub group: Option<String>,
    /// Optional target.
    pub target: Option<String>,
    /// Arbitrary metadata, stored as a JSON document.
    pub metadata: Value,
}

impl LogEntry {
    /// Entry without group or target.
    pub fn new(event: InstanceEvent, metadata: Value) -> Self {
        Self {
            event,
            group: None,
            target: None,
            metadata,
        }
    }

    /// Set the group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// A log entry read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Auto-increasing ID, the canonical causal order.
    pub id: i64,
    /// When the row was written.
    pub created_on: DateTime<Utc>,
    /// Event kind.
    pub event: InstanceEvent,
    /// Optional group.
    pub group: Option<String>,
    /// Optional target.
    pub target: Option<String>,
    /// Decoded metadata.
    pub metadata: Value,
}
