// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Engine - durable actor for a single workflow instance
//!
//! This crate runs one long-lived workflow instance so that it survives process
//! restarts. Every piece of state needed to resume (identity, status, the
//! audit log, buffered events and armed timers) is written to SQLite before it
//! is acted upon.
//!
//! # Architecture
//!
//! ```text
//!   external event            host alarm
//!        │                        │
//!        ▼                        ▼
//! ┌─────────────────────────────────────────────┐
//! │                   Engine                    │
//! │   status · durable log · recovery protocol  │
//! └─────────────────────────────────────────────┘
//!     │              │               │
//!     ▼              ▼               ▼
//! ┌──────────┐ ┌────────────┐ ┌─────────────────┐
//! │  Event   │ │   Timer    │ │  Grace-Period   │
//! │Correlator│ │   Store    │ │     Guard       │
//! └──────────┘ └────────────┘ └─────────────────┘
//!     │              │
//!     ▼              ▼
//! ┌─────────────────────────────────────────────┐
//! │   SQLite: kv_store · states · priority_queue│
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! | From | Trigger | To |
//! |------|---------|----|
//! | `queued` | first [`Engine::init`] | `running` |
//! | `running` | workflow returns `Ok` | `complete` |
//! | `running` | workflow returns an error | `errored` |
//! | any non-terminal | [`Engine::user_triggered_terminate`] | `terminated` |
//!
//! Terminal statuses admit no further transition; a resume attempt on a
//! finished instance returns immediately.
//!
//! # Recovery
//!
//! A fresh [`Engine`] over the same storage knows nothing until it is woken by
//! [`Engine::receive_event`] or [`Engine::alarm`]. It then reloads the instance
//! metadata, consumes timers that fired while it was asleep, restores the event
//! map and runs the workflow again. Waiters are not persisted; the workflow
//! re-registers them and picks up the buffered events.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtara_engine::{Engine, Event, SqlitePersistence, StepContext, TriggerEvent, WorkflowError};
//!
//! let persistence = Arc::new(SqlitePersistence::from_path("data/inst-1.db").await?);
//! let engine = Engine::builder()
//!     .persistence(persistence)
//!     .workflow(Arc::new(|_event: TriggerEvent, step: StepContext| async move {
//!         let approval = step.wait_for_event("approval").await?;
//!         Ok::<_, WorkflowError>(approval.payload)
//!     }))
//!     .build()?;
//!
//! tokio::spawn({
//!     let engine = engine.clone();
//!     async move { engine.init(Some(metadata)).await }
//! });
//! engine.receive_event(Event::new("approval", serde_json::json!({"ok": true}))).await?;
//! ```

#![deny(missing_docs)]

pub mod alarm;
pub mod barrier;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod grace;
pub mod instance;
pub mod persistence;
pub mod timers;

pub use alarm::{AlarmScheduler, ManualAlarm, TokioAlarm};
pub use config::{ConfigError, EngineConfig};
pub use engine::{
    Delivery, Engine, EngineBuilder, InitOutcome, StepContext, WorkflowEntrypoint,
};
pub use error::{EngineError, Result, WorkflowError};
pub use instance::{
    Event, InstanceDescriptor, InstanceEvent, InstanceMetadata, InstanceStatus,
    InstanceTrigger, LogEntry, LogRecord, TriggerEvent, VersionDescriptor, WorkflowDescriptor,
};
pub use persistence::{Persistence, SqlitePersistence};
pub use timers::{TimerEntry, TimerEntryType, TimerStore};
