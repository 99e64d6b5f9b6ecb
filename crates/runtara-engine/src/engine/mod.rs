// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine actor for one workflow instance.
//!
//! The engine owns the instance status, the durable log, the event map and the
//! timer store. Every state change is written to storage before it is acted
//! upon, so a fresh engine over the same storage resumes where the previous
//! lifetime stopped.
//!
//! The engine is shared as `Arc<Engine>`: resumes triggered by
//! [`Engine::receive_event`] and [`Engine::alarm`] run on spawned tasks.

mod builder;
mod context;

pub use builder::EngineBuilder;
pub use context::{StepContext, WorkflowEntrypoint};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{Span, debug, error, info, instrument, warn};

use crate::alarm::AlarmScheduler;
use crate::barrier::StartupBarrier;
use crate::error::{EngineError, Result, WorkflowError};
use crate::events::{EVENT_MAP_PREFIX, EventCorrelator};
use crate::grace::{Continuation, GracePeriodGuard};
use crate::instance::{
    ENGINE_STATUS_KEY, Event, INSTANCE_METADATA_KEY, InstanceEvent, InstanceMetadata,
    InstanceStatus, InstanceTrigger, LogEntry, LogRecord,
};
use crate::persistence::Persistence;
use crate::timers::{TimerEntryType, TimerStore, hash_key};

/// Error name recorded when a non-retryable failure ends the run.
pub const WORKFLOW_FATAL_ERROR_NAME: &str = "WorkflowFatalError";

/// Message recorded when a non-retryable failure ends the run.
pub const WORKFLOW_FATAL_ERROR_MESSAGE: &str = "The execution of the Workflow instance was terminated, as a step threw an NonRetryableError and it was not handled";

/// Key of the grace-period continuation timer. One per actor.
const GRACE_PERIOD_KEY: &str = "grace-period";

/// Outcome of [`Engine::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// A run is already in progress in this lifetime; nothing was done.
    AlreadyRunning,
    /// The instance already reached a terminal status; nothing was run.
    Terminal(InstanceStatus),
    /// The workflow ran to the given status.
    Ran {
        /// The instance ID.
        instance_id: String,
        /// Status after the run.
        status: InstanceStatus,
    },
}

/// Outcome of [`Engine::receive_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a registered waiter.
    Delivered,
    /// Stored until a waiter asks for it.
    Buffered,
    /// Stored, and a resume of the run was started.
    Resuming,
}

/// Identity cached for the current lifetime, rebuilt from the metadata.
#[derive(Debug, Clone)]
struct InstanceIdentity {
    account_id: i64,
    instance_id: String,
    workflow_name: String,
}

/// Durable engine actor for one workflow instance.
pub struct Engine {
    persistence: Arc<dyn Persistence>,
    alarm: Arc<dyn AlarmScheduler>,
    workflow: Arc<dyn WorkflowEntrypoint>,
    barrier: StartupBarrier,
    timers: OnceCell<TimerStore>,
    guard: GracePeriodGuard,
    resume_delay: Duration,
    running: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    identity: Mutex<Option<InstanceIdentity>>,
    events: tokio::sync::Mutex<EventCorrelator>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instance_id", &self.instance_id())
            .field("running", &self.is_running())
            .field("grace_period", &self.guard.timeout())
            .field("resume_delay", &self.resume_delay)
            .finish()
    }
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn new(
        persistence: Arc<dyn Persistence>,
        alarm: Arc<dyn AlarmScheduler>,
        workflow: Arc<dyn WorkflowEntrypoint>,
        grace_period: Duration,
        resume_delay: Duration,
    ) -> Self {
        Self {
            persistence,
            alarm,
            workflow,
            barrier: StartupBarrier::new(),
            timers: OnceCell::new(),
            guard: GracePeriodGuard::new(grace_period),
            resume_delay,
            running: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            identity: Mutex::new(None),
            events: tokio::sync::Mutex::new(EventCorrelator::new()),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start or resume the instance.
    ///
    /// Replays due timers, reconciles the identity with the persisted
    /// metadata, records the first start, restores the event map and runs the
    /// workflow once. `metadata` is only needed on the very first start; later
    /// lifetimes read it back from storage.
    #[instrument(skip_all, fields(instance_id = tracing::field::Empty))]
    pub async fn init(self: &Arc<Self>, metadata: Option<InstanceMetadata>) -> Result<InitOutcome> {
        let timers = self.ready().await?;

        if self.is_running() {
            debug!("Run already in progress");
            return Ok(InitOutcome::AlreadyRunning);
        }

        let due = timers.pop_past_entries().await?;
        if !due.is_empty() {
            debug!(count = due.len(), "Consumed timers that fired while asleep");
        }
        timers.handle_next_alarm().await?;

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(InitOutcome::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        self.start_claimed(metadata).await
    }

    /// Body of [`Engine::init`] once the running flag is held.
    async fn start_claimed(
        self: &Arc<Self>,
        supplied: Option<InstanceMetadata>,
    ) -> Result<InitOutcome> {
        let persisted = self.load_metadata().await?;
        let first_start = persisted.is_none();
        let Some(metadata) = persisted.or(supplied) else {
            return Err(EngineError::never_started(self.instance_id().as_deref()));
        };

        let instance_id = metadata.instance.id.clone();
        Span::current().record("instance_id", instance_id.as_str());
        self.remember(&metadata);

        let status = self.read_status().await?;
        if status.is_terminal() {
            info!(status = %status, "Instance already finished, not resuming");
            return Ok(InitOutcome::Terminal(status));
        }

        if first_start {
            let queued = LogEntry::new(
                InstanceEvent::WorkflowQueued,
                json!({
                    "params": metadata.event.payload,
                    "versionId": metadata.version.id,
                    "trigger": { "source": InstanceTrigger::Api },
                }),
            );
            let started = LogEntry::new(InstanceEvent::WorkflowStart, json!({}));
            self.persistence
                .record_first_start(&serde_json::to_value(&metadata)?, &[queued, started])
                .await?;
            info!(workflow = %metadata.workflow.name, "Instance started");
        } else {
            info!(workflow = %metadata.workflow.name, "Instance resumed");
        }

        self.restore_event_map().await?;

        // A terminate may have landed while the above was awaited.
        let status = self.transition(InstanceStatus::Running, None).await?;
        if status != InstanceStatus::Running {
            return Ok(InitOutcome::Terminal(status));
        }

        let step = StepContext::new(Arc::clone(self));
        let work = self.workflow.run(metadata.event.clone(), step);
        let outcome = self.guard.run(work, &GraceContinuation(self)).await;

        let status = self.finish_run(outcome).await?;
        Ok(InitOutcome::Ran {
            instance_id,
            status,
        })
    }

    /// Record the outcome of a run: one log entry and one status transition.
    async fn finish_run(
        &self,
        outcome: std::result::Result<Value, WorkflowError>,
    ) -> Result<InstanceStatus> {
        let current = self.read_status().await?;
        if current.is_terminal() {
            info!(status = %current, "Run ended after the instance was finalized");
            return Ok(current);
        }

        match outcome {
            Ok(result) => {
                if let Some(reason) = self.abort_reason() {
                    warn!(reason = %reason, "Aborted run completed, not recording success");
                    return Ok(current);
                }
                let status = self
                    .transition(
                        InstanceStatus::Complete,
                        Some(&LogEntry::new(
                            InstanceEvent::WorkflowSuccess,
                            json!({ "result": result }),
                        )),
                    )
                    .await?;
                if status == InstanceStatus::Complete {
                    info!("Workflow completed");
                }
                Ok(status)
            }
            Err(err) if err.is_fatal() => {
                let status = self
                    .transition(
                        InstanceStatus::Errored,
                        Some(&LogEntry::new(
                            InstanceEvent::WorkflowFailure,
                            json!({
                                "error": {
                                    "name": WORKFLOW_FATAL_ERROR_NAME,
                                    "message": WORKFLOW_FATAL_ERROR_MESSAGE,
                                }
                            }),
                        )),
                    )
                    .await?;
                if status == InstanceStatus::Errored {
                    error!(error = %err, "Workflow failed with a non-retryable error");
                    self.abort("A step threw a NonRetryableError");
                }
                Ok(status)
            }
            Err(err) => {
                let status = self
                    .transition(
                        InstanceStatus::Errored,
                        Some(&LogEntry::new(
                            InstanceEvent::WorkflowFailure,
                            json!({
                                "error": { "name": err.name(), "message": err.message() }
                            }),
                        )),
                    )
                    .await?;
                if status == InstanceStatus::Errored {
                    error!(error = %err, "Workflow failed");
                }
                Ok(status)
            }
        }
    }

    /// Commit a status transition and return the status in effect afterwards.
    ///
    /// Storage refuses transitions out of a terminal status; in that case the
    /// stored status is returned and nothing is written.
    async fn transition(
        &self,
        status: InstanceStatus,
        log: Option<&LogEntry>,
    ) -> Result<InstanceStatus> {
        match self.persistence.commit_transition(status, log).await {
            Ok(()) => Ok(status),
            Err(EngineError::InvalidTransition { .. }) => {
                let current = self.read_status().await?;
                info!(status = %current, requested = %status, "Transition refused");
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }

    /// Host alarm callback.
    ///
    /// Consumes due timers and reprograms the alarm while a run is in
    /// progress; otherwise resumes the run from the persisted metadata.
    #[instrument(skip_all, fields(instance_id = ?self.instance_id()))]
    pub async fn alarm(self: &Arc<Self>) -> Result<()> {
        let timers = self.ready().await?;

        if self.is_running() {
            let due = timers.pop_past_entries().await?;
            debug!(count = due.len(), "Alarm while running");
            timers.handle_next_alarm().await?;
            return Ok(());
        }

        match self.load_metadata().await? {
            Some(metadata) => {
                debug!("Alarm woke an idle engine, resuming");
                self.spawn_resume(metadata);
            }
            None => {
                warn!("Alarm fired for an instance that never started");
                timers.handle_next_alarm().await?;
            }
        }
        Ok(())
    }

    /// Mark the current run as aborted. A later successful completion of that
    /// run is not recorded.
    pub fn abort(&self, reason: &str) {
        info!(reason = %reason, "Run aborted");
        *self.abort_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
    }

    /// Reason given to the last [`Engine::abort`] of this lifetime, if any.
    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Terminate the instance on user request.
    ///
    /// Writes `Terminated` together with a termination log entry and aborts the
    /// current run. A run in progress is not interrupted, but its outcome is no
    /// longer recorded and no later resume happens. Terminating an instance that
    /// already finished is a no-op that returns its status.
    #[instrument(skip_all, fields(instance_id = ?self.instance_id()))]
    pub async fn user_triggered_terminate(&self) -> Result<InstanceStatus> {
        self.ready().await?;
        self.require_started().await?;

        let status = self.read_status().await?;
        if status.is_terminal() {
            debug!(status = %status, "Terminate on a finished instance ignored");
            return Ok(status);
        }

        let status = self
            .transition(
                InstanceStatus::Terminated,
                Some(&LogEntry::new(
                    InstanceEvent::WorkflowTerminated,
                    json!({ "trigger": { "source": InstanceTrigger::Api } }),
                )),
            )
            .await?;
        if status != InstanceStatus::Terminated {
            return Ok(status);
        }
        self.abort("Terminated by user");
        info!("Instance terminated");

        Ok(InstanceStatus::Terminated)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Accept an external event.
    ///
    /// The event is written to the durable queue of its type first. A running
    /// engine then hands it to the oldest waiter of that type, if any; an idle
    /// engine resumes the run from the persisted metadata in the background,
    /// unless the instance already finished.
    #[instrument(skip_all, fields(instance_id = ?self.instance_id(), event_type = %event.event_type))]
    pub async fn receive_event(self: &Arc<Self>, event: Event) -> Result<Delivery> {
        self.ready().await?;
        let event_type = event.event_type.clone();

        let mut events = self.loaded_events().await?;
        events.buffer(event);
        self.persist_events(&events).await?;

        if self.is_running() {
            if events.try_deliver(&event_type) {
                self.persist_events(&events).await?;
                debug!("Event delivered to waiter");
                return Ok(Delivery::Delivered);
            }
            debug!("Event buffered");
            return Ok(Delivery::Buffered);
        }
        drop(events);

        let Some(metadata) = self.load_metadata().await? else {
            return Err(EngineError::never_started(self.instance_id().as_deref()));
        };
        let status = self.read_status().await?;
        if status.is_terminal() {
            debug!(status = %status, "Instance finished, event kept without resuming");
            return Ok(Delivery::Buffered);
        }
        self.spawn_resume(metadata);
        Ok(Delivery::Resuming)
    }

    /// Wait for the next event of `event_type`.
    ///
    /// A buffered event is consumed right away; otherwise a waiter is
    /// registered and resolved by a later [`Engine::receive_event`].
    pub async fn wait_for_event(&self, event_type: &str) -> Result<Event> {
        let waiter = {
            let mut events = self.loaded_events().await?;
            if let Some(event) = events.take_buffered(event_type) {
                self.persist_events(&events).await?;
                return Ok(event);
            }
            events.register_waiter(event_type)
        };

        waiter.await.map_err(|_| EngineError::EventChannelClosed {
            event_type: event_type.to_string(),
        })
    }

    /// Write the whole event map, replacing what was stored before.
    pub async fn store_event_map(&self) -> Result<()> {
        self.ready().await?;
        let events = self.loaded_events().await?;
        self.persist_events(&events).await
    }

    /// Replace the in-memory event map with the stored one. Registered waiters
    /// are kept.
    pub async fn restore_event_map(&self) -> Result<()> {
        self.ready().await?;
        let entries = self.persistence.list_values(EVENT_MAP_PREFIX).await?;
        let count = entries.len();
        self.events.lock().await.replace_events(entries)?;
        debug!(count, "Event map restored");
        Ok(())
    }

    /// Copy of the in-memory event map, keyed by event type.
    pub async fn event_map_snapshot(&self) -> std::collections::BTreeMap<String, Vec<Event>> {
        self.events.lock().await.snapshot()
    }

    /// Number of waiters registered for `event_type` in this lifetime.
    pub async fn pending_waiters(&self, event_type: &str) -> usize {
        self.events.lock().await.waiter_count(event_type)
    }

    /// Lock the event map, loading it from storage first if this lifetime has
    /// not done so yet. Every full rewrite goes through here, so events stored
    /// by an earlier lifetime are never overwritten by an empty map.
    async fn loaded_events(&self) -> Result<tokio::sync::MutexGuard<'_, EventCorrelator>> {
        let mut events = self.events.lock().await;
        if !events.is_restored() {
            let entries = self.persistence.list_values(EVENT_MAP_PREFIX).await?;
            events.replace_events(entries)?;
        }
        Ok(events)
    }

    async fn persist_events(&self, events: &EventCorrelator) -> Result<()> {
        let entries = events.to_entries()?;
        self.persistence
            .replace_prefix(EVENT_MAP_PREFIX, &entries)
            .await
    }

    fn spawn_resume(self: &Arc<Self>, metadata: InstanceMetadata) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.init(Some(metadata)).await {
                error!(error = %e, code = e.error_code(), "Resume failed");
            }
        });
    }

    // ========================================================================
    // Status and log
    // ========================================================================

    /// Current status. Falls back to `Queued` when no status was written.
    ///
    /// Fails with [`EngineError::StartupError`] if the instance never started.
    pub async fn get_status(&self) -> Result<InstanceStatus> {
        self.ready().await?;
        self.require_started().await?;
        self.read_status().await
    }

    /// Write the status.
    ///
    /// Fails with [`EngineError::InvalidTransition`] when the current status is
    /// terminal or `status` would move it backwards.
    pub async fn set_status(&self, status: InstanceStatus) -> Result<()> {
        self.ready().await?;
        self.persistence.commit_transition(status, None).await
    }

    /// Append a log entry and return its ID.
    pub async fn write_log(&self, entry: LogEntry) -> Result<i64> {
        self.ready().await?;
        self.persistence.append_log(&entry).await
    }

    /// The whole log in causal order.
    pub async fn read_logs(&self) -> Result<Vec<LogRecord>> {
        self.ready().await?;
        self.persistence.read_logs().await
    }

    /// Log entries written for one step, identified by its cache key.
    pub async fn read_logs_from_step(&self, cache_key: &str) -> Result<Vec<LogRecord>> {
        let logs = self.read_logs().await?;
        Ok(logs
            .into_iter()
            .filter(|record| record.group.as_deref() == Some(cache_key))
            .collect())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Whether a run is in progress in this lifetime.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Instance ID, once known in this lifetime.
    pub fn instance_id(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|identity| identity.instance_id.clone())
    }

    /// Owning account, once known in this lifetime.
    pub fn account_id(&self) -> Option<i64> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|identity| identity.account_id)
    }

    /// Workflow name, once known in this lifetime.
    pub fn workflow_name(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|identity| identity.workflow_name.clone())
    }

    /// The timer store, loaded on first use.
    pub async fn timer_store(&self) -> Result<&TimerStore> {
        self.ready().await
    }

    /// The grace-period guard.
    pub fn guard(&self) -> &GracePeriodGuard {
        &self.guard
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Wait for schema setup, then load the timer store.
    async fn ready(&self) -> Result<&TimerStore> {
        self.barrier
            .wait_or_run(|| self.persistence.setup())
            .await?;
        self.timers
            .get_or_try_init(|| {
                TimerStore::load(Arc::clone(&self.persistence), Arc::clone(&self.alarm))
            })
            .await
    }

    async fn load_metadata(&self) -> Result<Option<InstanceMetadata>> {
        match self.persistence.get_value(INSTANCE_METADATA_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn read_status(&self) -> Result<InstanceStatus> {
        match self.persistence.get_value(ENGINE_STATUS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(InstanceStatus::Queued),
        }
    }

    /// Make sure the identity is known, rebuilding it from storage on a cold
    /// engine.
    async fn require_started(&self) -> Result<()> {
        if self.instance_id().is_some() {
            return Ok(());
        }
        match self.load_metadata().await? {
            Some(metadata) => {
                self.remember(&metadata);
                Ok(())
            }
            None => Err(EngineError::never_started(None)),
        }
    }

    fn remember(&self, metadata: &InstanceMetadata) {
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = Some(InstanceIdentity {
            account_id: metadata.account_id,
            instance_id: metadata.instance.id.clone(),
            workflow_name: metadata.workflow.name.clone(),
        });
    }
}

/// Clears the running flag when a run ends, including when the future
/// driving it is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Grace-period continuation: a persisted timer that wakes the actor through
/// the host alarm.
struct GraceContinuation<'a>(&'a Engine);

#[async_trait]
impl Continuation for GraceContinuation<'_> {
    async fn defer(&self) -> Result<()> {
        let engine = self.0;
        let timers = engine.ready().await?;
        let hash = hash_key(GRACE_PERIOD_KEY);

        if timers
            .active_target(TimerEntryType::GracePeriod, &hash)
            .await
            .is_none()
        {
            let delay = chrono::Duration::from_std(engine.resume_delay).map_err(|e| {
                EngineError::SerializationError {
                    details: e.to_string(),
                }
            })?;
            timers
                .schedule(TimerEntryType::GracePeriod, &hash, Utc::now() + delay)
                .await?;
        }
        timers.handle_next_alarm().await?;
        Ok(())
    }

    async fn settle(&self) -> Result<()> {
        let timers = self.0.ready().await?;
        timers
            .cancel(TimerEntryType::GracePeriod, &hash_key(GRACE_PERIOD_KEY))
            .await?;
        timers.handle_next_alarm().await?;
        Ok(())
    }
}
