// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The surface handed to the workflow step layer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use super::{Engine, GraceContinuation};
use crate::error::{EngineError, Result, WorkflowError};
use crate::instance::{Event, InstanceEvent, LogEntry, TriggerEvent};
use crate::timers::{TimerEntryType, hash_key};

/// The workflow code driven by the engine, invoked once per lifetime.
#[async_trait]
pub trait WorkflowEntrypoint: Send + Sync {
    /// Run the workflow for `event`, using `step` for durable operations.
    async fn run(
        &self,
        event: TriggerEvent,
        step: StepContext,
    ) -> std::result::Result<Value, WorkflowError>;
}

#[async_trait]
impl<F, Fut> WorkflowEntrypoint for F
where
    F: Fn(TriggerEvent, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, WorkflowError>> + Send + 'static,
{
    async fn run(
        &self,
        event: TriggerEvent,
        step: StepContext,
    ) -> std::result::Result<Value, WorkflowError> {
        (self)(event, step).await
    }
}

/// Durable operations available to a running workflow.
#[derive(Debug, Clone)]
pub struct StepContext {
    engine: Arc<Engine>,
}

impl StepContext {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// The instance being run.
    pub fn instance_id(&self) -> Option<String> {
        self.engine.instance_id()
    }

    /// Wait for the next event of `event_type`, consuming a buffered one if
    /// present.
    pub async fn wait_for_event(&self, event_type: &str) -> Result<Event> {
        let group = format!("wait-{}", event_type);
        self.engine
            .write_log(
                LogEntry::new(InstanceEvent::WaitStart, json!({ "type": event_type }))
                    .with_group(group.as_str()),
            )
            .await?;

        let event = self.engine.wait_for_event(event_type).await?;

        self.engine
            .write_log(
                LogEntry::new(
                    InstanceEvent::WaitComplete,
                    json!({ "type": event_type, "payload": event.payload }),
                )
                .with_group(group),
            )
            .await?;
        Ok(event)
    }

    /// Durable sleep.
    ///
    /// The wake time is persisted as a timer and in the step log, so a sleep
    /// interrupted by a restart resumes against its original target, and one
    /// that already completed returns immediately.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<()> {
        let cache_key = format!("sleep-{}", name);
        let hash = hash_key(&cache_key);
        let timers = self.engine.timer_store().await?;

        let logs = self.engine.read_logs_from_step(&cache_key).await?;
        if logs
            .iter()
            .any(|record| record.event == InstanceEvent::SleepComplete)
        {
            debug!(name, "Sleep already completed");
            return Ok(());
        }

        let recorded = logs
            .iter()
            .find(|record| record.event == InstanceEvent::SleepStart)
            .and_then(|record| record.metadata.get("target").cloned())
            .and_then(|target| serde_json::from_value::<DateTime<Utc>>(target).ok());

        let target = match timers.active_target(TimerEntryType::Sleep, &hash).await {
            Some(target) => target,
            None => match recorded {
                Some(target) => target,
                None => {
                    let delay = chrono::Duration::from_std(duration).map_err(|e| {
                        EngineError::SerializationError {
                            details: e.to_string(),
                        }
                    })?;
                    let target = Utc::now() + delay;
                    timers
                        .schedule(TimerEntryType::Sleep, &hash, target)
                        .await?;
                    timers.handle_next_alarm().await?;
                    self.engine
                        .write_log(
                            LogEntry::new(
                                InstanceEvent::SleepStart,
                                json!({ "target": target, "duration_ms": duration.as_millis() as u64 }),
                            )
                            .with_group(cache_key.as_str()),
                        )
                        .await?;
                    target
                }
            },
        };

        let remaining = (target - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(remaining).await;

        timers.cancel(TimerEntryType::Sleep, &hash).await?;
        timers.handle_next_alarm().await?;
        self.engine
            .write_log(LogEntry::new(InstanceEvent::SleepComplete, json!({})).with_group(cache_key))
            .await?;
        Ok(())
    }

    /// Run `work` under the grace-period guard.
    pub async fn guarded<F, T>(&self, work: F) -> T
    where
        F: Future<Output = T>,
    {
        self.engine
            .guard
            .run(work, &GraceContinuation(&self.engine))
            .await
    }

    /// Append a log entry to the durable log.
    pub async fn write_log(&self, entry: LogEntry) -> Result<i64> {
        self.engine.write_log(entry).await
    }
}
