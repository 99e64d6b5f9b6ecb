// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Builder for [`Engine`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::{Engine, WorkflowEntrypoint};
use crate::alarm::{AlarmScheduler, ManualAlarm};
use crate::config::{DEFAULT_GRACE_PERIOD_MS, DEFAULT_RESUME_DELAY_MS, EngineConfig};
use crate::persistence::Persistence;

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    alarm: Option<Arc<dyn AlarmScheduler>>,
    workflow: Option<Arc<dyn WorkflowEntrypoint>>,
    grace_period: Duration,
    resume_delay: Duration,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("alarm", &self.alarm.as_ref().map(|_| "..."))
            .field("workflow", &self.workflow.as_ref().map(|_| "..."))
            .field("grace_period", &self.grace_period)
            .field("resume_delay", &self.resume_delay)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            alarm: None,
            workflow: None,
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            resume_delay: Duration::from_millis(DEFAULT_RESUME_DELAY_MS),
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the timeouts from a loaded configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new()
            .grace_period(config.grace_period)
            .resume_delay(config.resume_delay)
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the host alarm slot.
    ///
    /// Default: a [`ManualAlarm`] that only records the programmed time.
    pub fn alarm(mut self, alarm: Arc<dyn AlarmScheduler>) -> Self {
        self.alarm = Some(alarm);
        self
    }

    /// Set the workflow entrypoint (required).
    pub fn workflow(mut self, workflow: Arc<dyn WorkflowEntrypoint>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Set the grace-period timeout.
    ///
    /// Default: 5 minutes
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set the delay of the deferred continuation.
    ///
    /// Default: 1 second
    pub fn resume_delay(mut self, resume_delay: Duration) -> Self {
        self.resume_delay = resume_delay;
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<Arc<Engine>> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let workflow = self
            .workflow
            .ok_or_else(|| anyhow::anyhow!("workflow is required"))?;
        if self.grace_period.is_zero() {
            anyhow::bail!("grace_period must be greater than zero");
        }
        let alarm = self
            .alarm
            .unwrap_or_else(|| Arc::new(ManualAlarm::new()) as Arc<dyn AlarmScheduler>);

        Ok(Arc::new(Engine::new(
            persistence,
            alarm,
            workflow,
            self.grace_period,
            self.resume_delay,
        )))
    }
}
