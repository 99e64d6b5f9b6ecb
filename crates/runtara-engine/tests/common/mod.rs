// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtara-engine integration tests.
//!
//! Provides TestContext for sharing one storage between several engine
//! lifetimes, plus polling helpers.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use runtara_engine::{
    Engine, InstanceDescriptor, InstanceEvent, InstanceMetadata, InstanceStatus, ManualAlarm,
    SqlitePersistence, StepContext, TriggerEvent, VersionDescriptor, WorkflowDescriptor,
    WorkflowEntrypoint, WorkflowError,
};

/// Upper bound for every wait in the tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage shared by every engine built from the same context.
pub struct TestContext {
    pub persistence: Arc<SqlitePersistence>,
    pub alarm: Arc<ManualAlarm>,
}

impl TestContext {
    /// In-memory storage.
    pub async fn new() -> Self {
        let persistence = SqlitePersistence::in_memory()
            .await
            .expect("Failed to open in-memory SQLite");
        Self {
            persistence: Arc::new(persistence),
            alarm: Arc::new(ManualAlarm::new()),
        }
    }

    /// Storage in a database file.
    pub async fn on_disk(path: &Path) -> Self {
        let persistence = SqlitePersistence::from_path(path)
            .await
            .expect("Failed to open SQLite file");
        Self {
            persistence: Arc::new(persistence),
            alarm: Arc::new(ManualAlarm::new()),
        }
    }

    /// A fresh engine lifetime over this storage.
    pub fn engine(&self, workflow: Arc<dyn WorkflowEntrypoint>) -> Arc<Engine> {
        Engine::builder()
            .persistence(self.persistence.clone())
            .alarm(self.alarm.clone())
            .workflow(workflow)
            .build()
            .expect("Failed to build engine")
    }

    /// A fresh engine lifetime with custom grace-period settings.
    pub fn engine_with_grace(
        &self,
        workflow: Arc<dyn WorkflowEntrypoint>,
        grace_period: Duration,
        resume_delay: Duration,
    ) -> Arc<Engine> {
        Engine::builder()
            .persistence(self.persistence.clone())
            .alarm(self.alarm.clone())
            .workflow(workflow)
            .grace_period(grace_period)
            .resume_delay(resume_delay)
            .build()
            .expect("Failed to build engine")
    }
}

/// Wrap a closure as a workflow entrypoint.
pub fn workflow<F, Fut>(f: F) -> Arc<dyn WorkflowEntrypoint>
where
    F: Fn(TriggerEvent, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
{
    Arc::new(f)
}

/// Workflow that returns its trigger payload.
pub fn echo_workflow() -> Arc<dyn WorkflowEntrypoint> {
    workflow(|event: TriggerEvent, _step: StepContext| async move {
        Ok::<_, WorkflowError>(event.payload)
    })
}

/// Workflow that returns the payload of the first event of `event_type`.
pub fn wait_workflow(event_type: &'static str) -> Arc<dyn WorkflowEntrypoint> {
    workflow(move |_event: TriggerEvent, step: StepContext| async move {
        let event = step.wait_for_event(event_type).await?;
        Ok::<_, WorkflowError>(event.payload)
    })
}

/// Metadata of a freshly created instance.
pub fn sample_metadata(instance_id: &str) -> InstanceMetadata {
    let now = Utc::now();
    InstanceMetadata {
        account_id: 100,
        workflow: WorkflowDescriptor {
            id: "wf-1".to_string(),
            name: "order-sync".to_string(),
            script_name: "orders".to_string(),
            class_name: Some("OrderSync".to_string()),
            created_on: now,
            modified_on: now,
            triggered_on: Some(now),
        },
        version: VersionDescriptor {
            id: "ver-1".to_string(),
            workflow_id: "wf-1".to_string(),
            class_name: "OrderSync".to_string(),
            created_on: now,
            modified_on: now,
            mutable_pipeline_id: "pipe-1".to_string(),
        },
        instance: InstanceDescriptor {
            id: instance_id.to_string(),
            workflow_id: "wf-1".to_string(),
            version_id: "ver-1".to_string(),
            status: InstanceStatus::Queued,
            created_on: now,
            modified_on: now,
            started_on: None,
            ended_on: None,
        },
        event: TriggerEvent {
            payload: json!({ "order": 42 }),
            timestamp: now,
            instance_id: instance_id.to_string(),
        },
    }
}

/// Poll until `check` holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "Timed out waiting for {}", what);
}

/// Wait until the engine reports `status`.
pub async fn wait_for_status(engine: &Arc<Engine>, status: InstanceStatus) {
    wait_until(&format!("status {}", status), || {
        let engine = engine.clone();
        async move { matches!(engine.get_status().await, Ok(s) if s == status) }
    })
    .await;
}

/// Wait until a run is in progress and a waiter for `event_type` exists.
pub async fn wait_for_waiter(engine: &Arc<Engine>, event_type: &str) {
    wait_until(&format!("waiter for {}", event_type), || {
        let engine = engine.clone();
        let event_type = event_type.to_string();
        async move { engine.is_running() && engine.pending_waiters(&event_type).await > 0 }
    })
    .await;
}

/// Event kinds of the whole log, in order.
pub async fn log_events(engine: &Engine) -> Vec<InstanceEvent> {
    engine
        .read_logs()
        .await
        .expect("Failed to read logs")
        .into_iter()
        .map(|record| record.event)
        .collect()
}
