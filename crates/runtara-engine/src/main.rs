// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Engine demo
//!
//! Runs one embedded workflow instance: the workflow sleeps durably, then waits
//! for an `approval` event which this binary delivers after a short delay.
//!
//! Storage and timeouts come from `RUNTARA_ENGINE_*` environment variables
//! (see [`EngineConfig::from_env`]).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info};
use uuid::Uuid;

use runtara_engine::{
    Engine, EngineConfig, Event, InstanceDescriptor, InstanceMetadata, InstanceStatus,
    SqlitePersistence, StepContext, TokioAlarm, TriggerEvent, VersionDescriptor,
    WorkflowDescriptor, WorkflowError,
};

async fn approval_workflow(
    event: TriggerEvent,
    step: StepContext,
) -> std::result::Result<Value, WorkflowError> {
    info!(params = %event.payload, "Workflow started");

    step.sleep("cool-down", Duration::from_secs(2)).await?;
    let approval = step.wait_for_event("approval").await?;

    if approval.payload["approved"] != json!(true) {
        return Err(WorkflowError::non_retryable("order was rejected"));
    }
    Ok(json!({ "order": event.payload["order"], "approved_by": approval.payload["by"] }))
}

fn demo_metadata() -> InstanceMetadata {
    let now = Utc::now();
    let workflow_id = Uuid::new_v4().to_string();
    let version_id = Uuid::new_v4().to_string();
    let instance_id = Uuid::new_v4().to_string();

    InstanceMetadata {
        account_id: 1,
        workflow: WorkflowDescriptor {
            id: workflow_id.clone(),
            name: "order-approval".to_string(),
            script_name: "demo".to_string(),
            class_name: Some("ApprovalWorkflow".to_string()),
            created_on: now,
            modified_on: now,
            triggered_on: Some(now),
        },
        version: VersionDescriptor {
            id: version_id.clone(),
            workflow_id: workflow_id.clone(),
            class_name: "ApprovalWorkflow".to_string(),
            created_on: now,
            modified_on: now,
            mutable_pipeline_id: Uuid::new_v4().to_string(),
        },
        instance: InstanceDescriptor {
            id: instance_id.clone(),
            workflow_id,
            version_id,
            status: InstanceStatus::Queued,
            created_on: now,
            modified_on: now,
            started_on: None,
            ended_on: None,
        },
        event: TriggerEvent {
            payload: json!({ "order": 42 }),
            timestamp: now,
            instance_id,
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("runtara_engine=info".parse()?),
        )
        .init();

    let config = EngineConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        database_url = %config.database_url,
        grace_period_ms = config.grace_period.as_millis() as u64,
        "Configuration loaded"
    );

    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    let (alarm, mut fired) = TokioAlarm::channel();

    let engine = Engine::builder()
        .persistence(persistence)
        .alarm(Arc::new(alarm))
        .workflow(Arc::new(approval_workflow))
        .grace_period(config.grace_period)
        .resume_delay(config.resume_delay)
        .build()?;

    // Forward host alarms to the engine
    let alarm_engine = engine.clone();
    tokio::spawn(async move {
        while let Some(at) = fired.recv().await {
            info!(at = %at, "Alarm fired");
            if let Err(e) = alarm_engine.alarm().await {
                error!(error = %e, "Alarm handling failed");
            }
        }
    });

    let run_engine = engine.clone();
    let run = tokio::spawn(async move { run_engine.init(Some(demo_metadata())).await });

    tokio::time::sleep(Duration::from_secs(3)).await;
    let delivery = engine
        .receive_event(Event::new("approval", json!({ "approved": true, "by": "ops" })))
        .await?;
    info!(?delivery, "Approval sent");

    let outcome = run.await??;
    info!(?outcome, "Run finished");

    for record in engine.read_logs().await? {
        info!(
            id = record.id,
            event = ?record.event,
            group = ?record.group,
            metadata = %record.metadata,
            "Log"
        );
    }

    Ok(())
}
