use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use wps_bus::{AuditOutcome, AuditPublisher, EventHandler, FailurePublisher, FailureReport};
use wps_config::StackConfig;
use wps_domain::{
    status, EventType, NetworkProfile, PermitEvent, PermitStatus, Stage, WorkspacePlan,
};
use wps_driver::{ApplyOutputs, DestroyOutcome, StackDriver};
use wps_plan::{build_plan, stack_name};
use wps_store::StateStore;

use crate::error::EngineError;
use crate::locks::PermitLocks;

// ── Step bookkeeping ──────────────────────────────────────────────────────────

/// Outcome of one sub-operation within an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepResult {
    /// Operation ran and succeeded.
    Done,
    /// Nothing to do (e.g. scaling without a stored plan).
    Skipped,
    /// Operation failed; carries the status that was written for it.
    Failed(&'static str),
}

/// Tracks sub-operation outcomes across one transition so the final permit
/// status reflects the most recent failure even when a later sub-operation
/// succeeded and wrote its own status.
#[derive(Debug, Default)]
struct Sequence {
    last_failure: Option<&'static str>,
    failure_overwritten: bool,
}

impl Sequence {
    fn record(&mut self, result: StepResult, wrote_status: bool) {
        match result {
            StepResult::Failed(failure_status) => {
                self.last_failure = Some(failure_status);
                self.failure_overwritten = false;
            }
            StepResult::Done if wrote_status && self.last_failure.is_some() => {
                self.failure_overwritten = true;
            }
            _ => {}
        }
    }

    fn no_failure(&self) -> bool {
        self.last_failure.is_none()
    }
}

/// A driver apply/destroy failure, normalised for reporting.
struct OpFailure {
    error_type: &'static str,
    message: String,
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Routes permit events to provisioning, scaling and destruction of the
/// per-stage workspace stacks, upholding the pipeline's ordering and
/// failure semantics.
///
/// Handling is serialized per permit via a keyed mutex; different permits
/// may be processed concurrently.
pub struct LifecycleEngine {
    stack: StackConfig,
    operation_timeout: Duration,
    store: Arc<dyn StateStore>,
    driver: Arc<dyn StackDriver>,
    audit: AuditPublisher,
    failures: FailurePublisher,
    locks: PermitLocks,
}

impl LifecycleEngine {
    pub fn new(
        stack: StackConfig,
        operation_timeout: Duration,
        store: Arc<dyn StateStore>,
        driver: Arc<dyn StackDriver>,
        audit: AuditPublisher,
        failures: FailurePublisher,
    ) -> Self {
        LifecycleEngine {
            stack,
            operation_timeout,
            store,
            driver,
            audit,
            failures,
            locks: PermitLocks::new(),
        }
    }

    /// Handle one permit event to completion.
    pub async fn handle_event(&self, event: PermitEvent) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(&event.permit_id).await;
        info!(
            event_type = %event.event_type,
            permit_id = %event.permit_id,
            "handling permit event"
        );
        match event.event_type {
            EventType::IngressInitiated => {
                self.provision(&event, Stage::Ingress).await?;
            }
            EventType::StatusUpdated => match event.status {
                Some(new_status) => self.transition(&event, new_status).await?,
                None => warn!(
                    permit_id = %event.permit_id,
                    "status update without a recognised status; dropped"
                ),
            },
            EventType::StopRequested => self.stop(&event.permit_id).await?,
            EventType::StartRequested => self.start(&event.permit_id).await?,
            EventType::Deleted => self.destroy_all(&event.permit_id).await?,
        }
        Ok(())
    }

    // ── Status transitions ────────────────────────────────────────────────────

    async fn transition(
        &self,
        event: &PermitEvent,
        new_status: PermitStatus,
    ) -> Result<(), EngineError> {
        let permit_id = &event.permit_id;
        let mut seq = Sequence::default();

        match new_status {
            PermitStatus::AwaitingIngress => {
                // Ingress is provisioned by `permit.ingress.initiated` only;
                // this status is informational.
                info!(permit_id = %permit_id, "awaiting ingress; no action taken");
            }
            PermitStatus::DataPreparationPending => {
                let destroyed = self.destroy(permit_id, Stage::Ingress).await?;
                seq.record(destroyed, false);
                let provisioned = self.provision(event, Stage::Preprocess).await?;
                seq.record(provisioned, provisioned == StepResult::Done);
            }
            PermitStatus::DataPreparationReviewPending => {
                let scaled = self.scale(permit_id, Stage::Preprocess, 0).await?;
                seq.record(scaled, false);
                let provisioned = self.provision(event, Stage::Review).await?;
                seq.record(provisioned, provisioned == StepResult::Done);
            }
            PermitStatus::DataPreparationRework => {
                let destroyed = self.destroy(permit_id, Stage::Review).await?;
                seq.record(destroyed, false);
                let scaled = self.scale(permit_id, Stage::Preprocess, 1).await?;
                seq.record(scaled, false);
                if seq.no_failure() {
                    self.store
                        .set_status(permit_id, Stage::Preprocess.status_label())
                        .await?;
                }
            }
            PermitStatus::WorkspaceSetupPending => {
                let destroyed = self.destroy(permit_id, Stage::Review).await?;
                seq.record(destroyed, false);
                let destroyed = self.destroy(permit_id, Stage::Preprocess).await?;
                seq.record(destroyed, false);
                let provisioned = self.provision(event, Stage::Setup).await?;
                seq.record(provisioned, provisioned == StepResult::Done);
            }
            PermitStatus::WorkspaceSetupReviewPending => {
                let scaled = self.scale(permit_id, Stage::Setup, 0).await?;
                seq.record(scaled, false);
                let provisioned = self.provision(event, Stage::SetupReview).await?;
                seq.record(provisioned, provisioned == StepResult::Done);
            }
            PermitStatus::WorkspaceSetupRework => {
                let destroyed = self.destroy(permit_id, Stage::SetupReview).await?;
                seq.record(destroyed, false);
                let scaled = self.scale(permit_id, Stage::Setup, 1).await?;
                seq.record(scaled, false);
                if seq.no_failure() {
                    self.store
                        .set_status(permit_id, Stage::Setup.status_label())
                        .await?;
                }
            }
            PermitStatus::AnalysisActive => {
                let destroyed = self.destroy(permit_id, Stage::SetupReview).await?;
                seq.record(destroyed, false);
                let provisioned = self.provision(event, Stage::Analysis).await?;
                seq.record(provisioned, provisioned == StepResult::Done);
            }
            PermitStatus::Archived => {
                let scaled = self.scale(permit_id, Stage::Analysis, 0).await?;
                seq.record(scaled, false);
                if seq.no_failure() {
                    self.store.set_status(permit_id, status::ARCHIVED).await?;
                }
            }
        }

        // A later success must not leave the permit looking healthy when a
        // sub-operation failed: restore the most recent failure status.
        if let Some(failure_status) = seq.last_failure {
            if seq.failure_overwritten {
                self.store.set_status(permit_id, failure_status).await?;
            }
        }
        Ok(())
    }

    // ── Provision ─────────────────────────────────────────────────────────────

    async fn provision(&self, event: &PermitEvent, stage: Stage) -> Result<StepResult, EngineError> {
        let permit_id = &event.permit_id;

        let mut plan = match build_plan(&self.stack, event, stage) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(
                    permit_id = %permit_id,
                    stage = %stage,
                    error = %err,
                    "workspace plan build failed"
                );
                self.store
                    .set_status(permit_id, status::PROVISIONING_FAILED)
                    .await?;
                self.failures
                    .provisioning_failed(FailureReport {
                        permit_id: permit_id.clone(),
                        action: "provision".into(),
                        status: status::PROVISIONING_FAILED.into(),
                        workspace_type: Some(stage.as_str().into()),
                        stack_name: None,
                        error_message: err.to_string(),
                        error_type: "invalid_input".into(),
                        details: Some(details([("stage", json!("plan_build"))])),
                    })
                    .await;
                self.audit
                    .publish(
                        permit_id,
                        "provision",
                        AuditOutcome::Failure,
                        details([
                            ("stage", json!("plan_build")),
                            ("workspaceType", json!(stage.as_str())),
                            ("error", json!(err.to_string())),
                        ]),
                    )
                    .await;
                return Ok(StepResult::Failed(status::PROVISIONING_FAILED));
            }
        };

        info!(
            permit_id = %permit_id,
            stage = %stage,
            stack = %plan.stack_name,
            "applying workspace plan"
        );
        match self.apply_plan(&plan).await {
            Ok(outputs) => {
                plan.exports = outputs;
                if let Some(connection) = plan.connection_info.clone() {
                    self.store.set_connection(permit_id, &connection).await?;
                }
                self.store.set_plan(permit_id, stage, &plan).await?;
                self.store
                    .set_status(permit_id, stage.status_label())
                    .await?;
                self.audit
                    .publish(
                        permit_id,
                        "provision",
                        AuditOutcome::Success,
                        details([
                            ("workspaceType", json!(stage.as_str())),
                            ("stackName", json!(plan.stack_name)),
                        ]),
                    )
                    .await;
                Ok(StepResult::Done)
            }
            Err(failure) => {
                warn!(
                    permit_id = %permit_id,
                    stack = %plan.stack_name,
                    error = %failure.message,
                    "workspace provisioning failed"
                );
                self.store
                    .set_status(permit_id, status::PROVISIONING_FAILED)
                    .await?;
                self.failures
                    .provisioning_failed(FailureReport {
                        permit_id: permit_id.clone(),
                        action: "provision".into(),
                        status: status::PROVISIONING_FAILED.into(),
                        workspace_type: Some(stage.as_str().into()),
                        stack_name: Some(plan.stack_name.clone()),
                        error_message: failure.message.clone(),
                        error_type: failure.error_type.into(),
                        details: None,
                    })
                    .await;
                self.audit
                    .publish(
                        permit_id,
                        "provision",
                        AuditOutcome::Failure,
                        details([
                            ("workspaceType", json!(stage.as_str())),
                            ("stackName", json!(plan.stack_name)),
                            ("error", json!(failure.message)),
                        ]),
                    )
                    .await;
                Ok(StepResult::Failed(status::PROVISIONING_FAILED))
            }
        }
    }

    // ── Scale ─────────────────────────────────────────────────────────────────

    /// Replay the stored plan with a new replica count. At zero replicas
    /// the network profile flips to STOPPED; scaling back up restores the
    /// stage's natural profile.
    async fn scale(
        &self,
        permit_id: &str,
        stage: Stage,
        replicas: u32,
    ) -> Result<StepResult, EngineError> {
        let Some(mut plan) = self.store.get_plan(permit_id, stage).await? else {
            warn!(
                permit_id = %permit_id,
                stage = %stage,
                "no stored plan for workspace; scaling skipped"
            );
            return Ok(StepResult::Skipped);
        };

        plan.stack_name = stack_name(&self.stack, permit_id, stage);
        plan.workspace.replicas = replicas;
        plan.network.profile = if replicas == 0 {
            NetworkProfile::Stopped
        } else {
            NetworkProfile::from(stage)
        };

        info!(stack = %plan.stack_name, replicas, "scaling workspace stack");
        match self.apply_plan(&plan).await {
            Ok(outputs) => {
                plan.exports = outputs;
                self.store.set_plan(permit_id, stage, &plan).await?;
                self.audit
                    .publish(
                        permit_id,
                        "scale",
                        AuditOutcome::Success,
                        details([
                            ("workspaceType", json!(stage.as_str())),
                            ("stackName", json!(plan.stack_name)),
                            ("replicas", json!(replicas)),
                        ]),
                    )
                    .await;
                Ok(StepResult::Done)
            }
            Err(failure) => {
                warn!(
                    permit_id = %permit_id,
                    stack = %plan.stack_name,
                    error = %failure.message,
                    "workspace scaling failed"
                );
                self.store
                    .set_status(permit_id, status::PROVISIONING_FAILED)
                    .await?;
                self.failures
                    .provisioning_failed(FailureReport {
                        permit_id: permit_id.to_string(),
                        action: "scale".into(),
                        status: status::PROVISIONING_FAILED.into(),
                        workspace_type: Some(stage.as_str().into()),
                        stack_name: Some(plan.stack_name.clone()),
                        error_message: failure.message.clone(),
                        error_type: failure.error_type.into(),
                        details: Some(details([("replicas", json!(replicas))])),
                    })
                    .await;
                self.audit
                    .publish(
                        permit_id,
                        "scale",
                        AuditOutcome::Failure,
                        details([
                            ("workspaceType", json!(stage.as_str())),
                            ("stackName", json!(plan.stack_name)),
                            ("replicas", json!(replicas)),
                            ("error", json!(failure.message)),
                        ]),
                    )
                    .await;
                Ok(StepResult::Failed(status::PROVISIONING_FAILED))
            }
        }
    }

    // ── Destroy ───────────────────────────────────────────────────────────────

    /// Destroy the stage's stack. A stack the platform does not know is a
    /// success, since destroy must be safely re-runnable. The stored plan
    /// is deleted only after the driver succeeds, so a failed destroy can
    /// be retried against the same resources.
    async fn destroy(&self, permit_id: &str, stage: Stage) -> Result<StepResult, EngineError> {
        let stack = stack_name(&self.stack, permit_id, stage);
        info!(stack = %stack, "destroying workspace stack");

        let result = match tokio::time::timeout(self.operation_timeout, self.driver.destroy(&stack))
            .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(OpFailure {
                error_type: "driver_failure",
                message: err.to_string(),
            }),
            Err(_) => Err(OpFailure {
                error_type: "timeout",
                message: format!(
                    "destroy of {} timed out after {:?}",
                    stack, self.operation_timeout
                ),
            }),
        };

        match result {
            Ok(outcome) => {
                if outcome == DestroyOutcome::NotFound {
                    debug!(stack = %stack, "stack not found; nothing to destroy");
                }
                self.store.delete_plan(permit_id, stage).await?;
                self.audit
                    .publish(
                        permit_id,
                        "destroy",
                        AuditOutcome::Success,
                        details([
                            ("workspaceType", json!(stage.as_str())),
                            ("stackName", json!(stack)),
                        ]),
                    )
                    .await;
                Ok(StepResult::Done)
            }
            Err(failure) => {
                warn!(stack = %stack, error = %failure.message, "workspace destroy failed");
                self.store
                    .set_status(permit_id, status::DESTROY_FAILED)
                    .await?;
                self.failures
                    .destroy_failed(FailureReport {
                        permit_id: permit_id.to_string(),
                        action: "destroy".into(),
                        status: status::DESTROY_FAILED.into(),
                        workspace_type: Some(stage.as_str().into()),
                        stack_name: Some(stack.clone()),
                        error_message: failure.message.clone(),
                        error_type: failure.error_type.into(),
                        details: None,
                    })
                    .await;
                self.audit
                    .publish(
                        permit_id,
                        "destroy",
                        AuditOutcome::Failure,
                        details([
                            ("workspaceType", json!(stage.as_str())),
                            ("stackName", json!(stack)),
                            ("error", json!(failure.message)),
                        ]),
                    )
                    .await;
                Ok(StepResult::Failed(status::DESTROY_FAILED))
            }
        }
    }

    // ── Stop / start / delete ─────────────────────────────────────────────────

    async fn stop(&self, permit_id: &str) -> Result<(), EngineError> {
        info!(permit_id = %permit_id, "stop requested for workspace");
        let result = self.scale(permit_id, Stage::Analysis, 0).await?;
        let outcome = match result {
            StepResult::Done => {
                self.store.set_status(permit_id, status::STOPPED).await?;
                AuditOutcome::Success
            }
            _ => AuditOutcome::Failure,
        };
        self.audit
            .publish(permit_id, "stop", outcome, Map::new())
            .await;
        Ok(())
    }

    async fn start(&self, permit_id: &str) -> Result<(), EngineError> {
        info!(permit_id = %permit_id, "start requested for workspace");
        let result = self.scale(permit_id, Stage::Analysis, 1).await?;
        let outcome = match result {
            StepResult::Done => {
                self.store.set_status(permit_id, status::RUNNING).await?;
                AuditOutcome::Success
            }
            _ => AuditOutcome::Failure,
        };
        self.audit
            .publish(permit_id, "start", outcome, Map::new())
            .await;
        Ok(())
    }

    /// Destroy every stage in enumeration order; clear all stored state
    /// only when every destroy succeeded, so a partial failure keeps
    /// enough state for a retry.
    async fn destroy_all(&self, permit_id: &str) -> Result<(), EngineError> {
        info!(permit_id = %permit_id, "destroying all workspace resources");
        let mut all_ok = true;
        for stage in Stage::ALL {
            let result = self.destroy(permit_id, stage).await?;
            all_ok &= !matches!(result, StepResult::Failed(_));
        }
        if all_ok {
            self.store.clear_permit(permit_id).await?;
            info!(permit_id = %permit_id, "permit state cleared");
        } else {
            warn!(
                permit_id = %permit_id,
                "some destroys failed; permit state retained for retry"
            );
        }
        Ok(())
    }

    // ── Driver plumbing ───────────────────────────────────────────────────────

    async fn apply_plan(&self, plan: &WorkspacePlan) -> Result<ApplyOutputs, OpFailure> {
        if self.driver.disabled() {
            warn!(stack = %plan.stack_name, "stack driver disabled; execution skipped");
        }
        match tokio::time::timeout(self.operation_timeout, self.driver.apply(plan)).await {
            Ok(Ok(outputs)) => Ok(outputs),
            Ok(Err(err)) => Err(OpFailure {
                error_type: "driver_failure",
                message: err.to_string(),
            }),
            Err(_) => Err(OpFailure {
                error_type: "timeout",
                message: format!(
                    "apply of {} timed out after {:?}",
                    plan.stack_name, self.operation_timeout
                ),
            }),
        }
    }
}

fn details(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[async_trait]
impl EventHandler for LifecycleEngine {
    async fn handle(&self, event: PermitEvent) -> anyhow::Result<()> {
        self.handle_event(event).await.map_err(Into::into)
    }
}
