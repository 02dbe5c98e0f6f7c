//! Rollout controller: step-driven progressive delivery
//!
//! Drives `Idle → Progressing → Analyzing → {Progressing, Succeeded,
//! Failed, RolledBack}`. Weight transitions go through the injected traffic
//! provider, analysis through the injected engine, and every phase change
//! is persisted before the next side effect so a crashed controller
//! resumes mid-rollout. Terminal phases admit no further mutations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::analysis::AnalysisEngine;
use crate::controller::workloads::ensure_workloads;
use crate::crd::{Rollout, RolloutPhase, RolloutStatus, RolloutStep, StrategyType};
use crate::error::{Error, Result};
use crate::traffic::{TrafficProvider, TrafficTarget};
use crate::FIELD_MANAGER;

/// Persists rollout status. The controller writes through the status
/// subresource; tests substitute a recorder.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write(&self, rollout: &Rollout, status: &RolloutStatus) -> Result<()>;
}

pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write(&self, rollout: &Rollout, status: &RolloutStatus) -> Result<()> {
        let namespace = rollout.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Rollout> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &rollout.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

pub struct RolloutContext {
    pub client: Client,
    pub traffic: Arc<dyn TrafficProvider>,
    pub analysis: Arc<dyn AnalysisEngine>,
    pub status: Arc<dyn StatusWriter>,
}

/// Start the rollout controller.
pub async fn run_rollout_controller(ctx: Arc<RolloutContext>) -> Result<()> {
    let client = ctx.client.clone();
    let rollouts: Api<Rollout> = Api::all(client.clone());

    info!("Starting rollout controller");

    Controller::new(rollouts, Config::default())
        .owns::<Deployment>(Api::all(client.clone()), Config::default())
        .owns::<Service>(Api::all(client), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(_) => {}
                Err(e) => error!("Rollout reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// What the current step index asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepPlan {
    /// All steps done (or Blue-Green): switch everything to the canary.
    Promote,
    /// Run step `index`.
    Run { index: usize },
}

/// A step index at or past the end of the list triggers promotion.
pub fn plan_step(steps: &[RolloutStep], step_index: i32) -> StepPlan {
    let index = step_index.max(0) as usize;
    if index >= steps.len() {
        StepPlan::Promote
    } else {
        StepPlan::Run { index }
    }
}

fn traffic_target<'a>(rollout: &'a Rollout, namespace: &'a str) -> TrafficTarget<'a> {
    TrafficTarget {
        namespace,
        host: &rollout.spec.traffic.host,
        stable_service: &rollout.spec.traffic.stable_service,
        canary_service: &rollout.spec.traffic.canary_service,
        port: rollout.spec.target_ref.port,
    }
}

fn analysis_labels(rollout: &Rollout, namespace: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), rollout.spec.target_ref.name.clone());
    labels.insert(
        "deployment".to_string(),
        rollout.track_deployment_name(crate::controller::workloads::TRACK_CANARY),
    );
    labels.insert("namespace".to_string(), namespace.to_string());
    labels
}

/// One convergence pass over the rollout strategy. Assumes workloads exist
/// and the phase is non-terminal. Persists through `status_writer` at each
/// transition; returns the requeue delay, if any.
pub async fn advance_rollout(
    rollout: &Rollout,
    traffic: &dyn TrafficProvider,
    analysis: &dyn AnalysisEngine,
    status_writer: &dyn StatusWriter,
) -> Result<Option<Duration>> {
    let namespace = rollout.namespace().unwrap_or_else(|| "default".to_string());
    let target = traffic_target(rollout, &namespace);
    let mut status = rollout.status.clone().unwrap_or_default();

    if status.phase.is_none() {
        status.phase = Some(RolloutPhase::Progressing);
        status.step_index = 0;
        status_writer.write(rollout, &status).await?;
    }

    if rollout.spec.strategy_type() == StrategyType::BlueGreen {
        info!(host = %target.host, "blue-green: promoting canary to 100%");
        traffic.promote(&target).await?;
        status.phase = Some(RolloutPhase::Succeeded);
        status_writer.write(rollout, &status).await?;
        return Ok(None);
    }

    let steps = &rollout.spec.strategy.steps;
    match plan_step(steps, status.step_index) {
        StepPlan::Promote => {
            info!(host = %target.host, "canary finished all steps, promoting");
            traffic.promote(&target).await?;
            status.phase = Some(RolloutPhase::Succeeded);
            status_writer.write(rollout, &status).await?;
            Ok(None)
        }
        StepPlan::Run { index } => {
            let step = &steps[index];
            info!(index, weight = step.weight, hold = step.hold_seconds, "canary step");

            traffic.set_weight(&target, step.weight).await?;
            status.phase = Some(RolloutPhase::Analyzing);
            status_writer.write(rollout, &status).await?;

            let labels = analysis_labels(rollout, &namespace);
            let outcome = analysis.evaluate(&rollout.spec.analysis, &labels).await?;
            info!(passed = outcome.passed, reason = %outcome.reason, "analysis result");

            if outcome.passed {
                status.step_index += 1;
                status.phase = Some(RolloutPhase::Progressing);
                status_writer.write(rollout, &status).await?;
                Ok(Some(Duration::from_secs(step.hold_seconds.max(0) as u64)))
            } else {
                if rollout.spec.rollback_on_failure() {
                    if let Err(e) = traffic.reset(&target).await {
                        warn!("traffic reset failed during rollback: {e}");
                    }
                    status.phase = Some(RolloutPhase::RolledBack);
                } else {
                    status.phase = Some(RolloutPhase::Failed);
                }
                status_writer.write(rollout, &status).await?;
                Ok(None)
            }
        }
    }
}

/// Terminal phases are sticky: no mutations, not even workload
/// convergence.
pub fn is_terminal(rollout: &Rollout) -> bool {
    rollout
        .status
        .as_ref()
        .and_then(|s| s.phase)
        .map(|p| p.is_terminal())
        .unwrap_or(false)
}

#[instrument(skip(ctx, rollout), fields(name = %rollout.name_any(), namespace = rollout.namespace()))]
async fn reconcile(rollout: Arc<Rollout>, ctx: Arc<RolloutContext>) -> Result<Action> {
    if is_terminal(&rollout) {
        return Ok(Action::await_change());
    }

    ensure_workloads(&ctx.client, &rollout).await?;

    let requeue = advance_rollout(
        &rollout,
        ctx.traffic.as_ref(),
        ctx.analysis.as_ref(),
        ctx.status.as_ref(),
    )
    .await?;

    Ok(match requeue {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

fn error_policy(rollout: Arc<Rollout>, error: &Error, _ctx: Arc<RolloutContext>) -> Action {
    error!("Rollout error for {}: {:?}", rollout.name_any(), error);

    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}
