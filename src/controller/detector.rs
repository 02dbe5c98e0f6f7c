//! Pod detector: opens remediation cases for anomalous pods
//!
//! Watches every pod; when one is stuck in an image-pull or crash loop it
//! packages evidence and upserts the per-pod Remediation record. Repeated
//! observations refresh the evidence; the record name is deterministic so
//! event multiplicity never yields duplicate cases.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controller::conditions::{set_condition, CONDITION_STATUS_TRUE};
use crate::controller::workloads::controller_reference;
use crate::crd::{Remediation, RemediationSpec, TargetObjectRef, COND_DIAGNOSING};
use crate::error::{Error, Result};
use crate::evidence;
use crate::FIELD_MANAGER;

pub struct DetectorContext {
    pub client: Client,
}

/// Start the pod detector controller.
pub async fn run_detector(ctx: Arc<DetectorContext>) -> Result<()> {
    let pods: Api<Pod> = Api::all(ctx.client.clone());

    info!("Starting pod detector controller");

    Controller::new(pods, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(_) => {}
                Err(e) => error!("Detector reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(ctx, pod), fields(name = %pod.name_any(), namespace = pod.namespace()))]
async fn reconcile(pod: Arc<Pod>, ctx: Arc<DetectorContext>) -> Result<Action> {
    if !evidence::is_anomalous(&pod) {
        return Ok(Action::await_change());
    }

    let client = &ctx.client;
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let pod_name = pod.name_any();

    let evidence_bytes = match evidence::collect(client, &pod).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("evidence collection failed: {e}");
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
    };
    let evidence_json: serde_json::Value = serde_json::from_slice(&evidence_bytes)?;

    let api: Api<Remediation> = Api::namespaced(client.clone(), &namespace);
    let rem_name = Remediation::name_for_pod(&pod_name);

    // Idempotent upsert keyed by pod identity.
    let rem = match api.get_opt(&rem_name).await? {
        None => {
            let mut rem = Remediation::new(
                &rem_name,
                RemediationSpec {
                    target_ref: TargetObjectRef {
                        api_version: "v1".to_string(),
                        kind: "Pod".to_string(),
                        namespace: namespace.clone(),
                        name: pod_name.clone(),
                    },
                    evidence: Some(evidence_json),
                    approved: false,
                },
            );
            rem.metadata.namespace = Some(namespace.clone());
            rem.metadata.owner_references = Some(vec![controller_reference(pod.as_ref())]);

            info!(remediation = %rem_name, "opening remediation case");
            api.create(&PostParams::default(), &rem).await?
        }
        Some(mut rem) => {
            rem.spec.evidence = Some(evidence_json);
            api.replace(&rem_name, &PostParams::default(), &rem).await?
        }
    };

    let mut conditions = rem
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut conditions,
        COND_DIAGNOSING,
        CONDITION_STATUS_TRUE,
        "CaseOpened",
        "evidence collected, awaiting proposal",
    );

    let patch = serde_json::json!({
        "status": {
            "conditions": conditions,
            "lastUpdateTime": chrono::Utc::now().to_rfc3339(),
        }
    });
    api.patch_status(
        &rem_name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!(remediation = %rem_name, "remediation opened/updated");
    Ok(Action::await_change())
}

fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<DetectorContext>) -> Action {
    error!("Detector error for {}: {:?}", pod.name_any(), error);

    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}
