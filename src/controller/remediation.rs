//! Remediation executor: propose, await approval, apply
//!
//! Drives the per-incident state machine
//! `Diagnosing → Proposed → ReadyForReview → (Approved) → Applied | Failed`.
//! Every transition is persisted on the record's status subresource, so the
//! controller can crash and resume without losing the workflow. A record
//! with `Applied=True` is terminal.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, DynamicObject, Patch, PatchParams},
    client::Client,
    core::{ApiResource, GroupVersionKind},
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use serde_json::{Map, Value};
use tracing::{error, info, instrument};

use crate::controller::conditions::{set_condition, CONDITION_STATUS_TRUE};
use crate::crd::{
    Remediation, RemediationStatus, COND_APPLIED, COND_FAILED, COND_PROPOSED,
    COND_READY_FOR_REVIEW,
};
use crate::error::{Error, Result};
use crate::llm::{validate_proposal, OllamaClient, PatchAction, ProposedPatch, SYSTEM_PROMPT};
use crate::FIELD_MANAGER;

pub struct RemediationContext {
    pub client: Client,
    pub llm: OllamaClient,
}

/// Start the remediation executor controller.
pub async fn run_remediation_controller(ctx: Arc<RemediationContext>) -> Result<()> {
    let remediations: Api<Remediation> = Api::all(ctx.client.clone());

    info!("Starting remediation executor controller");

    Controller::new(remediations, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(_) => {}
                Err(e) => error!("Remediation reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Failure condition reason for a proposal error.
fn proposal_failure_reason(error: &Error) -> &'static str {
    match error {
        Error::PolicyError(_) => "Policy",
        _ => "LLMError",
    }
}

/// Build the server-side-apply fragment for an action:
/// `{apiVersion, kind, metadata: {name, namespace}}` with the action's
/// patch merged on top. Patch keys win; a patch `metadata` merges into the
/// base metadata so the object identity survives.
fn ssa_fragment(action: &PatchAction) -> Value {
    let r = &action.object_ref;
    let mut obj = Map::new();
    obj.insert("apiVersion".to_string(), Value::String(r.api_version.clone()));
    obj.insert("kind".to_string(), Value::String(r.kind.clone()));

    let mut metadata = Map::new();
    metadata.insert("name".to_string(), Value::String(r.name.clone()));
    metadata.insert("namespace".to_string(), Value::String(r.namespace.clone()));

    if let Value::Object(patch) = &action.patch {
        for (key, value) in patch {
            if key == "metadata" {
                if let Value::Object(patch_meta) = value {
                    for (mk, mv) in patch_meta {
                        metadata.insert(mk.clone(), mv.clone());
                    }
                }
            } else {
                obj.insert(key.clone(), value.clone());
            }
        }
    }

    obj.insert("metadata".to_string(), Value::Object(metadata));
    Value::Object(obj)
}

/// Server-side apply of a desired-state fragment, optionally as a dry run.
/// The stable field owner lets successive applies converge; force
/// ownership reclaims contested fields.
async fn server_side_apply(client: &Client, fragment: &Value, dry_run: bool) -> Result<()> {
    let api_version = fragment["apiVersion"].as_str().unwrap_or_default();
    let kind = fragment["kind"].as_str().unwrap_or_default();
    let name = fragment["metadata"]["name"].as_str().unwrap_or_default();
    let namespace = fragment["metadata"]["namespace"].as_str().unwrap_or_default();

    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    let gvk = GroupVersionKind::gvk(group, version, kind);
    let resource = ApiResource::from_gvk(&gvk);

    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &resource);

    let mut params = PatchParams::apply(FIELD_MANAGER).force();
    params.dry_run = dry_run;

    api.patch(name, &params, &Patch::Apply(fragment)).await?;
    Ok(())
}

/// Persist a status mutation through the status subresource, leaving the
/// spec untouched (the detector owns spec writes).
async fn persist_status(
    api: &Api<Remediation>,
    name: &str,
    status: &RemediationStatus,
) -> Result<()> {
    let mut status = status.clone();
    status.last_update_time = Some(chrono::Utc::now().to_rfc3339());

    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[instrument(skip(ctx, rem), fields(name = %rem.name_any(), namespace = rem.namespace()))]
async fn reconcile(rem: Arc<Remediation>, ctx: Arc<RemediationContext>) -> Result<Action> {
    let namespace = rem.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Remediation> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = rem.name_any();

    let mut status = rem.status.clone().unwrap_or_default();

    // Applied is terminal.
    if status.is_condition_true(COND_APPLIED) {
        return Ok(Action::await_change());
    }

    // 1) No proposal yet: ask the LLM.
    if !status.is_condition_true(COND_PROPOSED) {
        let evidence = match &rem.spec.evidence {
            Some(value) => serde_json::to_vec(value)?,
            None => b"{}".to_vec(),
        };

        match ctx.llm.propose(SYSTEM_PROMPT, &evidence).await {
            Err(e) => {
                set_condition(
                    &mut status.conditions,
                    COND_FAILED,
                    CONDITION_STATUS_TRUE,
                    proposal_failure_reason(&e),
                    &e.to_string(),
                );
                persist_status(&api, &name, &status).await?;

                // Transport errors retry on a fixed backoff; schema and
                // policy failures surface on the record and end the loop.
                if e.is_retriable() {
                    return Ok(Action::requeue(Duration::from_secs(20)));
                }
                return Ok(Action::await_change());
            }
            Ok(proposal) => {
                status.proposed_patch = Some(serde_json::to_value(&proposal)?);
                set_condition(
                    &mut status.conditions,
                    COND_PROPOSED,
                    CONDITION_STATUS_TRUE,
                    "OK",
                    "PatchProposed",
                );
                set_condition(
                    &mut status.conditions,
                    COND_READY_FOR_REVIEW,
                    CONDITION_STATUS_TRUE,
                    "OK",
                    "WaitForApproval",
                );
                persist_status(&api, &name, &status).await?;
                info!(remediation = %name, "patch proposed, waiting for approval");
                return Ok(Action::await_change());
            }
        }
    }

    // 2) Proposed and approved: dry-run then live server-side apply.
    if rem.spec.approved {
        if !status.has_proposed_patch() {
            set_condition(
                &mut status.conditions,
                COND_FAILED,
                CONDITION_STATUS_TRUE,
                "NoPatch",
                "empty proposedPatch",
            );
            persist_status(&api, &name, &status).await?;
            return Ok(Action::await_change());
        }

        let proposal: ProposedPatch =
            serde_json::from_value(status.proposed_patch.clone().unwrap_or_default())?;

        // Re-check the gate right before touching the cluster; the stored
        // patch is still untrusted input.
        if let Err(e) = validate_proposal(&proposal) {
            set_condition(
                &mut status.conditions,
                COND_FAILED,
                CONDITION_STATUS_TRUE,
                "Policy",
                &e.to_string(),
            );
            persist_status(&api, &name, &status).await?;
            return Ok(Action::await_change());
        }

        // Only the first action is executed; the rest stay on the record
        // for review.
        let action = &proposal.actions[0];
        let fragment = ssa_fragment(action);

        if let Err(e) = server_side_apply(&ctx.client, &fragment, true).await {
            set_condition(
                &mut status.conditions,
                COND_FAILED,
                CONDITION_STATUS_TRUE,
                "DryRun",
                &e.to_string(),
            );
            persist_status(&api, &name, &status).await?;
            return Ok(Action::requeue(Duration::from_secs(10)));
        }

        if let Err(e) = server_side_apply(&ctx.client, &fragment, false).await {
            set_condition(
                &mut status.conditions,
                COND_FAILED,
                CONDITION_STATUS_TRUE,
                "SSA",
                &e.to_string(),
            );
            persist_status(&api, &name, &status).await?;
            return Ok(Action::requeue(Duration::from_secs(10)));
        }

        set_condition(
            &mut status.conditions,
            COND_APPLIED,
            CONDITION_STATUS_TRUE,
            "OK",
            "PatchApplied",
        );
        persist_status(&api, &name, &status).await?;
        info!(remediation = %name, target = %action.object_ref.name, "patch applied");
    }

    Ok(Action::await_change())
}

fn error_policy(rem: Arc<Remediation>, error: &Error, _ctx: Arc<RemediationContext>) -> Action {
    error!("Remediation error for {}: {:?}", rem.name_any(), error);

    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PatchTarget;
    use serde_json::json;

    fn action(patch: Value) -> PatchAction {
        PatchAction {
            kind: "Patch".to_string(),
            strategy: "ServerSideApply".to_string(),
            object_ref: PatchTarget {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                namespace: "ns1".to_string(),
                name: "app-a".to_string(),
            },
            patch,
        }
    }

    #[test]
    fn test_ssa_fragment_carries_identity() {
        let fragment = ssa_fragment(&action(json!({
            "spec": {"template": {"spec": {"containers": [
                {"name": "app", "image": "nginx:1.25.3"}
            ]}}}
        })));

        assert_eq!(fragment["apiVersion"], "apps/v1");
        assert_eq!(fragment["kind"], "Deployment");
        assert_eq!(fragment["metadata"]["name"], "app-a");
        assert_eq!(fragment["metadata"]["namespace"], "ns1");
        assert_eq!(
            fragment["spec"]["template"]["spec"]["containers"][0]["image"],
            "nginx:1.25.3"
        );
    }

    #[test]
    fn test_ssa_fragment_merges_patch_metadata() {
        let fragment = ssa_fragment(&action(json!({
            "metadata": {"labels": {"remediated": "true"}}
        })));

        // Patch metadata merges in; name and namespace survive.
        assert_eq!(fragment["metadata"]["name"], "app-a");
        assert_eq!(fragment["metadata"]["namespace"], "ns1");
        assert_eq!(fragment["metadata"]["labels"]["remediated"], "true");
    }

    #[test]
    fn test_ssa_fragment_is_deterministic() {
        let a = ssa_fragment(&action(json!({"spec": {"replicas": 3}})));
        let b = ssa_fragment(&action(json!({"spec": {"replicas": 3}})));
        assert_eq!(a, b);
    }

    #[test]
    fn test_proposal_failure_reasons() {
        assert_eq!(
            proposal_failure_reason(&Error::PolicyError("latest".to_string())),
            "Policy"
        );
        assert_eq!(
            proposal_failure_reason(&Error::LlmResponseError("bad json".to_string())),
            "LLMError"
        );
    }
}
