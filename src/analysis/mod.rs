//! Analysis engines for rollout gating
//!
//! An engine decides whether the candidate revision is healthy enough to
//! advance. The reference engine checks Deployment readiness; richer
//! engines (metric thresholds, streak counting over `AnalysisSpec`) attach
//! to the same trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use tracing::debug;

use crate::crd::AnalysisSpec;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisOutcome {
    pub passed: bool,
    pub reason: String,
}

impl AnalysisOutcome {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

/// Decide whether a candidate revision may advance.
///
/// Missing inputs or unreachable targets yield `passed = false` with a
/// descriptive reason; engines only error on unexpected conditions.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn evaluate(
        &self,
        spec: &AnalysisSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<AnalysisOutcome>;
}

/// Readiness engine: passed iff the target Deployment reports all desired
/// replicas ready and desires at least one.
pub struct ReadyEngine {
    client: Client,
    deployment: Option<String>,
    namespace: Option<String>,
}

impl ReadyEngine {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            deployment: None,
            namespace: None,
        }
    }

    /// Fixed fallback target for engines not driven through labels.
    pub fn with_target(client: Client, deployment: String, namespace: String) -> Self {
        Self {
            client,
            deployment: Some(deployment),
            namespace: Some(namespace),
        }
    }
}

/// Resolve an input from the check labels, falling back to the engine
/// default.
fn resolve_input(
    labels: &BTreeMap<String, String>,
    key: &str,
    fallback: &Option<String>,
) -> Option<String> {
    labels
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| fallback.clone())
}

/// Pure readiness verdict from observed counts.
fn readiness_outcome(ready: i32, desired: i32) -> AnalysisOutcome {
    if ready == desired && desired > 0 {
        AnalysisOutcome::pass("deployment ready")
    } else {
        AnalysisOutcome::fail("waiting for readiness")
    }
}

#[async_trait]
impl AnalysisEngine for ReadyEngine {
    async fn evaluate(
        &self,
        _spec: &AnalysisSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<AnalysisOutcome> {
        let Some(deployment) = resolve_input(labels, "deployment", &self.deployment) else {
            return Ok(AnalysisOutcome::fail(
                "missing deployment for readiness check",
            ));
        };
        let Some(namespace) = resolve_input(labels, "namespace", &self.namespace) else {
            return Ok(AnalysisOutcome::fail(
                "missing namespace for readiness check",
            ));
        };

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let dep = match api.get(&deployment).await {
            Ok(dep) => dep,
            Err(e) => {
                debug!(%deployment, %namespace, error = %e, "readiness target not readable");
                return Ok(AnalysisOutcome::fail(e.to_string()));
            }
        };

        let ready = dep
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let desired = dep.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);

        debug!(%deployment, %namespace, ready, desired, "readiness evaluated");
        Ok(readiness_outcome(ready, desired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_outcome() {
        assert!(readiness_outcome(2, 2).passed);
        assert!(!readiness_outcome(1, 2).passed);
        // Zero desired replicas never passes.
        assert!(!readiness_outcome(0, 0).passed);
        assert_eq!(readiness_outcome(0, 0).reason, "waiting for readiness");
    }

    #[test]
    fn test_resolve_input_prefers_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("deployment".to_string(), "web-canary".to_string());

        let fallback = Some("web-stable".to_string());
        assert_eq!(
            resolve_input(&labels, "deployment", &fallback).as_deref(),
            Some("web-canary")
        );
    }

    #[test]
    fn test_resolve_input_falls_back_on_missing_or_empty() {
        let mut labels = BTreeMap::new();
        labels.insert("deployment".to_string(), String::new());

        let fallback = Some("web-stable".to_string());
        assert_eq!(
            resolve_input(&labels, "deployment", &fallback).as_deref(),
            Some("web-stable")
        );
        assert_eq!(resolve_input(&labels, "namespace", &None), None);
    }
}
