//! Remediation Custom Resource Definition
//!
//! A Remediation record tracks one incident from detection through LLM
//! proposal, human review and server-side apply. All workflow state lives
//! on the record: the controllers may crash and resume at any point.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{arbitrary_object, Condition};

/// Condition types driving the remediation state machine.
pub const COND_DIAGNOSING: &str = "Diagnosing";
pub const COND_PROPOSED: &str = "Proposed";
pub const COND_READY_FOR_REVIEW: &str = "ReadyForReview";
pub const COND_APPLIED: &str = "Applied";
pub const COND_FAILED: &str = "Failed";

/// Reference to the object suspected of being unhealthy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "aiops.example.com",
    version = "v1alpha1",
    kind = "Remediation",
    namespaced,
    status = "RemediationStatus",
    shortname = "rem",
    printcolumn = r#"{"name":"Proposed","type":"string","jsonPath":".status.conditions[?(@.type=='Proposed')].status"}"#,
    printcolumn = r#"{"name":"ReadyForReview","type":"string","jsonPath":".status.conditions[?(@.type=='ReadyForReview')].status"}"#,
    printcolumn = r#"{"name":"Applied","type":"string","jsonPath":".status.conditions[?(@.type=='Applied')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationSpec {
    pub target_ref: TargetObjectRef,

    /// Evidence packaged by the detector (pod state, events, previous
    /// logs). Schemaless; the API server preserves it untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "arbitrary_object")]
    pub evidence: Option<serde_json::Value>,

    /// Approval gate. The executor only applies the proposed patch after a
    /// human flips this to true.
    #[serde(default)]
    pub approved: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStatus {
    /// The full LLM proposal, stored verbatim for review and audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "arbitrary_object")]
    pub proposed_patch: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl Remediation {
    /// Deterministic record name for a pod incident. One remediation per
    /// pod identity, regardless of how often the detector fires.
    pub fn name_for_pod(pod_name: &str) -> String {
        format!("pod-{pod_name}")
    }
}

impl RemediationStatus {
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    }

    pub fn has_proposed_patch(&self) -> bool {
        self.proposed_patch
            .as_ref()
            .map(|p| !p.is_null())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_for_pod_is_deterministic() {
        assert_eq!(Remediation::name_for_pod("app-a"), "pod-app-a");
        assert_eq!(
            Remediation::name_for_pod("app-a"),
            Remediation::name_for_pod("app-a")
        );
    }

    #[test]
    fn test_is_condition_true() {
        let status = RemediationStatus {
            conditions: vec![
                Condition::new(COND_PROPOSED, true, "OK", "PatchProposed"),
                Condition::new(COND_APPLIED, false, "Pending", "awaiting approval"),
            ],
            ..Default::default()
        };

        assert!(status.is_condition_true(COND_PROPOSED));
        assert!(!status.is_condition_true(COND_APPLIED));
        assert!(!status.is_condition_true(COND_FAILED));
    }

    #[test]
    fn test_has_proposed_patch() {
        let mut status = RemediationStatus::default();
        assert!(!status.has_proposed_patch());

        status.proposed_patch = Some(serde_json::json!({"actions": []}));
        assert!(status.has_proposed_patch());
    }

    #[test]
    fn test_evidence_round_trips_unknown_fields() {
        let spec_json = serde_json::json!({
            "targetRef": {
                "apiVersion": "v1",
                "kind": "Pod",
                "namespace": "ns1",
                "name": "app-a"
            },
            "evidence": {
                "pod": {"namespace": "ns1", "name": "app-a"},
                "custom": {"nested": [1, 2, 3]}
            }
        });

        let spec: RemediationSpec = serde_json::from_value(spec_json.clone()).unwrap();
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["evidence"], spec_json["evidence"]);
    }
}
