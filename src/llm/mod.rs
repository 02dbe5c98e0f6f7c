//! LLM proposer
//!
//! Sends packaged evidence to an Ollama-compatible chat endpoint and turns
//! the structured response into a remediation proposal. The response is
//! treated as adversarial JSON: it must match the proposal schema and pass
//! the mutation policy before anything touches the cluster.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// System prompt sent with every proposal request. States the same
/// constraints the policy gate enforces.
pub const SYSTEM_PROMPT: &str = "You are a Kubernetes SRE assistant. The user message is the \
Evidence (JSON) of a failing pod. Propose the minimal patch that fixes it, as strict JSON \
matching the provided schema. Mutable image tags such as :latest are strictly forbidden; if \
you change an image, pin an immutable numeric version. Only the following mutations are \
allowed: container image tag, imagePullSecrets, probes, resource requests/limits.";

/// Container keys the policy allows a proposal to set.
const ALLOWED_CONTAINER_KEYS: [&str; 6] = [
    "name",
    "image",
    "resources",
    "livenessProbe",
    "readinessProbe",
    "startupProbe",
];

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchTarget {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchAction {
    pub kind: String,
    pub strategy: String,
    pub object_ref: PatchTarget,
    pub patch: Value,
}

/// The structured proposal the LLM must return.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProposedPatch {
    pub actions: Vec<PatchAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_plan: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// JSON schema for Ollama structured outputs; the endpoint constrains
/// generation to it, and `validate_proposal` re-checks on our side.
pub fn proposal_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "actions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "kind": {"type": "string", "enum": ["Patch"]},
                        "strategy": {"type": "string", "enum": ["ServerSideApply"]},
                        "objectRef": {
                            "type": "object",
                            "properties": {
                                "apiVersion": {"type": "string"},
                                "kind": {"type": "string"},
                                "namespace": {"type": "string"},
                                "name": {"type": "string"}
                            },
                            "required": ["apiVersion", "kind", "namespace", "name"]
                        },
                        "patch": {"type": "object"}
                    },
                    "required": ["kind", "strategy", "objectRef", "patch"]
                }
            },
            "risks": {"type": "array", "items": {"type": "string"}},
            "rollbackPlan": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["actions"]
    })
}

/// Client for an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaClient {
    base_url: String,
    model: String,
    http: reqwest::Client,
    schema: Value,
}

impl OllamaClient {
    /// Proposals can take a while on small hardware; the request timeout is
    /// generous and cancellation rides on the reconcile task.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(500);

    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            http: reqwest::Client::new(),
            schema: proposal_schema(),
        }
    }

    /// Ask the model for a minimal patch. No retry here: the caller's
    /// re-queue is the retry mechanism.
    pub async fn propose(&self, system_prompt: &str, evidence: &[u8]) -> Result<ProposedPatch> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": String::from_utf8_lossy(evidence)},
            ],
            "format": self.schema,
            "stream": false,
        });

        let resp = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(Self::REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let chat: ChatResponse = resp.json().await?;

        let proposal: ProposedPatch = serde_json::from_str(&chat.message.content)
            .map_err(|e| Error::LlmResponseError(format!("non-JSON or schema mismatch: {e}")))?;

        validate_proposal(&proposal)?;
        Ok(proposal)
    }
}

/// Enforce the proposal schema and the mutation policy.
///
/// Runs once when the proposal arrives and again right before the executor
/// applies it, so a hand-edited `proposedPatch` cannot bypass the gate.
pub fn validate_proposal(proposal: &ProposedPatch) -> Result<()> {
    if proposal.actions.is_empty() {
        return Err(Error::LlmResponseError(
            "actions must not be empty".to_string(),
        ));
    }

    for (i, action) in proposal.actions.iter().enumerate() {
        if action.kind != "Patch" {
            return Err(Error::LlmResponseError(format!(
                "actions[{i}].kind must be Patch, got {:?}",
                action.kind
            )));
        }
        if action.strategy != "ServerSideApply" {
            return Err(Error::LlmResponseError(format!(
                "actions[{i}].strategy must be ServerSideApply, got {:?}",
                action.strategy
            )));
        }
        let r = &action.object_ref;
        if r.api_version.is_empty() || r.kind.is_empty() || r.namespace.is_empty() || r.name.is_empty()
        {
            return Err(Error::LlmResponseError(format!(
                "actions[{i}].objectRef must be fully qualified"
            )));
        }
        if !action.patch.is_object() {
            return Err(Error::LlmResponseError(format!(
                "actions[{i}].patch must be an object"
            )));
        }

        check_image_tags(&action.patch)?;
        check_mutation_classes(&action.patch)?;
    }

    Ok(())
}

/// Reject mutable image references anywhere in the patch: a tag must be
/// present and must not be `latest`.
fn check_image_tags(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if key == "image" {
                    if let Value::String(image) = v {
                        let tag = image_tag(image);
                        match tag {
                            None => {
                                return Err(Error::PolicyError(format!(
                                    "image {image:?} has no tag; immutable tags are required"
                                )))
                            }
                            Some("latest") => {
                                return Err(Error::PolicyError(format!(
                                    "image {image:?} uses the mutable :latest tag"
                                )))
                            }
                            Some(_) => {}
                        }
                    }
                }
                check_image_tags(v)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_image_tags(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Restrict mutations to the allowed classes: container entries may only
/// carry name/image/probes/resources.
fn check_mutation_classes(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if key == "containers" {
                    if let Value::Array(containers) = v {
                        for container in containers {
                            if let Value::Object(fields) = container {
                                for field in fields.keys() {
                                    if !ALLOWED_CONTAINER_KEYS.contains(&field.as_str()) {
                                        return Err(Error::PolicyError(format!(
                                            "container field {field:?} is outside the allowed \
                                             mutation classes"
                                        )));
                                    }
                                }
                            }
                        }
                    }
                }
                check_mutation_classes(v)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_mutation_classes(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The tag portion of an image reference, if any. Registry ports do not
/// count: only a colon after the last slash separates a tag.
fn image_tag(image: &str) -> Option<&str> {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    last_segment.split_once(':').map(|(_, tag)| tag)
}
