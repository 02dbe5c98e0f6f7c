//! Shared types used by all three CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named status condition following Kubernetes API conventions.
///
/// At most one condition per type is kept on a resource; later writes
/// supersede the existing entry in place (see
/// `controller::conditions::set_condition`).
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

/// Schema for fields that carry arbitrary JSON preserved by the API server
/// (`x-kubernetes-preserve-unknown-fields`). Used for the evidence blob and
/// the proposed patch, which must survive round-trips untouched.
pub fn arbitrary_object(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    use schemars::schema::{InstanceType, SchemaObject};
    use serde_json::json;

    SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions: {
            let mut ext = std::collections::BTreeMap::new();
            ext.insert(
                "x-kubernetes-preserve-unknown-fields".to_string(),
                json!(true),
            );
            ext
        },
        ..Default::default()
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_serializes_camel_case() {
        let cond = Condition::new("Proposed", true, "OK", "PatchProposed");
        let value = serde_json::to_value(&cond).unwrap();

        assert_eq!(value["type"], "Proposed");
        assert_eq!(value["status"], "True");
        assert!(value["lastTransitionTime"].is_string());
    }
}
