//! Nginx Custom Resource Definition
//!
//! Illustrative workload API: a stateless nginx server with a ClusterIP
//! Service in front of it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nginx.example.com",
    version = "v1alpha1",
    kind = "Nginx",
    namespaced,
    status = "NginxStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NginxSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_port: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NginxStatus {
    #[serde(default)]
    pub ready_replicas: i32,
    /// `<service>.<namespace>:<port>`
    #[serde(default)]
    pub service_address: String,
}

impl NginxSpec {
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    pub fn image(&self) -> String {
        self.image.clone().unwrap_or_else(|| "nginx:1.23".to_string())
    }

    pub fn service_port(&self) -> i32 {
        self.service_port.unwrap_or(80)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec = NginxSpec::default();
        assert_eq!(spec.replicas(), 1);
        assert_eq!(spec.image(), "nginx:1.23");
        assert_eq!(spec.service_port(), 80);
    }

    #[test]
    fn test_spec_overrides() {
        let spec = NginxSpec {
            replicas: Some(3),
            image: Some("nginx:1.25.3".to_string()),
            service_port: Some(8080),
        };
        assert_eq!(spec.replicas(), 3);
        assert_eq!(spec.image(), "nginx:1.25.3");
        assert_eq!(spec.service_port(), 8080);
    }
}
