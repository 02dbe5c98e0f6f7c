//! Traffic shifting between stable and canary services
//!
//! `TrafficProvider` abstracts the data plane; the reference implementation
//! drives nginx ingress canary annotations. Per host it maintains a stable
//! ingress (`<host>-stable`) and a weighted canary ingress
//! (`<host>-canary`). Upserts are read-modify-write; write conflicts
//! surface to the caller, whose re-queue retries the whole step.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const CANARY_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary";
pub const CANARY_WEIGHT_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary-weight";

/// Everything a provider needs to address one rollout's traffic: ingresses
/// are namespaced, and the backend port follows the rollout's target port.
#[derive(Clone, Debug)]
pub struct TrafficTarget<'a> {
    pub namespace: &'a str,
    pub host: &'a str,
    pub stable_service: &'a str,
    pub canary_service: &'a str,
    pub port: i32,
}

/// Abstraction over a traffic-shaping data plane.
///
/// `set_weight` must be idempotent: repeated calls with the same weight are
/// no-ops apart from object-generation churn. `promote` reroutes 100% to
/// the canary service and removes the overlay; `reset` restores the stable
/// service (deleting an already-absent overlay is success).
#[async_trait]
pub trait TrafficProvider: Send + Sync {
    async fn set_weight(&self, target: &TrafficTarget<'_>, weight: i32) -> Result<()>;
    async fn promote(&self, target: &TrafficTarget<'_>) -> Result<()>;
    async fn reset(&self, target: &TrafficTarget<'_>) -> Result<()>;
}

pub fn stable_ingress_name(host: &str) -> String {
    format!("{host}-stable")
}

pub fn canary_ingress_name(host: &str) -> String {
    format!("{host}-canary")
}

fn canary_annotations(weight: i32) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(CANARY_ANNOTATION.to_string(), "true".to_string());
    annotations.insert(CANARY_WEIGHT_ANNOTATION.to_string(), weight.to_string());
    annotations
}

/// Build an ingress routing `host` to `service`.
fn build_ingress(
    target: &TrafficTarget<'_>,
    name: &str,
    service: &str,
    annotations: Option<BTreeMap<String, String>>,
) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(target.namespace.to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some("nginx".to_string()),
            rules: Some(vec![IngressRule {
                host: Some(target.host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(target.port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// The backend service the ingress currently routes to, if any.
fn backend_service(ingress: &Ingress) -> Option<&str> {
    ingress
        .spec
        .as_ref()?
        .rules
        .as_ref()?
        .first()?
        .http
        .as_ref()?
        .paths
        .first()?
        .backend
        .service
        .as_ref()
        .map(|s| s.name.as_str())
}

/// Point the ingress at `service`:`port`, returning whether anything
/// changed.
fn retarget(ingress: &mut Ingress, target: &TrafficTarget<'_>, service: &str) -> bool {
    let current_port = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .and_then(|r| r.first())
        .and_then(|r| r.http.as_ref())
        .and_then(|h| h.paths.first())
        .and_then(|p| p.backend.service.as_ref())
        .and_then(|s| s.port.as_ref())
        .and_then(|p| p.number);

    if backend_service(ingress) == Some(service) && current_port == Some(target.port) {
        return false;
    }

    let name = ingress.metadata.name.clone().unwrap_or_default();
    let desired = build_ingress(target, &name, service, None);
    ingress.spec = desired.spec;
    true
}

/// The weight the canary ingress currently advertises, if any.
fn current_weight(ingress: &Ingress) -> Option<String> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CANARY_WEIGHT_ANNOTATION))
        .cloned()
}

/// Reference provider for the nginx ingress controller.
pub struct NginxIngressProvider {
    client: Client,
}

impl NginxIngressProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Make sure the stable ingress exists and routes to `service`.
    async fn ensure_stable(&self, target: &TrafficTarget<'_>, service: &str) -> Result<()> {
        let api = self.api(target.namespace);
        let name = stable_ingress_name(target.host);

        match api.get_opt(&name).await? {
            None => {
                info!(ingress = %name, service, "creating stable ingress");
                let ingress = build_ingress(target, &name, service, None);
                api.create(&PostParams::default(), &ingress).await?;
            }
            Some(mut existing) => {
                if retarget(&mut existing, target, service) {
                    info!(ingress = %name, service, "retargeting stable ingress");
                    api.replace(&name, &PostParams::default(), &existing).await?;
                } else {
                    debug!(ingress = %name, service, "stable ingress up to date");
                }
            }
        }
        Ok(())
    }

    /// Create or update the canary overlay with the given weight.
    async fn upsert_canary(&self, target: &TrafficTarget<'_>, weight: i32) -> Result<()> {
        let api = self.api(target.namespace);
        let name = canary_ingress_name(target.host);
        let desired_weight = weight.to_string();

        match api.get_opt(&name).await? {
            None => {
                info!(ingress = %name, weight, "creating canary ingress");
                let ingress = build_ingress(
                    target,
                    &name,
                    target.canary_service,
                    Some(canary_annotations(weight)),
                );
                api.create(&PostParams::default(), &ingress).await?;
            }
            Some(mut existing) => {
                let mut changed = retarget(&mut existing, target, target.canary_service);
                if current_weight(&existing).as_deref() != Some(desired_weight.as_str()) {
                    let annotations = existing.metadata.annotations.get_or_insert_with(Default::default);
                    annotations.insert(CANARY_ANNOTATION.to_string(), "true".to_string());
                    annotations.insert(CANARY_WEIGHT_ANNOTATION.to_string(), desired_weight);
                    changed = true;
                }
                if changed {
                    info!(ingress = %name, weight, "updating canary ingress");
                    api.replace(&name, &PostParams::default(), &existing).await?;
                } else {
                    debug!(ingress = %name, weight, "canary ingress up to date");
                }
            }
        }
        Ok(())
    }

    /// Delete the canary overlay; an already-absent overlay is success.
    async fn delete_canary(&self, target: &TrafficTarget<'_>) -> Result<()> {
        let api = self.api(target.namespace);
        let name = canary_ingress_name(target.host);

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

#[async_trait]
impl TrafficProvider for NginxIngressProvider {
    async fn set_weight(&self, target: &TrafficTarget<'_>, weight: i32) -> Result<()> {
        self.ensure_stable(target, target.stable_service).await?;
        self.upsert_canary(target, weight).await
    }

    async fn promote(&self, target: &TrafficTarget<'_>) -> Result<()> {
        self.ensure_stable(target, target.canary_service).await?;
        self.delete_canary(target).await
    }

    async fn reset(&self, target: &TrafficTarget<'_>) -> Result<()> {
        self.ensure_stable(target, target.stable_service).await?;
        self.delete_canary(target).await
    }
}
