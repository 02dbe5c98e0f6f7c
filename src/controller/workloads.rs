//! Shared workload convergence for rollouts
//!
//! Ensures the stable and canary tracks each have a Deployment and a
//! Service, labelled and owner-referenced by the controlling Rollout.
//! Ownership of pre-existing objects is never stolen; only labels are
//! reconciled on them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta, OwnerReference,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, instrument, warn};

use crate::crd::Rollout;
use crate::error::Result;

pub const TRACK_STABLE: &str = "stable";
pub const TRACK_CANARY: &str = "canary";

/// Placeholder workload image for freshly created tracks; rollouts shift
/// traffic between tracks, they do not manage the application image itself.
const TRACK_IMAGE: &str = "nginx:1.25";
const TRACK_REPLICAS: i32 = 2;

/// Selector and object labels for one track of a rollout.
pub fn track_labels(rollout: &Rollout, track: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), rollout.spec.target_ref.name.clone());
    labels.insert("track".to_string(), track.to_string());
    labels
}

/// Create a controller OwnerReference for garbage collection.
pub fn controller_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.meta().name.clone().unwrap_or_default(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

enum Ownership {
    Ours,
    Foreign(String),
    Unowned,
}

fn ownership(meta: &ObjectMeta, owner: &OwnerReference) -> Ownership {
    let controller = meta
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)));

    match controller {
        Some(current) if current.uid == owner.uid => Ownership::Ours,
        Some(current) => Ownership::Foreign(current.name.clone()),
        None => Ownership::Unowned,
    }
}

/// Re-apply required labels and, when nothing else controls the object,
/// the rollout's owner reference. Returns whether the object changed.
///
/// An object controlled by someone else keeps its owner; we only converge
/// labels on it.
fn reconcile_metadata(
    meta: &mut ObjectMeta,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
) -> bool {
    let mut changed = false;

    let existing_labels = meta.labels.get_or_insert_with(Default::default);
    for (key, value) in labels {
        if existing_labels.get(key) != Some(value) {
            existing_labels.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    match ownership(meta, owner) {
        Ownership::Ours => {}
        Ownership::Foreign(controller) => {
            warn!(
                name = meta.name.as_deref().unwrap_or(""),
                %controller,
                "object is controlled elsewhere, skipping owner reference"
            );
        }
        Ownership::Unowned => {
            meta.owner_references
                .get_or_insert_with(Vec::new)
                .push(owner.clone());
            changed = true;
        }
    }

    changed
}

fn build_deployment(rollout: &Rollout, track: &str) -> Deployment {
    let labels = track_labels(rollout, track);
    let port = rollout.spec.target_ref.port;

    Deployment {
        metadata: ObjectMeta {
            name: Some(rollout.track_deployment_name(track)),
            namespace: rollout.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![controller_reference(rollout)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(TRACK_REPLICAS),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: rollout.spec.target_ref.name.clone(),
                        image: Some(TRACK_IMAGE.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: port,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_service(rollout: &Rollout, track: &str, name: &str) -> Service {
    let labels = track_labels(rollout, track);
    let port = rollout.spec.target_ref.port;

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: rollout.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![controller_reference(rollout)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Ensure both tracks' Deployments and Services exist and carry the
/// required labels and owner references. Create/update failures propagate
/// as reconcile errors.
#[instrument(skip(client, rollout), fields(name = %rollout.name_any(), namespace = rollout.namespace()))]
pub async fn ensure_workloads(client: &Client, rollout: &Rollout) -> Result<()> {
    let namespace = rollout.namespace().unwrap_or_else(|| "default".to_string());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let owner = controller_reference(rollout);

    for track in [TRACK_STABLE, TRACK_CANARY] {
        let dep_name = rollout.track_deployment_name(track);
        let svc_name = if track == TRACK_CANARY {
            rollout.spec.traffic.canary_service.clone()
        } else {
            rollout.spec.traffic.stable_service.clone()
        };
        let labels = track_labels(rollout, track);

        match deployments.get_opt(&dep_name).await? {
            None => {
                info!(deployment = %dep_name, track, "creating track deployment");
                deployments
                    .create(&PostParams::default(), &build_deployment(rollout, track))
                    .await?;
            }
            Some(mut dep) => {
                if reconcile_metadata(&mut dep.metadata, &labels, &owner) {
                    info!(deployment = %dep_name, track, "updating track deployment metadata");
                    deployments
                        .replace(&dep_name, &PostParams::default(), &dep)
                        .await?;
                }
            }
        }

        match services.get_opt(&svc_name).await? {
            None => {
                info!(service = %svc_name, track, "creating track service");
                services
                    .create(
                        &PostParams::default(),
                        &build_service(rollout, track, &svc_name),
                    )
                    .await?;
            }
            Some(mut svc) => {
                if reconcile_metadata(&mut svc.metadata, &labels, &owner) {
                    info!(service = %svc_name, track, "updating track service metadata");
                    services
                        .replace(&svc_name, &PostParams::default(), &svc)
                        .await?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RolloutSpec, RolloutStrategy, StrategyType, TargetRef, TrafficSpec};

    fn rollout() -> Rollout {
        let mut ro = Rollout::new(
            "web",
            RolloutSpec {
                target_ref: TargetRef {
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                    port: 8080,
                },
                strategy: RolloutStrategy {
                    type_: Some(StrategyType::Canary),
                    steps: vec![],
                },
                analysis: Default::default(),
                traffic: TrafficSpec {
                    provider: "NginxIngress".to_string(),
                    host: "web.example.com".to_string(),
                    stable_service: "web-stable".to_string(),
                    canary_service: "web-canary".to_string(),
                },
                rollback_on_failure: None,
            },
        );
        ro.metadata.namespace = Some("ns1".to_string());
        ro.metadata.uid = Some("uid-1".to_string());
        ro
    }

    #[test]
    fn test_build_deployment_shape() {
        let ro = rollout();
        let dep = build_deployment(&ro, TRACK_CANARY);

        assert_eq!(dep.metadata.name.as_deref(), Some("web-canary"));
        let spec = dep.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap().get("track"),
            Some(&"canary".to_string())
        );

        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, "web");
        assert_eq!(container.image.as_deref(), Some("nginx:1.25"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
    }

    #[test]
    fn test_build_service_shape() {
        let ro = rollout();
        let svc = build_service(&ro, TRACK_STABLE, "web-stable");

        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(
            spec.selector.as_ref().unwrap().get("track"),
            Some(&"stable".to_string())
        );
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }

    #[test]
    fn test_reconcile_metadata_applies_missing_labels_once() {
        let ro = rollout();
        let labels = track_labels(&ro, TRACK_STABLE);
        let owner = controller_reference(&ro);

        let mut meta = ObjectMeta {
            name: Some("web-stable".to_string()),
            ..Default::default()
        };

        assert!(reconcile_metadata(&mut meta, &labels, &owner));
        // Second pass converges.
        assert!(!reconcile_metadata(&mut meta, &labels, &owner));
        assert_eq!(
            meta.labels.as_ref().unwrap().get("app"),
            Some(&"web".to_string())
        );
        assert_eq!(
            meta.owner_references.as_ref().unwrap()[0].uid,
            "uid-1".to_string()
        );
    }

    #[test]
    fn test_reconcile_metadata_does_not_steal_ownership() {
        let ro = rollout();
        let labels = track_labels(&ro, TRACK_STABLE);
        let owner = controller_reference(&ro);

        let foreign = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "someone-else".to_string(),
            uid: "uid-other".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let mut meta = ObjectMeta {
            name: Some("web-stable".to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![foreign.clone()]),
            ..Default::default()
        };

        assert!(!reconcile_metadata(&mut meta, &labels, &owner));
        assert_eq!(meta.owner_references.as_ref().unwrap().len(), 1);
        assert_eq!(meta.owner_references.as_ref().unwrap()[0].uid, foreign.uid);
    }

    #[test]
    fn test_controller_reference_shape() {
        let ro = rollout();
        let owner = controller_reference(&ro);

        assert_eq!(owner.kind, "Rollout");
        assert_eq!(owner.api_version, "delivery.example.com/v1alpha1");
        assert_eq!(owner.name, "web");
        assert_eq!(owner.controller, Some(true));
    }
}
