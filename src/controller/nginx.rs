//! Nginx workload controller
//!
//! Illustrative reconciler: one Deployment and one ClusterIP Service per
//! Nginx record, status reporting readiness and the in-cluster address.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{error, info, instrument};

use crate::controller::workloads::controller_reference;
use crate::crd::{Nginx, NginxStatus};
use crate::error::{Error, Result};
use crate::FIELD_MANAGER;

/// The container always listens on 80; `spec.servicePort` only moves the
/// Service front.
const NGINX_CONTAINER_PORT: i32 = 80;

pub struct NginxContext {
    pub client: Client,
}

/// Start the nginx workload controller.
pub async fn run_nginx_controller(ctx: Arc<NginxContext>) -> Result<()> {
    let client = ctx.client.clone();
    let nginxes: Api<Nginx> = Api::all(client.clone());

    info!("Starting nginx controller");

    Controller::new(nginxes, Config::default())
        .owns::<Deployment>(Api::all(client.clone()), Config::default())
        .owns::<Service>(Api::all(client), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(_) => {}
                Err(e) => error!("Nginx reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

fn nginx_labels(nginx: &Nginx) -> std::collections::BTreeMap<String, String> {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert("app".to_string(), "nginx".to_string());
    labels.insert("cr".to_string(), nginx.name_any());
    labels
}

fn build_deployment(nginx: &Nginx) -> Deployment {
    let labels = nginx_labels(nginx);

    Deployment {
        metadata: ObjectMeta {
            name: Some(nginx.name_any()),
            namespace: nginx.namespace(),
            owner_references: Some(vec![controller_reference(nginx)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(nginx.spec.replicas()),
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
                        name: "nginx".to_string(),
                        image: Some(nginx.spec.image()),
                        ports: Some(vec![ContainerPort {
                            container_port: NGINX_CONTAINER_PORT,
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

fn build_service(nginx: &Nginx) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(nginx.name_any()),
            namespace: nginx.namespace(),
            owner_references: Some(vec![controller_reference(nginx)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(nginx_labels(nginx)),
            ports: Some(vec![ServicePort {
                port: nginx.spec.service_port(),
                target_port: Some(IntOrString::Int(NGINX_CONTAINER_PORT)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

#[instrument(skip(ctx, nginx), fields(name = %nginx.name_any(), namespace = nginx.namespace()))]
async fn reconcile(nginx: Arc<Nginx>, ctx: Arc<NginxContext>) -> Result<Action> {
    let client = &ctx.client;
    let namespace = nginx.namespace().unwrap_or_else(|| "default".to_string());
    let name = nginx.name_any();

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);

    // Deployment: create, or converge replicas/image on drift.
    match deployments.get_opt(&name).await? {
        None => {
            info!(deployment = %name, "creating nginx deployment");
            deployments
                .create(&PostParams::default(), &build_deployment(&nginx))
                .await?;
        }
        Some(mut existing) => {
            let desired_replicas = nginx.spec.replicas();
            let desired_image = nginx.spec.image();

            let spec = existing.spec.get_or_insert_with(Default::default);
            let current_image = spec
                .template
                .spec
                .as_ref()
                .and_then(|p| p.containers.first())
                .and_then(|c| c.image.clone())
                .unwrap_or_default();

            if spec.replicas != Some(desired_replicas) || current_image != desired_image {
                spec.replicas = Some(desired_replicas);
                if let Some(pod_spec) = spec.template.spec.as_mut() {
                    if let Some(container) = pod_spec.containers.first_mut() {
                        container.image = Some(desired_image);
                    }
                }
                info!(deployment = %name, "updating nginx deployment");
                deployments
                    .replace(&name, &PostParams::default(), &existing)
                    .await?;
            }
        }
    }

    // Service: create, or converge the front port on drift.
    match services.get_opt(&name).await? {
        None => {
            info!(service = %name, "creating nginx service");
            services
                .create(&PostParams::default(), &build_service(&nginx))
                .await?;
        }
        Some(mut existing) => {
            let desired_port = nginx.spec.service_port();
            let current_port = existing
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .map(|p| p.port);

            if current_port != Some(desired_port) {
                if let Some(port) = existing
                    .spec
                    .as_mut()
                    .and_then(|s| s.ports.as_mut())
                    .and_then(|p| p.first_mut())
                {
                    port.port = desired_port;
                }
                info!(service = %name, "updating nginx service");
                services
                    .replace(&name, &PostParams::default(), &existing)
                    .await?;
            }
        }
    }

    // Publish observed state.
    let ready_replicas = deployments
        .get(&name)
        .await?
        .status
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let service_address = format!("{name}.{namespace}:{}", nginx.spec.service_port());

    let current = nginx.status.clone().unwrap_or_default();
    if current.ready_replicas != ready_replicas || current.service_address != service_address {
        let status = NginxStatus {
            ready_replicas,
            service_address,
        };
        let api: Api<Nginx> = Api::namespaced(client.clone(), &namespace);
        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
        info!(ready_replicas, "nginx status updated");
    }

    Ok(Action::await_change())
}

fn error_policy(nginx: Arc<Nginx>, error: &Error, _ctx: Arc<NginxContext>) -> Action {
    error!("Nginx reconcile error for {}: {:?}", nginx.name_any(), error);

    let retry = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry)
}
