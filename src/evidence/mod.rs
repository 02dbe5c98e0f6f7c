//! Evidence collection for failing pods
//!
//! Summarises a pod's failure signals (status, container states, related
//! events, previous logs) into one canonical JSON document that becomes the
//! LLM input. Collection is pure: no retries, the caller re-queues.

use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{api::ListParams, Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Waiting reasons that open a remediation case.
const ANOMALOUS_WAITING_REASONS: [&str; 3] =
    ["ImagePullBackOff", "ErrImagePull", "CrashLoopBackOff"];

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub pod: PodEvidence,
    #[serde(default)]
    pub events: Vec<EventEvidence>,
    #[serde(default)]
    pub previous_logs: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodEvidence {
    pub namespace: String,
    pub name: String,
    pub phase: String,
    #[serde(default)]
    pub images: Vec<ContainerImage>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ContainerImage {
    pub name: String,
    pub image: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEvidence {
    #[serde(rename = "type")]
    pub type_: String,
    pub reason: String,
    pub message: String,
    pub count: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_timestamp: String,
}

/// True iff any container is stuck in a Waiting state that indicates a
/// broken image or crash loop.
pub fn is_anomalous(pod: &Pod) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    statuses.map_or(false, |statuses| {
        statuses.iter().any(|cs| {
            cs.state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref())
                .map(|r| ANOMALOUS_WAITING_REASONS.contains(&r))
                .unwrap_or(false)
        })
    })
}

/// RFC3339 UTC rendering of a Kubernetes timestamp, or empty when absent.
pub fn rfc3339_or_empty(time: Option<&Time>) -> String {
    time.map(|t| t.0.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Whether an event belongs to the given pod.
fn event_involves_pod(event: &Event, namespace: &str, name: &str) -> bool {
    let obj = &event.involved_object;
    obj.kind.as_deref() == Some("Pod")
        && obj.name.as_deref() == Some(name)
        && obj.namespace.as_deref() == Some(namespace)
}

fn event_record(event: &Event) -> EventEvidence {
    EventEvidence {
        type_: event.type_.clone().unwrap_or_default(),
        reason: event.reason.clone().unwrap_or_default(),
        message: event.message.clone().unwrap_or_default(),
        count: event.count.unwrap_or(0),
        last_timestamp: rfc3339_or_empty(event.last_timestamp.as_ref()),
    }
}

/// Assemble the evidence document from already-observed inputs.
pub fn build(pod: &Pod, events: &[Event], previous_logs: String) -> Evidence {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let name = pod.name_any();

    let mut ev = Evidence {
        pod: PodEvidence {
            namespace: namespace.clone(),
            name: name.clone(),
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default(),
            images: Vec::new(),
            container_statuses: pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.clone())
                .unwrap_or_default(),
        },
        events: Vec::new(),
        previous_logs,
    };

    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            ev.pod.images.push(ContainerImage {
                name: container.name.clone(),
                image: container.image.clone().unwrap_or_default(),
            });
        }
    }

    ev.events = events
        .iter()
        .filter(|e| event_involves_pod(e, &namespace, &name))
        .map(event_record)
        .collect();

    ev
}

/// Collect evidence for a pod and serialize it to canonical JSON bytes.
///
/// Events are listed namespace-wide and filtered in memory; previous logs
/// are left empty here (the watch cache does not expose the log
/// subresource), the CLI path fills them in.
pub async fn collect(client: &Client, pod: &Pod) -> Result<Vec<u8>> {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let events_api: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let events = match events_api.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(_) => Vec::new(),
    };

    let ev = build(pod, &events, String::new());
    Ok(serde_json::to_vec(&ev)?)
}

/// Fetch the previous container's logs, `kubectl logs -p` style.
///
/// Falls back to the first declared container when none is named. A pod
/// without a prior container instance has no previous logs; that is not an
/// error.
pub async fn previous_logs(client: &Client, pod: &Pod, container: Option<&str>) -> String {
    use kube::api::LogParams;

    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let container = container.map(str::to_string).or_else(|| {
        pod.spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone())
    });

    let params = LogParams {
        container,
        previous: true,
        ..Default::default()
    };

    pods.logs(&pod.name_any(), &params).await.unwrap_or_default()
}
