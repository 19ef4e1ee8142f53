use beads::types::{Coordinates, DEFAULT_MODE};
use beads::{meta, AgentBead};
use error::*;
use k8s_openapi::api::core::v1::Pod;
use result::Result;
use serde_json::json;

/// The name of the volume the workspace claim is mounted under, and where
/// it lands inside the agent container.
pub const WORKSPACE_VOLUME: &str = "workspace";
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// The configuration half of the desired pod spec. Bead identity supplies
/// the other half; [agent_pod](agent_pod) marries the two.
#[derive(Clone, Debug)]
pub struct PodTemplate {
    pub namespace: String,
    pub image: String,
    pub service_account: String,
    pub beads_http_addr: String,
    pub beads_grpc_addr: String,
    /// The name of the secret whose keys are injected into the agent's
    /// environment, when configured.
    pub secret_name: Option<String>,
    /// The name of the PersistentVolumeClaim mounted into the agent
    /// container as its workspace, when configured. The claim is consumed
    /// by name only.
    pub workspace_claim: Option<String>,
}

impl PodTemplate {
    /// The image an agent bead should be running: its own override when the
    /// bead carries one, the configured default otherwise.
    pub fn image_for(&self, bead: &AgentBead) -> String {
        bead.image().unwrap_or(&self.image).to_string()
    }
}

/// Materializes the desired pod for an agent bead.
///
/// The bead contributes identity (canonical name, coordinate labels, the
/// bead-id annotation) and its metadata overrides (`image`,
/// `service_account`, `namespace`, `mock_scenario`); the template
/// contributes everything environmental. The result is what the fleet
/// create call submits verbatim.
pub fn agent_pod(bead: &AgentBead, template: &PodTemplate) -> Result<Pod> {
    let name = bead.pod_name();
    let image = template.image_for(bead);
    let namespace = bead.meta(meta::NAMESPACE).unwrap_or(&template.namespace);
    let service_account = bead
        .meta(meta::SERVICE_ACCOUNT)
        .unwrap_or(&template.service_account);
    let mut env = vec![
        json!({"name": "BEADS_HTTP_ADDR", "value": template.beads_http_addr}),
        json!({"name": "BEADS_GRPC_ADDR", "value": template.beads_grpc_addr}),
        json!({"name": "GASBOAT_BEAD_ID", "value": bead.id}),
        json!({"name": "GASBOAT_PROJECT", "value": bead.coords.project}),
        json!({"name": "GASBOAT_ROLE", "value": bead.coords.role}),
        json!({"name": "GASBOAT_AGENT", "value": bead.coords.agent}),
        json!({"name": "GASBOAT_MODE", "value": bead.coords.mode}),
    ];
    if let Some(scenario) = bead.meta(meta::MOCK_SCENARIO) {
        env.push(json!({"name": "MOCK_SCENARIO", "value": scenario}));
    }
    let env_from = match template.secret_name.as_ref() {
        Some(secret) => json!([{"secretRef": {"name": secret}}]),
        None => json!([]),
    };
    let (volumes, volume_mounts) = match template.workspace_claim.as_ref() {
        Some(claim) => (
            json!([{
                "name": WORKSPACE_VOLUME,
                "persistentVolumeClaim": {"claimName": claim}
            }]),
            json!([{
                "name": WORKSPACE_VOLUME,
                "mountPath": WORKSPACE_MOUNT_PATH
            }]),
        ),
        None => (json!([]), json!([])),
    };
    let mut labels = serde_json::Map::new();
    labels.insert(crate::APP_LABEL.to_string(), json!(crate::APP_LABEL_VALUE));
    labels.insert(crate::PROJECT_LABEL.to_string(), json!(bead.coords.project));
    labels.insert(crate::ROLE_LABEL.to_string(), json!(bead.coords.role));
    labels.insert(crate::AGENT_LABEL.to_string(), json!(bead.coords.agent));
    labels.insert(crate::MODE_LABEL.to_string(), json!(bead.coords.mode));
    let mut annotations = serde_json::Map::new();
    annotations.insert(crate::BEAD_ID_ANNOTATION.to_string(), json!(bead.id));
    let pod: Pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": {
            "serviceAccountName": service_account,
            "restartPolicy": "Never",
            "volumes": volumes,
            "containers": [
                {
                    "name": crate::AGENT_CONTAINER,
                    "image": image,
                    "imagePullPolicy": "Always",
                    "env": env,
                    "envFrom": env_from,
                    "volumeMounts": volume_mounts,
                    "ports": [
                        {
                            "containerPort": crate::COOP_PORT,
                            "protocol": "TCP"
                        }
                    ]
                }
            ]
        }
    }))
    .map_err(|source| PodSerializationError {
        name,
        image,
        source,
    })?;
    Ok(pod)
}

#[derive(Error, Debug)]
#[error("failed to serialize the pod resource '{name}' with image '{image}'")]
pub struct PodSerializationError {
    name: String,
    image: String,
    #[source]
    source: serde_json::Error,
}

impl FleetError for PodSerializationError {}

/// PodExt is an extension trait used to answer common questions about pods.
pub trait PodExt {
    fn phase(&self) -> Option<&str>;
    /// A pod is terminal when it has run to an end state and will never be
    /// scheduled again under a `Never` restart policy.
    fn is_terminal(&self) -> bool;
    /// The Ready condition, as reported by the kubelet.
    fn is_ready(&self) -> bool;
    fn pod_ip(&self) -> Option<&str>;
    fn label(&self, key: &str) -> Option<&str>;
    fn annotation(&self, key: &str) -> Option<&str>;
    /// Whether this pod belongs to the controller's fleet: the app-scoping
    /// label AND an agent label must both be present.
    fn in_fleet(&self) -> bool;
    /// The image of the agent container (the container named
    /// [coop](crate::AGENT_CONTAINER), or the first one as a fallback).
    fn agent_image(&self) -> Option<&str>;
    /// The port the agent serves its coop interface on, if the pod exposes
    /// one recognizably.
    fn coop_port(&self) -> Option<i32>;
    /// The coordinate labels, when the pod carries the full set.
    fn fleet_coordinates(&self) -> Option<Coordinates>;
    /// The bead this pod answers to: the bead-id annotation when present,
    /// otherwise derived from the coordinate labels.
    fn bead_id(&self) -> Option<String>;
}

impl PodExt for Pod {
    fn phase(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase(), Some("Succeeded") | Some("Failed"))
    }

    fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }

    fn pod_ip(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(|v| v.as_str())
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(|v| v.as_str())
    }

    fn in_fleet(&self) -> bool {
        self.label(crate::APP_LABEL) == Some(crate::APP_LABEL_VALUE)
            && self.label(crate::AGENT_LABEL).is_some()
    }

    fn agent_image(&self) -> Option<&str> {
        let containers = self.spec.as_ref().map(|spec| &spec.containers)?;
        containers
            .iter()
            .find(|c| c.name == crate::AGENT_CONTAINER)
            .or_else(|| containers.first())
            .and_then(|c| c.image.as_deref())
    }

    fn coop_port(&self) -> Option<i32> {
        let containers = self.spec.as_ref().map(|spec| &spec.containers)?;
        if let Some(coop) = containers.iter().find(|c| c.name == crate::AGENT_CONTAINER) {
            let explicit = coop
                .ports
                .as_ref()
                .and_then(|ports| ports.first())
                .map(|port| port.container_port);
            return Some(explicit.unwrap_or(crate::COOP_PORT));
        }
        let exposes_coop_port = containers.iter().any(|c| {
            c.ports
                .as_ref()
                .map(|ports| ports.iter().any(|p| p.container_port == crate::COOP_PORT))
                .unwrap_or(false)
        });
        if exposes_coop_port {
            Some(crate::COOP_PORT)
        } else {
            None
        }
    }

    fn fleet_coordinates(&self) -> Option<Coordinates> {
        let project = self.label(crate::PROJECT_LABEL)?;
        let role = self.label(crate::ROLE_LABEL)?;
        let agent = self.label(crate::AGENT_LABEL)?;
        let mode = self.label(crate::MODE_LABEL).unwrap_or(DEFAULT_MODE);
        Some(Coordinates {
            project: project.to_string(),
            mode: mode.to_string(),
            role: role.to_string(),
            agent: agent.to_string(),
        })
    }

    fn bead_id(&self) -> Option<String> {
        if let Some(id) = self.annotation(crate::BEAD_ID_ANNOTATION) {
            return Some(id.to_string());
        }
        self.fleet_coordinates()
            .map(|coords| coords.fallback_bead_id())
    }
}
