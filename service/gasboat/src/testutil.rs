//! In-memory doubles for the controller's three external seams: the pod
//! fleet, the bead store, and the registry digest oracle. Tests inject
//! failures through one-way toggles.

use async_trait::async_trait;
use beads::{AgentBead, BeadStore, Coordinates, EventKind, LifecycleEvent};
use error::*;
use k8s::{PodFleet, PodTemplate};
use k8s_openapi::api::core::v1::Pod;
use registry::DigestOracle;
use result::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Error, Debug)]
#[error("injected test failure in {op}")]
pub struct InjectedFailure {
    op: String,
}

impl FleetError for InjectedFailure {}

fn injected(op: &str) -> Box<dyn FleetError> {
    InjectedFailure { op: op.to_string() }.into()
}

/// The knobs of [pod_fixture](pod_fixture). Defaults describe a healthy
/// crew pod named `crew-p-dev-alpha`.
pub struct PodFixture {
    pub name: &'static str,
    pub project: &'static str,
    pub role: &'static str,
    pub agent: &'static str,
    pub mode: &'static str,
    pub image: &'static str,
    pub phase: Option<&'static str>,
    pub ready: bool,
    pub pod_ip: Option<&'static str>,
    pub bead_id: Option<&'static str>,
}

impl Default for PodFixture {
    fn default() -> PodFixture {
        PodFixture {
            name: "crew-p-dev-alpha",
            project: "p",
            role: "dev",
            agent: "alpha",
            mode: "crew",
            image: "reg/agent:latest",
            phase: None,
            ready: false,
            pod_ip: None,
            bead_id: None,
        }
    }
}

pub fn pod_fixture(fixture: PodFixture) -> Pod {
    let mut conditions = Vec::new();
    if fixture.ready {
        conditions.push(serde_json::json!({"type": "Ready", "status": "True"}));
    }
    let mut annotations = serde_json::Map::new();
    if let Some(bead_id) = fixture.bead_id {
        annotations.insert(
            k8s::BEAD_ID_ANNOTATION.to_string(),
            serde_json::Value::String(bead_id.to_string()),
        );
    }
    let mut labels = serde_json::Map::new();
    for (key, value) in &[
        (k8s::APP_LABEL, k8s::APP_LABEL_VALUE),
        (k8s::PROJECT_LABEL, fixture.project),
        (k8s::ROLE_LABEL, fixture.role),
        (k8s::AGENT_LABEL, fixture.agent),
        (k8s::MODE_LABEL, fixture.mode),
    ] {
        labels.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    }
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "name": fixture.name,
            "namespace": "gasboat",
            "labels": labels,
            "annotations": annotations,
        },
        "spec": {
            "containers": [{
                "name": k8s::AGENT_CONTAINER,
                "image": fixture.image,
                "ports": [{"containerPort": k8s::COOP_PORT}]
            }]
        },
        "status": {
            "phase": fixture.phase,
            "podIP": fixture.pod_ip,
            "conditions": conditions,
        }
    }))
    .expect("pod fixture must deserialize")
}

pub fn template() -> PodTemplate {
    PodTemplate {
        namespace: "gasboat".to_string(),
        image: "reg/agent:latest".to_string(),
        service_account: "default".to_string(),
        beads_http_addr: "beads:8080".to_string(),
        beads_grpc_addr: "beads:9090".to_string(),
        secret_name: None,
        workspace_claim: None,
    }
}

pub fn agent_bead(id: &str, mode: &str, role: &str, agent: &str) -> AgentBead {
    AgentBead {
        id: id.to_string(),
        coords: Coordinates {
            project: "p".to_string(),
            mode: mode.to_string(),
            role: role.to_string(),
            agent: agent.to_string(),
        },
        status: "open".to_string(),
        metadata: HashMap::new(),
    }
}

pub fn event(
    kind: EventKind,
    bead_id: &str,
    project: &str,
    mode: &str,
    role: &str,
    agent: &str,
) -> LifecycleEvent {
    LifecycleEvent {
        kind,
        bead_id: bead_id.to_string(),
        coords: Coordinates {
            project: project.to_string(),
            mode: mode.to_string(),
            role: role.to_string(),
            agent: agent.to_string(),
        },
        metadata: HashMap::new(),
    }
}

/// An in-memory [PodFleet](k8s::PodFleet) keyed by pod name.
#[derive(Default)]
pub struct MockFleet {
    pods: Mutex<BTreeMap<String, Pod>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    fail_list: AtomicBool,
}

impl MockFleet {
    pub fn insert(&self, pod: Pod) {
        let name = pod.metadata.name.clone().expect("fixture pods carry names");
        self.pods.lock().unwrap().insert(name, pod);
    }

    pub fn names(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().cloned().collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodFleet for MockFleet {
    async fn create(&self, pod: Pod) -> Result<Pod> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(injected("pod create"));
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut pods = self.pods.lock().unwrap();
        if let Some(existing) = pods.get(&name) {
            return Ok(existing.clone());
        }
        pods.insert(name.clone(), pod.clone());
        self.created.lock().unwrap().push(name);
        Ok(pod)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected("pod delete"));
        }
        self.pods.lock().unwrap().remove(name);
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods.lock().unwrap().get(name).cloned())
    }

    async fn list(&self, _selector: &str) -> Result<Vec<Pod>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(injected("pod list"));
        }
        Ok(self.pods.lock().unwrap().values().cloned().collect())
    }
}

/// An in-memory [BeadStore](beads::BeadStore) that records every write.
#[derive(Default)]
pub struct MockBeads {
    agents: Mutex<Vec<AgentBead>>,
    fields: Mutex<Vec<(String, HashMap<String, String>)>>,
    notes: Mutex<Vec<(String, String)>>,
    fail_list: AtomicBool,
    fail_writes: AtomicBool,
}

impl MockBeads {
    pub fn set_agents(&self, agents: Vec<AgentBead>) {
        *self.agents.lock().unwrap() = agents;
    }

    pub fn fields(&self) -> Vec<(String, HashMap<String, String>)> {
        self.fields.lock().unwrap().clone()
    }

    pub fn notes(&self) -> Vec<(String, String)> {
        self.notes.lock().unwrap().clone()
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BeadStore for MockBeads {
    async fn list_agents(&self) -> Result<Vec<AgentBead>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(injected("bead list"));
        }
        Ok(self.agents.lock().unwrap().clone())
    }

    async fn set_fields(&self, bead_id: &str, fields: HashMap<String, String>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("bead fields"));
        }
        self.fields
            .lock()
            .unwrap()
            .push((bead_id.to_string(), fields));
        Ok(())
    }

    async fn set_notes(&self, bead_id: &str, notes: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("bead notes"));
        }
        self.notes
            .lock()
            .unwrap()
            .push((bead_id.to_string(), notes.to_string()));
        Ok(())
    }
}

/// A scripted [DigestOracle](registry::DigestOracle); unknown references
/// resolve to an error, which is also useful for exercising lookup-failure
/// paths.
#[derive(Default)]
pub struct MockOracle {
    digests: Mutex<HashMap<String, String>>,
}

impl MockOracle {
    pub fn set(&self, image: &str, digest: &str) {
        self.digests
            .lock()
            .unwrap()
            .insert(image.to_string(), digest.to_string());
    }
}

#[async_trait]
impl DigestOracle for MockOracle {
    async fn resolve(&self, reference: &str) -> Result<String> {
        self.digests
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| injected("digest lookup"))
    }
}
