use crate::digest_tracker::DigestTracker;
use crate::upgrade::UpgradeTracker;
use beads::{AgentBead, BeadStore};
use k8s::{pod, PodExt, PodFleet, PodTemplate};
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info, warn};
use result::Result;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use term_colors::*;
use tokio::sync::{watch, Mutex};

/// What one reconcile pass did. Mostly consumed by logs and tests.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcileSummary {
    pub desired: usize,
    pub observed: usize,
    pub created: usize,
    pub orphans_deleted: usize,
    pub recycled: usize,
    pub upgrades_started: usize,
    pub orphan_storm_averted: bool,
    pub burst_limited: bool,
    pub cap_limited: bool,
    pub cancelled: bool,
}

impl ReconcileSummary {
    /// Whether the pass changed anything at all.
    pub fn acted(&self) -> bool {
        self.created > 0 || self.orphans_deleted > 0 || self.recycled > 0
    }
}

/// Why a pod needs replacing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Drift {
    TagChanged,
    DigestMoved,
}

impl Display for Drift {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Drift::TagChanged => f.write_str("image tag changed"),
            Drift::DigestMoved => f.write_str("image digest updated in registry"),
        }
    }
}

/// What the create/upgrade phase decided for one desired entry.
enum Action {
    Create,
    Upgrade,
}

/// The `Reconciler` drives the pod set into agreement with the desired
/// bead set: orphans go away, terminal pods get recycled, drifted pods are
/// rolled, and missing pods are created under burst and cap limits.
///
/// Passes are serialized by an internal mutex; a tick that fires while a
/// pass is in flight simply waits its turn. Everything in a pass is
/// idempotent, so overlapping triggers (startup pass, periodic pass, test
/// harness) cannot fight each other.
pub struct Reconciler {
    beads: Arc<dyn BeadStore>,
    fleet: Arc<dyn PodFleet>,
    digests: Arc<DigestTracker>,
    upgrades: Arc<UpgradeTracker>,
    template: PodTemplate,
    burst_limit: usize,
    max_pods: usize,
    shutdown: watch::Receiver<bool>,
    pass_lock: Mutex<()>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        beads: Arc<dyn BeadStore>,
        fleet: Arc<dyn PodFleet>,
        digests: Arc<DigestTracker>,
        upgrades: Arc<UpgradeTracker>,
        template: PodTemplate,
        burst_limit: usize,
        max_pods: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Reconciler {
        Reconciler {
            beads,
            fleet,
            digests,
            upgrades,
            template,
            burst_limit,
            max_pods,
            shutdown,
            pass_lock: Mutex::new(()),
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One full pass. Aborts without touching any pod when the bead store
    /// cannot be listed: acting on a phantom empty desired set is how an
    /// orphan storm starts.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let _pass = self.pass_lock.lock().await;
        let mut summary = ReconcileSummary::default();

        let agents = self.beads.list_agents().await?;
        let desired = Self::desired_set(agents.as_slice());
        summary.desired = desired.len();

        let pods: Vec<Pod> = self
            .fleet
            .list(&k8s::fleet_selector())
            .await?
            .into_iter()
            .filter(|pod| pod.in_fleet())
            .collect();
        summary.observed = pods.len();

        if self.cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Orphan safety: an empty AGENT LIST alongside live pods smells like
        // an upstream failure mode, not a real instruction to raze the
        // fleet. The guard keys off the raw listing: a listing of
        // nothing but stop-requested beads is a real instruction, and their
        // pods fall through to orphan deletion below.
        if agents.is_empty() && !pods.is_empty() {
            warn!(
                "bead store lists no agent beads but {} fleet pods exist; refusing to delete anything",
                pods.len()
            );
            summary.orphan_storm_averted = true;
            return Ok(summary);
        }

        for pod in &pods {
            let name = pod_name(pod);
            if !desired.contains_key(name) {
                info!("deleting orphan pod {}", cyan(name));
                self.fleet.delete(name).await?;
                summary.orphans_deleted += 1;
            }
        }

        // Terminal pods in the desired set are recycled: delete now, let
        // the create phase below bring a fresh one up.
        let mut recycled: HashSet<String> = HashSet::new();
        for pod in &pods {
            let name = pod_name(pod);
            if desired.contains_key(name) && pod.is_terminal() {
                info!(
                    "recycling terminal pod {} (phase {})",
                    cyan(name),
                    pod.phase().unwrap_or("?")
                );
                self.fleet.delete(name).await?;
                recycled.insert(name.to_string());
                summary.recycled += 1;
            }
        }

        if self.cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Drift detection over the surviving pods.
        self.upgrades.begin_pass().await;
        let live: BTreeMap<&str, &Pod> = pods
            .iter()
            .map(|pod| (pod_name(pod), pod))
            .filter(|(name, _)| desired.contains_key(*name) && !recycled.contains(*name))
            .collect();
        let mut drifted: BTreeMap<String, Drift> = BTreeMap::new();
        for (name, pod) in &live {
            if pod.is_ready() {
                self.upgrades.clear_ready(name).await;
            }
            let bead = &desired[*name];
            if let Some(reason) = self.detect_drift(bead, *pod).await {
                info!("pod {} drifted: {}", cyan(name), reason);
                self.upgrades.note_pending(&bead.coords.mode, name).await;
                drifted.insert(name.to_string(), reason);
            }
        }

        // Create/upgrade phase. `active` tracks non-terminal desired pods
        // so the cap can be enforced before every plain create.
        let mut active = live.len();
        let mut created_this_pass = 0usize;
        for (name, bead) in &desired {
            if self.cancelled() {
                summary.cancelled = true;
                break;
            }
            let action = if !live.contains_key(name.as_str()) {
                Action::Create
            } else if drifted.contains_key(name) {
                Action::Upgrade
            } else {
                continue;
            };
            if let Action::Upgrade = action {
                if !self.upgrades.may_upgrade(&bead.coords.mode, name).await {
                    debug!(
                        "holding upgrade of {} (mode {} not clear to roll)",
                        cyan(name),
                        bead.coords.mode
                    );
                    continue;
                }
            }
            if created_this_pass >= self.burst_limit {
                warn!(
                    "burst limit of {} reached; deferring remaining creates to the next pass",
                    self.burst_limit
                );
                summary.burst_limited = true;
                break;
            }
            if let Action::Create = action {
                if self.max_pods > 0 && active >= self.max_pods {
                    warn!(
                        "active pod cap of {} reached; deferring create of {}",
                        self.max_pods,
                        cyan(name)
                    );
                    summary.cap_limited = true;
                    break;
                }
            }
            let image = self.template.image_for(bead);
            match action {
                Action::Create => {
                    info!("creating pod {} for bead {}", cyan(name), cyan(&bead.id));
                    self.fleet.create(pod::agent_pod(bead, &self.template)?).await?;
                    self.digests.note_deployed(&image).await;
                    active += 1;
                    created_this_pass += 1;
                    summary.created += 1;
                }
                Action::Upgrade => {
                    info!(
                        "rolling pod {} for bead {} ({})",
                        cyan(name),
                        cyan(&bead.id),
                        drifted[name]
                    );
                    self.fleet.delete(name).await?;
                    self.upgrades.mark_upgrading(&bead.coords.mode, name).await;
                    self.fleet.create(pod::agent_pod(bead, &self.template)?).await?;
                    self.digests.note_deployed(&image).await;
                    created_this_pass += 1;
                    summary.created += 1;
                    summary.upgrades_started += 1;
                }
            }
        }

        if summary.acted() {
            info!(
                "reconcile pass: desired={} observed={} created={} orphans={} recycled={} upgrades={}",
                summary.desired,
                summary.observed,
                summary.created,
                summary.orphans_deleted,
                summary.recycled,
                summary.upgrades_started
            );
        } else {
            debug!("reconcile pass: fleet already converged");
        }
        Ok(summary)
    }

    /// The canonical-name index of beads that want a pod. Stop-requested
    /// beads are left out; their pods become orphans on purpose, while the
    /// beads themselves stay open.
    fn desired_set(agents: &[AgentBead]) -> BTreeMap<String, AgentBead> {
        let mut desired = BTreeMap::new();
        for bead in agents {
            if bead.stop_requested() {
                debug!(
                    "bead {} has stop_requested; leaving its pod to orphan cleanup",
                    cyan(&bead.id)
                );
                continue;
            }
            let name = bead.pod_name();
            if let Some(previous) = desired.insert(name.clone(), bead.clone()) {
                warn!(
                    "beads {} and {} both map to pod {}; keeping the latter",
                    cyan(&previous.id),
                    cyan(&bead.id),
                    cyan(&name)
                );
            }
        }
        desired
    }

    /// Tag drift beats digest drift: an explicit retarget is always acted
    /// on, while digest drift additionally needs the tracker's
    /// confirmations.
    async fn detect_drift(&self, bead: &AgentBead, pod: &Pod) -> Option<Drift> {
        let desired_image = self.template.image_for(bead);
        let actual_image = pod.agent_image().unwrap_or("");
        if !desired_image.is_empty() && desired_image != actual_image {
            return Some(Drift::TagChanged);
        }
        if self.digests.has_drift(&desired_image).await {
            return Some(Drift::DigestMoved);
        }
        None
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}
