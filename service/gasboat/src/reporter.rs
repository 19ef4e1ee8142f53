use crate::env::Secret;
use beads::BeadStore;
use k8s::{PodExt, PodFleet};
use k8s_openapi::api::core::v1::Pod;
use log::{debug, warn};
use result::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use term_colors::*;

/// The pod phases the reporter projects onto beads. `Stopped` is synthetic:
/// no pod ever reports it, but a Stop event ends in it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportedPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl ReportedPhase {
    /// Maps a live pod's phase string. Phases outside the table (`Unknown`,
    /// or a missing status block) yield `None` and are skipped entirely.
    pub fn from_pod(pod: &Pod) -> Option<ReportedPhase> {
        match pod.phase() {
            Some("Pending") => Some(ReportedPhase::Pending),
            Some("Running") => Some(ReportedPhase::Running),
            Some("Succeeded") => Some(ReportedPhase::Succeeded),
            Some("Failed") => Some(ReportedPhase::Failed),
            _ => None,
        }
    }

    /// The agent state written into the bead for this phase.
    pub fn agent_state(&self) -> &'static str {
        match self {
            ReportedPhase::Pending => "spawning",
            ReportedPhase::Running => "working",
            ReportedPhase::Succeeded => "done",
            ReportedPhase::Failed => "failed",
            ReportedPhase::Stopped => "done",
        }
    }
}

impl Display for ReportedPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReportedPhase::Pending => "Pending",
            ReportedPhase::Running => "Running",
            ReportedPhase::Succeeded => "Succeeded",
            ReportedPhase::Failed => "Failed",
            ReportedPhase::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// One observation of a pod, ready to be projected onto its bead.
#[derive(Clone, Debug)]
pub struct PodStatusReport {
    pub phase: ReportedPhase,
    pub ready: bool,
    pub message: Option<String>,
}

impl PodStatusReport {
    pub fn phase(phase: ReportedPhase) -> PodStatusReport {
        PodStatusReport {
            phase,
            ready: false,
            message: None,
        }
    }

    pub fn with_message<M: Into<String>>(mut self, message: M) -> PodStatusReport {
        self.message = Some(message.into());
        self
    }
}

/// The connection coordinates written into a bead's notes so that other
/// tools can find the running agent. Only the non-empty parts are written.
/// The token rides in a [Secret](crate::env::Secret) so a stray `{:?}` of
/// this struct can never leak it into logs; the notes rendering reads the
/// raw value on purpose.
#[derive(Clone, Debug, Default)]
pub struct BackendMetadata {
    pub backend: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub coop_url: String,
    pub coop_token: Secret,
}

impl BackendMetadata {
    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
            && self.pod_name.is_empty()
            && self.pod_namespace.is_empty()
            && self.coop_url.is_empty()
            && self.coop_token.is_empty()
    }

    /// The multi-line notes rendering, one `key: value` line per non-empty
    /// field.
    pub fn to_notes(&self) -> String {
        let fields = [
            ("backend", self.backend.as_str()),
            ("pod_name", self.pod_name.as_str()),
            ("pod_namespace", self.pod_namespace.as_str()),
            ("coop_url", self.coop_url.as_str()),
            ("coop_token", self.coop_token.raw_secret()),
        ];
        fields
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{}: {}", key, value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Thread-safe counters over the reporter's activity.
#[derive(Default)]
pub struct Metrics {
    reports_total: AtomicU64,
    report_errors: AtomicU64,
    sync_runs: AtomicU64,
    sync_errors: AtomicU64,
}

/// A point-in-time copy of [Metrics](Metrics).
#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub reports_total: u64,
    pub report_errors: u64,
    pub sync_runs: u64,
    pub sync_errors: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reports_total: self.reports_total.load(Ordering::Relaxed),
            report_errors: self.report_errors.load(Ordering::Relaxed),
            sync_runs: self.sync_runs.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
        }
    }
}

/// The `StatusReporter` projects observed pod state back onto agent beads.
/// Every write is best-effort: failures are counted and logged, never
/// propagated, because a flaky bead store must not stall pod management.
pub struct StatusReporter {
    beads: Arc<dyn BeadStore>,
    fleet: Arc<dyn PodFleet>,
    metrics: Arc<Metrics>,
}

impl StatusReporter {
    pub fn new(beads: Arc<dyn BeadStore>, fleet: Arc<dyn PodFleet>) -> StatusReporter {
        StatusReporter {
            beads,
            fleet,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Writes the bead's `agent_state` field for an observed pod phase.
    pub async fn report_pod_status(&self, bead_id: &str, report: &PodStatusReport) {
        self.metrics.reports_total.fetch_add(1, Ordering::Relaxed);
        let mut fields = HashMap::new();
        fields.insert(
            "agent_state".to_string(),
            report.phase.agent_state().to_string(),
        );
        if let Some(message) = report.message.as_ref() {
            fields.insert("agent_message".to_string(), message.clone());
        }
        if let Err(err) = self.beads.set_fields(bead_id, fields).await {
            self.metrics.report_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "failed to report {} for bead {}: {}",
                report.phase,
                cyan(bead_id),
                err
            );
        }
    }

    /// Writes the bead's backend notes. An entirely empty metadata set is
    /// skipped; there is nothing worth overwriting notes with.
    pub async fn report_backend_metadata(&self, bead_id: &str, metadata: &BackendMetadata) {
        if metadata.is_empty() {
            return;
        }
        self.metrics.reports_total.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.beads.set_notes(bead_id, &metadata.to_notes()).await {
            self.metrics.report_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "failed to write backend metadata for bead {}: {}",
                cyan(bead_id),
                err
            );
        }
    }

    /// Clears the backend notes of a bead whose pod is gone.
    pub async fn clear_backend_metadata(&self, bead_id: &str) {
        self.metrics.reports_total.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.beads.set_notes(bead_id, "").await {
            self.metrics.report_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "failed to clear backend metadata for bead {}: {}",
                cyan(bead_id),
                err
            );
        }
    }

    /// Walks the whole fleet and reports every pod's current phase and
    /// connection coordinates. This is the pull-side complement to the
    /// event-driven reports: it repairs anything a lost event left stale.
    pub async fn sync_all(&self) -> Result<()> {
        self.metrics.sync_runs.fetch_add(1, Ordering::Relaxed);
        let pods = match self.fleet.list(&k8s::fleet_selector()).await {
            Ok(pods) => pods,
            Err(err) => {
                self.metrics.sync_errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        for pod in pods.iter().filter(|pod| pod.in_fleet()) {
            let coords = match pod.fleet_coordinates() {
                Some(coords) => coords,
                // Without the full label set there is no bead to report to.
                None => continue,
            };
            let bead_id = pod
                .bead_id()
                .unwrap_or_else(|| coords.fallback_bead_id());
            match ReportedPhase::from_pod(pod) {
                Some(phase) => {
                    let report = PodStatusReport {
                        phase,
                        ready: pod.is_ready(),
                        message: None,
                    };
                    self.report_pod_status(&bead_id, &report).await;
                }
                None => debug!(
                    "pod {} has no reportable phase yet",
                    cyan(pod.metadata.name.as_deref().unwrap_or("?"))
                ),
            }
            if let (Some(port), Some(ip)) = (pod.coop_port(), pod.pod_ip()) {
                let metadata = BackendMetadata {
                    backend: "kubernetes".to_string(),
                    pod_name: pod.metadata.name.clone().unwrap_or_default(),
                    pod_namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                    coop_url: format!("http://{}:{}", ip, port),
                    coop_token: Secret::default(),
                };
                self.report_backend_metadata(&bead_id, &metadata).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pod_fixture, MockBeads, MockFleet, PodFixture};

    #[test]
    fn phase_mapping_table() {
        assert_eq!("spawning", ReportedPhase::Pending.agent_state());
        assert_eq!("working", ReportedPhase::Running.agent_state());
        assert_eq!("done", ReportedPhase::Succeeded.agent_state());
        assert_eq!("failed", ReportedPhase::Failed.agent_state());
        assert_eq!("done", ReportedPhase::Stopped.agent_state());
    }

    #[test]
    fn unknown_phases_are_skipped() {
        let pod = pod_fixture(PodFixture {
            name: "crew-p-dev-alpha",
            phase: Some("Unknown"),
            ..PodFixture::default()
        });
        assert_eq!(None, ReportedPhase::from_pod(&pod));
    }

    #[test]
    fn notes_render_only_non_empty_fields() {
        let metadata = BackendMetadata {
            backend: "kubernetes".to_string(),
            pod_name: "crew-p-dev-alpha".to_string(),
            pod_namespace: String::new(),
            coop_url: "http://10.0.0.7:8080".to_string(),
            coop_token: Secret::default(),
        };
        assert_eq!(
            "backend: kubernetes\npod_name: crew-p-dev-alpha\ncoop_url: http://10.0.0.7:8080",
            metadata.to_notes()
        );
    }

    #[test]
    fn notes_carry_the_raw_token_but_debug_does_not() {
        let metadata = BackendMetadata {
            backend: "kubernetes".to_string(),
            pod_name: "crew-p-dev-alpha".to_string(),
            pod_namespace: "gasboat".to_string(),
            coop_url: "http://10.0.0.7:8080".to_string(),
            coop_token: Secret::from("tok-123"),
        };
        assert!(metadata.to_notes().contains("coop_token: tok-123"));
        let debugged = format!("{:?}", metadata);
        assert!(!debugged.contains("tok-123"));
        assert!(debugged.contains("<REDACTED>"));
    }

    #[tokio::test]
    async fn empty_metadata_is_not_written() {
        let beads = Arc::new(MockBeads::default());
        let fleet = Arc::new(MockFleet::default());
        let reporter = StatusReporter::new(beads.clone(), fleet);
        reporter
            .report_backend_metadata("bd-1", &BackendMetadata::default())
            .await;
        assert!(beads.notes().is_empty());
        assert_eq!(0, reporter.metrics().snapshot().reports_total);
    }

    #[tokio::test]
    async fn report_errors_are_counted_not_propagated() {
        let beads = Arc::new(MockBeads::default());
        beads.fail_writes();
        let fleet = Arc::new(MockFleet::default());
        let reporter = StatusReporter::new(beads, fleet);
        reporter
            .report_pod_status("bd-1", &PodStatusReport::phase(ReportedPhase::Running))
            .await;
        let snapshot = reporter.metrics().snapshot();
        assert_eq!(1, snapshot.reports_total);
        assert_eq!(1, snapshot.report_errors);
    }

    #[tokio::test]
    async fn sync_all_reports_phase_and_backend() {
        let beads = Arc::new(MockBeads::default());
        let fleet = Arc::new(MockFleet::default());
        fleet.insert(pod_fixture(PodFixture {
            name: "crew-p-dev-alpha",
            bead_id: Some("bd-1"),
            phase: Some("Running"),
            ready: true,
            pod_ip: Some("10.0.0.7"),
            ..PodFixture::default()
        }));
        let reporter = StatusReporter::new(beads.clone(), fleet);
        reporter.sync_all().await.unwrap();
        let fields = beads.fields();
        assert_eq!(1, fields.len());
        assert_eq!("bd-1", fields[0].0);
        assert_eq!(Some(&"working".to_string()), fields[0].1.get("agent_state"));
        let notes = beads.notes();
        assert_eq!(1, notes.len());
        assert!(notes[0].1.contains("coop_url: http://10.0.0.7:8080"));
        let snapshot = reporter.metrics().snapshot();
        assert_eq!(1, snapshot.sync_runs);
        assert_eq!(0, snapshot.sync_errors);
    }

    #[tokio::test]
    async fn sync_all_skips_pods_without_full_labels() {
        let beads = Arc::new(MockBeads::default());
        let fleet = Arc::new(MockFleet::default());
        let mut stray = pod_fixture(PodFixture {
            name: "stray",
            phase: Some("Running"),
            ..PodFixture::default()
        });
        // Strip the project label; the pod is in the fleet but unmappable.
        stray
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(k8s::PROJECT_LABEL);
        fleet.insert(stray);
        let reporter = StatusReporter::new(beads.clone(), fleet);
        reporter.sync_all().await.unwrap();
        assert!(beads.fields().is_empty());
    }

    #[tokio::test]
    async fn sync_errors_are_counted() {
        let beads = Arc::new(MockBeads::default());
        let fleet = Arc::new(MockFleet::default());
        fleet.fail_list();
        let reporter = StatusReporter::new(beads, fleet);
        assert!(reporter.sync_all().await.is_err());
        assert_eq!(1, reporter.metrics().snapshot().sync_errors);
    }
}
