use crate::reporter::{PodStatusReport, ReportedPhase, StatusReporter};
use beads::{AgentBead, EventKind, LifecycleEvent};
use k8s::{pod, PodFleet, PodTemplate};
use log::{debug, info, warn};
use result::Result;
use std::sync::Arc;
use term_colors::*;

/// The `Reactor` turns each lifecycle event into an immediate pod action
/// and a status report. It is stateless: everything it needs rides in on
/// the event, and anything it gets wrong is repaired by the next reconcile
/// pass.
pub struct Reactor {
    fleet: Arc<dyn PodFleet>,
    reporter: Arc<StatusReporter>,
    template: PodTemplate,
}

impl Reactor {
    pub fn new(
        fleet: Arc<dyn PodFleet>,
        reporter: Arc<StatusReporter>,
        template: PodTemplate,
    ) -> Reactor {
        Reactor {
            fleet,
            reporter,
            template,
        }
    }

    /// Handles one event. Pod create/delete failures surface as errors (the
    /// caller logs them and keeps the loop running); status and metadata
    /// writes are best-effort inside the reporter.
    pub async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        debug!(
            "reacting to {} for bead {} ({})",
            event.kind,
            cyan(&event.bead_id),
            cyan(event.pod_name())
        );
        match event.kind {
            EventKind::Spawn => self.spawn(event).await,
            EventKind::Done => self.tear_down(event, ReportedPhase::Succeeded).await,
            EventKind::Kill => self.tear_down(event, ReportedPhase::Failed).await,
            EventKind::Stop => self.tear_down(event, ReportedPhase::Stopped).await,
            EventKind::Stuck => self.restart(event).await,
            EventKind::Update => {
                // Metadata drift is the periodic reconciler's department.
                debug!("no immediate action for update of {}", cyan(&event.bead_id));
                Ok(())
            }
        }
    }

    async fn spawn(&self, event: &LifecycleEvent) -> Result<()> {
        let bead = Self::bead_of(event);
        let desired = pod::agent_pod(&bead, &self.template)?;
        let created = self.fleet.create(desired).await?;
        info!(
            "spawned pod {} for bead {}",
            cyan(created.metadata.name.as_deref().unwrap_or("?")),
            cyan(&event.bead_id)
        );
        self.reporter
            .report_pod_status(&event.bead_id, &PodStatusReport::phase(ReportedPhase::Pending))
            .await;
        Ok(())
    }

    async fn tear_down(&self, event: &LifecycleEvent, phase: ReportedPhase) -> Result<()> {
        let name = event.pod_name();
        self.fleet.delete(&name).await?;
        info!(
            "tore down pod {} ({}) for bead {}",
            cyan(&name),
            phase,
            cyan(&event.bead_id)
        );
        self.reporter.clear_backend_metadata(&event.bead_id).await;
        self.reporter
            .report_pod_status(&event.bead_id, &PodStatusReport::phase(phase))
            .await;
        Ok(())
    }

    async fn restart(&self, event: &LifecycleEvent) -> Result<()> {
        let name = event.pod_name();
        // A failed delete here is survivable: the create below is
        // idempotent, and the reconciler recycles anything half-done.
        if let Err(err) = self.fleet.delete(&name).await {
            warn!("stuck-restart delete of {} failed: {}", cyan(&name), err);
        }
        let bead = Self::bead_of(event);
        let desired = pod::agent_pod(&bead, &self.template)?;
        self.fleet.create(desired).await?;
        info!("restarted pod {} for bead {}", cyan(&name), cyan(&event.bead_id));
        let report = PodStatusReport::phase(ReportedPhase::Pending)
            .with_message("restarted due to stuck detection");
        self.reporter.report_pod_status(&event.bead_id, &report).await;
        Ok(())
    }

    /// Reconstitutes the bead view the pod builder wants from the event's
    /// payload.
    fn bead_of(event: &LifecycleEvent) -> AgentBead {
        AgentBead {
            id: event.bead_id.clone(),
            coords: event.coords.clone(),
            status: String::new(),
            metadata: event.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{event, MockBeads, MockFleet};
    use beads::BeadStore;

    fn rig() -> (Arc<MockFleet>, Arc<MockBeads>, Reactor) {
        let fleet = Arc::new(MockFleet::default());
        let beads = Arc::new(MockBeads::default());
        let reporter = Arc::new(StatusReporter::new(beads.clone(), fleet.clone()));
        let reactor = Reactor::new(fleet.clone(), reporter, crate::testutil::template());
        (fleet, beads, reactor)
    }

    #[tokio::test]
    async fn spawn_then_close() {
        let (fleet, beads, reactor) = rig();
        reactor
            .handle(&event(EventKind::Spawn, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert_eq!(vec!["crew-p-dev-alpha".to_string()], fleet.created());
        assert_eq!(
            Some(&"spawning".to_string()),
            beads.fields().last().unwrap().1.get("agent_state")
        );
        reactor
            .handle(&event(EventKind::Done, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert_eq!(vec!["crew-p-dev-alpha".to_string()], fleet.deleted());
        assert_eq!(
            Some(&"done".to_string()),
            beads.fields().last().unwrap().1.get("agent_state")
        );
        // Backend metadata was cleared on the way out.
        assert_eq!(Some(&String::new()), beads.notes().last().map(|(_, n)| n));
    }

    #[tokio::test]
    async fn stop_reports_stopped_as_done() {
        let (fleet, beads, reactor) = rig();
        reactor
            .handle(&event(EventKind::Stop, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert_eq!(vec!["crew-p-dev-alpha".to_string()], fleet.deleted());
        assert_eq!(
            Some(&"done".to_string()),
            beads.fields().last().unwrap().1.get("agent_state")
        );
    }

    #[tokio::test]
    async fn kill_reports_failed() {
        let (_fleet, beads, reactor) = rig();
        reactor
            .handle(&event(EventKind::Kill, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert_eq!(
            Some(&"failed".to_string()),
            beads.fields().last().unwrap().1.get("agent_state")
        );
    }

    #[tokio::test]
    async fn stuck_deletes_and_recreates() {
        let (fleet, beads, reactor) = rig();
        reactor
            .handle(&event(EventKind::Stuck, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert_eq!(vec!["crew-p-dev-alpha".to_string()], fleet.deleted());
        assert_eq!(vec!["crew-p-dev-alpha".to_string()], fleet.created());
        let (_, fields) = beads.fields().last().unwrap().clone();
        assert_eq!(Some(&"spawning".to_string()), fields.get("agent_state"));
        assert_eq!(
            Some(&"restarted due to stuck detection".to_string()),
            fields.get("agent_message")
        );
    }

    #[tokio::test]
    async fn stuck_survives_delete_failure() {
        let (fleet, _beads, reactor) = rig();
        fleet.fail_delete();
        reactor
            .handle(&event(EventKind::Stuck, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert_eq!(vec!["crew-p-dev-alpha".to_string()], fleet.created());
    }

    #[tokio::test]
    async fn update_is_a_no_op() {
        let (fleet, beads, reactor) = rig();
        reactor
            .handle(&event(EventKind::Update, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert!(fleet.created().is_empty());
        assert!(fleet.deleted().is_empty());
        assert!(beads.fields().is_empty());
    }

    #[tokio::test]
    async fn report_failure_does_not_fail_the_event() {
        let (fleet, beads, reactor) = rig();
        beads.fail_writes();
        reactor
            .handle(&event(EventKind::Spawn, "bd-1", "p", "crew", "dev", "alpha"))
            .await
            .unwrap();
        assert_eq!(1, fleet.created().len());
        // The trait object still works after the failure toggle.
        assert!(beads.list_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_failure_is_returned() {
        let (fleet, _beads, reactor) = rig();
        fleet.fail_create();
        let result = reactor
            .handle(&event(EventKind::Spawn, "bd-1", "p", "crew", "dev", "alpha"))
            .await;
        assert!(result.is_err());
    }
}
