use crate::digest_tracker::DigestTracker;
use crate::reactor::Reactor;
use crate::reconciler::Reconciler;
use crate::reporter::StatusReporter;
use beads::{BeadClient, LifecycleEvent};
use k8s::{PodExt, PodFleet};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::sync::{mpsc, watch};

/// Registry digests are re-queried on every N'th tick rather than every
/// tick; registries rate-limit, and digest drift is a minutes-scale signal.
pub const REGISTRY_REFRESH_TICKS: u64 = 5;

/// The `Supervisor` owns the running control loop: the startup pass, the
/// event loop fed by the stream client, and the periodic tick. It assumes
/// leadership has already been settled by the time it runs.
pub struct Supervisor {
    pub reactor: Arc<Reactor>,
    pub reconciler: Arc<Reconciler>,
    pub reporter: Arc<StatusReporter>,
    pub digests: Arc<DigestTracker>,
    pub fleet: Arc<dyn PodFleet>,
    pub beads: Arc<BeadClient>,
    pub sync_interval: Duration,
    pub default_image: String,
}

impl Supervisor {
    /// Runs until shutdown. `events` is the read side of the stream
    /// client's channel; when the stream client winds down it closes the
    /// channel, which drains the event loop.
    pub async fn run(
        self,
        events: mpsc::Receiver<LifecycleEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        self.seed_digests().await;
        match self.reconciler.reconcile().await {
            Ok(summary) => info!(
                "startup reconcile: desired={} observed={} created={}",
                summary.desired, summary.observed, summary.created
            ),
            Err(err) => warn!("startup reconcile failed: {}", err),
        }
        let event_task = tokio::spawn(event_loop(
            self.reactor.clone(),
            events,
            shutdown.clone(),
        ));
        self.tick_loop(shutdown).await;
        if let Err(err) = event_task.await {
            error!("event loop panicked: {:?}", err);
        }
        info!("supervisor shut down");
    }

    /// One tick: status sync, project cache refresh, the occasional
    /// registry digest refresh, then a reconcile pass. Every failure is
    /// logged and survived; the next tick retries.
    async fn tick_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.sync_interval);
        // The first tick of a tokio interval fires immediately; the startup
        // pass already covered that ground.
        interval.tick().await;
        let mut tick: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => (),
                _ = shutdown.changed() => continue,
            }
            tick += 1;
            debug!("supervisor tick {}", tick);
            if let Err(err) = self.reporter.sync_all().await {
                warn!("status sync failed: {}", err);
            }
            match self.beads.refresh_projects().await {
                Ok(count) => debug!("project cache refreshed ({} projects)", count),
                Err(err) => debug!("project cache refresh failed: {}", err),
            }
            // ExternalSecret reconciliation runs here in deployments that
            // carry it; it lives outside this controller.
            if tick % REGISTRY_REFRESH_TICKS == 0 {
                self.digests.refresh_images().await;
            }
            if let Err(err) = self.reconciler.reconcile().await {
                warn!("reconcile pass failed: {}", err);
            }
        }
    }

    /// Seeds the digest tracker with every image the live fleet is already
    /// running (plus the configured default), so that the FIRST registry
    /// poll after startup can never read as drift.
    async fn seed_digests(&self) {
        let mut images: BTreeSet<String> = BTreeSet::new();
        images.insert(self.default_image.clone());
        match self.fleet.list(&k8s::fleet_selector()).await {
            Ok(pods) => {
                for pod in pods.iter().filter(|pod| pod.in_fleet()) {
                    if let Some(image) = pod.agent_image() {
                        images.insert(image.to_string());
                    }
                }
            }
            Err(err) => warn!("could not list the fleet for digest seeding: {}", err),
        }
        for image in &images {
            self.digests.check_and_seed(image).await;
        }
    }
}

/// Drains lifecycle events into the reactor, one at a time, in stream
/// order. Per-event failures are logged with the event's type and agent and
/// the loop keeps going.
async fn event_loop(
    reactor: Arc<Reactor>,
    mut events: mpsc::Receiver<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        if let Err(err) = reactor.handle(&event).await {
            error!(
                "failed to handle {} for agent {}: {}",
                event.kind,
                cyan(&event.coords.agent),
                err
            );
        }
    }
    debug!("event loop drained");
}
