extern crate jemallocator;

// jemalloc handles the controller's bursty allocation pattern (hundreds of
// pods listed and diffed per pass) with far less idle fragmentation than
// the glibc allocator.
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use beads::BeadStore;
use gasboat::digest_tracker::DigestTracker;
use gasboat::reactor::Reactor;
use gasboat::reconciler::Reconciler;
use gasboat::reporter::StatusReporter;
use gasboat::supervisor::Supervisor;
use gasboat::upgrade::UpgradeTracker;
use gasboat::{election, env, health, VERSION};
use k8s::{LeaseLockParams, PodFleet};
use log::{error, info, warn};
use std::sync::Arc;
use term_colors::*;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    // Keep log colors on even when stdout is a container pipe.
    std::env::set_var("RUST_LOG_STYLE", "always");
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(env::log_level()),
    )
    .init();
    info!("gasboat controller {} starting", bold(VERSION));

    let namespace = env::namespace();
    let template = env::pod_template();
    info!(
        "managing namespace {} against bead store {}",
        cyan(&namespace),
        cyan(env::beads_base_url())
    );

    let bead_client = match beads::BeadClient::new(env::beads_http_addr()) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!("could not construct the bead store client: {}", err);
            std::process::exit(1);
        }
    };
    let store: Arc<dyn BeadStore> = bead_client.clone();
    let fleet: Arc<dyn PodFleet> = Arc::new(k8s::KubeFleet::new(&namespace).await);
    let oracle = match registry::HttpRegistry::new() {
        Ok(oracle) => Arc::new(oracle),
        Err(err) => {
            error!("could not construct the registry client: {}", err);
            std::process::exit(1);
        }
    };

    let digests = Arc::new(DigestTracker::new(oracle));
    let upgrades = Arc::new(UpgradeTracker::new());
    let reporter = Arc::new(StatusReporter::new(store.clone(), fleet.clone()));
    let reactor = Arc::new(Reactor::new(fleet.clone(), reporter.clone(), template.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Arc::new(Reconciler::new(
        store,
        fleet.clone(),
        digests.clone(),
        upgrades,
        template,
        env::burst_limit(),
        env::max_pods(),
        shutdown_rx.clone(),
    ));

    // The health server answers probes for the whole process lifetime,
    // leader or not.
    let health_state = health::HealthState {
        namespace: namespace.clone(),
        sync_interval: env::sync_interval(),
        metrics: reporter.metrics(),
    };
    tokio::spawn(async move {
        if let Err(err) = health::rocket(health_state).launch().await {
            error!("health server failed: {}", err);
        }
    });

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                warn!("could not listen for interrupts: {}", err);
                // Park forever so dropping the sender does not read as a
                // shutdown to every receiver.
                std::future::pending::<()>().await;
            }
        }
    });

    if env::leader_election_enabled() {
        let lock = Arc::new(
            k8s::LeaseLock::new(
                &namespace,
                LeaseLockParams {
                    lease_name: env::leader_election_id(),
                    holder_id: env::holder_identity(),
                    lease_ttl: election::LEASE_DURATION,
                },
            )
            .await,
        );
        let mut acquire_rx = shutdown_rx.clone();
        if !election::acquire(&lock, &mut acquire_rx).await {
            info!("shutdown before leadership was acquired");
            return;
        }
        tokio::spawn(election::hold(lock, shutdown_rx.clone()));
    } else {
        warn!("leader election is disabled; assuming this is the only replica");
    }

    let (stream, events) = match beads::EventStream::new(env::beads_base_url()) {
        Ok(pair) => pair,
        Err(err) => {
            error!("could not construct the event stream client: {}", err);
            std::process::exit(1);
        }
    };
    tokio::spawn(stream.run(shutdown_rx.clone()));

    let supervisor = Supervisor {
        reactor,
        reconciler,
        reporter,
        digests,
        fleet,
        beads: bead_client,
        sync_interval: env::sync_interval(),
        default_image: env::coop_image(),
    };
    supervisor.run(events, shutdown_rx).await;
    info!("gasboat controller exiting");
}
