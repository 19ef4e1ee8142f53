use k8s::LeaseLock;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use term_colors::*;
use tokio::sync::watch;

/// How long a held lease stays valid without a renewal.
pub const LEASE_DURATION: Duration = Duration::from_secs(15);

/// How often a healthy leader renews.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// How long a contender (or a leader recovering from a failed renewal)
/// waits between attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Blocks until this process acquires the leader lease, attempting every
/// [RETRY_INTERVAL](RETRY_INTERVAL). Errors are survivable here (the lease
/// may simply be held, or the API server may be mid-hiccup), so they log
/// and retry. Returns false when shutdown fires before leadership does.
pub async fn acquire(lock: &LeaseLock, shutdown: &mut watch::Receiver<bool>) -> bool {
    info!("contending for leadership as {}", cyan(lock.holder_id()));
    loop {
        if *shutdown.borrow() {
            return false;
        }
        match lock.try_acquire_or_renew().await {
            Ok(state) if state.acquired => {
                info!("acquired the leader lease as {}", cyan(lock.holder_id()));
                return true;
            }
            Ok(state) => debug!(
                "leader lease held by {}; standing by",
                state.holder.as_deref().unwrap_or("nobody")
            ),
            Err(err) => warn!("leader election attempt failed: {}", err),
        }
        tokio::select! {
            _ = tokio::time::sleep(RETRY_INTERVAL) => (),
            _ = shutdown.changed() => return false,
        }
    }
}

/// Keeps a held lease renewed. Two things are fatal, and both end in a
/// process exit so the replacement pod rejoins the election from scratch:
/// the lease being observed in someone else's hands, and a renewal outage
/// outlasting [LEASE_DURATION](LEASE_DURATION) (at which point peers are
/// entitled to take the lease, so we must stop acting as leader). A clean
/// shutdown releases the lease instead.
pub async fn hold(lock: Arc<LeaseLock>, mut shutdown: watch::Receiver<bool>) {
    let mut last_renewal = tokio::time::Instant::now();
    let mut delay = RENEW_INTERVAL;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = shutdown.changed() => (),
        }
        if *shutdown.borrow() {
            match lock.step_down().await {
                Ok(()) => info!("released the leader lease"),
                Err(err) => warn!("failed to release the leader lease: {}", err),
            }
            return;
        }
        match lock.try_acquire_or_renew().await {
            Ok(state) if state.acquired => {
                last_renewal = tokio::time::Instant::now();
                delay = RENEW_INTERVAL;
            }
            Ok(state) => {
                error!(
                    "lost the leader lease to {}; exiting so this replica rejoins the election",
                    state.holder.as_deref().unwrap_or("nobody")
                );
                std::process::exit(1);
            }
            Err(err) => {
                warn!("lease renewal failed: {}", err);
                if last_renewal.elapsed() > LEASE_DURATION {
                    error!(
                        "could not renew the leader lease within {:?}; exiting",
                        LEASE_DURATION
                    );
                    std::process::exit(1);
                }
                delay = RETRY_INTERVAL;
            }
        }
    }
}
