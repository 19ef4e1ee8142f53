use beads::types::JOB_MODE;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use term_colors::*;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How long a pod may sit mid-upgrade (deleted, replacement not yet Ready)
/// before its tracker entry is reaped. Without the reap, a replacement that
/// never becomes Ready would block its mode's rolling upgrades forever.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How a mode's pods are replaced when their spec drifts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Replace at most one pod of the mode at a time, waiting for each
    /// replacement to become Ready.
    Rolling,
    /// Never kill a running pod for drift; fresh pods pick up the new spec
    /// naturally.
    Skip,
    /// Hold back until every non-Last mode is quiet, then behave as
    /// Rolling. Reserved: no mode maps to it today, but the tracker honours
    /// it so a future role can opt in.
    Last,
}

/// The strategy a mode upgrades under. Jobs are never interrupted;
/// everything else rolls.
pub fn strategy_for_mode(mode: &str) -> Strategy {
    if mode == JOB_MODE {
        Strategy::Skip
    } else {
        Strategy::Rolling
    }
}

#[derive(Clone, Debug)]
struct InFlight {
    mode: String,
    since: Instant,
}

#[derive(Default)]
struct Inner {
    /// Pods that want an upgrade this pass, keyed by mode. Rebuilt from
    /// scratch at the start of every pass.
    pending: HashMap<String, HashSet<String>>,
    /// Pods deleted for replacement whose replacement is not yet Ready,
    /// keyed by pod name.
    upgrading: HashMap<String, InFlight>,
}

/// The `UpgradeTracker` is the process-local ledger behind rolling
/// upgrades. It remembers which pods want an upgrade (this pass) and which
/// are mid-upgrade (across passes), and answers whether a given pod may be
/// replaced right now.
pub struct UpgradeTracker {
    inner: Mutex<Inner>,
}

impl UpgradeTracker {
    pub fn new() -> UpgradeTracker {
        UpgradeTracker {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Opens a reconcile pass: pending registrations from the previous pass
    /// are discarded and stale in-flight entries reaped.
    pub async fn begin_pass(&self) {
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        let now = Instant::now();
        inner.upgrading.retain(|pod, in_flight| {
            let stale = now.duration_since(in_flight.since) > UPGRADE_TIMEOUT;
            if stale {
                warn!(
                    "upgrade of pod {} has been in flight for over {:?}; releasing its slot",
                    cyan(pod),
                    UPGRADE_TIMEOUT
                );
            }
            !stale
        });
    }

    /// Registers a pod whose spec has drifted this pass.
    pub async fn note_pending<M: AsRef<str>, P: AsRef<str>>(&self, mode: M, pod: P) {
        let mut inner = self.inner.lock().await;
        inner
            .pending
            .entry(mode.as_ref().to_string())
            .or_insert_with(HashSet::new)
            .insert(pod.as_ref().to_string());
    }

    /// A Ready pod is, by definition, no longer mid-upgrade. Clearing on
    /// readiness is what lets the NEXT pod of the mode take its turn.
    pub async fn clear_ready<P: AsRef<str>>(&self, pod: P) {
        let mut inner = self.inner.lock().await;
        if inner.upgrading.remove(pod.as_ref()).is_some() {
            debug!("pod {} became Ready; upgrade slot released", cyan(pod.as_ref()));
        }
    }

    /// Whether the given pod may be replaced right now under its mode's
    /// strategy.
    pub async fn may_upgrade<M: AsRef<str>, P: AsRef<str>>(&self, mode: M, _pod: P) -> bool {
        let mode = mode.as_ref();
        let inner = self.inner.lock().await;
        match strategy_for_mode(mode) {
            Strategy::Skip => false,
            Strategy::Rolling => !inner.upgrading.values().any(|f| f.mode == mode),
            Strategy::Last => {
                let eager_work_remains = inner
                    .pending
                    .iter()
                    .any(|(m, pods)| strategy_for_mode(m) != Strategy::Last && !pods.is_empty())
                    || inner
                        .upgrading
                        .values()
                        .any(|f| strategy_for_mode(&f.mode) != Strategy::Last);
                if eager_work_remains {
                    return false;
                }
                !inner.upgrading.values().any(|f| f.mode == mode)
            }
        }
    }

    /// Records that the pod has been deleted for replacement. Its slot
    /// stays occupied until [clear_ready](UpgradeTracker::clear_ready) sees
    /// the replacement, or the entry ages out.
    pub async fn mark_upgrading<M: AsRef<str>, P: AsRef<str>>(&self, mode: M, pod: P) {
        let mut inner = self.inner.lock().await;
        if let Some(pods) = inner.pending.get_mut(mode.as_ref()) {
            pods.remove(pod.as_ref());
        }
        inner.upgrading.insert(
            pod.as_ref().to_string(),
            InFlight {
                mode: mode.as_ref().to_string(),
                since: Instant::now(),
            },
        );
    }

    /// How many pods of the mode are currently mid-upgrade.
    pub async fn upgrading_count<M: AsRef<str>>(&self, mode: M) -> usize {
        let inner = self.inner.lock().await;
        inner
            .upgrading
            .values()
            .filter(|f| f.mode == mode.as_ref())
            .count()
    }
}
