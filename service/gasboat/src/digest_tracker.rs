use log::{debug, info, warn};
use registry::DigestOracle;
use std::collections::HashMap;
use std::sync::Arc;
use term_colors::*;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How many consecutive registry polls must agree on a NEW digest before it
/// counts as drift. One poll is not proof: registries answer from caches,
/// and a half-pushed tag can briefly resolve oddly.
pub const DRIFT_CONFIRMATIONS: u32 = 2;

#[derive(Clone, Debug)]
struct Entry {
    /// The digest last rolled out by a successful pod create.
    deployed: String,
    /// The digest the registry most recently answered with.
    current: String,
    /// How many successive polls have agreed on `current` while it differs
    /// from `deployed`.
    confirm: u32,
    last_refresh: Instant,
}

/// The `DigestTracker` detects that a mutable tag (`:latest` and friends)
/// now resolves to a different manifest digest than what is deployed,
/// without false positives on startup or from a single odd registry answer.
///
/// Digests are only ever compared registry-to-registry. Comparing a pod's
/// reported image digest against a registry digest would misfire on
/// platform manifest lists, where the kubelet reports the per-platform
/// digest and the registry the list digest.
pub struct DigestTracker {
    oracle: Arc<dyn DigestOracle>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl DigestTracker {
    pub fn new(oracle: Arc<dyn DigestOracle>) -> DigestTracker {
        DigestTracker {
            oracle,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// First sighting of an image: deployed and current start out equal, so
    /// a freshly seeded image can never report drift.
    pub async fn seed<I: AsRef<str>, D: AsRef<str>>(&self, image: I, digest: D) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            image.as_ref().to_string(),
            Entry {
                deployed: digest.as_ref().to_string(),
                current: digest.as_ref().to_string(),
                confirm: 0,
                last_refresh: Instant::now(),
            },
        );
        debug!(
            "digest tracker seeded {} at {}",
            cyan(image.as_ref()),
            orange(digest.as_ref())
        );
    }

    /// Folds one registry answer into the tracker. A repeat of the known
    /// current digest confirms it; a new digest restarts the confirmation
    /// count at one.
    pub async fn record_registry_digest<I: AsRef<str>, D: AsRef<str>>(&self, image: I, digest: D) {
        let image = image.as_ref();
        let digest = digest.as_ref();
        let mut entries = self.entries.lock().await;
        let entry = match entries.get_mut(image) {
            Some(entry) => entry,
            None => {
                drop(entries);
                self.seed(image, digest).await;
                return;
            }
        };
        entry.last_refresh = Instant::now();
        if entry.current == digest {
            if entry.current != entry.deployed {
                entry.confirm += 1;
                debug!(
                    "registry digest for {} confirmed {} times",
                    cyan(image),
                    entry.confirm
                );
            }
        } else {
            debug!(
                "registry digest for {} moved {} -> {}",
                cyan(image),
                orange(&entry.current),
                orange(digest)
            );
            entry.current = digest.to_string();
            entry.confirm = 1;
        }
    }

    /// A successful create means whatever the registry currently serves is
    /// what is now running; drift is cleared.
    pub async fn mark_deployed<I: AsRef<str>>(&self, image: I) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(image.as_ref()) {
            entry.deployed = entry.current.clone();
            entry.confirm = 0;
        }
    }

    /// What the reconciler asks before planning a digest-drift upgrade:
    /// drift requires a digest that differs from the deployed one AND has
    /// been confirmed by at least
    /// [DRIFT_CONFIRMATIONS](DRIFT_CONFIRMATIONS) successive polls.
    pub async fn has_drift<I: AsRef<str>>(&self, image: I) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(image.as_ref())
            .map(|entry| entry.current != entry.deployed && entry.confirm >= DRIFT_CONFIRMATIONS)
            .unwrap_or(false)
    }

    /// Called after every successful pod create. A tracked image is marked
    /// deployed; an untracked one is resolved and seeded so the NEXT push
    /// of its tag becomes detectable.
    pub async fn note_deployed<I: AsRef<str>>(&self, image: I) {
        let image = image.as_ref();
        let tracked = self.entries.lock().await.contains_key(image);
        if tracked {
            self.mark_deployed(image).await;
            return;
        }
        match self.oracle.resolve(image).await {
            Ok(digest) => self.seed(image, digest).await,
            Err(err) => debug!("could not seed digest for {}: {}", cyan(image), err),
        }
    }

    /// One-shot lookup-and-seed, used at startup for every image already
    /// running in the fleet. Never overwrites an existing entry.
    pub async fn check_and_seed<I: AsRef<str>>(&self, image: I) {
        let image = image.as_ref();
        if self.entries.lock().await.contains_key(image) {
            return;
        }
        match self.oracle.resolve(image).await {
            Ok(digest) => self.seed(image, digest).await,
            Err(err) => warn!("startup digest lookup failed for {}: {}", cyan(image), err),
        }
    }

    /// Re-queries the registry for every tracked image. Lookup failures
    /// leave the entry untouched; a flapping registry must not fabricate or
    /// clear drift.
    pub async fn refresh_images(&self) {
        let images = self.tracked_images().await;
        if images.is_empty() {
            return;
        }
        match self.stalest_refresh().await {
            Some(age) => info!(
                "refreshing registry digests for {} images (stalest entry {:?} old)",
                images.len(),
                age
            ),
            None => info!("refreshing registry digests for {} images", images.len()),
        }
        for image in images {
            match self.oracle.resolve(&image).await {
                Ok(digest) => self.record_registry_digest(&image, digest).await,
                Err(err) => warn!("registry refresh failed for {}: {}", cyan(&image), err),
            }
        }
    }

    pub async fn tracked_images(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// The age of the least recently refreshed entry.
    async fn stalest_refresh(&self) -> Option<std::time::Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .map(|entry| now.duration_since(entry.last_refresh))
            .max()
    }
}
