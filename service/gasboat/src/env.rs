use k8s::PodTemplate;
use log::warn;
use std::env::VarError;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

/// The namespace agent pods are created in, configured under the
/// `NAMESPACE` environment variable. Defaults to `gasboat`.
pub fn namespace() -> String {
    var_or("NAMESPACE", "gasboat")
}

/// The `host:port` of the bead store's HTTP API, configured under
/// `BEADS_HTTP_ADDR`. Defaults to `localhost:8080`.
pub fn beads_http_addr() -> String {
    var_or("BEADS_HTTP_ADDR", "localhost:8080")
}

/// The bead store base URL derived from [beads_http_addr](beads_http_addr).
/// The store speaks plain HTTP inside the cluster.
pub fn beads_base_url() -> String {
    format!("http://{}", beads_http_addr())
}

/// The `host:port` of the bead store's gRPC API, configured under
/// `BEADS_GRPC_ADDR`. The controller itself never dials this; it is handed
/// to agent pods so THEY can. Defaults to `localhost:9090`.
pub fn beads_grpc_addr() -> String {
    var_or("BEADS_GRPC_ADDR", "localhost:9090")
}

/// The default agent container image, configured under `COOP_IMAGE`.
/// Individual beads may override it through their `image` metadata.
pub fn coop_image() -> String {
    var_or("COOP_IMAGE", "ghcr.io/gasboat/coop:latest")
}

/// How often the periodic reconciler runs, configured under
/// `COOP_SYNC_INTERVAL` as a Go-style duration string (`60s`, `5m`).
/// Defaults to sixty seconds; an unparseable value falls back to the
/// default with a warning rather than refusing to start.
pub fn sync_interval() -> Duration {
    const DEFAULT: Duration = Duration::from_secs(60);
    match std::env::var("COOP_SYNC_INTERVAL").and_then(map_empty_to_error) {
        Err(_) => DEFAULT,
        Ok(raw) => match humantime::parse_duration(&raw) {
            Ok(interval) => interval,
            Err(err) => {
                warn!(
                    "COOP_SYNC_INTERVAL value {:?} is not a duration ({}); using {:?}",
                    raw, err, DEFAULT
                );
                DEFAULT
            }
        },
    }
}

/// The maximum number of pod creations allowed in a single reconcile pass,
/// configured under `COOP_BURST_LIMIT`. Defaults to 3.
pub fn burst_limit() -> usize {
    int_or("COOP_BURST_LIMIT", 3)
}

/// The cap on active (non-terminal, desired) pods, configured under
/// `COOP_MAX_PODS`. Zero, the default, means unlimited.
pub fn max_pods() -> usize {
    int_or("COOP_MAX_PODS", 0)
}

/// Whether this process should contend for the leader lease before running
/// the control loop, configured under `ENABLE_LEADER_ELECTION`. Defaults to
/// false, which is only sane for single-replica deployments and local
/// development.
pub fn leader_election_enabled() -> bool {
    matches!(
        std::env::var("ENABLE_LEADER_ELECTION")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// The name of the Lease object contended for, configured under
/// `LEADER_ELECTION_ID`. Defaults to `agents-leader`.
pub fn leader_election_id() -> String {
    var_or("LEADER_ELECTION_ID", "agents-leader")
}

/// The identity this process holds the leader lease under: `POD_NAME` when
/// the downward API provides it, the machine hostname otherwise.
pub fn holder_identity() -> String {
    if let Ok(name) = std::env::var("POD_NAME").and_then(map_empty_to_error) {
        return name;
    }
    hostname().unwrap_or_else(|| "gasboat-controller".to_string())
}

/// The default log filter, configured under `LOG_LEVEL` as one of `debug`,
/// `info`, `warn`, or `error`. An explicit `RUST_LOG` still wins.
pub fn log_level() -> String {
    var_or("LOG_LEVEL", "info")
}

/// The name of the secret injected into every agent pod's environment,
/// configured under `COOP_SECRET_NAME`. Absent or empty means no secret is
/// referenced. Only the pod-spec builder consumes this.
pub fn coop_secret_name() -> Option<String> {
    std::env::var("COOP_SECRET_NAME").and_then(map_empty_to_error).ok()
}

/// The name of the PersistentVolumeClaim mounted into every agent pod as
/// its workspace, configured under `COOP_WORKSPACE_CLAIM`. Absent or empty
/// means agents run without a workspace volume. The claim is consumed by
/// name; provisioning it belongs to the deployment. Only the pod-spec
/// builder consumes this.
pub fn coop_workspace_claim() -> Option<String> {
    std::env::var("COOP_WORKSPACE_CLAIM")
        .and_then(map_empty_to_error)
        .ok()
}

/// The service account agent pods run as, configured under
/// `COOP_SERVICE_ACCOUNT`. Defaults to `default`. Individual beads may
/// override it through their `service_account` metadata.
pub fn coop_service_account() -> String {
    var_or("COOP_SERVICE_ACCOUNT", "default")
}

/// The pod template assembled from the environment, handed to the pod-spec
/// builder alongside each bead.
pub fn pod_template() -> PodTemplate {
    PodTemplate {
        namespace: namespace(),
        image: coop_image(),
        service_account: coop_service_account(),
        beads_http_addr: beads_http_addr(),
        beads_grpc_addr: beads_grpc_addr(),
        secret_name: coop_secret_name(),
        workspace_claim: coop_workspace_claim(),
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .and_then(map_empty_to_error)
        .unwrap_or_else(|_| default.to_string())
}

fn int_or(name: &str, default: usize) -> usize {
    match std::env::var(name).and_then(map_empty_to_error) {
        Err(_) => default,
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("{} value {:?} is not an integer; using {}", name, raw, default);
                default
            }
        },
    }
}

/// If an environment variable is technically present, albeit empty, then we
/// take that to mean that it does not actually exist.
fn map_empty_to_error(var: String) -> std::result::Result<String, VarError> {
    if var.is_empty() {
        Err(VarError::NotPresent)
    } else {
        Ok(var)
    }
}

fn hostname() -> Option<String> {
    if let Ok(name) = std::env::var("HOSTNAME").and_then(map_empty_to_error) {
        return Some(name);
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// A `Secret` obfuscates an underlying string from being accidentally
/// printed to any logs.
///
/// Any attempt to format a `Secret` using either the [Display](Display)
/// ("{}") or [Debug](Debug) ("{:?}") directives will result in the string
/// "<REDACTED>" rather than the underlying value. The original value may be
/// retrieved by requesting a [str](str) reference or by explicitly calling
/// [raw_secret](Secret::raw_secret).
///
/// Note that this guards secret VALUES. Secret NAMES (such as
/// [coop_secret_name](coop_secret_name)) stay plain strings: they are
/// embedded verbatim in pod specs and there is nothing confidential about
/// them.
#[derive(Clone, Default)]
pub struct Secret {
    secret: String,
}

impl Secret {
    pub fn raw_secret(&self) -> &str {
        self.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("<REDACTED>")
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("<REDACTED>")
    }
}

impl From<String> for Secret {
    fn from(secret: String) -> Self {
        Self { secret }
    }
}

impl From<&str> for Secret {
    fn from(secret: &str) -> Self {
        Self::from(secret.to_string())
    }
}

impl AsRef<str> for Secret {
    fn as_ref(&self) -> &str {
        self.secret.as_str()
    }
}
