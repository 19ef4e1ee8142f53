use crate::reporter::{Metrics, MetricsSnapshot};
use rocket::serde::json::Json;
use rocket::{get, routes, Build, Rocket, State};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What `/healthz` answers. Probes only care that it is a 200; humans get
/// the version for free.
#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    version: &'static str,
}

/// What `/version` answers: build metadata plus the non-secret knobs this
/// process was configured with, and the reporter counters.
#[derive(Serialize)]
pub struct BuildInfo {
    name: &'static str,
    version: &'static str,
    namespace: String,
    sync_interval: String,
    metrics: MetricsSnapshot,
}

/// The state the health routes read from.
pub struct HealthState {
    pub namespace: String,
    pub sync_interval: Duration,
    pub metrics: Arc<Metrics>,
}

#[get("/healthz")]
fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: crate::VERSION,
    })
}

#[get("/version")]
fn version(state: &State<HealthState>) -> Json<BuildInfo> {
    Json(BuildInfo {
        name: "gasboat-controller",
        version: crate::VERSION,
        namespace: state.namespace.clone(),
        sync_interval: format!("{:?}", state.sync_interval),
        metrics: state.metrics.snapshot(),
    })
}

/// The health server. Binds 0.0.0.0 because the default of 127.0.0.1 would be
/// unreachable from kubelet probes when running in a container.
pub fn rocket(state: HealthState) -> Rocket<Build> {
    let config = rocket::Config {
        address: "0.0.0.0".parse().expect("static address must parse"),
        ..rocket::Config::default()
    };
    rocket::custom(config)
        .manage(state)
        .mount("/", routes![healthz, version])
}
