pub mod client;
pub mod errors;
pub mod fleet;
pub mod lease;
pub mod pod;

pub use fleet::{KubeFleet, PodFleet};
pub use lease::{LeaderState, LeaseLock, LeaseLockParams};
pub use pod::{PodExt, PodTemplate};

/// The label that scopes a pod into this controller's fleet. A pod belongs
/// to the fleet iff it carries this label AND an [agent](AGENT_LABEL) label.
pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "gasboat-agent";

/// The coordinate labels stamped onto every agent pod.
pub const PROJECT_LABEL: &str = "project";
pub const ROLE_LABEL: &str = "role";
pub const AGENT_LABEL: &str = "agent";
pub const MODE_LABEL: &str = "mode";

/// The annotation carrying the id of the bead a pod was created for.
pub const BEAD_ID_ANNOTATION: &str = "gasboat.dev/bead-id";

/// The name of the agent container inside every fleet pod.
pub const AGENT_CONTAINER: &str = "coop";

/// The port the agent container conventionally listens on.
pub const COOP_PORT: i32 = 8080;

/// The label selector matching every pod this controller may touch.
pub fn fleet_selector() -> String {
    format!("{}={}", APP_LABEL, APP_LABEL_VALUE)
}
