pub mod client;
pub mod event;
pub mod stream;
pub mod types;

pub use client::{BeadClient, BeadStore};
pub use event::{EventKind, LifecycleEvent};
pub use stream::EventStream;
pub use types::{AgentBead, Bead, Coordinates};

/// The bead type whose records this controller turns into pods. Every other
/// bead type flowing over the store or its event stream is ignored.
pub const AGENT_BEAD_TYPE: &str = "agent";

/// Well-known keys inside a bead's opaque metadata map.
pub mod meta {
    pub const AGENT_STATE: &str = "agent_state";
    pub const IMAGE: &str = "image";
    pub const MOCK_SCENARIO: &str = "mock_scenario";
    pub const NAMESPACE: &str = "namespace";
    pub const SERVICE_ACCOUNT: &str = "service_account";
    pub const STOP_REQUESTED: &str = "stop_requested";
}
