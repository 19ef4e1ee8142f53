use crate::types::Coordinates;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// The discriminant of a [LifecycleEvent](LifecycleEvent). The reactor is a
/// total switch over these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// A new agent bead wants a pod.
    Spawn,
    /// The bead was closed; its pod ran to a successful end.
    Done,
    /// The agent must be torn down forcefully.
    Kill,
    /// The agent was asked to stop cleanly.
    Stop,
    /// The agent is wedged and should be restarted in place.
    Stuck,
    /// Bead metadata changed in a way that needs no immediate pod action.
    Update,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Spawn => "spawn",
            EventKind::Done => "done",
            EventKind::Kill => "kill",
            EventKind::Stop => "stop",
            EventKind::Stuck => "stuck",
            EventKind::Update => "update",
        };
        f.write_str(name)
    }
}

/// A `LifecycleEvent` is one decoded mutation of an agent bead, as delivered
/// by the event stream. Events for one bead are delivered in stream order;
/// the reactor relies on that.
#[derive(Clone, Debug)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub bead_id: String,
    pub coords: Coordinates,
    pub metadata: HashMap<String, String>,
}

impl LifecycleEvent {
    /// The canonical name of the pod this event concerns.
    pub fn pod_name(&self) -> String {
        self.coords.pod_name()
    }
}
