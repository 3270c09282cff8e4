//! Balloon instances and their lifecycle.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::Serialize;

use balloons_topology::cpuset::CpuSet;
use balloons_topology::system::CoreKind;

/// Lifecycle state of a balloon instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BalloonState {
    /// Pre-created and empty, CPUs reserved.
    Planned,
    /// Hosting at least one container.
    Active,
    /// Was active, currently empty but protected by `minBalloons`.
    Idle,
    /// Empty and about to be destroyed.
    Removing,
}

impl Display for BalloonState {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            BalloonState::Planned => write!(f, "planned"),
            BalloonState::Active => write!(f, "active"),
            BalloonState::Idle => write!(f, "idle"),
            BalloonState::Removing => write!(f, "removing"),
        }
    }
}

/// A named CPU pool with attached containers.
///
/// Primitive balloons own their CPUs exclusively; a composite balloon's CPU
/// set is the union of its components' sets and the composite owns nothing
/// directly.
#[derive(Debug, Clone)]
pub struct Balloon {
    /// `<type>[<instance>]`.
    pub name: String,
    pub btype: String,
    pub instance: usize,
    pub cpus: CpuSet,
    /// One thread per physical core is hidden when the type asks for it.
    pub hidden: CpuSet,
    pub containers: BTreeSet<String>,
    /// Names of component balloons of a composite.
    pub components: Vec<String>,
    /// Set when this balloon exists as a component of a composite; such
    /// balloons never take containers directly.
    pub parent: Option<String>,
    /// `groupBy` key shared by all containers of this balloon.
    pub group_key: Option<String>,
    /// Core-kind preference pinned at creation, from the type or the
    /// triggering container's annotation.
    pub prefer_kind: Option<CoreKind>,
    pub state: BalloonState,
    /// Monotonic creation sequence; pre-created balloons keep their order
    /// across reconfigurations.
    pub created: u64,
}

impl Balloon {
    pub fn new(btype: &str, instance: usize, created: u64) -> Self {
        Self {
            name: format!("{}[{}]", btype, instance),
            btype: btype.to_string(),
            instance,
            cpus: CpuSet::new(),
            hidden: CpuSet::new(),
            containers: BTreeSet::new(),
            components: Vec::new(),
            parent: None,
            group_key: None,
            prefer_kind: None,
            state: BalloonState::Planned,
            created,
        }
    }

    pub fn is_composite(&self) -> bool {
        !self.components.is_empty()
    }

    /// CPUs visible to the balloon's containers, hidden hyperthreads
    /// excluded.
    pub fn visible_cpus(&self) -> CpuSet {
        self.cpus.difference(&self.hidden)
    }

    /// Called when a container joins.
    pub fn on_container_added(&mut self) {
        self.state = BalloonState::Active;
    }

    /// Called when a container leaves; `protected` tells whether the
    /// instance is kept by `minBalloons`.
    pub fn on_container_removed(&mut self, protected: bool) {
        if self.containers.is_empty() {
            self.state = if protected {
                BalloonState::Idle
            } else {
                BalloonState::Removing
            };
        }
    }
}
