//! Per-container `resources.sh` environment export.

use std::fs;
use std::path::Path;

use balloons_policy::core::cache::ContainerInfo;
use balloons_policy::core::policy::PolicySnapshot;
use balloons_topology::cpuset::CpuSet;

use crate::error::{Error, Result};

/// The CPU sets a container sees, split by how exclusively it holds them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerCpuSets {
    /// Idle CPUs shared into the balloon's allowed set.
    pub shared: CpuSet,
    /// Allowed CPUs that are kernel-isolated.
    pub isolated: CpuSet,
    /// The balloon's own visible CPUs.
    pub exclusive: CpuSet,
}

/// Splits a container's allowed CPUs using the policy snapshot.
pub fn container_cpu_sets(snapshot: &PolicySnapshot, container: &ContainerInfo) -> ContainerCpuSets {
    let allowed = match &container.allowed_cpus {
        Some(cpus) => cpus.clone(),
        None => return ContainerCpuSets::default(),
    };
    let balloon = container
        .balloon
        .as_ref()
        .and_then(|name| snapshot.balloons.iter().find(|b| &b.name == name));
    let own = match balloon {
        Some(b) => b.cpus.difference(&b.hidden),
        None => CpuSet::new(),
    };
    ContainerCpuSets {
        shared: allowed.difference(&own),
        isolated: allowed.intersection(&snapshot.isolated_cpus),
        exclusive: allowed.intersection(&own),
    }
}

/// Renders the `resources.sh` content.
pub fn render(sets: &ContainerCpuSets) -> String {
    format!(
        "SHARED_CPUS=\"{}\"\nISOLATED_CPUS=\"{}\"\nEXCLUSIVE_CPUS=\"{}\"\n",
        sets.shared.to_id_list(),
        sets.isolated.to_id_list(),
        sets.exclusive.to_id_list()
    )
}

/// Writes `<dir>/<container-id>/resources.sh`.
pub fn write(dir: &Path, container_id: &str, sets: &ContainerCpuSets) -> Result<()> {
    let target = dir.join(container_id);
    fs::create_dir_all(&target)
        .map_err(|e| Error::TransientIo(format!("cannot create {}: {}", target.display(), e)))?;
    let file = target.join("resources.sh");
    fs::write(&file, render(sets))
        .map_err(|e| Error::TransientIo(format!("cannot write {}: {}", file.display(), e)))
}

/// Removes the export of a gone container.
pub fn remove(dir: &Path, container_id: &str) {
    let target = dir.join(container_id);
    if target.exists() {
        let _ = fs::remove_dir_all(&target);
    }
}
