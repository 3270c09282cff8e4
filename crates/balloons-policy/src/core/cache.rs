//! Authoritative map of pods, containers and their resource decisions.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use balloons_topology::cpuset::CpuSet;

/// Container lifecycle state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Removed,
}

#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub id: String,
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub qos_class: String,
}

/// One container and the decisions currently applied to it.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub pod_id: String,
    pub name: String,
    pub state: ContainerState,
    /// CPU request in milli-CPUs.
    pub cpu_request: u64,
    /// CPU limit in milli-CPUs, 0 when unlimited.
    pub cpu_limit: u64,
    /// Memory request in bytes.
    pub mem_request: u64,
    pub labels: BTreeMap<String, String>,
    /// Free-form tags attached by the policy.
    pub tags: BTreeMap<String, String>,
    pub qos_class: String,
    /// Owning balloon, `None` before assignment and for preserved
    /// containers.
    pub balloon: Option<String>,
    pub allowed_cpus: Option<CpuSet>,
    pub allowed_mems: Option<Vec<usize>>,
    pub preserve: bool,
}

impl ContainerInfo {
    pub fn new(id: impl Into<String>, pod_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pod_id: pod_id.into(),
            name: name.into(),
            state: ContainerState::Created,
            cpu_request: 0,
            cpu_limit: 0,
            mem_request: 0,
            labels: BTreeMap::new(),
            tags: BTreeMap::new(),
            qos_class: String::new(),
            balloon: None,
            allowed_cpus: None,
            allowed_mems: None,
            preserve: false,
        }
    }

    /// Kubernetes-style QoS class derived from requests and limits.
    pub fn derive_qos_class(&self) -> &'static str {
        if self.cpu_request > 0 && self.cpu_request == self.cpu_limit {
            "Guaranteed"
        } else if self.cpu_request > 0 || self.cpu_limit > 0 {
            "Burstable"
        } else {
            "BestEffort"
        }
    }
}

/// In-memory source of truth for every policy decision.
///
/// The cache is owned by the event loop; every mutation happens between two
/// events, so readers always observe a consistent snapshot.
#[derive(Clone, Default)]
pub struct Cache {
    pods: BTreeMap<String, PodInfo>,
    containers: BTreeMap<String, ContainerInfo>,
    /// Containers whose applied decision changed since the last drain.
    pending: BTreeSet<String>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pod(&mut self, pod: PodInfo) {
        self.pods.insert(pod.id.clone(), pod);
    }

    /// Removes the pod and all of its containers; returns the removed
    /// container ids.
    pub fn remove_pod(&mut self, pod_id: &str) -> Vec<String> {
        self.pods.remove(pod_id);
        let ids: Vec<String> = self
            .containers
            .values()
            .filter(|c| c.pod_id == pod_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            self.containers.remove(id);
            self.pending.remove(id);
        }
        ids
    }

    pub fn pod(&self, pod_id: &str) -> Option<&PodInfo> {
        self.pods.get(pod_id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodInfo> {
        self.pods.values()
    }

    pub fn insert_container(&mut self, mut container: ContainerInfo) {
        if container.qos_class.is_empty() {
            container.qos_class = container.derive_qos_class().to_string();
        }
        self.containers.insert(container.id.clone(), container);
    }

    pub fn remove_container(&mut self, id: &str) -> Option<ContainerInfo> {
        self.pending.remove(id);
        self.containers.remove(id)
    }

    pub fn container(&self, id: &str) -> Option<&ContainerInfo> {
        self.containers.get(id)
    }

    pub fn container_mut(&mut self, id: &str) -> Option<&mut ContainerInfo> {
        self.containers.get_mut(id)
    }

    pub fn containers(&self) -> impl Iterator<Item = &ContainerInfo> {
        self.containers.values()
    }

    /// Containers the policy actively manages.
    pub fn active_containers(&self) -> impl Iterator<Item = &ContainerInfo> {
        self.containers
            .values()
            .filter(|c| matches!(c.state, ContainerState::Created | ContainerState::Running))
    }

    pub fn containers_of_pod(&self, pod_id: &str) -> Vec<String> {
        self.containers
            .values()
            .filter(|c| c.pod_id == pod_id)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn set_state(&mut self, id: &str, state: ContainerState) {
        if let Some(c) = self.containers.get_mut(id) {
            c.state = state;
        }
    }

    /// Records a new applied decision and marks the container for a runtime
    /// update if the decision actually changed.
    pub fn record_decision(
        &mut self,
        id: &str,
        balloon: Option<String>,
        cpus: Option<CpuSet>,
        mems: Option<Vec<usize>>,
    ) {
        let Some(c) = self.containers.get_mut(id) else { return };
        let changed = c.allowed_cpus != cpus || c.allowed_mems != mems;
        c.balloon = balloon;
        c.allowed_cpus = cpus;
        c.allowed_mems = mems;
        if changed {
            self.pending.insert(id.to_string());
        }
    }

    /// Clears the pending mark of a container whose decision was just
    /// delivered synchronously (a create adjustment).
    pub fn clear_pending(&mut self, id: &str) {
        self.pending.remove(id);
    }

    /// Drains the set of containers whose decision must be pushed to the
    /// runtime.
    pub fn take_pending(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.pending.iter().cloned().collect();
        self.pending.clear();
        ids
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
