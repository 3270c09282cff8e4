//! Runtime plugin interface: lifecycle events in, adjustments and updates
//! out.
//!
//! The wire transport and its framing live outside this crate; transports
//! construct [`RuntimeEvent`]s, call the agent on its loop thread and carry
//! the returned adjustment back to the runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Plugins register with a numeric index that orders them; valid indices
/// are 0 through 99.
#[derive(Debug, Clone)]
pub struct PluginRegistration {
    pub index: u8,
    pub name: String,
}

impl PluginRegistration {
    pub fn new(index: u8, name: impl Into<String>) -> Result<Self> {
        if index > 99 {
            return Err(Error::Fatal(format!("plugin index {} out of range 0-99", index)));
        }
        Ok(Self {
            index,
            name: name.into(),
        })
    }

    /// The runtime sorts plugins by `<index>-<name>`.
    pub fn id(&self) -> String {
        format!("{:02}-{}", self.index, self.name)
    }
}

/// Pod description as delivered by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: String,
    #[serde(default)]
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub qos_class: String,
}

/// Container description as delivered by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    pub pod_id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// CPU request in milli-CPUs.
    #[serde(default)]
    pub cpu_request: u64,
    #[serde(default)]
    pub cpu_limit: u64,
    /// Memory request in bytes.
    #[serde(default)]
    pub mem_request: u64,
}

/// Lifecycle callbacks, in the shape the runtime delivers them.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Configure,
    Synchronize {
        pods: Vec<PodSpec>,
        containers: Vec<ContainerSpec>,
    },
    RunPodSandbox(PodSpec),
    StopPodSandbox {
        pod_id: String,
    },
    RemovePodSandbox {
        pod_id: String,
    },
    CreateContainer(ContainerSpec),
    PostCreateContainer {
        container_id: String,
    },
    StartContainer {
        container_id: String,
    },
    PostStartContainer {
        container_id: String,
    },
    UpdateContainer {
        container_id: String,
        cpu_request: u64,
        cpu_limit: u64,
        mem_request: u64,
    },
    PostUpdateContainer {
        container_id: String,
    },
    StopContainer {
        container_id: String,
    },
    RemoveContainer {
        container_id: String,
    },
}

/// `linux.resources.cpu` of an adjustment or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mems: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxResources {
    pub cpu: LinuxCpu,
}

/// Returned from `CreateContainer`: the masks the runtime applies before
/// the container starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAdjustment {
    pub linux_resources: LinuxResources,
}

/// Unsolicited update for an already created container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerUpdate {
    pub container_id: String,
    pub linux_resources: LinuxResources,
}

/// The plugin-to-runtime direction for unsolicited updates. Implemented by
/// the transport; the agent calls it on the loop thread.
pub trait RuntimeSink {
    fn update_containers(&self, updates: &[ContainerUpdate]) -> Result<()>;
}

/// Logs updates instead of delivering them; the dry-run default.
#[derive(Default)]
pub struct LogRuntimeSink;

impl RuntimeSink for LogRuntimeSink {
    fn update_containers(&self, updates: &[ContainerUpdate]) -> Result<()> {
        for u in updates {
            log::info!(
                target: "nri",
                "update container {}: cpus={:?} mems={:?}",
                u.container_id,
                u.linux_resources.cpu.cpus,
                u.linux_resources.cpu.mems
            );
        }
        Ok(())
    }
}

/// Collects updates for assertions in tests.
#[derive(Default)]
pub struct RecordingRuntimeSink {
    pub updates: std::cell::RefCell<Vec<ContainerUpdate>>,
}

impl RuntimeSink for RecordingRuntimeSink {
    fn update_containers(&self, updates: &[ContainerUpdate]) -> Result<()> {
        self.updates.borrow_mut().extend(updates.iter().cloned());
        Ok(())
    }
}
