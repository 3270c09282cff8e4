//! Balloons policy configuration (YAML-serializable).

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use balloons_topology::cpuset::CpuSet;
use balloons_topology::system::{CoreKind, MemType};

use crate::core::error::Error;
use crate::core::expression::Expression;

/// Name of the built-in balloon type holding unmatched containers.
pub const DEFAULT_TYPE: &str = "default";
/// Name of the built-in balloon type for reserved-namespace containers.
pub const RESERVED_TYPE: &str = "reserved";
/// Namespace that is reserved unconditionally.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Topology locality levels used by idle-CPU sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareScope {
    Core,
    L2cache,
    Numa,
    Die,
    Package,
    System,
}

/// Topology level of a load class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    Core,
    L2cache,
}

/// How a composite balloon instantiates its components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentCreation {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "balance-balloons")]
    BalanceBalloons,
}

impl Default for ComponentCreation {
    fn default() -> Self {
        ComponentCreation::All
    }
}

/// Per-CPU tuning parameters, referenced by name from balloon types and from
/// the policy-wide idle class. Frequencies are in kHz.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuClass {
    #[serde(default)]
    pub min_freq: Option<u64>,
    #[serde(default)]
    pub max_freq: Option<u64>,
    #[serde(default)]
    pub uncore_min_freq: Option<u64>,
    #[serde(default)]
    pub uncore_max_freq: Option<u64>,
    #[serde(default)]
    pub disabled_idle_states: Vec<String>,
}

/// A symbolic contention class: balloon types declaring the same load avoid
/// sharing a topology unit of the given level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadClass {
    pub name: String,
    pub level: LoadLevel,
    #[serde(default)]
    pub overloads_level_in_balloon: bool,
}

/// Reference to a component balloon type of a composite type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub balloon_type: String,
}

/// Declarative configuration of one balloon type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalloonType {
    pub name: String,
    /// Floor for balloon size in CPUs, `-1` together with `maxCPUs: -1`
    /// marks the type unconstructible.
    #[serde(default, rename = "minCPUs")]
    pub min_cpus: i64,
    /// Size cap in CPUs; `0` means unlimited, `-1` unconstructible.
    #[serde(default, rename = "maxCPUs")]
    pub max_cpus: i64,
    #[serde(default)]
    pub min_balloons: usize,
    /// `0` means unlimited.
    #[serde(default)]
    pub max_balloons: usize,
    #[serde(default)]
    pub cpu_class: Option<String>,
    #[serde(default, rename = "pinCPU")]
    pub pin_cpu: Option<bool>,
    #[serde(default)]
    pub pin_memory: Option<bool>,
    #[serde(default)]
    pub memory_types: Vec<MemType>,
    /// Glob patterns of namespaces assigned to this type.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub match_expressions: Vec<Expression>,
    /// Interpolated per container; containers with different keys never
    /// share a balloon of this type.
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub prefer_new_balloons: bool,
    #[serde(default)]
    pub prefer_per_namespace_balloon: bool,
    #[serde(default)]
    pub prefer_spread_pods: bool,
    #[serde(default)]
    pub prefer_isolated_cpus: bool,
    #[serde(default)]
    pub prefer_close_to_devices: Vec<String>,
    #[serde(default)]
    pub prefer_core_type: Option<CoreKind>,
    #[serde(default)]
    pub hide_hyperthreads: bool,
    #[serde(default)]
    pub prefer_spread_on_physical_cores: bool,
    #[serde(default, rename = "shareIdleCPUsInSame")]
    pub share_idle_cpus_in_same: Option<ShareScope>,
    /// Load classes this type contends on.
    #[serde(default)]
    pub loads: Vec<String>,
    /// Component types of a composite type.
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub component_creation: ComponentCreation,
}

impl BalloonType {
    pub fn is_composite(&self) -> bool {
        !self.components.is_empty()
    }

    /// A type with `maxCPUs: -1` rejects every container that would land in
    /// it.
    pub fn is_unconstructible(&self) -> bool {
        self.max_cpus < 0
    }

    pub fn effective_min_cpus(&self) -> usize {
        self.min_cpus.max(0) as usize
    }

    /// Size cap, `None` when unconstructible.
    pub fn effective_max_cpus(&self, system_cpus: usize) -> Option<usize> {
        match self.max_cpus {
            0 => Some(system_cpus),
            n if n > 0 => Some(n as usize),
            _ => None,
        }
    }

    pub fn effective_max_balloons(&self) -> usize {
        if self.max_balloons == 0 {
            usize::MAX
        } else {
            self.max_balloons
        }
    }

    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// The built-in `default` type catching unmatched containers.
    pub fn builtin_default() -> Self {
        Self::named(DEFAULT_TYPE)
    }

    /// The built-in `reserved` type for system namespaces.
    pub fn builtin_reserved() -> Self {
        let mut t = Self::named(RESERVED_TYPE);
        t.min_balloons = 1;
        t.max_balloons = 1;
        t
    }
}

/// CPU amount in `reservedResources` / `availableResources`: either an
/// explicit cpuset (`cpuset:0-3`) or a quantity (`750m`, `2`).
#[derive(Debug, Clone, PartialEq)]
pub enum CpuAmount {
    Cpuset(CpuSet),
    Milli(u64),
}

impl CpuAmount {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("cpuset:") {
            let set: CpuSet = rest
                .parse()
                .map_err(|e| Error::InvalidConfiguration(format!("bad cpuset {:?}: {}", rest, e)))?;
            return Ok(CpuAmount::Cpuset(set));
        }
        if let Some(milli) = s.strip_suffix('m') {
            let v: u64 = milli
                .parse()
                .map_err(|_| Error::InvalidConfiguration(format!("bad cpu quantity {:?}", s)))?;
            return Ok(CpuAmount::Milli(v));
        }
        let v: u64 = s
            .parse()
            .map_err(|_| Error::InvalidConfiguration(format!("bad cpu quantity {:?}", s)))?;
        Ok(CpuAmount::Milli(v * 1000))
    }
}

impl Display for CpuAmount {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CpuAmount::Cpuset(set) => write!(f, "cpuset:{}", set),
            CpuAmount::Milli(v) => write!(f, "{}m", v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservedResources {
    #[serde(default)]
    pub cpu: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvailableResources {
    #[serde(default)]
    pub cpu: Option<String>,
}

/// Containers matching any of these expressions keep whatever pinning they
/// already have.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreserveSpec {
    #[serde(default)]
    pub match_expressions: Vec<Expression>,
}

/// The complete policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalloonsConfig {
    #[serde(default)]
    pub balloon_types: Vec<BalloonType>,
    #[serde(default)]
    pub cpu_classes: IndexMap<String, CpuClass>,
    #[serde(default)]
    pub load_classes: Vec<LoadClass>,
    #[serde(default)]
    pub reserved_resources: ReservedResources,
    #[serde(default)]
    pub available_resources: AvailableResources,
    /// Namespace globs assigned to the reserved balloon; the system
    /// namespace is reserved even when this list is empty.
    #[serde(default)]
    pub reserved_pool_namespaces: Vec<String>,
    #[serde(default = "default_true", rename = "pinCPU")]
    pub pin_cpu: bool,
    #[serde(default = "default_true")]
    pub pin_memory: bool,
    #[serde(default, rename = "idleCPUClass")]
    pub idle_cpu_class: Option<String>,
    #[serde(default)]
    pub allocator_topology_balancing: bool,
    #[serde(default)]
    pub preserve: Option<PreserveSpec>,
}

fn default_true() -> bool {
    true
}

impl Default for BalloonsConfig {
    fn default() -> Self {
        Self {
            balloon_types: Vec::new(),
            cpu_classes: IndexMap::new(),
            load_classes: Vec::new(),
            reserved_resources: ReservedResources::default(),
            available_resources: AvailableResources::default(),
            reserved_pool_namespaces: Vec::new(),
            pin_cpu: true,
            pin_memory: true,
            idle_cpu_class: None,
            allocator_topology_balancing: false,
            preserve: None,
        }
    }
}

impl BalloonsConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: BalloonsConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfiguration(format!("cannot read {}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn balloon_type(&self, name: &str) -> Option<&BalloonType> {
        self.balloon_types.iter().find(|t| t.name == name)
    }

    pub fn load_class(&self, name: &str) -> Option<&LoadClass> {
        self.load_classes.iter().find(|l| l.name == name)
    }

    /// Checks the declarative invariants; a failing configuration is
    /// rejected before it can touch any policy state.
    pub fn validate(&self) -> Result<(), Error> {
        let mut names = BTreeSet::new();
        for t in &self.balloon_types {
            if t.name.is_empty() {
                return Err(Error::InvalidConfiguration("balloon type with empty name".to_string()));
            }
            if t.name.contains('[') || t.name.contains(']') {
                return Err(Error::InvalidConfiguration(format!(
                    "balloon type name {:?} must not contain brackets",
                    t.name
                )));
            }
            if !names.insert(t.name.clone()) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicate balloon type {:?}",
                    t.name
                )));
            }
            if let Some(class) = &t.cpu_class {
                if !self.cpu_classes.contains_key(class) {
                    return Err(Error::InvalidConfiguration(format!(
                        "balloon type {:?} refers to unknown cpu class {:?}",
                        t.name, class
                    )));
                }
            }
            for load in &t.loads {
                if self.load_class(load).is_none() {
                    return Err(Error::InvalidConfiguration(format!(
                        "balloon type {:?} refers to unknown load class {:?}",
                        t.name, load
                    )));
                }
            }
            if t.max_cpus > 0 && t.min_cpus > t.max_cpus {
                return Err(Error::InvalidConfiguration(format!(
                    "balloon type {:?}: minCPUs {} above maxCPUs {}",
                    t.name, t.min_cpus, t.max_cpus
                )));
            }
            if t.max_balloons > 0 && t.min_balloons > t.max_balloons {
                return Err(Error::InvalidConfiguration(format!(
                    "balloon type {:?}: minBalloons {} above maxBalloons {}",
                    t.name, t.min_balloons, t.max_balloons
                )));
            }
        }
        if let Some(class) = &self.idle_cpu_class {
            if !self.cpu_classes.contains_key(class) {
                return Err(Error::InvalidConfiguration(format!(
                    "unknown idle cpu class {:?}",
                    class
                )));
            }
        }
        if let Some(cpu) = &self.reserved_resources.cpu {
            CpuAmount::parse(cpu)?;
        }
        if let Some(cpu) = &self.available_resources.cpu {
            match CpuAmount::parse(cpu)? {
                CpuAmount::Cpuset(_) => {}
                CpuAmount::Milli(_) => {
                    return Err(Error::InvalidConfiguration(
                        "availableResources.cpu must be an explicit cpuset".to_string(),
                    ))
                }
            }
        }
        self.validate_components()?;
        Ok(())
    }

    fn validate_components(&self) -> Result<(), Error> {
        for t in &self.balloon_types {
            for component in &t.components {
                if self.balloon_type(&component.balloon_type).is_none() {
                    return Err(Error::InvalidConfiguration(format!(
                        "composite type {:?} refers to unknown component type {:?}",
                        t.name, component.balloon_type
                    )));
                }
            }
            // reject component cycles
            let mut stack = vec![t.name.clone()];
            let mut seen = BTreeSet::new();
            while let Some(name) = stack.pop() {
                if !seen.insert(name.clone()) {
                    continue;
                }
                let Some(ct) = self.balloon_type(&name) else { continue };
                for component in &ct.components {
                    if component.balloon_type == t.name {
                        return Err(Error::InvalidConfiguration(format!(
                            "component cycle through balloon type {:?}",
                            t.name
                        )));
                    }
                    stack.push(component.balloon_type.clone());
                }
            }
        }
        Ok(())
    }
}
