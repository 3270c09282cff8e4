//! Immutable model of the host CPU and memory topology.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;
use crate::error::Error;
use crate::sst::{derive_priorities, SstPackageInfo};

/// Core kind on hybrid systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreKind {
    Performance,
    Efficient,
}

impl Display for CoreKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CoreKind::Performance => write!(f, "performance"),
            CoreKind::Efficient => write!(f, "efficient"),
        }
    }
}

/// Symbolic CPU priority derived from hardware hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuPriority {
    High,
    Normal,
    Low,
}

impl CpuPriority {
    /// Numeric rank, higher is better.
    pub fn rank(&self) -> u32 {
        match self {
            CpuPriority::High => 2,
            CpuPriority::Normal => 1,
            CpuPriority::Low => 0,
        }
    }
}

impl Display for CpuPriority {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CpuPriority::High => write!(f, "high"),
            CpuPriority::Normal => write!(f, "normal"),
            CpuPriority::Low => write!(f, "low"),
        }
    }
}

/// NUMA memory node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemType {
    Dram,
    Pmem,
    Hbm,
}

impl Display for MemType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            MemType::Dram => write!(f, "DRAM"),
            MemType::Pmem => write!(f, "PMEM"),
            MemType::Hbm => write!(f, "HBM"),
        }
    }
}

/// A single hardware thread and its coordinates.
#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub id: usize,
    pub package: usize,
    pub die: usize,
    pub cluster: usize,
    /// NUMA node, resolved from the node cpu lists.
    pub node: usize,
    /// Core id as reported by the platform, unique within a package.
    pub core: usize,
    /// All threads of this CPU's physical core, including the CPU itself.
    pub siblings: CpuSet,
    pub min_freq: u64,
    pub max_freq: u64,
    pub base_freq: u64,
    /// Energy-performance preference, lower means more performance.
    pub epp: Option<u64>,
    pub idle_states: Vec<String>,
    pub kind: CoreKind,
    pub online: bool,
    pub isolated: bool,
    pub priority: CpuPriority,
}

/// A NUMA memory node.
#[derive(Debug, Clone)]
pub struct MemNodeInfo {
    pub id: usize,
    pub mem_type: MemType,
    /// Total capacity in bytes.
    pub capacity: u64,
    pub cpus: CpuSet,
    /// Distance to every node, indexed by node id order.
    pub distance: BTreeMap<usize, u64>,
}

/// Hybrid core-kind labeling as reported by the platform.
///
/// `None` means the platform did not report that kind at all.
#[derive(Debug, Clone, Default)]
pub struct HybridKinds {
    pub performance: Option<CpuSet>,
    pub efficient: Option<CpuSet>,
}

/// Immutable description of the host, created once at startup.
///
/// All references between levels go downward (package -> die -> cluster ->
/// core -> thread); CPUs refer back to their containers by integer ids only.
pub struct System {
    cpus: BTreeMap<usize, CpuInfo>,
    packages: BTreeMap<usize, CpuSet>,
    dies: BTreeMap<(usize, usize), CpuSet>,
    clusters: BTreeMap<(usize, usize, usize), CpuSet>,
    /// Physical cores keyed by their smallest CPU id.
    cores: BTreeMap<usize, CpuSet>,
    nodes: BTreeMap<usize, MemNodeInfo>,
    hybrid: bool,
}

impl System {
    /// Builds the model from per-CPU data, NUMA nodes, hybrid labeling and
    /// per-package SST state. Resolves core kinds, NUMA membership and CPU
    /// priorities, and validates the topology.
    pub fn new(
        mut cpus: Vec<CpuInfo>,
        nodes: Vec<MemNodeInfo>,
        hybrid: HybridKinds,
        sst: BTreeMap<usize, SstPackageInfo>,
    ) -> Result<Self, Error> {
        let all: CpuSet = cpus.iter().map(|c| c.id).collect();

        let is_hybrid = resolve_kinds(&mut cpus, &hybrid, &all)?;

        let mut node_of = BTreeMap::new();
        for node in &nodes {
            for cpu in node.cpus.iter() {
                if node_of.insert(cpu, node.id).is_some() {
                    return Err(Error::Inconsistent(format!(
                        "cpu {} listed in more than one NUMA node",
                        cpu
                    )));
                }
            }
        }
        for cpu in cpus.iter_mut() {
            match node_of.get(&cpu.id) {
                Some(node) => cpu.node = *node,
                None => {
                    return Err(Error::Inconsistent(format!(
                        "cpu {} belongs to no NUMA node",
                        cpu.id
                    )))
                }
            }
        }

        let mut by_id: BTreeMap<usize, CpuInfo> = BTreeMap::new();
        for cpu in cpus {
            if !cpu.siblings.contains(cpu.id) {
                return Err(Error::Inconsistent(format!(
                    "cpu {} missing from its own sibling set {}",
                    cpu.id, cpu.siblings
                )));
            }
            if by_id.insert(cpu.id, cpu).is_some() {
                return Err(Error::Inconsistent("duplicate cpu id".to_string()));
            }
        }

        derive_priorities(&mut by_id, &sst);

        let mut packages: BTreeMap<usize, CpuSet> = BTreeMap::new();
        let mut dies: BTreeMap<(usize, usize), CpuSet> = BTreeMap::new();
        let mut clusters: BTreeMap<(usize, usize, usize), CpuSet> = BTreeMap::new();
        let mut cores: BTreeMap<usize, CpuSet> = BTreeMap::new();
        for cpu in by_id.values() {
            packages.entry(cpu.package).or_default().insert(cpu.id);
            dies.entry((cpu.package, cpu.die)).or_default().insert(cpu.id);
            clusters
                .entry((cpu.package, cpu.die, cpu.cluster))
                .or_default()
                .insert(cpu.id);
            let core_key = cpu.siblings.first().unwrap_or(cpu.id);
            cores.entry(core_key).or_default().insert(cpu.id);
        }

        Ok(Self {
            cpus: by_id,
            packages,
            dies,
            clusters,
            cores,
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            hybrid: is_hybrid,
        })
    }

    pub fn cpu(&self, id: usize) -> &CpuInfo {
        &self.cpus[&id]
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_hybrid(&self) -> bool {
        self.hybrid
    }

    /// All CPU ids, online or not.
    pub fn all_cpus(&self) -> CpuSet {
        self.cpus.keys().copied().collect()
    }

    pub fn online_cpus(&self) -> CpuSet {
        self.cpus.values().filter(|c| c.online).map(|c| c.id).collect()
    }

    pub fn isolated_cpus(&self) -> CpuSet {
        self.cpus.values().filter(|c| c.isolated).map(|c| c.id).collect()
    }

    pub fn package_ids(&self) -> Vec<usize> {
        self.packages.keys().copied().collect()
    }

    pub fn package_cpus(&self, package: usize) -> CpuSet {
        self.packages.get(&package).cloned().unwrap_or_default()
    }

    pub fn die_ids(&self) -> Vec<(usize, usize)> {
        self.dies.keys().copied().collect()
    }

    pub fn die_cpus(&self, package: usize, die: usize) -> CpuSet {
        self.dies.get(&(package, die)).cloned().unwrap_or_default()
    }

    /// Cluster keys `(package, die, cluster)` in id order.
    pub fn cluster_ids(&self) -> Vec<(usize, usize, usize)> {
        self.clusters.keys().copied().collect()
    }

    pub fn cluster_cpus(&self, key: (usize, usize, usize)) -> CpuSet {
        self.clusters.get(&key).cloned().unwrap_or_default()
    }

    /// Physical cores as sibling sets, ordered by smallest CPU id.
    pub fn cores(&self) -> Vec<CpuSet> {
        self.cores.values().cloned().collect()
    }

    /// The thread set of the physical core owning `cpu`.
    pub fn core_siblings(&self, cpu: usize) -> CpuSet {
        self.cpus[&cpu].siblings.clone()
    }

    pub fn package_of(&self, cpu: usize) -> usize {
        self.cpus[&cpu].package
    }

    pub fn node_of(&self, cpu: usize) -> usize {
        self.cpus[&cpu].node
    }

    /// Uncore frequency zones are per (package, die).
    pub fn uncore_zone_of(&self, cpu: usize) -> (usize, usize) {
        let c = &self.cpus[&cpu];
        (c.package, c.die)
    }

    pub fn node_ids(&self) -> Vec<usize> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: usize) -> &MemNodeInfo {
        &self.nodes[&id]
    }

    pub fn node_cpus(&self, id: usize) -> CpuSet {
        self.nodes.get(&id).map(|n| n.cpus.clone()).unwrap_or_default()
    }

    /// CPUs carrying the given derived priority.
    pub fn prio_cpus(&self, prio: CpuPriority) -> CpuSet {
        self.cpus
            .values()
            .filter(|c| c.priority == prio)
            .map(|c| c.id)
            .collect()
    }

    pub fn kind_cpus(&self, kind: CoreKind) -> CpuSet {
        self.cpus.values().filter(|c| c.kind == kind).map(|c| c.id).collect()
    }

    /// Keeps the lowest-id thread of every physical core present in `cpus`.
    pub fn pick_one_thread_per_core(&self, cpus: &CpuSet) -> CpuSet {
        let mut picked = CpuSet::new();
        for cpu in cpus.iter() {
            let own = self.cpus[&cpu].siblings.intersection(cpus);
            if own.first() == Some(cpu) {
                picked.insert(cpu);
            }
        }
        picked
    }

    /// NUMA nodes the given CPUs belong to, in id order.
    pub fn closest_nodes(&self, cpus: &CpuSet) -> Vec<usize> {
        let mut out: Vec<usize> = Vec::new();
        for cpu in cpus.iter() {
            let node = self.cpus[&cpu].node;
            if !out.contains(&node) {
                out.push(node);
            }
        }
        out.sort_unstable();
        out
    }

    /// Memory nodes for a CPU set, honoring a memory-type restriction.
    ///
    /// Starts from the nodes local to `cpus`. With no type restriction the
    /// local nodes are returned as-is. Otherwise nodes of unwanted types are
    /// dropped, and for every requested type absent from the local set the
    /// closest node of that type (by minimum distance from any local node)
    /// is pulled in.
    pub fn closest_nodes_with_types(&self, cpus: &CpuSet, types: &[MemType]) -> Vec<usize> {
        let local = self.closest_nodes(cpus);
        if types.is_empty() || local.is_empty() {
            return local;
        }
        let mut out: Vec<usize> = local
            .iter()
            .copied()
            .filter(|id| types.contains(&self.nodes[id].mem_type))
            .collect();
        for mem_type in types {
            if out.iter().any(|id| self.nodes[id].mem_type == *mem_type) {
                continue;
            }
            let mut best: Option<(u64, usize)> = None;
            for node in self.nodes.values() {
                if node.mem_type != *mem_type {
                    continue;
                }
                let dist = local
                    .iter()
                    .filter_map(|from| self.nodes[from].distance.get(&node.id))
                    .min()
                    .copied()
                    .unwrap_or(u64::MAX);
                if best.map_or(true, |(d, id)| (dist, node.id) < (d, id)) {
                    best = Some((dist, node.id));
                }
            }
            if let Some((_, id)) = best {
                out.push(id);
            }
        }
        out.sort_unstable();
        out
    }
}

/// Applies the hybrid labeling rules: with a single reported kind the
/// unlabeled cores become the complementary kind; overlapping or
/// thread-splitting labels are fatal.
fn resolve_kinds(cpus: &mut [CpuInfo], hybrid: &HybridKinds, all: &CpuSet) -> Result<bool, Error> {
    let (perf, eff) = match (&hybrid.performance, &hybrid.efficient) {
        (None, None) => return set_kinds(cpus, &CpuSet::new()),
        (Some(p), None) => (p.clone(), all.difference(p)),
        (None, Some(e)) => (all.difference(e), e.clone()),
        (Some(p), Some(e)) => {
            if !p.is_disjoint(e) {
                return Err(Error::Inconsistent(format!(
                    "core kinds overlap on {}",
                    p.intersection(e)
                )));
            }
            let union = p.union(e);
            if union != *all {
                return Err(Error::Inconsistent(format!(
                    "cpus {} have no core kind",
                    all.difference(&union)
                )));
            }
            (p.clone(), e.clone())
        }
    };
    for cpu in cpus.iter() {
        let in_perf = cpu.siblings.intersection(&perf);
        if !in_perf.is_empty() && in_perf != cpu.siblings {
            return Err(Error::Inconsistent(format!(
                "threads of core {} split across core kinds",
                cpu.siblings
            )));
        }
    }
    set_kinds(cpus, &eff)
}

fn set_kinds(cpus: &mut [CpuInfo], eff: &CpuSet) -> Result<bool, Error> {
    for cpu in cpus.iter_mut() {
        cpu.kind = if eff.contains(cpu.id) {
            CoreKind::Efficient
        } else {
            CoreKind::Performance
        };
    }
    Ok(!eff.is_empty())
}
