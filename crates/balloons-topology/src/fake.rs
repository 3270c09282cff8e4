//! In-memory system builder for tests.
//!
//! Builds arbitrary host topologies without a sysfs tree, including the
//! canonical two-socket test machine used across the policy tests:
//! 2 packages, 4 NUMA nodes, 40 cores / 80 threads, package 0 owning CPUs
//! {0-19,40-59}, package 1 owning {20-39,60-79}, the threads of core `c`
//! being `{c, c+40}`.

use std::collections::BTreeMap;

use crate::cpuset::CpuSet;
use crate::error::Error;
use crate::sst::SstPackageInfo;
use crate::system::{CoreKind, CpuInfo, CpuPriority, HybridKinds, MemNodeInfo, MemType, System};

const DEFAULT_BASE_FREQ: u64 = 2_400_000;
const DEFAULT_NODE_CAPACITY: u64 = 32 * 1024 * 1024 * 1024;

pub struct FakeSystem {
    cpus: Vec<CpuInfo>,
    node_types: BTreeMap<usize, MemType>,
    node_capacities: BTreeMap<usize, u64>,
    distances: BTreeMap<(usize, usize), u64>,
    efficient: CpuSet,
    isolated: CpuSet,
    sst: BTreeMap<usize, SstPackageInfo>,
    cluster_run_len: Option<usize>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self {
            cpus: Vec::new(),
            node_types: BTreeMap::new(),
            node_capacities: BTreeMap::new(),
            distances: BTreeMap::new(),
            efficient: CpuSet::new(),
            isolated: CpuSet::new(),
            sst: BTreeMap::new(),
            cluster_run_len: None,
        }
    }

    /// The canonical two-socket test machine described above, one die per
    /// package, cores 0-9 of a package on its first NUMA node, 10-19 on the
    /// second.
    pub fn canonical() -> Self {
        let mut fake = Self::new();
        for core in 0..40usize {
            let package = core / 20;
            let node = core / 10;
            fake.add_core(package, 0, 0, node, core % 20, &[core, core + 40]);
        }
        fake
    }

    /// The canonical machine with every package's CPU ids grouped into
    /// clusters of `threads` consecutive ids, as the cluster-placement tests
    /// expect (`{0-3},{4-7},...` on package 0).
    pub fn canonical_clustered(threads: usize) -> Self {
        let mut fake = Self::canonical();
        fake.cluster_run_len = Some(threads);
        fake
    }

    /// A single-package hybrid machine: 16 hyperthreaded P-cores (threads
    /// `{c, c+20}`) and the single-threaded E-core cluster {16-19}.
    pub fn hybrid() -> Self {
        let mut fake = Self::new();
        for core in 0..16usize {
            fake.add_core(0, 0, 0, 0, core, &[core, core + 20]);
        }
        for core in 16..20usize {
            fake.add_core(0, 0, 1, 0, core, &[core]);
        }
        let ecores = CpuSet::range(16, 19);
        fake.set_base_freq(&CpuSet::range(0, 15), 3_000_000);
        fake.set_base_freq(&CpuSet::range(20, 35), 3_000_000);
        fake.set_base_freq(&ecores, 2_000_000);
        fake.mark_efficient(&ecores);
        fake
    }

    /// Adds one physical core; `threads` lists its CPU ids.
    pub fn add_core(
        &mut self,
        package: usize,
        die: usize,
        cluster: usize,
        node: usize,
        core: usize,
        threads: &[usize],
    ) -> &mut Self {
        let siblings: CpuSet = threads.iter().copied().collect();
        for id in threads {
            self.cpus.push(CpuInfo {
                id: *id,
                package,
                die,
                cluster,
                node,
                core,
                siblings: siblings.clone(),
                min_freq: 400_000,
                max_freq: 3_800_000,
                base_freq: DEFAULT_BASE_FREQ,
                epp: None,
                idle_states: vec!["POLL".to_string(), "C1".to_string(), "C6".to_string()],
                kind: CoreKind::Performance,
                online: true,
                isolated: false,
                priority: CpuPriority::Normal,
            });
        }
        self
    }

    pub fn set_node_type(&mut self, node: usize, mem_type: MemType) -> &mut Self {
        self.node_types.insert(node, mem_type);
        self
    }

    pub fn set_node_capacity(&mut self, node: usize, capacity: u64) -> &mut Self {
        self.node_capacities.insert(node, capacity);
        self
    }

    /// Adds a CPU-less memory node (PMEM/HBM expansion).
    pub fn add_memory_only_node(&mut self, node: usize, mem_type: MemType) -> &mut Self {
        self.node_types.insert(node, mem_type);
        self
    }

    pub fn set_distance(&mut self, a: usize, b: usize, distance: u64) -> &mut Self {
        self.distances.insert((a, b), distance);
        self.distances.insert((b, a), distance);
        self
    }

    pub fn set_base_freq(&mut self, cpus: &CpuSet, freq: u64) -> &mut Self {
        for cpu in self.cpus.iter_mut() {
            if cpus.contains(cpu.id) {
                cpu.base_freq = freq;
            }
        }
        self
    }

    pub fn set_epp(&mut self, cpus: &CpuSet, epp: u64) -> &mut Self {
        for cpu in self.cpus.iter_mut() {
            if cpus.contains(cpu.id) {
                cpu.epp = Some(epp);
            }
        }
        self
    }

    pub fn set_offline(&mut self, cpus: &CpuSet) -> &mut Self {
        for cpu in self.cpus.iter_mut() {
            if cpus.contains(cpu.id) {
                cpu.online = false;
            }
        }
        self
    }

    pub fn mark_isolated(&mut self, cpus: &CpuSet) -> &mut Self {
        self.isolated = self.isolated.union(cpus);
        self
    }

    pub fn mark_efficient(&mut self, cpus: &CpuSet) -> &mut Self {
        self.efficient = self.efficient.union(cpus);
        self
    }

    pub fn set_sst(&mut self, package: usize, info: SstPackageInfo) -> &mut Self {
        self.sst.insert(package, info);
        self
    }

    pub fn build(&self) -> Result<System, Error> {
        let mut cpus = self.cpus.clone();
        for cpu in cpus.iter_mut() {
            cpu.isolated = self.isolated.contains(cpu.id);
        }
        if let Some(run) = self.cluster_run_len {
            let mut per_package: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for cpu in &cpus {
                per_package.entry(cpu.package).or_default().push(cpu.id);
            }
            let mut cluster_of: BTreeMap<usize, usize> = BTreeMap::new();
            for ids in per_package.values_mut() {
                ids.sort_unstable();
                for (idx, id) in ids.iter().enumerate() {
                    cluster_of.insert(*id, idx / run);
                }
            }
            for cpu in cpus.iter_mut() {
                cpu.cluster = cluster_of[&cpu.id];
            }
        }

        let mut node_cpus: BTreeMap<usize, CpuSet> = BTreeMap::new();
        for cpu in &cpus {
            node_cpus.entry(cpu.node).or_default().insert(cpu.id);
        }
        for node in self.node_types.keys() {
            node_cpus.entry(*node).or_default();
        }

        let mut node_package: BTreeMap<usize, Option<usize>> = BTreeMap::new();
        for (node, set) in &node_cpus {
            let package = set
                .first()
                .map(|id| cpus.iter().find(|c| c.id == id).map(|c| c.package))
                .flatten();
            node_package.insert(*node, package);
        }

        let ids: Vec<usize> = node_cpus.keys().copied().collect();
        let mut nodes = Vec::new();
        for (id, set) in &node_cpus {
            let mut distance = BTreeMap::new();
            for other in &ids {
                let d = self.distances.get(&(*id, *other)).copied().unwrap_or_else(|| {
                    if id == other {
                        10
                    } else if node_package[id].is_some() && node_package[id] == node_package[other] {
                        12
                    } else {
                        21
                    }
                });
                distance.insert(*other, d);
            }
            let default_type = if set.is_empty() { MemType::Pmem } else { MemType::Dram };
            nodes.push(MemNodeInfo {
                id: *id,
                mem_type: self.node_types.get(id).copied().unwrap_or(default_type),
                capacity: self.node_capacities.get(id).copied().unwrap_or(DEFAULT_NODE_CAPACITY),
                cpus: set.clone(),
                distance,
            });
        }

        let hybrid = if self.efficient.is_empty() {
            HybridKinds::default()
        } else {
            HybridKinds {
                performance: None,
                efficient: Some(self.efficient.clone()),
            }
        };
        System::new(cpus, nodes, hybrid, self.sst.clone())
    }
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self::new()
    }
}
