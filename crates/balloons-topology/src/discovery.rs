//! Topology discovery from a sysfs-like tree.
//!
//! The mountpoint is configurable so that tests and containerized
//! deployments can point the agent at `/host/sys` or at a fabricated tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::cpuset::CpuSet;
use crate::error::Error;
use crate::sst::SstPackageInfo;
use crate::system::{CpuInfo, CpuPriority, CoreKind, HybridKinds, MemNodeInfo, MemType, System};

/// Builds the [`System`] model from the tree rooted at `sysfs_root`
/// (normally `/sys`).
pub fn discover(sysfs_root: impl AsRef<Path>) -> Result<System, Error> {
    let root = sysfs_root.as_ref();
    let cpu_root = root.join("devices/system/cpu");
    let node_root = root.join("devices/system/node");

    let online = read_cpuset_opt(&cpu_root.join("online"))?.unwrap_or_default();
    let isolated = read_cpuset_opt(&cpu_root.join("isolated"))?.unwrap_or_default();

    let mut cpus = Vec::new();
    let mut sst = BTreeMap::new();
    for id in list_indexed(&cpu_root, "cpu")? {
        let dir = cpu_root.join(format!("cpu{}", id));
        match read_cpu(&dir, id, &online, &isolated)? {
            Some(cpu) => cpus.push(cpu),
            None => warn!(target: "topology", "cpu {} has no topology, skipping", id),
        }
    }
    if cpus.is_empty() {
        return Err(Error::Inconsistent("no usable cpus found".to_string()));
    }

    for package in cpus.iter().map(|c| c.package).collect::<std::collections::BTreeSet<_>>() {
        if let Some(info) = read_sst(&cpu_root, package, &cpus)? {
            sst.insert(package, info);
        }
    }

    let node_ids = list_indexed(&node_root, "node")?;
    let mut nodes = Vec::new();
    for id in &node_ids {
        nodes.push(read_node(&node_root.join(format!("node{}", id)), *id, &node_ids)?);
    }
    if nodes.is_empty() {
        // Hosts without NUMA directories behave as one all-covering node.
        nodes.push(MemNodeInfo {
            id: 0,
            mem_type: MemType::Dram,
            capacity: 0,
            cpus: cpus.iter().map(|c| c.id).collect(),
            distance: BTreeMap::from([(0, 10)]),
        });
    }

    let hybrid = HybridKinds {
        performance: read_cpuset_opt(&root.join("devices/cpu_core/cpus"))?,
        efficient: read_cpuset_opt(&root.join("devices/cpu_atom/cpus"))?,
    };

    System::new(cpus, nodes, hybrid, sst)
}

fn read_cpu(dir: &Path, id: usize, online: &CpuSet, isolated: &CpuSet) -> Result<Option<CpuInfo>, Error> {
    let topo = dir.join("topology");
    if !topo.exists() {
        return Ok(None);
    }
    let package = read_usize(&topo.join("physical_package_id"))?;
    let die = read_usize_opt(&topo.join("die_id"))?.unwrap_or(0);
    // cluster_id is -1 when the platform reports no L2 clustering; the die
    // then acts as a single cluster.
    let cluster = read_isize_opt(&topo.join("cluster_id"))?
        .filter(|c| *c >= 0)
        .map(|c| c as usize)
        .unwrap_or(0);
    let core = read_usize(&topo.join("core_id"))?;
    let siblings = read_cpuset_opt(&topo.join("core_cpus_list"))?
        .or(read_cpuset_opt(&topo.join("thread_siblings_list"))?)
        .unwrap_or_else(|| CpuSet::from_ids([id]));

    let freq = dir.join("cpufreq");
    let min_freq = read_u64_opt(&freq.join("cpuinfo_min_freq"))?.unwrap_or(0);
    let max_freq = read_u64_opt(&freq.join("cpuinfo_max_freq"))?.unwrap_or(0);
    let base_freq = read_u64_opt(&freq.join("base_frequency"))?.unwrap_or(0);
    let epp = read_epp(&freq.join("energy_performance_preference"))?;

    let mut idle_states = Vec::new();
    let idle = dir.join("cpuidle");
    if idle.exists() {
        for state in list_indexed(&idle, "state")? {
            idle_states.push(read_string(&idle.join(format!("state{}/name", state)))?);
        }
    }

    Ok(Some(CpuInfo {
        id,
        package,
        die,
        cluster,
        node: 0,
        core,
        siblings,
        min_freq,
        max_freq,
        base_freq,
        epp,
        idle_states,
        kind: CoreKind::Performance,
        online: online.is_empty() || online.contains(id),
        isolated: isolated.contains(id),
        priority: CpuPriority::Normal,
    }))
}

fn read_node(dir: &Path, id: usize, all_ids: &[usize]) -> Result<MemNodeInfo, Error> {
    let cpus = read_cpuset_opt(&dir.join("cpulist"))?.unwrap_or_default();
    let capacity = read_meminfo_total(&dir.join("meminfo"))?;
    let mut distance = BTreeMap::new();
    if let Some(line) = read_string_opt(&dir.join("distance"))? {
        for (other, val) in all_ids.iter().zip(line.split_whitespace()) {
            let d = val
                .parse()
                .map_err(|_| Error::parse("distance", dir.join("distance").display().to_string(), val))?;
            distance.insert(*other, d);
        }
    }
    // CPU-less nodes are treated as slower expanded memory.
    let mem_type = if cpus.is_empty() { MemType::Pmem } else { MemType::Dram };
    Ok(MemNodeInfo {
        id,
        mem_type,
        capacity,
        cpus,
        distance,
    })
}

/// Reads the modeled per-package SST state, if the platform exposes one.
fn read_sst(cpu_root: &Path, package: usize, cpus: &[CpuInfo]) -> Result<Option<SstPackageInfo>, Error> {
    let dir = cpu_root.join(format!("sst/package_{}", package));
    if !dir.exists() {
        return Ok(None);
    }
    let mut info = SstPackageInfo {
        tf_enabled: read_bool_opt(&dir.join("tf_enabled"))?.unwrap_or(false),
        cp_enabled: read_bool_opt(&dir.join("cp_enabled"))?.unwrap_or(false),
        bf_enabled: read_bool_opt(&dir.join("bf_enabled"))?.unwrap_or(false),
        cp_proportional: matches!(
            read_string_opt(&dir.join("cp_priority_mode"))?.as_deref(),
            Some("proportional")
        ),
        clos_of_cpu: BTreeMap::new(),
        clos_weight: BTreeMap::new(),
        bf_cpus: read_cpuset_opt(&dir.join("bf_cpus"))?.unwrap_or_default(),
    };
    for clos in 0..4u32 {
        if let Some(w) = read_u64_opt(&dir.join(format!("clos_{}_weight", clos)))? {
            info.clos_weight.insert(clos, w);
        }
    }
    for cpu in cpus.iter().filter(|c| c.package == package) {
        let path = cpu_root.join(format!("cpu{}/sst/clos_id", cpu.id));
        if let Some(clos) = read_u64_opt(&path)? {
            info.clos_of_cpu.insert(cpu.id, clos as u32);
        }
    }
    Ok(Some(info))
}

/// Ids of `<prefix>N` entries directly under `dir`, sorted. A missing
/// directory reads as empty (hosts without NUMA have no node directory).
fn list_indexed(dir: &Path, prefix: &str) -> Result<Vec<usize>, Error> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir.display().to_string(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir.display().to_string(), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix(prefix) {
            if let Ok(id) = rest.parse::<usize>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn read_string(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::io(path.display().to_string(), e))
}

fn read_string_opt(path: &Path) -> Result<Option<String>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    read_string(path).map(Some)
}

fn read_usize(path: &Path) -> Result<usize, Error> {
    let s = read_string(path)?;
    s.parse()
        .map_err(|_| Error::parse("integer", path.display().to_string(), s))
}

fn read_usize_opt(path: &Path) -> Result<Option<usize>, Error> {
    match read_string_opt(path)? {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| Error::parse("integer", path.display().to_string(), s)),
    }
}

fn read_isize_opt(path: &Path) -> Result<Option<isize>, Error> {
    match read_string_opt(path)? {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| Error::parse("integer", path.display().to_string(), s)),
    }
}

fn read_u64_opt(path: &Path) -> Result<Option<u64>, Error> {
    match read_string_opt(path)? {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| Error::parse("integer", path.display().to_string(), s)),
    }
}

fn read_bool_opt(path: &Path) -> Result<Option<bool>, Error> {
    Ok(read_u64_opt(path)?.map(|v| v != 0))
}

fn read_cpuset_opt(path: &Path) -> Result<Option<CpuSet>, Error> {
    match read_string_opt(path)? {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e: String| Error::parse("cpulist", path.display().to_string(), e)),
    }
}

/// EPP is either a plain number or one of the well-known preference names.
fn read_epp(path: &Path) -> Result<Option<u64>, Error> {
    let s = match read_string_opt(path)? {
        None => return Ok(None),
        Some(s) => s,
    };
    if let Ok(v) = s.parse::<u64>() {
        return Ok(Some(v));
    }
    let v = match s.as_str() {
        "performance" => 0,
        "balance_performance" | "default" => 128,
        "balance_power" => 192,
        "power" => 255,
        _ => return Ok(None),
    };
    Ok(Some(v))
}

/// Parses `MemTotal` out of a per-node meminfo file, in bytes.
fn read_meminfo_total(path: &Path) -> Result<u64, Error> {
    let content = match read_string_opt(path)? {
        None => return Ok(0),
        Some(c) => c,
    };
    for line in content.lines() {
        if let Some(pos) = line.find("MemTotal:") {
            let rest = &line[pos + "MemTotal:".len()..];
            let kb: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::parse("MemTotal", path.display().to_string(), line))?;
            return Ok(kb * 1024);
        }
    }
    Ok(0)
}

/// Convenience wrapper over [`discover`] keeping the callers free of
/// `PathBuf` plumbing.
pub fn discover_default() -> Result<System, Error> {
    discover(PathBuf::from("/sys"))
}
