//! Intel SST state and CPU priority derivation.

use std::collections::BTreeMap;

use crate::cpuset::CpuSet;
use crate::system::{CoreKind, CpuInfo, CpuPriority};

/// Per-package Speed Select state.
#[derive(Debug, Clone, Default)]
pub struct SstPackageInfo {
    pub tf_enabled: bool,
    pub cp_enabled: bool,
    pub bf_enabled: bool,
    /// CP priority mode: proportional instead of ordered.
    pub cp_proportional: bool,
    /// CLOS id of each CPU under SST-CP / SST-TF.
    pub clos_of_cpu: BTreeMap<usize, u32>,
    /// Proportional-mode weight per CLOS, higher wins.
    pub clos_weight: BTreeMap<u32, u64>,
    /// Cores listed as high-priority by SST-BF.
    pub bf_cpus: CpuSet,
}

/// Derives the priority of every CPU, package by package.
///
/// Per package the first applicable source wins: SST-TF, SST-CP, SST-BF,
/// then the cpufreq heuristics (base-frequency bins, E-core demotion, EPP
/// tightening).
pub fn derive_priorities(cpus: &mut BTreeMap<usize, CpuInfo>, sst: &BTreeMap<usize, SstPackageInfo>) {
    let mut packages: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for cpu in cpus.values() {
        packages.entry(cpu.package).or_default().push(cpu.id);
    }

    for (package, ids) in packages {
        let info = sst.get(&package);
        if let Some(info) = info {
            if info.tf_enabled {
                derive_from_tf(cpus, &ids, info);
                continue;
            }
            if info.cp_enabled {
                derive_from_cp(cpus, &ids, info);
                continue;
            }
            if info.bf_enabled {
                for id in &ids {
                    let Some(cpu) = cpus.get_mut(id) else { continue };
                    cpu.priority = if info.bf_cpus.contains(*id) {
                        CpuPriority::High
                    } else {
                        CpuPriority::Low
                    };
                }
                continue;
            }
        }
        derive_from_cpufreq(cpus, &ids);
    }
}

/// SST-TF: CLOS 0 and 1 run at turbo frequencies, everything else yields.
fn derive_from_tf(cpus: &mut BTreeMap<usize, CpuInfo>, ids: &[usize], info: &SstPackageInfo) {
    for id in ids {
        let clos = info.clos_of_cpu.get(id).copied();
        let Some(cpu) = cpus.get_mut(id) else { continue };
        cpu.priority = match clos {
            Some(0) | Some(1) => CpuPriority::High,
            _ => CpuPriority::Low,
        };
    }
}

/// SST-CP: rank the CLOSes in use, highest gets `high`, lowest gets `low`.
fn derive_from_cp(cpus: &mut BTreeMap<usize, CpuInfo>, ids: &[usize], info: &SstPackageInfo) {
    let mut closes: Vec<u32> = ids
        .iter()
        .filter_map(|id| info.clos_of_cpu.get(id).copied())
        .collect();
    closes.sort_unstable();
    closes.dedup();
    if closes.len() < 2 {
        for id in ids {
            if let Some(cpu) = cpus.get_mut(id) {
                cpu.priority = CpuPriority::Normal;
            }
        }
        return;
    }
    // Ordered mode: the lower the CLOS id, the higher its priority.
    // Proportional mode: the bigger the weight, the higher its priority.
    let mut ranked = closes.clone();
    if info.cp_proportional {
        ranked.sort_by_key(|clos| {
            let weight = info.clos_weight.get(clos).copied().unwrap_or(0);
            (std::cmp::Reverse(weight), *clos)
        });
    }
    let best = ranked[0];
    let worst = *ranked.last().unwrap();
    for id in ids {
        let clos = info.clos_of_cpu.get(id).copied();
        let Some(cpu) = cpus.get_mut(id) else { continue };
        cpu.priority = match clos {
            Some(c) if c == best => CpuPriority::High,
            Some(c) if c == worst => CpuPriority::Low,
            Some(_) => CpuPriority::Normal,
            None => CpuPriority::Low,
        };
    }
}

/// No SST: bin by base frequency, demote E-cores, tighten with EPP.
fn derive_from_cpufreq(cpus: &mut BTreeMap<usize, CpuInfo>, ids: &[usize]) {
    let min_base = ids
        .iter()
        .map(|id| cpus[id].base_freq)
        .filter(|f| *f > 0)
        .min()
        .unwrap_or(0);
    for id in ids {
        let Some(cpu) = cpus.get_mut(id) else { continue };
        cpu.priority = if cpu.base_freq > min_base {
            CpuPriority::High
        } else {
            CpuPriority::Low
        };
    }

    for id in ids {
        let Some(cpu) = cpus.get_mut(id) else { continue };
        if cpu.kind == CoreKind::Efficient {
            cpu.priority = CpuPriority::Low;
        }
    }

    let epps: Vec<u64> = {
        let mut v: Vec<u64> = ids.iter().filter_map(|id| cpus[id].epp).collect();
        v.sort_unstable();
        v.dedup();
        v
    };
    if epps.len() > 1 {
        let worst = *epps.last().unwrap();
        for id in ids {
            let Some(cpu) = cpus.get_mut(id) else { continue };
            if cpu.kind == CoreKind::Efficient {
                continue;
            }
            if let Some(epp) = cpu.epp {
                cpu.priority = if epp == worst {
                    CpuPriority::Low
                } else {
                    CpuPriority::High
                };
            }
        }
    }
}
