use std::fs;
use std::path::{Path, PathBuf};

use balloons_topology::cpuset::CpuSet;
use balloons_topology::discovery::discover;
use balloons_topology::system::CpuPriority;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Lays out a small two-package machine: cores {0,4},{1,5} on package 0 /
/// node 0 and {2,6},{3,7} on package 1 / node 1.
fn make_tree(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("balloons-sysfs-{}-{}", std::process::id(), name));
    if root.exists() {
        fs::remove_dir_all(&root).unwrap();
    }
    write(&root, "devices/system/cpu/online", "0-7\n");
    write(&root, "devices/system/cpu/isolated", "3,7\n");
    for cpu in 0..8usize {
        let core = cpu % 4;
        let dir = format!("devices/system/cpu/cpu{}", cpu);
        write(&root, &format!("{}/topology/physical_package_id", dir), &format!("{}\n", core / 2));
        write(&root, &format!("{}/topology/die_id", dir), "0\n");
        write(&root, &format!("{}/topology/cluster_id", dir), "-1\n");
        write(&root, &format!("{}/topology/core_id", dir), &format!("{}\n", core % 2));
        write(
            &root,
            &format!("{}/topology/thread_siblings_list", dir),
            &format!("{},{}\n", core, core + 4),
        );
        let base = if core % 2 == 0 { 3_000_000 } else { 2_400_000 };
        write(&root, &format!("{}/cpufreq/cpuinfo_min_freq", dir), "400000\n");
        write(&root, &format!("{}/cpufreq/cpuinfo_max_freq", dir), "3600000\n");
        write(&root, &format!("{}/cpufreq/base_frequency", dir), &format!("{}\n", base));
        write(
            &root,
            &format!("{}/cpufreq/energy_performance_preference", dir),
            "balance_performance\n",
        );
        write(&root, &format!("{}/cpuidle/state0/name", dir), "POLL\n");
        write(&root, &format!("{}/cpuidle/state1/name", dir), "C1\n");
    }
    write(&root, "devices/system/node/node0/cpulist", "0-1,4-5\n");
    write(&root, "devices/system/node/node0/distance", "10 21\n");
    write(
        &root,
        "devices/system/node/node0/meminfo",
        "Node 0 MemTotal:       16384 kB\nNode 0 MemFree:        8192 kB\n",
    );
    write(&root, "devices/system/node/node1/cpulist", "2-3,6-7\n");
    write(&root, "devices/system/node/node1/distance", "21 10\n");
    write(
        &root,
        "devices/system/node/node1/meminfo",
        "Node 1 MemTotal:       16384 kB\n",
    );
    root
}

#[test]
// The discovered model matches the fabricated tree.
fn test_discover_basic() {
    let root = make_tree("basic");
    let system = discover(&root).unwrap();

    assert_eq!(system.cpu_count(), 8);
    assert_eq!(system.package_ids(), vec![0, 1]);
    assert_eq!(system.package_cpus(0), CpuSet::from_ids([0, 1, 4, 5]));
    assert_eq!(system.core_siblings(1), CpuSet::from_ids([1, 5]));
    assert_eq!(system.node_of(6), 1);
    assert_eq!(system.isolated_cpus(), CpuSet::from_ids([3, 7]));
    assert_eq!(system.node(0).capacity, 16384 * 1024);
    assert_eq!(system.node(0).distance[&1], 21);
    assert_eq!(system.cpu(0).base_freq, 3_000_000);
    assert_eq!(system.cpu(0).epp, Some(128));
    assert_eq!(system.cpu(0).idle_states, vec!["POLL".to_string(), "C1".to_string()]);

    // per package, the higher frequency bin wins
    assert_eq!(system.cpu(0).priority, CpuPriority::High);
    assert_eq!(system.cpu(1).priority, CpuPriority::Low);

    fs::remove_dir_all(&root).unwrap();
}

#[test]
// SST-BF state overrides the cpufreq heuristics on its package.
fn test_discover_sst() {
    let root = make_tree("sst");
    write(&root, "devices/system/cpu/sst/package_0/bf_enabled", "1\n");
    write(&root, "devices/system/cpu/sst/package_0/bf_cpus", "0,4\n");
    let system = discover(&root).unwrap();

    assert_eq!(system.cpu(0).priority, CpuPriority::High);
    assert_eq!(system.cpu(4).priority, CpuPriority::High);
    assert_eq!(system.cpu(1).priority, CpuPriority::Low);
    assert_eq!(system.cpu(5).priority, CpuPriority::Low);
    // package 1 still derives from cpufreq
    assert_eq!(system.cpu(2).priority, CpuPriority::High);
    assert_eq!(system.cpu(3).priority, CpuPriority::Low);

    fs::remove_dir_all(&root).unwrap();
}

#[test]
// A hybrid tree with only the efficient list labels the complement as
// performance cores.
fn test_discover_hybrid_complement() {
    let root = make_tree("hybrid");
    write(&root, "devices/cpu_atom/cpus", "2-3,6-7\n");
    let system = discover(&root).unwrap();

    assert!(system.is_hybrid());
    assert_eq!(
        system.kind_cpus(balloons_topology::system::CoreKind::Efficient),
        CpuSet::from_ids([2, 3, 6, 7])
    );

    fs::remove_dir_all(&root).unwrap();
}
