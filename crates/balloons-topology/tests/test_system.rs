use std::collections::BTreeMap;

use balloons_topology::cpuset::CpuSet;
use balloons_topology::fake::FakeSystem;
use balloons_topology::sst::SstPackageInfo;
use balloons_topology::system::{CoreKind, CpuPriority, MemType};

#[test]
// The canonical machine has the documented shape.
fn test_canonical_shape() {
    let system = FakeSystem::canonical().build().unwrap();
    assert_eq!(system.cpu_count(), 80);
    assert_eq!(system.package_ids(), vec![0, 1]);
    assert_eq!(system.node_ids(), vec![0, 1, 2, 3]);
    assert_eq!(system.package_cpus(0), CpuSet::range(0, 19).union(&CpuSet::range(40, 59)));
    assert_eq!(system.package_cpus(1), CpuSet::range(20, 39).union(&CpuSet::range(60, 79)));
    assert_eq!(system.core_siblings(5), CpuSet::from_ids([5, 45]));
    assert_eq!(system.core_siblings(45), CpuSet::from_ids([5, 45]));
    assert_eq!(system.node_of(12), 1);
    assert_eq!(system.node_of(25), 2);
    assert!(!system.is_hybrid());
}

#[test]
// Clustering splits package CPU ids into consecutive runs.
fn test_canonical_clusters() {
    let system = FakeSystem::canonical_clustered(4).build().unwrap();
    let clusters = system.cluster_ids();
    // 10 clusters per package.
    assert_eq!(clusters.len(), 20);
    assert_eq!(system.cluster_cpus((0, 0, 0)), CpuSet::range(0, 3));
    assert_eq!(system.cluster_cpus((0, 0, 1)), CpuSet::range(4, 7));
    assert_eq!(system.cluster_cpus((0, 0, 5)), CpuSet::range(40, 43));
    assert_eq!(system.cluster_cpus((1, 0, 0)), CpuSet::range(20, 23));
}

#[test]
// One thread per core selection keeps the lowest sibling present.
fn test_one_thread_per_core() {
    let system = FakeSystem::canonical().build().unwrap();
    let picked = system.pick_one_thread_per_core(&CpuSet::from_ids([0, 1, 40, 41, 45]));
    assert_eq!(picked, CpuSet::from_ids([0, 1, 45]));
}

#[test]
// The hybrid preset resolves kinds from the single efficient list and the
// frequency bins put P-cores above E-cores.
fn test_hybrid_kinds_and_priority() {
    let system = FakeSystem::hybrid().build().unwrap();
    assert!(system.is_hybrid());
    assert_eq!(system.kind_cpus(CoreKind::Efficient), CpuSet::range(16, 19));
    assert_eq!(system.cpu(16).kind, CoreKind::Efficient);
    assert_eq!(system.cpu(0).kind, CoreKind::Performance);
    assert_eq!(system.cpu(0).priority, CpuPriority::High);
    assert_eq!(system.cpu(16).priority, CpuPriority::Low);
    assert_eq!(system.prio_cpus(CpuPriority::Low), CpuSet::range(16, 19));
}

#[test]
// Labeling that splits a core's threads across kinds is rejected.
fn test_hybrid_split_core_is_fatal() {
    let mut fake = FakeSystem::new();
    fake.add_core(0, 0, 0, 0, 0, &[0, 2]);
    fake.add_core(0, 0, 0, 0, 1, &[1, 3]);
    // cpu 2 is a sibling of cpu 0 but labeled the other kind
    fake.mark_efficient(&CpuSet::from_ids([2, 3]));
    assert!(fake.build().is_err());
}

#[test]
// SST-BF marks the listed cores high and everything else low.
fn test_sst_bf_priority() {
    let mut fake = FakeSystem::canonical();
    fake.set_sst(
        0,
        SstPackageInfo {
            bf_enabled: true,
            bf_cpus: CpuSet::from_ids([0, 1, 40, 41]),
            ..Default::default()
        },
    );
    let system = fake.build().unwrap();
    assert_eq!(system.cpu(0).priority, CpuPriority::High);
    assert_eq!(system.cpu(41).priority, CpuPriority::High);
    assert_eq!(system.cpu(2).priority, CpuPriority::Low);
    // package 1 has no SST and a single frequency bin
    assert_eq!(system.cpu(20).priority, CpuPriority::Low);
}

#[test]
// SST-CP ordered mode: lowest CLOS id is the highest priority class.
fn test_sst_cp_priority() {
    let mut fake = FakeSystem::canonical();
    let mut clos = BTreeMap::new();
    for cpu in 0..20usize {
        clos.insert(cpu, (cpu % 3) as u32);
        clos.insert(cpu + 40, (cpu % 3) as u32);
    }
    fake.set_sst(
        0,
        SstPackageInfo {
            cp_enabled: true,
            clos_of_cpu: clos,
            ..Default::default()
        },
    );
    let system = fake.build().unwrap();
    assert_eq!(system.cpu(0).priority, CpuPriority::High);
    assert_eq!(system.cpu(1).priority, CpuPriority::Normal);
    assert_eq!(system.cpu(2).priority, CpuPriority::Low);
}

#[test]
// SST-TF: CLOS 0 and 1 are high, the rest low.
fn test_sst_tf_priority() {
    let mut fake = FakeSystem::canonical();
    let mut clos = BTreeMap::new();
    for cpu in 0..20usize {
        clos.insert(cpu, (cpu % 4) as u32);
        clos.insert(cpu + 40, (cpu % 4) as u32);
    }
    fake.set_sst(
        0,
        SstPackageInfo {
            tf_enabled: true,
            cp_enabled: true,
            clos_of_cpu: clos,
            ..Default::default()
        },
    );
    let system = fake.build().unwrap();
    assert_eq!(system.cpu(0).priority, CpuPriority::High);
    assert_eq!(system.cpu(1).priority, CpuPriority::High);
    assert_eq!(system.cpu(2).priority, CpuPriority::Low);
    assert_eq!(system.cpu(3).priority, CpuPriority::Low);
}

#[test]
// EPP differences tighten the cpufreq-derived priorities.
fn test_epp_tightening() {
    let mut fake = FakeSystem::canonical();
    fake.set_epp(&CpuSet::range(0, 79), 128);
    fake.set_epp(&CpuSet::from_ids([10, 50]), 255);
    let system = fake.build().unwrap();
    assert_eq!(system.cpu(10).priority, CpuPriority::Low);
    assert_eq!(system.cpu(50).priority, CpuPriority::Low);
    assert_eq!(system.cpu(0).priority, CpuPriority::High);
}

#[test]
// Memory nodes follow the CPUs, and type restrictions pull in the closest
// node of the requested type.
fn test_memory_nodes() {
    let mut fake = FakeSystem::canonical();
    fake.add_memory_only_node(4, MemType::Pmem);
    fake.set_distance(0, 4, 17);
    fake.set_distance(1, 4, 17);
    fake.set_distance(2, 4, 28);
    fake.set_distance(3, 4, 28);
    let system = fake.build().unwrap();

    let cpus = CpuSet::from_ids([0, 1, 12]);
    assert_eq!(system.closest_nodes(&cpus), vec![0, 1]);
    assert_eq!(
        system.closest_nodes_with_types(&cpus, &[MemType::Dram]),
        vec![0, 1]
    );
    assert_eq!(
        system.closest_nodes_with_types(&cpus, &[MemType::Dram, MemType::Pmem]),
        vec![0, 1, 4]
    );
    assert_eq!(
        system.closest_nodes_with_types(&cpus, &[MemType::Pmem]),
        vec![4]
    );
    assert!(system
        .closest_nodes_with_types(&cpus, &[MemType::Hbm])
        .is_empty());
}

#[test]
// Isolated and offline flags are carried through.
fn test_flags() {
    let mut fake = FakeSystem::canonical();
    fake.mark_isolated(&CpuSet::from_ids([19, 59]));
    fake.set_offline(&CpuSet::from_ids([39, 79]));
    let system = fake.build().unwrap();
    assert_eq!(system.isolated_cpus(), CpuSet::from_ids([19, 59]));
    assert_eq!(system.online_cpus().size(), 78);
    assert!(!system.cpu(39).online);
}
