use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use balloons_agent::metrics;
use balloons_agent::node_topology;
use balloons_agent::resources_export;
use balloons_policy::core::cache::{Cache, ContainerInfo, PodInfo};
use balloons_policy::core::config::BalloonsConfig;
use balloons_policy::core::cpu_class::NullCpuControl;
use balloons_policy::core::policy::BalloonsPolicy;
use balloons_topology::fake::FakeSystem;

fn make_policy() -> (BalloonsPolicy, Rc<RefCell<Cache>>) {
    let system = Rc::new(FakeSystem::canonical().build().unwrap());
    let cache = Rc::new(RefCell::new(Cache::new()));
    let config = BalloonsConfig::from_yaml(
        r#"
reservedResources:
  cpu: cpuset:39,79
balloonTypes:
  - name: q
    minCPUs: 1
    maxCPUs: 4
    namespaces: ["*"]
"#,
    )
    .unwrap();
    let policy = BalloonsPolicy::new(system, config, cache.clone(), Box::new(NullCpuControl), BTreeMap::new()).unwrap();
    (policy, cache)
}

fn place_container(policy: &mut BalloonsPolicy, cache: &Rc<RefCell<Cache>>, milli: u64) {
    cache.borrow_mut().insert_pod(PodInfo {
        id: "p1".to_string(),
        name: "p1".to_string(),
        namespace: "apps".to_string(),
        ..Default::default()
    });
    let mut c = ContainerInfo::new("c1", "p1", "app");
    c.cpu_request = milli;
    c.mem_request = 512 * 1024 * 1024;
    cache.borrow_mut().insert_container(c);
    policy.allocate_resources("c1").unwrap();
}

#[test]
// The text format carries every documented series.
fn test_metrics_render() {
    let (mut policy, cache) = make_policy();
    place_container(&mut policy, &cache, 2000);

    let text = metrics::render(&policy.snapshot());
    assert!(text.contains("balloon_count{type=\"reserved\"} 1"));
    assert!(text.contains("balloon_count{type=\"q\"} 1"));
    assert!(text.contains("balloon_cpus{name=\"q[0]\"} 2"));
    assert!(text.contains("balloon_containers{name=\"q[0]\"} 1"));
    assert!(text.contains("mem_node_capacity{node_id=\"0\"}"));
    assert!(text.contains("mem_node_usage{node_id=\"0\"} 536870912"));
    assert!(text.contains("mem_node_container_count{node_id=\"0\"} 1"));
    assert!(text.contains("cpu_allocation{cpu_id=\"0\"} 1000"));
    assert!(text.contains("cpu_container_count{cpu_id=\"0\"} 1"));
    assert!(text.contains("cpu_container_count{cpu_id=\"1\"} 0"));
    assert!(text.contains("policy_tuning_failures 0"));
    assert!(text.contains("# TYPE balloon_count gauge"));
}

#[test]
// The zone tree mirrors packages, dies, nodes, balloons and allocations.
fn test_node_topology_zones() {
    let (mut policy, cache) = make_policy();
    place_container(&mut policy, &cache, 2000);
    let system = FakeSystem::canonical().build().unwrap();

    let topology = node_topology::build("worker-1", &system, &policy.snapshot());
    assert_eq!(topology.name, "worker-1");
    assert_eq!(topology.attributes[0].name, "TopologyPolicy");
    assert_eq!(topology.attributes[0].value, "balloons");

    let packages: Vec<_> = topology.zones.iter().filter(|z| z.zone_type == "Package").collect();
    assert_eq!(packages.len(), 2);
    assert_eq!(packages[0].attributes[0].name, "cpuset");
    assert_eq!(packages[0].attributes[0].value, "0-19,40-59");

    let nodes: Vec<_> = topology.zones.iter().filter(|z| z.zone_type == "Node").collect();
    assert_eq!(nodes.len(), 4);
    assert_eq!(nodes[0].parent, "package #0");

    let balloon = topology
        .zones
        .iter()
        .find(|z| z.zone_type == "Balloon" && z.name == "q[0]")
        .unwrap();
    assert_eq!(balloon.resources[0].name, "cpu");
    assert_eq!(balloon.resources[0].capacity, "2000m");
    assert_eq!(balloon.resources[0].available, "0m");

    let allocation = topology
        .zones
        .iter()
        .find(|z| z.zone_type == "allocation for container")
        .unwrap();
    assert_eq!(allocation.parent, "q[0]");

    // the object serializes with the wire field names
    let json = serde_json::to_value(&topology).unwrap();
    assert_eq!(json["zones"][0]["type"], "Package");
}

#[test]
// resources.sh splits the allowed CPUs into shared/isolated/exclusive.
fn test_resources_export() {
    let (mut policy, cache) = make_policy();
    place_container(&mut policy, &cache, 2000);

    let snapshot = policy.snapshot();
    let cache_ref = cache.borrow();
    let container = cache_ref.container("c1").unwrap();
    let sets = resources_export::container_cpu_sets(&snapshot, container);
    assert_eq!(sets.exclusive.to_string(), "0,40");
    assert!(sets.shared.is_empty());
    assert!(sets.isolated.is_empty());

    let rendered = resources_export::render(&sets);
    assert!(rendered.contains("SHARED_CPUS=\"\""));
    assert!(rendered.contains("EXCLUSIVE_CPUS=\"0 40\""));

    let dir = std::env::temp_dir().join(format!("balloons-export-{}", std::process::id()));
    resources_export::write(&dir, "c1", &sets).unwrap();
    let content = std::fs::read_to_string(dir.join("c1/resources.sh")).unwrap();
    assert_eq!(content, rendered);
    resources_export::remove(&dir, "c1");
    assert!(!dir.join("c1").exists());
    let _ = std::fs::remove_dir_all(&dir);
}
