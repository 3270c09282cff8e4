use balloons_policy::core::cache::{Cache, ContainerInfo, ContainerState, PodInfo};
use balloons_topology::cpuset::CpuSet;

fn pod(id: &str) -> PodInfo {
    PodInfo {
        id: id.to_string(),
        name: id.to_string(),
        namespace: "apps".to_string(),
        ..Default::default()
    }
}

fn container(id: &str, pod_id: &str, milli: u64, limit: u64) -> ContainerInfo {
    let mut c = ContainerInfo::new(id, pod_id, id);
    c.cpu_request = milli;
    c.cpu_limit = limit;
    c
}

#[test]
// Removing a pod removes its containers and reports their ids.
fn test_pod_removal_cascades() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p1"));
    cache.insert_pod(pod("p2"));
    cache.insert_container(container("c1", "p1", 500, 0));
    cache.insert_container(container("c2", "p1", 500, 0));
    cache.insert_container(container("c3", "p2", 500, 0));

    let removed = cache.remove_pod("p1");
    assert_eq!(removed, vec!["c1".to_string(), "c2".to_string()]);
    assert!(cache.pod("p1").is_none());
    assert!(cache.container("c1").is_none());
    assert!(cache.container("c3").is_some());
    assert_eq!(cache.containers_of_pod("p2"), vec!["c3".to_string()]);
}

#[test]
// Only created and running containers are active.
fn test_active_states() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p1"));
    for (id, state) in [
        ("c1", ContainerState::Created),
        ("c2", ContainerState::Running),
        ("c3", ContainerState::Stopped),
    ] {
        cache.insert_container(container(id, "p1", 100, 0));
        cache.set_state(id, state);
    }
    let active: Vec<&str> = cache.active_containers().map(|c| c.id.as_str()).collect();
    assert_eq!(active, vec!["c1", "c2"]);
}

#[test]
// Decision recording marks containers pending only on actual changes, and
// draining clears the marks.
fn test_pending_tracking() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p1"));
    cache.insert_container(container("c1", "p1", 1000, 0));

    let cpus = Some(CpuSet::range(0, 3));
    cache.record_decision("c1", Some("b[0]".to_string()), cpus.clone(), Some(vec![0]));
    assert!(cache.has_pending());
    assert_eq!(cache.take_pending(), vec!["c1".to_string()]);
    assert!(!cache.has_pending());

    // same decision again: nothing new to push
    cache.record_decision("c1", Some("b[0]".to_string()), cpus.clone(), Some(vec![0]));
    assert!(!cache.has_pending());

    cache.record_decision("c1", Some("b[0]".to_string()), cpus, Some(vec![0, 1]));
    assert!(cache.has_pending());
    cache.clear_pending("c1");
    assert!(!cache.has_pending());

    let c = cache.container("c1").unwrap();
    assert_eq!(c.balloon.as_deref(), Some("b[0]"));
    assert_eq!(c.allowed_mems.as_deref(), Some(&[0usize, 1][..]));
}

#[test]
// QoS class falls out of requests and limits when the runtime reports
// none.
fn test_qos_derivation() {
    let mut cache = Cache::new();
    cache.insert_pod(pod("p1"));
    cache.insert_container(container("g", "p1", 1000, 1000));
    cache.insert_container(container("b", "p1", 500, 1000));
    cache.insert_container(container("e", "p1", 0, 0));
    assert_eq!(cache.container("g").unwrap().qos_class, "Guaranteed");
    assert_eq!(cache.container("b").unwrap().qos_class, "Burstable");
    assert_eq!(cache.container("e").unwrap().qos_class, "BestEffort");
}
