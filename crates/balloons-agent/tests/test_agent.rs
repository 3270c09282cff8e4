use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use balloons_agent::agent::{Agent, AgentOptions};
use balloons_agent::config_store::{
    ConfigEvent, ConfigMeta, ConfigObject, ConfigSelector, StatusSink,
};
use balloons_agent::error::Result;
use balloons_agent::node_topology::{NodeResourceTopology, TopologySink};
use balloons_agent::nri::{
    ContainerSpec, PluginRegistration, PodSpec, RecordingRuntimeSink, RuntimeEvent,
};
use balloons_agent::trace::TraceConfig;
use balloons_policy::core::config::BalloonsConfig;
use balloons_policy::core::cpu_class::NullCpuControl;
use balloons_topology::fake::FakeSystem;

struct RecordingStatusSink(Arc<Mutex<Vec<(String, serde_json::Value)>>>);

impl StatusSink for RecordingStatusSink {
    fn patch_status(&self, object: &str, patch: &serde_json::Value) -> Result<()> {
        self.0.lock().unwrap().push((object.to_string(), patch.clone()));
        Ok(())
    }
}

struct RecordingTopologySink(Arc<Mutex<Vec<NodeResourceTopology>>>);

impl TopologySink for RecordingTopologySink {
    fn update(&self, topology: &NodeResourceTopology) -> Result<()> {
        self.0.lock().unwrap().push(topology.clone());
        Ok(())
    }
}

struct TestAgent {
    agent: Agent,
    runtime: Rc<RecordingRuntimeSink>,
    status: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    topologies: Arc<Mutex<Vec<NodeResourceTopology>>>,
}

fn config_yaml() -> &'static str {
    r#"
reservedResources:
  cpu: cpuset:39,79
balloonTypes:
  - name: q
    minCPUs: 1
    maxCPUs: 4
    namespaces: ["*"]
"#
}

fn make_agent(config: &str) -> TestAgent {
    let system = Rc::new(FakeSystem::canonical().build().unwrap());
    let runtime = Rc::new(RecordingRuntimeSink::default());
    let status = Arc::new(Mutex::new(Vec::new()));
    let topologies = Arc::new(Mutex::new(Vec::new()));
    let options = AgentOptions {
        node_name: "worker-1".to_string(),
        group_label: Some("pool-a".to_string()),
        resources_dir: None,
        registration: PluginRegistration::new(90, "balloons").unwrap(),
        trace: TraceConfig::default(),
    };
    let agent = Agent::new(
        system,
        BalloonsConfig::from_yaml(config).unwrap(),
        options,
        runtime.clone(),
        Arc::new(RecordingStatusSink(status.clone())),
        Arc::new(RecordingTopologySink(topologies.clone())),
        Box::new(NullCpuControl),
        BTreeMap::new(),
    )
    .unwrap();
    TestAgent {
        agent,
        runtime,
        status,
        topologies,
    }
}

fn pod(id: &str, namespace: &str) -> PodSpec {
    PodSpec {
        id: id.to_string(),
        uid: format!("uid-{}", id),
        name: id.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    }
}

fn container(id: &str, pod_id: &str, milli: u64) -> ContainerSpec {
    ContainerSpec {
        id: id.to_string(),
        pod_id: pod_id.to_string(),
        name: id.to_string(),
        cpu_request: milli,
        cpu_limit: milli,
        ..Default::default()
    }
}

#[test]
// CreateContainer returns the masks the runtime must apply.
fn test_create_container_adjustment() {
    let mut t = make_agent(config_yaml());
    t.agent
        .handle_runtime_event(RuntimeEvent::RunPodSandbox(pod("p1", "apps")))
        .unwrap();
    let adjustment = t
        .agent
        .handle_runtime_event(RuntimeEvent::CreateContainer(container("c1", "p1", 1000)))
        .unwrap()
        .unwrap();
    assert_eq!(adjustment.linux_resources.cpu.cpus.as_deref(), Some("0"));
    assert_eq!(adjustment.linux_resources.cpu.mems.as_deref(), Some("0"));
    // nobody else changed, so no unsolicited updates
    assert!(t.runtime.updates.borrow().is_empty());
}

#[test]
// A rejected container leaves no trace in the cache.
fn test_unassignable_purges_cache() {
    let mut t = make_agent(
        r#"
reservedResources:
  cpu: cpuset:39,79
balloonTypes:
  - name: unknown
    minCPUs: -1
    maxCPUs: -1
    matchExpressions:
      - key: name
        operator: NotIn
        values: [a, b]
"#,
    );
    t.agent
        .handle_runtime_event(RuntimeEvent::RunPodSandbox(pod("p1", "apps")))
        .unwrap();
    let err = t
        .agent
        .handle_runtime_event(RuntimeEvent::CreateContainer(container("z", "p1", 500)))
        .unwrap_err();
    assert!(err.to_string().contains("cannot assign"));
    assert!(t.agent.cache().borrow().container("z").is_none());
}

#[test]
// Synchronize places everything already running, and growth of a shared
// balloon updates the earlier container.
fn test_synchronize_and_sibling_updates() {
    let mut t = make_agent(config_yaml());
    t.agent
        .handle_runtime_event(RuntimeEvent::Synchronize {
            pods: vec![pod("p1", "apps"), pod("p2", "apps")],
            containers: vec![container("c1", "p1", 1000), container("c2", "p2", 1000)],
        })
        .unwrap();

    let cache = t.agent.cache();
    let allowed1 = cache.borrow().container("c1").unwrap().allowed_cpus.clone().unwrap();
    let allowed2 = cache.borrow().container("c2").unwrap().allowed_cpus.clone().unwrap();
    assert_eq!(allowed1.to_string(), "0,40");
    assert_eq!(allowed2.to_string(), "0,40");

    // c1 was re-pinned when c2 arrived, so it went out as an update
    let updates = t.runtime.updates.borrow();
    assert!(updates
        .iter()
        .any(|u| u.container_id == "c1" && u.linux_resources.cpu.cpus.as_deref() == Some("0,40")));
}

#[test]
// Stopping a container shrinks the balloon and re-pins the survivor.
fn test_stop_container_shrinks() {
    let mut t = make_agent(config_yaml());
    t.agent
        .handle_runtime_event(RuntimeEvent::RunPodSandbox(pod("p1", "apps")))
        .unwrap();
    t.agent
        .handle_runtime_event(RuntimeEvent::CreateContainer(container("c1", "p1", 1000)))
        .unwrap();
    t.agent
        .handle_runtime_event(RuntimeEvent::CreateContainer(container("c2", "p1", 1000)))
        .unwrap();
    t.runtime.updates.borrow_mut().clear();

    t.agent
        .handle_runtime_event(RuntimeEvent::StopContainer {
            container_id: "c2".to_string(),
        })
        .unwrap();
    let updates = t.runtime.updates.borrow();
    assert!(updates
        .iter()
        .any(|u| u.container_id == "c1" && u.linux_resources.cpu.cpus.as_deref() == Some("0")));
}

#[test]
// Removing a pod releases all of its containers.
fn test_remove_pod() {
    let mut t = make_agent(config_yaml());
    t.agent
        .handle_runtime_event(RuntimeEvent::RunPodSandbox(pod("p1", "apps")))
        .unwrap();
    t.agent
        .handle_runtime_event(RuntimeEvent::CreateContainer(container("c1", "p1", 2000)))
        .unwrap();
    t.agent
        .handle_runtime_event(RuntimeEvent::RemovePodSandbox {
            pod_id: "p1".to_string(),
        })
        .unwrap();
    assert!(t.agent.cache().borrow().container("c1").is_none());
    // only the reserved balloon remains
    assert_eq!(t.agent.policy().balloons().len(), 1);
}

#[test]
// The node-specific configuration wins, status goes back per generation.
fn test_config_apply_and_status() {
    let mut t = make_agent(config_yaml());

    let default_obj = ConfigObject {
        metadata: ConfigMeta {
            name: "default".to_string(),
            uid: "u-default".to_string(),
            generation: 1,
        },
        spec: BalloonsConfig::from_yaml(
            r#"
reservedResources:
  cpu: cpuset:39,79
balloonTypes:
  - name: from-default
    maxCPUs: 2
    namespaces: ["*"]
"#,
        )
        .unwrap(),
    };
    t.agent.handle_config_event(ConfigEvent::Updated(default_obj));
    t.agent.apply_effective_config();
    assert!(t.agent.policy().config().balloon_type("from-default").is_some());
    t.agent.drain_outbound();
    {
        let patches = t.status.lock().unwrap();
        let (object, patch) = patches.last().unwrap();
        assert_eq!(object, "default");
        assert_eq!(patch["status"]["nodes"]["worker-1"]["status"], "Success");
        assert_eq!(patch["status"]["nodes"]["worker-1"]["generation"], 1);
    }

    // the node-scoped object takes precedence
    let node_obj = ConfigObject {
        metadata: ConfigMeta {
            name: "node.worker-1".to_string(),
            uid: "u-node".to_string(),
            generation: 7,
        },
        spec: BalloonsConfig::from_yaml(
            r#"
reservedResources:
  cpu: cpuset:39,79
balloonTypes:
  - name: from-node
    maxCPUs: 2
    namespaces: ["*"]
"#,
        )
        .unwrap(),
    };
    t.agent.handle_config_event(ConfigEvent::Updated(node_obj));
    t.agent.apply_effective_config();
    assert!(t.agent.policy().config().balloon_type("from-node").is_some());
    assert!(t.agent.policy().config().balloon_type("from-default").is_none());

    // deleting it falls back to the default object
    t.agent
        .handle_config_event(ConfigEvent::Deleted("node.worker-1".to_string()));
    t.agent.apply_effective_config();
    assert!(t.agent.policy().config().balloon_type("from-default").is_some());
}

#[test]
// A rejected configuration keeps the last good one and reports Failure.
fn test_config_rejection_keeps_previous() {
    let mut t = make_agent(config_yaml());
    let bad = ConfigObject {
        metadata: ConfigMeta {
            name: "node.worker-1".to_string(),
            uid: "u-bad".to_string(),
            generation: 3,
        },
        spec: BalloonsConfig::from_yaml(
            r#"
reservedResources:
  cpu: cpuset:39,79
balloonTypes:
  - name: monster
    minCPUs: 200
    maxCPUs: 300
    minBalloons: 1
"#,
        )
        .unwrap(),
    };
    t.agent.handle_config_event(ConfigEvent::Updated(bad));
    t.agent.apply_effective_config();
    assert!(t.agent.policy().config().balloon_type("q").is_some());
    t.agent.drain_outbound();
    let patches = t.status.lock().unwrap();
    let (_, patch) = patches.last().unwrap();
    assert_eq!(patch["status"]["nodes"]["worker-1"]["status"], "Failure");
    assert!(!patch["status"]["nodes"]["worker-1"]["errors"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[test]
// Configuration bursts are not applied before the coalescing window ends.
fn test_config_coalescing_window() {
    let mut t = make_agent(config_yaml());
    let obj = ConfigObject {
        metadata: ConfigMeta {
            name: "default".to_string(),
            uid: "u1".to_string(),
            generation: 1,
        },
        spec: BalloonsConfig::from_yaml(config_yaml()).unwrap(),
    };
    t.agent.handle_config_event(ConfigEvent::Updated(obj));
    // the window has not passed yet
    t.agent.maybe_apply_config();
    t.agent.drain_outbound();
    assert!(t.status.lock().unwrap().is_empty());
}

#[test]
// Every event refreshes the emitted node topology.
fn test_topology_pushed() {
    let mut t = make_agent(config_yaml());
    t.agent
        .handle_runtime_event(RuntimeEvent::RunPodSandbox(pod("p1", "apps")))
        .unwrap();
    t.agent
        .handle_runtime_event(RuntimeEvent::CreateContainer(container("c1", "p1", 1000)))
        .unwrap();
    t.agent.drain_outbound();
    let topologies = t.topologies.lock().unwrap();
    let last = topologies.last().unwrap();
    assert_eq!(last.name, "worker-1");
    assert!(last.zones.iter().any(|z| z.zone_type == "Balloon" && z.name.starts_with("q[")));
    assert!(last
        .zones
        .iter()
        .any(|z| z.zone_type == "allocation for container" && z.name.ends_with("/c1")));
}

#[test]
// Exporter selection resolves the default endpoints.
fn test_trace_exporter() {
    use balloons_agent::trace::TraceExporter;
    let mut config = TraceConfig::default();
    assert!(config.resolved_endpoint().is_none());
    config.exporter = Some("otlp-http".parse().unwrap());
    assert_eq!(config.resolved_endpoint().as_deref(), Some("localhost:4318"));
    config.exporter = Some(TraceExporter::OtlpGrpc);
    assert_eq!(config.resolved_endpoint().as_deref(), Some("localhost:4317"));
    config.endpoint = Some("collector:4317".to_string());
    assert_eq!(config.resolved_endpoint().as_deref(), Some("collector:4317"));
    assert!("zipkin".parse::<TraceExporter>().is_err());
}

#[test]
// Selector precedence and freshness tracking.
fn test_selector() {
    let mut selector = ConfigSelector::new("n1", Some("g1".to_string()));
    let make = |name: &str, uid: &str, generation| ConfigObject {
        metadata: ConfigMeta {
            name: name.to_string(),
            uid: uid.to_string(),
            generation,
        },
        spec: BalloonsConfig::default(),
    };
    assert!(selector.effective().is_none());
    assert!(!selector.needs_apply());

    selector.observe(ConfigEvent::Updated(make("default", "d", 1)));
    assert_eq!(selector.effective().unwrap().metadata.name, "default");
    selector.observe(ConfigEvent::Updated(make("group.g1", "g", 1)));
    assert_eq!(selector.effective().unwrap().metadata.name, "group.g1");
    selector.observe(ConfigEvent::Updated(make("group.other", "x", 1)));
    assert_eq!(selector.effective().unwrap().metadata.name, "group.g1");
    selector.observe(ConfigEvent::Updated(make("node.n1", "n", 1)));
    assert_eq!(selector.effective().unwrap().metadata.name, "node.n1");
    selector.observe(ConfigEvent::Updated(make("node.n2", "y", 1)));
    assert_eq!(selector.effective().unwrap().metadata.name, "node.n1");

    assert!(selector.needs_apply());
    let applied = selector.effective().unwrap().clone();
    selector.mark_applied(&applied);
    assert!(!selector.needs_apply());

    // a new generation of the same object is fresh again
    selector.observe(ConfigEvent::Updated(make("node.n1", "n", 2)));
    assert!(selector.needs_apply());

    selector.observe(ConfigEvent::Deleted("node.n1".to_string()));
    assert_eq!(selector.effective().unwrap().metadata.name, "group.g1");
    assert!(selector.needs_apply());
}
