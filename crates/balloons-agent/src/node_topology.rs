//! Node resource topology export.
//!
//! Builds the zone tree consumed by topology-aware schedulers: packages,
//! dies, NUMA nodes, balloons and per-container allocations, each with the
//! standard resources (milli-CPU, memory bytes) and cpuset attributes.

use serde::{Deserialize, Serialize};

use balloons_policy::core::policy::PolicySnapshot;
use balloons_topology::system::System;

use crate::error::Result;

pub const POLICY_NAME: &str = "balloons";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneResource {
    pub name: String,
    pub capacity: String,
    pub allocatable: String,
    pub available: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    #[serde(rename = "type")]
    pub zone_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    pub resources: Vec<ZoneResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
}

/// The object emitted per node, named by the node's hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceTopology {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub zones: Vec<Zone>,
}

fn attr(name: &str, value: impl Into<String>) -> Attribute {
    Attribute {
        name: name.to_string(),
        value: value.into(),
    }
}

fn cpu_resource(capacity_milli: u64, available_milli: u64) -> ZoneResource {
    ZoneResource {
        name: "cpu".to_string(),
        capacity: format!("{}m", capacity_milli),
        allocatable: format!("{}m", capacity_milli),
        available: format!("{}m", available_milli),
    }
}

fn memory_resource(bytes: u64, available: u64) -> ZoneResource {
    ZoneResource {
        name: "memory".to_string(),
        capacity: bytes.to_string(),
        allocatable: bytes.to_string(),
        available: available.to_string(),
    }
}

/// Builds the zone tree from the current policy snapshot.
pub fn build(node_name: &str, system: &System, snapshot: &PolicySnapshot) -> NodeResourceTopology {
    let mut zones = Vec::new();

    for package in system.package_ids() {
        let cpus = system.package_cpus(package);
        let free = cpus.intersection(&snapshot.free_cpus);
        let mut zone = Zone {
            name: format!("package #{}", package),
            zone_type: "Package".to_string(),
            parent: String::new(),
            resources: vec![cpu_resource(cpus.size() as u64 * 1000, free.size() as u64 * 1000)],
            attributes: vec![attr("cpuset", cpus.to_string())],
        };
        let isolated = cpus.intersection(&snapshot.isolated_cpus);
        if !isolated.is_empty() {
            zone.attributes.push(attr("isolated cpuset", isolated.to_string()));
        }
        zones.push(zone);

        for (pkg, die) in system.die_ids() {
            if pkg != package {
                continue;
            }
            let die_cpus = system.die_cpus(pkg, die);
            let die_free = die_cpus.intersection(&snapshot.free_cpus);
            zones.push(Zone {
                name: format!("package #{} die #{}", pkg, die),
                zone_type: "Die".to_string(),
                parent: format!("package #{}", package),
                resources: vec![cpu_resource(
                    die_cpus.size() as u64 * 1000,
                    die_free.size() as u64 * 1000,
                )],
                attributes: vec![attr("cpuset", die_cpus.to_string())],
            });
        }
    }

    for id in system.node_ids() {
        let node = system.node(id);
        let used: u64 = snapshot
            .mem_nodes
            .iter()
            .filter(|n| n.id == id)
            .map(|n| n.usage)
            .sum();
        let package = node.cpus.first().map(|cpu| system.package_of(cpu));
        zones.push(Zone {
            name: format!("node #{}", id),
            zone_type: "Node".to_string(),
            parent: package.map(|p| format!("package #{}", p)).unwrap_or_default(),
            resources: vec![memory_resource(node.capacity, node.capacity.saturating_sub(used))],
            attributes: vec![attr("memory set", id.to_string()), attr("cpuset", node.cpus.to_string())],
        });
    }

    for b in &snapshot.balloons {
        let capacity = b.cpus.size() as u64 * 1000;
        let available = b.excess_milli.max(0) as u64;
        let mut attributes = vec![attr("cpuset", b.cpus.to_string())];
        if !b.shared_idle.is_empty() {
            attributes.push(attr("shared cpuset", b.shared_idle.to_string()));
        }
        if b.btype == "reserved" {
            attributes.push(attr("reserved cpuset", snapshot.reserved_cpus.to_string()));
        }
        attributes.push(attr("excess cpus", b.excess_milli.max(0).to_string()));
        if !b.component_cpusets.is_empty() {
            let sets: Vec<String> = b.component_cpusets.iter().map(|s| s.to_string()).collect();
            attributes.push(attr("component cpusets", sets.join(";")));
        }
        zones.push(Zone {
            name: b.name.clone(),
            zone_type: "Balloon".to_string(),
            parent: String::new(),
            resources: vec![cpu_resource(capacity, available)],
            attributes,
        });
    }

    for b in &snapshot.balloons {
        for container in &b.containers {
            zones.push(Zone {
                name: format!("{}/{}", b.name, container),
                zone_type: "allocation for container".to_string(),
                parent: b.name.clone(),
                resources: Vec::new(),
                attributes: vec![attr("cpuset", b.cpus.difference(&b.hidden).to_string())],
            });
        }
    }

    NodeResourceTopology {
        name: node_name.to_string(),
        attributes: vec![attr("TopologyPolicy", POLICY_NAME)],
        zones,
    }
}

/// Outbound write primitive for the topology object, implemented by the
/// control-plane collaborator. Called from detached tasks.
pub trait TopologySink: Send + Sync {
    fn update(&self, topology: &NodeResourceTopology) -> Result<()>;
}

/// Logs the object instead of writing it; the dry-run default.
#[derive(Default)]
pub struct LogTopologySink;

impl TopologySink for LogTopologySink {
    fn update(&self, topology: &NodeResourceTopology) -> Result<()> {
        log::debug!(
            target: "node-topology",
            "{} zones for node {}",
            topology.zones.len(),
            topology.name
        );
        Ok(())
    }
}
