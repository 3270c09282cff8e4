//! Prometheus text rendering of the policy state.
//!
//! The HTTP server publishing `/metrics` is a collaborator; it serves the
//! text the agent re-renders after every event.

use std::collections::BTreeMap;
use std::fmt::Write;

use balloons_policy::core::policy::PolicySnapshot;

/// Renders the policy snapshot in the Prometheus text exposition format.
pub fn render(snapshot: &PolicySnapshot) -> String {
    let mut out = String::new();

    let mut by_type: BTreeMap<&str, u64> = BTreeMap::new();
    for b in &snapshot.balloons {
        *by_type.entry(b.btype.as_str()).or_default() += 1;
    }
    gauge_header(&mut out, "balloon_count", "Number of balloons per balloon type.");
    for (btype, count) in &by_type {
        let _ = writeln!(out, "balloon_count{{type={:?}}} {}", btype, count);
    }

    gauge_header(&mut out, "balloon_cpus", "Number of CPUs owned by a balloon.");
    for b in &snapshot.balloons {
        let _ = writeln!(out, "balloon_cpus{{name={:?}}} {}", b.name, b.cpus.size());
    }

    gauge_header(&mut out, "balloon_containers", "Number of containers in a balloon.");
    for b in &snapshot.balloons {
        let _ = writeln!(out, "balloon_containers{{name={:?}}} {}", b.name, b.containers.len());
    }

    gauge_header(&mut out, "mem_node_capacity", "Memory node capacity in bytes.");
    for n in &snapshot.mem_nodes {
        let _ = writeln!(out, "mem_node_capacity{{node_id=\"{}\"}} {}", n.id, n.capacity);
    }
    gauge_header(&mut out, "mem_node_usage", "Memory requested from a node in bytes.");
    for n in &snapshot.mem_nodes {
        let _ = writeln!(out, "mem_node_usage{{node_id=\"{}\"}} {}", n.id, n.usage);
    }
    gauge_header(
        &mut out,
        "mem_node_container_count",
        "Number of containers allowed to allocate from a node.",
    );
    for n in &snapshot.mem_nodes {
        let _ = writeln!(out, "mem_node_container_count{{node_id=\"{}\"}} {}", n.id, n.containers);
    }

    gauge_header(&mut out, "cpu_allocation", "Milli-CPUs allocated on a CPU.");
    for c in &snapshot.cpus {
        let _ = writeln!(out, "cpu_allocation{{cpu_id=\"{}\"}} {}", c.id, c.allocation_milli);
    }
    gauge_header(&mut out, "cpu_container_count", "Number of containers allowed on a CPU.");
    for c in &snapshot.cpus {
        let _ = writeln!(out, "cpu_container_count{{cpu_id=\"{}\"}} {}", c.id, c.containers);
    }

    gauge_header(&mut out, "policy_tuning_failures", "Total failed CPU tuning writes.");
    let _ = writeln!(out, "policy_tuning_failures {}", snapshot.tuning_failures);

    out
}

fn gauge_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
}
