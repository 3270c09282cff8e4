//! Pod annotations consumed by the policy.

use std::collections::BTreeMap;

use balloons_topology::system::{CoreKind, MemType};

pub const BALLOON_KEY: &str = "balloon.balloons.resource-policy.nri.io";
pub const PRESERVE_CPU_KEY: &str = "cpu.preserve.resource-policy.nri.io";
pub const PRESERVE_MEM_KEY: &str = "memory.preserve.resource-policy.nri.io";
pub const MEMORY_TYPE_KEY: &str = "memory-type.resource-policy.nri.io";
pub const HIDE_HYPERTHREADS_KEY: &str = "hide-hyperthreads.resource-policy.nri.io";
pub const PREFER_CORE_TYPE_KEY: &str = "prefer-core-type.resource-policy.nri.io";

/// Resolves the effective value of an annotation for one container:
/// `<key>/container.<name>` wins over `<key>/pod` wins over `<key>`.
pub fn effective_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    key: &str,
    container: &str,
) -> Option<&'a String> {
    annotations
        .get(&format!("{}/container.{}", key, container))
        .or_else(|| annotations.get(&format!("{}/pod", key)))
        .or_else(|| annotations.get(key))
}

/// Explicitly requested balloon type, if any.
pub fn balloon_type<'a>(
    annotations: &'a BTreeMap<String, String>,
    container: &str,
) -> Option<&'a String> {
    effective_annotation(annotations, BALLOON_KEY, container)
}

pub fn preserve_cpu(annotations: &BTreeMap<String, String>, container: &str) -> Option<bool> {
    effective_annotation(annotations, PRESERVE_CPU_KEY, container).map(|v| v == "true")
}

pub fn preserve_memory(annotations: &BTreeMap<String, String>, container: &str) -> Option<bool> {
    effective_annotation(annotations, PRESERVE_MEM_KEY, container).map(|v| v == "true")
}

pub fn hide_hyperthreads(annotations: &BTreeMap<String, String>, container: &str) -> Option<bool> {
    effective_annotation(annotations, HIDE_HYPERTHREADS_KEY, container).map(|v| v == "true")
}

/// Comma-separated memory types; unknown names are dropped with a warning.
pub fn memory_types(annotations: &BTreeMap<String, String>, container: &str) -> Option<Vec<MemType>> {
    let value = effective_annotation(annotations, MEMORY_TYPE_KEY, container)?;
    let mut types = Vec::new();
    for part in value.split(',') {
        match part.trim() {
            "DRAM" => types.push(MemType::Dram),
            "PMEM" => types.push(MemType::Pmem),
            "HBM" => types.push(MemType::Hbm),
            other => log::warn!(target: "policy", "ignoring unknown memory type {:?}", other),
        }
    }
    Some(types)
}

pub fn prefer_core_type(annotations: &BTreeMap<String, String>, container: &str) -> Option<CoreKind> {
    match effective_annotation(annotations, PREFER_CORE_TYPE_KEY, container)?.as_str() {
        "efficient" => Some(CoreKind::Efficient),
        "performance" => Some(CoreKind::Performance),
        other => {
            log::warn!(target: "policy", "ignoring unknown core type {:?}", other);
            None
        }
    }
}
