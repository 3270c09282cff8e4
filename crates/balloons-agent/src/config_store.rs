//! Configuration-store objects and the node/group/default selection rules.
//!
//! The store watch itself (Kubernetes machinery) is a collaborator; it
//! forwards object updates as [`ConfigEvent`]s into the agent loop and
//! receives status merge-patches through [`StatusSink`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use balloons_policy::core::config::BalloonsConfig;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMeta {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub generation: u64,
}

/// One named configuration object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigObject {
    pub metadata: ConfigMeta,
    pub spec: BalloonsConfig,
}

impl ConfigObject {
    /// Freshness fingerprint; a changed `(uid, generation)` pair means a
    /// new effective configuration.
    pub fn fingerprint(&self) -> (String, u64) {
        (self.metadata.uid.clone(), self.metadata.generation)
    }
}

/// Scope of a configuration object, derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigScope {
    /// `node.<hostname>`
    Node(String),
    /// `group.<label-value>`
    Group(String),
    /// `default`
    Default,
    Other,
}

pub fn scope_of(name: &str) -> ConfigScope {
    if let Some(node) = name.strip_prefix("node.") {
        return ConfigScope::Node(node.to_string());
    }
    if let Some(group) = name.strip_prefix("group.") {
        return ConfigScope::Group(group.to_string());
    }
    if name == "default" {
        return ConfigScope::Default;
    }
    ConfigScope::Other
}

/// Store-side change notifications.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Updated(ConfigObject),
    Deleted(String),
}

/// Tracks the node-specific and group-or-default objects and decides which
/// one is effective. The node-specific object wins whenever present; a
/// matching group object wins over `default`.
pub struct ConfigSelector {
    node_name: String,
    group_label: Option<String>,
    node_obj: Option<ConfigObject>,
    group_obj: Option<ConfigObject>,
    default_obj: Option<ConfigObject>,
    applied: Option<(String, u64)>,
}

impl ConfigSelector {
    pub fn new(node_name: impl Into<String>, group_label: Option<String>) -> Self {
        Self {
            node_name: node_name.into(),
            group_label,
            node_obj: None,
            group_obj: None,
            default_obj: None,
            applied: None,
        }
    }

    /// Folds a store notification into the tracked objects.
    pub fn observe(&mut self, event: ConfigEvent) {
        match event {
            ConfigEvent::Updated(obj) => match scope_of(&obj.metadata.name) {
                ConfigScope::Node(node) if node == self.node_name => self.node_obj = Some(obj),
                ConfigScope::Group(group) if Some(&group) == self.group_label.as_ref() => {
                    self.group_obj = Some(obj)
                }
                ConfigScope::Default => self.default_obj = Some(obj),
                _ => {}
            },
            ConfigEvent::Deleted(name) => match scope_of(&name) {
                ConfigScope::Node(node) if node == self.node_name => self.node_obj = None,
                ConfigScope::Group(group) if Some(&group) == self.group_label.as_ref() => {
                    self.group_obj = None
                }
                ConfigScope::Default => self.default_obj = None,
                _ => {}
            },
        }
    }

    /// The currently effective object, if any.
    pub fn effective(&self) -> Option<&ConfigObject> {
        self.node_obj
            .as_ref()
            .or(self.group_obj.as_ref())
            .or(self.default_obj.as_ref())
    }

    /// Whether the effective object differs from the last applied one.
    pub fn needs_apply(&self) -> bool {
        match self.effective() {
            Some(obj) => self.applied.as_ref() != Some(&obj.fingerprint()),
            None => false,
        }
    }

    pub fn mark_applied(&mut self, obj: &ConfigObject) {
        self.applied = Some(obj.fingerprint());
    }
}

/// Per-node status written back to the configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub generation: u64,
    /// `"Success"` or `"Failure"`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub timestamp: String,
}

impl NodeStatus {
    pub fn success(generation: u64, timestamp: impl Into<String>) -> Self {
        Self {
            generation,
            status: "Success".to_string(),
            errors: Vec::new(),
            timestamp: timestamp.into(),
        }
    }

    pub fn failure(generation: u64, error: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            generation,
            status: "Failure".to_string(),
            errors: vec![error.into()],
            timestamp: timestamp.into(),
        }
    }
}

/// The merge-patch body targeting the object's status subresource.
pub fn status_patch(node_name: &str, status: &NodeStatus) -> serde_json::Value {
    json!({
        "status": {
            "nodes": {
                node_name: status,
            }
        }
    })
}

/// Status write primitive, implemented by the store collaborator. Called
/// from detached tasks, serialized per object.
pub trait StatusSink: Send + Sync {
    fn patch_status(&self, object: &str, patch: &serde_json::Value) -> Result<()>;
}

/// Logs patches instead of writing them; the dry-run default.
#[derive(Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn patch_status(&self, object: &str, patch: &serde_json::Value) -> Result<()> {
        log::info!(target: "config", "status patch for {}: {}", object, patch);
        Ok(())
    }
}

/// Loads the fallback configuration used before the store delivers one.
pub fn load_fallback(path: &str) -> Result<BalloonsConfig> {
    BalloonsConfig::from_file(path).map_err(Error::Policy)
}
