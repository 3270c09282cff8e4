//! Expression matching against containers and pods.
//!
//! Expressions appear in balloon-type `matchExpressions`, the policy-wide
//! `preserve` block and `groupBy` interpolation. Keys resolve explicitly
//! against the container and its pod; there is no dynamic dispatch involved.

use serde::{Deserialize, Serialize};

use crate::core::cache::{ContainerInfo, PodInfo};

/// Expression operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    NotEqual,
    In,
    NotIn,
    Exists,
    NotExist,
    Matches,
    MatchesNot,
    MatchesAny,
    MatchesNone,
    AlwaysTrue,
}

/// A single `key op values` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub key: String,
    #[serde(rename = "operator")]
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Evaluation scope: a container together with its pod.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub container: &'a ContainerInfo,
    pub pod: Option<&'a PodInfo>,
}

impl<'a> EvalContext<'a> {
    pub fn new(container: &'a ContainerInfo, pod: Option<&'a PodInfo>) -> Self {
        Self { container, pod }
    }

    /// Resolves a key path to its value, `None` when the key does not exist
    /// in this scope.
    ///
    /// Plain keys resolve against the container; the `pod/` prefix switches
    /// to the pod. A key starting with `:` is a joint key
    /// `:<ksep><vsep><keys>`: the sub-keys (separated by `ksep`) are
    /// resolved individually and joined with `vsep`.
    pub fn eval_key(&self, key: &str) -> Option<String> {
        if let Some(rest) = key.strip_prefix(':') {
            let mut chars = rest.chars();
            let ksep = chars.next()?;
            let vsep = chars.next()?;
            let keys: &str = chars.as_str();
            let mut parts = Vec::new();
            for sub in keys.split(ksep) {
                parts.push(self.eval_key(sub)?);
            }
            return Some(
                parts
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(&vsep.to_string()),
            );
        }
        match key.split_once('/') {
            Some(("pod", sub)) => self.eval_pod_key(sub),
            Some(("labels", name)) => self.container.labels.get(name).cloned(),
            Some(("tags", name)) => self.container.tags.get(name).cloned(),
            None => match key {
                "name" => Some(self.container.name.clone()),
                "namespace" => self.pod.map(|p| p.namespace.clone()),
                "qosclass" => Some(self.container.qos_class.clone()),
                "id" => Some(self.container.id.clone()),
                "uid" => Some(self.container.id.clone()),
                "pod" => self.pod.map(|p| p.name.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn eval_pod_key(&self, key: &str) -> Option<String> {
        let pod = self.pod?;
        match key.split_once('/') {
            Some(("labels", name)) => pod.labels.get(name).cloned(),
            Some(("annotations", name)) => pod.annotations.get(name).cloned(),
            None => match key {
                "name" => Some(pod.name.clone()),
                "namespace" => Some(pod.namespace.clone()),
                "qosclass" => Some(pod.qos_class.clone()),
                "id" => Some(pod.id.clone()),
                "uid" => Some(pod.uid.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Pure string interpolation used by `groupBy`: `${key}` and `$key`
    /// references are replaced by the key values, missing keys by the empty
    /// string.
    pub fn interpolate(&self, template: &str) -> String {
        let mut out = String::new();
        let mut chars = template.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some((_, '{')) => {
                    chars.next();
                    let mut key = String::new();
                    for (_, k) in chars.by_ref() {
                        if k == '}' {
                            break;
                        }
                        key.push(k);
                    }
                    out.push_str(&self.eval_key(&key).unwrap_or_default());
                }
                Some((_, k)) if is_key_char(k) => {
                    let mut key = String::new();
                    while let Some((_, k)) = chars.peek().copied() {
                        if !is_key_char(k) {
                            break;
                        }
                        key.push(k);
                        chars.next();
                    }
                    out.push_str(&self.eval_key(&key).unwrap_or_default());
                }
                _ => out.push('$'),
            }
        }
        out
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/' || c == '.'
}

impl Expression {
    /// Evaluates the expression in the given scope.
    pub fn evaluate(&self, scope: &EvalContext) -> bool {
        let value = scope.eval_key(&self.key);
        match self.op {
            Operator::AlwaysTrue => true,
            Operator::Exists => value.is_some(),
            Operator::NotExist => value.is_none(),
            Operator::Equals => {
                value.unwrap_or_default() == self.values.first().cloned().unwrap_or_default()
            }
            Operator::NotEqual => {
                value.unwrap_or_default() != self.values.first().cloned().unwrap_or_default()
            }
            Operator::In => {
                let v = value.unwrap_or_default();
                self.values.iter().any(|x| *x == v)
            }
            Operator::NotIn => {
                let v = value.unwrap_or_default();
                !self.values.iter().any(|x| *x == v)
            }
            Operator::Matches => {
                let v = value.unwrap_or_default();
                self.values.first().map(|p| glob_matches(p, &v)).unwrap_or(false)
            }
            Operator::MatchesNot => {
                let v = value.unwrap_or_default();
                !self.values.first().map(|p| glob_matches(p, &v)).unwrap_or(false)
            }
            Operator::MatchesAny => {
                let v = value.unwrap_or_default();
                self.values.iter().any(|p| glob_matches(p, &v))
            }
            Operator::MatchesNone => {
                let v = value.unwrap_or_default();
                !self.values.iter().any(|p| glob_matches(p, &v))
            }
        }
    }
}

/// Shell-style glob match (`*`, `?`), compiled to an anchored regex.
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    match regex::Regex::new(&glob_to_regex(pattern)) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}
