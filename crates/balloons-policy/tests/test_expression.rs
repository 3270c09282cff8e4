use std::collections::BTreeMap;

use balloons_policy::core::cache::{ContainerInfo, PodInfo};
use balloons_policy::core::expression::{EvalContext, Expression, Operator};

fn pod() -> PodInfo {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "db".to_string());
    labels.insert("tier".to_string(), "backend".to_string());
    PodInfo {
        id: "pod-1".to_string(),
        uid: "uid-1".to_string(),
        name: "postgres-0".to_string(),
        namespace: "storage".to_string(),
        labels,
        annotations: BTreeMap::new(),
        qos_class: "Guaranteed".to_string(),
    }
}

fn container() -> ContainerInfo {
    let mut c = ContainerInfo::new("ctr-1", "pod-1", "postgres");
    c.cpu_request = 1000;
    c.cpu_limit = 1000;
    c.qos_class = "Guaranteed".to_string();
    c.labels.insert("role".to_string(), "primary".to_string());
    c
}

fn expr(key: &str, op: Operator, values: &[&str]) -> Expression {
    Expression {
        key: key.to_string(),
        op,
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

#[test]
// Plain keys resolve against the container, pod/ keys against the pod.
fn test_key_resolution() {
    let pod = pod();
    let container = container();
    let scope = EvalContext::new(&container, Some(&pod));

    assert_eq!(scope.eval_key("name"), Some("postgres".to_string()));
    assert_eq!(scope.eval_key("namespace"), Some("storage".to_string()));
    assert_eq!(scope.eval_key("qosclass"), Some("Guaranteed".to_string()));
    assert_eq!(scope.eval_key("pod"), Some("postgres-0".to_string()));
    assert_eq!(scope.eval_key("pod/name"), Some("postgres-0".to_string()));
    assert_eq!(scope.eval_key("pod/uid"), Some("uid-1".to_string()));
    assert_eq!(scope.eval_key("pod/labels/app"), Some("db".to_string()));
    assert_eq!(scope.eval_key("labels/role"), Some("primary".to_string()));
    assert_eq!(scope.eval_key("labels/missing"), None);
    assert_eq!(scope.eval_key("nonsense"), None);
}

#[test]
// Joint keys evaluate sub-keys and join the results with the value
// separator.
fn test_joint_key() {
    let pod = pod();
    let container = container();
    let scope = EvalContext::new(&container, Some(&pod));

    assert_eq!(
        scope.eval_key(":,/namespace,name"),
        Some("storage/postgres".to_string())
    );
    // a missing sub-key poisons the whole joint key
    assert_eq!(scope.eval_key(":,/namespace,labels/missing"), None);
}

#[test]
// All operators behave as documented.
fn test_operators() {
    let pod = pod();
    let container = container();
    let scope = EvalContext::new(&container, Some(&pod));

    assert!(expr("name", Operator::Equals, &["postgres"]).evaluate(&scope));
    assert!(!expr("name", Operator::Equals, &["mysql"]).evaluate(&scope));
    assert!(expr("name", Operator::NotEqual, &["mysql"]).evaluate(&scope));
    assert!(expr("name", Operator::In, &["mysql", "postgres"]).evaluate(&scope));
    assert!(expr("name", Operator::NotIn, &["a", "b"]).evaluate(&scope));
    assert!(!expr("name", Operator::NotIn, &["postgres"]).evaluate(&scope));
    assert!(expr("labels/role", Operator::Exists, &[]).evaluate(&scope));
    assert!(expr("labels/other", Operator::NotExist, &[]).evaluate(&scope));
    assert!(expr("name", Operator::Matches, &["post*"]).evaluate(&scope));
    assert!(expr("name", Operator::MatchesNot, &["mysql-?"]).evaluate(&scope));
    assert!(expr("name", Operator::MatchesAny, &["x*", "*gres"]).evaluate(&scope));
    assert!(expr("name", Operator::MatchesNone, &["x*", "y*"]).evaluate(&scope));
    assert!(expr("anything", Operator::AlwaysTrue, &[]).evaluate(&scope));
}

#[test]
// Glob patterns anchor at both ends and only know * and ?.
fn test_glob_semantics() {
    use balloons_policy::core::expression::glob_matches;
    assert!(glob_matches("*", "anything"));
    assert!(glob_matches("kube-*", "kube-system"));
    assert!(!glob_matches("kube-*", "not-kube-system"));
    assert!(glob_matches("pod-?", "pod-1"));
    assert!(!glob_matches("pod-?", "pod-12"));
    assert!(glob_matches("a.b", "a.b"));
    assert!(!glob_matches("a.b", "aXb"));
}

#[test]
// groupBy templates interpolate ${key} and $key, missing keys become
// empty.
fn test_interpolation() {
    let pod = pod();
    let container = container();
    let scope = EvalContext::new(&container, Some(&pod));

    assert_eq!(scope.interpolate("${namespace}"), "storage");
    assert_eq!(scope.interpolate("ns-${namespace}-x"), "ns-storage-x");
    assert_eq!(scope.interpolate("$namespace"), "storage");
    assert_eq!(scope.interpolate("${pod/labels/app}/${name}"), "db/postgres");
    assert_eq!(scope.interpolate("${missing}"), "");
    assert_eq!(scope.interpolate("no refs"), "no refs");
    assert_eq!(scope.interpolate("a$"), "a$");
}

#[test]
// Expressions round-trip through YAML with the documented field names.
fn test_yaml_shape() {
    let yaml = "key: pod/labels/app\noperator: In\nvalues: [db, cache]\n";
    let e: Expression = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(e.key, "pod/labels/app");
    assert_eq!(e.op, Operator::In);
    assert_eq!(e.values, vec!["db".to_string(), "cache".to_string()]);
}
