use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;

use balloons_policy::core::config::CpuClass;
use balloons_policy::core::cpu_class::{CpuClassController, RecordingCpuControl};
use balloons_topology::fake::FakeSystem;

fn classes() -> IndexMap<String, CpuClass> {
    let mut map = IndexMap::new();
    map.insert(
        "gold".to_string(),
        CpuClass {
            min_freq: Some(2_500_000),
            max_freq: Some(3_600_000),
            uncore_min_freq: Some(1_500_000),
            uncore_max_freq: Some(2_400_000),
            disabled_idle_states: vec!["C6".to_string()],
        },
    );
    map.insert(
        "silver".to_string(),
        CpuClass {
            uncore_min_freq: Some(1_800_000),
            ..Default::default()
        },
    );
    map
}

fn controller() -> (CpuClassController, Rc<RefCell<RecordingCpuControl>>) {
    let system = Rc::new(FakeSystem::canonical().build().unwrap());
    let control = Rc::new(RefCell::new(RecordingCpuControl::default()));
    let controller = CpuClassController::new(system, classes(), Box::new(control.clone()));
    (controller, control)
}

#[test]
// A class writes its frequency limits and disables the listed idle states.
fn test_apply_class() {
    let (mut controller, control) = controller();
    let mut changes = BTreeMap::new();
    changes.insert(0, Some("gold".to_string()));
    controller.assign_many(&changes);

    let rec = control.borrow();
    assert_eq!(rec.freq[&0], (2_500_000, 3_600_000));
    assert!(rec.disabled_idle[&0].contains("C6"));
    assert!(!rec.disabled_idle[&0].contains("C1"));
}

#[test]
// Unassigning restores the hardware range and re-enables idle states.
fn test_unassign_restores_defaults() {
    let (mut controller, control) = controller();
    let mut changes = BTreeMap::new();
    changes.insert(0, Some("gold".to_string()));
    controller.assign_many(&changes);
    changes.insert(0, None);
    controller.assign_many(&changes);

    let rec = control.borrow();
    assert_eq!(rec.freq[&0], (400_000, 3_800_000));
    assert!(rec.disabled_idle[&0].is_empty());
}

#[test]
// Uncore limits aggregate across a zone: the largest minimum and the
// smallest maximum win.
fn test_uncore_aggregation() {
    let (mut controller, control) = controller();
    let mut changes = BTreeMap::new();
    changes.insert(0, Some("gold".to_string()));
    changes.insert(1, Some("silver".to_string()));
    controller.assign_many(&changes);

    let rec = control.borrow();
    assert_eq!(rec.uncore[&(0, 0)], (Some(1_800_000), Some(2_400_000)));
    assert!(!rec.uncore.contains_key(&(1, 0)));
}

#[test]
// Re-applying the current class writes nothing.
fn test_idempotent() {
    let (mut controller, control) = controller();
    let mut changes = BTreeMap::new();
    changes.insert(0, Some("gold".to_string()));
    controller.assign_many(&changes);

    // any further write would fail loudly
    control.borrow_mut().fail = true;
    controller.assign_many(&changes);
    assert_eq!(controller.failures(), 0);
}

#[test]
// Failures are counted, not propagated.
fn test_failures_counted() {
    let (mut controller, control) = controller();
    control.borrow_mut().fail = true;
    let mut changes = BTreeMap::new();
    changes.insert(0, Some("gold".to_string()));
    controller.assign_many(&changes);
    assert!(controller.failures() > 0);
}
