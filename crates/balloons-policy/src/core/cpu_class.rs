//! CPU class controller: applies per-CPU tuning when balloon membership
//! changes.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, warn};

use balloons_topology::system::System;

use crate::core::config::CpuClass;

/// Host tuning interface. The sysfs-backed implementation lives outside the
/// policy; tests use [`RecordingCpuControl`].
pub trait CpuControl {
    fn set_freq_limits(&mut self, cpu: usize, min: u64, max: u64) -> std::result::Result<(), String>;
    fn set_uncore_limits(
        &mut self,
        package: usize,
        die: usize,
        min: Option<u64>,
        max: Option<u64>,
    ) -> std::result::Result<(), String>;
    fn set_idle_state(&mut self, cpu: usize, state: &str, disabled: bool)
        -> std::result::Result<(), String>;
}

/// Discards all tuning requests. Used when the host offers no tuning
/// interface.
#[derive(Default)]
pub struct NullCpuControl;

impl CpuControl for NullCpuControl {
    fn set_freq_limits(&mut self, _cpu: usize, _min: u64, _max: u64) -> std::result::Result<(), String> {
        Ok(())
    }

    fn set_uncore_limits(
        &mut self,
        _package: usize,
        _die: usize,
        _min: Option<u64>,
        _max: Option<u64>,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    fn set_idle_state(
        &mut self,
        _cpu: usize,
        _state: &str,
        _disabled: bool,
    ) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Remembers every write; the test double for [`CpuControl`].
#[derive(Default)]
pub struct RecordingCpuControl {
    pub freq: BTreeMap<usize, (u64, u64)>,
    pub uncore: BTreeMap<(usize, usize), (Option<u64>, Option<u64>)>,
    pub disabled_idle: BTreeMap<usize, BTreeSet<String>>,
    /// When set, every call fails; exercises the non-fatal error path.
    pub fail: bool,
}

impl CpuControl for RecordingCpuControl {
    fn set_freq_limits(&mut self, cpu: usize, min: u64, max: u64) -> std::result::Result<(), String> {
        if self.fail {
            return Err("injected failure".to_string());
        }
        self.freq.insert(cpu, (min, max));
        Ok(())
    }

    fn set_uncore_limits(
        &mut self,
        package: usize,
        die: usize,
        min: Option<u64>,
        max: Option<u64>,
    ) -> std::result::Result<(), String> {
        if self.fail {
            return Err("injected failure".to_string());
        }
        self.uncore.insert((package, die), (min, max));
        Ok(())
    }

    fn set_idle_state(
        &mut self,
        cpu: usize,
        state: &str,
        disabled: bool,
    ) -> std::result::Result<(), String> {
        if self.fail {
            return Err("injected failure".to_string());
        }
        let states = self.disabled_idle.entry(cpu).or_default();
        if disabled {
            states.insert(state.to_string());
        } else {
            states.remove(state);
        }
        Ok(())
    }
}

/// Shares one control between the controller and a test looking at it.
impl<T: CpuControl> CpuControl for std::rc::Rc<std::cell::RefCell<T>> {
    fn set_freq_limits(&mut self, cpu: usize, min: u64, max: u64) -> std::result::Result<(), String> {
        self.borrow_mut().set_freq_limits(cpu, min, max)
    }

    fn set_uncore_limits(
        &mut self,
        package: usize,
        die: usize,
        min: Option<u64>,
        max: Option<u64>,
    ) -> std::result::Result<(), String> {
        self.borrow_mut().set_uncore_limits(package, die, min, max)
    }

    fn set_idle_state(
        &mut self,
        cpu: usize,
        state: &str,
        disabled: bool,
    ) -> std::result::Result<(), String> {
        self.borrow_mut().set_idle_state(cpu, state, disabled)
    }
}

/// Applies CPU classes idempotently and aggregates uncore limits per
/// (package, die) zone. Tuning failures are counted and logged, never fatal.
pub struct CpuClassController {
    system: Rc<System>,
    classes: IndexMap<String, CpuClass>,
    /// Effective class per CPU; absent means untouched hardware defaults.
    assigned: BTreeMap<usize, Option<String>>,
    /// Last written limits per uncore zone.
    uncore_written: BTreeMap<(usize, usize), (Option<u64>, Option<u64>)>,
    control: Box<dyn CpuControl>,
    failures: u64,
}

impl CpuClassController {
    pub fn new(system: Rc<System>, classes: IndexMap<String, CpuClass>, control: Box<dyn CpuControl>) -> Self {
        Self {
            system,
            classes,
            assigned: BTreeMap::new(),
            uncore_written: BTreeMap::new(),
            control,
            failures: 0,
        }
    }

    /// Replaces the class definitions and re-applies every assignment.
    pub fn set_classes(&mut self, classes: IndexMap<String, CpuClass>) {
        self.classes = classes;
        let assigned: Vec<(usize, Option<String>)> =
            self.assigned.iter().map(|(cpu, class)| (*cpu, class.clone())).collect();
        self.assigned.clear();
        for (cpu, class) in assigned {
            self.assign(cpu, class.as_deref());
        }
        self.apply_uncore();
    }

    /// Assigns a class (or hardware defaults for `None`) to one CPU.
    /// Re-assigning the current class is a no-op.
    pub fn assign(&mut self, cpu: usize, class: Option<&str>) {
        let class = class.map(|c| c.to_string());
        if self.assigned.get(&cpu) == Some(&class) {
            return;
        }
        let info = self.system.cpu(cpu).clone();
        let def = match &class {
            Some(name) => match self.classes.get(name) {
                Some(def) => def.clone(),
                None => {
                    warn!(target: "cpu-class", "unknown cpu class {:?} for cpu {}", name, cpu);
                    CpuClass::default()
                }
            },
            None => CpuClass::default(),
        };
        debug!(target: "cpu-class", "cpu {}: applying class {:?}", cpu, class);

        let min = def.min_freq.unwrap_or(info.min_freq);
        let max = def.max_freq.unwrap_or(info.max_freq);
        if min != 0 || max != 0 {
            if let Err(e) = self.control.set_freq_limits(cpu, min, max) {
                self.record_failure(&format!("freq limits of cpu {}: {}", cpu, e));
            }
        }
        for state in &info.idle_states {
            let disabled = def.disabled_idle_states.contains(state);
            if let Err(e) = self.control.set_idle_state(cpu, state, disabled) {
                self.record_failure(&format!("idle state {} of cpu {}: {}", state, cpu, e));
            }
        }
        self.assigned.insert(cpu, class);
    }

    /// Assigns a batch of CPUs and refreshes the uncore zones afterwards.
    pub fn assign_many(&mut self, changes: &BTreeMap<usize, Option<String>>) {
        for (cpu, class) in changes {
            self.assign(*cpu, class.as_deref());
        }
        self.apply_uncore();
    }

    /// Recomputes and writes the uncore limits of every zone. Within a zone
    /// the largest `uncoreMinFreq` and the smallest `uncoreMaxFreq` of the
    /// assigned classes win.
    pub fn apply_uncore(&mut self) {
        let mut zones: BTreeMap<(usize, usize), (Option<u64>, Option<u64>)> = BTreeMap::new();
        for (cpu, class) in &self.assigned {
            let Some(name) = class else { continue };
            let Some(def) = self.classes.get(name) else { continue };
            if def.uncore_min_freq.is_none() && def.uncore_max_freq.is_none() {
                continue;
            }
            let zone = self.system.uncore_zone_of(*cpu);
            let entry = zones.entry(zone).or_default();
            if let Some(min) = def.uncore_min_freq {
                entry.0 = Some(entry.0.map_or(min, |v: u64| v.max(min)));
            }
            if let Some(max) = def.uncore_max_freq {
                entry.1 = Some(entry.1.map_or(max, |v: u64| v.min(max)));
            }
        }
        let mut writes = Vec::new();
        // zones that lost their last uncore class fall back to no limits
        for zone in self.uncore_written.keys() {
            if !zones.contains_key(zone) {
                writes.push((*zone, (None, None)));
            }
        }
        for (zone, limits) in zones {
            if self.uncore_written.get(&zone) != Some(&limits) {
                writes.push((zone, limits));
            }
        }
        for ((package, die), (min, max)) in writes {
            match self.control.set_uncore_limits(package, die, min, max) {
                Ok(()) => {
                    if min.is_none() && max.is_none() {
                        self.uncore_written.remove(&(package, die));
                    } else {
                        self.uncore_written.insert((package, die), (min, max));
                    }
                }
                Err(e) => {
                    self.record_failure(&format!("uncore limits of package {} die {}: {}", package, die, e));
                }
            }
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn record_failure(&mut self, what: &str) {
        warn!(target: "cpu-class", "tuning failed: {}", what);
        self.failures += 1;
    }
}
