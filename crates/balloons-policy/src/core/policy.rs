//! The balloons placement policy.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, info, warn};

use balloons_topology::cpuset::CpuSet;
use balloons_topology::system::{CoreKind, CpuPriority, MemType, System};

use crate::core::allocator::CpuAllocator;
use crate::core::annotations;
use crate::core::balloon::{Balloon, BalloonState};
use crate::core::cache::{Cache, ContainerInfo, PodInfo};
use crate::core::config::{
    BalloonType, BalloonsConfig, ComponentCreation, CpuAmount, LoadLevel, ShareScope, DEFAULT_TYPE,
    RESERVED_TYPE, SYSTEM_NAMESPACE,
};
use crate::core::cpu_class::{CpuClassController, CpuControl};
use crate::core::error::{Error, Result};
use crate::core::expression::{glob_matches, EvalContext};

/// The balloons policy engine.
///
/// Owns the balloon set and drives every placement decision. All methods run
/// on the single event loop; the container cache is shared with the runtime
/// adapter through `Rc<RefCell<..>>`.
pub struct BalloonsPolicy {
    system: Rc<System>,
    allocator: CpuAllocator,
    config: BalloonsConfig,
    /// Effective balloon types: reserved, then user types in declaration
    /// order, then default.
    types: IndexMap<String, BalloonType>,
    cache: Rc<RefCell<Cache>>,
    classes: CpuClassController,
    balloons: Vec<Balloon>,
    /// Known devices: name to NUMA node, used by `preferCloseToDevices`.
    devices: BTreeMap<String, usize>,
    created_seq: u64,
    /// Size the reserved balloon keeps at minimum.
    reserved_floor: usize,
}

impl BalloonsPolicy {
    pub fn new(
        system: Rc<System>,
        config: BalloonsConfig,
        cache: Rc<RefCell<Cache>>,
        control: Box<dyn CpuControl>,
        devices: BTreeMap<String, usize>,
    ) -> Result<Self> {
        config.validate()?;
        let classes = CpuClassController::new(system.clone(), config.cpu_classes.clone(), control);
        let mut policy = Self {
            allocator: CpuAllocator::new(system.clone()),
            types: effective_types(&config),
            system,
            config,
            cache,
            classes,
            balloons: Vec::new(),
            devices,
            created_seq: 0,
            reserved_floor: 0,
        };
        policy.start()?;
        Ok(policy)
    }

    pub fn config(&self) -> &BalloonsConfig {
        &self.config
    }

    pub fn balloons(&self) -> &[Balloon] {
        &self.balloons
    }

    pub fn balloon(&self, name: &str) -> Option<&Balloon> {
        self.balloons.iter().find(|b| b.name == name)
    }

    pub fn tuning_failures(&self) -> u64 {
        self.classes.failures()
    }

    /// Creates the built-in reserved balloon and the pre-created instances
    /// of every `minBalloons` type.
    fn start(&mut self) -> Result<()> {
        self.create_reserved_balloon()?;
        self.ensure_min_balloons()?;
        self.retune();
        self.refresh_decisions();
        Ok(())
    }

    /// Pre-creates the missing instances of every `minBalloons` type.
    fn ensure_min_balloons(&mut self) -> Result<()> {
        let type_names: Vec<String> = self.types.keys().cloned().collect();
        for name in type_names {
            let t = self.types[&name].clone();
            if t.is_unconstructible() {
                if t.min_balloons > 0 {
                    return Err(Error::InvalidConfiguration(format!(
                        "balloon type {:?} is unconstructible but has minBalloons {}",
                        t.name, t.min_balloons
                    )));
                }
                continue;
            }
            while self.instances_of(&name) < t.min_balloons {
                self.create_balloon(&name, t.effective_min_cpus(), None, None, None)?;
            }
        }
        Ok(())
    }

    fn create_reserved_balloon(&mut self) -> Result<()> {
        if self.balloon(&format!("{}[0]", RESERVED_TYPE)).is_some() {
            return Ok(());
        }
        let spec = self.config.reserved_resources.cpu.clone();
        let rtype = self.types[RESERVED_TYPE].clone();
        let cpus = match spec.as_deref().map(CpuAmount::parse).transpose()? {
            Some(CpuAmount::Cpuset(set)) => set.intersection(&self.system.online_cpus()),
            Some(CpuAmount::Milli(milli)) => {
                let count = (milli as usize + 999) / 1000;
                let count = count.max(rtype.effective_min_cpus()).max(1);
                self.allocator
                    .allocate(&self.free_pool(), count, Some(CpuPriority::Low))?
            }
            None => self
                .allocator
                .allocate(&self.free_pool(), rtype.effective_min_cpus().max(1), Some(CpuPriority::Low))?,
        };
        self.reserved_floor = cpus.size();
        let mut balloon = self.new_balloon_shell(RESERVED_TYPE);
        balloon.cpus = cpus;
        info!(target: "policy", "reserved balloon {} gets cpus {}", balloon.name, balloon.cpus);
        self.balloons.push(balloon);
        Ok(())
    }

    // ------------------------------------------------------------------
    // container operations
    // ------------------------------------------------------------------

    /// Assigns a newly created container to a balloon and records its
    /// allowed CPU and memory sets. No state changes survive a failure.
    pub fn allocate_resources(&mut self, container_id: &str) -> Result<()> {
        let (container, pod) = self.lookup(container_id)?;

        // re-placement of an already assigned container starts clean
        if let Some(previous) = container.balloon.clone() {
            self.detach(&previous, container_id);
        }

        if self.is_preserved(&container, pod.as_ref()) {
            debug!(target: "policy", "container {} is preserved", container.name);
            let mut cache = self.cache.borrow_mut();
            if let Some(c) = cache.container_mut(container_id) {
                c.preserve = true;
            }
            cache.record_decision(container_id, None, None, None);
            return Ok(());
        }

        let type_name = self.desired_type(&container, pod.as_ref())?;
        let t = self.types[&type_name].clone();
        if t.is_unconstructible() {
            return Err(Error::unassignable(
                &container.name,
                format!("balloon type {:?} forbids construction", type_name),
            ));
        }

        let group_key = self.group_key(&t, &container, pod.as_ref());
        let balloon_name = self
            .choose_balloon(&t, &container, pod.as_ref(), &group_key)
            .map_err(|e| as_unassignable(&container.name, e))?;

        if let Err(e) = self.attach(&balloon_name, container_id, &container) {
            // a balloon created just for this container must not linger
            let unneeded = self.balloon(&balloon_name).map_or(false, |b| {
                b.containers.is_empty() && b.state == BalloonState::Planned
            });
            if unneeded && self.instances_of(&t.name) > t.min_balloons {
                self.destroy_balloon(&balloon_name);
            }
            return Err(as_unassignable(&container.name, e));
        }
        self.retune();
        self.refresh_decisions();
        self.cache.borrow_mut().clear_pending(container_id);
        Ok(())
    }

    /// Re-evaluates a container after a resource update. The container
    /// migrates when the configuration now matches it to a different type.
    pub fn update_resources(&mut self, container_id: &str) -> Result<()> {
        let (container, pod) = self.lookup(container_id)?;
        if container.preserve {
            return Ok(());
        }
        let current = container.balloon.clone();
        let desired = self.desired_type(&container, pod.as_ref())?;
        let current_type = current
            .as_ref()
            .and_then(|name| self.balloon(name))
            .map(|b| b.btype.clone());

        if current.is_none() || current_type.as_deref() != Some(desired.as_str()) {
            // live-migrate, restoring everything when the new home rejects it
            let saved_balloons = self.balloons.clone();
            let saved_cache = self.cache.borrow().clone();
            if let Some(name) = current {
                self.detach(&name, container_id);
            }
            return match self.allocate_resources(container_id) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.balloons = saved_balloons;
                    *self.cache.borrow_mut() = saved_cache;
                    self.retune();
                    self.refresh_decisions();
                    Err(e)
                }
            };
        }

        // same balloon, new request: resize in place
        let name = current.unwrap();
        let target = self.target_size_with(&name, None);
        self.resize_balloon(&name, target)?;
        self.retune();
        self.refresh_decisions();
        Ok(())
    }

    /// Releases the container's slot; its balloon deflates and possibly
    /// goes away.
    pub fn release_resources(&mut self, container_id: &str) -> Result<()> {
        let balloon_name = {
            let cache = self.cache.borrow();
            cache.container(container_id).and_then(|c| c.balloon.clone())
        };
        if let Some(name) = balloon_name {
            self.detach(&name, container_id);
        }
        self.retune();
        self.refresh_decisions();
        Ok(())
    }

    /// Re-places every active container already present in the cache, used
    /// on startup synchronization. Failures are reported per container and
    /// leave the container unassigned.
    pub fn sync(&mut self) -> Vec<(String, Error)> {
        let ids: Vec<String> = {
            let cache = self.cache.borrow();
            let mut ids: Vec<String> = cache.active_containers().map(|c| c.id.clone()).collect();
            ids.sort();
            ids
        };
        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.allocate_resources(&id) {
                warn!(target: "policy", "sync: cannot place container {}: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }

    /// Applies a new configuration atomically: on any error the previous
    /// state is restored and reported back.
    pub fn reconfigure(&mut self, new_config: BalloonsConfig) -> Result<()> {
        new_config.validate()?;
        let saved_config = self.config.clone();
        let saved_types = self.types.clone();
        let saved_balloons = self.balloons.clone();
        let saved_floor = self.reserved_floor;
        let saved_cache = self.cache.borrow().clone();

        match self.apply_config(new_config) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(target: "policy", "reconfiguration failed, reverting: {}", e);
                self.config = saved_config;
                self.types = saved_types;
                self.balloons = saved_balloons;
                self.reserved_floor = saved_floor;
                *self.cache.borrow_mut() = saved_cache;
                self.classes.set_classes(self.config.cpu_classes.clone());
                self.retune();
                self.refresh_decisions();
                Err(e)
            }
        }
    }

    fn apply_config(&mut self, new_config: BalloonsConfig) -> Result<()> {
        self.config = new_config;
        self.types = effective_types(&self.config);
        self.classes.set_classes(self.config.cpu_classes.clone());

        // balloons of erased types go away; their containers are re-placed
        let mut orphans: Vec<String> = Vec::new();
        let doomed: Vec<String> = self
            .balloons
            .iter()
            .filter(|b| !self.types.contains_key(&b.btype))
            .map(|b| b.name.clone())
            .collect();
        for name in doomed {
            if let Some(b) = self.balloon(&name) {
                orphans.extend(b.containers.iter().cloned());
            }
            self.destroy_balloon(&name);
        }

        self.apply_reserved_config()?;

        // surviving balloons shrink or grow into the new type limits;
        // component balloons are resized through their composite
        let survivors: Vec<String> = self
            .balloons
            .iter()
            .filter(|b| b.parent.is_none())
            .map(|b| b.name.clone())
            .collect();
        for name in survivors {
            let target = self.target_size_with(&name, None);
            self.resize_balloon(&name, target)?;
        }

        // pre-create newly required instances
        self.ensure_min_balloons()?;

        for id in orphans {
            {
                let mut cache = self.cache.borrow_mut();
                if let Some(c) = cache.container_mut(&id) {
                    c.balloon = None;
                }
            }
            self.allocate_resources(&id)?;
        }

        self.retune();
        self.refresh_decisions();
        Ok(())
    }

    /// Re-pins the reserved balloon after a configuration change.
    fn apply_reserved_config(&mut self) -> Result<()> {
        let name = format!("{}[0]", RESERVED_TYPE);
        if self.balloon(&name).is_none() {
            return self.create_reserved_balloon();
        }
        match self.config.reserved_resources.cpu.as_deref().map(CpuAmount::parse).transpose()? {
            Some(CpuAmount::Cpuset(set)) => {
                let cpus = set.intersection(&self.system.online_cpus());
                self.reserved_floor = cpus.size();
                if let Some(b) = self.balloons.iter_mut().find(|b| b.name == name) {
                    b.cpus = cpus;
                }
            }
            Some(CpuAmount::Milli(milli)) => {
                self.reserved_floor = ((milli as usize) + 999) / 1000;
            }
            None => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // type and balloon selection
    // ------------------------------------------------------------------

    fn lookup(&self, container_id: &str) -> Result<(ContainerInfo, Option<PodInfo>)> {
        let cache = self.cache.borrow();
        let container = cache
            .container(container_id)
            .cloned()
            .ok_or_else(|| Error::unassignable(container_id, "unknown container"))?;
        let pod = cache.pod(&container.pod_id).cloned();
        Ok((container, pod))
    }

    fn is_preserved(&self, container: &ContainerInfo, pod: Option<&PodInfo>) -> bool {
        if let Some(pod) = pod {
            if annotations::preserve_cpu(&pod.annotations, &container.name) == Some(true)
                || annotations::preserve_memory(&pod.annotations, &container.name) == Some(true)
            {
                return true;
            }
        }
        if let Some(preserve) = &self.config.preserve {
            let scope = EvalContext::new(container, pod);
            if preserve.match_expressions.iter().any(|e| e.evaluate(&scope)) {
                return true;
            }
        }
        false
    }

    /// The desired balloon type of a container, in the documented priority
    /// order: explicit annotation, reserved namespace, expression match,
    /// namespace glob, built-in default.
    fn desired_type(&self, container: &ContainerInfo, pod: Option<&PodInfo>) -> Result<String> {
        if let Some(pod) = pod {
            if let Some(name) = annotations::balloon_type(&pod.annotations, &container.name) {
                if !self.types.contains_key(name) {
                    return Err(Error::unassignable(
                        &container.name,
                        format!("annotated balloon type {:?} does not exist", name),
                    ));
                }
                return Ok(name.clone());
            }
        }

        let namespace = pod.map(|p| p.namespace.as_str()).unwrap_or("");
        if namespace == SYSTEM_NAMESPACE
            || self
                .config
                .reserved_pool_namespaces
                .iter()
                .any(|glob| glob_matches(glob, namespace))
        {
            return Ok(RESERVED_TYPE.to_string());
        }

        let scope = EvalContext::new(container, pod);
        for t in &self.config.balloon_types {
            if t.match_expressions.is_empty() {
                continue;
            }
            if t.match_expressions.iter().all(|e| e.evaluate(&scope)) {
                return Ok(t.name.clone());
            }
        }
        for t in &self.config.balloon_types {
            if t.namespaces.iter().any(|glob| glob_matches(glob, namespace)) {
                return Ok(t.name.clone());
            }
        }
        Ok(DEFAULT_TYPE.to_string())
    }

    fn group_key(&self, t: &BalloonType, container: &ContainerInfo, pod: Option<&PodInfo>) -> Option<String> {
        let template = t.group_by.as_ref()?;
        let scope = EvalContext::new(container, pod);
        Some(scope.interpolate(template))
    }

    /// The balloon selection ladder: a fresh balloon when the type prefers
    /// those, the tightest existing fit, an inflatable existing balloon,
    /// a new balloon, or rejection.
    fn choose_balloon(
        &mut self,
        t: &BalloonType,
        container: &ContainerInfo,
        pod: Option<&PodInfo>,
        group_key: &Option<String>,
    ) -> Result<String> {
        let request = container.cpu_request;
        let prefer_kind = t
            .prefer_core_type
            .or_else(|| pod.and_then(|p| annotations::prefer_core_type(&p.annotations, &container.name)));

        // reserved containers always join the reserved balloon
        if t.name == RESERVED_TYPE {
            return Ok(format!("{}[0]", RESERVED_TYPE));
        }

        let can_create = self.instances_of(&t.name) < t.effective_max_balloons();
        let create_size = self.initial_size(t, request);

        if t.prefer_new_balloons && can_create && self.creation_feasible(t, create_size) {
            return self.create_balloon(&t.name, create_size, group_key.clone(), prefer_kind, None);
        }

        // tightest existing balloon that can host without growing
        let mut fitting: Vec<(u64, i64, u64, String)> = Vec::new();
        for b in self.candidate_balloons(t, group_key) {
            let excess = self.excess_milli(b);
            if excess >= request as i64 {
                let spread_penalty = if t.prefer_spread_pods && self.hosts_pod(b, &container.pod_id) {
                    1
                } else {
                    0
                };
                let ns_penalty = if t.prefer_per_namespace_balloon
                    && !self.hosts_namespace(b, pod.map(|p| p.namespace.as_str()).unwrap_or(""))
                {
                    1
                } else {
                    0
                };
                fitting.push((spread_penalty + ns_penalty, excess, b.created, b.name.clone()));
            }
        }
        fitting.sort();
        if let Some((_, _, _, name)) = fitting.into_iter().next() {
            return Ok(name);
        }

        // an existing balloon that may inflate, the ones already close to
        // their devices first
        let mut growable: Vec<(u64, u64, String)> = Vec::new();
        for b in self.candidate_balloons(t, group_key) {
            let needed_milli = self.required_milli(b) + request;
            let target = self.clamp_size(t, needed_milli, b.containers.len() + 1);
            if (target as u64) * 1000 < needed_milli {
                // capped below the demand
                continue;
            }
            let growth = target.saturating_sub(b.cpus.size());
            if growth > self.free_pool_for(t).size() {
                continue;
            }
            let device_rank = if t.prefer_close_to_devices.is_empty() {
                0u64
            } else {
                let near = t
                    .prefer_close_to_devices
                    .iter()
                    .filter_map(|d| self.devices.get(d))
                    .any(|node| !b.cpus.intersection(&self.system.node_cpus(*node)).is_empty());
                u64::from(!near)
            };
            growable.push((device_rank, b.created, b.name.clone()));
        }
        growable.sort();
        if let Some((_, _, name)) = growable.into_iter().next() {
            return Ok(name);
        }

        if can_create && self.creation_feasible(t, create_size) {
            return self.create_balloon(&t.name, create_size, group_key.clone(), prefer_kind, None);
        }

        Err(Error::unassignable(
            &container.name,
            format!("no balloon of type {:?} can host the container", t.name),
        ))
    }

    fn candidate_balloons<'a>(
        &'a self,
        t: &'a BalloonType,
        group_key: &'a Option<String>,
    ) -> impl Iterator<Item = &'a Balloon> {
        self.balloons.iter().filter(move |b| {
            b.btype == t.name
                && b.parent.is_none()
                && b.state != BalloonState::Removing
                && (t.group_by.is_none() || &b.group_key == group_key)
        })
    }

    fn hosts_pod(&self, balloon: &Balloon, pod_id: &str) -> bool {
        let cache = self.cache.borrow();
        balloon
            .containers
            .iter()
            .any(|id| cache.container(id).map(|c| c.pod_id == pod_id).unwrap_or(false))
    }

    fn hosts_namespace(&self, balloon: &Balloon, namespace: &str) -> bool {
        let cache = self.cache.borrow();
        balloon.containers.iter().any(|id| {
            cache
                .container(id)
                .and_then(|c| cache.pod(&c.pod_id))
                .map(|p| p.namespace == namespace)
                .unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------
    // balloon lifecycle
    // ------------------------------------------------------------------

    fn new_balloon_shell(&mut self, btype: &str) -> Balloon {
        let instance = (0..)
            .find(|i| {
                let name = format!("{}[{}]", btype, i);
                self.balloon(&name).is_none()
            })
            .unwrap();
        self.created_seq += 1;
        Balloon::new(btype, instance, self.created_seq)
    }

    fn instances_of(&self, btype: &str) -> usize {
        self.balloons.iter().filter(|b| b.btype == btype).count()
    }

    fn initial_size(&self, t: &BalloonType, request_milli: u64) -> usize {
        self.clamp_size(t, request_milli, 1)
    }

    /// Balloon size in CPUs for a total request, honoring the type limits
    /// and keeping at least one CPU while containers are attached.
    fn clamp_size(&self, t: &BalloonType, total_milli: u64, containers: usize) -> usize {
        let mut size = ((total_milli + 999) / 1000) as usize;
        if containers > 0 {
            size = size.max(1);
        }
        size = size.max(t.effective_min_cpus());
        if let Some(max) = t.effective_max_cpus(self.system.cpu_count()) {
            size = size.min(max);
        }
        size
    }

    fn creation_feasible(&self, t: &BalloonType, size: usize) -> bool {
        if t.is_composite() {
            // composites draw through their components
            return true;
        }
        self.free_pool_for(t).size() >= size
    }

    /// Creates a balloon of the given type (and its components for a
    /// composite type) sized to `size` CPUs. Returns the balloon name.
    fn create_balloon(
        &mut self,
        btype: &str,
        size: usize,
        group_key: Option<String>,
        prefer_kind: Option<CoreKind>,
        parent: Option<String>,
    ) -> Result<String> {
        let t = self.types[btype].clone();
        let mut balloon = self.new_balloon_shell(btype);
        balloon.group_key = group_key;
        balloon.prefer_kind = prefer_kind.or(t.prefer_core_type);
        balloon.parent = parent;
        let name = balloon.name.clone();
        self.balloons.push(balloon);

        if t.is_composite() {
            if let Err(e) = self.create_components(&name, &t, size) {
                self.destroy_balloon(&name);
                return Err(e);
            }
            self.refresh_composite_cpus(&name);
        } else if let Err(e) = self.resize_balloon(&name, size) {
            self.destroy_balloon(&name);
            return Err(e);
        }
        debug!(target: "policy", "created balloon {}", name);
        Ok(name)
    }

    fn create_components(&mut self, composite: &str, t: &BalloonType, size: usize) -> Result<()> {
        let chosen: Vec<String> = match t.component_creation {
            ComponentCreation::All => t.components.iter().map(|c| c.balloon_type.clone()).collect(),
            ComponentCreation::BalanceBalloons => {
                // the component type with the fewest live balloons wins,
                // declaration order breaks ties
                let mut best: Option<(usize, String)> = None;
                for c in &t.components {
                    let count = self.instances_of(&c.balloon_type);
                    if best.as_ref().map_or(true, |(n, _)| count < *n) {
                        best = Some((count, c.balloon_type.clone()));
                    }
                }
                vec![best
                    .map(|(_, name)| name)
                    .ok_or_else(|| Error::InvalidConfiguration(format!(
                        "composite type {:?} has no components",
                        t.name
                    )))?]
            }
        };
        let shares = split_evenly(size, chosen.len());
        for (ctype, share) in chosen.iter().zip(shares) {
            let child = self.create_balloon(ctype, share, None, None, Some(composite.to_string()))?;
            if let Some(b) = self.balloons.iter_mut().find(|b| b.name == composite) {
                b.components.push(child);
            }
        }
        Ok(())
    }

    fn refresh_composite_cpus(&mut self, name: &str) {
        let Some(balloon) = self.balloon(name) else { return };
        if !balloon.is_composite() {
            return;
        }
        let mut cpus = CpuSet::new();
        for component in balloon.components.clone() {
            if let Some(c) = self.balloon(&component) {
                cpus.add(&c.cpus);
            }
        }
        let t = self.types[&balloon.btype].clone();
        let hide = t.hide_hyperthreads;
        if let Some(b) = self.balloons.iter_mut().find(|b| b.name == name) {
            b.cpus = cpus.clone();
            b.hidden = if hide {
                cpus.difference(&self.system.pick_one_thread_per_core(&cpus))
            } else {
                CpuSet::new()
            };
        }
        // propagate through nested composites
        let parents: Vec<String> = self
            .balloons
            .iter()
            .filter(|b| b.components.iter().any(|c| c == name))
            .map(|b| b.name.clone())
            .collect();
        for parent in parents {
            self.refresh_composite_cpus(&parent);
        }
    }

    fn destroy_balloon(&mut self, name: &str) {
        let Some(balloon) = self.balloon(name).cloned() else { return };
        for component in &balloon.components {
            self.destroy_balloon(component);
        }
        {
            let mut cache = self.cache.borrow_mut();
            for id in &balloon.containers {
                if let Some(c) = cache.container_mut(id) {
                    c.balloon = None;
                }
            }
        }
        self.balloons.retain(|b| b.name != name);
        debug!(target: "policy", "destroyed balloon {}", name);
    }

    /// Attaches a container; the balloon is resized first so that a failed
    /// inflation leaves nothing behind.
    fn attach(&mut self, balloon_name: &str, container_id: &str, container: &ContainerInfo) -> Result<()> {
        let target = self.target_size_with(balloon_name, Some(container.cpu_request));
        self.resize_balloon(balloon_name, target)?;
        let Some(balloon) = self.balloons.iter_mut().find(|b| b.name == balloon_name) else {
            return Err(Error::unassignable(&container.name, "balloon vanished"));
        };
        balloon.containers.insert(container_id.to_string());
        balloon.on_container_added();
        if let Some(c) = self.cache.borrow_mut().container_mut(container_id) {
            c.balloon = Some(balloon_name.to_string());
        }
        info!(target: "policy", "assigned container {} to balloon {}", container_id, balloon_name);
        Ok(())
    }

    fn detach(&mut self, balloon_name: &str, container_id: &str) {
        let Some(btype) = self.balloon(balloon_name).map(|b| b.btype.clone()) else { return };
        let min_balloons = self.types.get(&btype).map(|t| t.min_balloons).unwrap_or(0);
        {
            let mut cache = self.cache.borrow_mut();
            if let Some(c) = cache.container_mut(container_id) {
                c.balloon = None;
            }
            cache.record_decision(container_id, None, None, None);
            cache.clear_pending(container_id);
        }
        let doomed = {
            let Some(b) = self.balloons.iter_mut().find(|b| b.name == balloon_name) else { return };
            b.containers.remove(container_id);
            let protected = b.instance < min_balloons || b.btype == RESERVED_TYPE;
            b.on_container_removed(protected);
            b.state == BalloonState::Removing
        };
        if doomed {
            self.destroy_balloon(balloon_name);
        } else {
            let target = self.target_size_with(balloon_name, None);
            if let Err(e) = self.resize_balloon(balloon_name, target) {
                warn!(target: "policy", "cannot shrink balloon {}: {}", balloon_name, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // sizing and CPU selection
    // ------------------------------------------------------------------

    fn required_milli(&self, balloon: &Balloon) -> u64 {
        let cache = self.cache.borrow();
        balloon
            .containers
            .iter()
            .filter_map(|id| cache.container(id))
            .map(|c| c.cpu_request)
            .sum()
    }

    /// Milli-CPUs a balloon can still accept without inflation.
    fn excess_milli(&self, balloon: &Balloon) -> i64 {
        (balloon.cpus.size() as i64) * 1000 - self.required_milli(balloon) as i64
    }

    /// The size a balloon should have, optionally with an extra request
    /// about to be attached.
    fn target_size_with(&self, balloon_name: &str, extra_milli: Option<u64>) -> usize {
        let Some(balloon) = self.balloon(balloon_name) else { return 0 };
        let t = &self.types[&balloon.btype];
        let total = self.required_milli(balloon) + extra_milli.unwrap_or(0);
        let containers = balloon.containers.len() + usize::from(extra_milli.is_some());
        let mut size = self.clamp_size(t, total, containers);
        if balloon.btype == RESERVED_TYPE {
            size = size.max(self.reserved_floor);
        }
        size
    }

    /// Resizes a balloon to exactly `target` CPUs. Growth re-allocates the
    /// full target from the balloon's own CPUs plus the free pool, so the
    /// result only depends on the current ownership state; shrinking keeps
    /// the tightest subset.
    fn resize_balloon(&mut self, name: &str, target: usize) -> Result<()> {
        let Some(balloon) = self.balloon(name).cloned() else { return Ok(()) };
        let t = self.types[&balloon.btype].clone();

        if balloon.is_composite() {
            let shares = split_evenly(target, balloon.components.len().max(1));
            for (component, share) in balloon.components.clone().iter().zip(shares) {
                self.resize_balloon(component, share)?;
            }
            self.refresh_composite_cpus(name);
            return Ok(());
        }

        // the reserved balloon pinned to an explicit cpuset never moves
        if balloon.btype == RESERVED_TYPE {
            if let Some(cpu) = &self.config.reserved_resources.cpu {
                if matches!(CpuAmount::parse(cpu), Ok(CpuAmount::Cpuset(_))) {
                    return Ok(());
                }
            }
        }

        if target == balloon.cpus.size() {
            return Ok(());
        }

        let prefer = prefer_of(balloon.prefer_kind);
        let new_cpus = if target < balloon.cpus.size() {
            let (kept, _released) = self.allocator.release(&balloon.cpus, target, prefer)?;
            kept
        } else {
            let from = self.grow_pool(&t, &balloon, target);
            self.allocator.allocate(&from, target, prefer)?
        };

        let hidden = if t.hide_hyperthreads || self.any_container_hides(&balloon) {
            new_cpus.difference(&self.system.pick_one_thread_per_core(&new_cpus))
        } else {
            CpuSet::new()
        };

        if let Some(b) = self.balloons.iter_mut().find(|b| b.name == name) {
            b.cpus = new_cpus;
            b.hidden = hidden;
        }
        self.refresh_parents_of(name);
        Ok(())
    }

    fn any_container_hides(&self, balloon: &Balloon) -> bool {
        let cache = self.cache.borrow();
        balloon.containers.iter().any(|id| {
            let Some(c) = cache.container(id) else { return false };
            let Some(pod) = cache.pod(&c.pod_id) else { return false };
            annotations::hide_hyperthreads(&pod.annotations, &c.name) == Some(true)
        })
    }

    fn refresh_parents_of(&mut self, name: &str) {
        let parents: Vec<String> = self
            .balloons
            .iter()
            .filter(|b| b.components.iter().any(|c| c == name))
            .map(|b| b.name.clone())
            .collect();
        for parent in parents {
            self.refresh_composite_cpus(&parent);
        }
    }

    /// The pool a growing balloon may draw from: its own CPUs plus the free
    /// pool, narrowed by load classes, device affinity, topology balancing
    /// and core spreading whenever the narrowed pool still covers the
    /// demand.
    fn grow_pool(&self, t: &BalloonType, balloon: &Balloon, target: usize) -> CpuSet {
        let mut from = balloon.cpus.union(&self.free_pool_for(t));

        let loaded = self.load_excluded_cpus(t, &balloon.name);
        if !loaded.is_empty() {
            let filtered = from.difference(&loaded);
            if filtered.size() >= target {
                from = filtered;
            }
        }

        if !t.prefer_close_to_devices.is_empty() {
            if let Some(narrowed) = self.device_pool(t, balloon, &from, target) {
                from = narrowed;
            }
        }

        if self.config.allocator_topology_balancing && balloon.cpus.is_empty() {
            // steer fresh balloons to the emptiest package
            let free = self.free_pool_for(t);
            let mut best: Option<(usize, usize)> = None;
            for package in self.system.package_ids() {
                let count = free.intersection(&self.system.package_cpus(package)).size();
                if best.map_or(true, |(n, _)| count > n) {
                    best = Some((count, package));
                }
            }
            if let Some((_, package)) = best {
                let narrowed = from.intersection(&self.system.package_cpus(package));
                if narrowed.size() >= target {
                    from = narrowed;
                }
            }
        }

        if t.prefer_spread_on_physical_cores {
            let spread = self.system.pick_one_thread_per_core(&from);
            if spread.size() >= target {
                from = spread;
            }
        }
        from
    }

    /// CPUs excluded by load classes: topology units already used by other
    /// balloons declaring the same load (and by this balloon itself when the
    /// load overloads its level inside one balloon).
    fn load_excluded_cpus(&self, t: &BalloonType, balloon_name: &str) -> CpuSet {
        let mut excluded = CpuSet::new();
        for load in &t.loads {
            let Some(lc) = self.config.load_class(load) else { continue };
            for b in &self.balloons {
                if b.is_composite() {
                    continue;
                }
                let same = b.name == balloon_name;
                if same && !lc.overloads_level_in_balloon {
                    continue;
                }
                if !same {
                    let Some(bt) = self.types.get(&b.btype) else { continue };
                    if !bt.loads.contains(load) {
                        continue;
                    }
                }
                for cpu in b.cpus.iter() {
                    match lc.level {
                        LoadLevel::Core => excluded.add(&self.system.core_siblings(cpu)),
                        LoadLevel::L2cache => {
                            let info = self.system.cpu(cpu);
                            excluded.add(
                                &self
                                    .system
                                    .cluster_cpus((info.package, info.die, info.cluster)),
                            );
                        }
                    }
                }
            }
        }
        excluded
    }

    /// Narrows the pool towards the NUMA nodes of the type's devices,
    /// avoiding nodes already used by other active balloons declaring the
    /// same devices.
    fn device_pool(&self, t: &BalloonType, balloon: &Balloon, from: &CpuSet, target: usize) -> Option<CpuSet> {
        let mut node_cpus = CpuSet::new();
        let busy = self.device_busy_nodes(t, &balloon.name);
        let mut fallback = CpuSet::new();
        for device in &t.prefer_close_to_devices {
            let Some(node) = self.devices.get(device) else { continue };
            let cpus = self.system.node_cpus(*node).intersection(from);
            fallback.add(&cpus);
            if busy.contains(node) {
                continue;
            }
            node_cpus.add(&cpus);
        }
        if node_cpus.size() >= target {
            return Some(node_cpus);
        }
        if fallback.size() >= target {
            return Some(fallback);
        }
        None
    }

    /// NUMA nodes of active primitive balloons that share a device
    /// preference with this type.
    fn device_busy_nodes(&self, t: &BalloonType, except: &str) -> Vec<usize> {
        let mut nodes = Vec::new();
        for b in &self.balloons {
            if b.name == except || b.is_composite() || b.state != BalloonState::Active {
                continue;
            }
            let Some(bt) = self.types.get(&b.btype) else { continue };
            if !bt
                .prefer_close_to_devices
                .iter()
                .any(|d| t.prefer_close_to_devices.contains(d))
            {
                continue;
            }
            for cpu in b.cpus.iter() {
                let node = self.system.node_of(cpu);
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }

    // ------------------------------------------------------------------
    // pools
    // ------------------------------------------------------------------

    fn allowed_cpus_pool(&self) -> CpuSet {
        let online = self.system.online_cpus();
        match self
            .config
            .available_resources
            .cpu
            .as_deref()
            .map(CpuAmount::parse)
        {
            Some(Ok(CpuAmount::Cpuset(set))) => set.intersection(&online),
            _ => online,
        }
    }

    fn owned_cpus(&self) -> CpuSet {
        let mut owned = CpuSet::new();
        for b in &self.balloons {
            if !b.is_composite() {
                owned.add(&b.cpus);
            }
        }
        owned
    }

    /// CPUs not owned by any primitive balloon.
    fn idle_cpus(&self) -> CpuSet {
        self.allowed_cpus_pool().difference(&self.owned_cpus())
    }

    /// The ordinary free pool: unowned, non-isolated CPUs.
    fn free_pool(&self) -> CpuSet {
        self.idle_cpus().difference(&self.system.isolated_cpus())
    }

    fn free_pool_for(&self, t: &BalloonType) -> CpuSet {
        if t.prefer_isolated_cpus {
            let isolated = self.idle_cpus().intersection(&self.system.isolated_cpus());
            if !isolated.is_empty() {
                return isolated;
            }
        }
        self.free_pool()
    }

    // ------------------------------------------------------------------
    // decisions and tuning
    // ------------------------------------------------------------------

    /// Rewrites the class assignment of every CPU: the owning balloon's
    /// class, or the idle class for unowned CPUs. The controller skips
    /// writes that change nothing.
    fn retune(&mut self) {
        let mut changes: BTreeMap<usize, Option<String>> = BTreeMap::new();
        for cpu in self.allowed_cpus_pool().iter() {
            changes.insert(cpu, self.config.idle_cpu_class.clone());
        }
        for b in &self.balloons {
            if b.is_composite() {
                continue;
            }
            let class = self.types.get(&b.btype).and_then(|t| t.cpu_class.clone());
            for cpu in b.cpus.iter() {
                changes.insert(cpu, class.clone());
            }
        }
        self.classes.assign_many(&changes);
    }

    /// Recomputes allowed CPU and memory sets for every active container.
    /// Only containers whose sets actually changed are marked for a runtime
    /// update.
    fn refresh_decisions(&mut self) {
        let ids: Vec<String> = {
            let cache = self.cache.borrow();
            cache.active_containers().map(|c| c.id.clone()).collect()
        };
        for id in ids {
            let (container, pod) = match self.lookup(&id) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if container.preserve {
                continue;
            }
            let Some(balloon_name) = container.balloon.clone() else { continue };
            let Some(balloon) = self.balloon(&balloon_name).cloned() else { continue };
            let t = self.types[&balloon.btype].clone();

            let mut cpus = balloon.visible_cpus();
            if let Some(scope) = t.share_idle_cpus_in_same {
                cpus.add(&self.shared_idle_cpus(&balloon, scope));
            }

            let mem_types: Vec<MemType> = pod
                .as_ref()
                .and_then(|p| annotations::memory_types(&p.annotations, &container.name))
                .unwrap_or_else(|| t.memory_types.clone());
            let mems = self.system.closest_nodes_with_types(&cpus, &mem_types);

            let pin_cpu = t.pin_cpu.unwrap_or(self.config.pin_cpu);
            let pin_mem = t.pin_memory.unwrap_or(self.config.pin_memory);
            self.cache.borrow_mut().record_decision(
                &id,
                Some(balloon_name),
                pin_cpu.then_some(cpus),
                pin_mem.then_some(mems),
            );
        }
    }

    /// Idle CPUs within the balloon's locality, visible to its containers
    /// when the type shares idle CPUs.
    fn shared_idle_cpus(&self, balloon: &Balloon, scope: ShareScope) -> CpuSet {
        let idle = self.idle_cpus();
        let mut shared = CpuSet::new();
        for cpu in balloon.cpus.iter() {
            let info = self.system.cpu(cpu);
            let locality = match scope {
                ShareScope::System => self.allowed_cpus_pool(),
                ShareScope::Package => self.system.package_cpus(info.package),
                ShareScope::Die => self.system.die_cpus(info.package, info.die),
                ShareScope::Numa => self.system.node_cpus(info.node),
                ShareScope::L2cache => {
                    self.system.cluster_cpus((info.package, info.die, info.cluster))
                }
                ShareScope::Core => info.siblings.clone(),
            };
            shared.add(&locality.intersection(&idle));
        }
        shared
    }

    // ------------------------------------------------------------------
    // snapshot for metrics and topology export
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> PolicySnapshot {
        let cache = self.cache.borrow();
        let mut balloons = Vec::new();
        for b in &self.balloons {
            let t = self.types.get(&b.btype);
            let shared = match t.and_then(|t| t.share_idle_cpus_in_same) {
                Some(scope) => self.shared_idle_cpus(b, scope),
                None => CpuSet::new(),
            };
            let mut containers: Vec<String> = b.containers.iter().cloned().collect();
            containers.sort();
            balloons.push(BalloonSnapshot {
                name: b.name.clone(),
                btype: b.btype.clone(),
                state: b.state,
                cpus: b.cpus.clone(),
                hidden: b.hidden.clone(),
                shared_idle: shared,
                containers,
                excess_milli: self.excess_milli(b),
                component_cpusets: b
                    .components
                    .iter()
                    .filter_map(|c| self.balloon(c).map(|b| b.cpus.clone()))
                    .collect(),
                is_composite: b.is_composite(),
            });
        }

        let mut mem_nodes = Vec::new();
        for id in self.system.node_ids() {
            let node = self.system.node(id);
            let mut usage = 0u64;
            let mut count = 0u64;
            for c in cache.active_containers() {
                if c.allowed_mems.as_ref().map(|m| m.contains(&id)).unwrap_or(false) {
                    usage += c.mem_request;
                    count += 1;
                }
            }
            mem_nodes.push(MemNodeStat {
                id,
                capacity: node.capacity,
                usage,
                containers: count,
            });
        }

        let mut cpus = Vec::new();
        for cpu in self.system.all_cpus().iter() {
            let owner = self
                .balloons
                .iter()
                .find(|b| !b.is_composite() && b.cpus.contains(cpu));
            let mut milli = 0u64;
            if let Some(b) = owner {
                if !b.cpus.is_empty() {
                    milli = self.required_milli(b) / b.cpus.size() as u64;
                }
            }
            let containers = cache
                .active_containers()
                .filter(|c| c.allowed_cpus.as_ref().map(|s| s.contains(cpu)).unwrap_or(false))
                .count() as u64;
            cpus.push(CpuStat {
                id: cpu,
                balloon: owner.map(|b| b.name.clone()),
                allocation_milli: milli,
                containers,
            });
        }

        PolicySnapshot {
            balloons,
            mem_nodes,
            cpus,
            free_cpus: self.idle_cpus(),
            reserved_cpus: self
                .balloon(&format!("{}[0]", RESERVED_TYPE))
                .map(|b| b.cpus.clone())
                .unwrap_or_default(),
            isolated_cpus: self.system.isolated_cpus(),
            tuning_failures: self.classes.failures(),
        }
    }
}

/// Point-in-time view of the policy state, consumed by metrics and the
/// node-topology exporter.
pub struct PolicySnapshot {
    pub balloons: Vec<BalloonSnapshot>,
    pub mem_nodes: Vec<MemNodeStat>,
    pub cpus: Vec<CpuStat>,
    pub free_cpus: CpuSet,
    pub reserved_cpus: CpuSet,
    pub isolated_cpus: CpuSet,
    pub tuning_failures: u64,
}

pub struct BalloonSnapshot {
    pub name: String,
    pub btype: String,
    pub state: BalloonState,
    pub cpus: CpuSet,
    pub hidden: CpuSet,
    pub shared_idle: CpuSet,
    pub containers: Vec<String>,
    pub excess_milli: i64,
    pub component_cpusets: Vec<CpuSet>,
    pub is_composite: bool,
}

pub struct MemNodeStat {
    pub id: usize,
    pub capacity: u64,
    pub usage: u64,
    pub containers: u64,
}

pub struct CpuStat {
    pub id: usize,
    pub balloon: Option<String>,
    pub allocation_milli: u64,
    pub containers: u64,
}

/// Reserved first, user types in declaration order, default last; built-ins
/// are only added when the configuration does not define them itself.
fn effective_types(config: &BalloonsConfig) -> IndexMap<String, BalloonType> {
    let mut types = IndexMap::new();
    let reserved = config
        .balloon_type(RESERVED_TYPE)
        .cloned()
        .unwrap_or_else(BalloonType::builtin_reserved);
    types.insert(RESERVED_TYPE.to_string(), reserved);
    for t in &config.balloon_types {
        types.insert(t.name.clone(), t.clone());
    }
    if !types.contains_key(DEFAULT_TYPE) {
        types.insert(DEFAULT_TYPE.to_string(), BalloonType::builtin_default());
    }
    types
}

/// Allocator shortages at assignment time surface as admission rejections.
fn as_unassignable(container: &str, e: Error) -> Error {
    match e {
        Error::InsufficientCpus { requested, available } => Error::unassignable(
            container,
            format!("not enough cpus: requested {}, available {}", requested, available),
        ),
        other => other,
    }
}

fn prefer_of(kind: Option<CoreKind>) -> Option<CpuPriority> {
    match kind {
        Some(CoreKind::Efficient) => Some(CpuPriority::Low),
        Some(CoreKind::Performance) => Some(CpuPriority::High),
        None => None,
    }
}

/// Splits `total` into `parts` near-equal shares, earlier parts get the
/// remainder.
fn split_evenly(total: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let extra = total % parts;
    (0..parts).map(|i| base + usize::from(i < extra)).collect()
}
