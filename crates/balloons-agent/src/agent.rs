//! The agent event loop.
//!
//! One thread owns the cache and the policy and processes runtime
//! callbacks, configuration events and reconciliation ticks strictly in
//! order. Outbound status and topology writes run on a small thread pool
//! with per-resource locks and bounded retries.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use sugars::{rc, refcell};
use threadpool::ThreadPool;

use balloons_policy::core::cache::{Cache, ContainerInfo, ContainerState, PodInfo};
use balloons_policy::core::config::BalloonsConfig;
use balloons_policy::core::cpu_class::CpuControl;
use balloons_policy::core::policy::BalloonsPolicy;
use balloons_topology::cpuset::CpuSet;
use balloons_topology::system::System;

use crate::config_store::{status_patch, ConfigEvent, ConfigSelector, NodeStatus, StatusSink};
use crate::error::{Error, Result};
use crate::metrics;
use crate::node_topology::{self, TopologySink};
use crate::nri::{
    ContainerAdjustment, ContainerSpec, ContainerUpdate, LinuxCpu, LinuxResources,
    PluginRegistration, PodSpec, RuntimeEvent, RuntimeSink,
};
use crate::resources_export;
use crate::trace::TraceConfig;

/// Bursts of configuration updates within this window collapse into one
/// apply.
pub const CONFIG_COALESCE_WINDOW: Duration = Duration::from_secs(2);
/// Periodic reconciliation cadence.
pub const RECONCILE_TICK: Duration = Duration::from_secs(10);
const OUTBOUND_BACKOFF: Duration = Duration::from_secs(5);
const OUTBOUND_MAX_ATTEMPTS: u32 = 3;
/// How long shutdown waits for in-flight outbound tasks before detaching
/// them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Everything the loop can receive.
pub enum AgentEvent {
    Runtime(RuntimeEvent),
    Config(ConfigEvent),
    Tick,
    Shutdown,
}

pub struct AgentOptions {
    pub node_name: String,
    pub group_label: Option<String>,
    pub resources_dir: Option<PathBuf>,
    pub registration: PluginRegistration,
    pub trace: TraceConfig,
}

pub struct Agent {
    system: Rc<System>,
    cache: Rc<RefCell<Cache>>,
    policy: BalloonsPolicy,
    options: AgentOptions,
    selector: ConfigSelector,
    coalesce_deadline: Option<Instant>,
    runtime_sink: Rc<dyn RuntimeSink>,
    status_sink: Arc<dyn StatusSink>,
    topology_sink: Arc<dyn TopologySink>,
    pool: ThreadPool,
    status_lock: Arc<Mutex<()>>,
    topology_lock: Arc<Mutex<()>>,
    shutting_down: Arc<AtomicBool>,
    /// Latest rendered metrics, shared with the HTTP collaborator.
    metrics_text: Arc<Mutex<String>>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        system: Rc<System>,
        config: BalloonsConfig,
        options: AgentOptions,
        runtime_sink: Rc<dyn RuntimeSink>,
        status_sink: Arc<dyn StatusSink>,
        topology_sink: Arc<dyn TopologySink>,
        control: Box<dyn CpuControl>,
        devices: BTreeMap<String, usize>,
    ) -> Result<Self> {
        let cache = rc!(refcell!(Cache::new()));
        let policy = BalloonsPolicy::new(system.clone(), config, cache.clone(), control, devices)?;
        let selector = ConfigSelector::new(options.node_name.clone(), options.group_label.clone());
        let mut agent = Self {
            system,
            cache,
            policy,
            options,
            selector,
            coalesce_deadline: None,
            runtime_sink,
            status_sink,
            topology_sink,
            pool: ThreadPool::new(2),
            status_lock: Arc::new(Mutex::new(())),
            topology_lock: Arc::new(Mutex::new(())),
            shutting_down: Arc::new(AtomicBool::new(false)),
            metrics_text: Arc::new(Mutex::new(String::new())),
        };
        agent.publish_metrics();
        agent.push_topology();
        Ok(agent)
    }

    pub fn policy(&self) -> &BalloonsPolicy {
        &self.policy
    }

    pub fn cache(&self) -> Rc<RefCell<Cache>> {
        self.cache.clone()
    }

    /// Handle shared with the metrics HTTP server.
    pub fn shared_metrics(&self) -> Arc<Mutex<String>> {
        self.metrics_text.clone()
    }

    pub fn metrics_text(&self) -> String {
        metrics::render(&self.policy.snapshot())
    }

    // ------------------------------------------------------------------
    // runtime adapter
    // ------------------------------------------------------------------

    /// Processes one lifecycle callback. Transports needing a synchronous
    /// answer (`CreateContainer`) call this on the loop thread and forward
    /// the returned adjustment.
    pub fn handle_runtime_event(&mut self, event: RuntimeEvent) -> Result<Option<ContainerAdjustment>> {
        let reply = self.dispatch_runtime_event(event)?;
        self.flush_updates();
        self.publish_metrics();
        self.push_topology();
        Ok(reply)
    }

    fn dispatch_runtime_event(&mut self, event: RuntimeEvent) -> Result<Option<ContainerAdjustment>> {
        match event {
            RuntimeEvent::Configure => Ok(None),
            RuntimeEvent::Synchronize { pods, containers } => {
                debug!(target: "agent", "synchronizing {} pods, {} containers", pods.len(), containers.len());
                {
                    let mut cache = self.cache.borrow_mut();
                    for pod in pods {
                        cache.insert_pod(pod_info(pod));
                    }
                    for container in containers {
                        let mut info = container_info(container);
                        info.state = ContainerState::Running;
                        cache.insert_container(info);
                    }
                }
                for (id, e) in self.policy.sync() {
                    warn!(target: "agent", "synchronize: container {} left unassigned: {}", id, e);
                }
                Ok(None)
            }
            RuntimeEvent::RunPodSandbox(pod) => {
                self.cache.borrow_mut().insert_pod(pod_info(pod));
                Ok(None)
            }
            RuntimeEvent::StopPodSandbox { .. } => Ok(None),
            RuntimeEvent::RemovePodSandbox { pod_id } => {
                let ids = self.cache.borrow().containers_of_pod(&pod_id);
                for id in &ids {
                    let _ = self.policy.release_resources(id);
                }
                let removed = self.cache.borrow_mut().remove_pod(&pod_id);
                self.remove_exports(&removed);
                Ok(None)
            }
            RuntimeEvent::CreateContainer(spec) => {
                let id = spec.id.clone();
                self.cache.borrow_mut().insert_container(container_info(spec));
                match self.policy.allocate_resources(&id) {
                    Ok(()) => Ok(self.adjustment_for(&id)),
                    Err(e) => {
                        // admission failed; nothing of the container stays
                        self.cache.borrow_mut().remove_container(&id);
                        Err(Error::Policy(e))
                    }
                }
            }
            RuntimeEvent::PostCreateContainer { .. }
            | RuntimeEvent::PostStartContainer { .. }
            | RuntimeEvent::PostUpdateContainer { .. } => Ok(None),
            RuntimeEvent::StartContainer { container_id } => {
                self.cache
                    .borrow_mut()
                    .set_state(&container_id, ContainerState::Running);
                Ok(None)
            }
            RuntimeEvent::UpdateContainer {
                container_id,
                cpu_request,
                cpu_limit,
                mem_request,
            } => {
                {
                    let mut cache = self.cache.borrow_mut();
                    if let Some(c) = cache.container_mut(&container_id) {
                        c.cpu_request = cpu_request;
                        c.cpu_limit = cpu_limit;
                        c.mem_request = mem_request;
                    }
                }
                if let Err(e) = self.policy.update_resources(&container_id) {
                    warn!(target: "agent", "update of container {} failed: {}", container_id, e);
                }
                Ok(None)
            }
            RuntimeEvent::StopContainer { container_id } => {
                self.cache
                    .borrow_mut()
                    .set_state(&container_id, ContainerState::Stopped);
                let _ = self.policy.release_resources(&container_id);
                Ok(None)
            }
            RuntimeEvent::RemoveContainer { container_id } => {
                let _ = self.policy.release_resources(&container_id);
                self.cache.borrow_mut().remove_container(&container_id);
                self.remove_exports(&[container_id]);
                Ok(None)
            }
        }
    }

    fn adjustment_for(&self, id: &str) -> Option<ContainerAdjustment> {
        let cache = self.cache.borrow();
        let c = cache.container(id)?;
        Some(ContainerAdjustment {
            linux_resources: linux_resources(c),
        })
    }

    /// Pushes pending decision changes to the runtime and refreshes the
    /// per-container environment exports.
    fn flush_updates(&mut self) {
        let ids = self.cache.borrow_mut().take_pending();
        if ids.is_empty() {
            return;
        }
        let mut updates = Vec::new();
        {
            let cache = self.cache.borrow();
            for id in &ids {
                if let Some(c) = cache.container(id) {
                    updates.push(ContainerUpdate {
                        container_id: id.clone(),
                        linux_resources: linux_resources(c),
                    });
                }
            }
        }
        if !updates.is_empty() {
            if let Err(e) = self.runtime_sink.update_containers(&updates) {
                warn!(target: "agent", "container updates failed: {}", e);
            }
        }
        self.write_exports(&ids);
    }

    fn write_exports(&self, ids: &[String]) {
        let Some(dir) = &self.options.resources_dir else { return };
        let snapshot = self.policy.snapshot();
        let cache = self.cache.borrow();
        for id in ids {
            let Some(c) = cache.container(id) else { continue };
            let sets = resources_export::container_cpu_sets(&snapshot, c);
            if let Err(e) = resources_export::write(dir, id, &sets) {
                warn!(target: "agent", "cannot export resources of {}: {}", id, e);
            }
        }
    }

    fn remove_exports(&self, ids: &[String]) {
        if let Some(dir) = &self.options.resources_dir {
            for id in ids {
                resources_export::remove(dir, id);
            }
        }
    }

    // ------------------------------------------------------------------
    // configuration loop
    // ------------------------------------------------------------------

    /// Folds a store notification in and (re)arms the coalescing window.
    pub fn handle_config_event(&mut self, event: ConfigEvent) {
        self.selector.observe(event);
        self.coalesce_deadline = Some(Instant::now() + CONFIG_COALESCE_WINDOW);
    }

    /// Applies the effective configuration once the coalescing window has
    /// passed.
    pub fn maybe_apply_config(&mut self) {
        let due = match self.coalesce_deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        };
        if !due {
            return;
        }
        self.coalesce_deadline = None;
        self.apply_effective_config();
    }

    /// Applies the effective configuration immediately, regardless of the
    /// window. Status is reported back through the store.
    pub fn apply_effective_config(&mut self) {
        if !self.selector.needs_apply() {
            return;
        }
        let Some(obj) = self.selector.effective().cloned() else { return };
        let name = obj.metadata.name.clone();
        let generation = obj.metadata.generation;
        info!(target: "agent", "applying configuration {} generation {}", name, generation);
        match self.policy.reconfigure(obj.spec.clone()) {
            Ok(()) => {
                self.selector.mark_applied(&obj);
                let mut status = NodeStatus::success(generation, timestamp());
                let failures = self.policy.tuning_failures();
                if failures > 0 {
                    status.errors.push(format!("{} cpu tuning writes failed", failures));
                }
                self.report_status(&name, status);
            }
            Err(e) => {
                // the engine restored the previous state; record the
                // rejection and keep running on the last good config
                warn!(target: "agent", "configuration {} rejected: {}", name, e);
                self.selector.mark_applied(&obj);
                self.report_status(&name, NodeStatus::failure(generation, e.to_string(), timestamp()));
            }
        }
        self.flush_updates();
        self.publish_metrics();
        self.push_topology();
    }

    fn report_status(&self, object: &str, status: NodeStatus) {
        let patch = status_patch(&self.options.node_name, &status);
        let sink = self.status_sink.clone();
        let object = object.to_string();
        self.spawn_outbound(self.status_lock.clone(), "status patch", move || {
            sink.patch_status(&object, &patch)
        });
    }

    // ------------------------------------------------------------------
    // emitted state
    // ------------------------------------------------------------------

    fn publish_metrics(&mut self) {
        let text = metrics::render(&self.policy.snapshot());
        if let Ok(mut shared) = self.metrics_text.lock() {
            *shared = text;
        }
    }

    fn push_topology(&self) {
        let topology =
            node_topology::build(&self.options.node_name, &self.system, &self.policy.snapshot());
        let sink = self.topology_sink.clone();
        self.spawn_outbound(self.topology_lock.clone(), "topology update", move || {
            sink.update(&topology)
        });
    }

    /// Runs `op` on the pool, serialized by `lock`, with bounded retries
    /// and 5 s backoff; gives up early on shutdown.
    fn spawn_outbound<F>(&self, lock: Arc<Mutex<()>>, what: &'static str, op: F)
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        let shutting_down = self.shutting_down.clone();
        self.pool.execute(move || {
            let _guard = lock.lock().unwrap();
            for attempt in 1..=OUTBOUND_MAX_ATTEMPTS {
                match op() {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(target: "agent", "{} failed (attempt {}): {}", what, attempt, e);
                        if attempt == OUTBOUND_MAX_ATTEMPTS || shutting_down.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(OUTBOUND_BACKOFF);
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // the loop
    // ------------------------------------------------------------------

    /// Processes events until shutdown. Events arrive strictly in order;
    /// configuration applies are linearized with runtime events.
    pub fn run(&mut self, events: Receiver<AgentEvent>) {
        info!(
            target: "agent",
            "agent for node {} running as plugin {}",
            self.options.node_name,
            self.options.registration.id()
        );
        if let Some(endpoint) = self.options.trace.resolved_endpoint() {
            info!(target: "agent", "trace export to {}", endpoint);
        }
        loop {
            let timeout = match self.coalesce_deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(RECONCILE_TICK),
                None => RECONCILE_TICK,
            };
            match events.recv_timeout(timeout) {
                Ok(AgentEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(AgentEvent::Runtime(event)) => {
                    let create_id = match &event {
                        RuntimeEvent::CreateContainer(c) => Some(c.id.clone()),
                        _ => None,
                    };
                    match self.handle_runtime_event(event) {
                        Ok(Some(adjustment)) => {
                            // channel transports cannot reply synchronously;
                            // deliver the create adjustment as an update
                            if let Some(container_id) = create_id {
                                let update = ContainerUpdate {
                                    container_id,
                                    linux_resources: adjustment.linux_resources,
                                };
                                if let Err(e) = self.runtime_sink.update_containers(&[update]) {
                                    warn!(target: "agent", "create adjustment delivery failed: {}", e);
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(target: "agent", "runtime event failed: {}", e),
                    }
                }
                Ok(AgentEvent::Config(event)) => self.handle_config_event(event),
                Ok(AgentEvent::Tick) | Err(RecvTimeoutError::Timeout) => self.reconcile(),
            }
            self.maybe_apply_config();
        }
        self.shutdown();
    }

    /// Periodic pass: pushes anything that accumulated between events.
    fn reconcile(&mut self) {
        if self.cache.borrow().has_pending() {
            self.flush_updates();
        }
        self.publish_metrics();
        self.push_topology();
    }

    /// Blocks until every queued outbound task has finished.
    pub fn drain_outbound(&self) {
        self.pool.join();
    }

    /// Waits up to the grace period for outbound tasks to finish; whatever
    /// is still running afterwards is detached, not awaited.
    fn shutdown(&mut self) {
        info!(target: "agent", "shutting down, draining outbound tasks");
        self.shutting_down.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let in_flight = self.pool.active_count() + self.pool.queued_count();
            if in_flight == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    target: "agent",
                    "{} outbound tasks still running after {:?}, detaching them",
                    in_flight,
                    SHUTDOWN_GRACE
                );
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

fn pod_info(pod: PodSpec) -> PodInfo {
    PodInfo {
        id: pod.id,
        uid: pod.uid,
        name: pod.name,
        namespace: pod.namespace,
        labels: pod.labels,
        annotations: pod.annotations,
        qos_class: pod.qos_class,
    }
}

fn container_info(spec: ContainerSpec) -> ContainerInfo {
    let mut c = ContainerInfo::new(spec.id, spec.pod_id, spec.name);
    c.labels = spec.labels;
    c.cpu_request = spec.cpu_request;
    c.cpu_limit = spec.cpu_limit;
    c.mem_request = spec.mem_request;
    c
}

fn linux_resources(c: &ContainerInfo) -> LinuxResources {
    LinuxResources {
        cpu: LinuxCpu {
            cpus: c.allowed_cpus.as_ref().map(|s| s.to_string()),
            mems: c
                .allowed_mems
                .as_ref()
                .map(|nodes| CpuSet::from_ids(nodes.iter().copied()).to_string()),
        },
    }
}

fn timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}
