//! The balloons resource-policy agent binary.
//!
//! Discovers the host topology, loads the fallback configuration and runs
//! the event loop. The runtime transport, the configuration store watch and
//! the metrics HTTP server attach through the library interfaces; without
//! them the binary runs dry, logging the decisions it would apply.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use balloons_agent::agent::{Agent, AgentOptions};
use balloons_agent::config_store::{load_fallback, LogStatusSink};
use balloons_agent::node_topology::LogTopologySink;
use balloons_agent::nri::{LogRuntimeSink, PluginRegistration};
use balloons_agent::trace::{TraceConfig, TraceExporter};
use balloons_policy::core::config::BalloonsConfig;
use balloons_policy::core::cpu_class::NullCpuControl;
use balloons_topology::discovery;

#[derive(Parser)]
#[command(name = "balloons-agent", about = "Balloons resource-policy agent")]
struct Args {
    /// Sysfs mountpoint to discover the topology from.
    #[arg(long, default_value = "/sys")]
    sysfs: PathBuf,
    /// Node name; defaults to $NODE_NAME, then $HOSTNAME.
    #[arg(long)]
    node_name: Option<String>,
    /// Configuration group label of this node.
    #[arg(long)]
    group: Option<String>,
    /// Fallback policy configuration file applied before the store
    /// delivers one.
    #[arg(long)]
    fallback_config: Option<PathBuf>,
    /// Plugin registration index (0-99).
    #[arg(long, default_value_t = 90)]
    nri_index: u8,
    /// Directory for per-container resources.sh exports.
    #[arg(long)]
    resources_dir: Option<PathBuf>,
    /// Trace exporter: otlp-http or otlp-grpc.
    #[arg(long)]
    trace_exporter: Option<String>,
    /// Trace endpoint override.
    #[arg(long)]
    trace_endpoint: Option<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let node_name = args
        .node_name
        .or_else(|| std::env::var("NODE_NAME").ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string());

    let system = match discovery::discover(&args.sysfs) {
        Ok(system) => Rc::new(system),
        Err(e) => {
            error!(target: "agent", "topology discovery failed: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        target: "agent",
        "discovered {} cpus on {} packages",
        system.cpu_count(),
        system.package_ids().len()
    );

    let config = match &args.fallback_config {
        Some(path) => match load_fallback(&path.display().to_string()) {
            Ok(config) => config,
            Err(e) => {
                error!(target: "agent", "cannot load fallback configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => BalloonsConfig::default(),
    };

    let registration = match PluginRegistration::new(args.nri_index, "balloons") {
        Ok(r) => r,
        Err(e) => {
            error!(target: "agent", "{}", e);
            std::process::exit(1);
        }
    };

    let exporter = match args.trace_exporter.as_deref().map(str::parse::<TraceExporter>) {
        Some(Ok(exporter)) => Some(exporter),
        Some(Err(e)) => {
            error!(target: "agent", "{}", e);
            std::process::exit(1);
        }
        None => None,
    };

    let options = AgentOptions {
        node_name,
        group_label: args.group,
        resources_dir: args.resources_dir,
        registration,
        trace: TraceConfig {
            exporter,
            endpoint: args.trace_endpoint,
        },
    };

    let mut agent = match Agent::new(
        system,
        config,
        options,
        Rc::new(LogRuntimeSink),
        Arc::new(LogStatusSink),
        Arc::new(LogTopologySink),
        Box::new(NullCpuControl),
        BTreeMap::new(),
    ) {
        Ok(agent) => agent,
        Err(e) => {
            error!(target: "agent", "cannot start: {}", e);
            std::process::exit(1);
        }
    };

    let (_events_tx, events_rx) = mpsc::channel();
    agent.run(events_rx);
}
