//! netplaned command line entry point.
//!
//! Offline tooling over the daemon's library: config validation per
//! driver, forward and load balancer compilation, and SR-IOV inspection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netplane_common::config::get;
use netplane_common::ShellNetworkTool;
use netplane_types::{ConfigMap, ForwardPut, LoadBalancerPut};
use netplaned::{dhcp, driver, portspec, sriov, DaemonConfig, DriverRegistry};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Network control plane daemon
#[derive(Parser, Debug)]
#[command(name = "netplaned")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon settings file (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a network config against a driver's rules
    Validate {
        /// Driver type (bridge, physical, macvlan, sriov)
        #[arg(short = 't', long = "type")]
        net_type: String,

        /// Network name
        #[arg(short = 'n', long)]
        name: String,

        /// Config entries as KEY=VALUE
        #[arg(value_parser = parse_key_val)]
        entries: Vec<(String, String)>,
    },

    /// Compile an address forward and print its port maps as JSON
    CompileForward {
        /// Network config (YAML map)
        #[arg(long)]
        network_config: PathBuf,

        /// Forward (YAML, with listen_address)
        #[arg(long)]
        forward: PathBuf,
    },

    /// Compile a load balancer and print its port maps as JSON
    CompileLoadBalancer {
        /// Network config (YAML map)
        #[arg(long)]
        network_config: PathBuf,

        /// Load balancer (YAML, with listen_address)
        #[arg(long)]
        load_balancer: PathBuf,
    },

    /// List the virtual functions of a physical function
    SriovScan {
        /// Physical function interface
        #[arg(short = 'p', long)]
        parent: String,
    },
}

#[derive(Debug, Deserialize)]
struct ForwardFile {
    listen_address: IpAddr,
    #[serde(flatten)]
    put: ForwardPut,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerFile {
    listen_address: IpAddr,
    #[serde(flatten)]
    put: LoadBalancerPut,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("Failed parsing {}", path.display()))
}

/// Subnet of `config` for the family of `listen`.
fn subnet_for(config: &ConfigMap, listen: &IpAddr) -> Option<ipnet::IpNet> {
    let key = if listen.is_ipv6() { "ipv6.address" } else { "ipv4.address" };
    dhcp::subnet_of(get(config, key))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(args: Args, settings: DaemonConfig) -> Result<()> {
    match args.command {
        Command::Validate { net_type, name, entries } => {
            let config: ConfigMap = entries.into_iter().collect();
            driver::validate_config(&DriverRegistry::builtin(), &net_type, &name, &config)?;
            println!("Config of {} network {:?} is valid", net_type, name);
        }
        Command::CompileForward { network_config, forward } => {
            let config: ConfigMap = read_yaml(&network_config).await?;
            let forward: ForwardFile = read_yaml(&forward).await?;
            let listen = forward.listen_address;
            let maps = portspec::forward_validate(listen, subnet_for(&config, &listen), &forward.put)?;
            print_json(&maps)?;
        }
        Command::CompileLoadBalancer { network_config, load_balancer } => {
            let config: ConfigMap = read_yaml(&network_config).await?;
            let lb: LoadBalancerFile = read_yaml(&load_balancer).await?;
            let listen = lb.listen_address;
            let maps =
                portspec::load_balancer_validate(listen, subnet_for(&config, &listen), &lb.put)?;
            print_json(&maps)?;
        }
        Command::SriovScan { parent } => {
            let os = ShellNetworkTool::new(settings.sysfs_net.clone());
            let rows = sriov::inspect_virtual_functions(&settings.sysfs_net, &os, &parent)
                .await
                .with_context(|| format!("Failed scanning virtual functions of {:?}", parent))?;
            print_json(&rows)?;
        }
    }
    Ok(())
}

async fn load_settings(path: Option<&Path>) -> Result<DaemonConfig> {
    match path {
        Some(path) => DaemonConfig::load(path)
            .await
            .with_context(|| format!("Failed loading settings from {}", path.display())),
        None => Ok(DaemonConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match load_settings(args.config.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("netplaned: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = args.log_level.clone().unwrap_or_else(|| settings.log_level.clone());
    init_logging(&level);
    debug!(member = %settings.member_name, "Loaded settings");

    match run(args, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
