mod control_client;
mod sampler;
mod types;

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use control_client::{ClientError, ControlClient};
use sampler::{detect_outbound_ip, Sampler};
use types::{ClusterInfo, NodeCapacity, NodeLocation, NodeMetadata, RegisterNodeRequest};

#[derive(Parser, Debug)]
#[command(name = "deployer-agent")]
#[command(about = "Node deployer agent", long_about = None)]
struct Args {
    /// Control plane URL
    #[arg(long, env = "DEPLOYER_CONTROL_URL", default_value = "http://127.0.0.1:8080")]
    control_plane: String,

    /// Node name (defaults to the system hostname)
    #[arg(long, env = "DEPLOYER_NODE_NAME")]
    name: Option<String>,

    /// Public IP (defaults to the outbound interface address)
    #[arg(long, env = "DEPLOYER_PUBLIC_IP")]
    public_ip: Option<String>,

    #[arg(long, env = "DEPLOYER_PRIVATE_IP")]
    private_ip: Option<String>,

    /// Override the detected MAC address
    #[arg(long, env = "DEPLOYER_MAC_ADDRESS")]
    mac_address: Option<String>,

    #[arg(long, env = "DEPLOYER_CLUSTER_NAME", default_value = "default")]
    cluster_name: String,

    #[arg(long, env = "DEPLOYER_PODS_CAPACITY", default_value_t = 110)]
    pods_capacity: u32,

    #[arg(long, env = "DEPLOYER_HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Site latitude; reported together with --longitude
    #[arg(long, env = "DEPLOYER_LATITUDE", requires = "longitude", allow_negative_numbers = true)]
    latitude: Option<f64>,

    #[arg(long, env = "DEPLOYER_LONGITUDE", requires = "latitude", allow_negative_numbers = true)]
    longitude: Option<f64>,

    #[arg(long, env = "DEPLOYER_CITY")]
    city: Option<String>,

    #[arg(long, env = "DEPLOYER_COUNTRY")]
    country: Option<String>,

    #[arg(long, env = "DEPLOYER_REGION")]
    region: Option<String>,

    #[arg(long, env = "DEPLOYER_TIMEZONE")]
    timezone: Option<String>,

    /// Node tag (repeatable, or comma-separated)
    #[arg(long = "tag", env = "DEPLOYER_TAGS", value_delimiter = ',')]
    tags: Vec<String>,

    /// Log level (RUST_LOG overrides when set)
    #[arg(long, env = "DEPLOYER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn location(&self) -> Option<NodeLocation> {
        Some(NodeLocation {
            latitude: self.latitude?,
            longitude: self.longitude?,
            city: self.city.clone(),
            country: self.country.clone(),
            region: self.region.clone(),
            timezone: self.timezone.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting node deployer agent");

    let mut sampler = Sampler::new();
    let facts = sampler.facts();

    let public_ip = match args.public_ip.clone() {
        Some(ip) => ip,
        None => detect_outbound_ip()
            .context("Cannot detect a public IP; pass --public-ip")?
            .to_string(),
    };
    let mac_address = args
        .mac_address
        .clone()
        .or(facts.mac_address.clone())
        .context("No network interface with a hardware address; pass --mac-address")?;

    let request = RegisterNodeRequest {
        name: args.name.clone().unwrap_or_else(|| facts.hostname.clone()),
        mac_address,
        public_ip,
        private_ip: args.private_ip.clone(),
        capacity: NodeCapacity {
            cpu_cores: facts.cpu_cores,
            memory_bytes: facts.memory_bytes,
            pods_capacity: args.pods_capacity,
            disk_bytes: facts.disk_bytes,
        },
        cluster_info: ClusterInfo {
            cluster_name: args.cluster_name.clone(),
            ..Default::default()
        },
        metadata: NodeMetadata {
            tags: args.tags.clone(),
            ..facts.metadata.clone()
        },
        location: args.location(),
    };

    info!(
        "Agent configuration: name={}, mac={}, public_ip={}, cpu_cores={}, memory_bytes={}",
        request.name,
        request.mac_address,
        request.public_ip,
        request.capacity.cpu_cores,
        request.capacity.memory_bytes
    );

    let control_client = ControlClient::new(&args.control_plane, Duration::from_secs(10))
        .context("Failed to create control plane client")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    let interval = Duration::from_secs(args.heartbeat_interval_secs.max(1));
    run(&control_client, &request, &mut sampler, interval, &shutdown).await;

    info!("Agent stopped");
    Ok(())
}

/// Register, then heartbeat until cancelled. A heartbeat the control plane
/// answers with "unknown node" triggers a fresh registration.
async fn run(
    client: &ControlClient,
    request: &RegisterNodeRequest,
    sampler: &mut Sampler,
    interval: Duration,
    shutdown: &CancellationToken,
) {
    let Some(mut node_id) = register_until_accepted(client, request, interval, shutdown).await
    else {
        return;
    };

    info!("Starting heartbeat loop (every {:?})", interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let report = sampler.sample();
        match client.heartbeat(&node_id, &report).await {
            Ok(resp) => {
                tracing::debug!(status = %resp.status, "Heartbeat acknowledged");
            }
            Err(ClientError::UnknownNode(_)) => {
                warn!("Control plane forgot node {}; registering again", node_id);
                match register_until_accepted(client, request, interval, shutdown).await {
                    Some(id) => node_id = id,
                    None => return,
                }
            }
            Err(e) => warn!("Failed to send heartbeat: {}", e),
        }
    }
}

async fn register_until_accepted(
    client: &ControlClient,
    request: &RegisterNodeRequest,
    retry: Duration,
    shutdown: &CancellationToken,
) -> Option<String> {
    loop {
        match client.register_node(request).await {
            Ok(resp) => {
                info!("Registered as node_id={}", resp.node_id);
                return Some(resp.node_id);
            }
            Err(e) => warn!("Registration failed, retrying in {:?}: {}", retry, e),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}
