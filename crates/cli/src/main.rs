//! GPU fleet control plane CLI
//!
//! Inspect the node inventory, drive node lifecycle actions and manage
//! GPU allocations against a running `fleetd`.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{allocations, health, nodes};

/// GPU fleet control plane CLI
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for the GPU Fleet Control Plane", long_about = None)]
pub struct Cli {
    /// Control plane URL (can also be set via FLEET_API_URL env var)
    #[arg(long, env = "FLEET_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and manage nodes
    #[command(subcommand)]
    Nodes(NodeCommands),

    /// Show the cluster health report
    Health,

    /// Show recent alerts
    Alerts {
        /// Maximum number of alerts to show
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Allocate GPUs for a job
    Allocate {
        /// Job identifier
        #[arg(long)]
        job: String,

        /// Number of GPUs, all on one node
        #[arg(long)]
        gpus: u32,

        /// Minimum VRAM per GPU in GB
        #[arg(long, default_value_t = 0)]
        min_vram: u32,

        /// Job priority
        #[arg(long, default_value = "normal", value_parser = ["low", "normal", "high", "critical"])]
        priority: String,
    },

    /// Release an allocation
    Release {
        /// Allocation ID
        id: String,
    },

    /// List active allocations
    Allocations,
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// List nodes
    List {
        /// Filter by state (initializing, ready, busy, draining, maintenance, offline)
        #[arg(long, short)]
        state: Option<String>,
    },

    /// Show a node with its GPU reservations
    Show {
        /// Node ID
        id: String,
    },

    /// Provision a new node
    Provision {
        #[arg(long)]
        hostname: String,

        /// IP address
        #[arg(long)]
        address: String,

        /// Cloud instance type, e.g. p5.48xlarge
        #[arg(long)]
        instance_type: String,

        #[arg(long)]
        gpu_count: u32,

        #[arg(long)]
        region: Option<String>,

        /// Tag to attach (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Drain a node, revoking its allocations
    Drain {
        /// Node ID
        id: String,
    },

    /// Put a node into maintenance
    Maintenance {
        /// Node ID
        id: String,
    },

    /// Return a node to service
    Ready {
        /// Node ID
        id: String,
    },

    /// Mark a node offline
    Offline {
        /// Node ID
        id: String,
    },

    /// Permanently remove a node
    Decommission {
        /// Node ID
        id: String,

        /// Revoke active allocations instead of refusing
        #[arg(long)]
        force: bool,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load()?;
    let api_url = config.resolve_api_url(cli.api_url);
    let format = config.resolve_format(cli.format);

    let client = client::ApiClient::new(&api_url)?;
    if cli.verbose {
        output::print_info(&format!("Using control plane at {}", client.base_url()));
    }

    match cli.command {
        Commands::Nodes(node_cmd) => match node_cmd {
            NodeCommands::List { state } => {
                nodes::list_nodes(&client, state, format).await?;
            }
            NodeCommands::Show { id } => {
                nodes::show_node(&client, &id, format).await?;
            }
            NodeCommands::Provision {
                hostname,
                address,
                instance_type,
                gpu_count,
                region,
                tags,
            } => {
                let request = client::ProvisionRequest {
                    hostname,
                    address,
                    instance_type,
                    gpu_count,
                    region,
                    tags,
                };
                nodes::provision_node(&client, request, format).await?;
            }
            NodeCommands::Drain { id } => {
                nodes::drain_node(&client, &id, format).await?;
            }
            NodeCommands::Maintenance { id } => {
                nodes::node_action(&client, &id, "maintenance", format).await?;
            }
            NodeCommands::Ready { id } => {
                nodes::node_action(&client, &id, "ready", format).await?;
            }
            NodeCommands::Offline { id } => {
                nodes::node_action(&client, &id, "offline", format).await?;
            }
            NodeCommands::Decommission { id, force, yes } => {
                nodes::decommission_node(&client, &id, force, yes, format).await?;
            }
        },
        Commands::Health => {
            health::show_health(&client, format).await?;
        }
        Commands::Alerts { limit } => {
            health::list_alerts(&client, limit, format).await?;
        }
        Commands::Allocate {
            job,
            gpus,
            min_vram,
            priority,
        } => {
            let request = client::AllocationRequest {
                job_id: job,
                gpu_count: gpus,
                min_vram_gb: min_vram,
                priority,
            };
            allocations::allocate(&client, request, format).await?;
        }
        Commands::Release { id } => {
            allocations::release(&client, &id, format).await?;
        }
        Commands::Allocations => {
            allocations::list_allocations(&client, format).await?;
        }
    }

    Ok(())
}
