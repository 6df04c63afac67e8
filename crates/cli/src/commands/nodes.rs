//! Node inventory and lifecycle commands

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::{self, BufRead, Write};
use tabled::Tabled;

use crate::client::{
    ApiClient, ConfirmDecommission, DecommissionTicket, DrainReport, Node, NodeDetail, NodeUsage,
    ProvisionRequest,
};
use crate::output::{
    color_status, format_indices, format_timestamp, print_info, print_json, print_success,
    print_table, print_warning, short_id, OutputFormat,
};

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Hostname")]
    hostname: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "GPU Model")]
    gpu_model: String,
    #[tabled(rename = "GPUs (free/total)")]
    gpus: String,
    #[tabled(rename = "VRAM/GPU")]
    vram: String,
    #[tabled(rename = "Leases")]
    leases: usize,
    #[tabled(rename = "Region")]
    region: String,
}

impl From<&NodeUsage> for NodeRow {
    fn from(usage: &NodeUsage) -> Self {
        let node = &usage.node;
        Self {
            id: short_id(&node.id),
            hostname: node.hostname.clone(),
            state: color_status(&node.state),
            gpu_model: node.hardware.gpu_model.clone(),
            gpus: format!("{}/{}", usage.free_gpus, node.hardware.gpu_count),
            vram: format!("{} GB", node.hardware.vram_per_gpu_gb),
            leases: usage.active_allocations,
            region: node.region.clone().unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct LeaseRow {
    #[tabled(rename = "Allocation")]
    id: String,
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "GPUs")]
    gpus: String,
    #[tabled(rename = "Expires")]
    expires_at: String,
}

/// List nodes, optionally filtered by state
pub async fn list_nodes(client: &ApiClient, state: Option<String>, format: OutputFormat) -> Result<()> {
    let path = match &state {
        Some(state) => format!("api/v1/nodes?state={}", state),
        None => "api/v1/nodes".to_string(),
    };
    let nodes: Vec<NodeUsage> = client.get(&path).await?;

    let rows = nodes.iter().map(NodeRow::from).collect();
    print_table(rows, &nodes, format);
    Ok(())
}

/// Show one node with its GPU reservations
pub async fn show_node(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let detail: NodeDetail = client.get(&format!("api/v1/nodes/{}", id)).await?;

    if let OutputFormat::Json = format {
        print_json(&detail);
        return Ok(());
    }

    let node = &detail.node;
    println!("{}", format!("Node {}", node.hostname).bold());
    println!("{}", "=".repeat(50));
    println!("ID:            {}", node.id);
    println!("Address:       {}", node.address);
    println!("State:         {}", color_status(&node.state));
    if let Some(region) = &node.region {
        println!("Region:        {}", region);
    }
    if let Some(instance_type) = &node.instance_type {
        println!("Instance type: {}", instance_type);
    }
    if !node.tags.is_empty() {
        println!("Tags:          {}", node.tags.join(", "));
    }
    println!("Registered:    {}", format_timestamp(&node.created_at));
    println!();

    println!("{}", "Hardware".bold());
    println!("{}", "-".repeat(50));
    println!(
        "GPUs:          {} x {} ({} GB each)",
        node.hardware.gpu_count, node.hardware.gpu_model, node.hardware.vram_per_gpu_gb
    );
    println!(
        "CUDA / driver: {} / {}",
        node.hardware.cuda_version, node.hardware.driver_version
    );
    println!("Free units:    {}", format_indices(&detail.gpus.free));
    println!("Leased units:  {}", format_indices(&detail.gpus.leased));
    if detail.unhealthy {
        print_warning("Node is over the thermal threshold and excluded from placement");
    }

    if !detail.allocations.is_empty() {
        println!();
        println!("{}", "Leases".bold());
        let rows: Vec<LeaseRow> = detail
            .allocations
            .iter()
            .map(|a| LeaseRow {
                id: short_id(&a.id),
                job_id: a.job_id.clone(),
                gpus: format_indices(&a.gpu_indices),
                expires_at: format_timestamp(&a.expires_at),
            })
            .collect();
        print_table(rows, &detail.allocations, format);
    }

    Ok(())
}

/// Request a new node
pub async fn provision_node(client: &ApiClient, request: ProvisionRequest, format: OutputFormat) -> Result<()> {
    let node: Node = client.post("api/v1/nodes", &request).await?;

    match format {
        OutputFormat::Json => print_json(&node),
        OutputFormat::Table => {
            print_success(&format!(
                "Provisioning {} ({} x {})",
                node.hostname, node.hardware.gpu_count, node.hardware.gpu_model
            ));
            print_info(&format!("Node ID: {}", node.id));
        }
    }
    Ok(())
}

/// Drain a node, revoking its leases
pub async fn drain_node(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let report: DrainReport = client.post_empty(&format!("api/v1/nodes/{}/drain", id)).await?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            print_success(&format!(
                "{} is draining (was {})",
                report.hostname,
                color_status(&report.previous_state)
            ));
            if !report.revoked_allocations.is_empty() {
                print_warning(&format!(
                    "Revoked {} allocation(s): {}",
                    report.revoked_allocations.len(),
                    report.revoked_allocations.join(", ")
                ));
            }
        }
    }
    Ok(())
}

/// Apply one of the node-only lifecycle actions: `maintenance`, `ready`, `offline`
pub async fn node_action(client: &ApiClient, id: &str, action: &str, format: OutputFormat) -> Result<()> {
    let node: Node = client
        .post_empty(&format!("api/v1/nodes/{}/{}", id, action))
        .await?;

    match format {
        OutputFormat::Json => print_json(&node),
        OutputFormat::Table => print_success(&format!(
            "{} is now {}",
            node.hostname,
            color_status(&node.state)
        )),
    }
    Ok(())
}

/// Run the two-step decommission handshake
pub async fn decommission_node(
    client: &ApiClient,
    id: &str,
    force: bool,
    yes: bool,
    format: OutputFormat,
) -> Result<()> {
    let ticket: DecommissionTicket = client
        .post_empty(&format!("api/v1/nodes/{}/decommission", id))
        .await?;

    if ticket.active_allocations > 0 {
        let note = if force {
            "they will be revoked"
        } else {
            "pass --force to revoke them"
        };
        print_warning(&format!(
            "{} holds {} active allocation(s); {}",
            ticket.hostname, ticket.active_allocations, note
        ));
    }

    if !yes {
        let prompt = format!(
            "Decommission {} ({})? This cannot be undone. [y/N] ",
            ticket.hostname, ticket.node_id
        );
        let stdin = io::stdin();
        if !confirm(&prompt, &mut stdin.lock())? {
            print_info("Aborted");
            return Ok(());
        }
    }

    let body = ConfirmDecommission {
        ticket: ticket.ticket,
        force,
    };
    let node: Node = client
        .post(&format!("api/v1/nodes/{}/decommission/confirm", id), &body)
        .await?;

    match format {
        OutputFormat::Json => print_json(&node),
        OutputFormat::Table => print_success(&format!(
            "{} decommissioned; {} GPU(s) recovered",
            node.hostname, node.hardware.gpu_count
        )),
    }
    Ok(())
}

fn confirm(prompt: &str, input: &mut impl BufRead) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush().context("Failed to write prompt")?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_accepts_yes() {
        assert!(confirm("? ", &mut "y\n".as_bytes()).unwrap());
        assert!(confirm("? ", &mut "YES\n".as_bytes()).unwrap());
    }

    #[test]
    fn test_confirm_defaults_to_no() {
        assert!(!confirm("? ", &mut "\n".as_bytes()).unwrap());
        assert!(!confirm("? ", &mut "nope\n".as_bytes()).unwrap());
        assert!(!confirm("? ", &mut "".as_bytes()).unwrap());
    }
}
