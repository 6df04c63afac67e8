//! GPU allocation commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{Allocation, AllocationReceipt, AllocationRequest, ApiClient};
use crate::output::{
    format_indices, format_timestamp, print_info, print_json, print_success, print_table,
    short_id, OutputFormat,
};

#[derive(Tabled)]
struct AllocationRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Node")]
    node_id: String,
    #[tabled(rename = "GPUs")]
    gpus: String,
    #[tabled(rename = "Granted")]
    granted_at: String,
    #[tabled(rename = "Expires")]
    expires_at: String,
}

/// Request GPUs for a job
pub async fn allocate(client: &ApiClient, request: AllocationRequest, format: OutputFormat) -> Result<()> {
    let receipt: AllocationReceipt = client.post("api/v1/allocations", &request).await?;

    match format {
        OutputFormat::Json => print_json(&receipt),
        OutputFormat::Table => {
            print_success(&format!(
                "Allocated GPU(s) {} on {} to job {}",
                format_indices(&receipt.gpu_indices),
                receipt.hostname,
                request.job_id
            ));
            print_info(&format!("Allocation ID: {}", receipt.allocation_id));
            print_info(&format!(
                "Lease expires: {}",
                format_timestamp(&receipt.lease_expiration)
            ));
        }
    }
    Ok(())
}

/// Release a lease before it expires
pub async fn release(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let allocation: Allocation = client.delete(&format!("api/v1/allocations/{}", id)).await?;

    match format {
        OutputFormat::Json => print_json(&allocation),
        OutputFormat::Table => print_success(&format!(
            "Released {} GPU(s) held by job {}",
            allocation.gpu_indices.len(),
            allocation.job_id
        )),
    }
    Ok(())
}

/// List active leases
pub async fn list_allocations(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let allocations: Vec<Allocation> = client.get("api/v1/allocations").await?;

    let rows = allocations
        .iter()
        .map(|a| AllocationRow {
            id: short_id(&a.id),
            job_id: a.job_id.clone(),
            priority: a.priority.clone(),
            node_id: short_id(&a.node_id),
            gpus: format_indices(&a.gpu_indices),
            granted_at: format_timestamp(&a.granted_at),
            expires_at: format_timestamp(&a.expires_at),
        })
        .collect();
    print_table(rows, &allocations, format);
    Ok(())
}
