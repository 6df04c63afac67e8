//! API client for the fleet control plane

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// Error returned by the control plane
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{message} [{kind}, HTTP {status}]")]
    Api {
        status: StatusCode,
        kind: String,
        message: String,
    },
    #[error("API error ({status}): {body}")]
    Unexpected { status: StatusCode, body: String },
}

/// API client for the control plane
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.send(self.client.get(url)).await
    }

    /// POST with a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.send(self.client.post(url).json(body)).await
    }

    /// POST without a body, for the lifecycle actions
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.send(self.client.post(url)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.send(self.client.delete(url)).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_body(status, body).into());
        }

        response.json().await.context("Failed to parse response")
    }
}

fn error_from_body(status: StatusCode, body: String) -> ClientError {
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => ClientError::Api {
            status,
            kind: err.error,
            message: err.message,
        },
        Err(_) => ClientError::Unexpected { status, body },
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardware {
    pub gpu_model: String,
    pub gpu_count: u32,
    pub vram_per_gpu_gb: u32,
    pub cuda_version: String,
    pub driver_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub state: String,
    pub hardware: Hardware,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUsage {
    pub node: Node,
    pub free_gpus: u32,
    pub leased_gpus: u32,
    pub active_allocations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuUsage {
    pub total: u32,
    pub leased: Vec<u32>,
    pub free: Vec<u32>,
    pub active_allocations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    pub node: Node,
    pub gpus: GpuUsage,
    pub allocations: Vec<Allocation>,
    pub unhealthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub hostname: String,
    pub address: String,
    pub instance_type: String,
    pub gpu_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    pub node_id: String,
    pub hostname: String,
    pub previous_state: String,
    pub revoked_allocations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecommissionTicket {
    pub node_id: String,
    pub hostname: String,
    pub ticket: String,
    pub active_allocations: usize,
    pub issued_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmDecommission {
    pub ticket: String,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub job_id: String,
    pub gpu_count: u32,
    pub min_vram_gb: u32,
    pub priority: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReceipt {
    pub allocation_id: String,
    pub node_id: String,
    pub hostname: String,
    pub gpu_indices: Vec<u32>,
    pub lease_expiration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub job_id: String,
    pub priority: String,
    pub node_id: String,
    pub gpu_indices: Vec<u32>,
    pub granted_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub sequence: u64,
    pub severity: String,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealthReport {
    pub status: String,
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub total_gpus: u32,
    pub available_gpus: u32,
    pub allocated_gpus: u32,
    pub utilization_percentage: f64,
    pub active_alerts: Vec<Alert>,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
