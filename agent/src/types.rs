use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Node Registration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub pods_capacity: u32,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub kube_version: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub os_type: Option<String>,
    pub architecture: Option<String>,
    pub hostname: Option<String>,
    pub kernel_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub name: String,
    pub mac_address: String,
    pub public_ip: String,
    pub private_ip: Option<String>,
    pub capacity: NodeCapacity,
    pub cluster_info: ClusterInfo,
    pub metadata: NodeMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<NodeLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeResponse {
    pub node_id: String,
    pub status: String,
    pub created: bool,
}

// ============================================================================
// Heartbeat
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub pods_running: Option<u32>,
    pub disk_used_bytes: Option<u64>,
    pub disk_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
}
