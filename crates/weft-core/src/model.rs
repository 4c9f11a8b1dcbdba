//! Data model shared across the control plane.
//!
//! Entities here are the wire- and store-level contract: peer registrations,
//! issued peer configurations, task records with their leases, and the
//! capability vocabulary used when matching work to nodes.

use chrono::{DateTime, Duration, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Keepalive ceiling accepted for peer entries (seconds).
pub const MAX_KEEPALIVE_SECS: u16 = 3600;

/// A peer registered on the hub interface.
///
/// `public_key` and the owning peer id are unique per hub; uniqueness is
/// enforced by the registry, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub public_key: String,
    pub allowed_ips: Vec<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

/// The complete configuration returned to a joining node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfiguration {
    pub node_id: String,
    pub assigned_ip: Ipv4Addr,
    pub subnet_mask: String,
    pub hub_public_key: String,
    pub hub_endpoint: String,
    /// What the node should route to the hub; the full overlay CIDR.
    pub allowed_ips: Ipv4Net,
    pub persistent_keepalive: u16,
    pub dns_servers: Vec<Ipv4Addr>,
    pub provisioned_at: DateTime<Utc>,
}

/// Hardware and software capabilities reported by a joining node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilities {
    #[serde(default = "defaults::one")]
    pub cpu_cores: u32,
    #[serde(default = "defaults::min_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub gpu_memory_mb: u64,
    #[serde(default)]
    pub storage_mb: u64,
    #[serde(default)]
    pub models: Vec<String>,
}

impl NodeCapabilities {
    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

mod defaults {
    pub fn one() -> u32 {
        1
    }

    pub fn min_memory_mb() -> u64 {
        512
    }
}

/// Task lifecycle states tracked in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Running,
    Completed,
    Failed,
}

/// Task complexity drives the lease TTL band. Unknown values deserialize as
/// `Medium`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum TaskComplexity {
    Low,
    #[default]
    Medium,
    High,
}

impl From<String> for TaskComplexity {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "low" => TaskComplexity::Low,
            "high" => TaskComplexity::High,
            _ => TaskComplexity::Medium,
        }
    }
}

impl TaskComplexity {
    /// Lease duration for this complexity band.
    pub fn lease_duration(self) -> Duration {
        match self {
            TaskComplexity::Low => Duration::minutes(5),
            TaskComplexity::Medium => Duration::minutes(10),
            TaskComplexity::High => Duration::minutes(15),
        }
    }
}

/// Resource floor a task demands from the node that leases it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredResources {
    #[serde(default = "defaults::one")]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub storage_mb: u64,
    #[serde(default)]
    pub gpu_required: bool,
    #[serde(default)]
    pub gpu_memory_mb: u64,
}

/// A task as persisted in the opaque store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub complexity: TaskComplexity,
    #[serde(default)]
    pub required: RequiredResources,
    #[serde(default)]
    pub payload: Value,
}

/// A time-bounded grant permitting `peer_id` to execute `task_id`.
///
/// The effective "active" predicate is `is_active && expires_at > now`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLease {
    pub lease_id: Uuid,
    pub task_id: Uuid,
    pub peer_id: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl TaskLease {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// Resource kinds named by task requirement limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
    Storage,
}

/// A single `(resource, min, max, unit)` limit on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub resource: ResourceKind,
    pub min_required: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed: Option<f64>,
    pub unit: String,
}

/// Data access boundary a task operates within.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataScope {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
}

/// Capability and resource requirements attached to a task for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub resource_limits: Vec<ResourceLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_scope: Option<DataScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub est_duration_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
}

/// Claims a node holds: string capabilities, numeric limits, data scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub peer_id: String,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub limits: HashMap<String, f64>,
    #[serde(default)]
    pub data_scopes: HashSet<String>,
}

/// Point-in-time resource usage on a node, supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUsage {
    #[serde(default)]
    pub concurrent_tasks: u32,
    #[serde(default)]
    pub gpu_minutes_used: f64,
}

/// Record persisted after a successful join, keyed by node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningRecord {
    pub node_id: String,
    pub assigned_ip: Ipv4Addr,
    pub wireguard_public_key: String,
    pub provisioned_at: DateTime<Utc>,
    pub capabilities: NodeCapabilities,
}
