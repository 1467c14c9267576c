use std::collections::BTreeMap;

use netsync_types::MacAddr;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SysinfoError {
    #[error("failed to run sysinfo: {0}")]
    Io(#[from] std::io::Error),
    #[error("sysinfo exited with {status}: {stderr}")]
    Exit {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("bad sysinfo output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Node-level data as reported by the sysinfo subprocess.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    #[serde(rename = "Admin NIC Tag", default)]
    pub admin_nic_tag: Option<String>,
    #[serde(rename = "Network Interfaces", default)]
    pub network_interfaces: BTreeMap<String, PhysicalNic>,
    #[serde(rename = "Virtual Network Interfaces", default)]
    pub virtual_interfaces: BTreeMap<String, VirtualNic>,
    #[serde(rename = "Link Aggregations", default)]
    pub link_aggregations: BTreeMap<String, LinkAggregation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhysicalNic {
    #[serde(rename = "MAC Address")]
    pub mac: MacAddr,
    #[serde(rename = "NIC Names", default)]
    pub nic_names: Vec<String>,
    #[serde(rename = "Link Status", default)]
    pub link_status: Option<String>,
    #[serde(rename = "ip4addr", default)]
    pub ip4addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualNic {
    #[serde(rename = "MAC Address")]
    pub mac: MacAddr,
    #[serde(rename = "Host Interface", default)]
    pub host_interface: Option<String>,
    #[serde(rename = "VLAN", default, deserialize_with = "vlan_id")]
    pub vlan: Option<u16>,
    #[serde(rename = "Link Status", default)]
    pub link_status: Option<String>,
    #[serde(rename = "ip4addr", default)]
    pub ip4addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkAggregation {
    #[serde(rename = "Interfaces", default)]
    pub interfaces: Vec<String>,
    #[serde(rename = "LACP mode", default)]
    pub lacp_mode: Option<String>,
}

// Older platforms report the VLAN as a string.
fn vlan_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_u64().map(|v| v as u16)),
        Some(serde_json::Value::String(s)) => Ok(s.trim().parse().ok()),
        Some(other) => Err(serde::de::Error::custom(format!(
            "unexpected VLAN value {other}"
        ))),
    }
}

pub fn parse(raw: &str) -> Result<NodeInfo, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Runs the sysinfo subprocess and parses its JSON report.
pub async fn load(path: &str) -> Result<NodeInfo, SysinfoError> {
    let output = Command::new(path).output().await?;
    if !output.status.success() {
        return Err(SysinfoError::Exit {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(parse(&String::from_utf8_lossy(&output.stdout))?)
}
