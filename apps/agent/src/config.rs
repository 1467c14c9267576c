use anyhow::{Context, Result};
use uuid::Uuid;

/// Agent configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the network API.
    pub napi_url: String,
    /// UUID of this compute node. Falls back to the sysinfo UUID when unset.
    pub cn_uuid: Option<Uuid>,
    /// UUID identifying this agent instance.
    pub agent_uuid: Uuid,
    /// UUID of the administrative owner user. NICs parked under this user
    /// with type `other` are claimed back for the node.
    pub admin_uuid: Uuid,
    /// Bind address for the local status endpoint.
    pub bind: String,
    pub vmadm_path: String,
    pub zoneevent_path: String,
    pub sysinfo_path: String,
    /// Zone XML configuration directory watched by the polling event source.
    pub zones_dir: String,
    /// Admin NIC tag to assume when sysinfo does not report one.
    pub admin_nic_tag: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let napi_url = std::env::var("NAPI_URL").context("NAPI_URL is required")?;
        let admin_uuid = std::env::var("ADMIN_UUID")
            .context("ADMIN_UUID is required")?
            .parse()
            .context("ADMIN_UUID is not a valid UUID")?;
        let cn_uuid = match std::env::var("CN_UUID") {
            Ok(raw) => Some(raw.parse().context("CN_UUID is not a valid UUID")?),
            Err(_) => None,
        };
        let agent_uuid = match std::env::var("AGENT_UUID") {
            Ok(raw) => raw.parse().context("AGENT_UUID is not a valid UUID")?,
            Err(_) => Uuid::new_v4(),
        };

        Ok(Self {
            napi_url: napi_url.trim_end_matches('/').to_string(),
            cn_uuid,
            agent_uuid,
            admin_uuid,
            bind: std::env::var("AGENT_BIND").unwrap_or_else(|_| "127.0.0.1:9090".into()),
            vmadm_path: std::env::var("VMADM_PATH").unwrap_or_else(|_| "/usr/sbin/vmadm".into()),
            zoneevent_path: std::env::var("ZONEEVENT_PATH")
                .unwrap_or_else(|_| "/usr/vm/sbin/zoneevent".into()),
            sysinfo_path: std::env::var("SYSINFO_PATH")
                .unwrap_or_else(|_| "/usr/bin/sysinfo".into()),
            zones_dir: std::env::var("ZONES_DIR").unwrap_or_else(|_| "/etc/zones".into()),
            admin_nic_tag: std::env::var("ADMIN_NIC_TAG").unwrap_or_else(|_| "admin".into()),
        })
    }
}
