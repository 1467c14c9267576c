use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use netsync_types::{MacAddr, NicPatch, Vm};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Fields requested on every lookup; everything the reconcilers observe.
const LOOKUP_FIELDS: &str = "uuid,owner_uuid,state,zone_state,nics,resolvers,routes,do_not_inventory,internal_metadata";

#[derive(Debug, Error)]
pub enum VmadmError {
    #[error("failed to run vmadm: {0}")]
    Io(#[from] std::io::Error),
    #[error("vmadm exited with {status}: {stderr}")]
    Exit {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("bad vmadm output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Payload for a single VM mutation. Only the populated groups are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VmUpdate {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_nics: Vec<NicPatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub update_nics: Vec<NicPatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_nics: Vec<MacAddr>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub set_routes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_routes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolvers: Option<Vec<String>>,
}

impl VmUpdate {
    pub fn is_empty(&self) -> bool {
        self.add_nics.is_empty()
            && self.update_nics.is_empty()
            && self.remove_nics.is_empty()
            && self.set_routes.is_empty()
            && self.remove_routes.is_empty()
            && self.resolvers.is_none()
    }
}

/// The VM manager the agent reconciles against. Production talks to the
/// vmadm binary; tests substitute a fake.
#[async_trait]
pub trait VmManager: Send + Sync {
    async fn lookup(&self) -> Result<Vec<Vm>, VmadmError>;
    async fn update(&self, uuid: Uuid, update: &VmUpdate) -> Result<(), VmadmError>;
    async fn reboot(&self, uuid: Uuid) -> Result<(), VmadmError>;
}

/// Shells out to the vmadm CLI.
pub struct VmadmCli {
    path: String,
}

impl VmadmCli {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, VmadmError> {
        let mut cmd = Command::new(&self.path);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(body) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(body).await?;
            }
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(VmadmError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl VmManager for VmadmCli {
    async fn lookup(&self) -> Result<Vec<Vm>, VmadmError> {
        let stdout = self
            .run(&["lookup", "-j", "-o", LOOKUP_FIELDS], None)
            .await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn update(&self, uuid: Uuid, update: &VmUpdate) -> Result<(), VmadmError> {
        let body = serde_json::to_vec(update)?;
        debug!(vm = %uuid, payload = %String::from_utf8_lossy(&body), "vmadm update");
        self.run(&["update", &uuid.to_string()], Some(&body)).await?;
        Ok(())
    }

    async fn reboot(&self, uuid: Uuid) -> Result<(), VmadmError> {
        self.run(&["reboot", &uuid.to_string()], None).await?;
        Ok(())
    }
}
