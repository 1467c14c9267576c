//! Shared fixtures for reconciler tests: a recording VM manager and an
//! agent wired to a mock NetAPI.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use netsync_types::Vm;
use uuid::Uuid;

use crate::agent::Agent;
use crate::config::Config;
use crate::core::napi::NapiClient;
use crate::core::vmadm::{VmManager, VmUpdate, VmadmError};

#[derive(Default)]
pub struct FakeVm {
    pub vms: Mutex<Vec<Vm>>,
    pub updates: Mutex<Vec<(Uuid, VmUpdate)>>,
    pub reboots: Mutex<Vec<Uuid>>,
    pub fail_updates: Mutex<bool>,
}

impl FakeVm {
    pub fn updates_for(&self, uuid: Uuid) -> Vec<VmUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| *u == uuid)
            .map(|(_, update)| update.clone())
            .collect()
    }
}

#[async_trait]
impl VmManager for FakeVm {
    async fn lookup(&self) -> Result<Vec<Vm>, VmadmError> {
        Ok(self.vms.lock().unwrap().clone())
    }

    async fn update(&self, uuid: Uuid, update: &VmUpdate) -> Result<(), VmadmError> {
        if *self.fail_updates.lock().unwrap() {
            use std::os::unix::process::ExitStatusExt;
            return Err(VmadmError::Exit {
                status: std::process::ExitStatus::from_raw(1),
                stderr: "injected failure".into(),
            });
        }
        self.updates.lock().unwrap().push((uuid, update.clone()));
        Ok(())
    }

    async fn reboot(&self, uuid: Uuid) -> Result<(), VmadmError> {
        self.reboots.lock().unwrap().push(uuid);
        Ok(())
    }
}

pub fn test_config(napi_url: &str) -> Config {
    Config {
        napi_url: napi_url.trim_end_matches('/').to_string(),
        cn_uuid: None,
        agent_uuid: Uuid::new_v4(),
        admin_uuid: Uuid::new_v4(),
        bind: "127.0.0.1:0".into(),
        vmadm_path: "/nonexistent/vmadm".into(),
        zoneevent_path: "/nonexistent/zoneevent".into(),
        sysinfo_path: "/nonexistent/sysinfo".into(),
        zones_dir: "/nonexistent/zones".into(),
        admin_nic_tag: "admin".into(),
    }
}

/// Polls `cond` until it holds; panics after a few seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// An agent against the given mock NetAPI with a recording VM manager.
pub fn test_agent(napi_url: &str) -> (Agent, Arc<FakeVm>, Uuid) {
    test_agent_with(test_config(napi_url))
}

pub fn test_agent_with(config: Config) -> (Agent, Arc<FakeVm>, Uuid) {
    let cn_uuid = Uuid::new_v4();
    let napi = NapiClient::new(&config.napi_url).expect("client builds");
    let fake = Arc::new(FakeVm::default());
    let agent = Agent::new(config, cn_uuid, napi, Arc::clone(&fake) as Arc<dyn VmManager>);
    (agent, fake, cn_uuid)
}
