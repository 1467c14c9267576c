pub mod diff;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsync_types::{MacAddr, Nic, NicOwnerType, NicState};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::core::debounce::Debouncer;
use crate::core::machine::{Machine, Phase, TransitionFault, RETRY_DELAY};
use crate::core::napi::{Deleted, Fetched};
use crate::features::instances::InstanceHandle;
use crate::features::node::NodeHandle;

/// Long-horizon repair: a waiting NIC refreshes hourly regardless of
/// signals.
const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicPhase {
    Init,
    Refresh,
    Create,
    Update,
    UpdateLocal,
    UpdateNapi,
    Remove,
    RemoveNic,
    RemoveReboot,
    Release,
    ReleaseDelete,
    ReleaseRefresh,
    Waiting,
    Stopped,
}

impl Phase for NicPhase {
    fn successors(self) -> &'static [Self] {
        use NicPhase::*;
        match self {
            Init => &[Refresh, Stopped],
            Refresh => &[Update, Create, Remove, Release, Stopped],
            Create => &[Waiting, Update, Release, Stopped],
            Update => &[Waiting, UpdateNapi, UpdateLocal, Remove, Refresh, Release, Stopped],
            UpdateLocal => &[UpdateNapi, Waiting, Release, Stopped],
            UpdateNapi => &[Update, Waiting, Remove, Release, Stopped],
            Remove => &[RemoveNic, Stopped],
            RemoveNic => &[RemoveReboot, Stopped],
            RemoveReboot => &[Stopped],
            Release => &[ReleaseDelete, Stopped],
            ReleaseDelete => &[ReleaseRefresh, Stopped],
            ReleaseRefresh => &[ReleaseDelete, Stopped],
            Waiting => &[Update, Refresh, Release, Stopped],
            Stopped => &[],
        }
    }
}

pub enum NicMsg {
    SetLocal(Box<Nic>),
    Refresh { etag: Option<String> },
    NetworkChanged,
    ReleaseFrom(Uuid),
    Stop,
    Emit(&'static str),
}

/// Read-only mirror of the reconciler's views, written only by its task.
/// Lets referencers (the owning instance) observe the remote without
/// entering the state machine.
#[derive(Default)]
pub struct NicSnapshot {
    pub local: Option<Nic>,
    pub remote: Option<Nic>,
    pub etag: Option<String>,
    pub stopped: bool,
}

#[derive(Clone)]
pub struct NicHandle {
    pub mac: MacAddr,
    pub generation: u64,
    tx: UnboundedSender<NicMsg>,
    shared: Arc<Mutex<NicSnapshot>>,
}

impl NicHandle {
    /// Replaces the local view. Referencers only.
    pub fn set_local(&self, nic: Nic) {
        let _ = self.tx.send(NicMsg::SetLocal(Box::new(nic)));
    }

    /// Requests a refresh. Passing the etag of a change we caused makes
    /// this a no-op, so change feeds echoing our own writes do not cause
    /// refresh storms.
    pub fn refresh(&self, etag: Option<String>) {
        let _ = self.tx.send(NicMsg::Refresh { etag });
    }

    pub fn network_changed(&self) {
        let _ = self.tx.send(NicMsg::NetworkChanged);
    }

    /// Asserts that `belongs_to_uuid` no longer holds this NIC locally;
    /// schedules its deletion from NetAPI.
    pub fn release_from(&self, belongs_to_uuid: Uuid) {
        let _ = self.tx.send(NicMsg::ReleaseFrom(belongs_to_uuid));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(NicMsg::Stop);
    }

    pub fn remote(&self) -> Option<Nic> {
        self.shared.lock().unwrap().remote.clone()
    }

    pub fn local(&self) -> Option<Nic> {
        self.shared.lock().unwrap().local.clone()
    }

    pub fn etag(&self) -> Option<String> {
        self.shared.lock().unwrap().etag.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().unwrap().stopped
    }
}

pub fn spawn(agent: Agent, mac: MacAddr, generation: u64) -> NicHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(NicSnapshot::default()));
    let handle = NicHandle {
        mac,
        generation,
        tx: tx.clone(),
        shared: Arc::clone(&shared),
    };

    tokio::spawn(async move {
        let mut r = NicReconciler {
            mac,
            generation,
            agent,
            machine: Machine::new(NicPhase::Init),
            shared,
            local: None,
            remote: None,
            etag: None,
            released: None,
            network: None,
            vm_fields_pending: false,
            sig: Signals::default(),
            debounce: Debouncer::new(tx),
            rx,
        };
        if let Err(fault) = r.run().await {
            error!(mac = %mac, %fault, "nic reconciler halted");
        }
        r.teardown();
    });

    handle
}

#[derive(Default)]
struct Signals {
    update: bool,
    refresh: bool,
    release: bool,
    stop: bool,
}

enum Owner {
    Instance(InstanceHandle),
    Node(NodeHandle),
    MissingInstance(Uuid),
    Foreign,
    Unknown,
}

struct NicReconciler {
    mac: MacAddr,
    generation: u64,
    agent: Agent,
    machine: Machine<NicPhase>,
    shared: Arc<Mutex<NicSnapshot>>,
    local: Option<Nic>,
    remote: Option<Nic>,
    etag: Option<String>,
    /// The referencer release_from asserted; must match the remote's
    /// belongs_to_uuid for a DELETE to go out.
    released: Option<Uuid>,
    /// Network this NIC currently subscribes to.
    network: Option<Uuid>,
    /// Remote VM-affecting fields (routes, resolvers) changed since the
    /// owner last recomputed.
    vm_fields_pending: bool,
    sig: Signals,
    debounce: Debouncer<NicMsg>,
    rx: UnboundedReceiver<NicMsg>,
}

impl NicReconciler {
    async fn run(&mut self) -> Result<(), TransitionFault> {
        loop {
            self.drain();

            let phase = self.machine.state();
            if self.sig.stop && phase != NicPhase::Stopped {
                self.machine.advance(NicPhase::Stopped)?;
                continue;
            }
            if self.sig.release
                && matches!(
                    phase,
                    NicPhase::Refresh
                        | NicPhase::Update
                        | NicPhase::UpdateLocal
                        | NicPhase::UpdateNapi
                        | NicPhase::Waiting
                )
            {
                self.sig.release = false;
                self.machine.advance(NicPhase::Release)?;
                continue;
            }

            match phase {
                NicPhase::Init => self.machine.advance(NicPhase::Refresh)?,
                NicPhase::Refresh => self.refresh_state().await?,
                NicPhase::Create => self.create_state().await?,
                NicPhase::Update => self.update_state()?,
                NicPhase::UpdateLocal => self.update_local_state().await?,
                NicPhase::UpdateNapi => self.update_napi_state().await?,
                NicPhase::Remove => self.machine.advance(NicPhase::RemoveNic)?,
                NicPhase::RemoveNic => self.remove_nic_state().await?,
                NicPhase::RemoveReboot => self.remove_reboot_state().await?,
                NicPhase::Release => self.machine.advance(NicPhase::ReleaseDelete)?,
                NicPhase::ReleaseDelete => self.release_delete_state().await?,
                NicPhase::ReleaseRefresh => self.release_refresh_state().await?,
                NicPhase::Waiting => self.waiting_state().await?,
                NicPhase::Stopped => return Ok(()),
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.apply(msg);
        }
    }

    fn apply(&mut self, msg: NicMsg) {
        match msg {
            NicMsg::SetLocal(nic) => {
                self.local = Some(*nic);
                self.sync_shared();
                self.debounce
                    .emit_delayed("set", Duration::ZERO, NicMsg::Emit("set"));
            }
            NicMsg::Emit("set") => self.sig.update = true,
            NicMsg::Emit(channel) => debug!(mac = %self.mac, channel, "stray emit"),
            NicMsg::Refresh { etag } => {
                if etag.is_some() && etag == self.etag {
                    debug!(mac = %self.mac, "refresh for our own etag, ignoring");
                } else {
                    self.sig.refresh = true;
                }
            }
            NicMsg::NetworkChanged => self.sig.refresh = true,
            NicMsg::ReleaseFrom(uuid) => {
                self.released = Some(uuid);
                self.sig.release = true;
            }
            NicMsg::Stop => self.sig.stop = true,
        }
    }

    async fn refresh_state(&mut self) -> Result<(), TransitionFault> {
        match self.agent.napi().get_nic(self.mac).await {
            Ok(Fetched::Found { body, etag }) => {
                self.set_remote(body, etag);
                self.machine.advance(NicPhase::Update)
            }
            Ok(Fetched::Missing) if self.remote.is_none() => {
                // NetAPI has never heard of this NIC; register it.
                self.machine.advance(NicPhase::Create)
            }
            Ok(Fetched::Missing) => {
                // NetAPI dropped a NIC we had seen: remove it locally too.
                info!(mac = %self.mac, "nic vanished from NetAPI, removing locally");
                self.machine.advance(NicPhase::Remove)
            }
            Err(err) => {
                warn!(mac = %self.mac, error = %err, "nic refresh failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn create_state(&mut self) -> Result<(), TransitionFault> {
        let Some(local) = self.local.clone() else {
            return self.machine.advance(NicPhase::Waiting);
        };

        match self.agent.napi().create_nic(self.mac, &local).await {
            Ok((nic, etag)) => {
                metrics::counter!("netsync_nic_creates", 1);
                self.set_remote(nic, etag);
                // A release that arrived while the POST was in flight was
                // deferred; the POST has fully completed, honor it now.
                self.drain();
                if self.sig.release {
                    self.sig.release = false;
                    self.machine.advance(NicPhase::Release)
                } else {
                    self.machine.advance(NicPhase::Update)
                }
            }
            Err(err) => {
                warn!(mac = %self.mac, error = %err, "nic create failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    /// Decide the direction of movement.
    fn update_state(&mut self) -> Result<(), TransitionFault> {
        let Some(local) = self.local.as_ref() else {
            return self.machine.advance(NicPhase::Waiting);
        };
        // A `set` can land before NetAPI has told us anything (404 went to
        // create while the local view was still missing); fetch first.
        let Some(remote) = self.remote.as_ref() else {
            return self.machine.advance(NicPhase::Refresh);
        };

        let admin_parked = remote.belongs_to_type == Some(NicOwnerType::Other)
            && remote.belongs_to_uuid == Some(self.agent.admin_uuid())
            && local.belongs_to_type == Some(NicOwnerType::Server);
        if admin_parked {
            // The NIC was parked under the admin user; claim it for the node.
            info!(mac = %self.mac, "claiming admin-parked nic for this node");
            return self.machine.advance(NicPhase::UpdateNapi);
        }

        if local.belongs_to_uuid != remote.belongs_to_uuid {
            info!(
                mac = %self.mac,
                local_owner = ?local.belongs_to_uuid,
                remote_owner = ?remote.belongs_to_uuid,
                "nic ownership moved, removing locally"
            );
            return self.machine.advance(NicPhase::Remove);
        }

        self.machine.advance(NicPhase::UpdateLocal)
    }

    /// Push remote-authoritative fields down onto the local entity.
    async fn update_local_state(&mut self) -> Result<(), TransitionFault> {
        let (local, remote) = match (self.local.as_ref(), self.remote.as_ref()) {
            (Some(l), Some(r)) => (l, r),
            _ => return self.machine.advance(NicPhase::Waiting),
        };

        let mut locupdate = diff::pull_down(remote, local);
        let vm_update = self.vm_fields_pending;
        if locupdate.is_empty() && !vm_update {
            return self.machine.advance(NicPhase::UpdateNapi);
        }

        match self.owner() {
            Owner::Instance(instance) => {
                if locupdate.is_empty() {
                    // Only routes/resolvers moved; the owner recomputes them.
                    instance.kick();
                    self.vm_fields_pending = false;
                    self.machine.advance(NicPhase::UpdateNapi)
                } else {
                    locupdate.mac = Some(self.mac);
                    match instance.update_nic(&self.agent, locupdate).await {
                        Ok(()) => {
                            self.vm_fields_pending = false;
                            self.machine.advance(NicPhase::UpdateNapi)
                        }
                        Err(err) => {
                            warn!(mac = %self.mac, error = %err, "vm nic update failed, retrying");
                            tokio::time::sleep(RETRY_DELAY).await;
                            Ok(())
                        }
                    }
                }
            }
            Owner::Node(node) => {
                if local.belongs_to_uuid != Some(self.agent.cn_uuid()) {
                    warn!(
                        mac = %self.mac,
                        belongs_to = ?local.belongs_to_uuid,
                        "server nic does not belong to this node"
                    );
                    return self.machine.advance(NicPhase::Waiting);
                }
                if locupdate.is_empty() {
                    // Only routes/resolvers moved, and the node consumes
                    // neither; nothing to hand the owner.
                    self.vm_fields_pending = false;
                    return self.machine.advance(NicPhase::UpdateNapi);
                }
                locupdate.mac = Some(self.mac);
                node.update_nic(self.mac, &locupdate);
                self.vm_fields_pending = false;
                self.machine.advance(NicPhase::UpdateNapi)
            }
            Owner::MissingInstance(uuid) => {
                warn!(mac = %self.mac, vm = %uuid, "owning instance reconciler not found");
                self.machine.advance(NicPhase::Waiting)
            }
            Owner::Foreign | Owner::Unknown => {
                warn!(mac = %self.mac, owner = ?local.belongs_to_type, "no local owner to update");
                self.machine.advance(NicPhase::Waiting)
            }
        }
    }

    /// Push local-authoritative fields up to NetAPI.
    async fn update_napi_state(&mut self) -> Result<(), TransitionFault> {
        let (local, remote) = match (self.local.as_ref(), self.remote.as_ref()) {
            (Some(l), Some(r)) => (l, r),
            _ => return self.machine.advance(NicPhase::Waiting),
        };

        let remupdate = diff::push_up(local, remote);
        if remupdate.is_empty() {
            return self.machine.advance(NicPhase::Waiting);
        }

        match self.agent.napi().update_nic(self.mac, &remupdate).await {
            Ok(Fetched::Found { body, etag }) => {
                metrics::counter!("netsync_nic_puts", 1);
                self.set_remote(body, etag);
                self.drain();
                if self.sig.release {
                    self.sig.release = false;
                    self.machine.advance(NicPhase::Release)
                } else {
                    // Re-enter update so the fresh server truth propagates
                    // back down in the same pass.
                    self.machine.advance(NicPhase::Update)
                }
            }
            Ok(Fetched::Missing) => {
                info!(mac = %self.mac, "nic disappeared during update, removing locally");
                self.machine.advance(NicPhase::Remove)
            }
            Err(err) => {
                warn!(mac = %self.mac, error = %err, "nic update to NetAPI failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn remove_nic_state(&mut self) -> Result<(), TransitionFault> {
        match self.owner() {
            Owner::Instance(instance) => {
                match instance.remove_nic(&self.agent, self.mac).await {
                    Ok(()) => {
                        metrics::counter!("netsync_nic_removes", 1);
                        self.machine.advance(NicPhase::RemoveReboot)
                    }
                    Err(err) => {
                        warn!(mac = %self.mac, error = %err, "vm nic removal failed, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                        Ok(())
                    }
                }
            }
            Owner::Node(node) => {
                node.remove_nic(self.mac);
                self.machine.advance(NicPhase::RemoveReboot)
            }
            _ => {
                debug!(mac = %self.mac, "no local owner to remove the nic from");
                self.machine.advance(NicPhase::RemoveReboot)
            }
        }
    }

    async fn remove_reboot_state(&mut self) -> Result<(), TransitionFault> {
        // Reboot the VM so lingering configuration cannot trip duplicate
        // address detection. Nodes are never rebooted for this.
        if let Owner::Instance(instance) = self.owner() {
            if let Err(err) = instance.reboot(&self.agent).await {
                warn!(mac = %self.mac, error = %err, "reboot after nic removal failed");
            }
        }
        self.machine.advance(NicPhase::Stopped)
    }

    async fn release_delete_state(&mut self) -> Result<(), TransitionFault> {
        let skip = match self.remote.as_ref() {
            None => Some("never seen in NetAPI"),
            Some(remote) => {
                if self.released != remote.belongs_to_uuid {
                    Some("owned by someone else now")
                } else if !matches!(remote.state, Some(NicState::Running) | Some(NicState::Stopped))
                {
                    Some("not in a deletable state")
                } else if self.etag.is_none() {
                    Some("no etag held")
                } else {
                    None
                }
            }
        };
        if let Some(reason) = skip {
            debug!(mac = %self.mac, reason, "skipping NetAPI delete");
            return self.machine.advance(NicPhase::Stopped);
        }

        let etag = self.etag.clone().expect("guard checked the etag");
        match self.agent.napi().delete_nic(self.mac, &etag).await {
            Ok(Deleted::Done) => {
                metrics::counter!("netsync_nic_deletes", 1);
                info!(mac = %self.mac, "nic deleted from NetAPI");
                self.machine.advance(NicPhase::Stopped)
            }
            Ok(Deleted::Missing) => self.machine.advance(NicPhase::Stopped),
            Ok(Deleted::Conflict) => {
                // Someone else wrote the NIC since our last GET.
                debug!(mac = %self.mac, "delete hit a stale etag, refreshing");
                self.machine.advance(NicPhase::ReleaseRefresh)
            }
            Err(err) => {
                warn!(mac = %self.mac, error = %err, "nic delete failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn release_refresh_state(&mut self) -> Result<(), TransitionFault> {
        match self.agent.napi().get_nic(self.mac).await {
            Ok(Fetched::Found { body, etag }) => {
                self.set_remote(body, etag);
                self.machine.advance(NicPhase::ReleaseDelete)
            }
            Ok(Fetched::Missing) => self.machine.advance(NicPhase::Stopped),
            Err(err) => {
                warn!(mac = %self.mac, error = %err, "release refresh failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn waiting_state(&mut self) -> Result<(), TransitionFault> {
        if self.sig.refresh {
            self.sig.refresh = false;
            return self.machine.advance(NicPhase::Refresh);
        }
        if self.sig.update {
            self.sig.update = false;
            return self.machine.advance(NicPhase::Update);
        }

        tokio::select! {
            maybe = self.rx.recv() => match maybe {
                Some(msg) => self.apply(msg),
                None => self.sig.stop = true,
            },
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                debug!(mac = %self.mac, "periodic nic refresh");
                self.sig.refresh = true;
            }
        }
        Ok(())
    }

    fn owner(&self) -> Owner {
        let Some(local) = self.local.as_ref() else {
            return Owner::Unknown;
        };
        match local.belongs_to_type {
            Some(NicOwnerType::Zone) => match local.belongs_to_uuid {
                Some(uuid) => match self.agent.instance(uuid) {
                    Some(handle) => Owner::Instance(handle),
                    None => Owner::MissingInstance(uuid),
                },
                None => Owner::Unknown,
            },
            Some(NicOwnerType::Server) => match self.agent.node() {
                Some(node) => Owner::Node(node),
                None => Owner::Unknown,
            },
            Some(NicOwnerType::Other) => Owner::Foreign,
            Some(NicOwnerType::Unknown) | None => Owner::Unknown,
        }
    }

    fn set_remote(&mut self, nic: Nic, etag: Option<String>) {
        self.vm_fields_pending |= diff::vm_fields_changed(&nic, self.remote.as_ref());

        if nic.network_uuid != self.network {
            if let Some(old) = self.network.take() {
                self.agent.release_network(old, self.mac);
            }
            if let Some(new) = nic.network_uuid {
                self.agent.watch_network(new, self.mac);
                self.network = Some(new);
            }
        } else if let Some(net) = self.network {
            // A 404 stops a network reconciler permanently; re-create it
            // if it fell away while we still depend on the network.
            if self.agent.network(net).is_none() {
                self.agent.watch_network(net, self.mac);
            }
        }

        self.remote = Some(nic);
        if etag.is_some() {
            self.etag = etag;
        }
        self.sync_shared();
    }

    fn sync_shared(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.local = self.local.clone();
        shared.remote = self.remote.clone();
        shared.etag = self.etag.clone();
    }

    /// Terminal cleanup: this incarnation is done, drop every trace of it.
    fn teardown(&mut self) {
        self.local = None;
        self.remote = None;
        self.etag = None;
        {
            let mut shared = self.shared.lock().unwrap();
            shared.local = None;
            shared.remote = None;
            shared.etag = None;
            shared.stopped = true;
        }
        if let Some(network) = self.network.take() {
            self.agent.release_network(network, self.mac);
        }
        self.agent.forget_nic(self.mac, self.generation);
        debug!(mac = %self.mac, "nic reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::instances::fmt_nic;
    use crate::testutil::{test_agent, wait_until};
    use netsync_types::{Vm, VmNic};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MAC: &str = "aa:bb:cc:11:22:33";

    fn mac() -> MacAddr {
        MAC.parse().unwrap()
    }

    fn zone_local(vm_uuid: Uuid, owner: Uuid, cn: Uuid) -> Nic {
        Nic {
            mac: Some(mac()),
            belongs_to_type: Some(NicOwnerType::Zone),
            belongs_to_uuid: Some(vm_uuid),
            owner_uuid: Some(owner),
            state: Some(NicState::Running),
            cn_uuid: Some(cn),
            ip: Some("172.26.7.30".into()),
            netmask: Some("255.255.255.0".into()),
            ..Default::default()
        }
    }

    fn found(nic: &Nic, etag: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("Etag", etag)
            .set_body_json(serde_json::to_value(nic).unwrap())
    }

    fn test_vm(vm_uuid: Uuid) -> Vm {
        Vm {
            uuid: vm_uuid,
            owner_uuid: Some(Uuid::new_v4()),
            state: "running".into(),
            nics: vec![VmNic {
                interface: Some("net0".into()),
                mac: mac(),
                ip: Some("172.26.7.30".into()),
                gateway: Some("172.26.7.1".into()),
                netmask: Some("255.255.255.0".into()),
                nic_tag: Some("external".into()),
                vlan_id: Some(0),
                primary: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_nic_is_registered_with_netapi() {
        let server = MockServer::start().await;
        let (agent, _vmadm, cn) = test_agent(&server.uri());
        let vm_uuid = Uuid::new_v4();
        let local = zone_local(vm_uuid, Uuid::new_v4(), cn);

        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/nics/{MAC}")))
            .and(body_partial_json(serde_json::json!({
                "belongs_to_type": "zone",
                "belongs_to_uuid": vm_uuid,
                "check_owner": false,
            })))
            .respond_with(found(&local, "v1"))
            .expect(1)
            .mount(&server)
            .await;

        let handle = agent.watch_nic(mac(), vm_uuid);
        handle.set_local(local);

        wait_until("nic registered", || handle.etag().as_deref() == Some("v1")).await;
        assert_eq!(
            handle.remote().unwrap().belongs_to_uuid,
            Some(vm_uuid)
        );
        assert_eq!(handle.local().unwrap().belongs_to_uuid, Some(vm_uuid));
        assert!(!handle.is_stopped());
    }

    #[tokio::test]
    async fn admin_parked_nic_is_claimed_for_the_node() {
        let server = MockServer::start().await;
        let (agent, _vmadm, cn) = test_agent(&server.uri());
        let admin = agent.admin_uuid();

        let local = Nic {
            mac: Some(mac()),
            belongs_to_type: Some(NicOwnerType::Server),
            belongs_to_uuid: Some(cn),
            owner_uuid: Some(admin),
            state: Some(NicState::Running),
            cn_uuid: Some(cn),
            ..Default::default()
        };
        let mut parked = local.clone();
        parked.belongs_to_type = Some(NicOwnerType::Other);
        parked.belongs_to_uuid = Some(admin);

        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(found(&parked, "v1"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/nics/{MAC}")))
            .and(body_partial_json(serde_json::json!({
                "belongs_to_type": "server",
                "belongs_to_uuid": cn,
                "check_owner": false,
            })))
            .respond_with(found(&local, "v2"))
            .expect(1)
            .mount(&server)
            .await;

        let handle = agent.watch_nic(mac(), cn);
        handle.set_local(local);

        wait_until("nic claimed", || handle.etag().as_deref() == Some("v2")).await;
        assert_eq!(
            handle.remote().unwrap().belongs_to_type,
            Some(NicOwnerType::Server)
        );
    }

    #[tokio::test]
    async fn release_retries_after_a_stale_etag() {
        let server = MockServer::start().await;
        let (agent, _vmadm, cn) = test_agent(&server.uri());
        let vm_uuid = Uuid::new_v4();
        let local = zone_local(vm_uuid, Uuid::new_v4(), cn);

        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(found(&local, "v1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(found(&local, "v2"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/nics/{MAC}")))
            .and(header("If-Match", "v1"))
            .respond_with(ResponseTemplate::new(412))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/nics/{MAC}")))
            .and(header("If-Match", "v2"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let handle = agent.watch_nic(mac(), vm_uuid);
        handle.set_local(local);
        wait_until("nic settled", || handle.etag().as_deref() == Some("v1")).await;

        agent.release_nic(mac(), vm_uuid);
        wait_until("reconciler removed", || agent.nic(mac()).is_none()).await;
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn refresh_with_our_own_etag_is_a_noop() {
        let server = MockServer::start().await;
        let (agent, _vmadm, cn) = test_agent(&server.uri());
        let vm_uuid = Uuid::new_v4();
        let local = zone_local(vm_uuid, Uuid::new_v4(), cn);

        // Exactly one GET is allowed; an echo-triggered refresh would hit
        // the mock server's 404 fallback and head into remove.
        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(found(&local, "v1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let handle = agent.watch_nic(mac(), vm_uuid);
        handle.set_local(local);
        wait_until("nic settled", || handle.etag().as_deref() == Some("v1")).await;

        handle.refresh(Some("v1".into()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.etag().as_deref(), Some("v1"));
        assert!(!handle.is_stopped());
    }

    #[tokio::test]
    async fn remote_spoof_toggle_flows_down_to_the_vm() {
        let server = MockServer::start().await;
        let (agent, vmadm, cn) = test_agent(&server.uri());
        let vm = test_vm(Uuid::new_v4());
        let view = fmt_nic(&vm, &vm.nics[0], cn);

        let mut flipped = view.clone();
        flipped.allow_ip_spoofing = Some(true);

        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(found(&view, "v1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(found(&flipped, "v2"))
            .mount(&server)
            .await;
        // The toggle is remote-authoritative: NetAPI must not be written.
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        agent.apply_vms(vec![vm.clone()]);
        wait_until("nic settled", || {
            agent
                .nic(mac())
                .is_some_and(|h| h.etag().as_deref() == Some("v1"))
        })
        .await;

        agent.nic(mac()).unwrap().refresh(None);
        wait_until("vm nic updated", || {
            vmadm
                .updates_for(vm.uuid)
                .iter()
                .any(|u| u.update_nics.iter().any(|n| n.allow_ip_spoofing == Some(true)))
        })
        .await;
        assert!(vmadm.reboots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn vm_stop_is_pushed_up_as_one_put() {
        let server = MockServer::start().await;
        let (agent, vmadm, cn) = test_agent(&server.uri());
        let vm = test_vm(Uuid::new_v4());
        let view = fmt_nic(&vm, &vm.nics[0], cn);

        let mut stopped_view = view.clone();
        stopped_view.state = Some(NicState::Stopped);

        Mock::given(method("GET"))
            .and(path(format!("/nics/{MAC}")))
            .respond_with(found(&view, "v1"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/nics/{MAC}")))
            .and(body_partial_json(serde_json::json!({"state": "stopped"})))
            .respond_with(found(&stopped_view, "v2"))
            .expect(1)
            .mount(&server)
            .await;

        agent.apply_vms(vec![vm.clone()]);
        wait_until("nic settled", || {
            agent
                .nic(mac())
                .is_some_and(|h| h.etag().as_deref() == Some("v1"))
        })
        .await;

        let mut stopped_vm = vm.clone();
        stopped_vm.state = "stopped".into();
        agent.apply_vms(vec![stopped_vm]);

        wait_until("state pushed up", || {
            agent
                .nic(mac())
                .is_some_and(|h| h.etag().as_deref() == Some("v2"))
        })
        .await;
        assert!(vmadm.reboots.lock().unwrap().is_empty());
    }

    #[test]
    fn transition_table_matches_the_design() {
        use NicPhase::*;
        assert_eq!(Init.successors(), &[Refresh, Stopped]);
        assert_eq!(Refresh.successors(), &[Update, Create, Remove, Release, Stopped]);
        assert_eq!(Create.successors(), &[Waiting, Update, Release, Stopped]);
        assert_eq!(
            Update.successors(),
            &[Waiting, UpdateNapi, UpdateLocal, Remove, Refresh, Release, Stopped]
        );
        assert_eq!(UpdateLocal.successors(), &[UpdateNapi, Waiting, Release, Stopped]);
        assert_eq!(
            UpdateNapi.successors(),
            &[Update, Waiting, Remove, Release, Stopped]
        );
        assert_eq!(Remove.successors(), &[RemoveNic, Stopped]);
        assert_eq!(RemoveNic.successors(), &[RemoveReboot, Stopped]);
        assert_eq!(RemoveReboot.successors(), &[Stopped]);
        assert_eq!(Release.successors(), &[ReleaseDelete, Stopped]);
        assert_eq!(ReleaseDelete.successors(), &[ReleaseRefresh, Stopped]);
        assert_eq!(ReleaseRefresh.successors(), &[ReleaseDelete, Stopped]);
        assert_eq!(Waiting.successors(), &[Update, Refresh, Release, Stopped]);
        assert!(Stopped.successors().is_empty());
    }

    #[test]
    fn stopped_is_reachable_from_everywhere_else() {
        use NicPhase::*;
        for phase in [
            Init,
            Refresh,
            Create,
            Update,
            UpdateLocal,
            UpdateNapi,
            Remove,
            RemoveNic,
            RemoveReboot,
            Release,
            ReleaseDelete,
            ReleaseRefresh,
            Waiting,
        ] {
            assert!(
                phase.successors().contains(&Stopped),
                "{phase:?} cannot stop"
            );
        }
    }
}
