use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use netsync_types::{MacAddr, Nic, NicOwnerType, NicPatch, NicState, Vm, VmNic};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::core::debounce::Debouncer;
use crate::core::machine::{Machine, Phase, TransitionFault};
use crate::core::vmadm::{VmUpdate, VmadmError};
use crate::features::nics::NicHandle;

/// How long update.wait pauses between checks for missing NIC remotes.
const WAIT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Waiting,
    Update,
    UpdateWait,
    UpdateVm,
    Removed,
}

impl Phase for InstancePhase {
    fn successors(self) -> &'static [Self] {
        use InstancePhase::*;
        match self {
            Waiting => &[Update, Removed],
            Update => &[UpdateWait, Removed],
            UpdateWait => &[UpdateVm, Waiting, Removed],
            UpdateVm => &[Waiting, Removed],
            Removed => &[],
        }
    }
}

pub enum InstanceMsg {
    UpdateVm(Box<Vm>),
    Remove,
    Kick,
    Stop,
    Emit(&'static str),
}

#[derive(Clone)]
pub struct InstanceHandle {
    pub uuid: Uuid,
    tx: UnboundedSender<InstanceMsg>,
}

impl InstanceHandle {
    /// Replaces the cached VM snapshot and reprojects its NIC set.
    pub fn update(&self, vm: Vm) {
        let _ = self.tx.send(InstanceMsg::UpdateVm(Box::new(vm)));
    }

    /// The VM no longer exists locally: release every owned NIC and stop.
    pub fn remove(&self) {
        let _ = self.tx.send(InstanceMsg::Remove);
    }

    /// Asserts an update pass without new VM data; used when only the
    /// remote-determined fields (routes, resolvers) moved.
    pub fn kick(&self) {
        let _ = self.tx.send(InstanceMsg::Kick);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(InstanceMsg::Stop);
    }

    /// True once the reconciler task has fully exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn add_nic(&self, agent: &Agent, nic: NicPatch) -> Result<(), VmadmError> {
        let update = VmUpdate {
            add_nics: vec![nic],
            ..Default::default()
        };
        agent.vmadm().update(self.uuid, &update).await?;
        agent.refresh();
        Ok(())
    }

    pub async fn update_nic(&self, agent: &Agent, nic: NicPatch) -> Result<(), VmadmError> {
        let update = VmUpdate {
            update_nics: vec![nic],
            ..Default::default()
        };
        agent.vmadm().update(self.uuid, &update).await?;
        agent.refresh();
        Ok(())
    }

    pub async fn remove_nic(&self, agent: &Agent, mac: MacAddr) -> Result<(), VmadmError> {
        let update = VmUpdate {
            remove_nics: vec![mac],
            ..Default::default()
        };
        agent.vmadm().update(self.uuid, &update).await?;
        agent.refresh();
        Ok(())
    }

    pub async fn reboot(&self, agent: &Agent) -> Result<(), VmadmError> {
        agent.vmadm().reboot(self.uuid).await?;
        agent.refresh();
        Ok(())
    }
}

pub fn spawn(agent: Agent, uuid: Uuid) -> InstanceHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = InstanceHandle {
        uuid,
        tx: tx.clone(),
    };

    tokio::spawn(async move {
        let mut r = InstanceReconciler {
            uuid,
            agent,
            machine: Machine::new(InstancePhase::Waiting),
            vm: None,
            nics: HashMap::new(),
            update_wanted: false,
            remove_wanted: false,
            stop_wanted: false,
            debounce: Debouncer::new(tx),
            rx,
        };
        if let Err(fault) = r.run().await {
            error!(vm = %uuid, %fault, "instance reconciler halted");
        }
        r.teardown();
    });

    handle
}

struct InstanceReconciler {
    uuid: Uuid,
    agent: Agent,
    machine: Machine<InstancePhase>,
    vm: Option<Vm>,
    /// Owned NIC reconciler references, keyed by MAC.
    nics: HashMap<MacAddr, NicHandle>,
    update_wanted: bool,
    /// Release NICs on the way out (the VM is gone), as opposed to a
    /// plain stop (the agent is shutting down).
    remove_wanted: bool,
    stop_wanted: bool,
    debounce: Debouncer<InstanceMsg>,
    rx: UnboundedReceiver<InstanceMsg>,
}

impl InstanceReconciler {
    async fn run(&mut self) -> Result<(), TransitionFault> {
        loop {
            self.drain();

            let phase = self.machine.state();
            if (self.stop_wanted || self.remove_wanted) && phase != InstancePhase::Removed {
                self.machine.advance(InstancePhase::Removed)?;
                continue;
            }

            match phase {
                InstancePhase::Waiting => self.waiting_state().await?,
                InstancePhase::Update => self.machine.advance(InstancePhase::UpdateWait)?,
                InstancePhase::UpdateWait => self.update_wait_state().await?,
                InstancePhase::UpdateVm => self.update_vm_state().await?,
                InstancePhase::Removed => return Ok(()),
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.apply(msg);
        }
    }

    fn apply(&mut self, msg: InstanceMsg) {
        match msg {
            InstanceMsg::UpdateVm(vm) => self.apply_vm(*vm),
            InstanceMsg::Kick => {
                self.debounce
                    .emit_delayed("update", Duration::ZERO, InstanceMsg::Emit("update"));
            }
            InstanceMsg::Emit("update") => self.update_wanted = true,
            InstanceMsg::Emit(channel) => debug!(vm = %self.uuid, channel, "stray emit"),
            InstanceMsg::Remove => self.remove_wanted = true,
            InstanceMsg::Stop => self.stop_wanted = true,
        }
    }

    /// Replace the snapshot and diff the NIC set against the previous one.
    fn apply_vm(&mut self, vm: Vm) {
        for vm_nic in &vm.nics {
            let handle = match self.nics.get(&vm_nic.mac) {
                Some(handle) if !handle.is_stopped() => handle.clone(),
                _ => {
                    let handle = self.agent.watch_nic(vm_nic.mac, self.uuid);
                    self.nics.insert(vm_nic.mac, handle.clone());
                    handle
                }
            };
            handle.set_local(fmt_nic(&vm, vm_nic, self.agent.cn_uuid()));
        }

        let current: Vec<MacAddr> = vm.nics.iter().map(|n| n.mac).collect();
        let gone: Vec<MacAddr> = self
            .nics
            .keys()
            .filter(|mac| !current.contains(mac))
            .copied()
            .collect();
        for mac in gone {
            info!(vm = %self.uuid, mac = %mac, "nic left the vm, releasing");
            self.nics.remove(&mac);
            self.agent.release_nic(mac, self.uuid);
        }

        self.vm = Some(vm);
        self.debounce
            .emit_delayed("update", Duration::ZERO, InstanceMsg::Emit("update"));
    }

    async fn waiting_state(&mut self) -> Result<(), TransitionFault> {
        if self.update_wanted {
            self.update_wanted = false;
            return self.machine.advance(InstancePhase::Update);
        }
        match self.rx.recv().await {
            Some(msg) => self.apply(msg),
            None => self.stop_wanted = true,
        }
        Ok(())
    }

    /// Block until every owned NIC has a remote, so the routes and
    /// resolvers the NICs advertise are knowable.
    async fn update_wait_state(&mut self) -> Result<(), TransitionFault> {
        let missing = self
            .nics
            .values()
            .any(|h| !h.is_stopped() && h.remote().is_none());
        if !missing {
            return self.machine.advance(InstancePhase::UpdateVm);
        }

        tokio::select! {
            maybe = self.rx.recv() => match maybe {
                Some(msg) => self.apply(msg),
                None => self.stop_wanted = true,
            },
            _ = tokio::time::sleep(WAIT_POLL) => {}
        }
        Ok(())
    }

    async fn update_vm_state(&mut self) -> Result<(), TransitionFault> {
        let Some(vm) = self.vm.as_ref() else {
            return self.machine.advance(InstancePhase::Waiting);
        };

        let remotes: Vec<Nic> = self.nics.values().filter_map(|h| h.remote()).collect();
        let update = vm_net_update(vm, &remotes);
        if update.is_empty() {
            return self.machine.advance(InstancePhase::Waiting);
        }

        info!(
            vm = %self.uuid,
            set_routes = update.set_routes.len(),
            remove_routes = update.remove_routes.len(),
            resolvers = update.resolvers.is_some(),
            "applying network config to vm"
        );
        match self.agent.vmadm().update(self.uuid, &update).await {
            Ok(()) => {
                metrics::counter!("netsync_vm_updates", 1);
                // Fold the applied values into the snapshot so an identical
                // pass does not re-issue the same update.
                if let Some(vm) = self.vm.as_mut() {
                    for key in &update.remove_routes {
                        vm.routes.remove(key);
                    }
                    vm.routes.extend(update.set_routes.clone());
                    if let Some(resolvers) = update.resolvers.clone() {
                        vm.resolvers = resolvers;
                    }
                }
            }
            Err(err) => {
                warn!(vm = %self.uuid, error = %err, "vm network update failed");
                self.agent.refresh();
            }
        }
        self.machine.advance(InstancePhase::Waiting)
    }

    fn teardown(&mut self) {
        if self.remove_wanted {
            for mac in self.nics.keys() {
                self.agent.release_nic(*mac, self.uuid);
            }
        }
        self.nics.clear();
        self.agent.forget_instance(self.uuid);
        debug!(vm = %self.uuid, "instance reconciler stopped");
    }
}

/// Project a VM NIC into the local view handed to its NIC reconciler.
pub fn fmt_nic(vm: &Vm, nic: &VmNic, cn_uuid: Uuid) -> Nic {
    Nic {
        mac: Some(nic.mac),
        belongs_to_type: Some(NicOwnerType::Zone),
        belongs_to_uuid: Some(vm.uuid),
        owner_uuid: vm.owner_uuid,
        primary: nic.primary,
        state: Some(NicState::from_vm_state(&vm.state)),
        cn_uuid: Some(cn_uuid),
        allow_dhcp_spoofing: nic.allow_dhcp_spoofing,
        allow_ip_spoofing: nic.allow_ip_spoofing,
        allow_mac_spoofing: nic.allow_mac_spoofing,
        allow_restricted_traffic: nic.allow_restricted_traffic,
        allow_unfiltered_promisc: nic.allow_unfiltered_promisc,
        gateway: nic.gateway.clone(),
        ip: nic.ip.clone(),
        model: nic.model.clone(),
        mtu: nic.mtu,
        netmask: nic.netmask.clone(),
        network_uuid: nic.network_uuid,
        nic_tag: nic.nic_tag.clone(),
        vlan_id: nic.vlan_id,
        resolvers: None,
        routes: None,
    }
}

/// Target routes and resolvers: the union across the NIC remotes, in a
/// stable order.
pub fn target_net_config(remotes: &[Nic]) -> (BTreeMap<String, String>, Vec<String>) {
    let mut routes = BTreeMap::new();
    let mut resolvers = Vec::new();
    for nic in remotes {
        if let Some(nic_routes) = &nic.routes {
            routes.extend(nic_routes.clone());
        }
        if let Some(nic_resolvers) = &nic.resolvers {
            for resolver in nic_resolvers {
                if !resolvers.contains(resolver) {
                    resolvers.push(resolver.clone());
                }
            }
        }
    }
    (routes, resolvers)
}

/// Diff the target network config against the VM's current one.
pub fn vm_net_update(vm: &Vm, remotes: &[Nic]) -> VmUpdate {
    let (target_routes, target_resolvers) = target_net_config(remotes);

    let mut update = VmUpdate::default();
    for (dest, gw) in &target_routes {
        if vm.routes.get(dest) != Some(gw) {
            update.set_routes.insert(dest.clone(), gw.clone());
        }
    }
    for dest in vm.routes.keys() {
        if !target_routes.contains_key(dest) {
            update.remove_routes.push(dest.clone());
        }
    }
    if vm.resolvers != target_resolvers {
        update.resolvers = Some(target_resolvers);
    }
    update
}
