use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use netsync_types::{MacAddr, Vm};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::machine::{Machine, Phase, PROBE_RETRY_DELAY};
use crate::core::napi::NapiClient;
use crate::core::vmadm::VmManager;
use crate::features::aggrs::{self, AggrHandle};
use crate::features::instances::{self, InstanceHandle};
use crate::features::networks::{self, NetworkHandle};
use crate::features::nics::{self, NicHandle};
use crate::features::node::{self, NodeHandle};
use crate::watcher::{self, WatcherSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Waiting,
    Init,
    InitDetermineEventSource,
    InitStartWatcher,
    Running,
    Stopping,
    Stopped,
}

impl Phase for AgentPhase {
    fn successors(self) -> &'static [Self] {
        use AgentPhase::*;
        match self {
            Waiting => &[Init, Stopping],
            Init => &[InitDetermineEventSource, Stopping],
            InitDetermineEventSource => &[InitStartWatcher, Stopping],
            InitStartWatcher => &[Running, Stopping],
            // The event source can die mid-flight; determination restarts.
            Running => &[InitDetermineEventSource, Stopping],
            Stopping => &[Stopped],
            Stopped => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitRecord {
    pub state: String,
    pub at_us: u64,
}

struct Tracked<H, R> {
    handle: H,
    refs: HashSet<R>,
}

#[derive(Default)]
struct Registry {
    nics: Mutex<HashMap<MacAddr, Tracked<NicHandle, Uuid>>>,
    networks: Mutex<HashMap<Uuid, Tracked<NetworkHandle, MacAddr>>>,
    aggregations: Mutex<HashMap<String, Tracked<AggrHandle, Uuid>>>,
    instances: Mutex<HashMap<Uuid, InstanceHandle>>,
    node: Mutex<Option<NodeHandle>>,
}

struct AgentInner {
    config: Config,
    cn_uuid: Uuid,
    napi: NapiClient,
    vmadm: Arc<dyn VmManager>,
    registry: Registry,
    history: Mutex<Vec<InitRecord>>,
    started: Instant,
    watcher: Mutex<Option<UnboundedSender<WatcherSignal>>>,
    stop_tx: watch::Sender<bool>,
    generation: AtomicU64,
}

/// Shared handle to the agent: configuration, clients, and the registry
/// that owns every per-entity reconciler. Reconcilers hold clones.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(config: Config, cn_uuid: Uuid, napi: NapiClient, vmadm: Arc<dyn VmManager>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(AgentInner {
                config,
                cn_uuid,
                napi,
                vmadm,
                registry: Registry::default(),
                history: Mutex::new(Vec::new()),
                started: Instant::now(),
                watcher: Mutex::new(None),
                stop_tx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cn_uuid(&self) -> Uuid {
        self.inner.cn_uuid
    }

    pub fn admin_uuid(&self) -> Uuid {
        self.inner.config.admin_uuid
    }

    pub fn napi(&self) -> &NapiClient {
        &self.inner.napi
    }

    pub fn vmadm(&self) -> &dyn VmManager {
        self.inner.vmadm.as_ref()
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Memoize-or-create the NIC reconciler for `mac` and record the
    /// referencer. While a MAC is locally present exactly one reconciler
    /// exists for it.
    pub fn watch_nic(&self, mac: MacAddr, referencer: Uuid) -> NicHandle {
        let mut nics = self.inner.registry.nics.lock().unwrap();
        match nics.get_mut(&mac) {
            Some(entry) if !entry.handle.is_stopped() => {
                entry.refs.insert(referencer);
                entry.handle.clone()
            }
            _ => {
                let handle = nics::spawn(self.clone(), mac, self.next_generation());
                nics.insert(
                    mac,
                    Tracked {
                        handle: handle.clone(),
                        refs: HashSet::from([referencer]),
                    },
                );
                handle
            }
        }
    }

    /// Drop one referencer. The last one out schedules the NIC's removal
    /// from NetAPI.
    pub fn release_nic(&self, mac: MacAddr, referencer: Uuid) {
        let mut nics = self.inner.registry.nics.lock().unwrap();
        if let Some(entry) = nics.get_mut(&mac) {
            entry.refs.remove(&referencer);
            if entry.refs.is_empty() {
                entry.handle.release_from(referencer);
            }
        }
    }

    pub fn nic(&self, mac: MacAddr) -> Option<NicHandle> {
        let nics = self.inner.registry.nics.lock().unwrap();
        nics.get(&mac).map(|entry| entry.handle.clone())
    }

    /// Called by a stopped NIC reconciler to remove itself. Generation
    /// guards against forgetting a newer incarnation under the same MAC.
    pub fn forget_nic(&self, mac: MacAddr, generation: u64) {
        let mut nics = self.inner.registry.nics.lock().unwrap();
        if let Some(entry) = nics.get(&mac) {
            if entry.handle.generation == generation {
                nics.remove(&mac);
            }
        }
    }

    /// Subscribe a NIC to a network, creating the network reconciler on
    /// first reference.
    pub fn watch_network(&self, uuid: Uuid, mac: MacAddr) -> NetworkHandle {
        let mut networks = self.inner.registry.networks.lock().unwrap();
        let needs_new = match networks.get(&uuid) {
            Some(entry) => entry.handle.is_closed(),
            None => true,
        };
        if needs_new {
            let handle = networks::spawn(self.clone(), uuid, self.next_generation());
            networks.insert(
                uuid,
                Tracked {
                    handle,
                    refs: HashSet::new(),
                },
            );
        }
        let entry = networks.get_mut(&uuid).expect("just ensured");
        entry.refs.insert(mac);
        entry.handle.subscribe(mac);
        entry.handle.clone()
    }

    pub fn release_network(&self, uuid: Uuid, mac: MacAddr) {
        let mut networks = self.inner.registry.networks.lock().unwrap();
        if let Some(entry) = networks.get_mut(&uuid) {
            entry.refs.remove(&mac);
            entry.handle.unsubscribe(mac);
            if entry.refs.is_empty() {
                entry.handle.stop();
            }
        }
    }

    pub fn network(&self, uuid: Uuid) -> Option<NetworkHandle> {
        let networks = self.inner.registry.networks.lock().unwrap();
        networks.get(&uuid).map(|entry| entry.handle.clone())
    }

    /// Called by a stopped network reconciler to remove itself. Generation
    /// guards against forgetting a newer incarnation under the same uuid.
    pub fn forget_network(&self, uuid: Uuid, generation: u64) {
        let mut networks = self.inner.registry.networks.lock().unwrap();
        if let Some(entry) = networks.get(&uuid) {
            if entry.handle.generation == generation {
                networks.remove(&uuid);
            }
        }
    }

    pub fn watch_aggregation(&self, id: &str, referencer: Uuid) -> AggrHandle {
        let mut aggrs = self.inner.registry.aggregations.lock().unwrap();
        match aggrs.get_mut(id) {
            Some(entry) if !entry.handle.is_stopped() => {
                entry.refs.insert(referencer);
                entry.handle.clone()
            }
            _ => {
                let handle = aggrs::spawn(self.clone(), id.to_string(), self.next_generation());
                aggrs.insert(
                    id.to_string(),
                    Tracked {
                        handle: handle.clone(),
                        refs: HashSet::from([referencer]),
                    },
                );
                handle
            }
        }
    }

    pub fn release_aggregation(&self, id: &str, referencer: Uuid) {
        let mut aggrs = self.inner.registry.aggregations.lock().unwrap();
        if let Some(entry) = aggrs.get_mut(id) {
            entry.refs.remove(&referencer);
            if entry.refs.is_empty() {
                entry.handle.release_from(referencer);
            }
        }
    }

    pub fn forget_aggregation(&self, id: &str, generation: u64) {
        let mut aggrs = self.inner.registry.aggregations.lock().unwrap();
        if let Some(entry) = aggrs.get(id) {
            if entry.handle.generation == generation {
                aggrs.remove(id);
            }
        }
    }

    pub fn instance(&self, uuid: Uuid) -> Option<InstanceHandle> {
        let instances = self.inner.registry.instances.lock().unwrap();
        instances.get(&uuid).cloned()
    }

    pub fn forget_instance(&self, uuid: Uuid) {
        self.inner.registry.instances.lock().unwrap().remove(&uuid);
    }

    pub fn node(&self) -> Option<NodeHandle> {
        self.inner.registry.node.lock().unwrap().clone()
    }

    /// Feed a full local VM listing: update or create an instance
    /// reconciler per inventoried VM, remove the ones that are gone.
    pub fn apply_vms(&self, vms: Vec<Vm>) {
        let mut instances = self.inner.registry.instances.lock().unwrap();
        let mut seen = HashSet::new();
        for vm in vms {
            if !vm.inventoried() {
                debug!(vm = %vm.uuid, state = %vm.state, "vm is not inventoried, skipping");
                continue;
            }
            seen.insert(vm.uuid);
            let handle = match instances.get(&vm.uuid) {
                Some(handle) if !handle.is_closed() => handle.clone(),
                _ => {
                    let handle = instances::spawn(self.clone(), vm.uuid);
                    instances.insert(vm.uuid, handle.clone());
                    handle
                }
            };
            handle.update(vm);
        }
        for (uuid, handle) in instances.iter() {
            if !seen.contains(uuid) {
                info!(vm = %uuid, "vm disappeared locally, removing its reconciler");
                handle.remove();
            }
        }
    }

    /// Agent-level refresh: ask the event source for fresh VM data.
    pub fn refresh(&self) {
        if let Some(tx) = self.inner.watcher.lock().unwrap().as_ref() {
            let _ = tx.send(WatcherSignal::Refresh);
        }
    }

    pub fn request_stop(&self) {
        let _ = self.inner.stop_tx.send(true);
    }

    fn stop_requested(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    fn record(&self, phase: AgentPhase) {
        let mut history = self.inner.history.lock().unwrap();
        history.push(InitRecord {
            state: format!("{phase:?}"),
            at_us: self.inner.started.elapsed().as_micros() as u64,
        });
    }

    /// Monotonic microseconds since agent boot plus the init history.
    pub fn status_snapshot(&self) -> (u64, Vec<InitRecord>) {
        let history = self.inner.history.lock().unwrap().clone();
        (self.inner.started.elapsed().as_micros() as u64, history)
    }

    /// Top-level lifecycle. Returns once the agent has fully stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut machine = Machine::new(AgentPhase::Waiting);
        self.record(AgentPhase::Waiting);
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let mut source = None;
        let mut watcher_task = None;

        loop {
            let phase = machine.state();
            if self.stop_requested()
                && !matches!(phase, AgentPhase::Stopping | AgentPhase::Stopped)
            {
                machine.advance(AgentPhase::Stopping)?;
                self.record(AgentPhase::Stopping);
                continue;
            }

            match phase {
                AgentPhase::Waiting => {
                    machine.advance(AgentPhase::Init)?;
                    self.record(AgentPhase::Init);
                }
                AgentPhase::Init => {
                    let node = node::spawn(self.clone(), node::DEFAULT_REFRESH_INTERVAL);
                    *self.inner.registry.node.lock().unwrap() = Some(node);
                    machine.advance(AgentPhase::InitDetermineEventSource)?;
                    self.record(AgentPhase::InitDetermineEventSource);
                }
                AgentPhase::InitDetermineEventSource => {
                    match watcher::determine_event_source(self).await {
                        Ok(found) => {
                            source = Some(found);
                            machine.advance(AgentPhase::InitStartWatcher)?;
                            self.record(AgentPhase::InitStartWatcher);
                        }
                        Err(err) => {
                            warn!(error = %err, "event source determination failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(PROBE_RETRY_DELAY) => {}
                                _ = stop_rx.changed() => {}
                            }
                        }
                    }
                }
                AgentPhase::InitStartWatcher => {
                    let chosen = source.take().expect("event source was determined");
                    let (tx, task) = watcher::start(self.clone(), chosen);
                    *self.inner.watcher.lock().unwrap() = Some(tx);
                    watcher_task = Some(task);
                    machine.advance(AgentPhase::Running)?;
                    self.record(AgentPhase::Running);
                    info!("agent running");
                }
                AgentPhase::Running => {
                    let task = watcher_task.as_mut().expect("watcher was started");
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        exit = task => {
                            watcher_task = None;
                            *self.inner.watcher.lock().unwrap() = None;
                            if !self.stop_requested() {
                                warn!(?exit, "event source ended, re-probing");
                                tokio::time::sleep(PROBE_RETRY_DELAY).await;
                                machine.advance(AgentPhase::InitDetermineEventSource)?;
                                self.record(AgentPhase::InitDetermineEventSource);
                            }
                        }
                    }
                }
                AgentPhase::Stopping => {
                    self.shutdown();
                    machine.advance(AgentPhase::Stopped)?;
                    self.record(AgentPhase::Stopped);
                }
                AgentPhase::Stopped => {
                    info!("agent stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Tell everything to stop. Reconcilers finish their current state
    /// action, then transition to stopped.
    fn shutdown(&self) {
        if let Some(tx) = self.inner.watcher.lock().unwrap().take() {
            let _ = tx.send(WatcherSignal::Stop);
        }
        if let Some(node) = self.inner.registry.node.lock().unwrap().take() {
            node.stop();
        }
        for handle in self.inner.registry.instances.lock().unwrap().values() {
            handle.stop();
        }
        for entry in self.inner.registry.nics.lock().unwrap().values() {
            entry.handle.stop();
        }
        for entry in self.inner.registry.networks.lock().unwrap().values() {
            entry.handle.stop();
        }
        for entry in self.inner.registry.aggregations.lock().unwrap().values() {
            entry.handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_agent, wait_until};

    #[tokio::test]
    async fn lifecycle_is_recorded_and_stop_is_honored() {
        // No vmadm binary: event source determination keeps retrying, the
        // history shows how far init got, and stop still wins.
        let (agent, _vmadm, _cn) = test_agent("http://127.0.0.1:1");

        let runner = agent.clone();
        let run = tokio::spawn(async move { runner.run().await });

        wait_until("agent reached event source determination", || {
            let (_, history) = agent.status_snapshot();
            history
                .iter()
                .any(|r| r.state == "InitDetermineEventSource")
        })
        .await;

        agent.request_stop();
        run.await.unwrap().unwrap();

        let (now, history) = agent.status_snapshot();
        assert!(now > 0);
        assert_eq!(history.last().unwrap().state, "Stopped");
        let states: Vec<&str> = history.iter().map(|r| r.state.as_str()).collect();
        assert!(states.starts_with(&["Waiting", "Init", "InitDetermineEventSource"]));
    }

    #[test]
    fn transition_table_matches_the_design() {
        use AgentPhase::*;
        assert_eq!(Waiting.successors(), &[Init, Stopping]);
        assert_eq!(Init.successors(), &[InitDetermineEventSource, Stopping]);
        assert_eq!(
            InitDetermineEventSource.successors(),
            &[InitStartWatcher, Stopping]
        );
        assert_eq!(InitStartWatcher.successors(), &[Running, Stopping]);
        assert_eq!(Running.successors(), &[InitDetermineEventSource, Stopping]);
        assert_eq!(Stopping.successors(), &[Stopped]);
        assert!(Stopped.successors().is_empty());
    }
}
