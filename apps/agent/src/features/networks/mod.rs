use std::collections::HashSet;
use std::time::Duration;

use netsync_types::{MacAddr, Network};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::core::machine::{Machine, Phase, TransitionFault, RETRY_DELAY};
use crate::core::napi::Fetched;

const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPhase {
    Init,
    Refresh,
    Waiting,
    Stopped,
}

impl Phase for NetworkPhase {
    fn successors(self) -> &'static [Self] {
        use NetworkPhase::*;
        match self {
            Init => &[Refresh, Stopped],
            Refresh => &[Waiting, Stopped],
            Waiting => &[Refresh, Stopped],
            Stopped => &[],
        }
    }
}

pub enum NetworkMsg {
    Refresh,
    Subscribe(MacAddr),
    Unsubscribe(MacAddr),
    Stop,
}

#[derive(Clone)]
pub struct NetworkHandle {
    pub uuid: Uuid,
    pub generation: u64,
    tx: UnboundedSender<NetworkMsg>,
}

impl NetworkHandle {
    pub fn refresh(&self) {
        let _ = self.tx.send(NetworkMsg::Refresh);
    }

    pub fn subscribe(&self, mac: MacAddr) {
        let _ = self.tx.send(NetworkMsg::Subscribe(mac));
    }

    pub fn unsubscribe(&self, mac: MacAddr) {
        let _ = self.tx.send(NetworkMsg::Unsubscribe(mac));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(NetworkMsg::Stop);
    }

    /// True once the reconciler task has fully exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn spawn(agent: Agent, uuid: Uuid, generation: u64) -> NetworkHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = NetworkHandle {
        uuid,
        generation,
        tx,
    };

    tokio::spawn(async move {
        let mut r = NetworkReconciler {
            uuid,
            generation,
            agent,
            machine: Machine::new(NetworkPhase::Init),
            current: None,
            // Popular networks accumulate a listener per NIC; the set is
            // deliberately unbounded.
            listeners: HashSet::new(),
            refresh_wanted: false,
            stop_wanted: false,
            rx,
        };
        if let Err(fault) = r.run().await {
            error!(network = %uuid, %fault, "network reconciler halted");
        }
        r.teardown();
    });

    handle
}

struct NetworkReconciler {
    uuid: Uuid,
    generation: u64,
    agent: Agent,
    machine: Machine<NetworkPhase>,
    current: Option<Network>,
    listeners: HashSet<MacAddr>,
    refresh_wanted: bool,
    stop_wanted: bool,
    rx: UnboundedReceiver<NetworkMsg>,
}

impl NetworkReconciler {
    async fn run(&mut self) -> Result<(), TransitionFault> {
        loop {
            self.drain();

            let phase = self.machine.state();
            if self.stop_wanted && phase != NetworkPhase::Stopped {
                self.machine.advance(NetworkPhase::Stopped)?;
                continue;
            }

            match phase {
                NetworkPhase::Init => self.machine.advance(NetworkPhase::Refresh)?,
                NetworkPhase::Refresh => self.refresh_state().await?,
                NetworkPhase::Waiting => self.waiting_state().await?,
                NetworkPhase::Stopped => return Ok(()),
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.apply(msg);
        }
    }

    fn apply(&mut self, msg: NetworkMsg) {
        match msg {
            NetworkMsg::Refresh => self.refresh_wanted = true,
            NetworkMsg::Subscribe(mac) => {
                self.listeners.insert(mac);
            }
            NetworkMsg::Unsubscribe(mac) => {
                self.listeners.remove(&mac);
            }
            NetworkMsg::Stop => self.stop_wanted = true,
        }
    }

    async fn refresh_state(&mut self) -> Result<(), TransitionFault> {
        match self.agent.napi().get_network(self.uuid).await {
            Ok(Fetched::Found { body, .. }) => {
                let changed = match self.current.as_ref() {
                    Some(prev) => prev.changed_fields(&body),
                    None => Vec::new(),
                };
                self.current = Some(body);
                if !changed.is_empty() {
                    info!(
                        network = %self.uuid,
                        fields = ?changed,
                        listeners = self.listeners.len(),
                        "network changed, notifying nics"
                    );
                    metrics::counter!("netsync_network_changes", 1);
                    for mac in &self.listeners {
                        if let Some(nic) = self.agent.nic(*mac) {
                            nic.network_changed();
                        }
                    }
                }
                self.machine.advance(NetworkPhase::Waiting)
            }
            Ok(Fetched::Missing) => {
                // Gone for good in this incarnation; a NIC that still needs
                // it will cause a fresh reconciler to be created.
                warn!(network = %self.uuid, "network no longer exists in NetAPI");
                self.machine.advance(NetworkPhase::Stopped)
            }
            Err(err) => {
                warn!(network = %self.uuid, error = %err, "network refresh failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn waiting_state(&mut self) -> Result<(), TransitionFault> {
        if self.refresh_wanted {
            self.refresh_wanted = false;
            return self.machine.advance(NetworkPhase::Refresh);
        }

        tokio::select! {
            maybe = self.rx.recv() => match maybe {
                Some(msg) => self.apply(msg),
                None => self.stop_wanted = true,
            },
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                debug!(network = %self.uuid, "periodic network refresh");
                self.refresh_wanted = true;
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.agent.forget_network(self.uuid, self.generation);
        debug!(network = %self.uuid, "network reconciler stopped");
    }
}
