use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsync_types::Aggregation;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::core::debounce::Debouncer;
use crate::core::machine::{Machine, Phase, TransitionFault, RETRY_DELAY};
use crate::core::napi::{Deleted, Fetched};

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrPhase {
    Init,
    Refresh,
    Create,
    Update,
    Waiting,
    Release,
    ReleaseDelete,
    ReleaseRefresh,
    Stopped,
}

impl Phase for AggrPhase {
    fn successors(self) -> &'static [Self] {
        use AggrPhase::*;
        match self {
            Init => &[Refresh, Stopped],
            Refresh => &[Update, Create, Release, Stopped],
            Create => &[Waiting, Update, Release, Stopped],
            Update => &[Waiting, Refresh, Release, Stopped],
            Waiting => &[Update, Refresh, Release, Stopped],
            Release => &[ReleaseDelete, Stopped],
            ReleaseDelete => &[ReleaseRefresh, Stopped],
            ReleaseRefresh => &[ReleaseDelete, Stopped],
            Stopped => &[],
        }
    }
}

pub enum AggrMsg {
    SetLocal(Box<Aggregation>),
    Refresh { etag: Option<String> },
    ReleaseFrom(Uuid),
    Stop,
    Emit(&'static str),
}

#[derive(Default)]
pub struct AggrSnapshot {
    pub local: Option<Aggregation>,
    pub remote: Option<Aggregation>,
    pub etag: Option<String>,
    pub stopped: bool,
}

#[derive(Clone)]
pub struct AggrHandle {
    pub id: String,
    pub generation: u64,
    tx: UnboundedSender<AggrMsg>,
    shared: Arc<Mutex<AggrSnapshot>>,
}

impl AggrHandle {
    pub fn set_local(&self, aggr: Aggregation) {
        let _ = self.tx.send(AggrMsg::SetLocal(Box::new(aggr)));
    }

    pub fn refresh(&self, etag: Option<String>) {
        let _ = self.tx.send(AggrMsg::Refresh { etag });
    }

    pub fn release_from(&self, belongs_to_uuid: Uuid) {
        let _ = self.tx.send(AggrMsg::ReleaseFrom(belongs_to_uuid));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(AggrMsg::Stop);
    }

    pub fn remote(&self) -> Option<Aggregation> {
        self.shared.lock().unwrap().remote.clone()
    }

    pub fn etag(&self) -> Option<String> {
        self.shared.lock().unwrap().etag.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().unwrap().stopped
    }
}

pub fn spawn(agent: Agent, id: String, generation: u64) -> AggrHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(AggrSnapshot::default()));
    let handle = AggrHandle {
        id: id.clone(),
        generation,
        tx: tx.clone(),
        shared: Arc::clone(&shared),
    };

    tokio::spawn(async move {
        let mut r = AggrReconciler {
            id,
            generation,
            agent,
            machine: Machine::new(AggrPhase::Init),
            shared,
            local: None,
            remote: None,
            etag: None,
            released: None,
            sig: Signals::default(),
            debounce: Debouncer::new(tx),
            rx,
        };
        if let Err(fault) = r.run().await {
            error!(aggregation = %r.id, %fault, "aggregation reconciler halted");
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

struct AggrReconciler {
    id: String,
    generation: u64,
    agent: Agent,
    machine: Machine<AggrPhase>,
    shared: Arc<Mutex<AggrSnapshot>>,
    local: Option<Aggregation>,
    remote: Option<Aggregation>,
    etag: Option<String>,
    released: Option<Uuid>,
    sig: Signals,
    debounce: Debouncer<AggrMsg>,
    rx: UnboundedReceiver<AggrMsg>,
}

impl AggrReconciler {
    async fn run(&mut self) -> Result<(), TransitionFault> {
        loop {
            self.drain();

            let phase = self.machine.state();
            if self.sig.stop && phase != AggrPhase::Stopped {
                self.machine.advance(AggrPhase::Stopped)?;
                continue;
            }
            if self.sig.release
                && matches!(
                    phase,
                    AggrPhase::Refresh | AggrPhase::Update | AggrPhase::Waiting
                )
            {
                self.sig.release = false;
                self.machine.advance(AggrPhase::Release)?;
                continue;
            }

            match phase {
                AggrPhase::Init => self.machine.advance(AggrPhase::Refresh)?,
                AggrPhase::Refresh => self.refresh_state().await?,
                AggrPhase::Create => self.create_state().await?,
                AggrPhase::Update => self.update_state()?,
                AggrPhase::Waiting => self.waiting_state().await?,
                AggrPhase::Release => self.machine.advance(AggrPhase::ReleaseDelete)?,
                AggrPhase::ReleaseDelete => self.release_delete_state().await?,
                AggrPhase::ReleaseRefresh => self.release_refresh_state().await?,
                AggrPhase::Stopped => return Ok(()),
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.apply(msg);
        }
    }

    fn apply(&mut self, msg: AggrMsg) {
        match msg {
            AggrMsg::SetLocal(aggr) => {
                self.local = Some(*aggr);
                self.sync_shared();
                self.debounce
                    .emit_delayed("set", Duration::ZERO, AggrMsg::Emit("set"));
            }
            AggrMsg::Emit("set") => self.sig.update = true,
            AggrMsg::Emit(channel) => debug!(aggregation = %self.id, channel, "stray emit"),
            AggrMsg::Refresh { etag } => {
                if etag.is_some() && etag == self.etag {
                    debug!(aggregation = %self.id, "refresh for our own etag, ignoring");
                } else {
                    self.sig.refresh = true;
                }
            }
            AggrMsg::ReleaseFrom(uuid) => {
                self.released = Some(uuid);
                self.sig.release = true;
            }
            AggrMsg::Stop => self.sig.stop = true,
        }
    }

    async fn refresh_state(&mut self) -> Result<(), TransitionFault> {
        match self.agent.napi().get_aggregation(&self.id).await {
            Ok(Fetched::Found { body, etag }) => {
                self.set_remote(body, etag);
                self.machine.advance(AggrPhase::Update)
            }
            Ok(Fetched::Missing) => self.machine.advance(AggrPhase::Create),
            Err(err) => {
                warn!(aggregation = %self.id, error = %err, "aggregation refresh failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn create_state(&mut self) -> Result<(), TransitionFault> {
        let Some(local) = self.local.clone() else {
            return self.machine.advance(AggrPhase::Waiting);
        };

        match self.agent.napi().create_aggregation(&local).await {
            Ok((aggr, etag)) => {
                metrics::counter!("netsync_aggr_creates", 1);
                info!(aggregation = %self.id, "aggregation registered in NetAPI");
                self.set_remote(aggr, etag);
                self.drain();
                if self.sig.release {
                    self.sig.release = false;
                    self.machine.advance(AggrPhase::Release)
                } else {
                    self.machine.advance(AggrPhase::Update)
                }
            }
            Err(err) => {
                warn!(aggregation = %self.id, error = %err, "aggregation create failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    /// There are no remote-authoritative aggregation fields yet, and the
    /// node reconciler does not mutate aggregations; drift is only logged.
    fn update_state(&mut self) -> Result<(), TransitionFault> {
        // A `set` can land while NetAPI has not answered yet; fetch first
        // so create-if-missing gets its chance.
        if self.local.is_some() && self.remote.is_none() {
            return self.machine.advance(AggrPhase::Refresh);
        }
        if let (Some(local), Some(remote)) = (self.local.as_ref(), self.remote.as_ref()) {
            if local.macs != remote.macs || local.lacp_mode != remote.lacp_mode {
                debug!(
                    aggregation = %self.id,
                    "aggregation differs from NetAPI; mutation is unsupported"
                );
            }
        }
        self.machine.advance(AggrPhase::Waiting)
    }

    async fn release_delete_state(&mut self) -> Result<(), TransitionFault> {
        let skip = match self.remote.as_ref() {
            None => Some("never seen in NetAPI"),
            Some(remote) => {
                if self.released != remote.belongs_to_uuid {
                    Some("owned by someone else now")
                } else if self.etag.is_none() {
                    Some("no etag held")
                } else {
                    None
                }
            }
        };
        if let Some(reason) = skip {
            debug!(aggregation = %self.id, reason, "skipping NetAPI delete");
            return self.machine.advance(AggrPhase::Stopped);
        }

        let etag = self.etag.clone().expect("guard checked the etag");
        match self.agent.napi().delete_aggregation(&self.id, &etag).await {
            Ok(Deleted::Done) => {
                metrics::counter!("netsync_aggr_deletes", 1);
                info!(aggregation = %self.id, "aggregation deleted from NetAPI");
                self.machine.advance(AggrPhase::Stopped)
            }
            Ok(Deleted::Missing) => self.machine.advance(AggrPhase::Stopped),
            Ok(Deleted::Conflict) => {
                debug!(aggregation = %self.id, "delete hit a stale etag, refreshing");
                self.machine.advance(AggrPhase::ReleaseRefresh)
            }
            Err(err) => {
                warn!(aggregation = %self.id, error = %err, "aggregation delete failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn release_refresh_state(&mut self) -> Result<(), TransitionFault> {
        match self.agent.napi().get_aggregation(&self.id).await {
            Ok(Fetched::Found { body, etag }) => {
                self.set_remote(body, etag);
                self.machine.advance(AggrPhase::ReleaseDelete)
            }
            Ok(Fetched::Missing) => self.machine.advance(AggrPhase::Stopped),
            Err(err) => {
                warn!(aggregation = %self.id, error = %err, "release refresh failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    async fn waiting_state(&mut self) -> Result<(), TransitionFault> {
        if self.sig.refresh {
            self.sig.refresh = false;
            return self.machine.advance(AggrPhase::Refresh);
        }
        if self.sig.update {
            self.sig.update = false;
            return self.machine.advance(AggrPhase::Update);
        }

        tokio::select! {
            maybe = self.rx.recv() => match maybe {
                Some(msg) => self.apply(msg),
                None => self.sig.stop = true,
            },
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                debug!(aggregation = %self.id, "periodic aggregation refresh");
                self.sig.refresh = true;
            }
        }
        Ok(())
    }

    fn set_remote(&mut self, aggr: Aggregation, etag: Option<String>) {
        self.remote = Some(aggr);
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

    fn teardown(&mut self) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.local = None;
            shared.remote = None;
            shared.etag = None;
            shared.stopped = true;
        }
        self.agent.forget_aggregation(&self.id, self.generation);
        debug!(aggregation = %self.id, "aggregation reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_agent, wait_until};
    use netsync_types::aggregation_id;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn aggregation_is_registered_then_released() {
        let server = MockServer::start().await;
        let (agent, _vmadm, cn) = test_agent(&server.uri());
        let id = aggregation_id(&cn, "aggr0");

        let local = Aggregation {
            id: Some(id.clone()),
            name: "aggr0".into(),
            belongs_to_uuid: Some(cn),
            lacp_mode: Some("active".into()),
            macs: vec![
                "00:50:56:34:60:4c".parse().unwrap(),
                "00:50:56:34:60:4d".parse().unwrap(),
            ],
            nic_tags_provided: vec!["storage".into()],
        };

        Mock::given(method("GET"))
            .and(path(format!("/aggregations/{id}")))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/aggregations"))
            .and(body_partial_json(serde_json::json!({
                "name": "aggr0",
                "belongs_to_uuid": cn,
                "check_owner": false,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Etag", "v1")
                    .set_body_json(serde_json::to_value(&local).unwrap()),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/aggregations/{id}")))
            .and(header("If-Match", "v1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let handle = agent.watch_aggregation(&id, cn);
        handle.set_local(local);
        wait_until("aggregation registered", || {
            handle.etag().as_deref() == Some("v1")
        })
        .await;

        agent.release_aggregation(&id, cn);
        wait_until("aggregation stopped", || handle.is_stopped()).await;
    }

    #[test]
    fn transition_table_matches_the_design() {
        use AggrPhase::*;
        assert_eq!(Init.successors(), &[Refresh, Stopped]);
        assert_eq!(Refresh.successors(), &[Update, Create, Release, Stopped]);
        assert_eq!(Create.successors(), &[Waiting, Update, Release, Stopped]);
        assert_eq!(Update.successors(), &[Waiting, Refresh, Release, Stopped]);
        assert_eq!(Waiting.successors(), &[Update, Refresh, Release, Stopped]);
        assert_eq!(Release.successors(), &[ReleaseDelete, Stopped]);
        assert_eq!(ReleaseDelete.successors(), &[ReleaseRefresh, Stopped]);
        assert_eq!(ReleaseRefresh.successors(), &[ReleaseDelete, Stopped]);
        assert!(Stopped.successors().is_empty());
    }
}
