use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;

use netsync_types::{aggregation_id, Aggregation, MacAddr, Nic, NicOwnerType, NicPatch, NicState};
use regex::Regex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::core::machine::{Machine, Phase, TransitionFault, RETRY_DELAY};
use crate::core::sysinfo::{self, NodeInfo};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Init,
    Refresh,
    Update,
    Waiting,
    Stopped,
}

impl Phase for NodePhase {
    fn successors(self) -> &'static [Self] {
        use NodePhase::*;
        match self {
            Init => &[Refresh, Stopped],
            Refresh => &[Update, Stopped],
            Update => &[Waiting, Stopped],
            Waiting => &[Refresh, Stopped],
            Stopped => &[],
        }
    }
}

pub enum NodeMsg {
    Refresh,
    Stop,
}

#[derive(Clone)]
pub struct NodeHandle {
    pub cn_uuid: Uuid,
    tx: UnboundedSender<NodeMsg>,
}

impl NodeHandle {
    pub fn refresh(&self) {
        let _ = self.tx.send(NodeMsg::Refresh);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(NodeMsg::Stop);
    }

    /// Server NICs surface remote-authoritative changes here, but the
    /// node's own interfaces are not mutated through this agent.
    pub fn update_nic(&self, mac: MacAddr, patch: &NicPatch) {
        info!(
            mac = %mac,
            ?patch,
            "local interface mutation is not supported, leaving as-is"
        );
    }

    pub fn remove_nic(&self, mac: MacAddr) {
        info!(mac = %mac, "detaching server nic projection");
        self.refresh();
    }
}

pub fn spawn(agent: Agent, interval: Duration) -> NodeHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cn_uuid = agent.cn_uuid();
    let handle = NodeHandle { cn_uuid, tx };

    tokio::spawn(async move {
        let mut r = NodeReconciler {
            agent,
            machine: Machine::new(NodePhase::Init),
            info: None,
            nic_macs: HashSet::new(),
            aggr_ids: HashSet::new(),
            interval,
            refresh_wanted: false,
            stop_wanted: false,
            rx,
        };
        if let Err(fault) = r.run().await {
            error!(%fault, "node reconciler halted");
        }
        debug!("node reconciler stopped");
    });

    handle
}

struct NodeReconciler {
    agent: Agent,
    machine: Machine<NodePhase>,
    info: Option<NodeInfo>,
    nic_macs: HashSet<MacAddr>,
    aggr_ids: HashSet<String>,
    interval: Duration,
    refresh_wanted: bool,
    stop_wanted: bool,
    rx: UnboundedReceiver<NodeMsg>,
}

impl NodeReconciler {
    async fn run(&mut self) -> Result<(), TransitionFault> {
        loop {
            self.drain();

            let phase = self.machine.state();
            if self.stop_wanted && phase != NodePhase::Stopped {
                self.machine.advance(NodePhase::Stopped)?;
                continue;
            }

            match phase {
                NodePhase::Init => self.machine.advance(NodePhase::Refresh)?,
                NodePhase::Refresh => self.refresh_state().await?,
                NodePhase::Update => self.update_state()?,
                NodePhase::Waiting => self.waiting_state().await?,
                NodePhase::Stopped => return Ok(()),
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.apply(msg);
        }
    }

    fn apply(&mut self, msg: NodeMsg) {
        match msg {
            NodeMsg::Refresh => self.refresh_wanted = true,
            NodeMsg::Stop => self.stop_wanted = true,
        }
    }

    async fn refresh_state(&mut self) -> Result<(), TransitionFault> {
        match sysinfo::load(&self.agent.config().sysinfo_path).await {
            Ok(info) => {
                self.info = Some(info);
                self.machine.advance(NodePhase::Update)
            }
            Err(err) => {
                warn!(error = %err, "sysinfo load failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                Ok(())
            }
        }
    }

    /// Project the node's interfaces into NIC and aggregation reconcilers
    /// and release whatever disappeared since the previous pass.
    fn update_state(&mut self) -> Result<(), TransitionFault> {
        let info = self.info.as_ref().expect("update entered with node info");
        let cn_uuid = self.agent.cn_uuid();
        let projection = project(
            info,
            cn_uuid,
            self.agent.admin_uuid(),
            &self.agent.config().admin_nic_tag,
        );

        let mut seen_macs = HashSet::new();
        for nic in projection.nics {
            let mac = nic.mac.expect("projected nics carry a mac");
            seen_macs.insert(mac);
            self.agent.watch_nic(mac, cn_uuid).set_local(nic);
        }
        for mac in self.nic_macs.difference(&seen_macs) {
            info!(mac = %mac, "interface disappeared from the node, releasing");
            self.agent.release_nic(*mac, cn_uuid);
        }
        self.nic_macs = seen_macs;

        let mut seen_aggrs = HashSet::new();
        for aggr in projection.aggregations {
            let id = aggr.id.clone().expect("projected aggregations carry an id");
            seen_aggrs.insert(id.clone());
            self.agent.watch_aggregation(&id, cn_uuid).set_local(aggr);
        }
        for id in self.aggr_ids.difference(&seen_aggrs) {
            info!(aggregation = %id, "aggregation disappeared from the node, releasing");
            self.agent.release_aggregation(id, cn_uuid);
        }
        self.aggr_ids = seen_aggrs;

        self.machine.advance(NodePhase::Waiting)
    }

    async fn waiting_state(&mut self) -> Result<(), TransitionFault> {
        if self.refresh_wanted {
            self.refresh_wanted = false;
            return self.machine.advance(NodePhase::Refresh);
        }

        tokio::select! {
            maybe = self.rx.recv() => match maybe {
                Some(msg) => self.apply(msg),
                None => self.stop_wanted = true,
            },
            _ = tokio::time::sleep(self.interval) => {
                debug!("periodic node refresh");
                self.refresh_wanted = true;
            }
        }
        Ok(())
    }
}

pub struct NodeProjection {
    pub nics: Vec<Nic>,
    pub aggregations: Vec<Aggregation>,
}

/// Interface names like `external0` resolve to the tag `external`.
fn vnic_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^([a-zA-Z0-9_]{0,31})[0-9]+$").expect("valid pattern"))
}

/// Project sysinfo into the NIC and aggregation views this node asserts.
pub fn project(info: &NodeInfo, cn_uuid: Uuid, admin_uuid: Uuid, fallback_admin_tag: &str) -> NodeProjection {
    let admin_tag = info
        .admin_nic_tag
        .as_deref()
        .unwrap_or(fallback_admin_tag);

    // tag -> physical interface carrying it
    let mut tag_map: BTreeMap<&str, &str> = BTreeMap::new();
    for (iface, phys) in &info.network_interfaces {
        for tag in &phys.nic_names {
            tag_map.insert(tag, iface);
        }
    }

    let mut nics = Vec::new();
    for phys in info.network_interfaces.values() {
        let mut nic = server_nic(phys.mac, cn_uuid, admin_uuid);
        nic.ip = phys.ip4addr.clone().filter(|ip| !ip.is_empty());
        if phys.nic_names.iter().any(|tag| tag == admin_tag) {
            nic.nic_tag = Some(admin_tag.to_string());
            nic.vlan_id = Some(0);
        }
        nics.push(nic);
    }

    for (name, vnic) in &info.virtual_interfaces {
        let mut nic = server_nic(vnic.mac, cn_uuid, admin_uuid);
        nic.ip = vnic.ip4addr.clone().filter(|ip| !ip.is_empty());
        if let Some(tag) = vnic_tag(name, vnic.host_interface.as_deref(), &tag_map) {
            nic.nic_tag = Some(tag.to_string());
            nic.vlan_id = vnic.vlan.or(Some(0));
        }
        nics.push(nic);
    }

    let mut aggregations = Vec::new();
    for (name, la) in &info.link_aggregations {
        let macs = la
            .interfaces
            .iter()
            .filter_map(|iface| info.network_interfaces.get(iface).map(|p| p.mac))
            .collect();
        // The aggregation shows up as a pseudo-interface too; its NIC
        // Names are the tags the aggregation provides.
        let nic_tags_provided = info
            .network_interfaces
            .get(name)
            .map(|p| p.nic_names.clone())
            .unwrap_or_default();
        aggregations.push(Aggregation {
            id: Some(aggregation_id(&cn_uuid, name)),
            name: name.clone(),
            belongs_to_uuid: Some(cn_uuid),
            lacp_mode: la.lacp_mode.clone(),
            macs,
            nic_tags_provided,
        });
    }

    NodeProjection { nics, aggregations }
}

fn server_nic(mac: MacAddr, cn_uuid: Uuid, admin_uuid: Uuid) -> Nic {
    Nic {
        mac: Some(mac),
        belongs_to_type: Some(NicOwnerType::Server),
        belongs_to_uuid: Some(cn_uuid),
        owner_uuid: Some(admin_uuid),
        state: Some(NicState::Running),
        cn_uuid: Some(cn_uuid),
        ..Default::default()
    }
}

/// Resolve a virtual NIC's tag from its name. The tag only sticks when
/// the tag's physical interface matches the vnic's host interface; a
/// mismatch means the operator bypassed the management tooling.
fn vnic_tag<'a>(
    name: &'a str,
    host_interface: Option<&str>,
    tag_map: &BTreeMap<&str, &str>,
) -> Option<&'a str> {
    let caps = vnic_name_pattern().captures(name)?;
    let tag = caps.get(1)?.as_str();
    match (tag_map.get(tag), host_interface) {
        (Some(phys), Some(host)) if *phys == host => Some(tag),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "UUID": "564d4d2c-f7c9-f4e5-42d4-55d6a3a1de0f",
        "Admin NIC Tag": "admin",
        "Network Interfaces": {
            "e1000g0": {
                "MAC Address": "00:50:56:34:60:4c",
                "ip4addr": "172.26.7.11",
                "Link Status": "up",
                "NIC Names": ["external", "admin"]
            },
            "e1000g1": {
                "MAC Address": "00:50:56:34:60:4d",
                "ip4addr": "",
                "Link Status": "up",
                "NIC Names": []
            },
            "aggr0": {
                "MAC Address": "00:50:56:34:60:4e",
                "ip4addr": "",
                "Link Status": "up",
                "NIC Names": ["storage"]
            }
        },
        "Virtual Network Interfaces": {
            "external0": {
                "MAC Address": "90:b8:d0:04:03:f1",
                "ip4addr": "172.26.7.21",
                "Host Interface": "e1000g0",
                "VLAN": 0
            },
            "external1": {
                "MAC Address": "90:b8:d0:04:03:f2",
                "ip4addr": "",
                "Host Interface": "e1000g1",
                "VLAN": 0
            }
        },
        "Link Aggregations": {
            "aggr0": {
                "LACP mode": "active",
                "Interfaces": ["e1000g0", "e1000g1"]
            }
        }
    }"#;

    fn ids() -> (Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    fn find<'a>(nics: &'a [Nic], mac: &str) -> &'a Nic {
        let mac: MacAddr = mac.parse().unwrap();
        nics.iter().find(|n| n.mac == Some(mac)).unwrap()
    }

    #[test]
    fn projects_server_identity_onto_every_interface() {
        let (cn, admin) = ids();
        let info = sysinfo::parse(SAMPLE).unwrap();
        let projection = project(&info, cn, admin, "admin");
        assert_eq!(projection.nics.len(), 5);
        for nic in &projection.nics {
            assert_eq!(nic.belongs_to_type, Some(NicOwnerType::Server));
            assert_eq!(nic.belongs_to_uuid, Some(cn));
            assert_eq!(nic.owner_uuid, Some(admin));
            assert_eq!(nic.cn_uuid, Some(cn));
            assert_eq!(nic.state, Some(NicState::Running));
        }
    }

    #[test]
    fn admin_heuristic_tags_the_admin_interface() {
        let (cn, admin) = ids();
        let info = sysinfo::parse(SAMPLE).unwrap();
        let projection = project(&info, cn, admin, "admin");

        let admin_nic = find(&projection.nics, "00:50:56:34:60:4c");
        assert_eq!(admin_nic.nic_tag.as_deref(), Some("admin"));
        assert_eq!(admin_nic.vlan_id, Some(0));
        assert_eq!(admin_nic.ip.as_deref(), Some("172.26.7.11"));

        let plain = find(&projection.nics, "00:50:56:34:60:4d");
        assert!(plain.nic_tag.is_none());
        assert!(plain.ip.is_none());
    }

    #[test]
    fn vnic_tag_requires_matching_host_interface() {
        let (cn, admin) = ids();
        let info = sysinfo::parse(SAMPLE).unwrap();
        let projection = project(&info, cn, admin, "admin");

        // external -> e1000g0 and the vnic rides e1000g0: tag sticks.
        let good = find(&projection.nics, "90:b8:d0:04:03:f1");
        assert_eq!(good.nic_tag.as_deref(), Some("external"));

        // Same prefix but on e1000g1: operator bypassed tooling, no tag.
        let bypassed = find(&projection.nics, "90:b8:d0:04:03:f2");
        assert!(bypassed.nic_tag.is_none());
    }

    #[test]
    fn vnic_name_parsing_handles_edge_shapes() {
        let mut tag_map = BTreeMap::new();
        tag_map.insert("external", "e1000g0");
        assert_eq!(
            vnic_tag("external0", Some("e1000g0"), &tag_map),
            Some("external")
        );
        assert_eq!(vnic_tag("external0", Some("e1000g1"), &tag_map), None);
        assert_eq!(vnic_tag("no-digits", Some("e1000g0"), &tag_map), None);
        assert_eq!(vnic_tag("unknown7", Some("e1000g0"), &tag_map), None);
        assert_eq!(vnic_tag("external0", None, &tag_map), None);
    }

    #[test]
    fn aggregation_projection_resolves_members_and_tags() {
        let (cn, admin) = ids();
        let info = sysinfo::parse(SAMPLE).unwrap();
        let projection = project(&info, cn, admin, "admin");

        assert_eq!(projection.aggregations.len(), 1);
        let aggr = &projection.aggregations[0];
        assert_eq!(aggr.id.as_deref(), Some(format!("{cn}-aggr0").as_str()));
        assert_eq!(aggr.name, "aggr0");
        assert_eq!(aggr.lacp_mode.as_deref(), Some("active"));
        assert_eq!(aggr.belongs_to_uuid, Some(cn));
        assert_eq!(
            aggr.macs,
            vec![
                "00:50:56:34:60:4c".parse::<MacAddr>().unwrap(),
                "00:50:56:34:60:4d".parse().unwrap()
            ]
        );
        assert_eq!(aggr.nic_tags_provided, vec!["storage"]);
    }

    #[test]
    fn transition_table_matches_the_design() {
        use NodePhase::*;
        assert_eq!(Init.successors(), &[Refresh, Stopped]);
        assert_eq!(Refresh.successors(), &[Update, Stopped]);
        assert_eq!(Update.successors(), &[Waiting, Stopped]);
        assert_eq!(Waiting.successors(), &[Refresh, Stopped]);
        assert!(Stopped.successors().is_empty());
    }

    mod reconcile {
        use super::super::*;
        use crate::testutil::{test_agent_with, test_config, wait_until};
        use std::os::unix::fs::PermissionsExt;
        use wiremock::matchers::{header, method, path as url_path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        const TWO_NICS: &str = r#"{
            "UUID": "564d4d2c-f7c9-f4e5-42d4-55d6a3a1de0f",
            "Admin NIC Tag": "admin",
            "Network Interfaces": {
                "e1000g0": {
                    "MAC Address": "00:50:56:34:60:4c",
                    "ip4addr": "172.26.7.11",
                    "Link Status": "up",
                    "NIC Names": ["admin"]
                },
                "e1000g1": {
                    "MAC Address": "00:50:56:34:60:4d",
                    "ip4addr": "",
                    "Link Status": "up",
                    "NIC Names": []
                }
            }
        }"#;

        const ONE_NIC: &str = r#"{
            "UUID": "564d4d2c-f7c9-f4e5-42d4-55d6a3a1de0f",
            "Admin NIC Tag": "admin",
            "Network Interfaces": {
                "e1000g0": {
                    "MAC Address": "00:50:56:34:60:4c",
                    "ip4addr": "172.26.7.11",
                    "Link Status": "up",
                    "NIC Names": ["admin"]
                }
            }
        }"#;

        fn fake_sysinfo(dir: &std::path::Path, body: &str) -> (String, std::path::PathBuf) {
            let data = dir.join("sysinfo.json");
            std::fs::write(&data, body).unwrap();
            let script = dir.join("sysinfo");
            std::fs::write(&script, format!("#!/bin/sh\ncat {}\n", data.display())).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            (script.to_string_lossy().into_owned(), data)
        }

        #[tokio::test]
        async fn disappeared_interface_is_released_from_netapi() {
            let server = MockServer::start().await;
            let tmp = tempfile::tempdir().unwrap();
            let (script, data) = fake_sysinfo(tmp.path(), TWO_NICS);

            let mut config = test_config(&server.uri());
            config.sysinfo_path = script;
            let (agent, _vmadm, cn) = test_agent_with(config);

            let kept: MacAddr = "00:50:56:34:60:4c".parse().unwrap();
            let gone: MacAddr = "00:50:56:34:60:4d".parse().unwrap();
            for (mac, etag) in [(kept, "va"), (gone, "vb")] {
                let nic = server_nic(mac, cn, agent.admin_uuid());
                Mock::given(method("GET"))
                    .and(url_path(format!("/nics/{mac}")))
                    .respond_with(ResponseTemplate::new(404))
                    .up_to_n_times(1)
                    .mount(&server)
                    .await;
                Mock::given(method("POST"))
                    .and(url_path(format!("/nics/{mac}")))
                    .respond_with(
                        ResponseTemplate::new(200)
                            .insert_header("Etag", etag)
                            .set_body_json(serde_json::to_value(&nic).unwrap()),
                    )
                    .mount(&server)
                    .await;
            }
            Mock::given(method("DELETE"))
                .and(url_path(format!("/nics/{gone}")))
                .and(header("If-Match", "vb"))
                .respond_with(ResponseTemplate::new(204))
                .expect(1)
                .mount(&server)
                .await;

            let node = spawn(agent.clone(), DEFAULT_REFRESH_INTERVAL);
            wait_until("both nics registered", || {
                agent
                    .nic(kept)
                    .is_some_and(|h| h.etag().is_some())
                    && agent.nic(gone).is_some_and(|h| h.etag().is_some())
            })
            .await;

            std::fs::write(&data, ONE_NIC).unwrap();
            node.refresh();

            wait_until("vanished nic released", || agent.nic(gone).is_none()).await;
            assert!(agent.nic(kept).is_some());
            node.stop();
        }
    }
}
