pub mod boolish;
mod mac;

pub use mac::{MacAddr, MacParseError};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a NIC belongs to, as recorded in NetAPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicOwnerType {
    Zone,
    Server,
    Other,
    #[serde(other)]
    Unknown,
}

/// Operational state NetAPI tracks for a NIC. Transitional VM states
/// (provisioning, stopping, ...) all project to `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicState {
    Running,
    Stopped,
}

impl NicState {
    pub fn from_vm_state(state: &str) -> Self {
        if state == "running" {
            NicState::Running
        } else {
            NicState::Stopped
        }
    }
}

/// A NIC record as exchanged with NetAPI.
///
/// Field authority is split: `belongs_to_*`, `owner_uuid`, `primary`,
/// `state` and `cn_uuid` are decided by this node and pushed up; the
/// anti-spoofing toggles and the network-derived attributes are decided
/// by NetAPI and pulled down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nic {
    pub mac: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belongs_to_type: Option<NicOwnerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belongs_to_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<Uuid>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NicState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cn_uuid: Option<Uuid>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_dhcp_spoofing: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_ip_spoofing: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_mac_spoofing: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_restricted_traffic: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_unfiltered_promisc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolvers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<BTreeMap<String, String>>,
}

/// Partial NIC: output of a field diff, body of a NetAPI PUT, and entry
/// shape for a vmadm `update_nics` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belongs_to_type: Option<NicOwnerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belongs_to_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NicState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cn_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_dhcp_spoofing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_ip_spoofing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_mac_spoofing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_restricted_traffic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unfiltered_promisc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
}

impl NicPatch {
    pub fn is_empty(&self) -> bool {
        let NicPatch {
            mac,
            belongs_to_type,
            belongs_to_uuid,
            owner_uuid,
            primary,
            state,
            cn_uuid,
            allow_dhcp_spoofing,
            allow_ip_spoofing,
            allow_mac_spoofing,
            allow_restricted_traffic,
            allow_unfiltered_promisc,
            gateway,
            ip,
            model,
            mtu,
            netmask,
            network_uuid,
            nic_tag,
            vlan_id,
        } = self;
        mac.is_none()
            && belongs_to_type.is_none()
            && belongs_to_uuid.is_none()
            && owner_uuid.is_none()
            && primary.is_none()
            && state.is_none()
            && cn_uuid.is_none()
            && allow_dhcp_spoofing.is_none()
            && allow_ip_spoofing.is_none()
            && allow_mac_spoofing.is_none()
            && allow_restricted_traffic.is_none()
            && allow_unfiltered_promisc.is_none()
            && gateway.is_none()
            && ip.is_none()
            && model.is_none()
            && mtu.is_none()
            && netmask.is_none()
            && network_uuid.is_none()
            && nic_tag.is_none()
            && vlan_id.is_none()
    }
}

/// A logical network object from NetAPI. Watched because many NICs
/// inherit gateway/routes/resolvers from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_tag: Option<String>,
    #[serde(default)]
    pub resolvers: Vec<String>,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
}

impl Network {
    /// Names of the watched fields that differ between `self` and `other`.
    pub fn changed_fields(&self, other: &Network) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.gateway != other.gateway {
            changed.push("gateway");
        }
        if self.mtu != other.mtu {
            changed.push("mtu");
        }
        if self.netmask != other.netmask {
            changed.push("netmask");
        }
        if self.nic_tag != other.nic_tag {
            changed.push("nic_tag");
        }
        if self.resolvers != other.resolvers {
            changed.push("resolvers");
        }
        if self.routes != other.routes {
            changed.push("routes");
        }
        if self.vlan_id != other.vlan_id {
            changed.push("vlan_id");
        }
        changed
    }
}

/// A link aggregation on the node, keyed `"<node-uuid>-<name>"` in NetAPI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belongs_to_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lacp_mode: Option<String>,
    #[serde(default)]
    pub macs: Vec<MacAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nic_tags_provided: Vec<String>,
}

pub fn aggregation_id(node_uuid: &Uuid, name: &str) -> String {
    format!("{node_uuid}-{name}")
}

/// A NIC record as embedded in a VM object by the VM manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmNic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub mac: MacAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_dhcp_spoofing: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_ip_spoofing: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_mac_spoofing: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_restricted_traffic: Option<bool>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub allow_unfiltered_promisc: Option<bool>,
}

/// The slice of a VM object the agent observes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<Uuid>,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_state: Option<String>,
    #[serde(default)]
    pub nics: Vec<VmNic>,
    #[serde(default)]
    pub resolvers: Vec<String>,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "boolish::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub do_not_inventory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_metadata: Option<serde_json::Value>,
}

impl Vm {
    /// DNI and failed VMs are invisible to the inventory.
    pub fn inventoried(&self) -> bool {
        !boolish::truthy(self.do_not_inventory) && self.state != "failed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nic_spoof_fields_parse_tolerantly() {
        let nic: Nic = serde_json::from_str(
            r#"{
                "mac": "aa:bb:cc:11:22:33",
                "allow_ip_spoofing": "true",
                "allow_mac_spoofing": "0",
                "allow_dhcp_spoofing": 1,
                "primary": "false",
                "belongs_to_type": "zone",
                "state": "running"
            }"#,
        )
        .unwrap();
        assert_eq!(nic.allow_ip_spoofing, Some(true));
        assert_eq!(nic.allow_mac_spoofing, Some(false));
        assert_eq!(nic.allow_dhcp_spoofing, Some(true));
        assert_eq!(nic.primary, Some(false));
        assert_eq!(nic.belongs_to_type, Some(NicOwnerType::Zone));
        assert_eq!(nic.state, Some(NicState::Running));
    }

    #[test]
    fn unknown_owner_type_does_not_fail_parsing() {
        let nic: Nic =
            serde_json::from_str(r#"{"mac": "aa:bb:cc:11:22:33", "belongs_to_type": "router"}"#)
                .unwrap();
        assert_eq!(nic.belongs_to_type, Some(NicOwnerType::Unknown));
    }

    #[test]
    fn empty_patch_serializes_to_empty_object() {
        let patch = NicPatch::default();
        assert!(patch.is_empty());
        assert_eq!(serde_json::to_string(&patch).unwrap(), "{}");
    }

    #[test]
    fn network_diff_reports_watched_fields() {
        let a = Network {
            uuid: Uuid::new_v4(),
            gateway: Some("172.26.7.1".into()),
            mtu: Some(1500),
            resolvers: vec!["8.8.8.8".into()],
            ..Default::default()
        };
        let mut b = a.clone();
        b.gateway = Some("172.26.7.2".into());
        b.resolvers = vec!["8.8.4.4".into()];
        assert_eq!(a.changed_fields(&b), vec!["gateway", "resolvers"]);
        assert!(a.changed_fields(&a.clone()).is_empty());
    }

    #[test]
    fn vm_state_projection_coerces_transitional_states() {
        assert_eq!(NicState::from_vm_state("running"), NicState::Running);
        assert_eq!(NicState::from_vm_state("stopped"), NicState::Stopped);
        assert_eq!(NicState::from_vm_state("provisioning"), NicState::Stopped);
        assert_eq!(NicState::from_vm_state("stopping"), NicState::Stopped);
    }

    #[test]
    fn dni_vms_are_not_inventoried() {
        let mut vm = Vm {
            uuid: Uuid::new_v4(),
            state: "running".into(),
            ..Default::default()
        };
        assert!(vm.inventoried());
        vm.do_not_inventory = Some(true);
        assert!(!vm.inventoried());
        vm.do_not_inventory = None;
        vm.state = "failed".into();
        assert!(!vm.inventoried());
    }

    #[test]
    fn aggregation_id_format() {
        let node: Uuid = "564d4d2c-f7c9-f4e5-42d4-55d6a3a1de0f".parse().unwrap();
        assert_eq!(
            aggregation_id(&node, "aggr0"),
            "564d4d2c-f7c9-f4e5-42d4-55d6a3a1de0f-aggr0"
        );
    }
}
