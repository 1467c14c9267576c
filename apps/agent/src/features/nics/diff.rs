//! Direction-split field diffing for NIC convergence.
//!
//! Three field groups, three movements: remote-authoritative fields are
//! pulled down onto the local entity, local-authoritative fields are
//! pushed up to NetAPI, and the VM-affecting fields (routes, resolvers)
//! are consumed by the owning VM rather than the NIC itself.

use netsync_types::boolish::truthy;
use netsync_types::{Nic, NicPatch};

/// `locupdate`: remote-authoritative fields that differ, valued from the
/// remote side. Only fields the remote actually carries participate.
pub fn pull_down(remote: &Nic, local: &Nic) -> NicPatch {
    let mut patch = NicPatch::default();

    for (field, rv, lv) in spoof_fields(remote, local) {
        if truthy(rv) != truthy(lv) {
            set_spoof(&mut patch, field, truthy(rv));
        }
    }

    if remote.gateway.is_some() && remote.gateway != local.gateway {
        patch.gateway = remote.gateway.clone();
    }
    if remote.ip.is_some() && remote.ip != local.ip {
        patch.ip = remote.ip.clone();
    }
    if remote.model.is_some() && remote.model != local.model {
        patch.model = remote.model.clone();
    }
    if remote.mtu.is_some() && remote.mtu != local.mtu {
        patch.mtu = remote.mtu;
    }
    if remote.netmask.is_some() && remote.netmask != local.netmask {
        patch.netmask = remote.netmask.clone();
    }
    if remote.network_uuid.is_some() && remote.network_uuid != local.network_uuid {
        patch.network_uuid = remote.network_uuid;
    }
    if remote.nic_tag.is_some() && remote.nic_tag != local.nic_tag {
        patch.nic_tag = remote.nic_tag.clone();
    }
    if remote.vlan_id.is_some() && remote.vlan_id != local.vlan_id {
        patch.vlan_id = remote.vlan_id;
    }

    patch
}

/// `remupdate`: local-authoritative fields that differ, valued from the
/// local side. `primary` moves to true only; demotion happens implicitly
/// when another NIC becomes primary.
pub fn push_up(local: &Nic, remote: &Nic) -> NicPatch {
    let mut patch = NicPatch::default();

    if local.belongs_to_type.is_some() && local.belongs_to_type != remote.belongs_to_type {
        patch.belongs_to_type = local.belongs_to_type;
    }
    if local.belongs_to_uuid.is_some() && local.belongs_to_uuid != remote.belongs_to_uuid {
        patch.belongs_to_uuid = local.belongs_to_uuid;
    }
    if local.owner_uuid.is_some() && local.owner_uuid != remote.owner_uuid {
        patch.owner_uuid = local.owner_uuid;
    }
    if truthy(local.primary) && !truthy(remote.primary) {
        patch.primary = Some(true);
    }
    if local.state.is_some() && local.state != remote.state {
        patch.state = local.state;
    }
    if local.cn_uuid.is_some() && local.cn_uuid != remote.cn_uuid {
        patch.cn_uuid = local.cn_uuid;
    }

    patch
}

/// Whether the VM-affecting fields changed between two remote views.
/// Drives the owning instance's route/resolver recomputation.
pub fn vm_fields_changed(new_remote: &Nic, old_remote: Option<&Nic>) -> bool {
    match old_remote {
        None => new_remote.resolvers.is_some() || new_remote.routes.is_some(),
        Some(old) => new_remote.resolvers != old.resolvers || new_remote.routes != old.routes,
    }
}

type SpoofRow = (&'static str, Option<bool>, Option<bool>);

fn spoof_fields(remote: &Nic, local: &Nic) -> [SpoofRow; 5] {
    [
        ("dhcp", remote.allow_dhcp_spoofing, local.allow_dhcp_spoofing),
        ("ip", remote.allow_ip_spoofing, local.allow_ip_spoofing),
        ("mac", remote.allow_mac_spoofing, local.allow_mac_spoofing),
        (
            "restricted",
            remote.allow_restricted_traffic,
            local.allow_restricted_traffic,
        ),
        (
            "promisc",
            remote.allow_unfiltered_promisc,
            local.allow_unfiltered_promisc,
        ),
    ]
}

fn set_spoof(patch: &mut NicPatch, field: &'static str, value: bool) {
    match field {
        "dhcp" => patch.allow_dhcp_spoofing = Some(value),
        "ip" => patch.allow_ip_spoofing = Some(value),
        "mac" => patch.allow_mac_spoofing = Some(value),
        "restricted" => patch.allow_restricted_traffic = Some(value),
        "promisc" => patch.allow_unfiltered_promisc = Some(value),
        _ => unreachable!("unknown spoof field {field}"),
    }
}
