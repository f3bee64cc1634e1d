// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;

use ior::config::Timing;
use ior::inventory::Inventory;
use ior::report::Transcript;
use ior::session::{Connector, PtyConnector};
use ior::vf::{FcExtra, HotplugStatus, NicExtra, VfExtra, VfRecord};

pub mod fake_target;
pub mod scripted;

lazy_static! {
    /// Waits short enough for tests, logins and commands still get seconds
    /// since a fresh bash needs a moment to come up.
    pub static ref FAST: Timing = Timing::compressed(Duration::from_millis(5))
        .ssh_login(Duration::from_secs(10))
        .console_login(Duration::from_secs(10))
        .command(Duration::from_secs(10))
        .fault(Duration::from_secs(10))
        .pty_poll(Duration::from_millis(50));
}

/// A pty connector that keeps no transcript.
pub fn pty_connector() -> Arc<dyn Connector> {
    Arc::new(PtyConnector::new(Transcript::disabled(), &FAST))
}

/// An online, multipathed FC VF doing I/O through its disk.
pub fn fc_vf(alias: &str, io_domain: &str, port: usize) -> VfRecord {
    VfRecord {
        alias: alias.to_string(),
        io_domain: io_domain.to_string(),
        hotplug_dev: format!("/pci@300/pci@1/pci@0/pci@4/SUNW,qlc@0,{}", port),
        hotplug_path: "/pci@300/pci@1/pci@0/pci@4".into(),
        hotplug_port: format!("pci.0,{}", port),
        hotplug_status: HotplugStatus::Online,
        extra: VfExtra::Fc(FcExtra {
            port_wwn: format!("10000090fa1c4e3{}", port),
            logical_path: Some(format!(
                "/dev/rdsk/c0t600A0B80002A38460000F80752F6EB7{}d0s2",
                port
            )),
            mpxio: true,
            io_active: true,
        }),
    }
}

/// An online NIC VF in the IPMP group `ipmp0` carrying traffic.
pub fn nic_vf(alias: &str, io_domain: &str, port: usize) -> VfRecord {
    VfRecord {
        alias: alias.to_string(),
        io_domain: io_domain.to_string(),
        hotplug_dev: format!("/pci@380/pci@1/pci@0/pci@5/network@0,{}", port),
        hotplug_path: "/pci@380/pci@1/pci@0/pci@5".into(),
        hotplug_port: format!("pci.0,{}", port),
        hotplug_status: HotplugStatus::Online,
        extra: VfExtra::Nic(NicExtra {
            interface: format!("net{}", port),
            ipmp_group: Some("ipmp0".into()),
            traffic_active: true,
        }),
    }
}

/// One root domain with one PF holding `vfs`.
pub fn inventory(root: &str, pf: &str, vfs: &[(&str, VfRecord)]) -> Inventory {
    let mut inventory = Inventory::new();
    for (name, record) in vfs {
        inventory.insert(root, pf, name, record.clone());
    }
    inventory
}
