// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Virtual functions and the tool output describing them.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IorError;

/// PCIe device class of a physical function and all its VFs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceClass {
    #[serde(rename = "FIBRECHANNEL")]
    FibreChannel,
    #[serde(rename = "NETWORK")]
    Network,
    #[serde(rename = "INFINIBAND")]
    Infiniband,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceClass::FibreChannel => write!(f, "FIBRECHANNEL"),
            DeviceClass::Network => write!(f, "NETWORK"),
            DeviceClass::Infiniband => write!(f, "INFINIBAND"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = IorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "FIBRECHANNEL" => Ok(DeviceClass::FibreChannel),
            "NETWORK" => Ok(DeviceClass::Network),
            "INFINIBAND" => Ok(DeviceClass::Infiniband),
            other => Err(IorError::Parse {
                what: "device class".into(),
                text: other.to_string(),
            }),
        }
    }
}

/// State of a hotplug connection as shown by `hotplug list -lv`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HotplugStatus {
    Online,
    Offline,
    MaintenanceSuspended,
    Maintenance,
    Other(String),
}

impl HotplugStatus {
    pub fn is_online(&self) -> bool {
        *self == HotplugStatus::Online
    }
}

impl From<&str> for HotplugStatus {
    fn from(s: &str) -> Self {
        match s.trim() {
            "ONLINE" => HotplugStatus::Online,
            "OFFLINE" => HotplugStatus::Offline,
            "MAINTENANCE-SUSPENDED" => HotplugStatus::MaintenanceSuspended,
            "MAINTENANCE" => HotplugStatus::Maintenance,
            other => HotplugStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for HotplugStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HotplugStatus::Online => write!(f, "ONLINE"),
            HotplugStatus::Offline => write!(f, "OFFLINE"),
            HotplugStatus::MaintenanceSuspended => write!(f, "MAINTENANCE-SUSPENDED"),
            HotplugStatus::Maintenance => write!(f, "MAINTENANCE"),
            HotplugStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Fibre channel specifics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FcExtra {
    pub port_wwn: String,
    /// e.g. `/dev/rdsk/c0t600A0B80002A38460000F80752F6EB7Ed0s2`
    pub logical_path: Option<String>,
    /// Multipathed together with a VF from another root domain.
    pub mpxio: bool,
    /// I/O was running through the VF when the baseline was taken.
    pub io_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicExtra {
    pub interface: String,
    pub ipmp_group: Option<String>,
    pub traffic_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IbExtra {
    pub link: String,
    /// IB partition link carrying the IP interface.
    pub part: String,
    pub ipmp_group: Option<String>,
    pub traffic_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VfExtra {
    Fc(FcExtra),
    Nic(NicExtra),
    Ib(IbExtra),
}

/// Everything known about one VF, as captured for the baseline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VfRecord {
    /// e.g. `/SYS/MB/PCIE4/IOVFC.PF0.VF1`
    pub alias: String,
    pub io_domain: String,
    pub hotplug_dev: String,
    pub hotplug_path: String,
    pub hotplug_port: String,
    pub hotplug_status: HotplugStatus,
    pub extra: VfExtra,
}

impl VfRecord {
    pub fn class(&self) -> DeviceClass {
        match self.extra {
            VfExtra::Fc(_) => DeviceClass::FibreChannel,
            VfExtra::Nic(_) => DeviceClass::Network,
            VfExtra::Ib(_) => DeviceClass::Infiniband,
        }
    }

    pub fn fc(&self) -> Option<&FcExtra> {
        match &self.extra {
            VfExtra::Fc(fc) => Some(fc),
            _ => None,
        }
    }

    /// IP interface name for NIC and IB VFs.
    pub fn interface(&self) -> Option<&str> {
        match &self.extra {
            VfExtra::Nic(nic) => Some(&nic.interface),
            VfExtra::Ib(ib) => Some(&ib.part),
            VfExtra::Fc(_) => None,
        }
    }

    pub fn ipmp_group(&self) -> Option<&str> {
        match &self.extra {
            VfExtra::Nic(nic) => nic.ipmp_group.as_deref(),
            VfExtra::Ib(ib) => ib.ipmp_group.as_deref(),
            VfExtra::Fc(_) => None,
        }
    }

    pub fn ipmp_flag(&self) -> bool {
        self.ipmp_group().is_some()
    }

    pub fn traffic_active(&self) -> bool {
        match &self.extra {
            VfExtra::Nic(nic) => nic.traffic_active,
            VfExtra::Ib(ib) => ib.traffic_active,
            VfExtra::Fc(_) => false,
        }
    }
}

/// Status of the connection `path <port>` in a `hotplug list -lv` listing.
///
/// ```text
/// /pci@380/pci@1/pci@0/pci@6  <pci.0,2>  ONLINE
/// ```
pub fn hotplug_status_in(listing: &str, path: &str, port: &str) -> Option<HotplugStatus> {
    listing
        .lines()
        .find(|l| l.contains(path) && l.contains(port))
        .and_then(|l| l.split_whitespace().nth(2))
        .map(HotplugStatus::from)
}

/// Path, port and status of the connection a hotplug device hangs off.
///
/// The listing prints the device (`/pci@380/.../SUNW,qlc@0,2`) on the line
/// after its connection; the driver name may differ from the one `ldm`
/// reports, so only the unit address has to match.
pub fn hotplug_connection_of(
    listing: &str,
    hotplug_dev: &str,
) -> Option<(String, String, HotplugStatus)> {
    let (parent, leaf) = hotplug_dev.rsplit_once('/')?;
    let unit = leaf.split_once('@').map(|(_driver, unit)| unit)?;
    let pattern = format!(
        r"^{}/[^/@\s]+@{}\s*$",
        regex::escape(parent),
        regex::escape(unit)
    );
    let re = Regex::new(&pattern).ok()?;

    let lines: Vec<&str> = listing.lines().collect();
    let at = lines.iter().position(|l| re.is_match(l.trim()))?;
    let connection = lines.get(at.checked_sub(1)?)?;
    let mut fields = connection.split_whitespace();
    let path = fields.next()?.to_string();
    let port = fields.next()?.trim_matches(|c| c == '<' || c == '>').to_string();
    let status = HotplugStatus::from(fields.next()?);
    Some((path, port, status))
}

/// All device paths in `luxadm probe | grep Path` output.
pub fn logical_paths(luxadm: &str) -> Vec<String> {
    match Regex::new(r"/dev/\S+") {
        Ok(re) => re
            .find_iter(luxadm)
            .map(|m| m.as_str().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Disk name of a logical path, `/dev/rdsk/c0t5d0s2` gives `c0t5d0`.
pub fn disk_of(logical_path: &str) -> Option<String> {
    let device = logical_path.split('/').nth(3)?;
    let end = device.len().checked_sub(2)?;
    device.get(..end).filter(|d| !d.is_empty()).map(str::to_string)
}

/// Whether `iostat -xn <disk> 5 3` output shows ongoing I/O.
///
/// The first sample is the average since boot and is skipped. I/O counts as
/// on once two consecutive samples show reads or writes; a zero sample ends
/// the evaluation.
pub fn io_workload_active(iostat: &str, disk: &str) -> bool {
    let mut active = 0;
    for line in iostat.lines().filter(|l| l.contains(disk)).skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let read = fields.get(2).and_then(|f| f.parse::<f64>().ok());
        let write = fields.get(3).and_then(|f| f.parse::<f64>().ok());
        match (read, write) {
            (Some(r), Some(w)) if r + w != 0.0 => active += 1,
            _ => break,
        }
    }
    active >= 2
}

/// State column of `ipadm` for `interface`, e.g. `ok`, `failed`.
pub fn interface_state(ipadm: &str, interface: &str) -> Option<String> {
    let key = format!("{} ", interface);
    ipadm
        .lines()
        .find(|l| l.contains(&key))
        .and_then(|l| l.split_whitespace().nth(2))
        .map(str::to_string)
}

/// State of an IPMP group in `ipmpstat -o GROUP,STATE -P -g` output.
pub fn ipmp_state(ipmpstat: &str, group: &str) -> Option<String> {
    ipmpstat
        .lines()
        .find(|l| l.contains(group))
        .and_then(|l| l.split(':').nth(1))
        .map(|s| s.trim().to_string())
}
