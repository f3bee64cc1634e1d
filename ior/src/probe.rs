// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observations of an I/O domain while its root domain is being disrupted.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use regex::Regex;

use crate::error::{IorError, IorResult};
use crate::executor::{Exec, Remote};
use crate::local::DomainControl;
use crate::vf::{self, DeviceClass, FcExtra, HotplugStatus, VfExtra, VfRecord};

/// `hotplug`, `fcinfo` and `luxadm` can take minutes on a busy domain.
const SLOW_COMMAND: Duration = Duration::from_secs(180);

/// Reported for a VF whose connection is missing from the listing.
pub const ABSENT: &str = "ABSENT";

/// Hotplug status of every VF at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VfStatusSnapshot {
    pub statuses: BTreeMap<String, HotplugStatus>,
}

impl VfStatusSnapshot {
    /// Looks up every VF of `vfs` in a `hotplug list -lv` listing.
    pub fn from_listing(vfs: &BTreeMap<String, VfRecord>, listing: &str) -> VfStatusSnapshot {
        let statuses = vfs
            .iter()
            .map(|(name, r)| {
                let status = vf::hotplug_status_in(listing, &r.hotplug_path, &r.hotplug_port)
                    .unwrap_or_else(|| HotplugStatus::Other(ABSENT.into()));
                (name.clone(), status)
            })
            .collect();
        VfStatusSnapshot { statuses }
    }

    pub fn status(&self, vf: &str) -> Option<&HotplugStatus> {
        self.statuses.get(vf)
    }

    /// Statuses of the VFs in `vfs` that belong to `class`.
    pub fn of_class<'a>(
        &'a self,
        vfs: &'a BTreeMap<String, VfRecord>,
        class: DeviceClass,
    ) -> Vec<&'a HotplugStatus> {
        vfs.iter()
            .filter(|(_name, r)| r.class() == class)
            .filter_map(|(name, _r)| self.statuses.get(name))
            .collect()
    }
}

impl fmt::Display for VfStatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let entries: Vec<String> = self
            .statuses
            .iter()
            .map(|(vf, s)| format!("{}: {}", vf, s))
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

/// Per-VF state used by the deep checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelatedStatus {
    pub hotplug_status: HotplugStatus,
    /// FC: the VF's port WWN is listed by `fcinfo`.
    pub port_found: Option<bool>,
    /// FC: the baseline logical path is still probed by `luxadm`.
    pub logical_path_found: Option<bool>,
    /// NIC/IB: `ipadm` state of the IP interface.
    pub interface_state: Option<String>,
    /// NIC/IB: state of the IPMP group the interface is in.
    pub ipmp_state: Option<String>,
}

impl RelatedStatus {
    pub fn new(hotplug_status: HotplugStatus) -> RelatedStatus {
        RelatedStatus {
            hotplug_status,
            port_found: None,
            logical_path_found: None,
            interface_state: None,
            ipmp_state: None,
        }
    }
}

/// What the coordinator needs to know about an I/O domain.
pub trait IoDomainProbe {
    fn domain(&self) -> &str;

    /// Raw `hotplug list -lv` output.
    fn hotplug_listing(&self) -> IorResult<String>;

    fn hotplug_statuses(&self, vfs: &BTreeMap<String, VfRecord>) -> IorResult<VfStatusSnapshot> {
        let listing = self.hotplug_listing()?;
        Ok(VfStatusSnapshot::from_listing(vfs, &listing))
    }

    fn related_status(
        &self,
        vfs: &BTreeMap<String, VfRecord>,
    ) -> IorResult<BTreeMap<String, RelatedStatus>>;

    /// Whether I/O is currently flowing through the VF's disk.
    fn io_workload_on(&self, vf: &VfRecord) -> IorResult<bool>;

    /// Whether ICMP traffic is seen on `interface` (an interface or IPMP group).
    fn traffic_on(&self, interface: &str) -> IorResult<bool>;
}

/// An [`IoDomainProbe`] that logs in to the domain for every observation.
///
/// Every listing taken is also saved below `log_dir`.
pub struct LdomProbe {
    remote: Remote,
    log_dir: PathBuf,
    seq: AtomicUsize,
}

impl LdomProbe {
    pub fn new<P: AsRef<Path>>(remote: Remote, log_dir: P) -> LdomProbe {
        LdomProbe {
            remote,
            log_dir: log_dir.as_ref().to_path_buf(),
            seq: AtomicUsize::new(0),
        }
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    fn save(&self, kind: &str, text: &str) -> IorResult<PathBuf> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let path = self
            .log_dir
            .join(format!("{}.{}.{}.{}", kind, self.domain(), secs, n));
        fs::write(&path, text)?;
        Ok(path)
    }

    /// Captures `command` output and saves it. Non-zero exit leaves it empty.
    fn capture(&self, kind: &str, command: &str) -> IorResult<String> {
        let output = match self.remote.retsend(&Exec::new(command).timeout(SLOW_COMMAND)) {
            Ok(out) => out,
            Err(e) if e.is_exit_status() => String::new(),
            Err(e) => return Err(e.into()),
        };
        self.save(kind, &output)?;
        Ok(output)
    }

    /// The logical path whose device tree goes through the VF, if any.
    pub fn vf_logical_path(&self, vf: &VfRecord) -> IorResult<Option<String>> {
        let luxadm = self.capture("path", "luxadm probe | grep Path")?;
        for path in vf::logical_paths(&luxadm) {
            let cmd = format!("prtconf -v {}|grep pci|grep {}", path, vf.hotplug_dev);
            if self.remote.probe(&cmd)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Whether the VF's disk is multipathed through another PCIe bus.
    pub fn vf_mpxio(&self, hotplug_dev: &str, logical_path: &str) -> IorResult<bool> {
        let prtconf = match self
            .remote
            .output_opt(&format!("prtconf -v {}|grep pci", logical_path))?
        {
            Some(out) => out,
            None => return Ok(false),
        };
        Ok(mpxio_partner(&prtconf, hotplug_dev))
    }

    /// Collects the FC specifics of a VF assigned to this domain.
    pub fn describe_fc_vf(
        &self,
        alias: &str,
        hotplug_dev: &str,
        port_wwn: &str,
    ) -> IorResult<VfRecord> {
        let listing = self.hotplug_listing()?;
        let (path, port, status) =
            vf::hotplug_connection_of(&listing, hotplug_dev).ok_or_else(|| IorError::Parse {
                what: format!("hotplug connection of {}", hotplug_dev),
                text: listing.clone(),
            })?;

        let mut record = VfRecord {
            alias: alias.to_string(),
            io_domain: self.domain().to_string(),
            hotplug_dev: hotplug_dev.to_string(),
            hotplug_path: path,
            hotplug_port: port,
            hotplug_status: status,
            extra: VfExtra::Fc(FcExtra {
                port_wwn: port_wwn.to_string(),
                logical_path: None,
                mpxio: false,
                io_active: false,
            }),
        };

        let logical_path = self.vf_logical_path(&record)?;
        let mpxio = match &logical_path {
            Some(lp) => self.vf_mpxio(hotplug_dev, lp)?,
            None => false,
        };
        let io_active = self.io_workload_on(&record)?;
        record.extra = VfExtra::Fc(FcExtra {
            port_wwn: port_wwn.to_string(),
            logical_path,
            mpxio,
            io_active,
        });
        Ok(record)
    }

    fn hotplug_connection(&self, vf: &VfRecord) -> IorResult<(String, String)> {
        let listing = self.hotplug_listing()?;
        vf::hotplug_connection_of(&listing, &vf.hotplug_dev)
            .map(|(path, port, _status)| (path, port))
            .ok_or_else(|| IorError::Parse {
                what: format!("hotplug connection of {}", vf.alias),
                text: listing,
            })
    }

    pub fn offline_vf(&self, vf: &VfRecord) -> IorResult<()> {
        let (path, port) = self.hotplug_connection(vf)?;
        self.remote
            .run(&format!("hotplug offline {} {}", path, port))?;
        info!("Offlined {} in {}", vf.alias, self.domain());
        Ok(())
    }

    pub fn online_vf(&self, vf: &VfRecord) -> IorResult<()> {
        let (path, port) = self.hotplug_connection(vf)?;
        self.remote
            .run(&format!("hotplug online {} {}", path, port))?;
        info!("Onlined {} in {}", vf.alias, self.domain());
        Ok(())
    }

    /// The domain is active and accepts logins.
    pub fn check_domain_boot_up(&self, control: &dyn DomainControl) -> IorResult<bool> {
        if control.domain_status(self.domain())? != "active" {
            return Ok(false);
        }
        match self.remote.run("hostname") {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("{} is active but not reachable: {}", self.domain(), e);
                Ok(false)
            }
        }
    }
}

impl IoDomainProbe for LdomProbe {
    fn domain(&self) -> &str {
        self.remote.endpoint().name()
    }

    fn hotplug_listing(&self) -> IorResult<String> {
        let listing = self
            .remote
            .retsend(&Exec::new("hotplug list -lv").timeout(SLOW_COMMAND))?;
        self.save("hotplug", &listing)?;
        Ok(listing)
    }

    fn related_status(
        &self,
        vfs: &BTreeMap<String, VfRecord>,
    ) -> IorResult<BTreeMap<String, RelatedStatus>> {
        let listing = self.hotplug_listing()?;
        let has_fc = vfs.values().any(|r| r.class() == DeviceClass::FibreChannel);
        let has_ip = vfs.values().any(|r| r.class() != DeviceClass::FibreChannel);

        let (fcinfo, luxadm) = if has_fc {
            (
                self.capture("fcinfo", "fcinfo hba-port | grep HBA")?,
                self.capture("path", "luxadm probe | grep Path")?,
            )
        } else {
            (String::new(), String::new())
        };
        let (ipadm, ipmpstat) = if has_ip {
            (
                self.capture("ipadm", "ipadm")?,
                self.capture("ipmpstat_g", "ipmpstat -o GROUP,STATE -P -g")?,
            )
        } else {
            (String::new(), String::new())
        };

        let mut related = BTreeMap::new();
        for (name, r) in vfs {
            let status = vf::hotplug_status_in(&listing, &r.hotplug_path, &r.hotplug_port)
                .unwrap_or_else(|| HotplugStatus::Other(ABSENT.into()));
            let mut s = RelatedStatus::new(status);
            match &r.extra {
                VfExtra::Fc(fc) => {
                    s.port_found = Some(fcinfo.contains(&fc.port_wwn));
                    s.logical_path_found = Some(
                        fc.logical_path
                            .as_ref()
                            .map_or(false, |lp| luxadm.contains(lp.as_str())),
                    );
                }
                VfExtra::Nic(_) | VfExtra::Ib(_) => {
                    s.interface_state = r
                        .interface()
                        .and_then(|interface| vf::interface_state(&ipadm, interface));
                    s.ipmp_state = r
                        .ipmp_group()
                        .and_then(|group| vf::ipmp_state(&ipmpstat, group));
                }
            }
            related.insert(name.clone(), s);
        }
        Ok(related)
    }

    fn io_workload_on(&self, vf: &VfRecord) -> IorResult<bool> {
        let logical_path = match self.vf_logical_path(vf)? {
            Some(lp) => lp,
            None => return Ok(false),
        };
        let disk = match vf::disk_of(&logical_path) {
            Some(d) => d,
            None => return Ok(false),
        };
        let iostat = self.capture("iodata", &format!("iostat -xn {} 5 3 | grep {}", disk, disk))?;
        Ok(vf::io_workload_active(&iostat, &disk))
    }

    fn traffic_on(&self, interface: &str) -> IorResult<bool> {
        let tmp = self.remote.output("mktemp")?;
        let capture = format!("timeout 10 snoop -I {} -c 15 -o {}", interface, tmp);
        if !self.remote.probe(&capture)? {
            return Ok(false);
        }
        Ok(self.remote.probe(&format!("snoop -i {}|grep ICMP", tmp))?)
    }
}

/// Whether `prtconf -v <path>|grep pci` shows a path through a PCIe bus other
/// than the one `hotplug_dev` sits on.
pub fn mpxio_partner(prtconf: &str, hotplug_dev: &str) -> bool {
    let own_bus = match hotplug_dev.split('/').nth(1) {
        Some(b) => b,
        None => return false,
    };
    let re = match Regex::new(r"/(pci@[0-9a-fA-F]+)") {
        Ok(re) => re,
        Err(_) => return false,
    };
    let buses: Vec<&str> = prtconf
        .lines()
        .filter(|l| l.contains("Path"))
        .filter_map(|l| re.captures(l).and_then(|c| c.get(1)).map(|m| m.as_str()))
        .collect();
    buses.len() >= 2 && buses.iter().any(|b| *b != own_bus)
}
