// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deep checks of an I/O domain against its baseline.
//!
//! A failing check is an outcome of the test, not an error: every function
//! here returns `Ok(false)` for it and reserves `Err` for observations that
//! could not be made at all. Each VF result is written to the report as
//! `VF [<vf>] <what> check results:Pass|Fail`.

use std::collections::BTreeMap;

use crate::error::IorResult;
use crate::probe::{IoDomainProbe, RelatedStatus};
use crate::report::Reporter;
use crate::vf::{HotplugStatus, VfRecord};

fn verdict(reporter: &Reporter, vf: &str, what: &str, pass: bool) -> bool {
    reporter.note(format!(
        "VF [{}] {} check results:{}",
        vf,
        what,
        if pass { "Pass" } else { "Fail" }
    ));
    pass
}

fn related_of<'a>(
    reporter: &Reporter,
    related: &'a BTreeMap<String, RelatedStatus>,
    vf: &str,
) -> Option<&'a RelatedStatus> {
    let r = related.get(vf);
    if r.is_none() {
        reporter.warn(format!("No status was collected for VF [{}]", vf));
    }
    r
}

/// Every VF is back at the hotplug status it had in the baseline.
pub fn hotplug_matches_baseline(
    reporter: &Reporter,
    related: &BTreeMap<String, RelatedStatus>,
    baseline: &BTreeMap<String, VfRecord>,
) -> bool {
    let mut pass = true;
    for (vf, record) in baseline {
        let same = related_of(reporter, related, vf)
            .map_or(false, |r| r.hotplug_status == record.hotplug_status);
        pass &= verdict(reporter, vf, "hotplug_status", same);
    }
    pass
}

/// Logical paths and I/O continuity of the FC VFs in `baseline`.
///
/// With several root domains down at once nothing may keep doing I/O and
/// logical paths must look like the baseline. With one root domain down a
/// multipathed VF must keep its path and its I/O state, a plain VF keeps
/// its path only while it stays online.
pub fn disk_and_io(
    reporter: &Reporter,
    probe: &dyn IoDomainProbe,
    related: &BTreeMap<String, RelatedStatus>,
    baseline: &BTreeMap<String, VfRecord>,
    multi_root: bool,
) -> IorResult<bool> {
    let mut pass = true;
    for (vf, record) in baseline {
        let fc = match record.fc() {
            Some(fc) => fc,
            None => continue,
        };
        let status = match related_of(reporter, related, vf) {
            Some(s) => s,
            None => {
                pass = false;
                continue;
            }
        };
        let path_found = status.logical_path_found.unwrap_or(false);

        if multi_root {
            pass &= verdict(
                reporter,
                vf,
                "logical_path",
                path_found == fc.logical_path.is_some(),
            );
            let io = probe.io_workload_on(record)?;
            pass &= verdict(reporter, vf, "I/O", !io);
            continue;
        }

        match status.hotplug_status {
            HotplugStatus::Online | HotplugStatus::Offline => {}
            ref other => {
                reporter.note(format!(
                    "VF [{}] is {}, logical_path and I/O are not checked",
                    vf, other
                ));
                return Ok(false);
            }
        }

        if fc.mpxio {
            if !verdict(reporter, vf, "logical_path", path_found) {
                pass = false;
                continue;
            }
            let io = probe.io_workload_on(record)?;
            pass &= verdict(reporter, vf, "I/O", io == fc.io_active);
        } else if status.hotplug_status.is_online() {
            pass &= verdict(
                reporter,
                vf,
                "logical_path",
                path_found == fc.logical_path.is_some(),
            );
        } else {
            pass &= verdict(reporter, vf, "logical_path", !path_found);
        }
    }
    Ok(pass)
}

/// Interface state, IPMP state and traffic of the NIC and IB VFs in
/// `baseline`.
///
/// A maintenance-suspended VF must show a failed interface in a degraded
/// group that still carries traffic. Any other VF must be fully healthy.
/// Traffic is only looked at for VFs that carried traffic in the baseline.
pub fn interface_and_traffic(
    reporter: &Reporter,
    probe: &dyn IoDomainProbe,
    related: &BTreeMap<String, RelatedStatus>,
    baseline: &BTreeMap<String, VfRecord>,
    multi_root: bool,
) -> IorResult<bool> {
    if multi_root {
        return Ok(true);
    }

    let mut pass = true;
    for (vf, record) in baseline {
        let interface = match record.interface() {
            Some(i) => i,
            None => continue,
        };
        let status = match related_of(reporter, related, vf) {
            Some(s) => s,
            None => {
                pass = false;
                continue;
            }
        };

        let suspended = match status.hotplug_status {
            HotplugStatus::MaintenanceSuspended => true,
            HotplugStatus::Online | HotplugStatus::Maintenance => false,
            ref other => {
                reporter.note(format!(
                    "VF [{}] is {}, interface and traffic are not checked",
                    vf, other
                ));
                return Ok(false);
            }
        };
        let (interface_ok, ipmp_ok) = if suspended {
            ("failed", "degraded")
        } else {
            ("ok", "ok")
        };

        let state = status.interface_state.as_deref();
        if state != Some(interface_ok) {
            pass = verdict(reporter, vf, "interface state", false);
        }

        match record.ipmp_group() {
            Some(group) => {
                if status.ipmp_state.as_deref() != Some(ipmp_ok) {
                    pass = verdict(reporter, vf, "ipmp state", false);
                } else if record.traffic_active() && !probe.traffic_on(group)? {
                    pass = verdict(reporter, vf, "traffic", false);
                }
            }
            None if record.traffic_active() => {
                // Without IPMP nothing takes over the traffic of a suspended VF.
                let traffic = probe.traffic_on(interface)?;
                if traffic == suspended {
                    pass = verdict(reporter, vf, "traffic", false);
                }
            }
            None => {}
        }
    }
    Ok(pass)
}
