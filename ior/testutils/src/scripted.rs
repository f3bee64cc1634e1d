// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Domains that answer from a script instead of a login.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ior::error::{IorError, IorResult};
use ior::local::DomainControl;
use ior::probe::{IoDomainProbe, RelatedStatus, VfStatusSnapshot};
use ior::vf::{DeviceClass, HotplugStatus, VfRecord};

/// Builds a snapshot from `(vf, status)` pairs.
pub fn snapshot(entries: &[(&str, HotplugStatus)]) -> VfStatusSnapshot {
    VfStatusSnapshot {
        statuses: entries
            .iter()
            .map(|(vf, s)| (vf.to_string(), s.clone()))
            .collect(),
    }
}

/// An I/O domain that goes through a fixed sequence of hotplug snapshots.
///
/// Every `hotplug_statuses` call serves the next snapshot; once the sequence
/// is used up the last one is served forever. Deep checks see a healthy
/// domain for whatever was served last: paths and I/O as in the baseline,
/// interfaces in the state their hotplug status calls for and traffic
/// everywhere.
pub struct ScriptedProbe {
    domain: String,
    baseline: BTreeMap<String, VfRecord>,
    pending: Mutex<VecDeque<VfStatusSnapshot>>,
    last: Mutex<VfStatusSnapshot>,
    served: Arc<AtomicUsize>,
    io_stalls: bool,
}

impl ScriptedProbe {
    pub fn new(
        domain: &str,
        baseline: BTreeMap<String, VfRecord>,
        snapshots: Vec<VfStatusSnapshot>,
    ) -> ScriptedProbe {
        let online = VfStatusSnapshot {
            statuses: baseline
                .iter()
                .map(|(vf, r)| (vf.clone(), r.hotplug_status.clone()))
                .collect(),
        };
        ScriptedProbe {
            domain: domain.to_string(),
            baseline,
            pending: Mutex::new(snapshots.into()),
            last: Mutex::new(online),
            served: Arc::new(AtomicUsize::new(0)),
            io_stalls: false,
        }
    }

    /// I/O stops on every multipathed disk, as if failover never happened.
    pub fn io_stalls(mut self) -> ScriptedProbe {
        self.io_stalls = true;
        self
    }

    /// Counts served snapshots, can be handed to a fault thread.
    pub fn served(&self) -> Arc<AtomicUsize> {
        self.served.clone()
    }

    fn current(&self, vf: &str) -> HotplugStatus {
        let last = self.last.lock().map(|l| l.status(vf).cloned()).ok().flatten();
        last.or_else(|| self.baseline.get(vf).map(|r| r.hotplug_status.clone()))
            .unwrap_or_else(|| HotplugStatus::Other("ABSENT".into()))
    }

    fn poisoned(&self) -> IorError {
        IorError::Parse {
            what: format!("scripted snapshots of {}", self.domain),
            text: "lock poisoned".into(),
        }
    }
}

impl IoDomainProbe for ScriptedProbe {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn hotplug_listing(&self) -> IorResult<String> {
        let last = self.last.lock().map_err(|_e| self.poisoned())?;
        Ok(last.to_string())
    }

    fn hotplug_statuses(&self, _vfs: &BTreeMap<String, VfRecord>) -> IorResult<VfStatusSnapshot> {
        let next = self
            .pending
            .lock()
            .map_err(|_e| self.poisoned())?
            .pop_front();
        let mut last = self.last.lock().map_err(|_e| self.poisoned())?;
        if let Some(next) = next {
            *last = next;
        }
        self.served.fetch_add(1, Ordering::SeqCst);
        Ok(last.clone())
    }

    fn related_status(
        &self,
        vfs: &BTreeMap<String, VfRecord>,
    ) -> IorResult<BTreeMap<String, RelatedStatus>> {
        let mut related = BTreeMap::new();
        for (name, record) in vfs {
            let status = self.current(name);
            let mut r = RelatedStatus::new(status.clone());
            match record.class() {
                DeviceClass::FibreChannel => {
                    let fc = record.fc();
                    let mpxio = fc.map(|fc| fc.mpxio).unwrap_or(false);
                    let had_path = fc.map(|fc| fc.logical_path.is_some()).unwrap_or(false);
                    r.port_found = Some(status.is_online());
                    r.logical_path_found = Some(if mpxio {
                        true
                    } else {
                        status.is_online() && had_path
                    });
                }
                DeviceClass::Network | DeviceClass::Infiniband => {
                    let (interface, group) = match status {
                        HotplugStatus::MaintenanceSuspended => ("failed", "degraded"),
                        _ => ("ok", "ok"),
                    };
                    r.interface_state = Some(interface.to_string());
                    if record.ipmp_group().is_some() {
                        r.ipmp_state = Some(group.to_string());
                    }
                }
            }
            related.insert(name.clone(), r);
        }
        Ok(related)
    }

    fn io_workload_on(&self, vf: &VfRecord) -> IorResult<bool> {
        let active = vf.fc().map(|fc| fc.io_active).unwrap_or(false);
        Ok(active && !self.io_stalls)
    }

    fn traffic_on(&self, _interface: &str) -> IorResult<bool> {
        Ok(true)
    }
}

/// Answers domain state queries from a table.
#[derive(Debug, Default)]
pub struct ScriptedControl {
    states: BTreeMap<String, String>,
    queries: AtomicUsize,
}

impl ScriptedControl {
    /// Every domain is `active`.
    pub fn new() -> ScriptedControl {
        Default::default()
    }

    pub fn domain(mut self, domain: &str, state: &str) -> ScriptedControl {
        self.states.insert(domain.to_string(), state.to_string());
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl DomainControl for ScriptedControl {
    fn domain_status(&self, domain: &str) -> IorResult<String> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .states
            .get(domain)
            .cloned()
            .unwrap_or_else(|| "active".to_string()))
    }

    fn console_port(&self, _domain: &str) -> IorResult<u16> {
        Ok(5000)
    }
}
