// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runs a fault against root domains while watching their I/O domains, and
//! turns what was seen into a [`Verdict`].
//!
//! With one root domain and one I/O domain the I/O domain is polled while
//! the fault is in progress and every poll feeds the state machine in
//! [`transition`]. With more of either, the fault threads are joined first
//! and each I/O domain is compared against its baseline once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, info};

use crate::checks;
use crate::config::Timing;
use crate::error::{IorError, IorResult};
use crate::fault::{spawn_fault_thread, Disrupt, FaultOutcome, FaultRequest};
use crate::inventory::Inventory;
use crate::local::DomainControl;
use crate::probe::{IoDomainProbe, VfStatusSnapshot};
use crate::report::Reporter;
use crate::signal::CoordinationSignal;
use crate::vf::{DeviceClass, HotplugStatus, VfRecord};


/// Outcome of a test case, also the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Verdict {
    Pass = 0,
    /// The I/O domain did not behave as expected.
    Fail = 1,
    /// The test itself could not be completed.
    Unresolved = 2,
}

impl Verdict {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
            Verdict::Unresolved => write!(f, "UNRESOLVED"),
        }
    }
}

/// Hotplug status of a group of VFs reduced to one value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Online,
    /// Every VF has this status.
    Uniform(HotplugStatus),
    /// VFs disagree; this is the dominant status off the baseline.
    Mix(HotplugStatus),
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Aggregate::Online => write!(f, "ONLINE"),
            Aggregate::Uniform(s) => write!(f, "{}", s),
            Aggregate::Mix(s) => write!(f, "MIX-{}", s),
        }
    }
}

/// Reduces per-VF statuses to one [`Aggregate`].
///
/// Maintenance-suspended VFs dominate offline ones, which dominate any
/// other status; among other statuses the most frequent wins.
pub fn aggregate<'a, I>(statuses: I) -> Aggregate
where
    I: IntoIterator<Item = &'a HotplugStatus>,
{
    let mut total = 0;
    let mut off: BTreeMap<&HotplugStatus, usize> = BTreeMap::new();
    for s in statuses {
        total += 1;
        if !s.is_online() {
            *off.entry(s).or_insert(0) += 1;
        }
    }

    if off.is_empty() {
        return Aggregate::Online;
    }
    if off.len() == 1 && off.values().sum::<usize>() == total {
        if let Some(s) = off.keys().next() {
            return Aggregate::Uniform((*s).clone());
        }
    }

    let dominant = if off.contains_key(&HotplugStatus::MaintenanceSuspended) {
        HotplugStatus::MaintenanceSuspended
    } else if off.contains_key(&HotplugStatus::Offline) {
        HotplugStatus::Offline
    } else {
        // Ties go to the smallest status so the result is deterministic.
        off.iter()
            .fold(None, |best: Option<(&HotplugStatus, usize)>, (s, n)| match best {
                Some((_, m)) if m >= *n => best,
                _ => Some((*s, *n)),
            })
            .map(|(s, _n)| s.clone())
            .unwrap_or(HotplugStatus::Offline)
    };
    Aggregate::Mix(dominant)
}

/// What one poll of the test VFs showed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// All back online.
    Online,
    /// The fault reached the VFs the way it should.
    Disrupted,
    /// Only some of the VFs went offline.
    MixOffline,
    /// Nothing that moves the state machine.
    Unchanged,
}

/// Classifies a snapshot of `vfs` and describes it for the report.
///
/// FC-only runs look at the aggregate over all VFs. As soon as NIC or IB VFs
/// take part, every class is aggregated on its own: FC VFs have to go
/// offline and NIC/IB VFs maintenance-suspended.
pub fn observe(
    snapshot: &VfStatusSnapshot,
    vfs: &BTreeMap<String, VfRecord>,
) -> (Observation, String) {
    let mixed = vfs
        .values()
        .any(|r| r.class() != DeviceClass::FibreChannel);

    if !mixed {
        let agg = aggregate(snapshot.statuses.values());
        let obs = match &agg {
            Aggregate::Online => Observation::Online,
            Aggregate::Uniform(HotplugStatus::Offline) => Observation::Disrupted,
            Aggregate::Uniform(HotplugStatus::MaintenanceSuspended)
            | Aggregate::Mix(HotplugStatus::MaintenanceSuspended) => Observation::Disrupted,
            Aggregate::Mix(HotplugStatus::Offline) => Observation::MixOffline,
            _ => Observation::Unchanged,
        };
        return (obs, agg.to_string());
    }

    let mut groups = Vec::new();
    for class in [
        DeviceClass::FibreChannel,
        DeviceClass::Network,
        DeviceClass::Infiniband,
    ] {
        let statuses = snapshot.of_class(vfs, class);
        if !statuses.is_empty() {
            groups.push((class, aggregate(statuses)));
        }
    }

    let disrupted = groups.iter().all(|(class, agg)| match class {
        DeviceClass::FibreChannel => *agg == Aggregate::Uniform(HotplugStatus::Offline),
        _ => *agg == Aggregate::Uniform(HotplugStatus::MaintenanceSuspended),
    });
    let online = groups.iter().all(|(_class, agg)| *agg == Aggregate::Online);
    let obs = if online {
        Observation::Online
    } else if disrupted {
        Observation::Disrupted
    } else {
        Observation::Unchanged
    };

    let label = |class: DeviceClass| {
        groups
            .iter()
            .find(|(c, _agg)| *c == class)
            .map_or("None".to_string(), |(_c, agg)| agg.to_string())
    };
    let summary = format!(
        "FC: {}|NIC: {}|IB: {}",
        label(DeviceClass::FibreChannel),
        label(DeviceClass::Network),
        label(DeviceClass::Infiniband)
    );
    (obs, summary)
}

/// Where the polling loop is in one fault round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    Baseline,
    Disrupted,
    /// Last round done, nothing left to poll for.
    Recovered,
}

/// Work a transition asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    DeepCheckDuring,
    /// `again` starts another round afterwards.
    DeepCheckAfter { again: bool },
    MixOfflineCheck,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub next: PollState,
    pub action: Action,
}

/// The polling state machine. `remaining` counts the fault rounds still
/// expected, including the current one.
pub fn transition(state: PollState, observation: Observation, remaining: usize) -> Transition {
    let (next, action) = match (state, observation) {
        (PollState::Baseline, Observation::Disrupted) => {
            (PollState::Disrupted, Action::DeepCheckDuring)
        }
        (PollState::Disrupted, Observation::Online) if remaining > 1 => {
            (PollState::Baseline, Action::DeepCheckAfter { again: true })
        }
        (PollState::Disrupted, Observation::Online) => {
            (PollState::Recovered, Action::DeepCheckAfter { again: false })
        }
        (PollState::Disrupted, Observation::MixOffline) => {
            (PollState::Disrupted, Action::MixOfflineCheck)
        }
        (state, _) => (state, Action::None),
    };
    Transition { next, action }
}

/// Failures recorded while polling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Tally {
    mix_offline: bool,
    hotplug_failed: bool,
    during_failed: bool,
    after_failed: bool,
}

fn pass_fail(pass: bool) -> &'static str {
    if pass {
        "Pass"
    } else {
        "Fail"
    }
}

pub struct Coordinator {
    reporter: Arc<Reporter>,
    control: Arc<dyn DomainControl>,
    timing: Timing,
}

impl Coordinator {
    pub fn new(
        reporter: Arc<Reporter>,
        control: Arc<dyn DomainControl>,
        timing: Timing,
    ) -> Coordinator {
        Coordinator {
            reporter,
            control,
            timing,
        }
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Judges how the I/O domains in `iods` coped with the faults in `roots`.
    ///
    /// `signal` is the one raised by the fault thread of a single root
    /// domain; with several root domains their threads must have finished.
    pub fn check_ior_in_domain(
        &self,
        inventory: &Inventory,
        iods: &[&dyn IoDomainProbe],
        roots: &[FaultRequest],
        signal: &CoordinationSignal,
    ) -> IorResult<Verdict> {
        if iods.is_empty() || roots.is_empty() {
            return Err(IorError::NothingToCheck);
        }
        let deadline = self.timing.overall_timeout.map(|d| Instant::now() + d);

        match (iods, roots) {
            ([probe], [root]) => self.check_live(inventory, *probe, root, signal, deadline),
            _ => {
                self.wait_clear(signal, deadline)?;
                self.check_after(inventory, iods, roots)
            }
        }
    }

    fn wait_clear(&self, signal: &CoordinationSignal, deadline: Option<Instant>) -> IorResult<()> {
        if signal.wait_clear(self.timing.idle, deadline) {
            Ok(())
        } else {
            Err(IorError::Stalled {
                waited_secs: self.timing.overall_timeout.map_or(0, |d| d.as_secs()),
            })
        }
    }

    /// Logical path, I/O and interface checks of `vfs`, per device class.
    fn deep_check(
        &self,
        probe: &dyn IoDomainProbe,
        vfs: &BTreeMap<String, VfRecord>,
        multi_root: bool,
    ) -> IorResult<bool> {
        let related = probe.related_status(vfs)?;
        let mut pass = true;

        if vfs.values().any(|r| r.class() == DeviceClass::FibreChannel) {
            let ok = checks::disk_and_io(&self.reporter, probe, &related, vfs, multi_root)?;
            self.reporter.info(format!(
                "Logical_path and I/O in io domain {}:{}",
                probe.domain(),
                pass_fail(ok)
            ));
            pass &= ok;
        }
        for (class, label) in [(DeviceClass::Network, "NIC"), (DeviceClass::Infiniband, "IB")] {
            let of_class: BTreeMap<String, VfRecord> = vfs
                .iter()
                .filter(|(_vf, r)| r.class() == class)
                .map(|(vf, r)| (vf.clone(), r.clone()))
                .collect();
            if of_class.is_empty() {
                continue;
            }
            let ok = checks::interface_and_traffic(
                &self.reporter,
                probe,
                &related,
                &of_class,
                multi_root,
            )?;
            self.reporter.info(format!(
                "{} Interface state and traffic in {}:{}",
                label,
                probe.domain(),
                pass_fail(ok)
            ));
            pass &= ok;
        }
        Ok(pass)
    }

    fn dump_listing(&self, probe: &dyn IoDomainProbe) {
        match probe.hotplug_listing() {
            Ok(listing) => self.reporter.info(format!(
                "The status of the vf in the io domain {}:\n{}",
                probe.domain(),
                listing
            )),
            Err(e) => self
                .reporter
                .warn(format!("Failed to get hotplug list after ior active: {}", e)),
        }
    }

    fn root_active(&self, root: &str) -> IorResult<bool> {
        let status = self.control.domain_status(root)?;
        if status != "active" {
            self.reporter.error(format!(
                "Failed to boot root domain {} up in the ior test ({})",
                root, status
            ));
            return Ok(false);
        }
        Ok(true)
    }

    fn check_live(
        &self,
        inventory: &Inventory,
        probe: &dyn IoDomainProbe,
        root: &FaultRequest,
        signal: &CoordinationSignal,
        deadline: Option<Instant>,
    ) -> IorResult<Verdict> {
        let iod = probe.domain();
        let root_name = root.target.name();
        let test_vfs = inventory.test_vfs(&[root_name], iod)?;
        let all_vfs = inventory.vfs_in_io_domain(iod);
        let fc_only = test_vfs
            .values()
            .all(|r| r.class() == DeviceClass::FibreChannel);
        debug!("Test VFs in {}: {:?}", iod, test_vfs.keys());

        let mut state = PollState::Baseline;
        let mut remaining = root.count;
        let mut tally = Tally::default();

        while signal.is_set() {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(IorError::Stalled {
                    waited_secs: self.timing.overall_timeout.map_or(0, |d| d.as_secs()),
                });
            }

            if state != PollState::Recovered {
                let snapshot = probe.hotplug_statuses(&test_vfs)?;
                let (observation, summary) = observe(&snapshot, &test_vfs);
                self.reporter.info(format!(
                    "Root domain {} {}ing: status of vf in io domain {}: {}",
                    root_name, root.kind, iod, summary
                ));

                let t = transition(state, observation, remaining);
                if t.next != state {
                    debug!("{}: {:?} -> {:?}", iod, state, t.next);
                }
                state = t.next;

                match t.action {
                    Action::None => {}
                    Action::DeepCheckDuring => {
                        self.reporter
                            .info(format!("VF in io domain {} changed to {}", iod, summary));
                        if !self.deep_check(probe, &test_vfs, false)? {
                            tally.during_failed = true;
                        }
                    }
                    Action::DeepCheckAfter { again } => {
                        self.reporter
                            .info(format!("VF in io domain {} changed back {}", iod, summary));
                        thread::sleep(self.timing.changed_back_settle);
                        let vfs = if fc_only { &all_vfs } else { &test_vfs };
                        if !self.deep_check(probe, vfs, false)? {
                            tally.after_failed = true;
                        }
                        if again {
                            remaining -= 1;
                            thread::sleep(self.timing.next_round_pause);
                            self.reporter.info(format!(
                                "Wait {:?} and begin the next loop test",
                                self.timing.next_round_pause
                            ));
                        } else {
                            info!("Waiting for root domain {} to boot up", root_name);
                            self.wait_clear(signal, deadline)?;
                        }
                    }
                    Action::MixOfflineCheck => {
                        tally.mix_offline = true;
                        self.reporter
                            .info(format!("VF in io domain {} changed to {}", iod, summary));
                        let related = probe.related_status(&all_vfs)?;
                        let hotplug_ok =
                            checks::hotplug_matches_baseline(&self.reporter, &related, &all_vfs);
                        self.reporter.info(format!(
                            "hotplug status in io domain {}:{}",
                            iod,
                            pass_fail(hotplug_ok)
                        ));
                        let disk_ok = checks::disk_and_io(
                            &self.reporter,
                            probe,
                            &related,
                            &all_vfs,
                            false,
                        )?;
                        self.reporter.info(format!(
                            "Logical_path and I/O in io domain {}:{}",
                            iod,
                            pass_fail(disk_ok)
                        ));
                        tally.hotplug_failed |= !hotplug_ok;
                        tally.after_failed |= !disk_ok;
                        if !(hotplug_ok && disk_ok) {
                            info!("Waiting for root domain {} to boot up", root_name);
                            self.wait_clear(signal, deadline)?;
                        }
                    }
                }
            }

            if signal.is_set() {
                thread::sleep(self.timing.poll_period);
            }
        }

        if !self.root_active(root_name)? {
            return Ok(Verdict::Unresolved);
        }
        match state {
            PollState::Baseline => {
                self.reporter.error(format!(
                    "VF in io domain {} is not changed during {} {}",
                    iod, root.kind, root_name
                ));
                self.dump_listing(probe);
                return Ok(Verdict::Fail);
            }
            PollState::Disrupted if tally.mix_offline && !tally.hotplug_failed => {}
            PollState::Disrupted => {
                self.reporter.error(format!(
                    "VF in io domain [{}] is not changed back during {} [{}]",
                    iod, root.kind, root_name
                ));
                if !tally.mix_offline {
                    self.dump_listing(probe);
                }
                return Ok(Verdict::Fail);
            }
            PollState::Recovered => {}
        }
        if tally.during_failed {
            self.reporter
                .error("Deep checks failed during root domain interruption");
            return Ok(Verdict::Fail);
        }
        if tally.after_failed {
            self.reporter
                .error("Deep checks failed after VF changed back ONLINE");
            return Ok(Verdict::Fail);
        }
        Ok(Verdict::Pass)
    }

    fn check_after(
        &self,
        inventory: &Inventory,
        iods: &[&dyn IoDomainProbe],
        roots: &[FaultRequest],
    ) -> IorResult<Verdict> {
        let multi_root = roots.len() > 1;
        let mut hotplug_failures = 0;
        let mut disk_failures = 0;

        for probe in iods {
            let iod = probe.domain();
            let all_vfs = inventory.vfs_in_io_domain(iod);
            self.reporter
                .info(format!("Getting all ior related information of io domain {}...", iod));
            let related = probe.related_status(&all_vfs)?;

            if checks::hotplug_matches_baseline(&self.reporter, &related, &all_vfs) {
                self.reporter.info(format!(
                    "VFs status in io domain {} are all back ONLINE after interruption of root domain:Pass",
                    iod
                ));
            } else {
                self.reporter.error(format!(
                    "VFs status in io domain {} are not all back ONLINE after interruption of root domain:Fail",
                    iod
                ));
                self.dump_listing(*probe);
                hotplug_failures += 1;
            }

            let disk_ok = checks::disk_and_io(&self.reporter, *probe, &related, &all_vfs, multi_root)?;
            self.reporter.info(format!(
                "Logical_path and I/O in io domain {}:{}",
                iod,
                pass_fail(disk_ok)
            ));
            if !disk_ok {
                disk_failures += 1;
            }
        }

        for root in roots {
            if !self.root_active(root.target.name())? {
                return Ok(Verdict::Unresolved);
            }
        }
        if hotplug_failures > 0 {
            self.reporter.error(format!(
                "VFs in {} io domains are not changed back",
                hotplug_failures
            ));
            return Ok(Verdict::Fail);
        }
        if disk_failures > 0 {
            self.reporter.error(format!(
                "Disk or I/O workload failed in {} io domains",
                disk_failures
            ));
            return Ok(Verdict::Fail);
        }
        Ok(Verdict::Pass)
    }

    /// Runs a whole test case: starts one fault thread per root domain,
    /// judges the I/O domains and never fails, errors become
    /// [`Verdict::Unresolved`].
    pub fn run_fault_case<D: Disrupt + 'static>(
        &self,
        inventory: &Inventory,
        iods: &[&dyn IoDomainProbe],
        faults: Vec<(D, FaultRequest)>,
    ) -> Verdict {
        let roots: Vec<FaultRequest> = faults.iter().map(|(_d, r)| r.clone()).collect();
        let live = faults.len() == 1 && iods.len() == 1;
        let signal = CoordinationSignal::new();
        let mut handles = Vec::new();

        for (disruptor, request) in faults {
            let own = if live {
                signal.clone()
            } else {
                CoordinationSignal::new()
            };
            let target = request.target.name().to_string();
            match spawn_fault_thread(
                disruptor,
                request,
                &own,
                self.reporter.clone(),
                self.timing.recovery_grace,
            ) {
                Ok(h) => handles.push((target, h)),
                Err(e) => {
                    self.reporter
                        .error_chain(&format!("Unable to start fault thread for {}", target), &e);
                    self.join(handles);
                    return Verdict::Unresolved;
                }
            }
        }

        if !live {
            self.join(std::mem::take(&mut handles));
        }

        let verdict = match self.check_ior_in_domain(inventory, iods, &roots, &signal) {
            Ok(v) => v,
            Err(IorError::Stalled { waited_secs }) => {
                self.reporter.error(format!(
                    "Fault thread still running after {} s, waiting for it to end before giving up",
                    waited_secs
                ));
                Verdict::Unresolved
            }
            Err(e) => {
                self.reporter.error_chain("Unable to complete the test", &e);
                Verdict::Unresolved
            }
        };
        self.join(handles);
        self.reporter.info(format!("Test case verdict: {}", verdict));
        verdict
    }

    fn join(&self, handles: Vec<(String, thread::JoinHandle<FaultOutcome>)>) {
        for (target, handle) in handles {
            if handle.join().is_err() {
                self.reporter
                    .error(format!("Fault thread for {} panicked", target));
            }
        }
    }
}
