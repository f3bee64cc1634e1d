// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use ior::config::{Config, DomainCredential, Timing};
use ior::coordinator::{Coordinator, Verdict};
use ior::error::{chain, IorError, IorResult};
use ior::executor::{Exec, Remote};
use ior::fault::{Disrupt, FaultInjector, FaultKind, FaultRequest};
use ior::inventory::Inventory;
use ior::local::{DomainControl, Ldm};
use ior::probe::{IoDomainProbe, LdomProbe};
use ior::report::{Reporter, Transcript};
use ior::session::{Connector, Endpoint, Needle, PtyConnector};
use ior::vf::VfExtra;

#[derive(Parser)]
#[command(name = "ior")]
#[command(about = "Fault injection for I/O-domain redundancy on logical domains")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command on a domain
    Exec {
        /// Environment key naming the domain, its password is in <KEY>_PASSWORD
        #[arg(short, long, default_value = "IOD")]
        target: String,

        /// Log in over ssh instead of the domain console
        #[arg(long)]
        ssh: bool,

        /// Print the command's output
        #[arg(short, long)]
        capture: bool,

        /// Print only the first non-empty output line
        #[arg(long, conflicts_with = "capture")]
        one_line: bool,

        /// Don't verify the exit status
        #[arg(long)]
        no_check: bool,

        /// Completion marker instead of the shell prompt
        #[arg(short, long)]
        expect: Option<String>,

        /// Seconds to wait for the completion marker
        #[arg(long)]
        timeout: Option<u64>,

        command: String,
    },

    /// Reboot or panic a domain
    Fault {
        #[arg(short, long, default_value = "NPRD_A")]
        target: String,

        kind: FaultKind,

        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },

    /// Fault root domains and judge how their I/O domains cope
    Check {
        /// Root domain key, once per root domain to fault
        #[arg(short, long = "root", default_value = "NPRD_A")]
        roots: Vec<String>,

        /// Fault for each root domain; a single one applies to all
        #[arg(short, long = "kind", default_value = "reboot")]
        kinds: Vec<FaultKind>,

        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// I/O domain key, once per I/O domain to watch
        #[arg(short, long = "iod", default_value = "IOD")]
        iods: Vec<String>,

        /// Watch I/O domains over ssh instead of their consoles
        #[arg(long)]
        ssh: bool,
    },

    /// Print the VF inventory
    Inventory,

    /// Take a VF offline or bring it back online in its I/O domain
    Vf {
        action: VfAction,

        /// VF name as listed by `ior inventory`
        vf: String,

        #[arg(short, long, default_value = "IOD")]
        iod: String,

        #[arg(long)]
        ssh: bool,
    },

    /// Re-read the FC VFs of an I/O domain into the inventory
    Refresh {
        #[arg(short, long, default_value = "IOD")]
        iod: String,

        #[arg(long)]
        ssh: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum VfAction {
    Offline,
    Online,
}

fn endpoint(control: &dyn DomainControl, key: &str, ssh: bool) -> IorResult<Endpoint> {
    let cred = DomainCredential::from_env(key)?;
    if ssh {
        Ok(Endpoint::ssh(&cred.name, &cred.password))
    } else {
        let port = control.console_port(&cred.name)?;
        Ok(Endpoint::console(&cred.name, &cred.password, port))
    }
}

struct Harness {
    config: Config,
    connector: Arc<dyn Connector>,
    control: Arc<Ldm>,
}

impl Harness {
    fn new() -> IorResult<Harness> {
        let config = Config::from_env()?;
        let connector = Arc::new(PtyConnector::new(
            Transcript::at(&config.transcript),
            &config.timing,
        ));
        Ok(Harness {
            config,
            connector,
            control: Arc::new(Ldm),
        })
    }

    fn timing(&self) -> &Timing {
        &self.config.timing
    }

    fn remote(&self, key: &str, ssh: bool) -> IorResult<Remote> {
        Ok(Remote::new(
            endpoint(self.control.as_ref(), key, ssh)?,
            self.connector.clone(),
            self.timing().clone(),
        ))
    }

    fn reporter(&self) -> IorResult<Reporter> {
        match &self.config.report {
            Some(path) => Ok(Reporter::new(path)?),
            None => Ok(Reporter::console()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn exec(
    target: &str,
    ssh: bool,
    capture: bool,
    one_line: bool,
    no_check: bool,
    expect: Option<String>,
    timeout: Option<u64>,
    command: &str,
) -> IorResult<i32> {
    let harness = Harness::new()?;
    let remote = harness.remote(target, ssh)?;

    let mut e = Exec::new(command);
    if let Some(marker) = &expect {
        e = e.expect(Needle::literal(marker));
    }
    if let Some(secs) = timeout {
        e = e.timeout(Duration::from_secs(secs));
    }
    if no_check {
        e = e.no_check();
    }

    if one_line {
        println!("{}", remote.retsend_one_line(&e)?);
    } else if capture {
        println!("{}", remote.retsend(&e)?);
    } else {
        remote.send_command(&e)?;
    }
    Ok(0)
}

fn fault(target: &str, kind: FaultKind, count: usize) -> IorResult<i32> {
    let harness = Harness::new()?;
    let injector = FaultInjector::new(harness.remote(target, false)?, &harness.config.tmp_path);
    injector.disrupt(kind, count, harness.timing().fault)?;

    let root = LdomProbe::new(harness.remote(target, false)?, &harness.config.tmp_path);
    if root.check_domain_boot_up(harness.control.as_ref())? {
        info!("{} is back up", root.domain());
        Ok(0)
    } else {
        warn!("{} did not come back after {}", root.domain(), kind);
        Ok(Verdict::Unresolved.exit_code())
    }
}

fn check(
    roots: &[String],
    kinds: &[FaultKind],
    count: usize,
    iods: &[String],
    ssh: bool,
) -> IorResult<i32> {
    let harness = Harness::new()?;
    let reporter = Arc::new(harness.reporter()?);
    let inventory = Inventory::load(&harness.config.vfs_info)?;

    let mut faults = Vec::new();
    for (i, key) in roots.iter().enumerate() {
        let kind = kinds
            .get(i)
            .or_else(|| kinds.first())
            .copied()
            .unwrap_or(FaultKind::Reboot);
        let remote = harness.remote(key, false)?;
        let request = FaultRequest {
            target: remote.endpoint().clone(),
            kind,
            count,
            timeout: harness.timing().fault,
        };
        faults.push((FaultInjector::new(remote, &harness.config.tmp_path), request));
    }

    let mut probes = Vec::new();
    for key in iods {
        probes.push(LdomProbe::new(harness.remote(key, ssh)?, &harness.config.tmp_path));
    }
    let probes: Vec<&dyn IoDomainProbe> = probes.iter().map(|p| p as &dyn IoDomainProbe).collect();

    let coordinator = Coordinator::new(reporter, harness.control.clone(), harness.timing().clone());
    let verdict = coordinator.run_fault_case(&inventory, &probes, faults);
    println!("{}", verdict);
    Ok(verdict.exit_code())
}

fn inventory() -> IorResult<i32> {
    let config = Config::from_env()?;
    let inventory = Inventory::load(&config.vfs_info)?;
    for root in inventory.root_domains() {
        println!("{}", root);
        for (pf, function) in inventory.pfs(root).into_iter().flatten() {
            println!("  {} ({})", pf, function.class);
            for (vf, record) in &function.vfs {
                println!(
                    "    {} -> {} [{} {}] {}",
                    vf, record.io_domain, record.hotplug_path, record.hotplug_port, record.hotplug_status
                );
            }
        }
    }
    Ok(0)
}

fn vf(action: VfAction, name: &str, iod: &str, ssh: bool) -> IorResult<i32> {
    let harness = Harness::new()?;
    let inventory = Inventory::load(&harness.config.vfs_info)?;
    let record = inventory
        .get(name)
        .ok_or_else(|| IorError::UnknownVf { vf: name.into() })?;

    let probe = LdomProbe::new(harness.remote(iod, ssh)?, &harness.config.tmp_path);
    match action {
        VfAction::Offline => probe.offline_vf(record)?,
        VfAction::Online => probe.online_vf(record)?,
    }
    Ok(0)
}

fn refresh(iod: &str, ssh: bool) -> IorResult<i32> {
    let harness = Harness::new()?;
    let mut inventory = Inventory::load(&harness.config.vfs_info)?;
    let probe = LdomProbe::new(harness.remote(iod, ssh)?, &harness.config.tmp_path);

    let mut fc_vfs = Vec::new();
    for root in inventory.root_domains() {
        for (pf, function) in inventory.pfs(root).into_iter().flatten() {
            for (vf, record) in &function.vfs {
                if record.io_domain != probe.domain() {
                    continue;
                }
                if let VfExtra::Fc(fc) = &record.extra {
                    fc_vfs.push((
                        root.to_string(),
                        pf.clone(),
                        vf.clone(),
                        record.alias.clone(),
                        fc.port_wwn.clone(),
                    ));
                }
            }
        }
    }

    for (root, pf, vf, alias, port_wwn) in fc_vfs {
        let dev = harness.control.hotplug_dev(&alias)?;
        let record = probe.describe_fc_vf(&alias, &dev, &port_wwn)?;
        info!("{}: {} [{} {}] {}", vf, dev, record.hotplug_path, record.hotplug_port, record.hotplug_status);
        inventory.insert(&root, &pf, &vf, record);
    }
    inventory.save(&harness.config.vfs_info)?;
    Ok(0)
}

fn run(cli: Cli) -> IorResult<i32> {
    match cli.command {
        Commands::Exec {
            target,
            ssh,
            capture,
            one_line,
            no_check,
            expect,
            timeout,
            command,
        } => exec(&target, ssh, capture, one_line, no_check, expect, timeout, &command),
        Commands::Fault {
            target,
            kind,
            count,
        } => fault(&target, kind, count),
        Commands::Check {
            roots,
            kinds,
            count,
            iods,
            ssh,
        } => check(&roots, &kinds, count, &iods, ssh),
        Commands::Inventory => inventory(),
        Commands::Vf {
            action,
            vf: name,
            iod,
            ssh,
        } => vf(action, &name, &iod, ssh),
        Commands::Refresh { iod, ssh } => refresh(&iod, ssh),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", chain(&e));
            Verdict::Unresolved.exit_code()
        }
    };
    std::process::exit(code);
}
