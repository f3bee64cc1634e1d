// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Run configuration resolved from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IorError, IorResult};

/// Transcript of every interactive session.
pub const INT_LOG: &str = "INT_LOG";
/// Scratch directory for saved listings and crash lists.
pub const TMPPATH: &str = "TMPPATH";
/// Persisted VF inventory.
pub const VFS_INFO: &str = "VFS_INFO";
/// Optional test report journal.
pub const IOR_REPORT: &str = "IOR_REPORT";

/// Every wait and pause used by the harness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Upper bound for an SSH (or spawned program) login.
    pub ssh_login: Duration,
    /// Upper bound for a console login.
    pub console_login: Duration,
    /// Default wait for a command's completion marker.
    pub command: Duration,
    /// Pause after every closed session.
    pub settle: Duration,
    /// Period of the observation loop.
    pub poll_period: Duration,
    /// Granularity while waiting for the fault thread to finish.
    pub idle: Duration,
    /// Sleep after a successful fault before the signal is cleared.
    pub recovery_grace: Duration,
    /// Pause between "status changed back" and the after-checks.
    pub changed_back_settle: Duration,
    /// Pause before observing the next fault repetition.
    pub next_round_pause: Duration,
    /// Per-repetition fault timeout (reboot/panic back to login prompt).
    pub fault: Duration,
    /// Read slice used by pty channels while waiting on a deadline.
    pub pty_poll: Duration,
    /// Give up coordination after this long. `None` waits forever.
    pub overall_timeout: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Timing {
        Timing {
            ssh_login: Duration::from_secs(60),
            console_login: Duration::from_secs(300),
            command: Duration::from_secs(60),
            settle: Duration::from_millis(200),
            poll_period: Duration::from_secs(10),
            idle: Duration::from_secs(1),
            recovery_grace: Duration::from_secs(30),
            changed_back_settle: Duration::from_secs(5),
            next_round_pause: Duration::from_secs(15),
            fault: Duration::from_secs(600),
            pty_poll: Duration::from_millis(500),
            overall_timeout: None,
        }
    }
}

impl Timing {
    /// Defaults, overridden by `IOR_POLL_SECS`, `IOR_FAULT_TIMEOUT_SECS` and
    /// `IOR_OVERALL_TIMEOUT_SECS` when set.
    pub fn from_env() -> IorResult<Timing> {
        let mut timing = Timing::default();
        if let Some(secs) = secs_from_env("IOR_POLL_SECS")? {
            timing = timing.poll_period(Duration::from_secs(secs));
        }
        if let Some(secs) = secs_from_env("IOR_FAULT_TIMEOUT_SECS")? {
            timing = timing.fault(Duration::from_secs(secs));
        }
        if let Some(secs) = secs_from_env("IOR_OVERALL_TIMEOUT_SECS")? {
            timing = timing.overall_timeout(Duration::from_secs(secs));
        }
        Ok(timing)
    }

    pub fn ssh_login(mut self, d: Duration) -> Timing {
        self.ssh_login = d;
        self
    }

    pub fn console_login(mut self, d: Duration) -> Timing {
        self.console_login = d;
        self
    }

    pub fn command(mut self, d: Duration) -> Timing {
        self.command = d;
        self
    }

    pub fn settle(mut self, d: Duration) -> Timing {
        self.settle = d;
        self
    }

    pub fn poll_period(mut self, d: Duration) -> Timing {
        self.poll_period = d;
        self
    }

    pub fn fault(mut self, d: Duration) -> Timing {
        self.fault = d;
        self
    }

    pub fn pty_poll(mut self, d: Duration) -> Timing {
        self.pty_poll = d;
        self
    }

    pub fn overall_timeout(mut self, d: Duration) -> Timing {
        self.overall_timeout = Some(d);
        self
    }

    /// Shrinks every pause to `d`, used to drive the coordinator in tests.
    pub fn compressed(d: Duration) -> Timing {
        Timing {
            settle: d,
            poll_period: d,
            idle: d,
            recovery_grace: d,
            changed_back_settle: d,
            next_round_pause: d,
            ..Default::default()
        }
    }
}

fn secs_from_env(variable: &str) -> IorResult<Option<u64>> {
    match env::var(variable) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_e| IorError::Config {
                variable: variable.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn path_from_env(variable: &str) -> IorResult<PathBuf> {
    env::var_os(variable)
        .map(PathBuf::from)
        .ok_or_else(|| IorError::Config {
            variable: variable.to_string(),
        })
}

/// Name and root password of one domain, e.g. `NPRD_A` + `NPRD_A_PASSWORD`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainCredential {
    pub name: String,
    pub password: String,
}

impl DomainCredential {
    /// Reads `<key>` and `<key>_PASSWORD`.
    pub fn from_env(key: &str) -> IorResult<DomainCredential> {
        let name = env::var(key).map_err(|_e| IorError::Config {
            variable: key.to_string(),
        })?;
        let pw_key = format!("{}_PASSWORD", key);
        let password = env::var(&pw_key).map_err(|_e| IorError::Config { variable: pw_key })?;
        Ok(DomainCredential { name, password })
    }
}

/// Everything a test run takes from its environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub transcript: PathBuf,
    pub tmp_path: PathBuf,
    pub vfs_info: PathBuf,
    pub report: Option<PathBuf>,
    pub timing: Timing,
}

impl Config {
    pub fn from_env() -> IorResult<Config> {
        Ok(Config {
            transcript: path_from_env(INT_LOG)?,
            tmp_path: path_from_env(TMPPATH)?,
            vfs_info: path_from_env(VFS_INFO)?,
            report: env::var_os(IOR_REPORT).map(PathBuf::from),
            timing: Timing::from_env()?,
        })
    }
}
