// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Disrupting a root domain: reboots and kernel panics.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

use crate::error::{IorError, IorResult, LoginError};
use crate::executor::{Exec, Remote};
use crate::report::Reporter;
use crate::session::{Channel, Endpoint, Needle, CONSOLE_LOGIN, NO_WRITE_ACCESS, TAKE_WRITE_ACCESS};
use crate::signal::CoordinationSignal;

/// Counts `printf` calls in `log_init`: 2 on a non-debug kernel.
pub const KERNEL_PROBE: &str = "echo \"log_init::dis\" | mdb -k |grep printf |wc -l";
/// Zeroes `rootdir`, which panics the kernel (or drops a debug kernel into kmdb).
pub const PANIC_COMMAND: &str = "echo \"rootdir/W 0\" | mdb -kw";
pub const CRASH_DIR: &str = "/var/crash/";

/// kmdb asks `reboot, reset?`; the first letter may be lost.
const KMDB_RESET: &str = "eset?";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Reboot,
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultKind::Reboot => write!(f, "reboot"),
            FaultKind::Panic => write!(f, "panic"),
        }
    }
}

impl FromStr for FaultKind {
    type Err = IorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "reboot" => Ok(FaultKind::Reboot),
            "panic" => Ok(FaultKind::Panic),
            other => Err(IorError::Parse {
                what: "fault kind".into(),
                text: other.to_string(),
            }),
        }
    }
}

/// What to do to which root domain.
#[derive(Clone, Debug)]
pub struct FaultRequest {
    pub target: Endpoint,
    pub kind: FaultKind,
    /// Repetitions, each one waits for the domain to come back.
    pub count: usize,
    /// Wait for `console login:` after every repetition.
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelFlavor {
    Debug,
    NonDebug,
}

/// Reboots or panics one domain through its console.
pub struct FaultInjector {
    remote: Remote,
    tmp_path: PathBuf,
    crash_dir: String,
}

impl FaultInjector {
    pub fn new<P: AsRef<Path>>(remote: Remote, tmp_path: P) -> FaultInjector {
        FaultInjector {
            remote,
            tmp_path: tmp_path.as_ref().to_path_buf(),
            crash_dir: CRASH_DIR.to_string(),
        }
    }

    /// Where crash dumps end up, with a trailing `/`.
    pub fn crash_dir(mut self, dir: &str) -> FaultInjector {
        self.crash_dir = format!("{}/", dir.trim_end_matches('/'));
        self
    }

    pub fn target(&self) -> &Endpoint {
        self.remote.endpoint()
    }

    pub fn reboot(&self, count: usize, timeout: Duration) -> IorResult<()> {
        for i in 0..count {
            debug!("Rebooting {} ({}/{})", self.target(), i + 1, count);
            self.remote.send_command(
                &Exec::new("reboot")
                    .expect(Needle::literal(CONSOLE_LOGIN))
                    .timeout(timeout)
                    .no_check(),
            )?;
        }
        Ok(())
    }

    pub fn kernel_flavor(&self) -> IorResult<KernelFlavor> {
        let line = self.remote.retsend_one_line(&Exec::new(KERNEL_PROBE))?;
        let printfs = line.trim().parse::<u32>().map_err(|_e| IorError::Parse {
            what: "printf count of log_init".into(),
            text: line.clone(),
        })?;
        Ok(if printfs == 2 {
            KernelFlavor::NonDebug
        } else {
            KernelFlavor::Debug
        })
    }

    pub fn panic(&self, count: usize, timeout: Duration) -> IorResult<()> {
        let flavor = self.kernel_flavor()?;
        info!("{} runs a {:?} kernel", self.target(), flavor);
        for i in 0..count {
            debug!("Panicking {} ({}/{})", self.target(), i + 1, count);
            match flavor {
                KernelFlavor::Debug => self.panic_into_kmdb(timeout)?,
                KernelFlavor::NonDebug => self.panic_and_clean_dump(timeout)?,
            }
        }
        Ok(())
    }

    /// A debug kernel stops in kmdb, which has to be told to reset on the
    /// raw console.
    fn panic_into_kmdb(&self, timeout: Duration) -> IorResult<()> {
        self.remote.send_command(
            &Exec::new(PANIC_COMMAND)
                .expect(Needle::literal("rootdir:"))
                .no_check(),
        )?;

        let target = self.target().name().to_string();
        let mut console = self
            .remote
            .connector()
            .connect(self.target())
            .map_err(|e| LoginError::on(&target, e))?;
        let r = self.reset_from_kmdb(console.as_mut(), timeout);
        console.close();
        r.map_err(|e| LoginError::on(&target, e).into())
    }

    fn reset_from_kmdb(
        &self,
        console: &mut dyn Channel,
        timeout: Duration,
    ) -> Result<(), crate::error::ChannelError> {
        console.send("\r")?;
        let mut needles = vec![Needle::literal(KMDB_RESET), Needle::literal(NO_WRITE_ACCESS)];
        loop {
            let found = console.expect(&needles, self.remote.timing().command)?;
            if found.index == 0 {
                console.send_line("r")?;
                console.expect(&[Needle::literal(CONSOLE_LOGIN)], timeout)?;
                return Ok(());
            }
            console.send(TAKE_WRITE_ACCESS)?;
            needles.truncate(1);
        }
    }

    fn crash_listing(&self) -> IorResult<String> {
        Ok(self
            .remote
            .output_opt(&format!("ls {}", self.crash_dir))?
            .unwrap_or_default())
    }

    /// Panics a non-debug kernel and removes the dump it leaves behind.
    fn panic_and_clean_dump(&self, timeout: Duration) -> IorResult<()> {
        let prev = self.crash_listing()?;
        fs::write(self.tmp_path.join("prev_crash_list"), &prev)?;

        self.remote.send_command(
            &Exec::new(PANIC_COMMAND)
                .expect(Needle::literal(CONSOLE_LOGIN))
                .timeout(timeout)
                .no_check(),
        )?;

        let post = self.crash_listing()?;
        fs::write(self.tmp_path.join("post_crash_list"), &post)?;

        match crash_artifacts_added(&prev, &post) {
            Some(dump) => {
                info!("Removing crash dump {}{} of {}", self.crash_dir, dump, self.target());
                self.remote.send_command(
                    &Exec::new(&format!("rm -rf {}{}/*", self.crash_dir, dump)).no_check(),
                )?;
            }
            None => debug!("{} left no new crash dump", self.target()),
        }
        Ok(())
    }
}

/// The first entry of the `post` crash listing that `prev` did not have.
pub fn crash_artifacts_added(prev: &str, post: &str) -> Option<String> {
    let before: HashSet<&str> = prev.split_whitespace().collect();
    post.split_whitespace()
        .find(|entry| !before.contains(entry))
        .map(str::to_string)
}

/// Something that can take a root domain down.
pub trait Disrupt: Send {
    fn disrupt(&self, kind: FaultKind, count: usize, timeout: Duration) -> IorResult<()>;
}

impl Disrupt for FaultInjector {
    fn disrupt(&self, kind: FaultKind, count: usize, timeout: Duration) -> IorResult<()> {
        match kind {
            FaultKind::Reboot => self.reboot(count, timeout),
            FaultKind::Panic => self.panic(count, timeout),
        }
    }
}

impl<F> Disrupt for F
where
    F: Fn(FaultKind, usize, Duration) -> IorResult<()> + Send,
{
    fn disrupt(&self, kind: FaultKind, count: usize, timeout: Duration) -> IorResult<()> {
        self(kind, count, timeout)
    }
}

pub type FaultOutcome = IorResult<()>;

/// Runs `request` on its own thread while `signal` is raised.
///
/// Returns once the thread has raised the signal. The signal is cleared when
/// the thread ends, whether the fault succeeded, failed or panicked. After a
/// successful fault the thread keeps the signal up for another `grace`, the
/// VFs of some platforms are still offline when the root domain is back.
pub fn spawn_fault_thread<D: Disrupt + 'static>(
    disruptor: D,
    request: FaultRequest,
    signal: &CoordinationSignal,
    reporter: Arc<Reporter>,
    grace: Duration,
) -> IorResult<JoinHandle<FaultOutcome>> {
    let (started_tx, started_rx) = mpsc::channel();
    let signal = signal.clone();
    let name = format!("Thread-{}", request.target.name());

    let handle = thread::Builder::new().name(name).spawn(move || {
        let _guard = signal.raise();
        let _r = started_tx.send(());

        let r = disruptor.disrupt(request.kind, request.count, request.timeout);
        match &r {
            Ok(()) => {
                reporter.info(format!(
                    "{} of root domain {} finished, waiting {:?} for its VFs",
                    request.kind, request.target, grace
                ));
                thread::sleep(grace);
            }
            Err(e) => reporter.error_chain(
                &format!("Failed to {} root domain {}", request.kind, request.target),
                e,
            ),
        }
        r
    })?;

    // A closed channel means the thread is already gone, and so is its signal.
    let _r = started_rx.recv();
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::config::Timing;
    use crate::testing::{Peer, ScriptedConnector};

    fn logged_in() -> Peer {
        Peer::new()
            .print("nprd-a console login: ")
            .wait("root\n")
            .print("Password: ")
            .wait("pw\n")
            .print("root@nprd-a:~# ")
    }

    fn injector(peers: Vec<Peer>, tmp: &Path) -> (FaultInjector, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new(peers));
        let timing = Timing::default()
            .settle(Duration::ZERO)
            .command(Duration::from_millis(50));
        let remote = Remote::new(Endpoint::console("nprd-a", "pw", 5000), connector.clone(), timing);
        (FaultInjector::new(remote, tmp), connector)
    }

    fn request(kind: FaultKind) -> FaultRequest {
        FaultRequest {
            target: Endpoint::console("nprd-a", "pw", 5000),
            kind,
            count: 1,
            timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn crash_listing_difference() {
        assert_eq!(crash_artifacts_added("0  1\r\n", "0  1  2\r\n"), Some("2".into()));
        assert_eq!(crash_artifacts_added("", "0"), Some("0".into()));
        assert_eq!(crash_artifacts_added("0 1", "1 0"), None);
        assert_eq!(crash_artifacts_added("0", ""), None);
    }

    #[test]
    fn fault_kind_strings() {
        assert_eq!("panic".parse::<FaultKind>().unwrap(), FaultKind::Panic);
        assert_eq!(FaultKind::Reboot.to_string(), "reboot");
        assert!("halt".parse::<FaultKind>().is_err());
    }

    #[test]
    fn reboot_waits_for_console_login_each_time() {
        let tmp = tempfile::tempdir().unwrap();
        let rebooted = |p: Peer| p.wait("reboot").print("reboot\r\nrebooting...\r\nnprd-a console login: ");
        let (inj, connector) = injector(vec![rebooted(logged_in()), rebooted(logged_in())], tmp.path());
        inj.reboot(2, Duration::from_millis(50)).unwrap();
        assert_eq!(connector.connections(), 2);
        assert_eq!(connector.sent(1), vec!["\r", "root\n", "pw\n", "reboot\n"]);
    }

    #[test]
    fn reboot_that_never_returns() {
        let tmp = tempfile::tempdir().unwrap();
        let hung = logged_in().wait("reboot").print("reboot\r\nsyncing file systems...");
        let (inj, _c) = injector(vec![hung], tmp.path());
        assert!(matches!(
            inj.reboot(1, Duration::from_millis(30)),
            Err(IorError::Execute { .. })
        ));
    }

    #[test]
    fn debug_kernel_is_reset_from_kmdb() {
        let tmp = tempfile::tempdir().unwrap();
        let probe = logged_in()
            .wait(KERNEL_PROBE)
            .print(&format!("{}\r\n       3\r\nroot@nprd-a:~# ", KERNEL_PROBE))
            .wait("echo $?")
            .print("echo $?\r\n0\r\nroot@nprd-a:~# ")
            .wait(KERNEL_PROBE)
            .print(&format!("{}\r\n       3\r\nroot@nprd-a:~# ", KERNEL_PROBE));
        let panic = logged_in()
            .wait(PANIC_COMMAND)
            .print(&format!("{}\r\nrootdir:        0xfffffffffbc39d18 = 0x0\r\n", PANIC_COMMAND));
        let console = Peer::new()
            .print("You do not have write access\r\n")
            .wait("~wy\r")
            .print("\r\npanic[cpu0]/thread=2a1: BAD TRAP\r\nreboot, reset? ")
            .wait("r\n")
            .print("resetting...\r\nnprd-a console login: ");

        let (inj, connector) = injector(vec![probe, panic, console], tmp.path());
        assert_eq!(inj.kernel_flavor().unwrap(), KernelFlavor::Debug);
        inj.panic_into_kmdb(Duration::from_millis(50)).unwrap();
        assert_eq!(connector.sent(2), vec!["\r", "~wy\r", "r\n"]);
        assert_eq!(connector.closes(), 3);
    }

    #[test]
    fn kmdb_that_never_resets_is_a_login_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let panic = logged_in()
            .wait(PANIC_COMMAND)
            .print(&format!("{}\r\nrootdir:        0x0\r\n", PANIC_COMMAND));
        let console = Peer::new().print("\r\n").hang_up();
        let (inj, _c) = injector(vec![panic, console], tmp.path());
        match inj.panic_into_kmdb(Duration::from_millis(50)) {
            Err(IorError::Login { source }) => assert_eq!(
                source,
                LoginError::Eof {
                    target: "nprd-a".into()
                }
            ),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn spawned_fault_holds_signal_until_done() {
        let signal = CoordinationSignal::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let disrupt = move |kind: FaultKind, count: usize, _t: Duration| {
            assert_eq!((kind, count), (FaultKind::Reboot, 1));
            c.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(())
        };

        let started = Instant::now();
        let handle = spawn_fault_thread(
            disrupt,
            request(FaultKind::Reboot),
            &signal,
            Arc::new(Reporter::console()),
            Duration::from_millis(10),
        )
        .unwrap();
        assert!(signal.raises() == 1);
        assert!(handle.join().unwrap().is_ok());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!signal.is_set());
        assert_eq!((signal.raises(), signal.clears()), (1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_fault_clears_signal_without_grace() {
        let signal = CoordinationSignal::new();
        let disrupt = |_k: FaultKind, _c: usize, _t: Duration| -> IorResult<()> {
            Err(IorError::UnknownDomain {
                domain: "nprd-a".into(),
            })
        };
        let started = Instant::now();
        let handle = spawn_fault_thread(
            disrupt,
            request(FaultKind::Panic),
            &signal,
            Arc::new(Reporter::console()),
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(handle.join().unwrap().is_err());
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!((signal.raises(), signal.clears()), (1, 1));
    }
}
