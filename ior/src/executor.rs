// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Running commands on remote domains.
//!
//! Every call logs in, runs exactly one command (plus the exit-status query)
//! and closes its session again. Nothing is reused between calls, so a domain
//! that went down in between only affects the call that hits it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::config::Timing;
use crate::error::{ExecuteError, LoginError, ReturnError};
use crate::session::{Channel, Connector, Endpoint, Needle, Session, SHELL_PROMPT};

/// Matches a command's exit status printed on its own line.
const EXIT_STATUS: &str = r"\d+\r?\n";
const QUERY_STATUS: &str = "echo $?";

/// One command and how to tell it finished.
#[derive(Clone, Debug)]
pub struct Exec<'a> {
    command: &'a str,
    /// Completion marker, the root shell prompt if not set.
    expect: Option<Needle>,
    /// Wait for the marker, the configured command timeout if not set.
    timeout: Option<Duration>,
    /// Verify the exit status through `echo $?`.
    check: bool,
}

impl<'a> Exec<'a> {
    pub fn new(command: &'a str) -> Exec<'a> {
        Exec {
            command,
            expect: None,
            timeout: None,
            check: true,
        }
    }

    pub fn expect(mut self, needle: Needle) -> Exec<'a> {
        self.expect = Some(needle);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Exec<'a> {
        self.timeout = Some(timeout);
        self
    }

    /// Don't query the exit status, e.g. when the command takes the shell down.
    pub fn no_check(mut self) -> Exec<'a> {
        self.check = false;
        self
    }

    pub fn command(&self) -> &str {
        self.command
    }
}

enum Failure {
    Login(LoginError),
    Marker(String),
    Status(String),
}

impl Failure {
    fn execute(self, command: &str, target: &str) -> ExecuteError {
        match self {
            Failure::Login(e) => ExecuteError::Login { source: e },
            Failure::Marker(reason) => ExecuteError::Marker {
                command: command.to_string(),
                target: target.to_string(),
                reason,
            },
            Failure::Status(status) => ExecuteError::ExitStatus {
                command: command.to_string(),
                target: target.to_string(),
                status,
            },
        }
    }

    fn capture(self, command: &str, target: &str) -> ReturnError {
        match self {
            Failure::Login(e) => ReturnError::Login { source: e },
            Failure::Marker(reason) => ReturnError::Marker {
                command: command.to_string(),
                target: target.to_string(),
                reason,
            },
            Failure::Status(status) => ReturnError::ExitStatus {
                command: command.to_string(),
                target: target.to_string(),
                status,
            },
        }
    }
}

fn marker<E: std::fmt::Display>(e: E) -> Failure {
    Failure::Marker(e.to_string())
}

/// Removes the line terminators a terminal wraps around command output.
fn clean_output(before: &str) -> String {
    before
        .trim_matches(|c| c == '\r' || c == '\n')
        .replace("\r\n", "\n")
}

/// Executes commands on one endpoint.
#[derive(Clone)]
pub struct Remote {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    timing: Timing,
}

impl Remote {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, timing: Timing) -> Remote {
        Remote {
            endpoint,
            connector,
            timing,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Prompt of this endpoint's user, `root@<host>:~#` for root.
    fn user_prompt(&self) -> Needle {
        Needle::regex(&format!(r"{}@\S*:~#", regex::escape(self.endpoint.user())))
    }

    fn dialogue<T, F>(&self, exec: &Exec, body: F) -> Result<T, Failure>
    where
        F: FnOnce(&mut dyn Channel, Duration) -> Result<T, Failure>,
    {
        let timeout = exec.timeout.unwrap_or(self.timing.command);
        let mut session = Session::login(
            self.connector.as_ref(),
            &self.endpoint,
            self.endpoint.login_timeout(&self.timing),
        )
        .map_err(Failure::Login)?;

        trace!("{} <- {}", self.endpoint, exec.command);
        let r = body(session.channel(), timeout);
        session.close();
        thread::sleep(self.timing.settle);
        r
    }

    fn exit_status(ch: &mut dyn Channel, timeout: Duration) -> Result<(), Failure> {
        ch.send_line(QUERY_STATUS).map_err(marker)?;
        ch.expect(&[Needle::literal(QUERY_STATUS)], timeout)
            .map_err(|e| Failure::Status(format!("unknown, {}", e)))?;
        let found = ch
            .expect(&[Needle::regex(EXIT_STATUS)], timeout)
            .map_err(|e| Failure::Status(format!("unknown, {}", e)))?;
        match found.matched.trim() {
            "0" => Ok(()),
            status => Err(Failure::Status(status.to_string())),
        }
    }

    /// Runs a command and waits for its completion marker.
    pub fn send_command(&self, exec: &Exec) -> Result<(), ExecuteError> {
        let needle = exec
            .expect
            .clone()
            .unwrap_or_else(|| Needle::literal(SHELL_PROMPT));

        self.dialogue(exec, |ch, timeout| {
            ch.send_line(exec.command).map_err(marker)?;
            ch.expect(&[Needle::literal(exec.command)], timeout)
                .map_err(marker)?;
            ch.expect(&[needle], timeout).map_err(marker)?;
            if exec.check {
                Remote::exit_status(ch, timeout)?;
            }
            Ok(())
        })
        .map_err(|f| f.execute(exec.command, self.endpoint.name()))?;

        debug!("Executed [{}] in {}", exec.command, self.endpoint);
        Ok(())
    }

    /// Runs a command and returns what it printed.
    pub fn retsend(&self, exec: &Exec) -> Result<String, ReturnError> {
        let needle = exec.expect.clone().unwrap_or_else(|| self.user_prompt());

        self.dialogue(exec, |ch, timeout| {
            ch.send_line(exec.command).map_err(marker)?;
            ch.expect(&[Needle::literal(exec.command)], timeout)
                .map_err(marker)?;
            let found = ch.expect(&[needle], timeout).map_err(marker)?;
            let output = clean_output(&found.before);
            if exec.check {
                Remote::exit_status(ch, timeout)?;
            }
            Ok(output)
        })
        .map_err(|f| f.capture(exec.command, self.endpoint.name()))
    }

    /// Runs a command twice and returns the first non-empty line of the
    /// second run. Only for idempotent, read-only commands.
    pub fn retsend_one_line(&self, exec: &Exec) -> Result<String, ReturnError> {
        let needle = exec
            .expect
            .clone()
            .unwrap_or_else(|| Needle::literal(SHELL_PROMPT));

        self.dialogue(exec, |ch, timeout| {
            ch.send_line(exec.command).map_err(marker)?;
            ch.expect(&[Needle::literal(exec.command)], timeout)
                .map_err(marker)?;
            ch.expect(&[needle.clone()], timeout).map_err(marker)?;
            if exec.check {
                Remote::exit_status(ch, timeout)?;
            }

            ch.send_line(exec.command).map_err(marker)?;
            ch.expect(&[Needle::literal(exec.command)], timeout)
                .map_err(marker)?;
            let line_or_prompt = [Needle::regex(r"\r?\n"), needle];
            loop {
                let found = ch.expect(&line_or_prompt, timeout).map_err(marker)?;
                let line = found.before.trim();
                if !line.is_empty() || found.index == 1 {
                    return Ok(line.to_string());
                }
            }
        })
        .map_err(|f| f.capture(exec.command, self.endpoint.name()))
    }

    pub fn run(&self, command: &str) -> Result<(), ExecuteError> {
        self.send_command(&Exec::new(command))
    }

    pub fn output(&self, command: &str) -> Result<String, ReturnError> {
        self.retsend(&Exec::new(command))
    }

    /// Output of `command`, or `None` when it exits non-zero (e.g. a `grep`
    /// without matches).
    pub fn output_opt(&self, command: &str) -> Result<Option<String>, ReturnError> {
        match self.retsend(&Exec::new(command)) {
            Ok(output) => Ok(Some(output)),
            Err(e) if e.is_exit_status() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether `command` exits zero. Session failures are still errors.
    pub fn probe(&self, command: &str) -> Result<bool, ExecuteError> {
        match self.send_command(&Exec::new(command)) {
            Ok(()) => Ok(true),
            Err(e) if e.is_exit_status() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Peer, ScriptedConnector};

    fn logged_in() -> Peer {
        Peer::new()
            .print("Password: ")
            .wait("pw\n")
            .print("Last login: Mon\r\nroot@fc-iod1:~# ")
    }

    fn scripted(peers: Vec<Peer>) -> (Remote, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new(peers));
        let timing = Timing::default()
            .settle(Duration::ZERO)
            .command(Duration::from_millis(20));
        let remote = Remote::new(Endpoint::ssh("fc-iod1", "pw"), connector.clone(), timing);
        (remote, connector)
    }

    fn runs(peer: Peer, command: &str, output: &str, status: &str) -> Peer {
        peer.wait(command)
            .print(&format!("{}\r\n{}root@fc-iod1:~# ", command, output))
            .wait("echo $?")
            .print(&format!("echo $?\r\n{}\r\nroot@fc-iod1:~# ", status))
    }

    #[test]
    fn send_command_checks_status() {
        let peer = runs(logged_in(), "hotplug offline /pci@380 pci.0,2", "", "0");
        let (remote, connector) = scripted(vec![peer]);
        remote
            .run("hotplug offline /pci@380 pci.0,2")
            .expect("command should succeed");
        assert_eq!(connector.closes(), 1);
    }

    #[test]
    fn send_command_non_zero_status() {
        let peer = runs(logged_in(), "false", "", "1");
        let (remote, _c) = scripted(vec![peer]);
        match remote.run("false") {
            Err(ExecuteError::ExitStatus { status, target, .. }) => {
                assert_eq!(status, "1");
                assert_eq!(target, "fc-iod1");
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn send_command_without_check_sends_no_query() {
        let peer = logged_in()
            .wait("reboot")
            .print("reboot\r\nsyncing file systems... done\r\nrebooting...\r\nfc-iod1 console login: ");
        let (remote, connector) = scripted(vec![peer]);
        remote
            .send_command(
                &Exec::new("reboot")
                    .expect(Needle::literal("console login:"))
                    .no_check(),
            )
            .unwrap();
        assert_eq!(connector.sent(0), vec!["pw\n", "reboot\n"]);
    }

    #[test]
    fn marker_in_the_echo_does_not_complete_the_command() {
        let cmd = "sleep 5; echo finished";
        let peer = logged_in().wait(cmd).print(&format!("{}\r\n", cmd));
        let (remote, _c) = scripted(vec![peer]);
        let r = remote.send_command(
            &Exec::new(cmd)
                .expect(Needle::literal("finished"))
                .no_check(),
        );
        assert!(matches!(r, Err(ExecuteError::Marker { .. })));

        let done = logged_in()
            .wait(cmd)
            .print(&format!("{}\r\nfinished\r\nroot@fc-iod1:~# ", cmd));
        let (remote, _c) = scripted(vec![done]);
        remote
            .send_command(
                &Exec::new(cmd)
                    .expect(Needle::literal("finished"))
                    .no_check(),
            )
            .unwrap();
    }

    #[test]
    fn one_line_first_run_waits_past_the_echo() {
        let cmd = "echo root@fc-iod1:~#";
        let peer = logged_in().wait(cmd).print(&format!("{}\r\n", cmd));
        let (remote, connector) = scripted(vec![peer]);
        let r = remote.retsend_one_line(&Exec::new(cmd).expect(Needle::literal("root@fc-iod1:~#")));
        assert!(matches!(r, Err(ReturnError::Marker { .. })));
        // No status query while the first run is still going.
        assert_eq!(connector.sent(0), vec!["pw\n".to_string(), format!("{}\n", cmd)]);
    }

    #[test]
    fn missing_marker_is_execution_failure() {
        let peer = logged_in().wait("sleep 100").print("sleep 100\r\n");
        let (remote, _c) = scripted(vec![peer]);
        match remote.run("sleep 100") {
            Err(ExecuteError::Marker { command, .. }) => assert_eq!(command, "sleep 100"),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn login_failure_propagates() {
        let peer = Peer::new().print("Password: ").hang_up();
        let (remote, _c) = scripted(vec![peer]);
        assert_eq!(
            remote.run("true"),
            Err(ExecuteError::Login {
                source: LoginError::Eof {
                    target: "fc-iod1".into()
                }
            })
        );
    }

    #[test]
    fn retsend_strips_echo_and_newlines() {
        let peer = runs(
            logged_in(),
            "fcinfo hba-port | grep HBA",
            "HBA Port WWN: 10000090fa1c4e36\r\nHBA Port WWN: 10000090fa1c4e37\r\n",
            "0",
        );
        let (remote, _c) = scripted(vec![peer]);
        let out = remote.output("fcinfo hba-port | grep HBA").unwrap();
        assert_eq!(
            out,
            "HBA Port WWN: 10000090fa1c4e36\nHBA Port WWN: 10000090fa1c4e37"
        );
    }

    #[test]
    fn output_opt_maps_non_zero_to_none() {
        let peer = runs(logged_in(), "ls /var/crash/", "", "2");
        let (remote, _c) = scripted(vec![peer]);
        assert_eq!(remote.output_opt("ls /var/crash/"), Ok(None));
    }

    #[test]
    fn probe_distinguishes_absence_from_failure() {
        let absent = runs(logged_in(), "snoop -i /tmp/t|grep ICMP", "", "1");
        let (remote, _c) = scripted(vec![absent]);
        assert_eq!(remote.probe("snoop -i /tmp/t|grep ICMP"), Ok(false));

        let unreachable = Peer::new().print("Password: ").wait("pw").print("Password: ");
        let (remote, _c) = scripted(vec![unreachable]);
        assert!(remote.probe("snoop -i /tmp/t|grep ICMP").is_err());
    }

    #[test]
    fn retsend_one_line_takes_second_run() {
        let cmd = "echo \"log_init::dis\" | mdb -k |grep printf |wc -l";
        let peer = runs(logged_in(), cmd, "       2\r\n", "0")
            .wait(cmd)
            .print(&format!("{}\r\n       2\r\nroot@fc-iod1:~# ", cmd));
        let (remote, connector) = scripted(vec![peer]);
        assert_eq!(remote.retsend_one_line(&Exec::new(cmd)).unwrap(), "2");
        let line = format!("{}\n", cmd);
        assert_eq!(
            connector.sent(0),
            vec!["pw\n".to_string(), line.clone(), "echo $?\n".to_string(), line]
        );
    }

    #[test]
    fn every_call_uses_a_fresh_session() {
        let first = runs(logged_in(), "hostname", "fc-iod1\r\n", "0");
        let second = runs(logged_in(), "hostname", "fc-iod1\r\n", "0");
        let (remote, connector) = scripted(vec![first, second]);
        assert_eq!(remote.output("hostname").unwrap(), "fc-iod1");
        assert_eq!(remote.output("hostname").unwrap(), "fc-iod1");
        assert_eq!(connector.connections(), 2);
        assert_eq!(connector.closes(), 2);
    }
}
