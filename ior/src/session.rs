// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interactive sessions to domains.
//!
//! A [`Connector`] opens a raw [`Channel`] (a pty running `ssh`, `telnet` or
//! any local program). [`Session::login`] then drives the login dialogue on
//! that channel until the root shell prompt shows up. Callers either get an
//! authenticated session or a [`LoginError`], never anything in between.

use std::fmt;
use std::process::Command;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use regex::Regex;
use rexpect::session::{spawn_command, PtySession};
use rexpect::reader::ReadUntil;

use crate::config::Timing;
use crate::error::{ChannelError, LoginError};
use crate::report::Transcript;

/// Shell prompt of a logged in root user.
pub const SHELL_PROMPT: &str = "~#";
/// Printed by a console once the domain is back at its login prompt.
pub const CONSOLE_LOGIN: &str = "console login:";
/// Printed by a console when another user holds write access.
pub const NO_WRITE_ACCESS: &str = "You do not have write access";
/// Console escape that forces write access.
pub const TAKE_WRITE_ACCESS: &str = "~wy\r";

/// How a channel to an endpoint is established.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    /// `ssh -l <user> <name>`
    Ssh,
    /// `telnet 0 <port>` to the domain's virtual console.
    Console { port: u16 },
    /// Any local program run through `sh -c`, e.g. a jump host wrapper.
    Spawn { program: String },
}

/// Where and how to log in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Host or domain name.
    name: String,
    /// Login user.
    username: String,
    /// Login password.
    password: String,
    transport: Transport,
}

impl Endpoint {
    pub fn ssh(name: &str, password: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            username: "root".to_string(),
            password: password.to_string(),
            transport: Transport::Ssh,
        }
    }

    pub fn console(name: &str, password: &str, port: u16) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            username: "root".to_string(),
            password: password.to_string(),
            transport: Transport::Console { port },
        }
    }

    pub fn spawned(name: &str, password: &str, program: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            username: "root".to_string(),
            password: password.to_string(),
            transport: Transport::Spawn {
                program: program.to_string(),
            },
        }
    }

    pub fn username(mut self, username: &str) -> Endpoint {
        self.username = username.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_console(&self) -> bool {
        matches!(self.transport, Transport::Console { .. })
    }

    /// How long a full login may take.
    pub fn login_timeout(&self, timing: &Timing) -> Duration {
        match self.transport {
            Transport::Console { .. } => timing.console_login,
            Transport::Ssh | Transport::Spawn { .. } => timing.ssh_login,
        }
    }

    /// The command line the channel runs, for logs and errors.
    pub fn connect_command(&self) -> String {
        match &self.transport {
            Transport::Ssh => format!("ssh -l {} {}", self.username, self.name),
            Transport::Console { port } => format!("telnet 0 {}", port),
            Transport::Spawn { program } => format!("sh -c {}", program),
        }
    }

    fn command(&self) -> Command {
        match &self.transport {
            Transport::Ssh => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-l", &self.username, &self.name]);
                cmd
            }
            Transport::Console { port } => {
                let mut cmd = Command::new("telnet");
                cmd.arg("0").arg(port.to_string());
                cmd
            }
            Transport::Spawn { program } => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(program);
                cmd
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Something to wait for on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Needle {
    Literal(String),
    /// A regular expression.
    Pattern(String),
}

impl Needle {
    pub fn literal(s: &str) -> Needle {
        Needle::Literal(s.to_string())
    }

    pub fn regex(s: &str) -> Needle {
        Needle::Pattern(s.to_string())
    }

    /// Finds the leftmost occurrence in `text` as a byte range.
    pub fn find(&self, text: &str) -> Result<Option<(usize, usize)>, ChannelError> {
        match self {
            Needle::Literal(s) => Ok(text.find(s.as_str()).map(|start| (start, start + s.len()))),
            Needle::Pattern(p) => {
                let re = Regex::new(p).map_err(|_e| ChannelError::Pattern { pattern: p.clone() })?;
                Ok(re.find(text).map(|m| (m.start(), m.end())))
            }
        }
    }

    fn read_until(&self) -> Result<ReadUntil, ChannelError> {
        match self {
            Needle::Literal(s) => Ok(ReadUntil::String(s.clone())),
            Needle::Pattern(p) => Regex::new(p)
                .map(ReadUntil::Regex)
                .map_err(|_e| ChannelError::Pattern { pattern: p.clone() }),
        }
    }
}

impl fmt::Display for Needle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Needle::Literal(s) => write!(f, "'{}'", s),
            Needle::Pattern(p) => write!(f, "/{}/", p),
        }
    }
}

/// Describes a list of needles for error messages.
pub fn describe(needles: &[Needle]) -> String {
    needles
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<String>>()
        .join(" | ")
}

/// Outcome of a successful [`Channel::expect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Found {
    /// Index of the needle that matched.
    pub index: usize,
    /// Text consumed before the match.
    pub before: String,
    /// The matched text.
    pub matched: String,
}

/// A bidirectional terminal stream.
///
/// `expect` consumes output up to and including the first match. When several
/// needles could match, the one listed first wins.
pub trait Channel {
    /// Writes `text` unmodified.
    fn send(&mut self, text: &str) -> Result<(), ChannelError>;
    /// Writes `line` followed by a newline.
    fn send_line(&mut self, line: &str) -> Result<(), ChannelError>;
    fn expect(&mut self, needles: &[Needle], timeout: Duration) -> Result<Found, ChannelError>;
    /// Consumes and returns the next line without its terminator.
    fn read_line(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        self.expect(&[Needle::regex(r"\r?\n")], timeout)
            .map(|found| found.before.trim_end_matches('\r').to_string())
    }
    /// Terminates the underlying program. Idempotent.
    fn close(&mut self);
}

/// Opens channels to endpoints.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>, ChannelError>;
}

/// Channels backed by a local pty.
pub struct PtyConnector {
    transcript: Transcript,
    poll: Duration,
}

impl PtyConnector {
    pub fn new(transcript: Transcript, timing: &Timing) -> PtyConnector {
        PtyConnector {
            transcript,
            poll: timing.pty_poll,
        }
    }
}

impl Connector for PtyConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>, ChannelError> {
        let poll_ms = self.poll.as_millis().max(1) as u64;
        debug!("Spawning `{}`", endpoint.connect_command());
        let mut session =
            spawn_command(endpoint.command(), Some(poll_ms)).map_err(|e| ChannelError::Spawn {
                command: endpoint.connect_command(),
                reason: e.to_string(),
            })?;
        session.process.set_kill_timeout(Some(1_000));

        Ok(Box::new(PtyChannel {
            session: Some(session),
            transcript: self.transcript.clone(),
        }))
    }
}

/// A [`Channel`] on top of a rexpect pty session.
///
/// rexpect fixes its read timeout when the process is spawned, so bounded
/// waits are built from repeated reads of one poll slice each.
pub struct PtyChannel {
    session: Option<PtySession>,
    transcript: Transcript,
}

impl PtyChannel {
    fn session(&mut self) -> Result<&mut PtySession, ChannelError> {
        self.session.as_mut().ok_or(ChannelError::Closed)
    }
}

impl Channel for PtyChannel {
    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        let session = self.session()?;
        let io = |e: rexpect::error::Error| ChannelError::Io {
            reason: e.to_string(),
        };
        session.send(text).map_err(io)?;
        session.flush().map_err(io)?;
        self.transcript.append(text);
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let session = self.session()?;
        session.send_line(line).map_err(|e| ChannelError::Io {
            reason: e.to_string(),
        })?;
        self.transcript.append(line);
        self.transcript.append("\n");
        Ok(())
    }

    fn expect(&mut self, needles: &[Needle], timeout: Duration) -> Result<Found, ChannelError> {
        let deadline = Instant::now() + timeout;
        let expected = describe(needles);

        loop {
            let until = needles
                .iter()
                .map(Needle::read_until)
                .collect::<Result<Vec<ReadUntil>, ChannelError>>()?;
            let r = self.session()?.exp_any(until);
            match r {
                Ok((before, matched)) => {
                    self.transcript.append(&before);
                    self.transcript.append(&matched);
                    let mut index = 0;
                    for (i, needle) in needles.iter().enumerate() {
                        if needle.find(&matched)?.is_some() {
                            index = i;
                            break;
                        }
                    }
                    trace!("matched {} with {:?}", needles[index], matched);
                    return Ok(Found {
                        index,
                        before,
                        matched,
                    });
                }
                Err(rexpect::error::Error::Timeout { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(ChannelError::Timeout {
                            expected,
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                }
                Err(rexpect::error::Error::EOF { got, .. }) => {
                    self.transcript.append(&got);
                    return Err(ChannelError::Eof { expected });
                }
                Err(e) => {
                    return Err(ChannelError::Pty {
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.process.exit() {
                trace!("Closing pty: {}", e);
            }
        }
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Where a login currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    Connecting,
    AwaitPrompt,
    AwaitLoginName,
    AwaitPassword,
    AwaitHostKeyConfirm,
    AwaitConsoleTakeover,
    Authenticated,
    Failed,
}

/// Prompts the login dialogue reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prompt {
    LoginName,
    Password,
    HostKey,
    Shell,
    NoWriteAccess,
}

/// What to send back to a prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// A line followed by newline.
    Line(String),
    /// Raw bytes, no newline.
    Raw(String),
    /// Nothing, the login is complete.
    Done,
}

impl Prompt {
    /// The prompts to watch for on `transport`, in priority order.
    pub fn table(transport: &Transport) -> Vec<(Prompt, Needle)> {
        match transport {
            Transport::Ssh => vec![
                (Prompt::Password, Needle::literal("Password:")),
                (Prompt::Shell, Needle::literal(SHELL_PROMPT)),
                (
                    Prompt::HostKey,
                    Needle::literal("continue connecting (yes/no)?"),
                ),
            ],
            Transport::Console { .. } => vec![
                (Prompt::LoginName, Needle::literal(CONSOLE_LOGIN)),
                (Prompt::Password, Needle::literal("Password:")),
                (Prompt::Shell, Needle::literal(SHELL_PROMPT)),
                (Prompt::NoWriteAccess, Needle::literal(NO_WRITE_ACCESS)),
            ],
            Transport::Spawn { .. } => vec![
                (Prompt::LoginName, Needle::literal("login:")),
                (Prompt::Password, Needle::literal("Password:")),
                (Prompt::Shell, Needle::literal(SHELL_PROMPT)),
                (
                    Prompt::HostKey,
                    Needle::literal("continue connecting (yes/no)?"),
                ),
                (Prompt::NoWriteAccess, Needle::literal(NO_WRITE_ACCESS)),
            ],
        }
    }

    /// The state entered on seeing this prompt and the reply it gets.
    pub fn respond(self, endpoint: &Endpoint) -> (LoginState, Reply) {
        match self {
            Prompt::LoginName => (
                LoginState::AwaitLoginName,
                Reply::Line(endpoint.user().to_string()),
            ),
            Prompt::Password => (
                LoginState::AwaitPassword,
                Reply::Line(endpoint.password().to_string()),
            ),
            Prompt::HostKey => (LoginState::AwaitHostKeyConfirm, Reply::Line("yes".into())),
            Prompt::NoWriteAccess => (
                LoginState::AwaitConsoleTakeover,
                Reply::Raw(TAKE_WRITE_ACCESS.into()),
            ),
            Prompt::Shell => (LoginState::Authenticated, Reply::Done),
        }
    }
}

/// An authenticated interactive session.
pub struct Session {
    endpoint: Endpoint,
    channel: Box<dyn Channel>,
    state: LoginState,
}

impl Session {
    /// Connects and logs in within `timeout`.
    pub fn login(
        connector: &dyn Connector,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Session, LoginError> {
        let target = endpoint.name().to_string();
        trace!("{}: {:?}", target, LoginState::Connecting);

        let channel_err = |e: ChannelError| LoginError::Channel {
            target: endpoint.name().to_string(),
            reason: e.to_string(),
        };

        let mut channel = connector.connect(endpoint).map_err(channel_err)?;
        if endpoint.is_console() {
            channel.send("\r").map_err(channel_err)?;
        }

        let (prompts, needles): (Vec<Prompt>, Vec<Needle>) =
            Prompt::table(endpoint.transport()).into_iter().unzip();
        let deadline = Instant::now() + timeout;
        let mut state = LoginState::AwaitPrompt;
        trace!("{}: {:?} -> {:?}", target, LoginState::Connecting, state);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let found = match channel.expect(&needles, remaining) {
                Ok(found) => found,
                Err(e) => {
                    channel.close();
                    debug!("{}: {:?} -> {:?} ({})", target, state, LoginState::Failed, e);
                    return Err(LoginError::on(&target, e));
                }
            };

            let prompt = prompts[found.index];
            let (next, reply) = prompt.respond(endpoint);
            if state == LoginState::AwaitPassword && next == LoginState::AwaitPassword {
                warn!("{}: password rejected, still prompting", target);
            }
            trace!("{}: {:?} -> {:?} on {:?}", target, state, next, prompt);
            state = next;

            match reply {
                Reply::Done => {
                    debug!("Logged in to {}", target);
                    return Ok(Session {
                        endpoint: endpoint.clone(),
                        channel,
                        state,
                    });
                }
                Reply::Line(line) => channel.send_line(&line).map_err(channel_err)?,
                Reply::Raw(raw) => {
                    warn!("{}: console is in use, forcing write access", target);
                    channel.send(&raw).map_err(channel_err)?
                }
            }
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn channel(&mut self) -> &mut dyn Channel {
        self.channel.as_mut()
    }

    pub fn close(mut self) {
        self.channel.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Peer, ScriptedConnector};

    fn login(peer: Peer, endpoint: &Endpoint) -> (Result<LoginState, LoginError>, Vec<String>) {
        let connector = ScriptedConnector::new(vec![peer]);
        let r = Session::login(&connector, endpoint, Duration::from_millis(50)).map(|s| s.state());
        (r, connector.sent(0))
    }

    #[test]
    fn ssh_password_login() {
        let peer = Peer::new().print("Password: ").wait("secret").print("root@iod:~# ");
        let (r, sent) = login(peer, &Endpoint::ssh("iod", "secret"));
        assert_eq!(r, Ok(LoginState::Authenticated));
        assert_eq!(sent, vec!["secret\n"]);
    }

    #[test]
    fn ssh_unknown_host_key_is_accepted() {
        let peer = Peer::new()
            .print("Are you sure you want to continue connecting (yes/no)? ")
            .wait("yes")
            .print("Password: ")
            .wait("pw")
            .print("root@iod:~# ");
        let (r, sent) = login(peer, &Endpoint::ssh("iod", "pw"));
        assert_eq!(r, Ok(LoginState::Authenticated));
        assert_eq!(sent, vec!["yes\n", "pw\n"]);
    }

    #[test]
    fn console_login_takes_over_write_access() {
        let peer = Peer::new()
            .wait("\r")
            .print("You do not have write access\r\n")
            .wait("~wy")
            .print("\r\nprimary console login: ")
            .wait("root")
            .print("Password: ")
            .wait("pw")
            .print("root@nprd-a:~# ");
        let (r, sent) = login(peer, &Endpoint::console("nprd-a", "pw", 5001));
        assert_eq!(r, Ok(LoginState::Authenticated));
        assert_eq!(sent, vec!["\r", "~wy\r", "root\n", "pw\n"]);
    }

    #[test]
    fn password_asked_again_is_answered_again() {
        let peer = Peer::new()
            .print("Password: ")
            .wait("pw")
            .print("Permission denied, please try again.\r\nPassword: ")
            .wait("pw")
            .print("root@iod:~# ");
        let (r, sent) = login(peer, &Endpoint::ssh("iod", "pw"));
        assert_eq!(r, Ok(LoginState::Authenticated));
        assert_eq!(sent, vec!["pw\n", "pw\n"]);
    }

    #[test]
    fn wrong_password_times_out() {
        let peer = Peer::new()
            .print("Password: ")
            .wait("bad")
            .print("Password: ")
            .wait("bad")
            .print("Permission denied\r\n");
        let (r, _sent) = login(peer, &Endpoint::ssh("iod", "bad"));
        assert_eq!(
            r,
            Err(LoginError::Timeout {
                target: "iod".into()
            })
        );
    }

    #[test]
    fn closed_connection_is_eof() {
        let peer = Peer::new().print("Connection refused\r\n").hang_up();
        let (r, _sent) = login(peer, &Endpoint::ssh("iod", "pw"));
        assert_eq!(
            r,
            Err(LoginError::Eof {
                target: "iod".into()
            })
        );
    }

    #[test]
    fn spawned_connect_command() {
        let e = Endpoint::spawned("jump", "pw", "ssh -J gw iod");
        assert_eq!(e.connect_command(), "sh -c ssh -J gw iod");
        assert_eq!(
            Endpoint::console("d", "pw", 5000).connect_command(),
            "telnet 0 5000"
        );
        assert_eq!(
            Endpoint::ssh("d", "pw").username("admin").connect_command(),
            "ssh -l admin d"
        );
    }

    #[test]
    fn needle_precedence_and_find() {
        assert_eq!(Needle::literal("~#").find("a ~# b").unwrap(), Some((2, 4)));
        assert_eq!(
            Needle::regex(r"root@\S*:~#").find("x root@iod:~# ").unwrap(),
            Some((2, 13))
        );
        assert!(Needle::regex("(").find("x").is_err());
    }
}
