// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::error::Error;

use custom_error::custom_error;

custom_error! {
    #[derive(PartialEq, Clone)]
    pub ChannelError
    Timeout{expected: String, waited_ms: u64} = "Timed out after {waited_ms} ms waiting for {expected}",
    Eof{expected: String} = "End of stream while waiting for {expected}",
    Spawn{command: String, reason: String} = "Unable to spawn `{command}`: {reason}",
    Io{reason: String} = "Channel I/O failed: {reason}",
    Pty{reason: String} = "Pty failure: {reason}",
    Pattern{pattern: String} = "Invalid expect pattern: {pattern}",
    Closed = "Channel is already closed",
}

custom_error! {
    #[derive(PartialEq, Clone)]
    pub LoginError
    Timeout{target: String} = "Failed to login {target} due to incorrect password or timeout",
    Eof{target: String} = "Failed to login {target} due to unexpected end of stream",
    Channel{target: String, reason: String} = "Failed to open a channel to {target}: {reason}",
}

custom_error! {
    #[derive(PartialEq, Clone)]
    pub ExecuteError
    Login{source: LoginError} = "Login before execution failed",
    Marker{command: String, target: String, reason: String} = "Execution of [{command}] in {target} failed due to: {reason}",
    ExitStatus{command: String, target: String, status: String} = "Execution of [{command}] failed in {target} (exit status {status})",
}

custom_error! {
    #[derive(PartialEq, Clone)]
    pub ReturnError
    Login{source: LoginError} = "Login before capture failed",
    Marker{command: String, target: String, reason: String} = "Failed to capture output of [{command}] in {target} due to: {reason}",
    ExitStatus{command: String, target: String, status: String} = "Failed to capture output of [{command}] in {target} (exit status {status})",
}

custom_error! {pub IorError
    Login{source: LoginError} = "Login failed",
    Execute{source: ExecuteError} = "Remote execution failed",
    Return{source: ReturnError} = "Remote output unavailable",
    Channel{source: ChannelError} = "Interactive channel failed",
    Local{command: String, output: String} = "Local execution of [{command}] failed: {output}",
    Io{source: std::io::Error} = "Local file I/O failed",
    Csv{source: csv::Error} = "Inventory file is malformed",
    Parse{what: String, text: String} = "Unable to parse {what} from [{text}]",
    Config{variable: String} = "Environment variable {variable} is not set or invalid",
    UnknownDomain{domain: String} = "Domain {domain} is not part of the inventory",
    UnknownVf{vf: String} = "VF {vf} is not part of the inventory",
    Stalled{waited_secs: u64} = "Coordination did not finish within {waited_secs} s",
    NothingToCheck = "No I/O domain or root domain given",
}

pub type IorResult<T> = Result<T, IorError>;

/// Renders `err` followed by every error in its `source()` chain.
pub fn chain(err: &dyn Error) -> String {
    let mut text = err.to_string();
    let mut cause = err.source();
    while let Some(c) = cause {
        text.push_str(": ");
        text.push_str(&c.to_string());
        cause = c.source();
    }
    text
}

impl LoginError {
    /// Classifies a channel failure seen while logging in to `target`.
    pub fn on(target: &str, err: ChannelError) -> LoginError {
        let target = target.to_string();
        match err {
            ChannelError::Timeout { .. } => LoginError::Timeout { target },
            ChannelError::Eof { .. } => LoginError::Eof { target },
            other => LoginError::Channel {
                target,
                reason: other.to_string(),
            },
        }
    }
}

impl ExecuteError {
    /// True when the command ran and reported a non-zero status, as opposed
    /// to the session or the completion marker failing.
    pub fn is_exit_status(&self) -> bool {
        matches!(self, ExecuteError::ExitStatus { .. })
    }
}

impl ReturnError {
    pub fn is_exit_status(&self) -> bool {
        matches!(self, ReturnError::ExitStatus { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_sources() {
        let err = IorError::from(ExecuteError::from(LoginError::Timeout {
            target: "fc-iod1".into(),
        }));
        let text = chain(&err);
        assert!(text.starts_with("Remote execution failed"));
        assert!(text.contains("Login before execution failed"));
        assert!(text.ends_with("Failed to login fc-iod1 due to incorrect password or timeout"));
    }

    #[test]
    fn exit_status_is_distinguished() {
        let status = ExecuteError::ExitStatus {
            command: "false".into(),
            target: "iod".into(),
            status: "1".into(),
        };
        assert!(status.is_exit_status());
        let marker = ExecuteError::Marker {
            command: "true".into(),
            target: "iod".into(),
            reason: "timeout".into(),
        };
        assert!(!marker.is_exit_status());
    }
}
