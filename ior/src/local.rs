// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Commands on the control domain the harness runs in.

use std::process::Command;

use log::trace;

use crate::error::{IorError, IorResult};

/// Runs `command` through `sh -c` and returns its trimmed stdout.
pub fn execute(command: &str) -> IorResult<String> {
    trace!("local: {}", command);
    let output = Command::new("sh").arg("-c").arg(command).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();

    if output.status.success() {
        Ok(stdout.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(IorError::Local {
            command: command.to_string(),
            output: format!("{}{}", stdout, stderr).trim().to_string(),
        })
    }
}

/// Queries about logical domains, answered by the control domain.
pub trait DomainControl: Send + Sync {
    /// Domain state as printed by `ldm list`, e.g. `active` or `bound`.
    fn domain_status(&self, domain: &str) -> IorResult<String>;
    /// TCP port of the domain's virtual console.
    fn console_port(&self, domain: &str) -> IorResult<u16>;
}

/// The `ldm` command line.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ldm;

impl Ldm {
    fn list_line(&self, domain: &str) -> IorResult<String> {
        let out = execute(&format!("ldm list {} | grep {}", domain, domain))?;
        out.lines()
            .find(|l| l.split_whitespace().next() == Some(domain))
            .map(str::to_string)
            .ok_or_else(|| IorError::Parse {
                what: format!("ldm list entry of {}", domain),
                text: out.clone(),
            })
    }

    /// Hotplug device path of a VF, e.g. `/pci@380/pci@1/pci@0/pci@6/SUNW,qlc@0,2`.
    pub fn hotplug_dev(&self, vf: &str) -> IorResult<String> {
        let out = execute(&format!("ldm list-io -l -p {}", vf))?;
        parse_list_io_dev(&out).ok_or_else(|| IorError::Parse {
            what: format!("hotplug device of {}", vf),
            text: out,
        })
    }
}

impl DomainControl for Ldm {
    fn domain_status(&self, domain: &str) -> IorResult<String> {
        let line = self.list_line(domain)?;
        parse_ldm_list_line(&line)
            .map(|(status, _port)| status)
            .ok_or(IorError::Parse {
                what: "domain state".into(),
                text: line,
            })
    }

    fn console_port(&self, domain: &str) -> IorResult<u16> {
        let line = self.list_line(domain)?;
        parse_ldm_list_line(&line)
            .and_then(|(_status, port)| port)
            .ok_or(IorError::Parse {
                what: "console port".into(),
                text: line,
            })
    }
}

/// Splits a line of `ldm list` into state and console port.
///
/// ```text
/// NAME      STATE   FLAGS   CONS  VCPU  MEMORY  UTIL  NORM  UPTIME
/// fc-iod1   active  -n----  5001  8     16G     0.1%  0.1%  2h 3m
/// ```
pub fn parse_ldm_list_line(line: &str) -> Option<(String, Option<u16>)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let status = fields.get(1)?.to_string();
    let port = fields.get(3).and_then(|p| p.parse::<u16>().ok());
    Some((status, port))
}

/// Extracts `dev=` from `ldm list-io -l -p` output as an absolute path.
pub fn parse_list_io_dev(output: &str) -> Option<String> {
    output
        .split('|')
        .find_map(|field| field.trim().strip_prefix("dev="))
        .map(|dev| format!("/{}", dev.trim_start_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ldm_list_line() {
        let line = "fc-iod1          active     -n----  5001    8     16G      0.1%  0.1%  2h 3m";
        assert_eq!(
            parse_ldm_list_line(line),
            Some(("active".to_string(), Some(5001)))
        );
        assert_eq!(
            parse_ldm_list_line("primary  active  -n-cv-  UART  8  16G"),
            Some(("active".to_string(), None))
        );
        assert_eq!(parse_ldm_list_line("fc-iod1"), None);
    }

    #[test]
    fn list_io_dev() {
        let out = "|dev=pci@380/pci@1/pci@0/pci@6/SUNW,qlc@0,2|alias=/SYS/MB/PCIE4/IOVFC.PF0.VF1|status=|domain=fc-iod1|type=VF|bus=pci_1";
        assert_eq!(
            parse_list_io_dev(out),
            Some("/pci@380/pci@1/pci@0/pci@6/SUNW,qlc@0,2".to_string())
        );
        assert_eq!(parse_list_io_dev("|alias=x|"), None);
    }

    #[test]
    fn local_execute() {
        assert_eq!(execute("printf 'a\\nb\\n'").unwrap(), "a\nb");
        match execute("echo oops >&2; exit 3") {
            Err(IorError::Local { command, output }) => {
                assert_eq!(command, "echo oops >&2; exit 3");
                assert_eq!(output, "oops");
            }
            r => panic!("unexpected {:?}", r),
        }
    }
}
