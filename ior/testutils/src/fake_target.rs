// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A fake domain behind a real pty.
//!
//! The target is a shell script: it asks for a password (and optionally a
//! login name, a host key confirmation or a console takeover first), then
//! replaces itself with an interactive bash whose prompt looks like a root
//! shell on the domain. `reboot` and `mdb` are shell functions that print
//! what the real commands print on a console.
//!
//! # Depends on
//! - `sh` and `bash` in `PATH`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::TempDir;

use ior::session::Endpoint;

/// Password of every fake target unless [`FakeTargetBuilder::password`] says
/// otherwise.
pub const PASSWORD: &str = "secret";

/// `printf` call sites `mdb` reports on a debug kernel.
const DEBUG_PRINTFS: usize = 3;
/// `printf` call sites `mdb` reports on a non-debug kernel.
const NON_DEBUG_PRINTFS: usize = 2;

/// How the target greets a new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginStyle {
    /// Password prompt only, like ssh.
    Ssh,
    /// `<name> console login:` followed by the password prompt.
    Console,
}

#[derive(Clone, Debug)]
pub struct FakeTargetBuilder {
    name: String,
    password: String,
    style: LoginStyle,
    host_key: bool,
    contended: bool,
    printfs: usize,
}

impl FakeTargetBuilder {
    pub fn password(mut self, password: &str) -> FakeTargetBuilder {
        self.password = password.to_string();
        self
    }

    pub fn console_login(mut self) -> FakeTargetBuilder {
        self.style = LoginStyle::Console;
        self
    }

    /// Asks to confirm an unknown host key before the password.
    pub fn host_key(mut self) -> FakeTargetBuilder {
        self.host_key = true;
        self
    }

    /// Somebody else holds the console: every connection starts read-only
    /// until `~wy` is typed.
    pub fn contended(mut self) -> FakeTargetBuilder {
        self.contended = true;
        self
    }

    /// `mdb` reports a debug kernel, a panic then stops in kmdb.
    pub fn debug_kernel(mut self) -> FakeTargetBuilder {
        self.printfs = DEBUG_PRINTFS;
        self
    }

    pub fn build(self) -> io::Result<FakeTarget> {
        let dir = tempfile::Builder::new().prefix("ior-fake-").tempdir()?;
        let state = dir.path().to_path_buf();
        fs::create_dir_all(state.join("crash"))?;

        let rc = state.join("rc.bash");
        fs::write(&rc, self.rc_script(&state))?;
        let script = state.join("target.sh");
        fs::write(&script, self.login_script(&state, &rc))?;
        debug!("Fake target {} in {}", self.name, state.display());

        Ok(FakeTarget {
            name: self.name,
            password: self.password,
            script,
            dir,
        })
    }

    fn login_script(&self, state: &Path, rc: &Path) -> String {
        let mut s = String::from("#!/bin/sh\n");
        s += &format!("STATE='{}'\n", state.display());

        if self.contended {
            s += "printf 'You do not have write access\\r\\n'\n";
            s += "while :; do IFS= read -r l || exit 0; [ \"$l\" = '~wy' ] && break; done\n";
        }

        // A panicked debug kernel sits in kmdb until somebody resets it.
        s += "if [ -e \"$STATE/kmdb\" ]; then\n";
        s += "  rm -f \"$STATE/kmdb\"\n";
        s += "  printf '\\r\\npanic[cpu0]/thread=2a10001fc80: forced crash dump\\r\\n[0]> reset? '\n";
        s += "  while :; do IFS= read -r l || exit 0; [ \"$l\" = r ] && break; done\n";
        s += &format!(
            "  printf 'resetting...\\r\\n\\r\\n{} console login: '\n",
            self.name
        );
        s += "  IFS= read -r _ || true\n";
        s += "  exit 0\n";
        s += "fi\n";

        if self.host_key {
            s += "printf \"The authenticity of host can't be established.\\r\\n\"\n";
            s += "printf 'Are you sure you want to continue connecting (yes/no)? '\n";
            s += "IFS= read -r answer || exit 0\n";
            s += "[ \"$answer\" = yes ] || exit 1\n";
        }

        if self.style == LoginStyle::Console {
            s += &format!("printf '\\r\\n{} console login: '\n", self.name);
            s += "while :; do IFS= read -r user || exit 0; [ \"$user\" = root ] && break; done\n";
        }

        s += "while :; do\n";
        s += "  printf 'Password: '\n";
        s += "  stty -echo\n";
        s += "  IFS= read -r pw || exit 0\n";
        s += "  stty echo\n";
        s += "  printf '\\r\\n'\n";
        s += &format!("  [ \"$pw\" = '{}' ] && break\n", self.password);
        s += "  printf 'Permission denied, please try again.\\r\\n'\n";
        s += "done\n";
        s += "echo login >> \"$STATE/logins\"\n";
        s += &format!(
            "exec env TERM=dumb HISTFILE=/dev/null bash --rcfile '{}' --noediting -i\n",
            rc.display()
        );
        s
    }

    fn rc_script(&self, state: &Path) -> String {
        let crash = state.join("crash");
        let mut s = String::new();
        s += "unalias -a\n";
        s += "PROMPT_COMMAND=\n";
        s += &format!("PS1='root@{}:~# '\n", self.name);
        s += "trap 'exit 0' TERM HUP\n";
        s += &format!("CRASH='{}'\n", crash.display());
        s += &format!("STATE='{}'\n", state.display());

        s += "reboot() {\n";
        s += "  printf 'syncing file systems... done\\nrebooting...\\n'\n";
        s += &format!("  printf '\\n{} console login: '\n", self.name);
        s += "}\n";

        s += "mdb() {\n";
        s += "  cat > /dev/null\n";
        s += "  case \"$*\" in\n";
        s += "  *-kw*)\n";
        s += "    printf 'rootdir:        0xfffffffffbc39d18 = 0x0\\n'\n";
        if self.printfs == DEBUG_PRINTFS {
            s += "    touch \"$STATE/kmdb\"\n";
        } else {
            s += "    n=$(ls \"$CRASH\" | wc -l)\n";
            s += "    mkdir -p \"$CRASH/$n\" && touch \"$CRASH/$n/vmdump.$n\"\n";
            s += "    printf 'panic[cpu0]/thread=2a10001fc80: forced crash dump\\n'\n";
            s += &format!("    printf 'rebooting...\\n\\n{} console login: '\n", self.name);
        }
        s += "    ;;\n";
        s += "  *)\n";
        s += &format!(
            "    i=0; while [ $i -lt {} ]; do printf '    call    +0x8  <printf>\\n'; i=$((i+1)); done\n",
            self.printfs
        );
        s += "    ;;\n";
        s += "  esac\n";
        s += "}\n";
        s
    }
}

/// A fake domain, removed again when dropped.
pub struct FakeTarget {
    name: String,
    password: String,
    script: PathBuf,
    dir: TempDir,
}

impl FakeTarget {
    pub fn builder(name: &str) -> FakeTargetBuilder {
        FakeTargetBuilder {
            name: name.to_string(),
            password: PASSWORD.to_string(),
            style: LoginStyle::Ssh,
            host_key: false,
            contended: false,
            printfs: NON_DEBUG_PRINTFS,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logs in with the target's own password.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint_with(&self.password)
    }

    pub fn endpoint_with(&self, password: &str) -> Endpoint {
        Endpoint::spawned(
            &self.name,
            password,
            &format!("sh {}", self.script.display()),
        )
    }

    /// Where panics leave their dumps.
    pub fn crash_dir(&self) -> PathBuf {
        self.dir.path().join("crash")
    }

    /// Number of successful logins so far.
    pub fn logins(&self) -> usize {
        fs::read_to_string(self.dir.path().join("logins"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// The kernel was panicked into kmdb and nobody reset it yet.
    pub fn in_kmdb(&self) -> bool {
        self.dir.path().join("kmdb").exists()
    }

    /// Files below the crash directory, relative to it.
    pub fn crash_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        let crash = self.crash_dir();
        if let Ok(entries) = fs::read_dir(&crash) {
            for dump in entries.flatten() {
                if let Ok(inner) = fs::read_dir(dump.path()) {
                    for f in inner.flatten() {
                        if let Ok(rel) = f.path().strip_prefix(&crash) {
                            files.push(rel.display().to_string());
                        }
                    }
                }
            }
        }
        files.sort();
        files
    }

    /// Crash dump directories, even emptied ones.
    pub fn crash_dumps(&self) -> Vec<String> {
        let mut dumps: Vec<String> = fs::read_dir(self.crash_dir())
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        dumps.sort();
        dumps
    }
}
