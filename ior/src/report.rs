// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test-run reporting.
//!
//! A [`Reporter`] is created once per test run and handed to everything that
//! wants to say something about the run. Lines go to the console through the
//! `log` facade and, when a journal file is configured, are appended to it.
//!
//! A [`Transcript`] is the raw text of every interactive session. All
//! sessions writing to the same path share one append-only file handle.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::{error, info, warn};

use crate::error::chain;

lazy_static! {
    static ref TRANSCRIPTS: Mutex<HashMap<PathBuf, Arc<Mutex<File>>>> = Mutex::new(HashMap::new());
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Structured test-run journal.
pub struct Reporter {
    journal: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl Reporter {
    /// Creates a reporter that appends to `path` in addition to logging.
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Reporter> {
        let file = open_append(path.as_ref())?;
        Ok(Reporter {
            journal: Some(Mutex::new(file)),
            path: Some(path.as_ref().to_path_buf()),
        })
    }

    /// A reporter that only logs.
    pub fn console() -> Reporter {
        Reporter {
            journal: None,
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn journal(&self, level: &str, msg: &str) {
        if let Some(journal) = &self.journal {
            let mut file = match journal.lock() {
                Ok(f) => f,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = writeln!(file, "{:<5} : {}", level, msg) {
                warn!("Unable to append to report journal: {}", e);
            }
        }
    }

    pub fn info<D: Display>(&self, msg: D) {
        let msg = msg.to_string();
        info!("{}", msg);
        self.journal("INFO", &msg);
    }

    pub fn warn<D: Display>(&self, msg: D) {
        let msg = msg.to_string();
        warn!("{}", msg);
        self.journal("WARN", &msg);
    }

    pub fn error<D: Display>(&self, msg: D) {
        let msg = msg.to_string();
        error!("{}", msg);
        self.journal("ERROR", &msg);
    }

    /// Journal-only line, e.g. a check result already logged elsewhere.
    pub fn note<D: Display>(&self, msg: D) {
        self.journal("INFO", &msg.to_string());
    }

    /// Reports `err` together with its whole cause chain.
    pub fn error_chain(&self, context: &str, err: &dyn Error) {
        self.error(format!("{}: {}", context, chain(err)));
    }
}

/// Append-only sink for raw session text.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    path: Option<PathBuf>,
}

impl Transcript {
    pub fn at<P: AsRef<Path>>(path: P) -> Transcript {
        Transcript {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn disabled() -> Transcript {
        Transcript { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn handle(path: &Path) -> std::io::Result<Arc<Mutex<File>>> {
        let mut files = match TRANSCRIPTS.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(file) = files.get(path) {
            return Ok(file.clone());
        }
        let file = Arc::new(Mutex::new(open_append(path)?));
        files.insert(path.to_path_buf(), file.clone());
        Ok(file)
    }

    /// Appends `text`. Failures are logged and otherwise ignored.
    pub fn append(&self, text: &str) {
        let path = match &self.path {
            Some(p) => p,
            None => return,
        };
        if text.is_empty() {
            return;
        }

        let r = Transcript::handle(path).and_then(|file| {
            let mut file = match file.lock() {
                Ok(f) => f,
                Err(poisoned) => poisoned.into_inner(),
            };
            file.write_all(text.as_bytes())
        });
        if let Err(e) = r {
            warn!("Unable to append to transcript {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_appends_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interaction.log");

        let a = Transcript::at(&path);
        let b = a.clone();
        a.append("console login: ");
        b.append("root\n");
        Transcript::at(&path).append("Password:");

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "console login: root\nPassword:");
    }

    #[test]
    fn disabled_transcript_is_silent() {
        Transcript::disabled().append("anything");
    }

    #[test]
    fn reporter_journals_every_level() {
        let _r = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report");

        let reporter = Reporter::new(&path).unwrap();
        reporter.info("status of vf: ONLINE");
        reporter.warn("slow console");
        reporter.error("Fail");
        reporter.note("Pass");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "INFO  : status of vf: ONLINE",
                "WARN  : slow console",
                "ERROR : Fail",
                "INFO  : Pass",
            ]
        );
    }
}
