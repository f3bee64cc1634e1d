// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fault-injection harness for I/O-domain redundancy on logical-domain
//! systems.
//!
//! Root domains that provide SR-IOV virtual functions are rebooted or
//! panicked while the I/O domains using those VFs are watched: VFs should
//! go offline and come back, multipathed disks and IPMP groups should keep
//! I/O flowing.
//!
//! The layers, bottom up:
//! * [`session`]: logging in to a domain over ssh, its console or any
//!   spawned program.
//! * [`executor`]: running one command per session and checking its exit
//!   status.
//! * [`probe`] and [`checks`]: what an I/O domain looks like and whether
//!   that matches its baseline in the [`inventory`].
//! * [`fault`]: reboots and panics, on a thread of their own.
//! * [`coordinator`]: polling while the fault is in progress and the
//!   resulting [`coordinator::Verdict`].

pub mod checks;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod fault;
pub mod inventory;
pub mod local;
pub mod probe;
pub mod report;
pub mod session;
pub mod signal;
pub mod vf;

#[cfg(test)]
mod testing;
