// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Scripted peers for exercising the session layer without a pty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ChannelError;
use crate::session::{describe, Channel, Connector, Endpoint, Found, Needle};

#[derive(Clone, Debug)]
enum Step {
    Print(String),
    Wait(String),
    HangUp,
}

/// The far side of a channel: prints text and waits for input in order.
#[derive(Clone, Debug, Default)]
pub(crate) struct Peer {
    steps: VecDeque<Step>,
}

impl Peer {
    pub(crate) fn new() -> Peer {
        Peer::default()
    }

    pub(crate) fn print(mut self, text: &str) -> Peer {
        self.steps.push_back(Step::Print(text.to_string()));
        self
    }

    /// Blocks the script until the client has sent `input`.
    pub(crate) fn wait(mut self, input: &str) -> Peer {
        self.steps.push_back(Step::Wait(input.to_string()));
        self
    }

    pub(crate) fn hang_up(mut self) -> Peer {
        self.steps.push_back(Step::HangUp);
        self
    }
}

struct ScriptedChannel {
    steps: VecDeque<Step>,
    buffer: String,
    input: String,
    eof: bool,
    closed: bool,
    sent: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedChannel {
    fn pump(&mut self) {
        while let Some(step) = self.steps.front().cloned() {
            match step {
                Step::Print(text) => self.buffer.push_str(&text),
                Step::Wait(expected) => match self.input.find(&expected) {
                    Some(at) => {
                        self.input.drain(..at + expected.len());
                    }
                    None => break,
                },
                Step::HangUp => self.eof = true,
            }
            self.steps.pop_front();
        }
    }
}

impl Channel for ScriptedChannel {
    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().unwrap().push(text.to_string());
        self.input.push_str(text);
        self.pump();
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> Result<(), ChannelError> {
        self.send(&format!("{}\n", line))
    }

    fn expect(&mut self, needles: &[Needle], timeout: Duration) -> Result<Found, ChannelError> {
        self.pump();
        for (index, needle) in needles.iter().enumerate() {
            if let Some((start, end)) = needle.find(&self.buffer)? {
                let before = self.buffer[..start].to_string();
                let matched = self.buffer[start..end].to_string();
                self.buffer.drain(..end);
                return Ok(Found {
                    index,
                    before,
                    matched,
                });
            }
        }
        if self.eof {
            Err(ChannelError::Eof {
                expected: describe(needles),
            })
        } else {
            Err(ChannelError::Timeout {
                expected: describe(needles),
                waited_ms: timeout.as_millis() as u64,
            })
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Hands out one scripted peer per connection.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    peers: Mutex<VecDeque<Peer>>,
    sent: Mutex<Vec<Arc<Mutex<Vec<String>>>>>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub(crate) fn new(peers: Vec<Peer>) -> ScriptedConnector {
        ScriptedConnector {
            peers: Mutex::new(peers.into_iter().collect()),
            ..Default::default()
        }
    }

    pub(crate) fn connections(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Everything the client sent on connection `i`.
    pub(crate) fn sent(&self, i: usize) -> Vec<String> {
        self.sent.lock().unwrap()[i].lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>, ChannelError> {
        let peer = self
            .peers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ChannelError::Spawn {
                command: endpoint.connect_command(),
                reason: "no scripted peer left".into(),
            })?;
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.sent.lock().unwrap().push(sent.clone());

        Ok(Box::new(ScriptedChannel {
            steps: peer.steps,
            buffer: String::new(),
            input: String::new(),
            eof: false,
            closed: false,
            sent,
            closes: self.closes.clone(),
        }))
    }
}
