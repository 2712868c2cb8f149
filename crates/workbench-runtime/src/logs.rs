//! Sinks for build, pull and push output.
//!
//! Output of long running daemon streams is forwarded line by line as it arrives and
//! never accumulated in full.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receives progress lines of long running daemon operations.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Forwards every line to `tracing` at info level.
#[derive(Debug, Clone)]
pub struct TracingLogSink {
    machine: String,
}

impl TracingLogSink {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
        }
    }
}

impl LogSink for TracingLogSink {
    fn write_line(&self, line: &str) {
        info!(machine = %self.machine, "{}", line);
    }
}

/// Drops every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardLogSink;

impl LogSink for DiscardLogSink {
    fn write_line(&self, _line: &str) {}
}

/// Forwards lines into a bounded channel. Lines are dropped when the consumer lags.
#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    tx: mpsc::Sender<String>,
}

impl ChannelLogSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLogSink {
    fn write_line(&self, line: &str) {
        if let Err(e) = self.tx.try_send(line.to_string()) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Log consumer is lagging, dropping output line");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

/// Forwards to an inner sink and remembers only the last `capacity` lines.
pub(crate) struct TailingSink<'a> {
    inner: &'a dyn LogSink,
    tail: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl<'a> TailingSink<'a> {
    pub(crate) fn new(inner: &'a dyn LogSink, capacity: usize) -> Self {
        Self {
            inner,
            tail: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn tail(&self) -> String {
        match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl LogSink for TailingSink<'_> {
    fn write_line(&self, line: &str) {
        self.inner.write_line(line);
        let mut tail = match self.tail.lock() {
            Ok(tail) => tail,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tail.len() == self.capacity {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
}
