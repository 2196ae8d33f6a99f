//! In-flight request tracking
//!
//! Each serial line carries at most one outstanding request. The table below
//! remembers, per line, which function is expected back, who asked for it
//! and when it went out, together with the line's enable flag.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::message::{Direction, Message};
use super::{Function, ProtocolError};

/// Who a reply should be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// The engine's own connection handshake
    Internal,
    /// An external caller registered with the engine
    External(CallerId),
}

/// Handle of an external caller's reply channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(pub usize);

/// Whether the requester wants to hear about the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplyAction {
    /// Hand the outcome to the requester
    #[default]
    Reply,
    /// Free the line and drop the outcome
    Ignore,
}

/// Outcome delivered to a requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// Response received
    Ok,
    /// The flight controller answered with an error frame
    Error,
    /// No reply within the timeout
    Timeout,
}

/// Record of the request in flight on one line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyAwaiter {
    /// Function the reply must carry
    pub function: Function,
    /// Who gets the outcome
    pub origin: Origin,
    /// Opaque value echoed back with the reply
    pub context: u32,
    /// Whether the outcome is delivered
    pub action: ReplyAction,
    /// When the frame was handed to the transport
    pub sent_at: Instant,
}

/// What to do with a frame received on a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Nothing was in flight on the line
    Unexpected,
    /// The peer sent a request on a reply-only channel
    RequestReceived,
    /// A reply for some other function; the awaiter stays in place
    Unmatched { expected: Function },
    /// The awaited reply; the slot has been cleared
    Matched {
        awaiter: ReplyAwaiter,
        status: ReplyStatus,
    },
}

/// Per-line enable flag and awaiter slot
#[derive(Debug, Clone)]
struct Line {
    enabled: bool,
    awaiting: Option<ReplyAwaiter>,
}

/// Awaiter slots and enable flags for every line
#[derive(Debug, Clone)]
pub struct LineTable {
    lines: Vec<Line>,
}

impl LineTable {
    /// Create `count` lines, all enabled and idle
    pub fn new(count: usize) -> Self {
        Self {
            lines: vec![
                Line {
                    enabled: true,
                    awaiting: None,
                };
                count
            ],
        }
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when the table has no lines at all
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn check(&self, line: usize) -> Result<(), ProtocolError> {
        if line < self.lines.len() {
            Ok(())
        } else {
            Err(ProtocolError::InvalidLine {
                line,
                lines: self.lines.len(),
            })
        }
    }

    /// Allow or forbid selecting `line` for new requests
    pub fn set_enabled(&mut self, line: usize, enabled: bool) -> Result<(), ProtocolError> {
        self.check(line)?;
        self.lines[line].enabled = enabled;
        Ok(())
    }

    /// Enable flag of every line, by index
    pub fn enabled_flags(&self) -> Vec<bool> {
        self.lines.iter().map(|l| l.enabled).collect()
    }

    /// Request in flight on `line`
    pub fn awaiter(&self, line: usize) -> Option<&ReplyAwaiter> {
        self.lines.get(line).and_then(|l| l.awaiting.as_ref())
    }

    /// Lines with a request in flight
    pub fn in_flight(&self) -> usize {
        self.lines.iter().filter(|l| l.awaiting.is_some()).count()
    }

    /// First enabled line with nothing in flight
    pub fn free_line(&self) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.enabled && l.awaiting.is_none())
    }

    /// Mark `line` as awaiting a reply.
    ///
    /// Panics if the line already has a request in flight.
    pub fn claim(&mut self, line: usize, awaiter: ReplyAwaiter) {
        let slot = &mut self.lines[line];
        assert!(
            slot.awaiting.is_none(),
            "line {} already awaiting {:?}",
            line,
            slot.awaiting
        );
        slot.awaiting = Some(awaiter);
    }

    /// Free a line's slot, returning what was in it
    pub fn release(&mut self, line: usize) -> Option<ReplyAwaiter> {
        self.lines.get_mut(line).and_then(|l| l.awaiting.take())
    }

    /// Match a received frame against the line's awaiter
    pub fn correlate(&mut self, line: usize, msg: &Message) -> Correlation {
        let Some(awaiter) = self.awaiter(line).copied() else {
            return Correlation::Unexpected;
        };

        let status = match msg.direction() {
            Direction::Request => return Correlation::RequestReceived,
            _ if msg.function() != awaiter.function => {
                return Correlation::Unmatched {
                    expected: awaiter.function,
                }
            }
            Direction::Error => ReplyStatus::Error,
            Direction::Response => ReplyStatus::Ok,
        };

        self.release(line);
        Correlation::Matched { awaiter, status }
    }

    /// Clear and return every awaiter older than `timeout` at `now`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(usize, ReplyAwaiter)> {
        let mut expired = Vec::new();
        for (index, line) in self.lines.iter_mut().enumerate() {
            let timed_out = line
                .awaiting
                .is_some_and(|a| now.saturating_duration_since(a.sent_at) >= timeout);
            if timed_out {
                if let Some(awaiter) = line.awaiting.take() {
                    expired.push((index, awaiter));
                }
            }
        }
        expired
    }
}
