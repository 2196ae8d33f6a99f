//! Outbound request queue
//!
//! Requests wait here only while every enabled line has a request in flight.

use std::collections::VecDeque;

use super::correlator::{Origin, ReplyAction};
use super::message::Message;

/// A request waiting for a free line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Already converted to the configured wire version
    pub message: Message,
    /// Who gets the outcome
    pub origin: Origin,
    /// Opaque value echoed back with the reply
    pub context: u32,
    /// Whether the outcome is delivered
    pub action: ReplyAction,
}

/// How a submitted request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Transmitted immediately on this line
    Sent { line: usize },
    /// Accepted; will go out when a line frees up
    Queued { depth: usize },
}

/// Bounded FIFO of pending requests
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    items: VecDeque<QueueItem>,
    capacity: usize,
}

impl OutboundQueue {
    /// Empty queue holding at most `capacity` requests
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Most requests the queue holds
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests waiting
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when another push would be refused
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Append an item, handing it back if the queue is full
    pub fn push(&mut self, item: QueueItem) -> Result<usize, QueueItem> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(self.items.len())
    }

    /// Oldest waiting request
    pub fn pop(&mut self) -> Option<QueueItem> {
        self.items.pop_front()
    }

    /// Encoded bytes currently waiting
    pub fn queued_bytes(&self) -> usize {
        self.items.iter().map(|i| i.message.encoded_size()).sum()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Function;

    fn item(function: Function) -> QueueItem {
        QueueItem {
            message: Message::new(function),
            origin: Origin::Internal,
            context: 0,
            action: ReplyAction::Reply,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(4);
        for f in [Function::MSP_STATUS, Function::MSP_RC, Function::MSP_ATTITUDE] {
            queue.push(item(f)).unwrap();
        }
        let order: Vec<Function> =
            std::iter::from_fn(|| queue.pop().map(|i| i.message.function())).collect();
        assert_eq!(
            order,
            vec![Function::MSP_STATUS, Function::MSP_RC, Function::MSP_ATTITUDE]
        );
    }

    #[test]
    fn test_full_rejects() {
        let mut queue = OutboundQueue::new(1);
        assert_eq!(queue.push(item(Function::MSP_STATUS)), Ok(1));
        let rejected = queue.push(item(Function::MSP_RC)).unwrap_err();
        assert_eq!(rejected.message.function(), Function::MSP_RC);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queued_bytes() {
        let mut queue = OutboundQueue::new(2);
        queue.push(item(Function::MSP_STATUS)).unwrap();
        queue.push(item(Function::MSP_RC)).unwrap();
        assert_eq!(queue.queued_bytes(), 18);
    }
}
