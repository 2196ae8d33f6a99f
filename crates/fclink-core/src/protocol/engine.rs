//! The link engine
//!
//! Owns every per-line framer, the awaiter table, the outbound queue and the
//! handshake. Entry points take `&self` so the engine can be shared between
//! the reader threads and the tick driver.
//!
//! Locking: the queue lock is always taken before the line table lock.
//! Callbacks into transports, reply sinks and the observer run with no
//! engine lock held.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::correlator::{
    CallerId, Correlation, LineTable, Origin, ReplyAction, ReplyAwaiter, ReplyStatus,
};
use super::framer::{Framer, FramerStats};
use super::handshake::{
    CommandResponse, CommandToken, ConnectionMetadata, ConnectionState, Handshake,
    HandshakeAction, Transition,
};
use super::message::Message;
use super::scheduler::{Dispatch, OutboundQueue, QueueItem};
use super::{Function, ProtocolError};

/// Outbound half of the serial lines
pub trait Transport: Send + Sync {
    /// Write one encoded frame to `line`
    fn transmit(&self, line: usize, frame: &[u8]);
}

/// Reply channel of an external caller
pub trait ReplySink: Send + Sync {
    /// Called with no engine lock held
    fn deliver(&self, reply: Reply);
}

/// Receives administrative completions and state changes
pub trait EngineObserver: Send + Sync {
    /// A reset command finished
    fn command_complete(&self, token: CommandToken, response: CommandResponse);

    /// The connection state changed
    fn state_changed(&self, _state: ConnectionState) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl EngineObserver for NullObserver {
    fn command_complete(&self, _token: CommandToken, _response: CommandResponse) {}
}

/// Outcome of a request, as handed to its requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The reply, or an empty message for a timeout
    pub message: Message,
    /// Context given at submission
    pub context: u32,
    /// How the request ended
    pub status: ReplyStatus,
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
    /// Connection state
    pub state: ConnectionState,
    /// Frames decoded on every line
    pub packets_decoded: u64,
    /// Frames rejected on every line
    pub framing_errors: u64,
    /// Bytes skipped while resynchronising
    pub extraneous_bytes: u64,
    /// Encoded bytes handed to the transport
    pub bytes_sent: u64,
    /// Bytes fed in by the line readers
    pub bytes_received: u64,
    /// Requests that never got a reply
    pub timeouts: u64,
    /// Submissions refused because the queue was full
    pub rejected: u64,
    /// Requests waiting for a free line
    pub queue_depth: usize,
    /// Encoded size of everything waiting in the queue
    pub queued_bytes: usize,
    /// Lines with a request outstanding
    pub in_flight: usize,
    /// Framer counters, by line
    pub lines: Vec<FramerStats>,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
}

/// A frame picked for transmission while the locks were held
struct Launch {
    line: usize,
    function: Function,
    frame: Vec<u8>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MSP link engine
pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn EngineObserver>,
    framers: Vec<Mutex<Framer>>,
    lines: Mutex<LineTable>,
    queue: Mutex<OutboundQueue>,
    handshake: Mutex<Handshake>,
    callers: RwLock<Vec<Option<Arc<dyn ReplySink>>>>,
    counters: Counters,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine from a validated config
    ///
    /// Every line starts enabled except those listed in
    /// `config.disabled_lines`. The connection stays `NotConnected` until
    /// [`Engine::reset`] is called.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<Self>, ProtocolError> {
        config.validate()?;

        let ring_capacity = config.ring_capacity();
        let framers = (0..config.lines)
            .map(|line| Mutex::new(Framer::new(line, ring_capacity, config.max_payload_size)))
            .collect();

        let mut lines = LineTable::new(config.lines);
        for &line in &config.disabled_lines {
            lines.set_enabled(line, false)?;
        }

        Ok(Arc::new(Self {
            transport,
            observer,
            framers,
            lines: Mutex::new(lines),
            queue: Mutex::new(OutboundQueue::new(config.queue_capacity)),
            handshake: Mutex::new(Handshake::new(config.handshake.clone())),
            callers: RwLock::new(Vec::new()),
            counters: Counters::default(),
            config,
        }))
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of serial lines
    pub fn line_count(&self) -> usize {
        self.framers.len()
    }

    /// Register an external reply channel
    pub fn attach_caller(&self, sink: Arc<dyn ReplySink>) -> CallerId {
        let mut callers = self.callers.write().unwrap_or_else(PoisonError::into_inner);
        callers.push(Some(sink));
        CallerId(callers.len() - 1)
    }

    /// Unregister a reply channel; later replies for it are dropped
    pub fn detach_caller(&self, id: CallerId) {
        let mut callers = self.callers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = callers.get_mut(id.0) {
            *slot = None;
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Feed bytes read from `line`
    ///
    /// Complete frames are decoded and correlated before this returns. If
    /// part of the read found no room in the ring, that part is dropped and
    /// reported as `BufferOverflow` after every decoded frame has been
    /// handled.
    pub fn deliver_bytes(&self, line: usize, bytes: &[u8]) -> Result<(), ProtocolError> {
        let framer = self.framers.get(line).ok_or(ProtocolError::InvalidLine {
            line,
            lines: self.framers.len(),
        })?;

        self.counters
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let received = lock(framer).feed(bytes);
        for message in received.frames {
            self.on_message(line, message);
        }

        if received.dropped > 0 {
            return Err(ProtocolError::BufferOverflow {
                line,
                dropped: received.dropped,
            });
        }
        Ok(())
    }

    /// A line's reader failed
    pub fn on_read_error(&self, line: usize, reason: &str) {
        warn!(line, reason, "Serial receive error");
        let transition = lock(&self.handshake).serial_error();
        if let Some(transition) = transition {
            self.apply_transition(transition);
        }
    }

    fn on_message(&self, line: usize, message: Message) {
        let correlation = lock(&self.lines).correlate(line, &message);

        match correlation {
            Correlation::Unexpected => {
                warn!(line, function = %message.function(), "Unexpected reply");
            }
            Correlation::RequestReceived => {
                warn!(line, function = %message.function(), "Request received on reply channel");
            }
            Correlation::Unmatched { expected } => {
                warn!(
                    line,
                    function = %message.function(),
                    expected = %expected,
                    "Unmatched function reply"
                );
            }
            Correlation::Matched { awaiter, status } => {
                if status == ReplyStatus::Error {
                    warn!(line, function = %awaiter.function, "Error reply");
                } else {
                    debug!(
                        line,
                        function = %awaiter.function,
                        bytes = message.payload_size(),
                        "Reply received"
                    );
                }
                self.complete(awaiter, message, status);
                self.ping_queue();
            }
        }
    }

    fn complete(&self, awaiter: ReplyAwaiter, message: Message, status: ReplyStatus) {
        if awaiter.action == ReplyAction::Ignore {
            return;
        }

        match awaiter.origin {
            Origin::Internal => self.handshake_reply(awaiter.context, &message, status),
            Origin::External(id) => {
                let sink = self
                    .callers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(id.0)
                    .cloned()
                    .flatten();
                match sink {
                    Some(sink) => sink.deliver(Reply {
                        message,
                        context: awaiter.context,
                        status,
                    }),
                    None => {
                        warn!(caller = id.0, function = %awaiter.function, "Reply for unknown caller")
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Transmit `message` on a free line, or queue it until one frees up
    ///
    /// The message is converted to the configured wire version. Fails with
    /// `QueueFull` when every enabled line is busy and the queue is at
    /// capacity; nothing is queued or delivered in that case.
    pub fn submit(
        &self,
        mut message: Message,
        origin: Origin,
        context: u32,
        action: ReplyAction,
    ) -> Result<Dispatch, ProtocolError> {
        let function = message.function();
        if message.payload_size() > self.config.max_payload_size {
            return Err(ProtocolError::PayloadTooLarge {
                size: message.payload_size(),
                max: self.config.max_payload_size,
            });
        }
        message.set_version(self.config.wire_version);
        let frame = message.encode()?;

        let mut queue = lock(&self.queue);
        if queue.is_empty() {
            let mut lines = lock(&self.lines);
            if let Some(line) = lines.free_line() {
                lines.claim(line, Self::awaiter(function, origin, context, action));
                drop(lines);
                drop(queue);
                self.launch(Launch {
                    line,
                    function,
                    frame,
                });
                return Ok(Dispatch::Sent { line });
            }
        }

        let item = QueueItem {
            message,
            origin,
            context,
            action,
        };
        let depth = match queue.push(item) {
            Ok(depth) => depth,
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(function = %function, capacity = queue.capacity(), "Queue full");
                return Err(ProtocolError::QueueFull {
                    capacity: queue.capacity(),
                    function,
                });
            }
        };
        debug!(function = %function, depth, "Request queued");

        let launches = self.drain_queue(&mut queue);
        drop(queue);
        for launch in launches {
            self.launch(launch);
        }
        Ok(Dispatch::Queued { depth })
    }

    /// Send queued requests while enabled lines are free
    fn ping_queue(&self) {
        let launches = {
            let mut queue = lock(&self.queue);
            self.drain_queue(&mut queue)
        };
        for launch in launches {
            self.launch(launch);
        }
    }

    fn drain_queue(&self, queue: &mut OutboundQueue) -> Vec<Launch> {
        let mut launches = Vec::new();
        if queue.is_empty() {
            return launches;
        }

        let mut lines = lock(&self.lines);
        while let Some(line) = lines.free_line() {
            let Some(item) = queue.pop() else {
                break;
            };
            let function = item.message.function();
            let frame = match item.message.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(function = %function, error = %e, "Dropping unencodable request");
                    continue;
                }
            };
            lines.claim(
                line,
                Self::awaiter(function, item.origin, item.context, item.action),
            );
            launches.push(Launch {
                line,
                function,
                frame,
            });
        }
        launches
    }

    fn awaiter(
        function: Function,
        origin: Origin,
        context: u32,
        action: ReplyAction,
    ) -> ReplyAwaiter {
        ReplyAwaiter {
            function,
            origin,
            context,
            action,
            sent_at: Instant::now(),
        }
    }

    fn launch(&self, launch: Launch) {
        debug!(
            line = launch.line,
            function = %launch.function,
            bytes = launch.frame.len(),
            "Sending request"
        );
        self.counters
            .bytes_sent
            .fetch_add(launch.frame.len() as u64, Ordering::Relaxed);
        self.transport.transmit(launch.line, &launch.frame);
    }

    // ------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------

    /// Expire requests that have waited at least the reply timeout
    pub fn on_tick(&self, now: Instant) {
        let expired = lock(&self.lines).expire(now, self.config.reply_timeout());

        for (line, awaiter) in &expired {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(line, function = %awaiter.function, "Timeout");
            let message = Message::with_version(self.config.wire_version, awaiter.function);
            self.complete(*awaiter, message, ReplyStatus::Timeout);
        }

        if !expired.is_empty() {
            self.ping_queue();
        }
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Restart the handshake
    ///
    /// `command` is completed at the next transition out of
    /// `NotConnected`. A still-pending earlier command is completed with
    /// an execution error.
    pub fn reset(&self, command: Option<CommandToken>) {
        info!(command = ?command, "Reset");
        let restart = lock(&self.handshake).reset(command);

        if let Some(token) = restart.superseded {
            self.observer
                .command_complete(token, CommandResponse::ExecutionError);
        }
        self.observer.state_changed(ConnectionState::NotConnected);
        self.submit_internal(restart.generation, restart.request);
    }

    /// Make `line` available again and send any queued request on it
    pub fn enable_line(&self, line: usize) -> Result<(), ProtocolError> {
        lock(&self.lines).set_enabled(line, true)?;
        info!(line, "Line enabled");
        self.ping_queue();
        Ok(())
    }

    /// Stop selecting `line`; a request already in flight on it still completes
    pub fn disable_line(&self, line: usize) -> Result<(), ProtocolError> {
        lock(&self.lines).set_enabled(line, false)?;
        info!(line, "Line disabled");
        Ok(())
    }

    /// Enable flag of every line, by index
    pub fn list_lines(&self) -> Vec<bool> {
        lock(&self.lines).enabled_flags()
    }

    // ------------------------------------------------------------------
    // Handshake plumbing
    // ------------------------------------------------------------------

    /// Issue an identification request; its context carries the generation
    fn submit_internal(&self, generation: u32, function: Function) {
        let message = Message::with_version(self.config.wire_version, function);
        if let Err(e) = self.submit(message, Origin::Internal, generation, ReplyAction::Reply) {
            warn!(function = %function, error = %e, "Identification request not sent");
            let transition = lock(&self.handshake).submit_failed(generation, function);
            if let Some(transition) = transition {
                self.apply_transition(transition);
            }
        }
    }

    fn handshake_reply(&self, generation: u32, message: &Message, status: ReplyStatus) {
        let action = lock(&self.handshake).on_reply(generation, message, status);
        match action {
            HandshakeAction::Ignore => {}
            HandshakeAction::Request(next) => self.submit_internal(generation, next),
            HandshakeAction::Settled(transition) => self.apply_transition(transition),
        }
    }

    fn apply_transition(&self, transition: Transition) {
        info!(state = ?transition.state, "Connection state changed");
        self.observer.state_changed(transition.state);
        if let Some((token, response)) = transition.completion {
            self.observer.command_complete(token, response);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        lock(&self.handshake).state()
    }

    /// Identification gathered by the latest handshake
    pub fn metadata(&self) -> ConnectionMetadata {
        lock(&self.handshake).metadata().clone()
    }

    /// Requests waiting for a free line
    pub fn queue_depth(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Lines with a request outstanding
    pub fn in_flight(&self) -> usize {
        lock(&self.lines).in_flight()
    }

    /// Snapshot of the engine's counters
    pub fn telemetry(&self) -> Telemetry {
        let lines: Vec<FramerStats> = self.framers.iter().map(|f| lock(f).stats()).collect();
        let (queue_depth, queued_bytes) = {
            let queue = lock(&self.queue);
            (queue.len(), queue.queued_bytes())
        };
        Telemetry {
            captured_at: Utc::now(),
            state: self.state(),
            packets_decoded: lines.iter().map(|s| s.frames).sum(),
            framing_errors: lines.iter().map(|s| s.errors()).sum(),
            extraneous_bytes: lines.iter().map(|s| s.extraneous_bytes).sum(),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            queue_depth,
            queued_bytes,
            in_flight: self.in_flight(),
            lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Direction;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(usize, Vec<u8>)>>,
    }

    impl Transport for Recorder {
        fn transmit(&self, line: usize, frame: &[u8]) {
            self.frames.lock().unwrap().push((line, frame.to_vec()));
        }
    }

    #[derive(Default)]
    struct Inbox {
        replies: Mutex<Vec<Reply>>,
    }

    impl ReplySink for Inbox {
        fn deliver(&self, reply: Reply) {
            self.replies.lock().unwrap().push(reply);
        }
    }

    fn engine(lines: usize) -> (Arc<Engine>, Arc<Recorder>) {
        let transport = Arc::new(Recorder::default());
        let config = EngineConfig {
            lines,
            queue_capacity: 2,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config, transport.clone(), Arc::new(NullObserver)).unwrap();
        (engine, transport)
    }

    fn response(function: Function) -> Vec<u8> {
        let mut msg = Message::new(function);
        msg.set_direction(Direction::Response);
        msg.encode().unwrap()
    }

    #[test]
    fn test_disabled_lines_from_config() {
        let config = EngineConfig {
            lines: 3,
            disabled_lines: vec![1],
            ..EngineConfig::default()
        };
        let engine =
            Engine::new(config, Arc::new(Recorder::default()), Arc::new(NullObserver)).unwrap();
        assert_eq!(engine.list_lines(), vec![true, false, true]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            lines: 0,
            ..EngineConfig::default()
        };
        assert!(Engine::new(config, Arc::new(Recorder::default()), Arc::new(NullObserver)).is_err());
    }

    #[test]
    fn test_queue_full() {
        let (engine, _) = engine(1);
        let msg = || Message::new(Function::MSP_STATUS);
        assert_eq!(
            engine.submit(msg(), Origin::Internal, 0, ReplyAction::Ignore).unwrap(),
            Dispatch::Sent { line: 0 }
        );
        engine.submit(msg(), Origin::Internal, 0, ReplyAction::Ignore).unwrap();
        engine.submit(msg(), Origin::Internal, 0, ReplyAction::Ignore).unwrap();
        let err = engine
            .submit(msg(), Origin::Internal, 0, ReplyAction::Ignore)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::QueueFull { capacity: 2, .. }));
        assert_eq!(engine.telemetry().rejected, 1);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let (engine, transport) = engine(1);
        let msg = Message::request(Function::MSP_STATUS, &vec![0u8; 5000]).unwrap();
        assert!(matches!(
            engine.submit(msg, Origin::Internal, 0, ReplyAction::Reply),
            Err(ProtocolError::PayloadTooLarge { size: 5000, .. })
        ));
        assert!(transport.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_external_reply_routed_by_caller() {
        let (engine, _) = engine(2);
        let first = Arc::new(Inbox::default());
        let second = Arc::new(Inbox::default());
        engine.attach_caller(first.clone());
        let id = engine.attach_caller(second.clone());

        engine
            .submit(
                Message::new(Function::MSP_ATTITUDE),
                Origin::External(id),
                42,
                ReplyAction::Reply,
            )
            .unwrap();
        engine
            .deliver_bytes(0, &response(Function::MSP_ATTITUDE))
            .unwrap();

        assert!(first.replies.lock().unwrap().is_empty());
        let replies = second.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].context, 42);
        assert_eq!(replies[0].status, ReplyStatus::Ok);
    }

    #[test]
    fn test_ignored_reply_frees_line() {
        let (engine, _) = engine(1);
        let inbox = Arc::new(Inbox::default());
        let id = engine.attach_caller(inbox.clone());
        engine
            .submit(
                Message::new(Function::MSP_RC),
                Origin::External(id),
                0,
                ReplyAction::Ignore,
            )
            .unwrap();
        engine.deliver_bytes(0, &response(Function::MSP_RC)).unwrap();
        assert!(inbox.replies.lock().unwrap().is_empty());
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_detached_caller_reply_dropped() {
        let (engine, _) = engine(1);
        let inbox = Arc::new(Inbox::default());
        let id = engine.attach_caller(inbox.clone());
        engine
            .submit(
                Message::new(Function::MSP_RC),
                Origin::External(id),
                0,
                ReplyAction::Reply,
            )
            .unwrap();
        engine.detach_caller(id);
        engine.deliver_bytes(0, &response(Function::MSP_RC)).unwrap();
        assert!(inbox.replies.lock().unwrap().is_empty());
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_invalid_line_index() {
        let (engine, _) = engine(2);
        assert!(matches!(
            engine.deliver_bytes(5, b"$"),
            Err(ProtocolError::InvalidLine { line: 5, lines: 2 })
        ));
        assert!(engine.enable_line(2).is_err());
        assert!(engine.disable_line(9).is_err());
    }

    #[test]
    fn test_tick_before_timeout_keeps_awaiter() {
        let (engine, _) = engine(1);
        engine
            .submit(
                Message::new(Function::MSP_STATUS),
                Origin::Internal,
                0,
                ReplyAction::Ignore,
            )
            .unwrap();
        engine.on_tick(Instant::now() + Duration::from_millis(500));
        assert_eq!(engine.in_flight(), 1);
        engine.on_tick(Instant::now() + Duration::from_millis(1500));
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.telemetry().timeouts, 1);
    }

    #[test]
    fn test_v1_engine_rejects_wide_function() {
        let config = EngineConfig {
            wire_version: crate::protocol::WireVersion::V1,
            ..EngineConfig::default()
        };
        let engine =
            Engine::new(config, Arc::new(Recorder::default()), Arc::new(NullObserver)).unwrap();
        let msg = Message::new(Function(0x1001));
        assert!(matches!(
            engine.submit(msg, Origin::Internal, 0, ReplyAction::Reply),
            Err(ProtocolError::Unencodable { .. })
        ));
    }
}
