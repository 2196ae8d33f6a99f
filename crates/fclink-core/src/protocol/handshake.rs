//! Connection bring-up
//!
//! After every reset the engine asks the flight controller, one request at
//! a time, for its API version, firmware variant and board info. Each reply
//! either advances to the next request or settles the connection into a
//! terminal state. A pending reset command is answered at the first
//! transition out of `NotConnected`.
//!
//! Every reset starts a new generation. Identification requests carry the
//! generation they were issued under, and replies or timeouts from an
//! earlier generation are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::HandshakePolicy;
use super::correlator::ReplyStatus;
use super::message::Message;
use super::records::{ApiVersion, BoardInfo, FcVariant, PayloadFit};
use super::Function;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Handshake in progress
    NotConnected,
    /// Identified and compatible
    Ok,
    /// A serial line reported a receive error
    BadSerial,
    /// Unsupported protocol major/minor version
    BadApiVersion,
    /// Unexpected firmware tag, or an identification step failed
    BadFirmwareIdent,
}

impl ConnectionState {
    /// States that only `reset()` leaves
    pub fn is_terminal(&self) -> bool {
        *self != ConnectionState::NotConnected
    }
}

/// Identifies an administrative command awaiting completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandToken {
    /// Command kind, chosen by the issuer
    pub opcode: u32,
    /// Sequence number, chosen by the issuer
    pub seq: u32,
}

/// Completion status of an administrative command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// Reset reached `Ok`
    Ok,
    /// Reset ended in a failure state or was superseded
    ExecutionError,
}

/// What the handshake learned about the flight controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// From `MSP_API_VERSION`
    pub api_version: Option<ApiVersion>,
    /// From `MSP_FC_VARIANT`
    pub fc_variant: Option<FcVariant>,
    /// From `MSP_BOARD_INFO`
    pub board_info: Option<BoardInfo>,
    /// Name of the firmware target, e.g. `MATEKF722`
    pub target_name: Option<String>,
    /// When the handshake reached `Ok`
    pub connected_at: Option<DateTime<Utc>>,
}

/// A settled state plus the command it completes, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Connection state
    pub state: ConnectionState,
    /// Reset command answered by this transition
    pub completion: Option<(CommandToken, CommandResponse)>,
}

/// Next thing the engine must do after a handshake reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Reply was not for the handshake, or arrived after it settled
    Ignore,
    /// Submit the next identification request
    Request(Function),
    /// The connection left `NotConnected`
    Settled(Transition),
}

/// Result of a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart {
    /// First identification request to submit
    pub request: Function,
    /// Generation to tag identification requests with
    pub generation: u32,
    /// Earlier reset command that never completed
    pub superseded: Option<CommandToken>,
}

/// Handshake state machine
#[derive(Debug, Clone)]
pub struct Handshake {
    policy: HandshakePolicy,
    state: ConnectionState,
    metadata: ConnectionMetadata,
    expected: Option<Function>,
    pending: Option<CommandToken>,
    generation: u32,
}

impl Handshake {
    /// Idle handshake; nothing happens until the first reset
    pub fn new(policy: HandshakePolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::NotConnected,
            metadata: ConnectionMetadata::default(),
            expected: None,
            pending: None,
            generation: 0,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identification gathered since the last reset
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Generation started by the latest reset
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Step currently awaiting a reply
    pub fn expected(&self) -> Option<Function> {
        self.expected
    }

    /// Re-enter `NotConnected` and restart identification
    pub fn reset(&mut self, command: Option<CommandToken>) -> Restart {
        let superseded = match command {
            Some(token) => self.pending.replace(token),
            None => None,
        };
        self.generation = self.generation.wrapping_add(1);
        self.state = ConnectionState::NotConnected;
        self.metadata = ConnectionMetadata::default();
        self.expected = Some(Function::MSP_API_VERSION);
        Restart {
            request: Function::MSP_API_VERSION,
            generation: self.generation,
            superseded,
        }
    }

    /// A serial line failed while connecting or connected
    pub fn serial_error(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::NotConnected | ConnectionState::Ok => {
                Some(self.settle(ConnectionState::BadSerial))
            }
            _ => None,
        }
    }

    /// The identification request could not be submitted
    pub fn submit_failed(&mut self, generation: u32, function: Function) -> Option<Transition> {
        if generation != self.generation
            || self.state != ConnectionState::NotConnected
            || self.expected != Some(function)
        {
            return None;
        }
        warn!(function = %function, "Error during identification");
        Some(self.settle(ConnectionState::BadFirmwareIdent))
    }

    /// Feed the reply to an identification request issued under `generation`
    pub fn on_reply(
        &mut self,
        generation: u32,
        reply: &Message,
        status: ReplyStatus,
    ) -> HandshakeAction {
        if generation != self.generation {
            debug!(
                function = %reply.function(),
                generation,
                current = self.generation,
                ?status,
                "Reply from an earlier handshake"
            );
            return HandshakeAction::Ignore;
        }
        if self.state != ConnectionState::NotConnected {
            // Settled: replies to internal requests are no longer interesting
            return HandshakeAction::Ignore;
        }

        let function = reply.function();
        if self.expected != Some(function) {
            debug!(
                function = %function,
                expected = ?self.expected,
                "Stale identification reply"
            );
            return HandshakeAction::Ignore;
        }

        if status != ReplyStatus::Ok {
            warn!(function = %function, ?status, "Error during identification");
            return self.settled(ConnectionState::BadFirmwareIdent);
        }

        match function {
            Function::MSP_API_VERSION => self.on_api_version(reply),
            Function::MSP_FC_VARIANT => self.on_fc_variant(reply),
            Function::MSP_BOARD_INFO => self.on_board_info(reply),
            _ => HandshakeAction::Ignore,
        }
    }

    fn on_api_version(&mut self, reply: &Message) -> HandshakeAction {
        let api = match reply.payload_as::<ApiVersion>(PayloadFit::Exact) {
            Ok(api) => api,
            Err(e) => {
                warn!(error = %e, "Malformed MSP_API_VERSION reply");
                return self.settled(ConnectionState::BadFirmwareIdent);
            }
        };

        if api.major != self.policy.api_major || api.minor < self.policy.min_api_minor {
            warn!(
                major = api.major,
                minor = api.minor,
                "Unsupported API version"
            );
            return self.settled(ConnectionState::BadApiVersion);
        }

        self.metadata.api_version = Some(api);
        self.advance(Function::MSP_FC_VARIANT)
    }

    fn on_fc_variant(&mut self, reply: &Message) -> HandshakeAction {
        let variant = match reply.payload_as::<FcVariant>(PayloadFit::Exact) {
            Ok(variant) => variant,
            Err(e) => {
                warn!(error = %e, "Malformed MSP_FC_VARIANT reply");
                return self.settled(ConnectionState::BadFirmwareIdent);
            }
        };

        if !variant.matches(&self.policy.firmware_variant) {
            warn!(variant = %variant.as_str(), "Unsupported identifier");
            return self.settled(ConnectionState::BadFirmwareIdent);
        }

        self.metadata.fc_variant = Some(variant);
        self.advance(Function::MSP_BOARD_INFO)
    }

    fn on_board_info(&mut self, reply: &Message) -> HandshakeAction {
        let board = match reply.payload_as::<BoardInfo>(PayloadFit::Prefix) {
            Ok(board) => board,
            Err(e) => {
                warn!(error = %e, "Malformed MSP_BOARD_INFO reply");
                return self.settled(ConnectionState::BadFirmwareIdent);
            }
        };

        self.metadata.target_name = Some(board.target_name(reply.payload()));
        self.metadata.board_info = Some(board);
        self.metadata.connected_at = Some(Utc::now());

        let api = self.metadata.api_version.unwrap_or_default();
        info!(
            major = api.major,
            minor = api.minor,
            variant = %self.metadata.fc_variant.map(|v| v.as_str()).unwrap_or_default(),
            board = %board.ident(),
            "Connection established"
        );
        self.settled(ConnectionState::Ok)
    }

    fn advance(&mut self, next: Function) -> HandshakeAction {
        self.expected = Some(next);
        HandshakeAction::Request(next)
    }

    fn settled(&mut self, state: ConnectionState) -> HandshakeAction {
        HandshakeAction::Settled(self.settle(state))
    }

    fn settle(&mut self, state: ConnectionState) -> Transition {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.expected = None;
        let completion = self.pending.take().map(|token| {
            let response = if state == ConnectionState::Ok {
                CommandResponse::Ok
            } else {
                CommandResponse::ExecutionError
            };
            (token, response)
        });
        Transition { state, completion }
    }
}
