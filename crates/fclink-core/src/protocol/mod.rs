//! MSP link engine
//!
//! Talks the MultiWii Serial Protocol (v1 and v2) to a flight controller
//! over one or more serial lines. Outbound requests are spread across the
//! lines, replies are matched back to whoever asked, and a small handshake
//! identifies the firmware after every reset.

pub mod checksum;
pub mod client;
pub mod config;
pub mod correlator;
mod engine;
mod error;
pub mod framer;
mod function;
pub mod handshake;
pub mod link;
mod message;
pub mod records;
pub mod ring;
pub mod scheduler;
pub mod serial;

pub use client::FcClient;
pub use config::{EngineConfig, HandshakePolicy};
pub use correlator::{CallerId, Origin, ReplyAction, ReplyStatus};
pub use engine::{Engine, EngineObserver, NullObserver, Reply, ReplySink, Telemetry, Transport};
pub use error::ProtocolError;
pub use framer::{Framer, FramerStats};
pub use function::Function;
pub use handshake::{CommandResponse, CommandToken, ConnectionMetadata, ConnectionState};
pub use link::SerialLink;
pub use message::{Direction, FrameHeader, Message, WireVersion, WIRE_PAYLOAD_LIMIT};
pub use records::{ApiVersion, BoardInfo, FcVariant, PayloadBuilder, PayloadFit, RcChannels};
pub use scheduler::Dispatch;
pub use serial::{configure_port, list_ports, open_port, PortInfo};

/// Start of every frame
pub const FRAME_MARKER: u8 = b'$';

/// Trailing checksum length, both layouts
pub const CHECKSUM_SIZE: usize = 1;

/// Bytes a line reader asks the port for per read
pub const READ_CHUNK_SIZE: usize = 512;

/// Default baud rate for flight controller links
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Largest payload accepted by default
/// 4 KiB of data plus room for a small record header.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 4096 + 16;

/// Receive ring size in maximum-size frames
pub const DEFAULT_RING_FRAMES: usize = 8;

/// Requests buffered while every line is busy
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// Default time to wait for a reply in milliseconds
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 1000;

/// Default timer period in milliseconds
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;
