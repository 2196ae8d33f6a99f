//! # fclink Core Library
//!
//! Link engine for flight controllers speaking MSP.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - MSP v1/v2 frame encoding and decoding with per-line resynchronisation
//! - Request/reply correlation over several serial lines, one request in
//!   flight per line, with a bounded FIFO for the overflow
//! - A connection handshake that identifies the firmware after each reset
//! - Serial port discovery and reader threads feeding the engine
//!
//! ## Example
//!
//! ```rust,ignore
//! use fclink_core::prelude::*;
//!
//! let config = EngineConfig::default();
//! let ports = vec![open_port("/dev/ttyACM0", DEFAULT_BAUD_RATE)?];
//! let link = SerialLink::new(ports);
//! let engine = Engine::new(config, link.clone(), Arc::new(NullObserver))?;
//! link.start(engine.clone())?;
//!
//! engine.reset(None);
//! let client = FcClient::attach(&engine);
//! let reply = client.request(Message::new(Function::MSP_STATUS)).await?;
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        list_ports, open_port, ConnectionState, Engine, EngineConfig, EngineObserver, FcClient,
        Function, Message, NullObserver, ProtocolError, Reply, ReplyStatus, SerialLink,
        WireVersion, DEFAULT_BAUD_RATE,
    };
    pub use std::sync::Arc;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
