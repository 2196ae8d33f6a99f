//! Engine configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::message::{WireVersion, WIRE_PAYLOAD_LIMIT};
use super::{
    ProtocolError, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_QUEUE_CAPACITY, DEFAULT_REPLY_TIMEOUT_MS,
    DEFAULT_RING_FRAMES, DEFAULT_TICK_INTERVAL_MS, READ_CHUNK_SIZE,
};

/// What the connection handshake accepts as a compatible flight controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakePolicy {
    /// Required API major version
    pub api_major: u8,
    /// Lowest accepted API minor version
    pub min_api_minor: u8,
    /// Expected four character firmware tag
    pub firmware_variant: String,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        // Modified iNAV firmware reports API 2.5 and up
        Self {
            api_major: 2,
            min_api_minor: 5,
            firmware_variant: "INAV".to_string(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Layout used for outgoing frames; inbound frames are auto-detected
    pub wire_version: WireVersion,
    /// Largest payload accepted in either direction
    pub max_payload_size: usize,
    /// Receive ring size, in maximum-size frames
    pub ring_frames: usize,
    /// Requests held while all lines are busy
    pub queue_capacity: usize,
    /// Time a line waits for a reply before the request times out
    pub reply_timeout_ms: u64,
    /// Expected period of `on_tick`
    pub tick_interval_ms: u64,
    /// Number of serial lines
    pub lines: usize,
    /// Lines that start out disabled
    pub disabled_lines: Vec<usize>,
    /// What counts as a compatible flight controller
    pub handshake: HandshakePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wire_version: WireVersion::V2,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            ring_frames: DEFAULT_RING_FRAMES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            lines: 2,
            disabled_lines: Vec::new(),
            handshake: HandshakePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |msg: String| Err(ProtocolError::InvalidConfig(msg));

        if self.max_payload_size == 0 || self.max_payload_size > WIRE_PAYLOAD_LIMIT {
            return invalid(format!(
                "max_payload_size must be in 1..={}, got {}",
                WIRE_PAYLOAD_LIMIT, self.max_payload_size
            ));
        }
        if self.ring_frames < 2 {
            return invalid(format!(
                "ring_frames must be at least 2, got {}",
                self.ring_frames
            ));
        }
        if self.ring_capacity() < READ_CHUNK_SIZE {
            return invalid(format!(
                "receive ring of {} bytes is smaller than one {} byte read",
                self.ring_capacity(),
                READ_CHUNK_SIZE
            ));
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1".to_string());
        }
        if self.reply_timeout_ms == 0 {
            return invalid("reply_timeout_ms must be positive".to_string());
        }
        if self.tick_interval_ms == 0 || self.tick_interval_ms >= self.reply_timeout_ms {
            return invalid(format!(
                "tick_interval_ms must be in 1..{}, got {}",
                self.reply_timeout_ms, self.tick_interval_ms
            ));
        }
        if self.lines == 0 {
            return invalid("at least one serial line is required".to_string());
        }
        if let Some(&line) = self.disabled_lines.iter().find(|&&l| l >= self.lines) {
            return invalid(format!(
                "disabled line {} out of range (have {})",
                line, self.lines
            ));
        }
        if self.handshake.firmware_variant.len() != 4 {
            return invalid(format!(
                "firmware_variant must be 4 characters, got '{}'",
                self.handshake.firmware_variant
            ));
        }
        Ok(())
    }

    /// Reply timeout as a `Duration`
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Timer period as a `Duration`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Bytes in each line's receive ring
    pub fn ring_capacity(&self) -> usize {
        (self.wire_version.overhead().max(WireVersion::V2.overhead()) + self.max_payload_size)
            * self.ring_frames
    }
}
