//! MSP function identifiers
//!
//! Functions are 16-bit on the wire in MSP v2 and 8-bit in MSP v1. The
//! firmware defines hundreds of them; only the ones this crate issues or
//! decodes itself get a name here, anything else is carried as a raw value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An MSP function identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Function(pub u16);

impl Function {
    /// Placeholder for "no function"
    pub const NONE: Function = Function(0);
    /// Protocol and API version
    pub const MSP_API_VERSION: Function = Function(1);
    /// Four-character firmware variant tag
    pub const MSP_FC_VARIANT: Function = Function(2);
    /// Firmware semantic version
    pub const MSP_FC_VERSION: Function = Function(3);
    /// Board identifier and capabilities
    pub const MSP_BOARD_INFO: Function = Function(4);
    /// Build date/time and git revision
    pub const MSP_BUILD_INFO: Function = Function(5);
    /// Cycle time, sensors and flight mode flags
    pub const MSP_STATUS: Function = Function(101);
    /// Raw accelerometer, gyro and magnetometer samples
    pub const MSP_RAW_IMU: Function = Function(102);
    /// Current RC channel values
    pub const MSP_RC: Function = Function(105);
    /// Roll, pitch and heading
    pub const MSP_ATTITUDE: Function = Function(108);
    /// Estimated altitude and vertical speed
    pub const MSP_ALTITUDE: Function = Function(109);
    /// Override RC channel values
    pub const MSP_SET_RAW_RC: Function = Function(200);

    /// Human readable name, if this is a known function
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Function::NONE => "MSP_NONE",
            Function::MSP_API_VERSION => "MSP_API_VERSION",
            Function::MSP_FC_VARIANT => "MSP_FC_VARIANT",
            Function::MSP_FC_VERSION => "MSP_FC_VERSION",
            Function::MSP_BOARD_INFO => "MSP_BOARD_INFO",
            Function::MSP_BUILD_INFO => "MSP_BUILD_INFO",
            Function::MSP_STATUS => "MSP_STATUS",
            Function::MSP_RAW_IMU => "MSP_RAW_IMU",
            Function::MSP_RC => "MSP_RC",
            Function::MSP_ATTITUDE => "MSP_ATTITUDE",
            Function::MSP_ALTITUDE => "MSP_ALTITUDE",
            Function::MSP_SET_RAW_RC => "MSP_SET_RAW_RC",
            _ => return None,
        };
        Some(name)
    }

    /// Whether the identifier fits the 8-bit function field of MSP v1
    pub fn fits_v1(&self) -> bool {
        self.0 <= u8::MAX as u16
    }
}

impl From<u16> for Function {
    fn from(value: u16) -> Self {
        Function(value)
    }
}

impl From<Function> for u16 {
    fn from(value: Function) -> Self {
        value.0
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "MSP({})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Function::MSP_API_VERSION.to_string(), "MSP_API_VERSION(1)");
        assert_eq!(Function(0x2001).to_string(), "MSP(8193)");
    }

    #[test]
    fn test_fits_v1() {
        assert!(Function::MSP_SET_RAW_RC.fits_v1());
        assert!(!Function(0x1000).fits_v1());
    }
}
