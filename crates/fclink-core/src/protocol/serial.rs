//! Serial port handling
//!
//! Port discovery and opening for flight controller links.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tracing::debug;

use super::ProtocolError;

/// Read timeout on opened ports; keeps reader threads responsive to shutdown
pub const READ_TIMEOUT_MS: u64 = 100;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// USB manufacturer string
    pub manufacturer: Option<String>,

    /// USB product string
    pub product: Option<String>,
}

impl PortInfo {
    /// Port known only by its device path
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Device family and instance number, from the device name
    fn kind(&self) -> (PortKind, usize) {
        let basename = self.name.rsplit('/').next().unwrap_or(&self.name);
        let families = [("ttyACM", PortKind::CdcAcm), ("ttyUSB", PortKind::UsbSerial)];
        for (prefix, kind) in families {
            if let Some(index) = basename.strip_prefix(prefix) {
                return (kind, index.parse().unwrap_or(usize::MAX));
            }
        }
        (PortKind::Other, 0)
    }

    /// Flight controllers first, then by instance, then by name. Entries
    /// with USB details sort ahead of bare entries for the same device.
    fn discovery_order(&self) -> (PortKind, usize, String, bool) {
        let (kind, index) = self.kind();
        (kind, index, self.name.clone(), self.vid.is_none())
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Device families, in the order they are offered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PortKind {
    /// Native USB flight controllers enumerate as CDC-ACM
    CdcAcm,
    /// USB-UART bridges
    UsbSerial,
    Other,
}

/// CDC and USB-UART nodes under `/dev`; udev does not always report them
#[cfg(target_os = "linux")]
fn dev_nodes() -> Vec<PortInfo> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .map(|fname| PortInfo::bare(format!("/dev/{}", fname)))
        .filter(|port| port.kind().0 != PortKind::Other)
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn dev_nodes() -> Vec<PortInfo> {
    Vec::new()
}

/// Sort candidates for discovery and drop duplicate names
fn order_ports(mut ports: Vec<PortInfo>) -> Vec<PortInfo> {
    ports.sort_by_key(PortInfo::discovery_order);
    ports.dedup_by(|later, earlier| later.name == earlier.name);
    ports
}

/// List available serial ports, likely flight controllers first
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.extend(dev_nodes());
    order_ports(ports)
}

/// Open `name` at `baud` and configure it for MSP
pub fn open_port(name: &str, baud: u32) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let mut port = serialport::new(name, baud)
        .timeout(Duration::from_millis(READ_TIMEOUT_MS))
        .open()
        .map_err(|e| ProtocolError::SerialError(format!("{}: {}", name, e)))?;
    configure_port(port.as_mut())?;
    debug!(port = name, baud, "Serial port opened");
    Ok(port)
}

/// Standard 8N1, no flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    Ok(())
}
