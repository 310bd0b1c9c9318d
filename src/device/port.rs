//! Serial port discovery
//!
//! Candidate ports are filtered by USB vendor id and port name, then opened
//! one at a time. A port is accepted once it produces a heartbeat frame
//! within the probe window. The first accepted port wins; the remaining
//! candidates are never opened.

use super::codec::{DecodeOutcome, FrameDecoder, Opcode};
use crate::error::{PedlError, Result};
use serialport::{SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Baud rate of the pedal board firmware
pub const BAUD_RATE: u32 = 57_600;

/// Read timeout of an open port; a timeout is the loop's idle signal
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// USB vendor ids of Arduino-compatible boards and common USB-serial bridges
const CANDIDATE_VIDS: &[u16] = &[0x2341, 0x2A03, 0x1A86, 0x0403, 0x16C0, 0x10C4];

/// Name fragments of USB-serial device nodes
const CANDIDATE_NAMES: &[&str] = &["usbmodem", "ttyACM", "usbserial", "ttyUSB"];

/// An open byte link to the device
pub trait SerialLink: Read + Write + Send {
    /// Name of the port, for logs
    fn port_name(&self) -> &str;
}

/// Source of candidate ports
pub trait PortDiscovery: Send {
    /// Names of ports that may be a pedal board, most likely first
    fn candidates(&mut self) -> Vec<String>;

    /// Open a port by name
    fn open(&mut self, name: &str) -> io::Result<Box<dyn SerialLink>>;
}

/// A system serial port opened through `serialport`
pub struct SystemLink {
    name: String,
    port: Box<dyn serialport::SerialPort>,
}

impl Read for SystemLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SystemLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for SystemLink {
    fn port_name(&self) -> &str {
        &self.name
    }
}

/// Discovery over the ports reported by the operating system
#[derive(Debug, Default)]
pub struct SystemPorts;

impl SystemPorts {
    pub fn new() -> Self {
        Self
    }

    fn is_candidate(info: &SerialPortInfo) -> bool {
        let by_vid = match &info.port_type {
            SerialPortType::UsbPort(usb) => CANDIDATE_VIDS.contains(&usb.vid),
            _ => false,
        };
        by_vid
            || CANDIDATE_NAMES
                .iter()
                .any(|fragment| info.port_name.contains(fragment))
    }
}

impl PortDiscovery for SystemPorts {
    fn candidates(&mut self) -> Vec<String> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!("Could not enumerate serial ports: {}", e);
                return Vec::new();
            }
        };
        let (mut usb, other): (Vec<_>, Vec<_>) = ports
            .into_iter()
            .filter(Self::is_candidate)
            .partition(|p| matches!(p.port_type, SerialPortType::UsbPort(_)));
        usb.extend(other);
        usb.into_iter().map(|p| p.port_name).collect()
    }

    fn open(&mut self, name: &str) -> io::Result<Box<dyn SerialLink>> {
        let port = serialport::new(name, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(SystemLink {
            name: name.to_string(),
            port,
        }))
    }
}

/// Wait up to `timeout` for a heartbeat on an open link
pub fn probe_port(link: &mut dyn SerialLink, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut decoder = FrameDecoder::new();
    while Instant::now() < deadline {
        match decoder.decode(link)? {
            DecodeOutcome::Frame(frame) if frame.opcode == Opcode::Heartbeat => return Ok(true),
            other => tracing::trace!("probe {}: {:?}", link.port_name(), other),
        }
    }
    Ok(false)
}

/// Find the first candidate port that answers with a heartbeat
pub fn discover_device(
    discovery: &mut dyn PortDiscovery,
    probe_timeout: Duration,
) -> Result<Box<dyn SerialLink>> {
    let candidates = discovery.candidates();
    if candidates.is_empty() {
        return Err(PedlError::DeviceNotFound("no candidate serial ports".to_string()));
    }

    for name in &candidates {
        let mut link = match discovery.open(name) {
            Ok(link) => link,
            Err(e) => {
                tracing::debug!("Could not open {}: {}", name, e);
                continue;
            }
        };
        match probe_port(link.as_mut(), probe_timeout) {
            Ok(true) => {
                tracing::info!("Found device on {}", name);
                return Ok(link);
            }
            Ok(false) => tracing::debug!("No heartbeat on {}", name),
            Err(e) => tracing::debug!("Probe of {} failed: {}", name, e),
        }
    }

    Err(PedlError::DeviceNotFound(format!(
        "no heartbeat on {}",
        candidates.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, MockDiscovery};

    impl std::fmt::Debug for dyn SerialLink {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_tuple("SerialLink").field(&self.port_name()).finish()
        }
    }

    #[test]
    fn test_discover_first_heartbeat_wins() {
        let silent = MockDevice::new();
        silent.set_heartbeat_on_open(false);
        let device = MockDevice::new();
        let mut discovery = MockDiscovery::new(vec![
            ("/dev/silent".to_string(), silent.clone()),
            ("/dev/pedal".to_string(), device.clone()),
            ("/dev/unused".to_string(), MockDevice::new()),
        ]);

        let link = discover_device(&mut discovery, Duration::from_millis(100)).unwrap();
        assert_eq!(link.port_name(), "/dev/pedal");
        assert_eq!(discovery.opened(), vec!["/dev/silent", "/dev/pedal"]);
    }

    #[test]
    fn test_discover_nothing() {
        let mut discovery = MockDiscovery::new(vec![]);
        let err = discover_device(&mut discovery, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unplugged_device_not_found() {
        let device = MockDevice::new();
        device.unplug();
        let mut discovery = MockDiscovery::new(vec![("/dev/pedal".to_string(), device)]);
        assert!(matches!(
            discover_device(&mut discovery, Duration::from_millis(10)),
            Err(PedlError::DeviceNotFound(_))
        ));
    }
}
