// Serial bridge to the microcontroller that owns the I2C bus and PWM pins
//
// Packet format: [0xFF, 0xFF, Device, Length, Instruction, Params..., Checksum]
// Response:      [0xFF, 0xFF, Device, Length, Status, Data..., Checksum]

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use crate::imu::RegisterBus;
use crate::motor::PwmOutput;

/// Default serial configuration for the bridge firmware
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;

/// Device address of the PWM block on the bridge
pub const PWM_DEVICE: u8 = 0x10;

/// PWM register layout: duty is u16 LE at 2*channel, frequency is u32 LE at 0x40 + 4*channel
const PWM_DUTY_BASE: u8 = 0x00;
const PWM_FREQ_BASE: u8 = 0x40;

/// Highest channel whose frequency register (0x40 + 4*47 = 0xFC..0xFF) fits in 8 bits
pub const MAX_PWM_CHANNEL: u8 = 47;

/// Duty values are 16-bit on the bridge
pub const HARDWARE_MAX_DUTY: u16 = u16::MAX;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Error types for bridge communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from device 0x{device:02X}: {reason}")]
    InvalidResponse { device: u8, reason: String },

    #[error("Checksum mismatch for device 0x{device:02X}")]
    ChecksumMismatch { device: u8 },

    #[error("Device 0x{device:02X} returned error status: 0x{status:02X}")]
    DeviceError { device: u8, status: u8 },

    #[error("Timeout waiting for response from device 0x{device:02X}")]
    Timeout { device: u8 },

    #[error("PWM channel {channel} out of range (max {max})", max = MAX_PWM_CHANNEL)]
    InvalidChannel { channel: u8 },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Serial bridge handle
pub struct SerialBridge {
    port: Box<dyn SerialPort>,
}

impl SerialBridge {
    /// Open the bridge with a read timeout; the timeout must stay below one tick period
    pub fn open(port_name: &str, timeout: Duration) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE, timeout)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baudrate).timeout(timeout).open()?;
        Ok(Self { port })
    }

    /// Second handle on the same port, so the IMU and the motors can each own one
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            port: self.port.try_clone()?,
        })
    }

    /// Calculate checksum for a packet (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(device: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(device);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);

        let checksum_data = &packet[2..];
        packet.push(Self::checksum(checksum_data));

        packet
    }

    /// Validate the body of a response (everything after device and length) and return its data
    fn parse_response(device: u8, length: u8, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < 2 {
            return Err(BusError::InvalidResponse {
                device,
                reason: format!("Response too short: {} bytes", body.len()),
            });
        }

        let mut checksum_data = vec![device, length];
        checksum_data.extend_from_slice(&body[..body.len() - 1]);
        if Self::checksum(&checksum_data) != body[body.len() - 1] {
            return Err(BusError::ChecksumMismatch { device });
        }

        let status = body[0];
        if status != 0 {
            return Err(BusError::DeviceError { device, status });
        }

        Ok(body[1..body.len() - 1].to_vec())
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, device: u8, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                BusError::Timeout { device }
            } else {
                BusError::Io(e)
            }
        })
    }

    fn read_response(&mut self, expected: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.read_exact(expected, &mut header)?;

        if header != HEADER {
            return Err(BusError::InvalidResponse {
                device: expected,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut device_length = [0u8; 2];
        self.read_exact(expected, &mut device_length)?;
        let [device, length] = device_length;

        if device != expected {
            return Err(BusError::InvalidResponse {
                device: expected,
                reason: format!("Device mismatch: expected 0x{:02X}, got 0x{:02X}", expected, device),
            });
        }

        let mut body = vec![0u8; length as usize];
        self.read_exact(expected, &mut body)?;

        Self::parse_response(device, length, &body)
    }

    /// Ping a device behind the bridge
    pub fn ping(&mut self, device: u8) -> Result<bool> {
        let packet = Self::build_packet(device, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response(device) {
            Ok(_) => Ok(true),
            Err(BusError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read `len` bytes starting at `addr`
    pub fn read(&mut self, device: u8, addr: u8, len: u8) -> Result<Vec<u8>> {
        let packet = Self::build_packet(device, Instruction::Read, &[addr, len]);
        self.send_packet(&packet)?;

        let data = self.read_response(device)?;
        if data.len() != len as usize {
            return Err(BusError::InvalidResponse {
                device,
                reason: format!("Expected {} bytes, got {}", len, data.len()),
            });
        }
        Ok(data)
    }

    /// Write bytes starting at `addr` and wait for the status response
    pub fn write(&mut self, device: u8, addr: u8, data: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(addr);
        params.extend_from_slice(data);

        let packet = Self::build_packet(device, Instruction::Write, &params);
        debug!("Write to device 0x{:02X}: addr=0x{:02X}, {} bytes", device, addr, data.len());
        self.send_packet(&packet)?;

        let _ = self.read_response(device)?;
        Ok(())
    }
}

impl RegisterBus for SerialBridge {
    fn read_registers(&mut self, device: u8, addr: u8, buf: &mut [u8]) -> Result<()> {
        let data = self.read(device, addr, buf.len() as u8)?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn write_registers(&mut self, device: u8, addr: u8, data: &[u8]) -> Result<()> {
        self.write(device, addr, data)
    }
}

impl PwmOutput for SerialBridge {
    fn max_duty(&self) -> u16 {
        HARDWARE_MAX_DUTY
    }

    fn set_duty(&mut self, channel: u8, duty: u16) -> Result<()> {
        self.write(PWM_DEVICE, duty_register(channel)?, &duty.to_le_bytes())
    }

    fn set_frequency(&mut self, channel: u8, hz: u32) -> Result<()> {
        self.write(PWM_DEVICE, frequency_register(channel)?, &hz.to_le_bytes())
    }
}

fn duty_register(channel: u8) -> Result<u8> {
    if channel > MAX_PWM_CHANNEL {
        return Err(BusError::InvalidChannel { channel });
    }
    Ok(PWM_DUTY_BASE + 2 * channel)
}

fn frequency_register(channel: u8) -> Result<u8> {
    if channel > MAX_PWM_CHANNEL {
        return Err(BusError::InvalidChannel { channel });
    }
    Ok(PWM_FREQ_BASE + 4 * channel)
}
