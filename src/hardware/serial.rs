//! Dynamixel Protocol 1.0 transport over a serial port
//!
//! Uses tokio-serial so that waiting for a status packet yields to other
//! sessions instead of blocking the thread. One instruction packet is written,
//! then bytes are collected until a complete status packet parses, the packet
//! turns out corrupt, or the read timeout expires.
//!
//! # Example Usage
//!
//! ```no_run
//! use servo_stand::hardware::protocol::{DeviceId, Register};
//! use servo_stand::hardware::serial::SerialTransport;
//! use servo_stand::hardware::transport::Transport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut link = SerialTransport::new("/dev/ttyUSB0");
//!     if link.open().await && link.set_baud_rate(57600).await {
//!         let id = DeviceId::new(1).unwrap();
//!         let read = link.read_register(id, Register::PRESENT_POSITION).await;
//!         println!("Position: {} ({})", read.value, read.status.comm);
//!     }
//!     link.close();
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::hardware::protocol::{
    CommResult, DeviceId, InstructionPacket, ParseOutcome, PingReply, Register, RegisterRead,
    StatusPacket, TxRxStatus, DEFAULT_BAUD_RATE,
};
use crate::hardware::transport::Transport;

/// Default time to wait for a status packet.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port speaking Dynamixel Protocol 1.0
pub struct SerialTransport {
    /// Serial port path (e.g., "/dev/ttyUSB0" on Linux, "COM3" on Windows)
    port_name: String,
    /// Rate used to open the port; replaced by `set_baud_rate`
    baud_rate: u32,
    /// Time allowed for a complete status packet
    read_timeout: Duration,
    port: Option<SerialStream>,
}

impl SerialTransport {
    /// Closed transport for `port_name` with default settings.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            port: None,
        }
    }

    /// Override the status packet timeout.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Send one instruction packet and wait for its status packet.
    async fn transaction(&mut self, packet: InstructionPacket) -> Result<StatusPacket, CommResult> {
        let read_timeout = self.read_timeout;
        let port = self.port.as_mut().ok_or(CommResult::TxFail)?;

        // Drop anything left over from an earlier, abandoned exchange
        if let Err(e) = SerialPort::clear(port, ClearBuffer::Input) {
            debug!(error = %e, "Failed to clear serial input buffer");
        }

        port.write_all(&packet.encode()).await.map_err(|e| {
            debug!(error = %e, "Dynamixel write failed");
            CommResult::TxFail
        })?;

        let deadline = Instant::now() + read_timeout;
        let mut response = Vec::with_capacity(32);
        let mut buf = [0u8; 64];

        loop {
            match StatusPacket::parse(&response) {
                ParseOutcome::Packet { packet: status, .. } => {
                    if status.id != packet.id() {
                        debug!(expected = packet.id(), got = status.id, "Status from wrong device");
                        return Err(CommResult::RxCorrupt);
                    }
                    return Ok(status);
                }
                ParseOutcome::Corrupt => return Err(CommResult::RxCorrupt),
                ParseOutcome::Incomplete => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let timed_out = if response.is_empty() {
                CommResult::RxTimeout
            } else {
                CommResult::RxCorrupt
            };
            if remaining.is_zero() {
                return Err(timed_out);
            }

            match tokio::time::timeout(remaining, port.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(CommResult::RxFail),
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => {
                    debug!(error = %e, "Dynamixel read failed");
                    return Err(CommResult::RxFail);
                }
                Err(_) => return Err(timed_out),
            }
        }
    }
}

// A servo reporting an error may omit the data; that is a device error, not a
// corrupt reply.
fn decode_read(register: Register, status: &StatusPacket) -> RegisterRead {
    match register.decode(&status.params) {
        Some(value) => RegisterRead {
            value,
            status: TxRxStatus::device_error(status.error),
        },
        None if !status.error.is_empty() => RegisterRead {
            value: 0,
            status: TxRxStatus::device_error(status.error),
        },
        None => RegisterRead::comm_failure(CommResult::RxCorrupt),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> bool {
        if self.port.is_some() {
            return true;
        }
        // 8N1 with no flow control, as the Dynamixel bus expects
        let opened = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async();

        match opened {
            Ok(port) => {
                debug!(port = %self.port_name, "Opened serial port");
                self.port = Some(port);
                true
            }
            Err(e) => {
                warn!(port = %self.port_name, error = %e, "Failed to open serial port");
                false
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Closed serial port");
        }
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        match SerialPort::set_baud_rate(port, baud_rate) {
            Ok(()) => {
                self.baud_rate = baud_rate;
                true
            }
            Err(e) => {
                warn!(port = %self.port_name, baud_rate, error = %e, "Baud rate rejected");
                false
            }
        }
    }

    async fn ping(&mut self, id: DeviceId) -> PingReply {
        let status = match self.transaction(InstructionPacket::ping(id)).await {
            Ok(status) => status,
            Err(comm) => {
                return PingReply {
                    model: 0,
                    status: TxRxStatus::comm_failure(comm),
                }
            }
        };
        if !status.error.is_empty() {
            return PingReply {
                model: 0,
                status: TxRxStatus::device_error(status.error),
            };
        }

        // Protocol 1.0 ping carries no payload; the model number is a register
        let model = self.read_register(id, Register::MODEL_NUMBER).await;
        PingReply {
            model: model.value,
            status: model.status,
        }
    }

    async fn read_register(&mut self, id: DeviceId, register: Register) -> RegisterRead {
        match self.transaction(InstructionPacket::read(id, register)).await {
            Ok(status) => decode_read(register, &status),
            Err(comm) => RegisterRead::comm_failure(comm),
        }
    }

    async fn write_register(
        &mut self,
        id: DeviceId,
        register: Register,
        value: u16,
    ) -> TxRxStatus {
        let Some(packet) = InstructionPacket::write(id, register, value) else {
            debug!(id = %id, address = register.address, value, "Value does not fit register");
            return TxRxStatus::comm_failure(CommResult::TxError);
        };
        match self.transaction(packet).await {
            Ok(status) => TxRxStatus::device_error(status.error),
            Err(comm) => TxRxStatus::comm_failure(comm),
        }
    }
}
