//! Dynamixel Protocol 1.0 definitions
//!
//! Reference: Dynamixel Protocol 1.0 e-Manual, MX/AX series control table
//!
//! Protocol Overview:
//! - Instruction packet: `FF FF [ID] [LEN] [INST] [PARAM..] [CHK]`
//! - Status packet:      `FF FF [ID] [LEN] [ERR]  [PARAM..] [CHK]`
//! - `LEN` = number of parameters + 2
//! - `CHK` = `!(ID + LEN + INST/ERR + sum(PARAM)) & 0xFF`
//! - Multi-byte register values are little-endian
//! - Timing: half-duplex request-response, one device answers per request
//!
//! Every exchange reports two independent status channels: a [`CommResult`]
//! describing what happened on the wire, and a [`DeviceError`] bitfield the
//! servo puts in its status packet.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

/// Baud rate negotiated on connect unless configured otherwise.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Position the servos return to when `home` is called without a target.
pub const DEFAULT_HOME_POSITION: u16 = 0;

const HEADER: [u8; 2] = [0xFF, 0xFF];
const BROADCAST_ID: u8 = 0xFE;
const MAX_ID: u8 = 0xFD;

/// Bus address of a single servo.
///
/// Valid addresses are 1..=253; 254 is the broadcast address and never answers a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u8);

impl DeviceId {
    /// Validate a raw bus address.
    pub fn new(id: u8) -> Option<Self> {
        (1..=MAX_ID).contains(&id).then_some(Self(id))
    }

    /// Raw address as sent on the wire.
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u8 = s
            .parse()
            .map_err(|_| format!("'{}' is not a servo id", s))?;
        DeviceId::new(raw).ok_or_else(|| format!("servo id {} out of range 1..={}", raw, MAX_ID))
    }
}

impl TryFrom<u8> for DeviceId {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        DeviceId::new(raw).ok_or_else(|| format!("servo id {} out of range 1..={}", raw, MAX_ID))
    }
}

/// Width of a control table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    /// Single byte
    Byte,
    /// Two bytes, little-endian
    Word,
}

impl RegisterWidth {
    /// Number of bytes on the wire.
    pub const fn len(self) -> u8 {
        match self {
            RegisterWidth::Byte => 1,
            RegisterWidth::Word => 2,
        }
    }

    fn encode(self, value: u16) -> Option<Vec<u8>> {
        match self {
            RegisterWidth::Byte => u8::try_from(value).ok().map(|byte| vec![byte]),
            RegisterWidth::Word => Some(value.to_le_bytes().to_vec()),
        }
    }

    fn decode(self, data: &[u8]) -> Option<u16> {
        match (self, data) {
            (RegisterWidth::Byte, [lo, ..]) => Some(u16::from(*lo)),
            (RegisterWidth::Word, [lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

/// Fixed-address, fixed-width control table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    /// Control table address
    pub address: u8,
    /// Entry width
    pub width: RegisterWidth,
}

impl Register {
    /// Model number, read back by ping
    pub const MODEL_NUMBER: Register = Register::new(0, RegisterWidth::Word);
    /// Actuation on/off
    pub const TORQUE_ENABLE: Register = Register::new(24, RegisterWidth::Byte);
    /// Commanded target position
    pub const GOAL_POSITION: Register = Register::new(30, RegisterWidth::Word);
    /// Measured position
    pub const PRESENT_POSITION: Register = Register::new(36, RegisterWidth::Word);

    /// Describe a control table entry.
    pub const fn new(address: u8, width: RegisterWidth) -> Self {
        Self { address, width }
    }

    /// Encode a value for a WRITE instruction; `None` if it does not fit.
    pub fn encode(&self, value: u16) -> Option<Vec<u8>> {
        self.width.encode(value)
    }

    /// Decode the parameters of a READ status packet.
    pub fn decode(&self, data: &[u8]) -> Option<u16> {
        self.width.decode(data)
    }
}

/// Transport-level outcome of one exchange.
///
/// Discriminants are the numeric codes used by the Dynamixel SDKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CommResult {
    /// Status packet received and verified
    Success = 0,
    /// Port is in use by another exchange
    PortBusy = -1,
    /// Instruction packet could not be transmitted
    TxFail = -2,
    /// Status packet could not be received
    RxFail = -3,
    /// Instruction packet was malformed
    TxError = -4,
    /// Status packet reception still in progress
    RxWaiting = -5,
    /// No status packet arrived before the timeout
    RxTimeout = -6,
    /// Status packet failed validation
    RxCorrupt = -7,
    /// Operation not supported by this protocol version
    NotAvailable = -9,
}

impl CommResult {
    /// True only for [`CommResult::Success`].
    pub const fn is_success(self) -> bool {
        matches!(self, CommResult::Success)
    }
}

impl fmt::Display for CommResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommResult::Success => "[TxRxResult] Communication success!",
            CommResult::PortBusy => "[TxRxResult] Port is in use!",
            CommResult::TxFail => "[TxRxResult] Failed transmit instruction packet!",
            CommResult::RxFail => "[TxRxResult] Failed get status packet from device!",
            CommResult::TxError => "[TxRxResult] Incorrect instruction packet!",
            CommResult::RxWaiting => "[TxRxResult] Now receiving status packet!",
            CommResult::RxTimeout => "[TxRxResult] There is no status packet!",
            CommResult::RxCorrupt => "[TxRxResult] Incorrect status packet!",
            CommResult::NotAvailable => "[TxRxResult] Protocol does not support this function!",
        };
        f.write_str(text)
    }
}

bitflags! {
    /// Error bits reported by the servo in every status packet. Zero means no error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceError: u8 {
        /// Input voltage out of the configured range.
        const INPUT_VOLTAGE = 0x01;
        /// Goal position outside the CW/CCW angle limits.
        const ANGLE_LIMIT   = 0x02;
        /// Internal temperature above the limit.
        const OVERHEAT      = 0x04;
        /// Instruction parameter out of range.
        const RANGE         = 0x08;
        /// Instruction packet checksum mismatch.
        const CHECKSUM      = 0x10;
        /// Load exceeds the maximum torque.
        const OVERLOAD      = 0x20;
        /// Undefined instruction, or action without reg_write.
        const INSTRUCTION   = 0x40;
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Report the lowest set bit, like the vendor SDK does.
        let text = if self.contains(DeviceError::INPUT_VOLTAGE) {
            "[RxPacketError] Input voltage error!"
        } else if self.contains(DeviceError::ANGLE_LIMIT) {
            "[RxPacketError] Angle limit error!"
        } else if self.contains(DeviceError::OVERHEAT) {
            "[RxPacketError] Overheat error!"
        } else if self.contains(DeviceError::RANGE) {
            "[RxPacketError] Out of range error!"
        } else if self.contains(DeviceError::CHECKSUM) {
            "[RxPacketError] Checksum error!"
        } else if self.contains(DeviceError::OVERLOAD) {
            "[RxPacketError] Overload error!"
        } else if self.contains(DeviceError::INSTRUCTION) {
            "[RxPacketError] Instruction code error!"
        } else {
            "[RxPacketError] No error"
        };
        f.write_str(text)
    }
}

/// The two status channels of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRxStatus {
    /// Wire-level outcome
    pub comm: CommResult,
    /// Device-reported error bits (empty unless `comm` is success)
    pub error: DeviceError,
}

impl TxRxStatus {
    /// Successful exchange with no device error.
    pub const OK: TxRxStatus = TxRxStatus {
        comm: CommResult::Success,
        error: DeviceError::empty(),
    };

    /// Exchange that failed on the wire.
    pub const fn comm_failure(comm: CommResult) -> Self {
        Self {
            comm,
            error: DeviceError::empty(),
        }
    }

    /// Successful exchange carrying device error bits.
    pub const fn device_error(error: DeviceError) -> Self {
        Self {
            comm: CommResult::Success,
            error,
        }
    }

    /// Both channels clean.
    pub fn is_ok(&self) -> bool {
        self.comm.is_success() && self.error.is_empty()
    }

    /// Comm result first, then device error.
    pub fn check(&self) -> Result<(), crate::error::CommandError> {
        if !self.comm.is_success() {
            return Err(crate::error::CommandError::Comm(self.comm));
        }
        if !self.error.is_empty() {
            return Err(crate::error::CommandError::Device(self.error));
        }
        Ok(())
    }
}

/// Result of a register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRead {
    /// Decoded value; meaningless unless `status` is ok
    pub value: u16,
    /// Exchange status
    pub status: TxRxStatus,
}

impl RegisterRead {
    /// Read that failed on the wire.
    pub const fn comm_failure(comm: CommResult) -> Self {
        Self {
            value: 0,
            status: TxRxStatus::comm_failure(comm),
        }
    }
}

/// Result of a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    /// Model number; meaningless unless `status` is ok
    pub model: u16,
    /// Exchange status
    pub status: TxRxStatus,
}

/// Protocol 1.0 instruction codes used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    /// Presence check, no parameters
    Ping = 0x01,
    /// `[address, length]`
    Read = 0x02,
    /// `[address, data..]`
    Write = 0x03,
}

fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Outgoing instruction packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPacket {
    id: u8,
    instruction: Instruction,
    params: Vec<u8>,
}

impl InstructionPacket {
    /// PING instruction.
    pub fn ping(id: DeviceId) -> Self {
        Self {
            id: id.get(),
            instruction: Instruction::Ping,
            params: Vec::new(),
        }
    }

    /// READ instruction for one register.
    pub fn read(id: DeviceId, register: Register) -> Self {
        Self {
            id: id.get(),
            instruction: Instruction::Read,
            params: vec![register.address, register.width.len()],
        }
    }

    /// WRITE instruction for one register, or `None` when `value` is wider
    /// than the register.
    pub fn write(id: DeviceId, register: Register, value: u16) -> Option<Self> {
        let mut params = Vec::with_capacity(1 + register.width.len() as usize);
        params.push(register.address);
        params.extend(register.encode(value)?);
        Some(Self {
            id: id.get(),
            instruction: Instruction::Write,
            params,
        })
    }

    /// Target address of this packet.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(6 + self.params.len());
        bytes.extend_from_slice(&HEADER);
        bytes.push(self.id);
        bytes.push(self.params.len() as u8 + 2);
        bytes.push(self.instruction as u8);
        bytes.extend_from_slice(&self.params);
        bytes.push(checksum(&bytes[2..]));
        bytes
    }
}

/// Incoming status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    /// Responding device
    pub id: u8,
    /// Device error bits
    pub error: DeviceError,
    /// Returned data (READ replies)
    pub params: Vec<u8>,
}

/// Outcome of scanning a receive buffer for a status packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not enough bytes yet
    Incomplete,
    /// Bytes present but not a valid packet
    Corrupt,
    /// Complete packet; `consumed` bytes of the buffer were used
    Packet {
        /// Decoded packet
        packet: StatusPacket,
        /// Bytes consumed from the start of the buffer
        consumed: usize,
    },
}

impl StatusPacket {
    /// Scan `buf` for one status packet, skipping leading noise before the header.
    pub fn parse(buf: &[u8]) -> ParseOutcome {
        let Some(start) = buf.windows(2).position(|w| w == HEADER) else {
            return ParseOutcome::Incomplete;
        };
        let frame = &buf[start..];
        if frame.len() < 5 {
            return ParseOutcome::Incomplete;
        }

        let id = frame[2];
        let len = frame[3] as usize;
        if id > BROADCAST_ID || len < 2 {
            return ParseOutcome::Corrupt;
        }

        let total = 4 + len;
        if frame.len() < total {
            return ParseOutcome::Incomplete;
        }

        let body = &frame[2..total - 1];
        if checksum(body) != frame[total - 1] {
            return ParseOutcome::Corrupt;
        }

        ParseOutcome::Packet {
            packet: StatusPacket {
                id,
                error: DeviceError::from_bits_truncate(frame[4]),
                params: frame[5..total - 1].to_vec(),
            },
            consumed: start + total,
        }
    }

    /// Serialize a status packet, as a servo would send it.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(6 + self.params.len());
        bytes.extend_from_slice(&HEADER);
        bytes.push(self.id);
        bytes.push(self.params.len() as u8 + 2);
        bytes.push(self.error.bits());
        bytes.extend_from_slice(&self.params);
        bytes.push(checksum(&bytes[2..]));
        bytes
    }
}
