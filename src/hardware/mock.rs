//! Mock Hardware Implementations
//!
//! Provides a simulated servo bus for testing without physical hardware.
//! All waiting uses tokio::time::sleep, so tests may run on a paused clock.
//!
//! # Available Mocks
//!
//! - `MockTransport` - Simulated half-duplex bus with any number of servos
//! - `MockServo` - One simulated servo: control table, motion, fault injection
//!
//! # Behaviour
//!
//! - Requests to an address with no servo time out (`RxTimeout`)
//! - Requests on a closed link fail to transmit (`TxFail`)
//! - A servo either jumps straight to its goal (default) or moves `step` units
//!   toward it on every present-position read
//! - Every exchange is recorded as a [`MockEvent`] for assertions; the log keeps
//!   the most recent [`EVENT_LOG_CAPACITY`] entries

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::hardware::protocol::{
    CommResult, DeviceError, DeviceId, PingReply, Register, RegisterRead, TxRxStatus,
};
use crate::hardware::transport::Transport;

/// AX-12 model number, reported by simulated servos unless overridden.
pub const MOCK_MODEL_NUMBER: u16 = 12;

/// Most recent interactions kept by a [`MockTransport`]; older ones are dropped.
pub const EVENT_LOG_CAPACITY: usize = 4096;

// =============================================================================
// MockServo - Simulated servo
// =============================================================================

/// Simulated servo with fault injection
///
/// # Example
///
/// ```rust,ignore
/// let servo = MockServo::new(id).at(300).moving(25);
/// let bus = MockTransport::new("/dev/ttyMOCK0").with_servo(servo);
/// ```
#[derive(Debug, Clone)]
pub struct MockServo {
    id: DeviceId,
    model: u16,
    present: u16,
    goal: u16,
    torque: bool,
    step: Option<u16>,
    ping_failure: Option<CommResult>,
    read_failure: Option<CommResult>,
    write_failure: Option<CommResult>,
    torque_enable_failure: Option<CommResult>,
    device_error: DeviceError,
}

impl MockServo {
    /// Healthy servo at position 0 that jumps straight to its goal.
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            model: MOCK_MODEL_NUMBER,
            present: 0,
            goal: 0,
            torque: false,
            step: None,
            ping_failure: None,
            read_failure: None,
            write_failure: None,
            torque_enable_failure: None,
            device_error: DeviceError::empty(),
        }
    }

    /// Report a different model number.
    pub fn model(mut self, model: u16) -> Self {
        self.model = model;
        self
    }

    /// Start at `position`.
    pub fn at(mut self, position: u16) -> Self {
        self.present = position;
        self.goal = position;
        self
    }

    /// Move `step` units toward the goal on every present-position read.
    pub fn moving(mut self, step: u16) -> Self {
        self.step = Some(step.max(1));
        self
    }

    /// Fail every ping on the wire.
    pub fn ping_failure(mut self, comm: CommResult) -> Self {
        self.ping_failure = Some(comm);
        self
    }

    /// Fail every register read on the wire.
    pub fn read_failure(mut self, comm: CommResult) -> Self {
        self.read_failure = Some(comm);
        self
    }

    /// Fail every register write on the wire.
    pub fn write_failure(mut self, comm: CommResult) -> Self {
        self.write_failure = Some(comm);
        self
    }

    /// Fail only writes that switch torque on.
    pub fn torque_enable_failure(mut self, comm: CommResult) -> Self {
        self.torque_enable_failure = Some(comm);
        self
    }

    /// Report these error bits in every status packet.
    pub fn device_error(mut self, error: DeviceError) -> Self {
        self.device_error = error;
        self
    }

    /// Bus address.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Current simulated position.
    pub fn present_position(&self) -> u16 {
        self.present
    }

    /// Last commanded goal.
    pub fn goal_position(&self) -> u16 {
        self.goal
    }

    /// Whether torque is currently enabled.
    pub fn torque_enabled(&self) -> bool {
        self.torque
    }

    fn status(&self) -> TxRxStatus {
        TxRxStatus::device_error(self.device_error)
    }

    fn advance(&mut self) {
        let Some(step) = self.step else {
            return;
        };
        if self.present < self.goal {
            self.present = self.present.saturating_add(step).min(self.goal);
        } else if self.present > self.goal {
            self.present = self.present.saturating_sub(step).max(self.goal);
        }
    }

    fn read(&mut self, register: Register) -> RegisterRead {
        if let Some(comm) = self.read_failure {
            return RegisterRead::comm_failure(comm);
        }
        let value = match register.address {
            a if a == Register::PRESENT_POSITION.address => {
                self.advance();
                self.present
            }
            a if a == Register::GOAL_POSITION.address => self.goal,
            a if a == Register::TORQUE_ENABLE.address => u16::from(self.torque),
            a if a == Register::MODEL_NUMBER.address => self.model,
            _ => {
                return RegisterRead {
                    value: 0,
                    status: TxRxStatus::device_error(self.device_error | DeviceError::RANGE),
                }
            }
        };
        RegisterRead {
            value,
            status: self.status(),
        }
    }

    fn write(&mut self, register: Register, value: u16) -> TxRxStatus {
        if let Some(comm) = self.write_failure {
            return TxRxStatus::comm_failure(comm);
        }
        match register.address {
            a if a == Register::TORQUE_ENABLE.address => {
                if value != 0 {
                    if let Some(comm) = self.torque_enable_failure {
                        return TxRxStatus::comm_failure(comm);
                    }
                }
                self.torque = value != 0;
            }
            a if a == Register::GOAL_POSITION.address => {
                self.goal = value;
                if self.step.is_none() {
                    self.present = value;
                }
            }
            _ => return TxRxStatus::device_error(self.device_error | DeviceError::RANGE),
        }
        self.status()
    }
}

// =============================================================================
// MockTransport - Simulated bus
// =============================================================================

/// One recorded bus interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Link opened
    Open,
    /// Link closed
    Close,
    /// Baud rate changed
    SetBaudRate(u32),
    /// Ping sent
    Ping {
        /// Target address
        id: u8,
    },
    /// Register read sent
    Read {
        /// Target address
        id: u8,
        /// Control table address
        address: u8,
        /// When the request went out
        at: Instant,
    },
    /// Register write sent
    Write {
        /// Target address
        id: u8,
        /// Control table address
        address: u8,
        /// Written value
        value: u16,
    },
}

#[derive(Debug, Default)]
struct MockBusState {
    open: bool,
    open_fails: bool,
    baud_rejected: bool,
    baud_rate: Option<u32>,
    latency: Duration,
    servos: BTreeMap<DeviceId, MockServo>,
    events: VecDeque<MockEvent>,
    opens: usize,
    closes: usize,
    in_flight: usize,
    max_in_flight: usize,
}

impl MockBusState {
    fn record(&mut self, event: MockEvent) {
        if self.events.len() == EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Counts one exchange as in progress until dropped, including when the
/// exchange is cancelled mid-flight.
struct InFlight<'a>(&'a Mutex<MockBusState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

/// Simulated half-duplex servo bus
///
/// Cloning shares the simulated bus, so a test can keep a clone for
/// inspection after handing the original to a session.
#[derive(Debug, Clone)]
pub struct MockTransport {
    port_name: String,
    state: Arc<Mutex<MockBusState>>,
}

impl MockTransport {
    /// Empty bus with no servos attached.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            state: Arc::new(Mutex::new(MockBusState::default())),
        }
    }

    /// Pan (id 1) and tilt (id 2) servos that move visibly toward their goals.
    pub fn pan_tilt(port_name: impl Into<String>) -> Self {
        let pan = DeviceId::new(1).map(|id| MockServo::new(id).at(300).moving(40));
        let tilt = DeviceId::new(2).map(|id| MockServo::new(id).at(700).moving(40));
        pan.into_iter()
            .chain(tilt)
            .fold(Self::new(port_name), Self::with_servo)
            .with_latency(Duration::from_millis(2))
    }

    /// Attach a servo.
    pub fn with_servo(self, servo: MockServo) -> Self {
        self.state.lock().servos.insert(servo.id, servo);
        self
    }

    /// Make `open` fail.
    pub fn failing_open(self) -> Self {
        self.state.lock().open_fails = true;
        self
    }

    /// Make `set_baud_rate` fail.
    pub fn rejecting_baud_rate(self) -> Self {
        self.state.lock().baud_rejected = true;
        self
    }

    /// Simulated wire time per exchange.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Recorded interactions, oldest first, up to [`EVENT_LOG_CAPACITY`].
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Values written to TORQUE_ENABLE of `id`, oldest first.
    pub fn torque_writes(&self, id: DeviceId) -> Vec<u16> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                MockEvent::Write { id: target, address, value }
                    if *target == id.get() && *address == Register::TORQUE_ENABLE.address =>
                {
                    Some(*value)
                }
                _ => None,
            })
            .collect()
    }

    /// Send times of every read of `register` on `id`.
    pub fn reads_of(&self, id: DeviceId, register: Register) -> Vec<Instant> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                MockEvent::Read { id: target, address, at }
                    if *target == id.get() && *address == register.address =>
                {
                    Some(*at)
                }
                _ => None,
            })
            .collect()
    }

    /// Number of times the link was opened.
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    /// Number of times the link was closed.
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Whether the link is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Baud rate currently applied, if open.
    pub fn baud_rate(&self) -> Option<u32> {
        self.state.lock().baud_rate
    }

    /// Highest number of exchanges ever in progress at once.
    pub fn max_concurrent_exchanges(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Snapshot of a simulated servo.
    pub fn servo(&self, id: DeviceId) -> Option<MockServo> {
        self.state.lock().servos.get(&id).cloned()
    }

    fn record(&self, event: MockEvent) {
        self.state.lock().record(event);
    }

    /// Runs `op` against the addressed servo after the simulated wire delay.
    async fn exchange<R>(
        &self,
        id: DeviceId,
        on_comm_failure: impl FnOnce(CommResult) -> R,
        op: impl FnOnce(&mut MockServo) -> R,
    ) -> R {
        let latency = {
            let mut state = self.state.lock();
            if !state.open {
                return on_comm_failure(CommResult::TxFail);
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        let in_flight = InFlight(&*self.state);

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        if !latency.is_zero() {
            sleep(latency).await;
        }
        drop(in_flight);

        let mut state = self.state.lock();
        match state.servos.get_mut(&id) {
            Some(servo) => op(servo),
            None => on_comm_failure(CommResult::RxTimeout),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> bool {
        let mut state = self.state.lock();
        if state.open_fails {
            debug!(port = %self.port_name, "MockTransport: refusing to open");
            return false;
        }
        state.open = true;
        state.opens += 1;
        state.record(MockEvent::Open);
        true
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.baud_rate = None;
            state.closes += 1;
            state.record(MockEvent::Close);
        }
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> bool {
        let mut state = self.state.lock();
        if state.baud_rejected || !state.open {
            return false;
        }
        state.baud_rate = Some(baud_rate);
        state.record(MockEvent::SetBaudRate(baud_rate));
        true
    }

    async fn ping(&mut self, id: DeviceId) -> PingReply {
        self.record(MockEvent::Ping { id: id.get() });
        let failed = |comm| PingReply {
            model: 0,
            status: TxRxStatus::comm_failure(comm),
        };
        self.exchange(id, failed, |servo| match servo.ping_failure {
            Some(comm) => failed(comm),
            None => PingReply {
                model: servo.model,
                status: servo.status(),
            },
        })
        .await
    }

    async fn read_register(&mut self, id: DeviceId, register: Register) -> RegisterRead {
        self.record(MockEvent::Read {
            id: id.get(),
            address: register.address,
            at: Instant::now(),
        });
        self.exchange(id, RegisterRead::comm_failure, |servo| servo.read(register))
            .await
    }

    async fn write_register(
        &mut self,
        id: DeviceId,
        register: Register,
        value: u16,
    ) -> TxRxStatus {
        if register.encode(value).is_none() {
            return TxRxStatus::comm_failure(CommResult::TxError);
        }
        self.record(MockEvent::Write {
            id: id.get(),
            address: register.address,
            value,
        });
        self.exchange(id, TxRxStatus::comm_failure, |servo| {
            servo.write(register, value)
        })
        .await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
