//! Dynamixel servo session (Protocol 1.0, MX/AX control table)
//!
//! A [`Dynamixel`] owns one [`Transport`] and one bus address. `connect` opens the
//! link, negotiates the baud rate and, unless disabled, enables torque; `disconnect`
//! undoes exactly what `connect` did. In between it offers the register-level
//! commands of [`Positioner`], all of which report failures as values.
//!
//! ## Configuration
//!
//! ```toml
//! [homing]
//! poll_interval_ms = 100
//! tolerance = 10
//! home_position = 0
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let servo = Dynamixel::new(bus.handle(), DeviceId::new(1).unwrap());
//! if let Some(mut session) = ServoSession::acquire(servo).await? {
//!     session.home(Some(512)).await?;
//!     session.release().await;
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info_span, warn, Span};

use crate::error::{AppResult, CommandError, ServoError};
use crate::hardware::capabilities::{Positioner, Servo, UNREADABLE_POSITION};
use crate::hardware::protocol::{DeviceId, Register, DEFAULT_BAUD_RATE, DEFAULT_HOME_POSITION};
use crate::hardware::transport::Transport;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Link closed, torque untouched
    #[default]
    Disconnected,
    /// Link open at the negotiated baud rate
    Connected,
}

/// Parameters of the homing convergence loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingConfig {
    /// Delay before every position read
    pub poll_interval: Duration,
    /// Half-width of the acceptance window around the goal
    pub tolerance: u16,
    /// Give up after this long; `None` waits forever
    pub timeout: Option<Duration>,
    /// Goal used when `home` is called without a target
    pub home_position: u16,
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            tolerance: 10,
            timeout: None,
            home_position: DEFAULT_HOME_POSITION,
        }
    }
}

impl HomingConfig {
    /// Whether `position` lies in `[goal - tolerance, goal + tolerance)`.
    pub fn within_tolerance(&self, goal: u16, position: u16) -> bool {
        let goal = i32::from(goal);
        let position = i32::from(position);
        let tolerance = i32::from(self.tolerance);
        goal - tolerance <= position && position < goal + tolerance
    }
}

/// One Dynamixel servo on a serial bus.
pub struct Dynamixel<T: Transport> {
    transport: T,
    id: DeviceId,
    state: ConnectionState,
    enable_torque_on_connect: bool,
    baud_rate: u32,
    homing: HomingConfig,
    span: Span,
}

impl<T: Transport> Dynamixel<T> {
    /// Disconnected session that enables torque on connect.
    pub fn new(transport: T, id: DeviceId) -> Self {
        let span = info_span!("dynamixel", port = %transport.port_name(), id = %id);
        Self {
            transport,
            id,
            state: ConnectionState::Disconnected,
            enable_torque_on_connect: true,
            baud_rate: DEFAULT_BAUD_RATE,
            homing: HomingConfig::default(),
            span,
        }
    }

    /// Choose whether `connect` enables torque (and `disconnect` disables it).
    pub fn with_torque_on_connect(mut self, enable: bool) -> Self {
        self.enable_torque_on_connect = enable;
        self
    }

    /// Baud rate negotiated on connect.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Convergence loop parameters used by `home`.
    pub fn with_homing(mut self, homing: HomingConfig) -> Self {
        self.homing = homing;
        self
    }

    /// Record this servo's work under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Convergence loop parameters.
    pub fn homing(&self) -> &HomingConfig {
        &self.homing
    }

    /// The owned transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Present position with the failure reason kept.
    pub async fn read_present_position(&mut self) -> Result<u16, CommandError> {
        self.ensure_connected()?;
        let read = self
            .transport
            .read_register(self.id, Register::PRESENT_POSITION)
            .await;
        read.status.check()?;
        Ok(read.value)
    }

    fn ensure_connected(&self) -> Result<(), CommandError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnected => Err(CommandError::NotConnected),
        }
    }
}

#[async_trait]
impl<T: Transport> Servo for Dynamixel<T> {
    async fn connect(&mut self) -> AppResult<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        if !self.transport.open().await {
            return Err(ServoError::LinkUnavailable {
                port: self.transport.port_name().to_string(),
            });
        }
        debug!(id = %self.id, port = %self.transport.port_name(), "Connecting to servo");

        if !self.transport.set_baud_rate(self.baud_rate).await {
            self.transport.close();
            return Err(ServoError::BaudRateRejected {
                port: self.transport.port_name().to_string(),
                baud_rate: self.baud_rate,
            });
        }
        self.state = ConnectionState::Connected;

        if self.enable_torque_on_connect {
            if !self.enable_torque(true).await {
                let message = format!(
                    "Failed to enable torque on servo {} ({})",
                    self.id,
                    self.transport.port_name()
                );
                self.disconnect().await;
                return Err(ServoError::ServoCommunication(message));
            }
            debug!(id = %self.id, "Dynamixel has been successfully connected");
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.state == ConnectionState::Connected {
            if self.enable_torque_on_connect && !self.enable_torque(false).await {
                warn!(id = %self.id, port = %self.transport.port_name(), "Failed to disable torque");
            }
            debug!(id = %self.id, "Dynamixel has been successfully disconnected");
        }
        self.transport.close();
        self.state = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn id(&self) -> DeviceId {
        self.id
    }

    fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    fn span(&self) -> Span {
        self.span.clone()
    }
}

#[async_trait]
impl<T: Transport> Positioner for Dynamixel<T> {
    async fn ping(&mut self) -> Result<u16, CommandError> {
        self.ensure_connected()?;
        let reply = self.transport.ping(self.id).await;
        reply.status.check()?;
        debug!(id = %self.id, model = reply.model, "Ping succeeded");
        Ok(reply.model)
    }

    async fn current_position(&mut self) -> i32 {
        self.read_present_position()
            .await
            .map(i32::from)
            .unwrap_or(UNREADABLE_POSITION)
    }

    async fn enable_torque(&mut self, enable: bool) -> bool {
        if self.ensure_connected().is_err() {
            return false;
        }
        let status = self
            .transport
            .write_register(self.id, Register::TORQUE_ENABLE, u16::from(enable))
            .await;
        status.comm.is_success()
    }

    async fn home(&mut self, target: Option<u16>) -> Result<(), CommandError> {
        self.ensure_connected()?;
        let goal = target.unwrap_or(self.homing.home_position);

        let status = self
            .transport
            .write_register(self.id, Register::GOAL_POSITION, goal)
            .await;
        if !status.comm.is_success() {
            return Err(CommandError::Comm(status.comm));
        }

        let deadline = self
            .homing
            .timeout
            .map(|timeout| (timeout, Instant::now() + timeout));

        loop {
            // CRITICAL: Use tokio::time::sleep so other sessions keep running
            sleep(self.homing.poll_interval).await;

            let position = self.read_present_position().await?;
            debug!(id = %self.id, position, goal, "Current position");
            if self.homing.within_tolerance(goal, position) {
                return Ok(());
            }

            if let Some((timeout, deadline)) = deadline {
                if Instant::now() >= deadline {
                    return Err(CommandError::Timeout(timeout));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockServo, MockTransport};
    use crate::hardware::protocol::{CommResult, DeviceError};

    fn id(raw: u8) -> DeviceId {
        DeviceId::new(raw).unwrap()
    }

    fn servo_on(mock: &MockTransport, raw: u8) -> Dynamixel<MockTransport> {
        Dynamixel::new(mock.clone(), id(raw))
    }

    #[test]
    fn test_tolerance_window_is_half_open() {
        let homing = HomingConfig::default();
        assert!(!homing.within_tolerance(500, 489));
        assert!(homing.within_tolerance(500, 490));
        assert!(homing.within_tolerance(500, 509));
        assert!(!homing.within_tolerance(500, 510));
        // No underflow near zero
        assert!(homing.within_tolerance(0, 0));
        assert!(homing.within_tolerance(0, 9));
    }

    #[tokio::test]
    async fn test_connect_enables_torque_and_disconnect_disables_it() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)));
        let mut servo = servo_on(&mock, 1);

        servo.connect().await.unwrap();
        assert!(servo.is_connected());
        assert_eq!(mock.baud_rate(), Some(DEFAULT_BAUD_RATE));
        assert!(mock.servo(id(1)).unwrap().torque_enabled());

        servo.disconnect().await;
        assert!(!servo.is_connected());
        assert!(!mock.is_open());
        assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_connect_twice_is_a_noop() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)));
        let mut servo = servo_on(&mock, 1);

        servo.connect().await.unwrap();
        servo.connect().await.unwrap();
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.torque_writes(id(1)), vec![1]);
    }

    #[tokio::test]
    async fn test_connect_without_torque_policy_never_writes_torque() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)));
        let mut servo = servo_on(&mock, 1).with_torque_on_connect(false);

        servo.connect().await.unwrap();
        servo.disconnect().await;
        assert!(mock.torque_writes(id(1)).is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_makes_no_actuation_attempt() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)))
            .failing_open();
        let mut servo = servo_on(&mock, 1);

        let err = servo.connect().await.unwrap_err();
        assert!(matches!(err, ServoError::LinkUnavailable { .. }));
        assert!(!servo.is_connected());
        assert!(mock.torque_writes(id(1)).is_empty());
    }

    #[tokio::test]
    async fn test_baud_rejection_closes_link() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)))
            .rejecting_baud_rate();
        let mut servo = servo_on(&mock, 1).with_baud_rate(1_000_000);

        let err = servo.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ServoError::BaudRateRejected {
                baud_rate: 1_000_000,
                ..
            }
        ));
        assert!(!mock.is_open());
        assert!(mock.torque_writes(id(1)).is_empty());
    }

    #[tokio::test]
    async fn test_torque_enable_failure_disconnects() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).torque_enable_failure(CommResult::RxTimeout));
        let mut servo = servo_on(&mock, 1);

        let err = servo.connect().await.unwrap_err();
        assert!(matches!(err, ServoError::ServoCommunication(_)));
        assert!(!servo.is_connected());
        assert!(!mock.is_open());
        // Best-effort disable after the failed enable
        assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_safe() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)));
        let mut servo = servo_on(&mock, 1);

        servo.disconnect().await;
        servo.disconnect().await;
        assert_eq!(servo.state(), ConnectionState::Disconnected);
        assert!(mock.torque_writes(id(1)).is_empty());
    }

    #[tokio::test]
    async fn test_commands_on_disconnected_session_skip_the_wire() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)));
        let mut servo = servo_on(&mock, 1);

        assert_eq!(servo.ping().await, Err(CommandError::NotConnected));
        assert_eq!(servo.current_position().await, UNREADABLE_POSITION);
        assert!(!servo.enable_torque(true).await);
        assert_eq!(servo.home(Some(10)).await, Err(CommandError::NotConnected));
        assert!(mock.events().is_empty());
    }

    #[tokio::test]
    async fn test_ping_reports_model_or_error() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).model(42))
            .with_servo(MockServo::new(id(2)).ping_failure(CommResult::RxTimeout));
        let mut a = servo_on(&mock, 1).with_torque_on_connect(false);
        let mut b = servo_on(&mock, 2).with_torque_on_connect(false);
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        assert_eq!(a.ping().await, Ok(42));
        let err = b.ping().await.unwrap_err();
        assert_eq!(err, CommandError::Comm(CommResult::RxTimeout));
        assert_eq!(err.to_string(), "[TxRxResult] There is no status packet!");
    }

    #[tokio::test]
    async fn test_current_position_sentinel_on_device_error() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).at(321))
            .with_servo(MockServo::new(id(2)).at(321).device_error(DeviceError::OVERHEAT));
        let mut healthy = servo_on(&mock, 1).with_torque_on_connect(false);
        let mut hot = servo_on(&mock, 2).with_torque_on_connect(false);
        healthy.connect().await.unwrap();
        hot.connect().await.unwrap();

        assert_eq!(healthy.current_position().await, 321);
        assert_eq!(hot.current_position().await, -1);
        assert_eq!(
            hot.read_present_position().await,
            Err(CommandError::Device(DeviceError::OVERHEAT))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_polls_until_within_tolerance() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).at(100).moving(100));
        let mut servo = servo_on(&mock, 1);
        servo.connect().await.unwrap();

        let started = Instant::now();
        servo.home(Some(500)).await.unwrap();

        // 200, 300, 400, 500
        let reads = mock.reads_of(id(1), Register::PRESENT_POSITION);
        assert_eq!(reads.len(), 4);
        assert_eq!(reads[0] - started, Duration::from_millis(100));
        for pair in reads.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(100));
        }
        assert_eq!(mock.servo(id(1)).unwrap().goal_position(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_defaults_to_home_position() {
        let mock =
            MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)).at(700));
        let mut servo = servo_on(&mock, 1).with_homing(HomingConfig {
            home_position: 256,
            ..HomingConfig::default()
        });
        servo.connect().await.unwrap();

        servo.home(None).await.unwrap();
        assert_eq!(mock.servo(id(1)).unwrap().present_position(), 256);
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_aborts_on_first_failed_read() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).read_failure(CommResult::RxCorrupt));
        let mut servo = servo_on(&mock, 1);
        servo.connect().await.unwrap();

        let result = servo.home(Some(500)).await;
        assert_eq!(result, Err(CommandError::Comm(CommResult::RxCorrupt)));
        assert_eq!(mock.reads_of(id(1), Register::PRESENT_POSITION).len(), 1);
        assert!(servo.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_aborts_when_goal_write_fails() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).write_failure(CommResult::TxError));
        let mut servo = servo_on(&mock, 1).with_torque_on_connect(false);
        servo.connect().await.unwrap();

        let result = servo.home(Some(500)).await;
        assert_eq!(result, Err(CommandError::Comm(CommResult::TxError)));
        assert!(mock.reads_of(id(1), Register::PRESENT_POSITION).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_times_out_when_configured() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).at(0).moving(1));
        let timeout = Duration::from_secs(1);
        let mut servo = servo_on(&mock, 1).with_homing(HomingConfig {
            timeout: Some(timeout),
            ..HomingConfig::default()
        });
        servo.connect().await.unwrap();

        let result = servo.home(Some(1000)).await;
        assert_eq!(result, Err(CommandError::Timeout(timeout)));
        assert_eq!(mock.reads_of(id(1), Register::PRESENT_POSITION).len(), 10);
    }

    #[tokio::test]
    async fn test_goal_write_echoes_in_present_position() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)));
        let mut servo = servo_on(&mock, 1);
        servo.connect().await.unwrap();

        servo.home(Some(1023)).await.unwrap();
        assert_eq!(servo.current_position().await, 1023);
    }
}
