//! Stand orchestration: per-servo lifecycles run concurrently on one task.
//!
//! Every operation here takes ownership of its servos, acquires each one in its
//! own [`ServoSession`], and joins all of them. Each future releases its own
//! session, so a failing servo never prevents another one from being released.
//! Results come back as one [`ServoReport`] per servo, in input order.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tracing::{info, info_span, Instrument};

use crate::config::StandConfig;
use crate::error::{AppResult, CommandError, ServoError};
use crate::hardware::capabilities::Positioner;
use crate::hardware::dynamixel::Dynamixel;
use crate::hardware::protocol::DeviceId;
use crate::hardware::session::ServoSession;
use crate::hardware::shared_bus::{BusHandle, SharedBus};
use crate::hardware::transport::Transport;

/// Outcome of one servo's part in a stand operation.
#[derive(Debug)]
pub struct ServoReport<T> {
    /// Serial port the servo hangs off
    pub port: String,
    /// Bus address
    pub id: DeviceId,
    /// What the command returned, or why it never ran
    pub result: AppResult<T>,
}

/// One reading taken by [`monitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionSample {
    /// Serial port the servo hangs off
    pub port: String,
    /// Bus address
    pub id: DeviceId,
    /// Present position, or `UNREADABLE_POSITION` when the read failed
    pub position: i32,
}

impl fmt::Display for PositionSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: Servo {} -> {}", self.port, self.id, self.position)
    }
}

/// Run `command` inside a session on `servo` and report the outcome.
///
/// If `shutdown` resolves first the command is dropped and the session is
/// released before reporting `Interrupted`.
async fn run_scoped<S, R, F, C>(servo: S, shutdown: C, command: F) -> ServoReport<R>
where
    S: Positioner + 'static,
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<R, CommandError>>,
    C: Future<Output = ()>,
{
    let port = servo.port_name().to_string();
    let id = servo.id();
    let span = servo.span();

    let result: AppResult<R> = async {
        let Some(mut session) = ServoSession::acquire(servo).await? else {
            return Err(ServoError::Unavailable {
                port: port.clone(),
                id,
            });
        };

        let outcome = tokio::select! {
            result = command(&mut *session) => result.map_err(ServoError::from),
            () = shutdown => {
                info!("Shutdown requested, releasing servo");
                Err(ServoError::Interrupted)
            }
        };
        session.release().await;
        outcome
    }
    .instrument(span)
    .await;

    ServoReport { port, id, result }
}

/// Ping every servo concurrently, reporting model numbers.
pub async fn ping_all<S>(servos: Vec<S>) -> Vec<ServoReport<u16>>
where
    S: Positioner + 'static,
{
    ping_all_until(servos, std::future::pending()).await
}

/// [`ping_all`], abandoning outstanding pings once `shutdown` resolves.
pub async fn ping_all_until<S, C>(servos: Vec<S>, shutdown: C) -> Vec<ServoReport<u16>>
where
    S: Positioner + 'static,
    C: Future<Output = ()>,
{
    let shutdown = shutdown.boxed_local().shared();
    join_all(servos.into_iter().map(|servo| {
        run_scoped(servo, shutdown.clone(), |servo| servo.ping())
    }))
    .await
}

/// Home every servo concurrently to `target` (or each one's home position).
pub async fn home_all<S>(servos: Vec<S>, target: Option<u16>) -> Vec<ServoReport<()>>
where
    S: Positioner + 'static,
{
    home_all_until(servos, target, std::future::pending()).await
}

/// [`home_all`], stopping every homing loop once `shutdown` resolves.
///
/// Servos still converging are reported as `Interrupted`; all of them are
/// released before this returns.
pub async fn home_all_until<S, C>(
    servos: Vec<S>,
    target: Option<u16>,
    shutdown: C,
) -> Vec<ServoReport<()>>
where
    S: Positioner + 'static,
    C: Future<Output = ()>,
{
    let shutdown = shutdown.boxed_local().shared();
    join_all(servos.into_iter().map(|servo| {
        run_scoped(servo, shutdown.clone(), move |servo| servo.home(target))
    }))
    .await
}

/// Report the position of `servo` every `period` until `shutdown` resolves.
///
/// The first sample is taken immediately. The session is released before
/// returning. Fails with `Unavailable` when the link cannot be opened.
pub async fn monitor<S, C, F>(
    servo: S,
    period: Duration,
    shutdown: C,
    mut on_sample: F,
) -> AppResult<()>
where
    S: Positioner + 'static,
    C: Future<Output = ()>,
    F: FnMut(PositionSample),
{
    let port = servo.port_name().to_string();
    let id = servo.id();
    let span = servo.span();

    async move {
        let Some(mut session) = ServoSession::acquire(servo).await? else {
            return Err(ServoError::Unavailable { port, id });
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping position monitor");
                    break;
                }
                _ = ticker.tick() => {
                    let position = session.current_position().await;
                    on_sample(PositionSample {
                        port: port.clone(),
                        id,
                        position,
                    });
                }
            }
        }

        session.release().await;
        Ok(())
    }
    .instrument(span)
    .await
}

/// A Dynamixel on `bus` set up from its configuration entry, or from the
/// defaults when `id` is not configured.
pub fn servo_for<T: Transport + 'static>(
    bus: &SharedBus<T>,
    config: &StandConfig,
    id: DeviceId,
) -> Dynamixel<BusHandle<T>> {
    let definition = config.servo_by_id(id);
    let name = definition.map_or("servo", |servo| servo.name.as_str());
    let span = info_span!("servo", name, port = %bus.port_name(), id = %id);

    Dynamixel::new(bus.handle(), id)
        .with_torque_on_connect(definition.map_or(true, |servo| servo.enable_torque_on_connect))
        .with_baud_rate(config.bus.baud_rate)
        .with_homing(config.homing_for(definition))
        .with_span(span)
}

/// Every configured servo on `bus`, in configuration order.
pub fn servos_from_config<T: Transport + 'static>(
    bus: &SharedBus<T>,
    config: &StandConfig,
) -> AppResult<Vec<Dynamixel<BusHandle<T>>>> {
    config
        .servos
        .iter()
        .map(|servo| Ok(servo_for(bus, config, servo.device_id()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::Servo;
    use crate::hardware::mock::{MockServo, MockTransport};
    use crate::hardware::protocol::{CommResult, DeviceError};

    fn id(raw: u8) -> DeviceId {
        DeviceId::new(raw).unwrap()
    }

    #[test]
    fn test_sample_display() {
        let sample = PositionSample {
            port: "/dev/ttyUSB0".to_string(),
            id: id(1),
            position: 512,
        };
        assert_eq!(sample.to_string(), "/dev/ttyUSB0: Servo 1 -> 512");
    }

    #[test]
    fn test_servos_follow_configuration() {
        let mut config = StandConfig::default();
        config.servos[1].enable_torque_on_connect = false;
        config.servos[1].home_position = Some(300);
        let bus = SharedBus::new(MockTransport::new("/dev/ttyMOCK0"));

        let servos = servos_from_config(&bus, &config).unwrap();
        assert_eq!(servos.len(), 2);
        assert_eq!(servos[0].id(), id(1));
        assert_eq!(servos[1].id(), id(2));
        assert_eq!(servos[1].homing().home_position, 300);
        assert_eq!(servos[0].homing().home_position, 0);
    }

    #[test]
    fn test_unaddressable_servo_is_a_config_error() {
        let mut config = StandConfig::default();
        config.servos[0].id = 254;
        let bus = SharedBus::new(MockTransport::new("/dev/ttyMOCK0"));

        let result = servos_from_config(&bus, &config);
        assert!(matches!(result, Err(ServoError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_all_reports_each_servo() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).model(42))
            .with_servo(MockServo::new(id(2)).device_error(DeviceError::OVERLOAD))
            .with_latency(Duration::from_millis(2));
        let bus = SharedBus::new(mock.clone());
        let servos = servos_from_config(&bus, &StandConfig::default()).unwrap();

        let reports = ping_all(servos).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].id, id(1));
        assert_eq!(reports[0].result.as_ref().unwrap(), &42);
        assert!(matches!(
            reports[1].result,
            Err(ServoError::Command(CommandError::Device(DeviceError::OVERLOAD)))
        ));

        // Both sessions shared one open link and released it
        assert!(!mock.is_open());
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.max_concurrent_exchanges(), 1);
        assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
        assert_eq!(mock.torque_writes(id(2)), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_unavailable_link_is_reported_per_servo() {
        let mock = MockTransport::new("/dev/ttyMOCK0").failing_open();
        let bus = SharedBus::new(mock);
        let servos = servos_from_config(&bus, &StandConfig::default()).unwrap();

        let reports = ping_all(servos).await;
        assert!(reports
            .iter()
            .all(|report| matches!(report.result, Err(ServoError::Unavailable { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_all_isolates_failures() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).at(0).moving(50))
            .with_servo(MockServo::new(id(2)).read_failure(CommResult::RxTimeout));
        let bus = SharedBus::new(mock.clone());
        let servos = servos_from_config(&bus, &StandConfig::default()).unwrap();

        let reports = home_all(servos, Some(200)).await;
        assert!(reports[0].result.is_ok());
        assert!(matches!(
            reports[1].result,
            Err(ServoError::Command(CommandError::Comm(CommResult::RxTimeout)))
        ));
        assert_eq!(mock.servo(id(1)).unwrap().present_position(), 200);
        assert_eq!(mock.torque_writes(id(2)), vec![1, 0]);
        assert!(!mock.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_home_all_until_releases_on_shutdown() {
        let mock = MockTransport::new("/dev/ttyMOCK0")
            .with_servo(MockServo::new(id(1)).at(0).moving(1))
            .with_servo(MockServo::new(id(2)).at(0).moving(1));
        let bus = SharedBus::new(mock.clone());
        let servos = servos_from_config(&bus, &StandConfig::default()).unwrap();

        let reports = home_all_until(
            servos,
            Some(1000),
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await;

        assert!(reports
            .iter()
            .all(|report| matches!(report.result, Err(ServoError::Interrupted))));
        assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
        assert_eq!(mock.torque_writes(id(2)), vec![1, 0]);
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_ping_all_until_finishes_before_shutdown() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)).model(12));
        let bus = SharedBus::new(mock.clone());
        let servo = servo_for(&bus, &StandConfig::default(), id(1));

        let reports = ping_all_until(vec![servo], std::future::pending()).await;
        assert_eq!(reports[0].result.as_ref().unwrap(), &12);
        assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_samples_until_shutdown() {
        let mock = MockTransport::new("/dev/ttyMOCK0").with_servo(MockServo::new(id(1)).at(640));
        let bus = SharedBus::new(mock.clone());
        let servo = servo_for(&bus, &StandConfig::default(), id(1));

        let mut samples = Vec::new();
        monitor(
            servo,
            Duration::from_secs(1),
            tokio::time::sleep(Duration::from_millis(2500)),
            |sample| samples.push(sample),
        )
        .await
        .unwrap();

        // t = 0, 1 s, 2 s
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|sample| sample.position == 640));
        assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_monitor_unavailable_link() {
        let bus = SharedBus::new(MockTransport::new("/dev/ttyMOCK0").failing_open());
        let servo = servo_for(&bus, &StandConfig::default(), id(1));

        let result = monitor(servo, Duration::from_secs(1), std::future::pending(), |_| {}).await;
        assert!(matches!(result, Err(ServoError::Unavailable { .. })));
    }
}
