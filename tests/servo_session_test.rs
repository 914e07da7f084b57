//! Tests for guaranteed servo release on every scope exit path.

use servo_stand::error::ServoError;
use servo_stand::hardware::mock::{MockServo, MockTransport};
use servo_stand::hardware::{
    join_pending_releases, CommResult, ConnectionState, DeviceId, Dynamixel, Servo,
    ServoSession, SharedBus,
};
use std::time::Duration;
use tracing_test::traced_test;

fn id(raw: u8) -> DeviceId {
    DeviceId::new(raw).unwrap()
}

/// Pan servo alone on a simulated bus.
fn create_pan_bus() -> MockTransport {
    MockTransport::new("/dev/ttyUSB0").with_servo(MockServo::new(id(1)).at(512))
}

async fn fail_midway(mock: &MockTransport) -> Result<(), ServoError> {
    let _session = ServoSession::acquire(Dynamixel::new(mock.clone(), id(1)))
        .await?
        .ok_or(ServoError::ServoCommunication("no link".into()))?;
    Err(ServoError::ServoCommunication("simulated failure".into()))
}

// =============================================================================
// Exit paths
// =============================================================================

#[tokio::test]
async fn test_explicit_release_disables_once() {
    let mock = create_pan_bus();
    let session = ServoSession::acquire(Dynamixel::new(mock.clone(), id(1)))
        .await
        .unwrap()
        .unwrap();
    session.release().await;

    assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    assert!(!mock.is_open());
}

#[tokio::test]
async fn test_early_return_disables_once() {
    let mock = create_pan_bus();
    assert!(fail_midway(&mock).await.is_err());
    join_pending_releases().await;

    assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    assert!(!mock.is_open());
}

#[tokio::test]
async fn test_panic_disables_once() {
    let mock = create_pan_bus();
    let task_mock = mock.clone();
    let handle = tokio::spawn(async move {
        let _session = ServoSession::acquire(Dynamixel::new(task_mock, id(1)))
            .await
            .unwrap()
            .unwrap();
        panic!("operator error");
    });

    assert!(handle.await.unwrap_err().is_panic());
    join_pending_releases().await;
    assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    assert!(!mock.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_disables_once() {
    let mock = create_pan_bus();
    let task_mock = mock.clone();
    let outcome = tokio::time::timeout(Duration::from_secs(1), async move {
        let _session = ServoSession::acquire(Dynamixel::new(task_mock, id(1)))
            .await
            .unwrap()
            .unwrap();
        std::future::pending::<()>().await;
    })
    .await;

    assert!(outcome.is_err());
    join_pending_releases().await;
    assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    assert!(!mock.is_open());
}

#[tokio::test]
async fn test_no_torque_policy_never_writes_torque() {
    let mock = create_pan_bus();
    let servo = Dynamixel::new(mock.clone(), id(1)).with_torque_on_connect(false);
    let session = ServoSession::acquire(servo).await.unwrap().unwrap();
    session.release().await;

    assert!(mock.torque_writes(id(1)).is_empty());
    assert!(!mock.is_open());
}

// =============================================================================
// Failed connects
// =============================================================================

#[tokio::test]
async fn test_disconnect_after_failed_connect() {
    let mock = create_pan_bus().failing_open();
    let mut servo = Dynamixel::new(mock.clone(), id(1));

    assert!(servo.connect().await.is_err());
    servo.disconnect().await;
    assert_eq!(servo.state(), ConnectionState::Disconnected);
    assert!(mock.torque_writes(id(1)).is_empty());
}

#[tokio::test]
async fn test_second_session_on_shared_bus_keeps_link_open() {
    let mock = MockTransport::new("/dev/ttyUSB0")
        .with_servo(MockServo::new(id(1)))
        .with_servo(MockServo::new(id(2)));
    let bus = SharedBus::new(mock.clone());

    let pan = ServoSession::acquire(Dynamixel::new(bus.handle(), id(1)))
        .await
        .unwrap()
        .unwrap();
    let tilt = ServoSession::acquire(Dynamixel::new(bus.handle(), id(2)))
        .await
        .unwrap()
        .unwrap();

    pan.release().await;
    assert!(mock.is_open());
    assert!(tilt.is_connected());

    tilt.release().await;
    assert!(!mock.is_open());
    assert_eq!(mock.open_count(), 1);
    assert_eq!(mock.close_count(), 1);
}

// =============================================================================
// Logging
// =============================================================================

#[tokio::test]
#[traced_test]
async fn test_disable_failure_is_logged_not_raised() {
    let mock = create_pan_bus();
    let session = ServoSession::acquire(Dynamixel::new(mock.clone(), id(1)))
        .await
        .unwrap()
        .unwrap();

    // Servo stops answering writes while the session is open
    let _ = mock
        .clone()
        .with_servo(MockServo::new(id(1)).write_failure(CommResult::RxTimeout));
    session.release().await;

    assert!(logs_contain("Failed to disable torque"));
    assert_eq!(mock.torque_writes(id(1)), vec![1, 0]);
    assert!(!mock.is_open());
}
