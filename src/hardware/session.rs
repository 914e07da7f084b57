//! Scoped servo acquisition
//!
//! [`ServoSession`] connects a servo on acquisition and disconnects it exactly once
//! when the scope ends. The normal exit is an explicit `release().await`; if the
//! guard is dropped instead (early return, `?`, panic, task cancellation) the
//! disconnect is spawned onto the current tokio runtime and tracked until
//! [`join_pending_releases`] awaits it.
//!
//! The guard owns the servo from the start of `connect`, so cancelling
//! `acquire` after torque was enabled still disables it.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::error::AppResult;
use crate::hardware::capabilities::Servo;

thread_local! {
    // Disconnects spawned by sessions dropped on this thread. On a current-thread
    // runtime that is every session the runtime ever dropped.
    static PENDING_RELEASES: RefCell<JoinSet<()>> = RefCell::new(JoinSet::new());
}

/// Wait for every disconnect spawned by a session dropped on this thread.
///
/// Call before the runtime shuts down; tasks still pending when it does are
/// cancelled and their servos keep torque enabled.
pub async fn join_pending_releases() {
    loop {
        let mut pending = PENDING_RELEASES.with(|pending| pending.take());
        if pending.is_empty() {
            return;
        }
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Background servo release did not complete");
            }
        }
    }
}

/// A connected servo that is disconnected when the session ends.
pub struct ServoSession<S: Servo + 'static> {
    // Taken only by `release` and `drop`.
    servo: Option<S>,
}

impl<S: Servo + 'static> ServoSession<S> {
    /// Connect `servo` for the lifetime of the returned session.
    ///
    /// Returns `Ok(None)` when the link could not be established, so callers can
    /// treat the operation as unavailable. Any other connect failure is returned
    /// as an error; in both cases the servo has already been cleaned up.
    pub async fn acquire(servo: S) -> AppResult<Option<Self>> {
        let mut session = Self { servo: Some(servo) };
        match session.connect().await {
            Ok(()) => Ok(Some(session)),
            Err(e) if e.is_link_unavailable() => {
                warn!(id = %session.id(), port = %session.port_name(), error = %e, "Servo unavailable");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Disconnect now.
    pub async fn release(mut self) {
        if let Some(mut servo) = self.servo.take() {
            servo.disconnect().await;
        }
    }
}

impl<S: Servo + 'static> Deref for ServoSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        match &self.servo {
            Some(servo) => servo,
            None => unreachable!("servo session used after release"),
        }
    }
}

impl<S: Servo + 'static> DerefMut for ServoSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        match &mut self.servo {
            Some(servo) => servo,
            None => unreachable!("servo session used after release"),
        }
    }
}

impl<S: Servo + 'static> Drop for ServoSession<S> {
    fn drop(&mut self) {
        let Some(mut servo) = self.servo.take() else {
            return;
        };
        if !servo.is_connected() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    id = %servo.id(),
                    port = %servo.port_name(),
                    "Servo session dropped without release, disconnecting in background"
                );
                let release = async move {
                    servo.disconnect().await;
                };
                PENDING_RELEASES.with(|pending| {
                    pending.borrow_mut().spawn_on(release, &runtime);
                });
            }
            Err(_) => error!(
                id = %servo.id(),
                port = %servo.port_name(),
                "Servo session dropped outside a runtime, torque may remain enabled"
            ),
        }
    }
}

/// Acquire `servo`, run `body` against it and release it.
///
/// Returns `Ok(None)` when the link is unavailable and `body` never ran.
///
/// ```rust,ignore
/// let model = scoped(servo, |s| s.ping()).await?;
/// ```
pub async fn scoped<S, R, F>(servo: S, body: F) -> AppResult<Option<R>>
where
    S: Servo + 'static,
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, R>,
{
    let Some(mut session) = ServoSession::acquire(servo).await? else {
        return Ok(None);
    };
    let result = body(&mut *session).await;
    session.release().await;
    Ok(Some(result))
}
