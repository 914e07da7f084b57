//! Shared Serial Bus for co-resident servo sessions
//!
//! Several servos hang off one physical bus at different addresses. Each servo
//! session still owns its own [`Transport`], but that transport is a
//! [`BusHandle`] onto a [`SharedBus`]: every request/response exchange holds the
//! bus lock for its full duration, so two sessions can never interleave partial
//! packets on the wire.
//!
//! The underlying link is opened by the first handle that attaches and closed
//! when the last one detaches. Handles detach on `close()` or, failing that,
//! when dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::hardware::protocol::{
    CommResult, DeviceId, PingReply, Register, RegisterRead, TxRxStatus,
};
use crate::hardware::transport::Transport;

/// Inner state of the shared bus
#[derive(Debug)]
struct BusInner<T> {
    /// The one real endpoint on this bus
    transport: T,
    /// Number of handles currently attached
    attached: usize,
    /// Baud rate applied to the open link
    baud_rate: Option<u32>,
}

impl<T: Transport> BusInner<T> {
    fn detach(&mut self) {
        self.attached = self.attached.saturating_sub(1);
        if self.attached == 0 {
            debug!(port = %self.transport.port_name(), "Last handle detached, closing bus");
            self.transport.close();
            self.baud_rate = None;
        }
    }
}

/// One physical bus shared by any number of servo sessions
///
/// Cloning yields another reference to the same bus.
///
/// # Example
/// ```no_run
/// use servo_stand::hardware::mock::MockTransport;
/// use servo_stand::hardware::shared_bus::SharedBus;
///
/// let bus = SharedBus::new(MockTransport::pan_tilt("/dev/ttyUSB0"));
/// let pan_link = bus.handle();
/// let tilt_link = bus.handle();
/// ```
#[derive(Debug)]
pub struct SharedBus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
    port_name: String,
}

impl<T> Clone for SharedBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            port_name: self.port_name.clone(),
        }
    }
}

impl<T: Transport + 'static> SharedBus<T> {
    /// Wrap a transport for shared use. The transport should not be open yet.
    pub fn new(transport: T) -> Self {
        let port_name = transport.port_name().to_string();
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                transport,
                attached: 0,
                baud_rate: None,
            })),
            port_name,
        }
    }

    /// New detached handle; it attaches when its session opens it.
    pub fn handle(&self) -> BusHandle<T> {
        BusHandle {
            inner: self.inner.clone(),
            port_name: self.port_name.clone(),
            attached: false,
        }
    }

    /// Bus device path
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Number of attached handles, or None while an exchange holds the bus
    pub fn attached_handles(&self) -> Option<usize> {
        // Non-blocking check - don't await the mutex
        self.inner.try_lock().ok().map(|inner| inner.attached)
    }
}

/// A session's exclusive handle onto a [`SharedBus`]
#[derive(Debug)]
pub struct BusHandle<T: Transport + 'static> {
    inner: Arc<Mutex<BusInner<T>>>,
    port_name: String,
    attached: bool,
}

impl<T: Transport + 'static> BusHandle<T> {
    fn release(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;

        match self.inner.try_lock() {
            Ok(mut inner) => inner.detach(),
            Err(_) => {
                // Another session is mid-exchange; detach once it finishes.
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let inner = self.inner.clone();
                        runtime.spawn(async move {
                            inner.lock().await.detach();
                        });
                    }
                    Err(_) => warn!(
                        port = %self.port_name,
                        "Failed to detach from serial bus: bus busy and no runtime"
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> Transport for BusHandle<T> {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> bool {
        let mut inner = self.inner.lock().await;
        if self.attached {
            return true;
        }
        if inner.attached == 0 && !inner.transport.open().await {
            return false;
        }
        inner.attached += 1;
        self.attached = true;
        debug!(port = %self.port_name, attached = inner.attached, "Attached to serial bus");
        true
    }

    fn close(&mut self) {
        self.release();
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> bool {
        let mut inner = self.inner.lock().await;
        if !self.attached {
            return false;
        }
        match inner.baud_rate {
            Some(current) if current == baud_rate => return true,
            Some(current) => warn!(
                port = %self.port_name,
                current,
                requested = baud_rate,
                "Changing baud rate of a shared bus"
            ),
            None => {}
        }
        if !inner.transport.set_baud_rate(baud_rate).await {
            return false;
        }
        inner.baud_rate = Some(baud_rate);
        true
    }

    async fn ping(&mut self, id: DeviceId) -> PingReply {
        let mut inner = self.inner.lock().await;
        if !self.attached {
            return PingReply {
                model: 0,
                status: TxRxStatus::comm_failure(CommResult::PortBusy),
            };
        }
        inner.transport.ping(id).await
    }

    async fn read_register(&mut self, id: DeviceId, register: Register) -> RegisterRead {
        let mut inner = self.inner.lock().await;
        if !self.attached {
            return RegisterRead::comm_failure(CommResult::PortBusy);
        }
        inner.transport.read_register(id, register).await
    }

    async fn write_register(
        &mut self,
        id: DeviceId,
        register: Register,
        value: u16,
    ) -> TxRxStatus {
        let mut inner = self.inner.lock().await;
        if !self.attached {
            return TxRxStatus::comm_failure(CommResult::PortBusy);
        }
        inner.transport.write_register(id, register, value).await
    }
}

impl<T: Transport + 'static> Drop for BusHandle<T> {
    fn drop(&mut self) {
        if self.attached {
            debug!(port = %self.port_name, "Releasing serial bus handle on drop");
        }
        self.release();
    }
}
