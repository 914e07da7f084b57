//! Register bus transport contract
//!
//! A [`Transport`] is one endpoint of a half-duplex serial bus. It knows nothing
//! about sessions or motion: it opens and closes the link, negotiates the baud
//! rate, and performs single request/response exchanges, reporting the two
//! status channels of each exchange instead of raising errors.
//!
//! Implementations in this crate:
//! - [`SerialTransport`](crate::hardware::serial::SerialTransport) - real port via tokio-serial
//! - [`MockTransport`](crate::hardware::mock::MockTransport) - simulated multi-servo bus
//! - [`BusHandle`](crate::hardware::shared_bus::BusHandle) - per-session handle onto a shared bus

use async_trait::async_trait;

use crate::hardware::protocol::{DeviceId, PingReply, Register, RegisterRead, TxRxStatus};

/// Half-duplex register bus endpoint.
///
/// Register exchanges are async so that waiting on the wire yields to other
/// sessions. `close` never waits: releasing a link must not be blockable.
#[async_trait]
pub trait Transport: Send {
    /// Device path or other human-readable link name.
    fn port_name(&self) -> &str;

    /// Open the link. Returns false if the port cannot be opened.
    async fn open(&mut self) -> bool;

    /// Close the link. Safe to call when already closed.
    fn close(&mut self);

    /// Switch the link speed. Returns false if the rate is rejected.
    async fn set_baud_rate(&mut self, baud_rate: u32) -> bool;

    /// Presence check returning the device's model number.
    async fn ping(&mut self, id: DeviceId) -> PingReply;

    /// Read one control table entry.
    async fn read_register(&mut self, id: DeviceId, register: Register) -> RegisterRead;

    /// Write one control table entry.
    async fn write_register(&mut self, id: DeviceId, register: Register, value: u16)
        -> TxRxStatus;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn port_name(&self) -> &str {
        (**self).port_name()
    }

    async fn open(&mut self) -> bool {
        (**self).open().await
    }

    fn close(&mut self) {
        (**self).close()
    }

    async fn set_baud_rate(&mut self, baud_rate: u32) -> bool {
        (**self).set_baud_rate(baud_rate).await
    }

    async fn ping(&mut self, id: DeviceId) -> PingReply {
        (**self).ping(id).await
    }

    async fn read_register(&mut self, id: DeviceId, register: Register) -> RegisterRead {
        (**self).read_register(id, register).await
    }

    async fn write_register(
        &mut self,
        id: DeviceId,
        register: Register,
        value: u16,
    ) -> TxRxStatus {
        (**self).write_register(id, register, value).await
    }
}
