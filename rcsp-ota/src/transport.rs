//! Transport abstraction for the RCSP link.
//!
//! The protocol and orchestration layers are I/O-agnostic: everything they
//! need from the underlying link (BLE in practice) is expressed by the
//! [`Transport`] trait. MTU negotiation, GATT discovery and characteristic
//! plumbing are entirely the implementation's concern.
//!
//! Implementations push inbound traffic and link-state changes through a
//! broadcast channel; each consumer (protocol session, orchestrator,
//! reconnection matcher) holds its own receiver and unsubscribes by
//! dropping it.

use crate::device::DeviceAddress;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Capacity used by transport implementations for their event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Raw bytes arrived from the device (one notification's worth; frames
    /// may be fragmented or concatenated arbitrarily).
    Data(Vec<u8>),
    /// The link went up (`true`) or down (`false`).
    Connection(bool),
    /// A device was discovered while scanning.
    Discovered(DeviceAddress),
}

/// A bidirectional link to an RCSP accessory.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the device at `address` and subscribe to its notifications.
    async fn connect(&self, address: &DeviceAddress) -> Result<()>;

    /// Tear down the current connection.
    async fn disconnect(&self) -> Result<()>;

    /// Write raw bytes to the device.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Start device discovery. Discovered devices are reported as
    /// [`TransportEvent::Discovered`] events.
    async fn start_scan(&self) -> Result<()>;

    /// Stop device discovery.
    async fn stop_scan(&self) -> Result<()>;

    /// Subscribe to transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
