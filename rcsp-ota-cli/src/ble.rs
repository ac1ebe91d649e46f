//! BLE transport backed by `btleplug`.
//!
//! RCSP accessories expose a single GATT service with one write and one
//! notify characteristic; frames are written to the former and arrive as
//! notifications on the latter. Discovery and disconnect events from the
//! adapter are forwarded on the transport event channel so the library's
//! reconnect matcher can watch for the rebooted device.
//!
//! Device matching is address-based. Platforms that hide the public
//! Bluetooth address (macOS) cannot match a rebooted device.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, trace, warn};
use rcsp_ota::transport::EVENT_CHANNEL_CAPACITY;
use rcsp_ota::{DeviceAddress, Error, Result, Transport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// RCSP GATT service.
const RCSP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000AE00_0000_1000_8000_00805F9B34FB);
/// Host-to-device characteristic (write without response).
const RCSP_WRITE_UUID: Uuid = Uuid::from_u128(0x0000AE01_0000_1000_8000_00805F9B34FB);
/// Device-to-host characteristic (notify).
const RCSP_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000AE02_0000_1000_8000_00805F9B34FB);

/// Upper bound on a single GATT write, conservative for a 247-byte MTU.
const WRITE_CHUNK: usize = 244;

/// How long `connect` scans for a device the adapter has not seen yet.
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);

fn ble_err(err: btleplug::Error) -> Error {
    Error::Transport(err.to_string())
}

/// A device seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Bluetooth address.
    pub address: DeviceAddress,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Last observed signal strength.
    pub rssi: Option<i16>,
    /// Whether the RCSP service was advertised.
    pub is_rcsp: bool,
}

struct Connected {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_task: JoinHandle<()>,
}

struct Inner {
    adapter: Adapter,
    events: broadcast::Sender<TransportEvent>,
    current: Mutex<Option<Connected>>,
}

/// [`Transport`] implementation over the first system Bluetooth adapter.
pub struct BleTransport {
    inner: Arc<Inner>,
}

impl BleTransport {
    /// Open the first Bluetooth adapter and start forwarding its events.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(ble_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("no Bluetooth adapter found".into()))?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            adapter,
            events,
            current: Mutex::new(None),
        });

        let mut central_events = inner.adapter.events().await.map_err(ble_err)?;
        let pump = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) => {
                        if let Ok(peripheral) = pump.adapter.peripheral(&id).await {
                            let address = DeviceAddress(peripheral.address().into_inner());
                            trace!("Discovered {address}");
                            let _ = pump.events.send(TransportEvent::Discovered(address));
                        }
                    },
                    CentralEvent::DeviceDisconnected(id) => {
                        let is_current = pump
                            .current
                            .lock()
                            .await
                            .as_ref()
                            .is_some_and(|connected| connected.peripheral.id() == id);
                        if is_current {
                            debug!("Link to current device lost");
                            let _ = pump.events.send(TransportEvent::Connection(false));
                        }
                    },
                    _ => {},
                }
            }
        });

        Ok(Self { inner })
    }

    /// Scan for `duration` and list everything seen.
    pub async fn scan_devices(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.inner
            .adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)?;
        tokio::time::sleep(duration).await;

        let mut devices = Vec::new();
        for peripheral in self.inner.adapter.peripherals().await.map_err(ble_err)? {
            let address = DeviceAddress(peripheral.address().into_inner());
            let properties = peripheral.properties().await.map_err(ble_err)?;
            let (name, rssi, is_rcsp) = match properties {
                Some(props) => (
                    props.local_name,
                    props.rssi,
                    props.services.contains(&RCSP_SERVICE_UUID),
                ),
                None => (None, None, false),
            };
            devices.push(DiscoveredDevice {
                address,
                name,
                rssi,
                is_rcsp,
            });
        }

        let _ = self.inner.adapter.stop_scan().await;
        Ok(devices)
    }

    async fn find_peripheral(&self, target: BDAddr) -> Result<Peripheral> {
        let known = self.inner.adapter.peripherals().await.map_err(ble_err)?;
        if let Some(peripheral) = known.into_iter().find(|p| p.address() == target) {
            return Ok(peripheral);
        }

        // Not seen yet; scan until it shows up.
        debug!("Device {target} not cached, scanning");
        self.inner
            .adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)?;
        let deadline = tokio::time::Instant::now() + DISCOVER_TIMEOUT;
        let found = loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let known = self.inner.adapter.peripherals().await.map_err(ble_err)?;
            if let Some(peripheral) = known.into_iter().find(|p| p.address() == target) {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
        };
        let _ = self.inner.adapter.stop_scan().await;

        found.ok_or_else(|| Error::ConnectFailed(format!("device {target} not found")))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, address: &DeviceAddress) -> Result<()> {
        let peripheral = self.find_peripheral(BDAddr::from(address.0)).await?;
        peripheral.connect().await.map_err(ble_err)?;
        peripheral.discover_services().await.map_err(ble_err)?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == RCSP_WRITE_UUID)
            .cloned()
            .ok_or_else(|| Error::Transport("RCSP write characteristic not found".into()))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == RCSP_NOTIFY_UUID)
            .cloned()
            .ok_or_else(|| Error::Transport("RCSP notify characteristic not found".into()))?;

        peripheral.subscribe(&notify_char).await.map_err(ble_err)?;
        let mut notifications = peripheral.notifications().await.map_err(ble_err)?;
        let events = self.inner.events.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == RCSP_NOTIFY_UUID {
                    let _ = events.send(TransportEvent::Data(notification.value));
                }
            }
            trace!("Notification stream ended");
        });

        let mut current = self.inner.current.lock().await;
        if let Some(old) = current.take() {
            old.notify_task.abort();
        }
        *current = Some(Connected {
            peripheral,
            write_char,
            notify_task,
        });
        drop(current);

        debug!("Connected to {address}");
        let _ = self.inner.events.send(TransportEvent::Connection(true));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(connected) = self.inner.current.lock().await.take() else {
            return Ok(());
        };
        connected.notify_task.abort();
        if let Err(err) = connected.peripheral.disconnect().await {
            warn!("Disconnect failed: {err}");
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let current = self.inner.current.lock().await;
        let connected = current
            .as_ref()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        for chunk in bytes.chunks(WRITE_CHUNK) {
            connected
                .peripheral
                .write(&connected.write_char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(ble_err)?;
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<()> {
        self.inner
            .adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.inner.adapter.stop_scan().await.map_err(ble_err)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}
