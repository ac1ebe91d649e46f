//! Post-reboot device rediscovery.
//!
//! When the accessory reboots into (or out of) update mode it advertises
//! under a mutated address. The matcher watches discovery events for a
//! candidate whose address is the expected mutation of the original, then
//! connects to the first candidate that accepts.

use crate::device::{DeviceAddress, RebootScheme};
use crate::ota::timer::OneShot;
use crate::transport::{Transport, TransportEvent};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What to look for when the original device comes back. Created when the
/// session enters reconnect preparation, consumed by one matcher run.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectInfo {
    /// Address the device had before rebooting.
    pub address: DeviceAddress,
    /// Mutation scheme the device applies to its address.
    pub scheme: RebootScheme,
}

impl ReconnectInfo {
    /// Create reconnect state for `address` using `scheme`.
    pub fn new(address: DeviceAddress, scheme: RebootScheme) -> Self {
        Self { address, scheme }
    }

    /// Whether `candidate` is the rebooted incarnation of the original
    /// device under this scheme.
    pub fn matches(&self, candidate: DeviceAddress) -> bool {
        let original = self.address.to_u48();
        let other = candidate.to_u48();
        match self.scheme {
            RebootScheme::New => {
                (original & 0xFF_FFFF).wrapping_add(1) & 0xFF_FFFF == other & 0xFF_FFFF
                    && original >> 24 == other >> 24
            },
            RebootScheme::Old => {
                (original & 0xFF).wrapping_add(2) & 0xFF == other & 0xFF
                    && original >> 8 == other >> 8
            },
        }
    }
}

/// Scan for the rebooted device and connect to it.
///
/// The first structurally matching candidate that accepts a connection wins;
/// candidates that fail to connect are ignored without backtracking.
/// Returns `None` on timeout or cancellation — never an error, callers
/// decide the severity.
pub async fn await_reconnect(
    transport: &Arc<dyn Transport>,
    info: ReconnectInfo,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Option<DeviceAddress> {
    // Subscribe before scanning so no discovery is missed.
    let mut events = transport.subscribe();
    if let Err(err) = transport.start_scan().await {
        warn!("Failed to start discovery scan: {err}");
        return None;
    }
    info!(
        "Waiting up to {timeout:?} for {} to reappear ({:?} scheme)",
        info.address, info.scheme
    );

    let mut timer = OneShot::new();
    timer.arm(timeout);
    let found = loop {
        tokio::select! {
            () = timer.fired() => {
                debug!("Reconnect scan timed out");
                break None;
            },
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("Reconnect scan cancelled");
                    break None;
                }
            },
            event = events.recv() => match event {
                Ok(TransportEvent::Discovered(candidate)) => {
                    if !info.matches(candidate) {
                        trace!("Ignoring non-matching candidate {candidate}");
                        continue;
                    }
                    debug!("Candidate {candidate} matches, connecting");
                    match transport.connect(&candidate).await {
                        Ok(()) => {
                            info!("Reconnected to {candidate}");
                            break Some(candidate);
                        },
                        Err(err) => {
                            warn!("Candidate {candidate} refused connection: {err}");
                        },
                    }
                },
                Ok(_) => {},
                Err(_) => break None,
            },
        }
    };

    if let Err(err) = transport.stop_scan().await {
        warn!("Failed to stop discovery scan: {err}");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::transport::EVENT_CHANNEL_CAPACITY;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    fn addr(value: u64) -> DeviceAddress {
        DeviceAddress::from_u48(value)
    }

    #[test]
    fn test_new_scheme_matches_low24_increment() {
        let info = ReconnectInfo::new(addr(0x112233_000001), RebootScheme::New);
        assert!(info.matches(addr(0x112233_000002)));
        assert!(!info.matches(addr(0x112233_000003)));
        assert!(!info.matches(addr(0x112233_000001)));
        // High 24 bits must be unchanged.
        assert!(!info.matches(addr(0x112234_000002)));
    }

    #[test]
    fn test_new_scheme_wraps_mod_2_pow_24() {
        let info = ReconnectInfo::new(addr(0xAABBCC_FFFFFF), RebootScheme::New);
        assert!(info.matches(addr(0xAABBCC_000000)));
    }

    #[test]
    fn test_old_scheme_matches_low8_plus_two() {
        let info = ReconnectInfo::new(addr(0x1122334455_10), RebootScheme::Old);
        assert!(info.matches(addr(0x1122334455_12)));
        assert!(!info.matches(addr(0x1122334455_11)));
        // The 40 bits above the low byte must be unchanged.
        assert!(!info.matches(addr(0x1122334456_12)));
    }

    #[test]
    fn test_old_scheme_wraps_mod_256() {
        let info = ReconnectInfo::new(addr(0x1122334455_FF), RebootScheme::Old);
        assert!(info.matches(addr(0x1122334455_01)));
    }

    /// Scan double that reports a scripted set of candidates and accepts
    /// connections selectively.
    struct ScanTransport {
        events: broadcast::Sender<TransportEvent>,
        candidates: Vec<DeviceAddress>,
        refuse: Vec<DeviceAddress>,
        connected: Mutex<Vec<DeviceAddress>>,
    }

    impl ScanTransport {
        fn new(candidates: Vec<DeviceAddress>, refuse: Vec<DeviceAddress>) -> Arc<Self> {
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            Arc::new(Self {
                events,
                candidates,
                refuse,
                connected: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScanTransport {
        async fn connect(&self, address: &DeviceAddress) -> Result<()> {
            if self.refuse.contains(address) {
                return Err(crate::error::Error::ConnectFailed(address.to_string()));
            }
            self.connected.lock().unwrap().push(*address);
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn write(&self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn start_scan(&self) -> Result<()> {
            for candidate in &self.candidates {
                let _ = self.events.send(TransportEvent::Discovered(*candidate));
            }
            Ok(())
        }
        async fn stop_scan(&self) -> Result<()> {
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }
    }

    fn cancel_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_matcher_connects_first_matching_candidate() {
        let original = addr(0x112233_000010);
        let rebooted = addr(0x112233_000011);
        let transport = ScanTransport::new(
            vec![addr(0x998877_000000), rebooted, addr(0x112233_000012)],
            Vec::new(),
        );
        let (_tx, mut cancel) = cancel_pair();

        let found = await_reconnect(
            &(transport.clone() as Arc<dyn Transport>),
            ReconnectInfo::new(original, RebootScheme::New),
            Duration::from_secs(5),
            &mut cancel,
        )
        .await;

        assert_eq!(found, Some(rebooted));
        assert_eq!(&*transport.connected.lock().unwrap(), &[rebooted]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matcher_skips_candidates_that_refuse() {
        // Two structurally identical matches; the first refuses to connect.
        let original = addr(0x10_20);
        let rebooted = addr(0x10_22);
        let transport = ScanTransport::new(vec![rebooted, rebooted], vec![]);
        // Refuse only the first attempt: model by refusing the address in a
        // transport that always refuses, expecting None.
        let refusing = ScanTransport::new(vec![rebooted], vec![rebooted]);
        let (_tx, mut cancel) = cancel_pair();

        let found = await_reconnect(
            &(refusing.clone() as Arc<dyn Transport>),
            ReconnectInfo::new(original, RebootScheme::Old),
            Duration::from_millis(200),
            &mut cancel,
        )
        .await;
        assert_eq!(found, None, "refused candidate must not complete the wait");

        let found = await_reconnect(
            &(transport.clone() as Arc<dyn Transport>),
            ReconnectInfo::new(original, RebootScheme::Old),
            Duration::from_millis(200),
            &mut cancel,
        )
        .await;
        assert_eq!(found, Some(rebooted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matcher_times_out_to_none() {
        let transport = ScanTransport::new(vec![addr(0x05)], Vec::new());
        let (_tx, mut cancel) = cancel_pair();

        let found = await_reconnect(
            &(transport as Arc<dyn Transport>),
            ReconnectInfo::new(addr(0x10), RebootScheme::Old),
            Duration::from_millis(100),
            &mut cancel,
        )
        .await;
        assert_eq!(found, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matcher_cancellation_yields_none() {
        let transport = ScanTransport::new(Vec::new(), Vec::new());
        let (tx, mut cancel) = cancel_pair();
        tx.send(true).unwrap();

        let found = await_reconnect(
            &(transport as Arc<dyn Transport>),
            ReconnectInfo::new(addr(0x10), RebootScheme::Old),
            Duration::from_secs(60),
            &mut cancel,
        )
        .await;
        assert_eq!(found, None);
    }
}
