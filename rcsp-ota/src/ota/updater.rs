//! The upgrade orchestrator.
//!
//! [`OtaUpdater::start`] drives a whole upgrade session: firmware
//! validation, connection, capability negotiation, the responder-side
//! transfer loop, and one or two reboot/rediscovery cycles. All session
//! state lives in a single driver task that consumes transport events from
//! a `select!` loop, so disconnect/reconnect continuations are serialized
//! by construction and the caller's future completes only at a terminal
//! state. Progress and state changes are published on a broadcast channel.

use crate::config::OtaConfig;
use crate::device::DeviceAddress;
use crate::error::{Error, OtaErrorCode, Result};
use crate::firmware;
use crate::ota::state::{OtaEvent, OtaOutcome, OtaState, Progress};
use crate::ota::timer::OneShot;
use crate::protocol::command::{opcode, Command, FileBlockRequest, STATUS_FAIL, STATUS_OK};
use crate::protocol::frame::Frame;
use crate::protocol::response::{
    CommWayAck, DecodeResponse, DeviceInfo, EnterModeAck, FileOffset, ResultCode, SizeAck,
    UpdatePermit,
};
use crate::protocol::session::RcspSession;
use crate::reconnect::{self, ReconnectInfo};
use crate::transport::{Transport, TransportEvent};
use log::{debug, info, trace, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

/// Attribute mask requesting every target-info group.
const TARGET_INFO_MASK: u32 = 0xFFFF_FFFF;

/// Platform identifier the host reports in `GetTargetInfo`.
const PLATFORM_HOST: u8 = 0x02;

/// Communication way requested when preparing the update reboot.
const COMM_WAY_UPDATE: u8 = 0x01;

/// Reboot operation code for entering the update cycle.
const REBOOT_OP_UPDATE: u8 = 0x00;

/// Delay between initial connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Grace period between a disconnect and the rediscovery scan.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Window within which a repeated file-block sequence number is treated as
/// a link-layer retransmission and ignored.
const DUPLICATE_WINDOW: Duration = Duration::from_millis(50);

/// Capacity of the state/progress event channel.
const OTA_EVENT_CAPACITY: usize = 128;

/// Orchestrates OTA upgrade sessions over one transport.
pub struct OtaUpdater {
    transport: Arc<dyn Transport>,
    config: OtaConfig,
    active: AtomicBool,
    cancel: watch::Sender<bool>,
    events: broadcast::Sender<OtaEvent>,
    state: Mutex<OtaState>,
}

impl OtaUpdater {
    /// Create an updater over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: OtaConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        let (events, _) = broadcast::channel(OTA_EVENT_CAPACITY);
        Self {
            transport,
            config,
            active: AtomicBool::new(false),
            cancel,
            events,
            state: Mutex::new(OtaState::Idle),
        }
    }

    /// Subscribe to state and progress events. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<OtaEvent> {
        self.events.subscribe()
    }

    /// The current session state.
    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    pub fn current_state(&self) -> OtaState {
        *self.state.lock().unwrap()
    }

    /// Request cancellation of the running session. No-op when idle.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Run an upgrade session against the device at `address`.
    ///
    /// Completes only when the session reaches a terminal state; progress is
    /// observable through [`subscribe`](Self::subscribe). Fails fast with
    /// [`Error::UpgradeInProgress`] when a session is already running — the
    /// running session is not disturbed.
    pub async fn start(&self, address: DeviceAddress, firmware_path: &Path) -> Result<OtaOutcome> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::UpgradeInProgress);
        }
        // Released on every exit path, including the caller dropping this
        // future mid-session.
        let _guard = ActiveGuard(&self.active);

        let _ = self.cancel.send(false);
        let started = std::time::Instant::now();
        info!("Starting OTA for {address}: {}", firmware_path.display());

        let mut driver = Driver::new(self, address);
        let result = driver.run(firmware_path).await;
        let outcome = self.finish(&mut driver, result, started).await;
        drop(driver);

        Ok(outcome)
    }

    /// Tear the session down and build the terminal result. Timers are
    /// cleared and transport subscriptions dropped before this returns.
    async fn finish(
        &self,
        driver: &mut Driver<'_>,
        result: Result<()>,
        started: std::time::Instant,
    ) -> OtaOutcome {
        driver.clear_timers();

        if matches!(result, Err(Error::Cancelled)) {
            // Best effort: let the device leave update mode cleanly.
            if let Some(session) = &driver.session {
                if let Err(err) = session.send(&Command::ExitUpdateMode).await {
                    debug!("ExitUpdateMode on cancel failed: {err}");
                }
            }
        }

        if let Some(session) = driver.session.take() {
            session.shutdown();
        }
        driver.link_events = None;

        if let Err(err) = self.transport.disconnect().await {
            debug!("Disconnect during teardown failed: {err}");
        }

        let elapsed = started.elapsed();
        let (final_state, code, message) = match &result {
            Ok(()) => (
                OtaState::Completed,
                OtaErrorCode::Success,
                format!("upgrade completed in {elapsed:.1?}"),
            ),
            Err(Error::Cancelled) => (
                OtaState::Cancelled,
                OtaErrorCode::Cancelled,
                Error::Cancelled.to_string(),
            ),
            Err(err) => (OtaState::Failed, OtaErrorCode::from(err), err.to_string()),
        };
        driver.set_state(final_state);
        match &result {
            Ok(()) => info!("OTA finished: {message}"),
            Err(err) => warn!("OTA ended in {final_state}: {err}"),
        }

        OtaOutcome {
            success: result.is_ok(),
            code,
            message,
            device_info: driver.device_info.clone(),
            final_state,
            elapsed,
        }
    }
}

/// Clears the reentrancy flag when the session future ends, even if the
/// caller drops it before completion.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one `select!` pass in the transfer loop.
enum TransferStep {
    DeviceFrame(Frame),
    CommandTimeout,
    LinkDown,
    Cancelled,
    StreamClosed,
}

/// Per-session state, owned by the driver task for the whole session.
struct Driver<'a> {
    updater: &'a OtaUpdater,
    address: DeviceAddress,
    cancel: watch::Receiver<bool>,
    link_events: Option<broadcast::Receiver<TransportEvent>>,
    session: Option<Arc<RcspSession>>,
    unsolicited: Option<mpsc::UnboundedReceiver<Frame>>,
    device_info: Option<DeviceInfo>,
    reconnect_info: Option<ReconnectInfo>,
    firmware: Vec<u8>,
    transferred: u64,
    transfer_started: Instant,
    last_block: Option<(u8, Instant)>,
    command_timer: OneShot,
    offline_timer: OneShot,
}

impl<'a> Driver<'a> {
    fn new(updater: &'a OtaUpdater, address: DeviceAddress) -> Self {
        Self {
            updater,
            address,
            cancel: updater.cancel.subscribe(),
            link_events: None,
            session: None,
            unsolicited: None,
            device_info: None,
            reconnect_info: None,
            firmware: Vec::new(),
            transferred: 0,
            transfer_started: Instant::now(),
            last_block: None,
            command_timer: OneShot::new(),
            offline_timer: OneShot::new(),
        }
    }

    /// The whole session, from validation to the final verdict.
    async fn run(&mut self, firmware_path: &Path) -> Result<()> {
        self.set_state(OtaState::ValidatingFirmware);
        self.ensure_not_cancelled()?;
        self.firmware = firmware::validate(firmware_path)?;
        self.ensure_not_cancelled()?;

        self.set_state(OtaState::Connecting);
        self.connect_with_retries().await?;
        self.open_session()?;

        self.set_state(OtaState::GettingDeviceInfo);
        let info = self.fetch_device_info().await?;
        self.reconnect_info = Some(ReconnectInfo::new(self.address, info.reboot_scheme));

        // Branch on capabilities; first matching rule wins.
        if info.dual_bank {
            debug!("Dual-bank device, transferring without a mid-stream reconnect");
            self.run_direct_transfer().await
        } else if info.bootloader_required {
            debug!("Device hands off to a bootloader");
            self.negotiate_transfer_unit().await;
            self.run_direct_transfer().await
        } else if info.mandatory_upgrade {
            debug!("Device demands a mandatory upgrade");
            self.run_direct_transfer().await
        } else {
            debug!("Single-bank device, preparing update reboot");
            self.run_reconnect_transfer().await
        }
    }

    /// Dual-bank / mandatory / bootloader path: transfer on the current
    /// connection, then one reboot cycle confirms completion.
    async fn run_direct_transfer(&mut self) -> Result<()> {
        self.prepare_transfer(false).await?;
        let verdict = self.transfer_loop().await?;
        Self::ensure_device_ok(verdict)?;

        // The device holds the verified image; reboot activates it.
        self.session()?.send(&Command::RebootDevice { op: REBOOT_OP_UPDATE }).await?;
        self.reboot_cycle().await?;
        Ok(())
    }

    /// Single-bank path: tell the device to switch modes, ride out two
    /// reboots, and ask for the verdict at the very end.
    async fn run_reconnect_transfer(&mut self) -> Result<()> {
        self.set_state(OtaState::WaitingReconnect);
        self.offline_timer.arm(self.updater.config.offline_wait_timeout);
        self.switch_communication_way().await;
        self.wait_offline().await?;
        self.reconnect_cycle().await?;

        // Back online in update mode; refresh capabilities and resume from
        // whatever the device already holds.
        let info = self.fetch_device_info().await?;
        if let Some(reconnect_info) = &mut self.reconnect_info {
            reconnect_info.scheme = info.reboot_scheme;
        }
        self.prepare_transfer(true).await?;
        let verdict = self.transfer_loop().await?;
        Self::ensure_device_ok(verdict)?;

        // The device flashes and reboots on its own; wait for it to come
        // back, then query the final result.
        self.reboot_cycle().await?;
        self.set_state(OtaState::QueryingResult);
        let result: ResultCode = self.request(&Command::QueryUpdateResult).await?;
        Self::ensure_device_ok(result)?;
        Ok(())
    }

    /// One full disconnect + rediscovery + reconnect round.
    async fn reboot_cycle(&mut self) -> Result<()> {
        self.set_state(OtaState::WaitingReconnect);
        self.offline_timer.arm(self.updater.config.offline_wait_timeout);
        self.wait_offline().await?;
        self.reconnect_cycle().await
    }

    /// Initial connection with the configured number of attempts.
    async fn connect_with_retries(&mut self) -> Result<()> {
        let attempts = self.updater.config.max_retries.max(1);
        for attempt in 1..=attempts {
            self.ensure_not_cancelled()?;
            let connect = self.updater.transport.connect(&self.address);
            let result = tokio::select! {
                result = connect => result,
                () = Self::cancelled(&mut self.cancel) => Err(Error::Cancelled),
            };
            match result {
                Ok(()) => {
                    debug!("Connected to {} (attempt {attempt})", self.address);
                    return Ok(());
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) if attempt < attempts => {
                    warn!("Connect attempt {attempt}/{attempts} failed: {err}");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                },
                Err(err) => {
                    return Err(Error::ConnectFailed(format!(
                        "{err} after {attempts} attempts"
                    )));
                },
            }
        }
        unreachable!("loop returns on the final attempt")
    }

    /// Create and initialize a fresh protocol session on the current
    /// connection. Replaces any previous session.
    fn open_session(&mut self) -> Result<()> {
        if let Some(old) = self.session.take() {
            old.shutdown();
        }
        self.link_events = Some(self.updater.transport.subscribe());

        let session = Arc::new(RcspSession::new(Arc::clone(&self.updater.transport)));
        session.initialize()?;
        self.unsolicited = session.take_unsolicited();
        self.session = Some(session);
        Ok(())
    }

    async fn fetch_device_info(&mut self) -> Result<DeviceInfo> {
        let info: DeviceInfo = self
            .request(&Command::GetTargetInfo {
                mask: TARGET_INFO_MASK,
                platform: PLATFORM_HOST,
            })
            .await?;
        info!(
            "Device: {} v{} (battery {}%, dual-bank: {}, bootloader: {}, mandatory: {})",
            info.name,
            info.version,
            info.battery,
            info.dual_bank,
            info.bootloader_required,
            info.mandatory_upgrade
        );
        self.device_info = Some(info.clone());
        Ok(info)
    }

    /// Best-effort negotiation of a larger transfer unit. Failure is
    /// absorbed; firmware tolerates the default unit.
    async fn negotiate_transfer_unit(&mut self) {
        let command = Command::ChangeCommunicationWay {
            way: COMM_WAY_UPDATE,
            supports_new_reboot: true,
        };
        match self.request::<CommWayAck>(&command).await {
            Ok(CommWayAck(unit)) => info!("Negotiated transfer unit: {unit}"),
            Err(Error::Cancelled) => {},
            Err(err) => warn!("Transfer-unit negotiation failed (non-fatal): {err}"),
        }
    }

    /// Instruct the device to switch communication mode before its update
    /// reboot. The device may drop the link instead of answering, so any
    /// failure here is absorbed.
    async fn switch_communication_way(&mut self) {
        let command = Command::ChangeCommunicationWay {
            way: COMM_WAY_UPDATE,
            supports_new_reboot: true,
        };
        match self.request::<CommWayAck>(&command).await {
            Ok(CommWayAck(ack)) => debug!("Communication-way switch acknowledged: {ack:#06x}"),
            Err(Error::Cancelled) => {},
            Err(err) => warn!("Communication-way switch not acknowledged (non-fatal): {err}"),
        }
    }

    /// Offset read, acceptance inquiry, update mode and size notification.
    async fn prepare_transfer(&mut self, resume: bool) -> Result<()> {
        self.set_state(OtaState::ReadingFileOffset);
        let FileOffset(offset) = self.request(&Command::ReadFileOffset).await?;
        debug!("Device reports file offset {offset}");

        if !resume {
            let permit: UpdatePermit = self
                .request(&Command::InquireCanUpdate {
                    header: firmware::header(&self.firmware).to_vec(),
                })
                .await?;
            if !permit.allowed() {
                return Err(Error::UpdateRejected(permit.0));
            }
        }

        self.set_state(OtaState::EnteringUpdateMode);
        let reenter = self.device_info.as_ref().is_some_and(|info| {
            info.mandatory_upgrade || info.bootloader_required
        });
        if !resume || reenter {
            let ack: EnterModeAck = self.request(&Command::EnterUpdateMode).await?;
            if !ack.ok() {
                return Err(Error::DeviceStatus {
                    opcode: opcode::ENTER_UPDATE_MODE,
                    status: ack.0,
                });
            }
        }

        #[allow(clippy::cast_possible_truncation)] // validated against the 50 MB cap
        let size = self.firmware.len() as u32;
        let SizeAck = self
            .request(&Command::NotifyFileSize {
                size,
                offset: (offset > 0).then_some(offset),
            })
            .await?;

        self.transferred = u64::from(offset);
        Ok(())
    }

    /// Serve device-initiated file-block requests until the sentinel ends
    /// the phase. Returns the device's inline result code.
    async fn transfer_loop(&mut self) -> Result<ResultCode> {
        self.set_state(OtaState::TransferringFile);
        self.transfer_started = Instant::now();
        self.last_block = None;
        self.command_timer.arm(self.updater.config.command_timeout);

        loop {
            let step = {
                let Driver {
                    cancel,
                    link_events,
                    unsolicited,
                    command_timer,
                    ..
                } = self;
                let link = link_events
                    .as_mut()
                    .ok_or_else(|| Error::NotReady("no transport subscription".into()))?;
                let stream = unsolicited
                    .as_mut()
                    .ok_or_else(|| Error::NotReady("no unsolicited stream".into()))?;

                tokio::select! {
                    () = command_timer.fired() => TransferStep::CommandTimeout,
                    () = Self::cancelled(cancel) => TransferStep::Cancelled,
                    frame = stream.recv() => match frame {
                        Some(frame) => TransferStep::DeviceFrame(frame),
                        None => TransferStep::StreamClosed,
                    },
                    event = link.recv() => match event {
                        Ok(TransportEvent::Connection(false)) => TransferStep::LinkDown,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Transfer loop lagged, {n} transport events lost");
                            continue;
                        },
                        Err(broadcast::error::RecvError::Closed) => TransferStep::LinkDown,
                    },
                }
            };

            match step {
                TransferStep::CommandTimeout => {
                    self.command_timer.clear();
                    return Err(Error::Timeout(
                        "device stopped requesting file blocks".into(),
                    ));
                },
                TransferStep::Cancelled => return Err(Error::Cancelled),
                TransferStep::LinkDown => {
                    return Err(Error::ConnectFailed(
                        "device disconnected during transfer".into(),
                    ));
                },
                TransferStep::StreamClosed => {
                    return Err(Error::Protocol("session receive task stopped".into()));
                },
                TransferStep::DeviceFrame(frame) => {
                    let Some(request) = FileBlockRequest::parse(&frame) else {
                        trace!(
                            "Ignoring device command with opcode {:#04x}",
                            frame.opcode
                        );
                        continue;
                    };
                    if let Some(verdict) = self.handle_block(request).await? {
                        self.command_timer.clear();
                        return Ok(verdict);
                    }
                },
            }
        }
    }

    /// Answer one file-block request. Returns the device's result code when
    /// the sentinel ends the transfer phase.
    async fn handle_block(&mut self, request: FileBlockRequest) -> Result<Option<ResultCode>> {
        // Link-layer retransmissions repeat the sequence number back to
        // back; process such a request at most once.
        if let Some((sequence, at)) = self.last_block {
            if sequence == request.sequence && at.elapsed() < DUPLICATE_WINDOW {
                debug!("Ignoring duplicate file-block request (seq {sequence})");
                return Ok(None);
            }
        }
        self.last_block = Some((request.sequence, Instant::now()));

        if request.is_sentinel() {
            trace!("Sentinel block request, querying result");
            // Contract: acknowledge first, only then query the result.
            self.session()?.respond(&request.reply(STATUS_OK, &[])).await?;
            let verdict: ResultCode = self.request(&Command::QueryUpdateResult).await?;

            // The transfer is logically complete whatever the byte count.
            self.transferred = self.firmware.len() as u64;
            self.emit_progress();
            return Ok(Some(verdict));
        }

        let length = request.length.min(self.updater.config.block_size);
        let data = firmware::read_block(&self.firmware, request.offset, length);
        if data.is_empty() && request.offset > 0 && request.length > 0 {
            warn!(
                "Invalid block request: offset {} length {} beyond image",
                request.offset, request.length
            );
            self.session()?.respond(&request.reply(STATUS_FAIL, &[])).await?;
            return Ok(None);
        }

        let served = data.len() as u64;
        let reply = request.reply(STATUS_OK, data);
        self.session()?.respond(&reply).await?;

        self.transferred = self.transferred.max(u64::from(request.offset) + served);
        self.command_timer.arm(self.updater.config.command_timeout);
        self.emit_progress();
        Ok(None)
    }

    /// Wait for the link to drop, bounded by the offline-wait timer.
    async fn wait_offline(&mut self) -> Result<()> {
        let Driver {
            cancel,
            link_events,
            offline_timer,
            ..
        } = self;
        let link = link_events
            .as_mut()
            .ok_or_else(|| Error::NotReady("no transport subscription".into()))?;

        loop {
            tokio::select! {
                () = offline_timer.fired() => {
                    offline_timer.clear();
                    return Err(Error::Timeout(
                        "device did not go offline for its update reboot".into(),
                    ));
                },
                () = Self::cancelled(cancel) => return Err(Error::Cancelled),
                event = link.recv() => match event {
                    Ok(TransportEvent::Connection(false)) => {
                        debug!("Device went offline");
                        offline_timer.clear();
                        return Ok(());
                    },
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Offline wait lagged, {n} transport events lost");
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::Transport("transport event channel closed".into()));
                    },
                },
            }
        }
    }

    /// Settle, rediscover the rebooted device and reconnect to it.
    async fn reconnect_cycle(&mut self) -> Result<()> {
        let info = self
            .reconnect_info
            .take()
            .ok_or_else(|| Error::NotReady("no reconnect state".into()))?;

        // Give the stack a moment to fully drop the old link.
        tokio::select! {
            () = tokio::time::sleep(SETTLE_DELAY) => {},
            () = Self::cancelled(&mut self.cancel) => return Err(Error::Cancelled),
        }

        self.set_state(OtaState::WaitingReconnect);
        let found = reconnect::await_reconnect(
            &self.updater.transport,
            info,
            self.updater.config.reconnect_timeout,
            &mut self.cancel,
        )
        .await;

        match found {
            Some(address) => {
                // The next reboot mutates from the address we are now on.
                self.reconnect_info = Some(ReconnectInfo::new(address, info.scheme));
                self.open_session()?;
                Ok(())
            },
            None if *self.cancel.borrow() => Err(Error::Cancelled),
            None => Err(Error::ReconnectTimeout),
        }
    }

    /// Send a correlated command, racing the session-level cancellation.
    async fn request<R: DecodeResponse>(&mut self, command: &Command) -> Result<R> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| Error::NotReady("no protocol session".into()))?;
        let timeout = self.updater.config.command_timeout;
        tokio::select! {
            result = session.request(command, timeout) => result,
            () = Self::cancelled(&mut self.cancel) => Err(Error::Cancelled),
        }
    }

    fn session(&self) -> Result<&Arc<RcspSession>> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::NotReady("no protocol session".into()))
    }

    fn ensure_device_ok(result: ResultCode) -> Result<()> {
        if result.ok() {
            Ok(())
        } else {
            Err(Error::DeviceStatus {
                opcode: opcode::QUERY_UPDATE_RESULT,
                status: result.0,
            })
        }
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation is requested; pend forever otherwise.
    async fn cancelled(cancel: &mut watch::Receiver<bool>) {
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn clear_timers(&mut self) {
        self.command_timer.clear();
        self.offline_timer.clear();
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    fn set_state(&self, state: OtaState) {
        {
            let mut current = self.updater.state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!("State -> {state}");
        let _ = self.updater.events.send(OtaEvent::State(state));
    }

    fn emit_progress(&self) {
        let progress = Progress::new(
            self.firmware.len() as u64,
            self.transferred,
            self.transfer_started.elapsed(),
        );
        trace!(
            "Progress: {}/{} bytes ({:.1}%)",
            progress.transferred_bytes,
            progress.total_bytes,
            progress.percentage
        );
        let _ = self.updater.events.send(OtaEvent::Progress(progress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EVENT_CHANNEL_CAPACITY;
    use async_trait::async_trait;

    struct IdleTransport {
        events: broadcast::Sender<TransportEvent>,
    }

    impl IdleTransport {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            Arc::new(Self { events })
        }
    }

    #[async_trait]
    impl Transport for IdleTransport {
        async fn connect(&self, _address: &DeviceAddress) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn write(&self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn start_scan(&self) -> Result<()> {
            Ok(())
        }
        async fn stop_scan(&self) -> Result<()> {
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }
    }

    struct StallingTransport {
        events: broadcast::Sender<TransportEvent>,
    }

    impl StallingTransport {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            Arc::new(Self { events })
        }
    }

    #[async_trait]
    impl Transport for StallingTransport {
        async fn connect(&self, _address: &DeviceAddress) -> Result<()> {
            std::future::pending().await
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn write(&self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn start_scan(&self) -> Result<()> {
            Ok(())
        }
        async fn stop_scan(&self) -> Result<()> {
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test]
    async fn test_initial_state_is_idle() {
        let updater = OtaUpdater::new(IdleTransport::new(), OtaConfig::default());
        assert_eq!(updater.current_state(), OtaState::Idle);
    }

    #[tokio::test]
    async fn test_missing_firmware_fails_with_code() {
        let updater = OtaUpdater::new(IdleTransport::new(), OtaConfig::default());
        let outcome = updater
            .start(
                DeviceAddress([0; 6]),
                Path::new("/nonexistent/firmware.bin"),
            )
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.code, OtaErrorCode::InvalidFirmware);
        assert_eq!(outcome.final_state, OtaState::Failed);
        assert_eq!(updater.current_state(), OtaState::Failed);
    }

    #[tokio::test]
    async fn test_updater_reusable_after_terminal_state() {
        let updater = OtaUpdater::new(IdleTransport::new(), OtaConfig::default());
        let path = Path::new("/nonexistent/firmware.bin");
        let first = updater.start(DeviceAddress([0; 6]), path).await.unwrap();
        assert!(!first.success);
        // A terminal session releases the reentrancy guard.
        let second = updater.start(DeviceAddress([0; 6]), path).await.unwrap();
        assert!(!second.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_session_releases_reentrancy_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.ufw");
        std::fs::write(&path, [0u8; 64]).unwrap();

        let updater = OtaUpdater::new(StallingTransport::new(), OtaConfig::default());

        {
            let session = updater.start(DeviceAddress([0; 6]), &path);
            tokio::pin!(session);
            tokio::select! {
                outcome = &mut session => panic!("connect should stall: {outcome:?}"),
                () = tokio::time::sleep(Duration::from_millis(50)) => {},
            }
        }

        // The dropped future released the reentrancy flag; a fresh session
        // is admitted instead of UpgradeInProgress.
        let retry = updater.start(DeviceAddress([0; 6]), &path);
        tokio::pin!(retry);
        tokio::select! {
            outcome = &mut retry => panic!("second session should stall too: {outcome:?}"),
            () = tokio::time::sleep(Duration::from_millis(50)) => {},
        }
    }

    #[tokio::test]
    async fn test_state_events_published() {
        let updater = OtaUpdater::new(IdleTransport::new(), OtaConfig::default());
        let mut events = updater.subscribe();
        let _ = updater
            .start(
                DeviceAddress([0; 6]),
                Path::new("/nonexistent/firmware.bin"),
            )
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OtaEvent::State(state) = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![OtaState::ValidatingFirmware, OtaState::Failed]);
    }
}
