//! RCSP protocol session: sequencing, send discipline and response
//! correlation.
//!
//! One session lives per connection. It owns the receive side of the
//! transport: a background task feeds incoming bytes to the
//! [`FrameAssembler`](crate::protocol::frame::FrameAssembler), resolves
//! response frames against the pending-request table, and forwards
//! device-initiated command frames (file-block requests) to a separate
//! stream so they never touch the correlation table.
//!
//! The transport cannot multiplex, so a mutual-exclusion gate keeps at most
//! one host request in flight on the wire; replies to device-initiated
//! requests bypass the gate because they are not correlated.

use crate::error::{Error, Result};
use crate::protocol::command::Command;
use crate::protocol::frame::{Frame, FrameAssembler};
use crate::protocol::response::{DecodeResponse, ResponseParts};
use crate::transport::{Transport, TransportEvent};
use log::{trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

type PendingTable = Mutex<HashMap<(u8, u8), oneshot::Sender<ResponseParts>>>;

/// A protocol session over one connection.
pub struct RcspSession {
    transport: Arc<dyn Transport>,
    sequence: AtomicU8,
    initialized: AtomicBool,
    pending: Arc<PendingTable>,
    gate: tokio::sync::Mutex<()>,
    unsolicited_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

impl RcspSession {
    /// Create a session over `transport`. Call [`initialize`](Self::initialize)
    /// before sending.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sequence: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
            pending: Arc::new(Mutex::new(HashMap::new())),
            gate: tokio::sync::Mutex::new(()),
            unsolicited_rx: Mutex::new(None),
            rx_task: Mutex::new(None),
        }
    }

    /// Start the receive task. Must be called exactly once per session.
    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let mut events = self.transport.subscribe();
        let (unsolicited_tx, unsolicited_rx) = mpsc::unbounded_channel();
        *self.unsolicited_rx.lock().unwrap() = Some(unsolicited_rx);

        let pending = Arc::clone(&self.pending);
        let task = tokio::spawn(async move {
            let mut assembler = FrameAssembler::new();
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Data(bytes)) => {
                        for frame in assembler.push(&bytes) {
                            Self::dispatch(&pending, &unsolicited_tx, frame);
                        }
                    },
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Receive task lagged, {n} transport events lost");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            trace!("Receive task finished");
        });
        *self.rx_task.lock().unwrap() = Some(task);

        Ok(())
    }

    /// Route one parsed frame. Runs on the receive task and must stay cheap:
    /// resolving a waiter is a single map removal and channel send.
    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    fn dispatch(
        pending: &PendingTable,
        unsolicited_tx: &mpsc::UnboundedSender<Frame>,
        frame: Frame,
    ) {
        if frame.is_command {
            if unsolicited_tx.send(frame).is_err() {
                trace!("Device command dropped, no consumer attached");
            }
            return;
        }

        let Some(parts) = ResponseParts::from_frame(&frame) else {
            warn!(
                "Response frame for opcode {:#04x} too short to carry [status, sequence]",
                frame.opcode
            );
            return;
        };

        let waiter = pending
            .lock()
            .unwrap()
            .remove(&(frame.opcode, parts.sequence));
        match waiter {
            Some(tx) => {
                let _ = tx.send(parts);
            },
            None => trace!(
                "Unmatched response: opcode {:#04x} seq {}",
                frame.opcode,
                parts.sequence
            ),
        }
    }

    /// Take the stream of device-initiated command frames. Yields `Some`
    /// only once, after [`initialize`](Self::initialize).
    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    pub fn take_unsolicited(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.unsolicited_rx.lock().unwrap().take()
    }

    /// Send a command and wait for its correlated response.
    ///
    /// Fails with [`Error::Timeout`] when no matching response arrives within
    /// `timeout`; the pending entry is removed and the wait abandoned. No
    /// retry happens at this layer.
    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    pub async fn request<R: DecodeResponse>(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<R> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotReady("session not initialized".into()));
        }

        let _gate = self.gate.lock().await;

        let sequence = self.next_sequence();
        let opcode = command.opcode();
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self
            .pending
            .lock()
            .unwrap()
            .insert((opcode, sequence), tx)
        {
            // One unresolved waiter per key; a stale one can only remain if a
            // full sequence cycle elapsed without a response.
            drop(stale);
            warn!("Replacing stale waiter for opcode {opcode:#04x} seq {sequence}");
        }

        trace!("-> opcode {opcode:#04x} seq {sequence}");
        let frame = command.encode(sequence);
        if let Err(err) = self.transport.write(&frame.encode()).await {
            self.pending.lock().unwrap().remove(&(opcode, sequence));
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(parts)) => {
                trace!("<- opcode {opcode:#04x} seq {sequence} status {}", parts.status);
                R::decode(parts.status, &parts.body)
            },
            Ok(Err(_)) => Err(Error::Protocol(format!(
                "waiter for opcode {opcode:#04x} dropped"
            ))),
            Err(_) => {
                self.pending.lock().unwrap().remove(&(opcode, sequence));
                Err(Error::Timeout(format!(
                    "no response to opcode {opcode:#04x} within {timeout:?}"
                )))
            },
        }
    }

    /// Send a command that has no response (reboot, exit update mode).
    pub async fn send(&self, command: &Command) -> Result<()> {
        let _gate = self.gate.lock().await;
        let frame = command.encode(self.next_sequence());
        trace!("-> opcode {:#04x} (no response expected)", frame.opcode);
        self.transport.write(&frame.encode()).await
    }

    /// Write a reply to a device-initiated request. Bypasses the request
    /// gate: replies are not correlated and must not queue behind an
    /// in-flight host command.
    pub async fn respond(&self, frame: &Frame) -> Result<()> {
        self.transport.write(&frame.encode()).await
    }

    /// Stop the receive task. Called on session teardown; dropping the
    /// session does the same.
    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    pub fn shutdown(&self) {
        if let Some(task) = self.rx_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Drop for RcspSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceAddress;
    use crate::protocol::command::opcode;
    use crate::protocol::response::EnterModeAck;
    use crate::transport::EVENT_CHANNEL_CAPACITY;
    use async_trait::async_trait;

    /// Transport double: records writes, lets tests inject events.
    struct MockTransport {
        events: broadcast::Sender<TransportEvent>,
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            Arc::new(Self {
                events,
                written: Mutex::new(Vec::new()),
            })
        }

        fn inject(&self, event: TransportEvent) {
            let _ = self.events.send(event);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, _address: &DeviceAddress) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn write(&self, bytes: &[u8]) -> Result<()> {
            self.written.lock().unwrap().push(bytes.to_vec());
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

    fn enter_mode_response(sequence: u8) -> Vec<u8> {
        Frame::response(opcode::ENTER_UPDATE_MODE, vec![0x00, sequence, 0x00]).encode()
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let session = RcspSession::new(MockTransport::new());
        session.initialize().unwrap();
        assert!(matches!(
            session.initialize(),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_request_before_initialize_fails() {
        let session = RcspSession::new(MockTransport::new());
        let result: Result<EnterModeAck> = session
            .request(&Command::EnterUpdateMode, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn test_request_resolved_by_matching_response() {
        let transport = MockTransport::new();
        let session = RcspSession::new(transport.clone());
        session.initialize().unwrap();

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                // First request of the session carries sequence 0.
                transport.inject(TransportEvent::Data(enter_mode_response(0)));
            })
        };

        let ack: EnterModeAck = session
            .request(&Command::EnterUpdateMode, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ack.ok());
        assert_eq!(session.pending_len(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_split_across_receives() {
        let transport = MockTransport::new();
        let session = RcspSession::new(transport.clone());
        session.initialize().unwrap();

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let bytes = enter_mode_response(0);
                let (a, b) = bytes.split_at(4);
                transport.inject(TransportEvent::Data(a.to_vec()));
                tokio::time::sleep(Duration::from_millis(10)).await;
                transport.inject(TransportEvent::Data(b.to_vec()));
            })
        };

        let ack: EnterModeAck = session
            .request(&Command::EnterUpdateMode, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ack.ok());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_sequence_ignored_and_timeout_clears_entry() {
        let transport = MockTransport::new();
        let session = RcspSession::new(transport.clone());
        session.initialize().unwrap();

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                // Wrong sequence: must not resolve the pending request.
                transport.inject(TransportEvent::Data(enter_mode_response(99)));
            })
        };

        let result: Result<EnterModeAck> = session
            .request(&Command::EnterUpdateMode, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(session.pending_len(), 0, "timeout must remove the entry");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_commands_bypass_correlation() {
        let transport = MockTransport::new();
        let session = RcspSession::new(transport.clone());
        session.initialize().unwrap();
        let mut unsolicited = session.take_unsolicited().unwrap();
        assert!(session.take_unsolicited().is_none(), "stream handed out once");

        let request = Frame::command(
            opcode::FILE_BLOCK,
            true,
            vec![3, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02],
        );
        transport.inject(TransportEvent::Data(request.encode()));

        let frame = unsolicited.recv().await.unwrap();
        assert_eq!(frame.opcode, opcode::FILE_BLOCK);
        assert!(frame.is_command);
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_send_writes_encoded_frame() {
        let transport = MockTransport::new();
        let session = RcspSession::new(transport.clone());
        session.initialize().unwrap();

        session
            .send(&Command::RebootDevice { op: 0 })
            .await
            .unwrap();

        let written = transport.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        let frame = Frame::parse(&written[0]).unwrap();
        assert_eq!(frame.opcode, opcode::REBOOT_DEVICE);
        assert!(!frame.needs_response);
    }

    #[tokio::test]
    async fn test_sequence_wraps_at_256_without_early_reuse() {
        let session = RcspSession::new(MockTransport::new());
        let first_cycle: Vec<u8> = (0..256).map(|_| session.next_sequence()).collect();
        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(first_cycle, expected, "each value used once per cycle");
        assert_eq!(session.next_sequence(), 0, "wraps back to zero");
    }
}
