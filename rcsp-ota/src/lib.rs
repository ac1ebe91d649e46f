//! # rcsp-ota
//!
//! A host-side OTA firmware-update driver for accessories speaking the
//! RCSP framed protocol over BLE (or any byte transport).
//!
//! This crate provides:
//!
//! - RCSP frame encoding and streaming reassembly
//! - Typed commands and responses with sequence-number correlation
//! - A session layer that separates host requests from device-initiated
//!   file-block requests
//! - An upgrade orchestrator that drives the whole session, including the
//!   reboot/reconnect cycles and post-reboot device rediscovery
//!
//! The transport is abstract: implement the [`Transport`] trait for your
//! BLE stack (the companion CLI ships a `btleplug`-based one) and hand it
//! to an [`OtaUpdater`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use rcsp_ota::{DeviceAddress, OtaConfig, OtaUpdater};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run(transport: Arc<dyn rcsp_ota::Transport>) -> rcsp_ota::Result<()> {
//! let updater = OtaUpdater::new(transport, OtaConfig::default());
//! let mut events = updater.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//!
//! let address: DeviceAddress = "11:22:33:44:55:66".parse()?;
//! let outcome = updater.start(address, Path::new("firmware.ufw")).await?;
//! println!("{}: {}", outcome.final_state, outcome.message);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
pub mod ota;
pub mod protocol;
pub mod reconnect;
pub mod transport;

// Re-exports for convenience
pub use {
    config::OtaConfig,
    device::{DeviceAddress, RebootScheme},
    error::{Error, OtaErrorCode, Result},
    ota::{
        state::{OtaEvent, OtaOutcome, OtaState, Progress},
        updater::OtaUpdater,
    },
    protocol::{
        command::{Command, FileBlockRequest},
        frame::{Frame, FrameAssembler},
        response::DeviceInfo,
        session::RcspSession,
    },
    reconnect::ReconnectInfo,
    transport::{Transport, TransportEvent},
};
