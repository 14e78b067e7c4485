#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Bushido
//!
//! A Rust library for riding a Tacx Bushido trainer from a computer.
//!
//! The Bushido head unit talks to the host through the ANT USB stick it ships
//! with. This crate opens the stick over USB, brings the ANT channel up, puts
//! the head unit into PC mode and then keeps the conversation going: it decodes
//! live telemetry (speed, cadence, power, distance, brake temperature, heart
//! rate and button presses) and sends resistance setpoints back so that the
//! pedaling effort follows the elevation profile of a loaded route.
//!
//! ## Protocol
//!
//! Every message is an ANT serial frame:
//!
//! ```text
//! [SYNC 0xA4][LEN][TYPE][PAYLOAD ... LEN bytes][CHECKSUM]
//! ```
//!
//! with the checksum being the XOR of all preceding bytes. Only one command is
//! in flight at a time; it is retransmitted every second until the stick
//! acknowledges it. Commands for the head unit travel as broadcast data with
//! an 8-byte body. See [`protocol`] for the full catalog.
//!
//! ## Resistance control
//!
//! A [`RouteProfile`] holds route segments at a fixed 20 m spacing. On every
//! distance update the [`ResistanceController`] looks up the segment ahead of
//! the rider and moves the slope setpoint toward its grade by at most 1 % per
//! update. One telemetry sample is kept per segment entered while riding.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bushido::{BushidoDevice, RouteProfile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let route = RouteProfile::from_slopes(&[0.0, 2.0, 4.0, 4.0, 1.0], 250.0);
//!     let mut trainer = BushidoDevice::open().await?.with_route(route);
//!     let handle = trainer.handle();
//!
//!     let session = tokio::spawn(async move { trainer.run().await });
//!
//!     // rider weight is sent with every resistance command
//!     handle.set_weight(75)?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop()?;
//!     session.await??;
//!     Ok(())
//! }
//! ```

/// Resistance controller following a route profile
pub mod controller;
/// Trainer session and its control handle
pub mod device;
/// Inbound frame dispatch and connection state machine
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// Byte-level device link and its USB implementation
pub mod link;
/// ANT frame codec and command catalog
pub mod protocol;
/// Route profile consumed by the controller
pub mod route;
/// Send/receive engine with acknowledgment and retry
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use controller::ResistanceController;
pub use device::{BushidoDevice, SessionHandle};
pub use error::{BushidoError, Result};
pub use link::{DeviceLink, UsbLink};
pub use protocol::{Command, Frame};
pub use route::{RouteProfile, RouteSegment};
pub use types::{
    Button, ChannelConfig, ConnectionState, LinkParams, RetryConfig, SessionConfig,
    TelemetrySample, TelemetryState, TrainerEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// USB vendor id of the ANT stick shipped with the Bushido (Dynastream)
pub const BUSHIDO_VENDOR_ID: u16 = 0x0FCF;

/// USB product id of the ANT stick shipped with the Bushido
pub const BUSHIDO_PRODUCT_ID: u16 = 0x1008;

/// Bulk endpoint number used in both directions
///
/// The OUT endpoint address is `0x01` and the IN endpoint address `0x81`.
pub const BUSHIDO_BULK_ENDPOINT: u8 = 0x01;
