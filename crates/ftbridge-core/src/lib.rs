//! ftbridge-core: serial-over-USB bridge for FTDI-family UART chips.
//!
//! This crate finds FT232/FT2232/FT4232H/FT232H/FT-X chips on the USB bus,
//! claims one UART interface, programs baud rate, line format, flow control
//! and modem lines through SIO vendor requests, and moves bytes over the
//! chip's bulk pipes.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: SIO request constants, baud divisor encoding, line settings, status header
//! - **Topology**: Device tree snapshot built from bus id and port chain
//! - **Transport**: USB host-stack abstraction (nusb, mock)
//! - **Locator**: Depth-first search by vendor and product ID
//! - **Context**: Host backend plus release registry, shared by all sessions
//! - **Session**: One claimed interface with lazily opened bulk pipes
//! - **Events**: Observer pattern for UI decoupling
//! - **Config**: TOML configuration file
//!
//! # Example
//!
//! ```no_run
//! use ftbridge_core::{BridgeContext, ModemLines, NusbHost, PortSession, ProductFilter, SerialConfig};
//! use ftbridge_core::protocol::FTDI_VENDOR_ID;
//!
//! let ctx = BridgeContext::new(NusbHost::new());
//! let device = ctx
//!     .locator()
//!     .find_first(None, FTDI_VENDOR_ID, &ProductFilter::ftdi())
//!     .expect("no FTDI device");
//!
//! let session = PortSession::bring_up(&ctx, &device, &SerialConfig::new(9600), ModemLines::default())
//!     .expect("bring-up failed");
//! session.write(b"AT\r").expect("write failed");
//! let reply = session.read().expect("read failed");
//! println!("{reply:02X?}");
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod guard;
pub mod locator;
mod pipe;
pub mod protocol;
pub mod session;
pub mod topology;
pub mod transport;

// Re-exports for convenience
pub use config::BridgeConfig;
pub use context::BridgeContext;
pub use error::{BridgeError, ConfigStep, Result};
pub use events::{BridgeEvent, BridgeObserver, NullObserver, SessionState, TracingObserver};
pub use locator::{DeviceLocator, ProductFilter, find_in};
pub use protocol::{
    ChipType, DataBits, EncodeError, FlowControl, Frame, ModemLines, ModemStatus, Parity,
    SerialConfig, StopBits,
};
pub use session::{PortSession, classify_endpoints};
pub use topology::{DeviceIdentity, DeviceLocation, UsbDevice, UsbNode};
pub use transport::{MockDevice, MockHost, NusbHost, TransportError};
