//! Protocol module - FTDI SIO wire definitions.

pub mod baud;
pub mod constants;
pub mod encoder;
pub mod line;
pub mod status;

pub use baud::{BaudDivisor, ChipType, EncodeError, encode_baud_rate};
pub use constants::*;
pub use encoder::ControlRequest;
pub use line::{DataBits, FlowControl, ModemLines, Parity, SerialConfig, StopBits};
pub use status::{Frame, ModemStatus};
