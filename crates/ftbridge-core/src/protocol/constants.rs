//! Protocol constants for FTDI-family UART bridges.
//!
//! Request codes and bit layouts follow the vendor SIO command set shared by
//! the FT232B/R, FT2232, FT4232H, FT232H and FT-X parts.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Future Technology Devices International Vendor ID
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// FT232B / FT232R / FT245R
pub const FT232_PRODUCT_ID: u16 = 0x6001;
/// FT2232C / FT2232D / FT2232H (dual port)
pub const FT2232_PRODUCT_ID: u16 = 0x6010;
/// FT4232H (quad port)
pub const FT4232_PRODUCT_ID: u16 = 0x6011;
/// FT232H (single high-speed port)
pub const FT232H_PRODUCT_ID: u16 = 0x6014;
/// FT-X series (FT230X, FT231X, FT234XD)
pub const FTX_PRODUCT_ID: u16 = 0x6015;

/// Product IDs used when no explicit filter is configured.
pub const SUPPORTED_PIDS: &[u16] = &[
    FT232_PRODUCT_ID,
    FT2232_PRODUCT_ID,
    FT4232_PRODUCT_ID,
    FT232H_PRODUCT_ID,
    FTX_PRODUCT_ID,
];

/// USB device class code for hubs.
pub const USB_CLASS_HUB: u8 = 0x09;

// ============================================================================
// SIO Control Requests (Host -> Device, vendor type)
// ============================================================================

/// Reset the port / purge FIFOs
pub const SIO_RESET_REQUEST: u8 = 0;
/// Set DTR / RTS modem control lines
pub const SIO_SET_MODEM_CTRL_REQUEST: u8 = 1;
/// Set flow control handshaking
pub const SIO_SET_FLOW_CTRL_REQUEST: u8 = 2;
/// Set baud rate divisor
pub const SIO_SET_BAUDRATE_REQUEST: u8 = 3;
/// Set data bits, parity, stop bits and break
pub const SIO_SET_DATA_REQUEST: u8 = 4;

// Reset value
pub const SIO_RESET_SIO: u16 = 0;

// Flow control selectors (high byte of wIndex)
pub const SIO_DISABLE_FLOW_CTRL: u16 = 0x0000;
pub const SIO_RTS_CTS_HS: u16 = 0x01 << 8;
pub const SIO_DTR_DSR_HS: u16 = 0x02 << 8;
pub const SIO_XON_XOFF_HS: u16 = 0x04 << 8;

/// Default XON character (DC1)
pub const XON_CHAR: u8 = 0x11;
/// Default XOFF character (DC3)
pub const XOFF_CHAR: u8 = 0x13;

// Modem control values: high byte enables the line, low byte sets it
pub const SIO_SET_DTR_MASK: u16 = 0x0100;
pub const SIO_SET_RTS_MASK: u16 = 0x0200;
pub const SIO_SET_DTR_HIGH: u16 = SIO_SET_DTR_MASK | 0x01;
pub const SIO_SET_DTR_LOW: u16 = SIO_SET_DTR_MASK;
pub const SIO_SET_RTS_HIGH: u16 = SIO_SET_RTS_MASK | 0x02;
pub const SIO_SET_RTS_LOW: u16 = SIO_SET_RTS_MASK;

// ============================================================================
// Clocks
// ============================================================================

/// Base clock of full-speed parts (48 MHz).
pub const C_CLK: u32 = 48_000_000;
/// High-speed clock of H-series parts (120 MHz).
pub const H_CLK: u32 = 120_000_000;
/// Selects the 120 MHz clock in the encoded divisor.
pub const H_CLK_DIVISOR_BIT: u32 = 0x20000;
/// Largest divisor the chip accepts.
pub const MAX_DIVISOR: u32 = 0x1FFFF;

// ============================================================================
// Bulk Framing
// ============================================================================

/// Modem/line status bytes prepended to every bulk IN transfer.
pub const STATUS_HEADER_LEN: usize = 2;

/// Max packet size of full-speed parts.
pub const FULL_SPEED_PACKET_SIZE: usize = 64;
/// Max packet size of high-speed parts.
pub const HIGH_SPEED_PACKET_SIZE: usize = 512;

// ============================================================================
// Session Defaults
// ============================================================================

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Timeout applied to every control and bulk transfer.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Settle time after releasing a claimed interface.
pub const RELEASE_GRACE: Duration = Duration::from_millis(250);
