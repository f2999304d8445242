//! Baud rate divisor encoding.
//!
//! The chip derives its bit clock from a base clock divided by a 14-bit
//! integer plus a 3-bit fractional part in eighths. The fractional eighths
//! are not encoded in order, hence the `FRAC_CODE` table. High-speed parts
//! can additionally select a 120 MHz clock through bit 17.

use std::fmt;

use thiserror::Error;

use super::constants::{C_CLK, H_CLK, H_CLK_DIVISOR_BIT, MAX_DIVISOR};

const FRAC_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Baud rate must be greater than zero")]
    ZeroBaudRate,
    #[error("Unsupported baud rate {requested} (closest achievable {actual})")]
    UnsupportedBaudRate { requested: u32, actual: u32 },
}

/// Chip family, detected from the device release number (`bcdDevice`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChipType {
    /// FT232B / FT245B
    #[default]
    Bm,
    /// FT2232C / FT2232D
    Ft2232C,
    /// FT232R / FT245R
    Ft232R,
    /// FT2232H
    Ft2232H,
    /// FT4232H
    Ft4232H,
    /// FT232H
    Ft232H,
    /// FT230X and other FT-X parts
    FtX,
}

impl ChipType {
    pub fn from_bcd_device(bcd: u16) -> Self {
        match bcd {
            0x0200 | 0x0400 => ChipType::Bm,
            0x0500 => ChipType::Ft2232C,
            0x0600 => ChipType::Ft232R,
            0x0700 => ChipType::Ft2232H,
            0x0800 => ChipType::Ft4232H,
            0x0900 => ChipType::Ft232H,
            0x1000 => ChipType::FtX,
            _ => ChipType::Bm,
        }
    }

    /// High-speed (H-series) part with the 120 MHz clock.
    pub fn is_h_type(self) -> bool {
        matches!(
            self,
            ChipType::Ft2232H | ChipType::Ft4232H | ChipType::Ft232H
        )
    }

    /// Part whose baud request carries the port number in `wIndex`.
    fn has_indexed_divisor(self) -> bool {
        self.is_h_type() || self == ChipType::Ft2232C
    }
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipType::Bm => "FT232B",
            ChipType::Ft2232C => "FT2232C",
            ChipType::Ft232R => "FT232R",
            ChipType::Ft2232H => "FT2232H",
            ChipType::Ft4232H => "FT4232H",
            ChipType::Ft232H => "FT232H",
            ChipType::FtX => "FT-X",
        };
        write!(f, "{name}")
    }
}

/// Encoded divisor split into the `wValue` / `wIndex` of the baud request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaudDivisor {
    pub value: u16,
    pub index: u16,
    /// Baud rate the chip will actually run at.
    pub actual: u32,
}

/// Returns `(actual_baud, encoded_divisor)` for the given clock.
fn to_clock_bits(baud: u32, clk: u32, clk_div: u32) -> (u32, u32) {
    let (clk, clk_div, baud) = (clk as u64, clk_div as u64, baud as u64);

    if baud >= clk / clk_div {
        return ((clk / clk_div) as u32, 0);
    }
    if baud >= clk / (clk_div + clk_div / 2) {
        return ((clk / (clk_div + clk_div / 2)) as u32, 1);
    }
    if baud >= clk / (2 * clk_div) {
        return ((clk / (2 * clk_div)) as u32, 2);
    }

    // Divisor in sixteenths, rounded to eighths.
    let divisor = clk * 16 / clk_div / baud;
    let mut best_divisor = if divisor & 1 == 1 {
        divisor / 2 + 1
    } else {
        divisor / 2
    };
    if best_divisor > 0x20000 {
        best_divisor = MAX_DIVISOR as u64;
    }

    let best_baud = clk * 16 / clk_div / best_divisor;
    let best_baud = if best_baud & 1 == 1 {
        best_baud / 2 + 1
    } else {
        best_baud / 2
    };

    let frac = FRAC_CODE[(best_divisor & 0x7) as usize];
    let encoded = (best_divisor >> 3) as u32 | (frac << 14);
    (best_baud as u32, encoded)
}

/// Converts a baud rate to the divisor encoding without a tolerance check.
pub fn convert_baud_rate(
    baud: u32,
    chip: ChipType,
    port_index: u16,
) -> Result<BaudDivisor, EncodeError> {
    if baud == 0 {
        return Err(EncodeError::ZeroBaudRate);
    }

    let use_h_clock = chip.is_h_type() && (baud as u64) * 10 > (H_CLK / 0x3FFF) as u64;
    let (actual, encoded) = if use_h_clock {
        let (actual, encoded) = to_clock_bits(baud, H_CLK, 10);
        (actual, encoded | H_CLK_DIVISOR_BIT)
    } else {
        to_clock_bits(baud, C_CLK, 16)
    };

    let value = (encoded & 0xFFFF) as u16;
    let index = if chip.has_indexed_divisor() {
        (((encoded >> 8) & 0xFF00) as u16) | port_index
    } else {
        (encoded >> 16) as u16
    };

    Ok(BaudDivisor {
        value,
        index,
        actual,
    })
}

/// Converts a baud rate, rejecting rates the chip cannot hit within 5%.
pub fn encode_baud_rate(
    baud: u32,
    chip: ChipType,
    port_index: u16,
) -> Result<BaudDivisor, EncodeError> {
    let divisor = convert_baud_rate(baud, chip, port_index)?;
    let (requested, actual) = (baud as u64, divisor.actual as u64);

    let too_far = if actual < requested {
        actual * 21 < requested * 20
    } else {
        requested * 21 < actual * 20
    };
    if actual * 2 < requested || too_far {
        return Err(EncodeError::UnsupportedBaudRate {
            requested: baud,
            actual: divisor.actual,
        });
    }

    Ok(divisor)
}
