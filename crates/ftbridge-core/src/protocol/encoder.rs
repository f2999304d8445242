//! Translation of logical serial settings into SIO control requests.
//!
//! Every function here is pure. The session sends the resulting requests as
//! vendor-type, device-recipient OUT control transfers with no data stage.

use super::baud::{ChipType, EncodeError, encode_baud_rate};
use super::constants::*;
use super::line::{BreakType, DataBits, FlowControl, ModemLines, Parity, StopBits};

/// One vendor OUT control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    pub const fn new(request: u8, value: u16, index: u16) -> Self {
        Self {
            request,
            value,
            index,
        }
    }
}

/// Port selector used in `wIndex`: interface A is 1, B is 2, ...
pub fn port_index(interface_number: u8) -> u16 {
    interface_number as u16 + 1
}

pub fn baud_rate_request(
    baud: u32,
    chip: ChipType,
    port: u16,
) -> Result<ControlRequest, EncodeError> {
    let divisor = encode_baud_rate(baud, chip, port)?;
    Ok(ControlRequest::new(
        SIO_SET_BAUDRATE_REQUEST,
        divisor.value,
        divisor.index,
    ))
}

/// Packs data bits, parity, stop bits and break into one `wValue`.
pub fn line_format_value(
    data_bits: DataBits,
    stop_bits: StopBits,
    parity: Parity,
    break_type: BreakType,
) -> u16 {
    data_bits.wire_value()
        | (parity.wire_value() << 8)
        | (stop_bits.wire_value() << 11)
        | (break_type.wire_value() << 14)
}

pub fn line_format_request(
    data_bits: DataBits,
    stop_bits: StopBits,
    parity: Parity,
    port: u16,
) -> ControlRequest {
    let value = line_format_value(data_bits, stop_bits, parity, BreakType::Off);
    ControlRequest::new(SIO_SET_DATA_REQUEST, value, port)
}

pub fn flow_control_request(flow: FlowControl, port: u16) -> ControlRequest {
    match flow {
        FlowControl::None => {
            ControlRequest::new(SIO_SET_FLOW_CTRL_REQUEST, 0, SIO_DISABLE_FLOW_CTRL | port)
        }
        FlowControl::RtsCts => {
            ControlRequest::new(SIO_SET_FLOW_CTRL_REQUEST, 0, SIO_RTS_CTS_HS | port)
        }
        FlowControl::DtrDsr => {
            ControlRequest::new(SIO_SET_FLOW_CTRL_REQUEST, 0, SIO_DTR_DSR_HS | port)
        }
        FlowControl::XonXoff => {
            let xonxoff = (XON_CHAR as u16) | ((XOFF_CHAR as u16) << 8);
            ControlRequest::new(SIO_SET_FLOW_CTRL_REQUEST, xonxoff, SIO_XON_XOFF_HS | port)
        }
    }
}

/// Sets DTR and RTS in a single transfer.
pub fn modem_lines_request(lines: ModemLines, port: u16) -> ControlRequest {
    let dtr = if lines.dtr {
        SIO_SET_DTR_HIGH
    } else {
        SIO_SET_DTR_LOW
    };
    let rts = if lines.rts {
        SIO_SET_RTS_HIGH
    } else {
        SIO_SET_RTS_LOW
    };
    ControlRequest::new(SIO_SET_MODEM_CTRL_REQUEST, dtr | rts, port)
}

pub fn reset_request(port: u16) -> ControlRequest {
    ControlRequest::new(SIO_RESET_REQUEST, SIO_RESET_SIO, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format_8n1() {
        let req = line_format_request(DataBits::Eight, StopBits::One, Parity::None, 1);
        assert_eq!(req, ControlRequest::new(SIO_SET_DATA_REQUEST, 0x0008, 1));
    }

    #[test]
    fn test_line_format_packing() {
        let v = line_format_value(DataBits::Seven, StopBits::Two, Parity::Even, BreakType::Off);
        assert_eq!(v, 7 | (2 << 8) | (2 << 11));

        let v = line_format_value(DataBits::Five, StopBits::OnePointFive, Parity::Space, BreakType::On);
        assert_eq!(v, 5 | (4 << 8) | (1 << 11) | (1 << 14));
    }

    #[test]
    fn test_flow_control_selectors() {
        assert_eq!(flow_control_request(FlowControl::None, 1).index, 0x0001);
        assert_eq!(flow_control_request(FlowControl::RtsCts, 1).index, 0x0101);
        assert_eq!(flow_control_request(FlowControl::DtrDsr, 2).index, 0x0202);

        let xon = flow_control_request(FlowControl::XonXoff, 1);
        assert_eq!(xon.index, 0x0401);
        assert_eq!(xon.value, 0x1311);
    }

    #[test]
    fn test_modem_lines() {
        let req = modem_lines_request(ModemLines { dtr: false, rts: true }, 1);
        assert_eq!(req.request, SIO_SET_MODEM_CTRL_REQUEST);
        assert_eq!(req.value, 0x0302);

        let req = modem_lines_request(ModemLines { dtr: true, rts: false }, 1);
        assert_eq!(req.value, 0x0301);
    }

    #[test]
    fn test_baud_request() {
        let req = baud_rate_request(9600, ChipType::Ft232R, 1).unwrap();
        assert_eq!(req, ControlRequest::new(SIO_SET_BAUDRATE_REQUEST, 0x4138, 0));
        assert!(baud_rate_request(0, ChipType::Ft232R, 1).is_err());
    }

    #[test]
    fn test_port_index() {
        assert_eq!(port_index(0), 1);
        assert_eq!(port_index(3), 4);
    }
}
