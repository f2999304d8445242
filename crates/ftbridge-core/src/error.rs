//! Bridge error kinds.

use std::fmt;

use thiserror::Error;

use crate::locator::ProductFilter;
use crate::protocol::EncodeError;
use crate::transport::{EndpointDirection, TransportError};

/// Control transfer being sent when configuration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    BaudRate,
    LineFormat,
    FlowControl,
    ModemLines,
    Reset,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigStep::BaudRate => write!(f, "baud rate"),
            ConfigStep::LineFormat => write!(f, "line format"),
            ConfigStep::FlowControl => write!(f, "flow control"),
            ConfigStep::ModemLines => write!(f, "modem lines"),
            ConfigStep::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Device not found: VID={vendor_id:04X} products={filter}")]
    DeviceNotFound {
        vendor_id: u16,
        filter: ProductFilter,
    },

    #[error("Device enumeration failed")]
    Enumeration(#[source] TransportError),

    #[error("Failed to claim interface")]
    ClaimFailed(#[source] TransportError),

    #[error("Interface has more than one bulk {direction} endpoint (0x{first:02X}, 0x{second:02X})")]
    EndpointConflict {
        direction: EndpointDirection,
        first: u8,
        second: u8,
    },

    #[error("Interface has no bulk {direction} endpoint")]
    EndpointMissing { direction: EndpointDirection },

    #[error(transparent)]
    UnsupportedBaudRate(#[from] EncodeError),

    #[error("Configuration failed while setting {step}; earlier settings remain applied")]
    ConfigurationFailed {
        step: ConfigStep,
        #[source]
        source: TransportError,
    },

    #[error("Bulk {direction} transfer failed")]
    TransferFailed {
        direction: EndpointDirection,
        #[source]
        source: TransportError,
    },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the underlying failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BridgeError::TransferFailed {
                source: TransportError::Timeout { .. },
                ..
            } | BridgeError::ConfigurationFailed {
                source: TransportError::Timeout { .. },
                ..
            }
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
