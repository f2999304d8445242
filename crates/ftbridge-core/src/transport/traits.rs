//! USB host-stack abstraction.
//!
//! Defines the traits a backend implements so the bridge can run over
//! different host stacks (nusb, mock, etc.). The split mirrors the resource
//! lifetimes: a [`UsbHost`] enumerates, a [`UsbDeviceHandle`] claims, a
//! [`UsbInterface`] issues control transfers and opens pipes, and the pipes
//! move bulk data.

use std::fmt;

use thiserror::Error;

use crate::protocol::ControlRequest;
use crate::topology::UsbNode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("USB enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Interface {interface} is already claimed")]
    Busy { interface: u8 },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Interface is not claimed")]
    NotClaimed,

    #[error("Endpoint 0x{address:02X} unavailable: {message}")]
    PipeUnavailable { address: u8, message: String },

    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Transfer direction of an endpoint, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

impl fmt::Display for EndpointDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointDirection::In => write!(f, "IN"),
            EndpointDirection::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Bulk,
    Interrupt,
    Isochronous,
    Control,
}

/// Endpoint descriptor summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: EndpointDirection,
    pub kind: EndpointKind,
    pub max_packet_size: usize,
}

impl EndpointInfo {
    pub fn bulk(address: u8, max_packet_size: usize) -> Self {
        let direction = if address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        };
        Self {
            address,
            direction,
            kind: EndpointKind::Bulk,
            max_packet_size,
        }
    }
}

/// Entry point of a host stack: hands out the current device tree.
pub trait UsbHost: Send + Sync {
    type Device: UsbDeviceHandle;

    /// Enumerate attached devices. Rooted at the virtual root hub.
    fn topology(&self) -> Result<UsbNode<Self::Device>, TransportError>;
}

/// An enumerated but not yet opened device.
pub trait UsbDeviceHandle: Clone + Send + Sync {
    type Interface: UsbInterface;

    /// Open the device and claim its first interface.
    ///
    /// Must fail rather than take over an interface claimed elsewhere.
    fn claim_interface(&self) -> Result<Self::Interface, TransportError>;
}

/// A claimed interface.
pub trait UsbInterface: Send + Sync + 'static {
    type OutPipe: BulkOutPipe;
    type InPipe: BulkInPipe;

    fn interface_number(&self) -> u8;

    /// Endpoints of the active alternate setting, in descriptor order.
    fn endpoints(&self) -> Vec<EndpointInfo>;

    /// Vendor OUT control transfer without a data stage.
    fn control_out(&self, request: ControlRequest) -> Result<(), TransportError>;

    fn open_out(&self, endpoint: &EndpointInfo) -> Result<Self::OutPipe, TransportError>;

    fn open_in(&self, endpoint: &EndpointInfo) -> Result<Self::InPipe, TransportError>;

    /// Give the claim back. A second release reports `NotClaimed`.
    fn release(&self) -> Result<(), TransportError>;
}

/// Host-to-device bulk pipe.
pub trait BulkOutPipe: Send {
    /// Submit and block until completion. Returns the bytes accepted.
    fn submit(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Submit and return immediately; the outcome is not reported.
    fn submit_detached(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

/// Device-to-host bulk pipe.
pub trait BulkInPipe: Send {
    /// Perform one transfer into a freshly allocated buffer of `len` bytes.
    /// The returned buffer is truncated to the transferred length.
    fn submit(&mut self, len: usize) -> Result<Vec<u8>, TransportError>;
}
