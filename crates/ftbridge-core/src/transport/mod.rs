//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockDevice, MockHost};
pub use nusb::{NusbDevice, NusbHost};
pub use traits::{
    BulkInPipe, BulkOutPipe, EndpointDirection, EndpointInfo, EndpointKind, TransportError,
    UsbDeviceHandle, UsbHost, UsbInterface,
};
