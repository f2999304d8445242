//! nusb-based USB host implementation.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::transfer::{
    Buffer, Bulk, ControlOut, ControlType, Direction, In, Out, Recipient, TransferError,
};
use nusb::{DeviceInfo, Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{
    BulkInPipe, BulkOutPipe, EndpointDirection, EndpointInfo, EndpointKind, TransportError,
    UsbDeviceHandle, UsbHost, UsbInterface,
};
use crate::protocol::{ControlRequest, DEFAULT_TRANSFER_TIMEOUT, USB_CLASS_HUB};
use crate::topology::{DeviceIdentity, DeviceLocation, UsbDevice, UsbNode, build_topology};

/// Host stack backed by nusb.
#[derive(Debug, Clone, Default)]
pub struct NusbHost {
    detach_kernel_driver: bool,
}

impl NusbHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach a bound kernel driver (e.g. `ftdi_sio`) before claiming.
    pub fn with_kernel_driver_detach(mut self, detach: bool) -> Self {
        self.detach_kernel_driver = detach;
        self
    }

    fn identity(info: &DeviceInfo) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            product: info.product_string().map(str::to_string),
            device_version: info.device_version(),
            location: DeviceLocation {
                bus_id: info.bus_id().to_string(),
                port_chain: info.port_chain().to_vec(),
            },
        }
    }
}

impl UsbHost for NusbHost {
    type Device = NusbDevice;

    #[instrument(level = "debug", skip(self))]
    fn topology(&self) -> Result<UsbNode<NusbDevice>, TransportError> {
        let devices: Vec<_> = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .map(|info| {
                let identity = Self::identity(&info);
                let handle = NusbDevice {
                    info,
                    detach_kernel_driver: self.detach_kernel_driver,
                    timeout: DEFAULT_TRANSFER_TIMEOUT,
                };
                UsbDevice::new(identity, handle)
            })
            .collect();

        debug!(count = devices.len(), "Listed devices");
        Ok(build_topology(devices, |d| {
            d.handle.info.class() == USB_CLASS_HUB
        }))
    }
}

/// Enumerated device, not yet opened.
#[derive(Debug, Clone)]
pub struct NusbDevice {
    info: DeviceInfo,
    detach_kernel_driver: bool,
    timeout: Duration,
}

impl UsbDeviceHandle for NusbDevice {
    type Interface = NusbInterface;

    #[instrument(level = "info", skip(self), fields(
        vid = format!("{:04X}", self.info.vendor_id()),
        pid = format!("{:04X}", self.info.product_id()),
    ))]
    fn claim_interface(&self) -> Result<NusbInterface, TransportError> {
        let number = self
            .info
            .interfaces()
            .next()
            .map(|i| i.interface_number())
            .unwrap_or(0);

        let device = self
            .info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let claimed = if self.detach_kernel_driver {
            device.detach_and_claim_interface(number).wait()
        } else {
            device.claim_interface(number).wait()
        };
        let interface = claimed.map_err(|e| TransportError::ClaimInterfaceFailed {
            interface: number,
            message: e.to_string(),
        })?;

        let mut endpoints = Vec::new();
        match device.active_configuration() {
            Ok(config) => {
                for group in config.interfaces() {
                    if group.interface_number() != number {
                        continue;
                    }
                    let Some(alt) = group.alt_settings().next() else {
                        continue;
                    };
                    for ep in alt.endpoints() {
                        let kind = match ep.transfer_type() {
                            TransferType::Bulk => EndpointKind::Bulk,
                            TransferType::Interrupt => EndpointKind::Interrupt,
                            TransferType::Isochronous => EndpointKind::Isochronous,
                            TransferType::Control => EndpointKind::Control,
                        };
                        let direction = match ep.direction() {
                            Direction::In => EndpointDirection::In,
                            Direction::Out => EndpointDirection::Out,
                        };
                        endpoints.push(EndpointInfo {
                            address: ep.address(),
                            direction,
                            kind,
                            max_packet_size: ep.max_packet_size(),
                        });
                    }
                }
            }
            Err(e) => warn!(error = %e, "No active configuration descriptor"),
        }

        info!(interface = number, endpoints = endpoints.len(), "Interface claimed");

        Ok(NusbInterface {
            number,
            endpoints,
            timeout: self.timeout,
            interface: Mutex::new(Some(interface)),
        })
    }
}

/// Claimed nusb interface. Releasing drops the underlying handle.
pub struct NusbInterface {
    number: u8,
    endpoints: Vec<EndpointInfo>,
    timeout: Duration,
    interface: Mutex<Option<Interface>>,
}

impl NusbInterface {
    fn lock(&self) -> MutexGuard<'_, Option<Interface>> {
        self.interface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsbInterface for NusbInterface {
    type OutPipe = NusbOutPipe;
    type InPipe = NusbInPipe;

    fn interface_number(&self) -> u8 {
        self.number
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints.clone()
    }

    #[instrument(level = "trace", skip(self), fields(
        request = request.request,
        value = format!("0x{:04X}", request.value),
        index = format!("0x{:04X}", request.index),
    ))]
    fn control_out(&self, request: ControlRequest) -> Result<(), TransportError> {
        let guard = self.lock();
        let interface = guard.as_ref().ok_or(TransportError::NotClaimed)?;
        interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data: &[],
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))
    }

    fn open_out(&self, endpoint: &EndpointInfo) -> Result<NusbOutPipe, TransportError> {
        let guard = self.lock();
        let interface = guard.as_ref().ok_or(TransportError::NotClaimed)?;
        let endpoint = interface
            .endpoint::<Bulk, Out>(endpoint.address)
            .map_err(|e| TransportError::PipeUnavailable {
                address: endpoint.address,
                message: e.to_string(),
            })?;
        Ok(NusbOutPipe {
            endpoint,
            timeout: self.timeout,
        })
    }

    fn open_in(&self, endpoint: &EndpointInfo) -> Result<NusbInPipe, TransportError> {
        let guard = self.lock();
        let interface = guard.as_ref().ok_or(TransportError::NotClaimed)?;
        let endpoint = interface
            .endpoint::<Bulk, In>(endpoint.address)
            .map_err(|e| TransportError::PipeUnavailable {
                address: endpoint.address,
                message: e.to_string(),
            })?;
        Ok(NusbInPipe {
            endpoint,
            timeout: self.timeout,
        })
    }

    fn release(&self) -> Result<(), TransportError> {
        match self.lock().take() {
            Some(interface) => {
                drop(interface);
                debug!(interface = self.number, "Interface released");
                Ok(())
            }
            None => Err(TransportError::NotClaimed),
        }
    }
}

fn map_transfer_error(
    e: TransferError,
    timeout: Duration,
    other: fn(String) -> TransportError,
) -> TransportError {
    match e {
        // transfer_blocking cancels the transfer when the timeout expires
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        TransferError::Disconnected => TransportError::Disconnected,
        e => other(e.to_string()),
    }
}

pub struct NusbOutPipe {
    endpoint: Endpoint<Bulk, Out>,
    timeout: Duration,
}

/// Completion queue of detached submissions on an OUT endpoint.
trait DetachedQueue {
    fn pending(&self) -> usize;
    fn next_complete(&mut self, timeout: Duration) -> Option<Result<(), TransferError>>;
    fn cancel_all(&mut self);
}

impl DetachedQueue for Endpoint<Bulk, Out> {
    fn pending(&self) -> usize {
        Endpoint::pending(self)
    }

    fn next_complete(&mut self, timeout: Duration) -> Option<Result<(), TransferError>> {
        self.wait_next_complete(timeout).map(|c| c.status)
    }

    fn cancel_all(&mut self) {
        Endpoint::cancel_all(self)
    }
}

/// Collect detached completions. With `wait` unset only those already
/// finished are taken and nothing blocks. Returns how many were collected.
fn reap_detached(queue: &mut impl DetachedQueue, wait: Option<Duration>) -> usize {
    let mut reaped = 0;
    while queue.pending() > 0 {
        match queue.next_complete(wait.unwrap_or(Duration::ZERO)) {
            Some(status) => {
                reaped += 1;
                if let Err(e) = status {
                    debug!(error = %e, "Detached write failed");
                }
            }
            None if wait.is_some() => {
                warn!(pending = queue.pending(), "Detached writes did not complete");
                queue.cancel_all();
            }
            None => break,
        }
    }
    reaped
}

impl BulkOutPipe for NusbOutPipe {
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn submit(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        reap_detached(&mut self.endpoint, Some(self.timeout));

        let mut buffer = Buffer::new(data.len());
        buffer.extend_from_slice(data);
        let completion = self.endpoint.transfer_blocking(buffer, self.timeout);
        completion
            .status
            .map_err(|e| map_transfer_error(e, self.timeout, TransportError::WriteFailed))?;
        Ok(completion.actual_len)
    }

    fn submit_detached(&mut self, data: &[u8]) -> Result<(), TransportError> {
        reap_detached(&mut self.endpoint, None);
        let mut buffer = Buffer::new(data.len());
        buffer.extend_from_slice(data);
        self.endpoint.submit(buffer);
        Ok(())
    }
}

pub struct NusbInPipe {
    endpoint: Endpoint<Bulk, In>,
    timeout: Duration,
}

impl BulkInPipe for NusbInPipe {
    #[instrument(level = "trace", skip(self))]
    fn submit(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let completion = self.endpoint.transfer_blocking(Buffer::new(len), self.timeout);
        completion
            .status
            .map_err(|e| map_transfer_error(e, self.timeout, TransportError::ReadFailed))?;

        let mut data = completion.buffer.into_vec();
        data.truncate(completion.actual_len);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Completions that have already arrived, plus submissions still in flight.
    struct Queue {
        done: VecDeque<Result<(), TransferError>>,
        in_flight: usize,
        waited: Vec<Duration>,
        cancelled: bool,
    }

    impl Queue {
        fn new(done: Vec<Result<(), TransferError>>, in_flight: usize) -> Self {
            Self {
                done: done.into(),
                in_flight,
                waited: Vec::new(),
                cancelled: false,
            }
        }
    }

    impl DetachedQueue for Queue {
        fn pending(&self) -> usize {
            self.done.len() + self.in_flight
        }

        fn next_complete(&mut self, timeout: Duration) -> Option<Result<(), TransferError>> {
            self.waited.push(timeout);
            self.done.pop_front()
        }

        fn cancel_all(&mut self) {
            self.cancelled = true;
            self.done.extend((0..self.in_flight).map(|_| Err(TransferError::Cancelled)));
            self.in_flight = 0;
        }
    }

    #[test]
    fn test_detached_submit_collects_finished_without_blocking() {
        let mut queue = Queue::new(vec![Ok(()), Err(TransferError::Stall), Ok(())], 2);

        assert_eq!(reap_detached(&mut queue, None), 3);
        assert_eq!(queue.pending(), 2);
        assert!(!queue.cancelled);
        assert!(queue.waited.iter().all(Duration::is_zero));
    }

    #[test]
    fn test_blocking_submit_drains_everything() {
        let timeout = Duration::from_millis(5);
        let mut queue = Queue::new(vec![Ok(())], 2);

        assert_eq!(reap_detached(&mut queue, Some(timeout)), 3);
        assert_eq!(queue.pending(), 0);
        assert!(queue.cancelled);
        assert!(queue.waited.iter().all(|w| *w == timeout));
    }

    #[test]
    fn test_transfer_error_mapping() {
        let timeout = Duration::from_millis(1500);
        assert_eq!(
            map_transfer_error(TransferError::Cancelled, timeout, TransportError::WriteFailed),
            TransportError::Timeout { timeout_ms: 1500 }
        );
        assert_eq!(
            map_transfer_error(TransferError::Disconnected, timeout, TransportError::ReadFailed),
            TransportError::Disconnected
        );
        assert!(matches!(
            map_transfer_error(TransferError::Stall, timeout, TransportError::ReadFailed),
            TransportError::ReadFailed(_)
        ));
    }
}
