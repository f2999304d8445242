//! Mock USB host for testing.
//!
//! A [`MockDevice`] records every control transfer and bulk write and plays
//! back queued bulk IN frames. Clones share state, so a test keeps one clone
//! for inspection while the session under test owns another.
//!
//! As with a real host stack, an open pipe keeps the interface claimed until
//! the pipe itself is dropped, even after the interface has been released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{
    BulkInPipe, BulkOutPipe, EndpointInfo, TransportError, UsbDeviceHandle, UsbHost, UsbInterface,
};
use crate::protocol::{
    ControlRequest, FT232_PRODUCT_ID, FTDI_VENDOR_ID, FULL_SPEED_PACKET_SIZE, STATUS_HEADER_LEN,
};
use crate::topology::{DeviceIdentity, DeviceLocation, UsbDevice, UsbNode};

/// Status header the chip sends when it has no data: CTS|DSR, THRE|TEMT.
pub const IDLE_STATUS: [u8; STATUS_HEADER_LEN] = [0x31, 0x60];

/// Mock host whose topology is built from registered devices.
#[derive(Default)]
pub struct MockHost {
    devices: Mutex<Vec<MockDevice>>,
    root: Mutex<Option<UsbNode<MockDevice>>>,
    enumeration_error: Mutex<Option<TransportError>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host with `devices` attached directly below the virtual root.
    pub fn with_devices(devices: impl IntoIterator<Item = MockDevice>) -> Self {
        let host = Self::new();
        host.devices.lock().unwrap().extend(devices);
        host
    }

    /// Host that reports a fixed tree.
    pub fn with_topology(root: UsbNode<MockDevice>) -> Self {
        let host = Self::new();
        *host.root.lock().unwrap() = Some(root);
        host
    }

    /// Make the next enumerations fail with `error`.
    pub fn fail_enumeration(&self, error: TransportError) {
        *self.enumeration_error.lock().unwrap() = Some(error);
    }
}

impl UsbHost for MockHost {
    type Device = MockDevice;

    fn topology(&self) -> Result<UsbNode<MockDevice>, TransportError> {
        if let Some(err) = self.enumeration_error.lock().unwrap().clone() {
            return Err(err);
        }
        if let Some(root) = self.root.lock().unwrap().clone() {
            return Ok(root);
        }
        let children = self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| UsbNode::Device(d.as_usb_device()))
            .collect();
        Ok(UsbNode::virtual_root(children))
    }
}

struct MockDeviceState {
    identity: DeviceIdentity,
    interface_number: AtomicU8,
    endpoints: Mutex<Vec<EndpointInfo>>,
    claimed: AtomicBool,
    /// Pipes not yet dropped.
    live_pipes: AtomicUsize,
    connected: AtomicBool,
    /// Successful control transfers, in order.
    controls: Mutex<Vec<ControlRequest>>,
    control_attempts: AtomicUsize,
    /// Zero-based control attempt that fails, and how.
    fail_control_at: Mutex<Option<(usize, TransportError)>>,
    writes: Mutex<Vec<Vec<u8>>>,
    detached_writes: Mutex<Vec<Vec<u8>>>,
    /// Maximum bytes accepted per write.
    write_limit: Mutex<Option<usize>>,
    frames: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    read_lengths: Mutex<Vec<usize>>,
    releases: AtomicUsize,
    release_attempts: AtomicUsize,
    fail_release: Mutex<Option<TransportError>>,
    out_opens: AtomicUsize,
    in_opens: AtomicUsize,
    open_delay: Mutex<Duration>,
}

/// Simulated FTDI device.
#[derive(Clone)]
pub struct MockDevice(Arc<MockDeviceState>);

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MockDevice").field(&self.0.identity).finish()
    }
}

impl MockDevice {
    /// An FT232R on bus 1, port 1, with bulk endpoints 0x81 and 0x02.
    pub fn new() -> Self {
        let identity = DeviceIdentity {
            vendor_id: FTDI_VENDOR_ID,
            product_id: FT232_PRODUCT_ID,
            product: Some("FT232R USB UART".to_string()),
            device_version: 0x0600,
            location: DeviceLocation {
                bus_id: "1".to_string(),
                port_chain: vec![1],
            },
        };
        Self::with_identity(identity)
    }

    pub fn with_identity(identity: DeviceIdentity) -> Self {
        Self(Arc::new(MockDeviceState {
            identity,
            interface_number: AtomicU8::new(0),
            endpoints: Mutex::new(vec![
                EndpointInfo::bulk(0x81, FULL_SPEED_PACKET_SIZE),
                EndpointInfo::bulk(0x02, FULL_SPEED_PACKET_SIZE),
            ]),
            claimed: AtomicBool::new(false),
            live_pipes: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            controls: Mutex::new(Vec::new()),
            control_attempts: AtomicUsize::new(0),
            fail_control_at: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            detached_writes: Mutex::new(Vec::new()),
            write_limit: Mutex::new(None),
            frames: Mutex::new(VecDeque::new()),
            read_lengths: Mutex::new(Vec::new()),
            releases: AtomicUsize::new(0),
            release_attempts: AtomicUsize::new(0),
            fail_release: Mutex::new(None),
            out_opens: AtomicUsize::new(0),
            in_opens: AtomicUsize::new(0),
            open_delay: Mutex::new(Duration::ZERO),
        }))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.0.identity
    }

    pub fn as_usb_device(&self) -> UsbDevice<MockDevice> {
        UsbDevice::new(self.0.identity.clone(), self.clone())
    }

    pub fn set_interface_number(&self, number: u8) {
        self.0.interface_number.store(number, Ordering::SeqCst);
    }

    pub fn set_endpoints(&self, endpoints: Vec<EndpointInfo>) {
        *self.0.endpoints.lock().unwrap() = endpoints;
    }

    /// Queue a raw bulk IN transfer, status header included.
    pub fn queue_frame(&self, raw: &[u8]) {
        self.0.frames.lock().unwrap().push_back(Ok(raw.to_vec()));
    }

    /// Queue a payload behind the idle status header.
    pub fn queue_payload(&self, payload: &[u8]) {
        let mut raw = IDLE_STATUS.to_vec();
        raw.extend_from_slice(payload);
        self.queue_frame(&raw);
    }

    pub fn queue_read_error(&self, error: TransportError) {
        self.0.frames.lock().unwrap().push_back(Err(error));
    }

    /// Fail the `attempt`-th control transfer (zero-based) with `error`.
    pub fn fail_control_at(&self, attempt: usize, error: TransportError) {
        *self.0.fail_control_at.lock().unwrap() = Some((attempt, error));
    }

    pub fn set_write_limit(&self, limit: usize) {
        *self.0.write_limit.lock().unwrap() = Some(limit);
    }

    /// Delay applied to every pipe open.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.0.open_delay.lock().unwrap() = delay;
    }

    /// Make every interface release fail with `error`. The claim stays held.
    pub fn fail_release(&self, error: TransportError) {
        *self.0.fail_release.lock().unwrap() = Some(error);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.0.connected.store(false, Ordering::SeqCst);
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.0.connected.store(true, Ordering::SeqCst);
    }

    /// Held by an unreleased interface or by a pipe still alive.
    pub fn is_claimed(&self) -> bool {
        self.0.claimed.load(Ordering::SeqCst) || self.live_pipe_count() > 0
    }

    pub fn live_pipe_count(&self) -> usize {
        self.0.live_pipes.load(Ordering::SeqCst)
    }

    pub fn controls(&self) -> Vec<ControlRequest> {
        self.0.controls.lock().unwrap().clone()
    }

    pub fn control_attempts(&self) -> usize {
        self.0.control_attempts.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.0.writes.lock().unwrap().clone()
    }

    pub fn detached_writes(&self) -> Vec<Vec<u8>> {
        self.0.detached_writes.lock().unwrap().clone()
    }

    /// Buffer lengths requested by bulk IN transfers.
    pub fn read_lengths(&self) -> Vec<usize> {
        self.0.read_lengths.lock().unwrap().clone()
    }

    /// Successful releases.
    pub fn release_count(&self) -> usize {
        self.0.releases.load(Ordering::SeqCst)
    }

    pub fn release_attempts(&self) -> usize {
        self.0.release_attempts.load(Ordering::SeqCst)
    }

    pub fn out_open_count(&self) -> usize {
        self.0.out_opens.load(Ordering::SeqCst)
    }

    pub fn in_open_count(&self) -> usize {
        self.0.in_opens.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.0.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn pipe_opened(&self, counter: &AtomicUsize) {
        let delay = *self.0.open_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        counter.fetch_add(1, Ordering::SeqCst);
        self.0.live_pipes.fetch_add(1, Ordering::SeqCst);
    }

    fn pipe_dropped(&self) {
        self.0.live_pipes.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbDeviceHandle for MockDevice {
    type Interface = MockInterface;

    fn claim_interface(&self) -> Result<MockInterface, TransportError> {
        self.check_connected()?;
        let interface = self.0.interface_number.load(Ordering::SeqCst);
        if self.live_pipe_count() > 0 || self.0.claimed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Busy { interface });
        }
        Ok(MockInterface {
            device: self.clone(),
            number: interface,
            released: AtomicBool::new(false),
        })
    }
}

/// Claimed mock interface.
pub struct MockInterface {
    device: MockDevice,
    number: u8,
    released: AtomicBool,
}

impl MockInterface {
    fn check_claimed(&self) -> Result<(), TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::NotClaimed);
        }
        self.device.check_connected()
    }

    fn check_endpoint(&self, endpoint: &EndpointInfo) -> Result<(), TransportError> {
        let known = self.device.0.endpoints.lock().unwrap().contains(endpoint);
        if known {
            Ok(())
        } else {
            Err(TransportError::PipeUnavailable {
                address: endpoint.address,
                message: "no such endpoint".to_string(),
            })
        }
    }
}

impl UsbInterface for MockInterface {
    type OutPipe = MockOutPipe;
    type InPipe = MockInPipe;

    fn interface_number(&self) -> u8 {
        self.number
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.device.0.endpoints.lock().unwrap().clone()
    }

    fn control_out(&self, request: ControlRequest) -> Result<(), TransportError> {
        self.check_claimed()?;
        let attempt = self.device.0.control_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some((at, err)) = self.device.0.fail_control_at.lock().unwrap().as_ref()
            && *at == attempt
        {
            return Err(err.clone());
        }
        self.device.0.controls.lock().unwrap().push(request);
        Ok(())
    }

    fn open_out(&self, endpoint: &EndpointInfo) -> Result<MockOutPipe, TransportError> {
        self.check_claimed()?;
        self.check_endpoint(endpoint)?;
        self.device.pipe_opened(&self.device.0.out_opens);
        Ok(MockOutPipe {
            device: self.device.clone(),
        })
    }

    fn open_in(&self, endpoint: &EndpointInfo) -> Result<MockInPipe, TransportError> {
        self.check_claimed()?;
        self.check_endpoint(endpoint)?;
        self.device.pipe_opened(&self.device.0.in_opens);
        Ok(MockInPipe {
            device: self.device.clone(),
        })
    }

    fn release(&self) -> Result<(), TransportError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(TransportError::NotClaimed);
        }
        self.device.0.release_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.device.0.fail_release.lock().unwrap().clone() {
            return Err(err);
        }
        self.device.0.claimed.store(false, Ordering::SeqCst);
        self.device.0.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockOutPipe {
    device: MockDevice,
}

impl Drop for MockOutPipe {
    fn drop(&mut self) {
        self.device.pipe_dropped();
    }
}

impl BulkOutPipe for MockOutPipe {
    fn submit(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.device.check_connected()?;
        let accepted = match *self.device.0.write_limit.lock().unwrap() {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };
        self.device
            .0
            .writes
            .lock()
            .unwrap()
            .push(data[..accepted].to_vec());
        Ok(accepted)
    }

    fn submit_detached(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.device.check_connected()?;
        self.device
            .0
            .detached_writes
            .lock()
            .unwrap()
            .push(data.to_vec());
        Ok(())
    }
}

pub struct MockInPipe {
    device: MockDevice,
}

impl Drop for MockInPipe {
    fn drop(&mut self) {
        self.device.pipe_dropped();
    }
}

impl BulkInPipe for MockInPipe {
    fn submit(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        self.device.check_connected()?;
        self.device.0.read_lengths.lock().unwrap().push(len);
        let next = self.device.0.frames.lock().unwrap().pop_front();
        let mut data = match next {
            Some(frame) => frame?,
            None => IDLE_STATUS.to_vec(),
        };
        data.truncate(len);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_claim_is_exclusive() {
        let device = MockDevice::new();
        let first = device.claim_interface().unwrap();
        assert!(matches!(
            device.claim_interface(),
            Err(TransportError::Busy { interface: 0 })
        ));

        first.release().unwrap();
        assert_eq!(first.release(), Err(TransportError::NotClaimed));
        assert!(device.claim_interface().is_ok());
    }

    #[test]
    fn test_mock_open_pipe_keeps_claim() {
        let device = MockDevice::new();
        let interface = device.claim_interface().unwrap();
        let endpoint = interface.endpoints()[1];
        let pipe = interface.open_out(&endpoint).unwrap();

        interface.release().unwrap();
        assert!(device.is_claimed());
        assert!(matches!(
            device.claim_interface(),
            Err(TransportError::Busy { .. })
        ));

        drop(pipe);
        assert!(!device.is_claimed());
        assert_eq!(device.live_pipe_count(), 0);
    }

    #[test]
    fn test_mock_release_failure() {
        let device = MockDevice::new();
        let interface = device.claim_interface().unwrap();
        device.fail_release(TransportError::Disconnected);

        assert_eq!(interface.release(), Err(TransportError::Disconnected));
        assert_eq!(interface.release(), Err(TransportError::NotClaimed));
        assert_eq!(device.release_attempts(), 1);
        assert_eq!(device.release_count(), 0);
        assert!(device.is_claimed());
    }

    #[test]
    fn test_mock_frame_queue() {
        let device = MockDevice::new();
        let interface = device.claim_interface().unwrap();
        let endpoint = interface.endpoints()[0];
        let mut pipe = interface.open_in(&endpoint).unwrap();

        device.queue_payload(b"ok");
        assert_eq!(pipe.submit(64).unwrap(), vec![0x31, 0x60, b'o', b'k']);
        // Queue is empty now
        assert_eq!(pipe.submit(64).unwrap(), IDLE_STATUS.to_vec());
        assert_eq!(device.read_lengths(), vec![64, 64]);
    }

    #[test]
    fn test_mock_write_capture() {
        let device = MockDevice::new();
        let interface = device.claim_interface().unwrap();
        let endpoint = interface.endpoints()[1];
        let mut pipe = interface.open_out(&endpoint).unwrap();

        assert_eq!(pipe.submit(b"Hello").unwrap(), 5);
        device.set_write_limit(2);
        assert_eq!(pipe.submit(b"World").unwrap(), 2);
        assert_eq!(device.writes(), vec![b"Hello".to_vec(), b"Wo".to_vec()]);
    }

    #[test]
    fn test_mock_control_failure() {
        let device = MockDevice::new();
        let interface = device.claim_interface().unwrap();
        device.fail_control_at(1, TransportError::ControlFailed("stall".into()));

        let req = ControlRequest::new(0, 0, 1);
        assert!(interface.control_out(req).is_ok());
        assert!(interface.control_out(req).is_err());
        assert!(interface.control_out(req).is_ok());
        assert_eq!(device.controls().len(), 2);
        assert_eq!(device.control_attempts(), 3);
    }

    #[test]
    fn test_mock_disconnect() {
        let device = MockDevice::new();
        let interface = device.claim_interface().unwrap();
        device.disconnect();
        assert_eq!(
            interface.control_out(ControlRequest::new(0, 0, 1)),
            Err(TransportError::Disconnected)
        );
        device.reconnect();
        assert!(interface.control_out(ControlRequest::new(0, 0, 1)).is_ok());
    }
}
