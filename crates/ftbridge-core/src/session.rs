//! Port session - one claimed UART interface and its bulk pipes.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, instrument};

use crate::context::BridgeContext;
use crate::error::{BridgeError, ConfigStep, Result};
use crate::events::{BridgeEvent, BridgeObserver, SessionState, TracingObserver};
use crate::guard::ClaimGuard;
use crate::protocol::encoder::{self, port_index};
use crate::protocol::{
    ChipType, ControlRequest, FULL_SPEED_PACKET_SIZE, Frame, HIGH_SPEED_PACKET_SIZE, ModemLines,
    SerialConfig,
};
use crate::protocol::{DataBits, FlowControl, Parity, StopBits};
use crate::topology::{DeviceIdentity, UsbDevice};
use crate::transport::{
    BulkInPipe, BulkOutPipe, EndpointDirection, EndpointInfo, EndpointKind, TransportError,
    UsbDeviceHandle, UsbHost, UsbInterface,
};

/// Picks the read (IN) and write (OUT) bulk endpoints of an interface.
///
/// Non-bulk endpoints are ignored. Exactly one bulk endpoint per direction
/// is required.
pub fn classify_endpoints(endpoints: &[EndpointInfo]) -> Result<(EndpointInfo, EndpointInfo)> {
    let mut read: Option<EndpointInfo> = None;
    let mut write: Option<EndpointInfo> = None;

    for ep in endpoints.iter().filter(|e| e.kind == EndpointKind::Bulk) {
        let slot = match ep.direction {
            EndpointDirection::In => &mut read,
            EndpointDirection::Out => &mut write,
        };
        if let Some(first) = slot.as_ref() {
            return Err(BridgeError::EndpointConflict {
                direction: ep.direction,
                first: first.address,
                second: ep.address,
            });
        }
        *slot = Some(*ep);
    }

    let read = read.ok_or(BridgeError::EndpointMissing {
        direction: EndpointDirection::In,
    })?;
    let write = write.ok_or(BridgeError::EndpointMissing {
        direction: EndpointDirection::Out,
    })?;
    Ok((read, write))
}

/// An open serial port on a claimed interface.
///
/// Pipes are opened on first use. Dropping the session closes it. A session
/// borrows the [`BridgeContext`] it was opened through, so the context
/// cannot be dropped while the session is alive:
///
/// ```compile_fail
/// use ftbridge_core::{BridgeContext, MockDevice, MockHost, PortSession};
///
/// let device = MockDevice::new();
/// let ctx = BridgeContext::new(MockHost::with_devices([device.clone()]));
/// let session = PortSession::open(&ctx, &device.as_usb_device()).unwrap();
/// drop(ctx);
/// session.write(b"x").unwrap();
/// ```
pub struct PortSession<'ctx, I: UsbInterface, O: BridgeObserver = TracingObserver> {
    write_endpoint: EndpointInfo,
    read_endpoint: EndpointInfo,
    state: Mutex<SessionState>,
    identity: DeviceIdentity,
    chip: ChipType,
    port: u16,
    observer: Arc<O>,
    guard: ClaimGuard<I>,
    context: PhantomData<&'ctx ()>,
}

impl<'ctx, I: UsbInterface> PortSession<'ctx, I, TracingObserver> {
    /// Claim the device's first interface and discover its bulk pipes.
    pub fn open<H>(ctx: &'ctx BridgeContext<H>, device: &UsbDevice<H::Device>) -> Result<Self>
    where
        H: UsbHost,
        H::Device: UsbDeviceHandle<Interface = I>,
    {
        Self::open_with_observer(ctx, device, Arc::new(TracingObserver))
    }

    /// Open, apply `config`, then drive the modem lines.
    ///
    /// On failure the claim is released before the error is returned.
    pub fn bring_up<H>(
        ctx: &'ctx BridgeContext<H>,
        device: &UsbDevice<H::Device>,
        config: &SerialConfig,
        lines: ModemLines,
    ) -> Result<Self>
    where
        H: UsbHost,
        H::Device: UsbDeviceHandle<Interface = I>,
    {
        let session = Self::open(ctx, device)?;
        session.configure(config)?;
        session.set_modem_lines(lines)?;
        Ok(session)
    }
}

impl<'ctx, I: UsbInterface, O: BridgeObserver> PortSession<'ctx, I, O> {
    #[instrument(level = "info", skip_all, fields(
        vid = %format!("{:04X}", device.identity.vendor_id),
        pid = %format!("{:04X}", device.identity.product_id),
    ))]
    pub fn open_with_observer<H>(
        ctx: &'ctx BridgeContext<H>,
        device: &UsbDevice<H::Device>,
        observer: Arc<O>,
    ) -> Result<Self>
    where
        H: UsbHost,
        H::Device: UsbDeviceHandle<Interface = I>,
    {
        let interface = device
            .handle
            .claim_interface()
            .map_err(BridgeError::ClaimFailed)?;
        let guard = ClaimGuard::with_grace(
            interface,
            device.identity.to_string(),
            ctx.release_grace(),
        );

        let (read_endpoint, write_endpoint) = classify_endpoints(&guard.interface().endpoints())?;
        ctx.registry().register(guard.hook());

        let number = guard.interface().interface_number();
        let chip = ChipType::from_bcd_device(device.identity.device_version);
        debug!(
            interface = number,
            chip = %chip,
            in_ep = %format!("0x{:02X}", read_endpoint.address),
            out_ep = %format!("0x{:02X}", write_endpoint.address),
            "Endpoints classified"
        );

        let session = Self {
            write_endpoint,
            read_endpoint,
            state: Mutex::new(SessionState::Unclaimed),
            identity: device.identity.clone(),
            chip,
            port: port_index(number),
            observer,
            guard,
            context: PhantomData,
        };
        session.observer.on_event(&BridgeEvent::SessionOpened {
            vid: session.identity.vendor_id,
            pid: session.identity.product_id,
            interface: number,
        });
        session.transition(SessionState::Claimed);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn chip_type(&self) -> ChipType {
        self.chip
    }

    pub fn interface_number(&self) -> u8 {
        self.guard.interface().interface_number()
    }

    /// Size of each bulk read: the IN endpoint's max packet size, or the
    /// chip's default when the descriptor reports none.
    pub fn max_packet_size(&self) -> usize {
        match self.read_endpoint.max_packet_size {
            0 if self.chip.is_h_type() => HIGH_SPEED_PACKET_SIZE,
            0 => FULL_SPEED_PACKET_SIZE,
            n => n,
        }
    }

    /// Apply baud rate, line format and flow control, in that order.
    ///
    /// All three requests are encoded before anything is sent. A failed
    /// transfer leaves the earlier ones applied.
    #[instrument(level = "info", skip(self), fields(config = %config))]
    pub fn configure(&self, config: &SerialConfig) -> Result<()> {
        self.ensure_open()?;

        let requests = [
            (
                ConfigStep::BaudRate,
                encoder::baud_rate_request(config.baud_rate, self.chip, self.port)?,
            ),
            (
                ConfigStep::LineFormat,
                encoder::line_format_request(
                    config.data_bits,
                    config.stop_bits,
                    config.parity,
                    self.port,
                ),
            ),
            (
                ConfigStep::FlowControl,
                encoder::flow_control_request(config.flow_control, self.port),
            ),
        ];
        for (step, request) in requests {
            self.send_control(step, request)?;
        }

        self.transition(SessionState::Configured);
        self.observer
            .on_event(&BridgeEvent::Configured { config: *config });
        Ok(())
    }

    /// Field-by-field form of [`configure`](Self::configure).
    pub fn configure_serial_port(
        &self,
        baud_rate: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
        flow_control: FlowControl,
    ) -> Result<()> {
        self.configure(&SerialConfig {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_control,
        })
    }

    /// Drive DTR and RTS in one control transfer.
    #[instrument(level = "debug", skip(self))]
    pub fn set_modem_lines(&self, lines: ModemLines) -> Result<()> {
        self.ensure_open()?;
        self.send_control(
            ConfigStep::ModemLines,
            encoder::modem_lines_request(lines, self.port),
        )?;
        self.observer.on_event(&BridgeEvent::ModemLinesSet { lines });
        Ok(())
    }

    /// Reset the UART and purge both FIFOs.
    #[instrument(level = "debug", skip(self))]
    pub fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        self.send_control(ConfigStep::Reset, encoder::reset_request(self.port))
    }

    /// Blocking bulk write. Returns the bytes accepted, which may be fewer
    /// than supplied.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let written = self
            .guard
            .write_pipe()
            .with(|| self.open_write_pipe(), |pipe| pipe.submit(data))
            .map_err(|source| BridgeError::TransferFailed {
                direction: EndpointDirection::Out,
                source,
            })?;

        debug!(written, "Write complete");
        self.observer.on_event(&BridgeEvent::Packet {
            direction: EndpointDirection::Out,
            length: written,
            data: Some(data[..written.min(data.len())].to_vec()),
        });
        Ok(written)
    }

    /// Submit a bulk write without waiting for it to complete.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write_async(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.guard
            .write_pipe()
            .with(|| self.open_write_pipe(), |pipe| pipe.submit_detached(data))
            .map_err(|source| BridgeError::TransferFailed {
                direction: EndpointDirection::Out,
                source,
            })?;

        self.observer.on_event(&BridgeEvent::Packet {
            direction: EndpointDirection::Out,
            length: data.len(),
            data: Some(data.to_vec()),
        });
        Ok(())
    }

    /// One blocking bulk read, split into modem status and payload.
    #[instrument(level = "debug", skip(self))]
    pub fn read_frame(&self) -> Result<Frame> {
        self.ensure_open()?;
        let len = self.max_packet_size();
        let raw = self
            .guard
            .read_pipe()
            .with(|| self.open_read_pipe(), |pipe| pipe.submit(len))
            .map_err(|source| BridgeError::TransferFailed {
                direction: EndpointDirection::In,
                source,
            })?;

        let frame = Frame::parse(&raw);
        debug!(raw_len = raw.len(), payload_len = frame.payload.len(), "Read complete");
        if !frame.is_empty() {
            self.observer.on_event(&BridgeEvent::Packet {
                direction: EndpointDirection::In,
                length: frame.payload.len(),
                data: Some(frame.payload.clone()),
            });
        }
        Ok(frame)
    }

    /// One blocking bulk read with the status header stripped.
    /// Empty when the chip had no data.
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(self.read_frame()?.payload)
    }

    /// Shut the pipes and release the claim. Repeated calls do nothing.
    ///
    /// A transfer still opening its pipe fails with `NotClaimed` instead of
    /// reaching the device.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }

        self.guard.release();

        self.observer.on_event(&BridgeEvent::StateChanged {
            from: previous,
            to: SessionState::Closed,
        });
        self.observer.on_event(&BridgeEvent::SessionClosed {
            vid: self.identity.vendor_id,
            pid: self.identity.product_id,
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(BridgeError::SessionClosed);
        }
        Ok(())
    }

    fn transition(&self, to: SessionState) {
        let from = {
            let mut state = self.lock_state();
            if *state == SessionState::Closed || *state == to {
                return;
            }
            std::mem::replace(&mut *state, to)
        };
        self.observer
            .on_event(&BridgeEvent::StateChanged { from, to });
    }

    fn send_control(&self, step: ConfigStep, request: ControlRequest) -> Result<()> {
        debug!(
            step = %step,
            request = request.request,
            value = %format!("0x{:04X}", request.value),
            index = %format!("0x{:04X}", request.index),
            "Control transfer"
        );
        self.guard
            .interface()
            .control_out(request)
            .map_err(|source| BridgeError::ConfigurationFailed { step, source })
    }

    fn open_write_pipe(&self) -> std::result::Result<I::OutPipe, TransportError> {
        let pipe = self.guard.interface().open_out(&self.write_endpoint)?;
        self.observer.on_event(&BridgeEvent::PipeOpened {
            direction: EndpointDirection::Out,
            address: self.write_endpoint.address,
        });
        Ok(pipe)
    }

    fn open_read_pipe(&self) -> std::result::Result<I::InPipe, TransportError> {
        let pipe = self.guard.interface().open_in(&self.read_endpoint)?;
        self.observer.on_event(&BridgeEvent::PipeOpened {
            direction: EndpointDirection::In,
            address: self.read_endpoint.address,
        });
        Ok(pipe)
    }
}

impl<I: UsbInterface, O: BridgeObserver> Drop for PortSession<'_, I, O> {
    fn drop(&mut self) {
        self.close();
    }
}
