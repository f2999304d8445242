//! Host context shared by every session.
//!
//! Owns the host backend and the release registry. Dropping the context, or
//! calling [`BridgeContext::shutdown`], releases any claim still open.

use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::error::{BridgeError, Result};
use crate::guard::ReleaseRegistry;
use crate::locator::DeviceLocator;
use crate::protocol::RELEASE_GRACE;
use crate::session::PortSession;
use crate::topology::{UsbDevice, UsbNode};
use crate::transport::{UsbDeviceHandle, UsbHost};

pub struct BridgeContext<H: UsbHost> {
    host: H,
    registry: ReleaseRegistry,
    release_grace: Duration,
}

impl<H: UsbHost> BridgeContext<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            registry: ReleaseRegistry::new(),
            release_grace: RELEASE_GRACE,
        }
    }

    /// Settle time after each interface release.
    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    pub fn release_grace(&self) -> Duration {
        self.release_grace
    }

    /// Enumerate the attached devices.
    #[instrument(level = "debug", skip(self))]
    pub fn topology(&self) -> Result<UsbNode<H::Device>> {
        let root = self.host.topology().map_err(BridgeError::Enumeration)?;
        debug!(devices = root.device_count(), "Enumerated");
        Ok(root)
    }

    pub fn locator(&self) -> DeviceLocator<'_, H> {
        DeviceLocator::new(self)
    }

    /// Claim `device` and open a session on it. The session borrows the context.
    pub fn open_session(
        &self,
        device: &UsbDevice<H::Device>,
    ) -> Result<PortSession<'_, <H::Device as UsbDeviceHandle>::Interface>> {
        PortSession::open(self, device)
    }

    /// Number of claims currently held through this context.
    pub fn active_sessions(&self) -> usize {
        self.registry.active()
    }

    /// Release every claim still held. Safe to call more than once.
    pub fn shutdown(&self) -> usize {
        let released = self.registry.release_all();
        if released > 0 {
            info!(released, "Released leftover claims");
        }
        released
    }

    pub(crate) fn registry(&self) -> &ReleaseRegistry {
        &self.registry
    }
}

impl<H: UsbHost> Drop for BridgeContext<H> {
    fn drop(&mut self) {
        self.registry.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::transport::mock::{MockDevice, MockHost};

    #[test]
    fn test_enumeration_error() {
        let host = MockHost::new();
        host.fail_enumeration(TransportError::EnumerationFailed("no access".into()));
        let ctx = BridgeContext::new(host);

        let err = ctx.topology().unwrap_err();
        assert!(matches!(err, BridgeError::Enumeration(_)));
    }

    #[test]
    fn test_shutdown_releases_leaked_session() {
        let device = MockDevice::new();
        let ctx = BridgeContext::new(MockHost::with_devices([device.clone()]))
            .with_release_grace(Duration::ZERO);
        let found = ctx.locator().find(None, 0x0403, &Default::default()).unwrap();

        let session = ctx.open_session(&found[0]).unwrap();
        assert_eq!(ctx.active_sessions(), 1);
        std::mem::forget(session);

        assert_eq!(ctx.shutdown(), 1);
        assert!(!device.is_claimed());
        assert_eq!(ctx.active_sessions(), 0);
        assert_eq!(ctx.shutdown(), 0);
    }

    #[test]
    fn test_shutdown_releases_leaked_session_with_open_pipes() {
        let device = MockDevice::new();
        let ctx = BridgeContext::new(MockHost::with_devices([device.clone()]))
            .with_release_grace(Duration::ZERO);
        let found = ctx.locator().find(None, 0x0403, &Default::default()).unwrap();

        let session = ctx.open_session(&found[0]).unwrap();
        session.write(b"x").unwrap();
        session.read().unwrap();
        assert_eq!(device.live_pipe_count(), 2);
        std::mem::forget(session);

        assert_eq!(ctx.shutdown(), 1);
        assert_eq!(device.live_pipe_count(), 0);
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_drop_context_releases() {
        let device = MockDevice::new();
        {
            let ctx = BridgeContext::new(MockHost::with_devices([device.clone()]))
                .with_release_grace(Duration::ZERO);
            let found = ctx.locator().find(None, 0x0403, &Default::default()).unwrap();
            std::mem::forget(ctx.open_session(&found[0]).unwrap());
            assert!(device.is_claimed());
        }
        assert!(!device.is_claimed());
    }
}
