//! Device lookup by vendor and product ID.
//!
//! The search walks the topology depth-first. A hub is tested before its
//! children, so hubs that are themselves matching devices are reported too.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, instrument};

use crate::context::BridgeContext;
use crate::error::{BridgeError, Result};
use crate::protocol::SUPPORTED_PIDS;
use crate::topology::{UsbDevice, UsbNode};
use crate::transport::UsbHost;

/// Which product IDs a search accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProductFilter {
    /// Any product ID.
    #[default]
    Any,
    /// Only the listed IDs. An empty set matches nothing.
    Only(BTreeSet<u16>),
}

impl ProductFilter {
    pub fn only(pids: impl IntoIterator<Item = u16>) -> Self {
        ProductFilter::Only(pids.into_iter().collect())
    }

    /// The known FTDI UART bridge products.
    pub fn ftdi() -> Self {
        Self::only(SUPPORTED_PIDS.iter().copied())
    }

    pub fn matches(&self, product_id: u16) -> bool {
        match self {
            ProductFilter::Any => true,
            ProductFilter::Only(pids) => pids.contains(&product_id),
        }
    }
}

impl fmt::Display for ProductFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductFilter::Any => write!(f, "any"),
            ProductFilter::Only(pids) => {
                let list: Vec<String> = pids.iter().map(|p| format!("{p:04X}")).collect();
                write!(f, "[{}]", list.join(", "))
            }
        }
    }
}

/// All devices below `root` matching `vendor_id` and `filter`, in traversal order.
pub fn find_in<'a, D>(
    root: &'a UsbNode<D>,
    vendor_id: u16,
    filter: &ProductFilter,
) -> Vec<&'a UsbDevice<D>> {
    let mut found = Vec::new();
    collect(root, vendor_id, filter, &mut found);
    found
}

fn collect<'a, D>(
    node: &'a UsbNode<D>,
    vendor_id: u16,
    filter: &ProductFilter,
    found: &mut Vec<&'a UsbDevice<D>>,
) {
    if let Some(device) = node.device()
        && device.identity.vendor_id == vendor_id
        && filter.matches(device.identity.product_id)
    {
        found.push(device);
    }
    for child in node.children() {
        collect(child, vendor_id, filter, found);
    }
}

/// Searches the host's topology through a [`BridgeContext`].
pub struct DeviceLocator<'a, H: UsbHost> {
    ctx: &'a BridgeContext<H>,
}

impl<'a, H: UsbHost> DeviceLocator<'a, H> {
    pub fn new(ctx: &'a BridgeContext<H>) -> Self {
        Self { ctx }
    }

    /// Every matching device. Searches a fresh enumeration when `root` is `None`.
    #[instrument(level = "debug", skip(self, root), fields(vid = format!("{:04X}", vendor_id), filter = %filter))]
    pub fn find(
        &self,
        root: Option<&UsbNode<H::Device>>,
        vendor_id: u16,
        filter: &ProductFilter,
    ) -> Result<Vec<UsbDevice<H::Device>>> {
        let fresh;
        let root = match root {
            Some(root) => root,
            None => {
                fresh = self.ctx.topology()?;
                &fresh
            }
        };

        let found: Vec<_> = find_in(root, vendor_id, filter)
            .into_iter()
            .cloned()
            .collect();
        debug!(count = found.len(), "Search complete");
        Ok(found)
    }

    /// First matching device in traversal order.
    pub fn find_first(
        &self,
        root: Option<&UsbNode<H::Device>>,
        vendor_id: u16,
        filter: &ProductFilter,
    ) -> Result<UsbDevice<H::Device>> {
        self.find(root, vendor_id, filter)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::DeviceNotFound {
                vendor_id,
                filter: filter.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FT232_PRODUCT_ID, FT2232_PRODUCT_ID, FTDI_VENDOR_ID};
    use crate::topology::{DeviceIdentity, build_topology};
    use crate::transport::mock::{MockDevice, MockHost};

    fn tree() -> UsbNode<u16> {
        let dev = |chain: &[u8], vid: u16, pid: u16| {
            let mut identity = DeviceIdentity::new(vid, pid);
            identity.location.bus_id = "1".into();
            identity.location.port_chain = chain.to_vec();
            UsbDevice::new(identity, pid)
        };
        build_topology(
            vec![
                dev(&[1], 0x05E3, 0x0610),
                dev(&[1, 1], FTDI_VENDOR_ID, FT232_PRODUCT_ID),
                dev(&[1, 2], 0x046D, 0xC52B),
                dev(&[2], FTDI_VENDOR_ID, FT2232_PRODUCT_ID),
                dev(&[3], FTDI_VENDOR_ID, 0x1234),
            ],
            |d| d.identity.vendor_id == 0x05E3,
        )
    }

    #[test]
    fn test_find_all_in_order() {
        let root = tree();
        let found = find_in(&root, FTDI_VENDOR_ID, &ProductFilter::Any);
        let pids: Vec<u16> = found.iter().map(|d| d.handle).collect();
        assert_eq!(pids, vec![FT232_PRODUCT_ID, FT2232_PRODUCT_ID, 0x1234]);
    }

    #[test]
    fn test_find_with_filter() {
        let root = tree();
        let found = find_in(&root, FTDI_VENDOR_ID, &ProductFilter::ftdi());
        assert_eq!(found.len(), 2);

        let found = find_in(&root, FTDI_VENDOR_ID, &ProductFilter::only([0x1234]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity.location.to_string(), "1-3");
    }

    #[test]
    fn test_hub_itself_matches() {
        let root = tree();
        let found = find_in(&root, 0x05E3, &ProductFilter::Any);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, 0x0610);
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let root = tree();
        assert!(find_in(&root, FTDI_VENDOR_ID, &ProductFilter::only([])).is_empty());
        assert!(find_in(&root, 0xFFFF, &ProductFilter::Any).is_empty());
    }

    #[test]
    fn test_locator_find_first() {
        let first = MockDevice::with_identity(DeviceIdentity::new(FTDI_VENDOR_ID, FT232_PRODUCT_ID));
        let second = MockDevice::with_identity(DeviceIdentity::new(FTDI_VENDOR_ID, FT2232_PRODUCT_ID));
        let ctx = BridgeContext::new(MockHost::with_devices([first.clone(), second]));

        let device = ctx
            .locator()
            .find_first(None, FTDI_VENDOR_ID, &ProductFilter::Any)
            .unwrap();
        assert_eq!(device.identity.product_id, FT232_PRODUCT_ID);

        let err = ctx
            .locator()
            .find_first(None, 0x1A86, &ProductFilter::Any)
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotFound { vendor_id: 0x1A86, .. }));
    }

    #[test]
    fn test_locator_explicit_root() {
        let ctx = BridgeContext::new(MockHost::with_devices([MockDevice::new()]));
        let root = ctx.topology().unwrap();
        let found = ctx
            .locator()
            .find(Some(&root), FTDI_VENDOR_ID, &ProductFilter::ftdi())
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_locator_searches_nested_hubs() {
        let mock = |chain: &[u8], vid: u16, pid: u16| {
            let mut identity = DeviceIdentity::new(vid, pid);
            identity.location.bus_id = "2".into();
            identity.location.port_chain = chain.to_vec();
            MockDevice::with_identity(identity).as_usb_device()
        };
        let root = build_topology(
            vec![
                mock(&[], 0x1D6B, 0x0002),
                mock(&[4], 0x05E3, 0x0610),
                mock(&[4, 1], 0x05E3, 0x0610),
                mock(&[4, 1, 3], FTDI_VENDOR_ID, FT2232_PRODUCT_ID),
                mock(&[4, 2], FTDI_VENDOR_ID, FT232_PRODUCT_ID),
            ],
            |d| matches!(d.identity.vendor_id, 0x1D6B | 0x05E3),
        );
        let ctx = BridgeContext::new(MockHost::with_topology(root));

        let found = ctx
            .locator()
            .find(None, FTDI_VENDOR_ID, &ProductFilter::ftdi())
            .unwrap();
        let locations: Vec<String> = found
            .iter()
            .map(|d| d.identity.location.to_string())
            .collect();
        assert_eq!(locations, vec!["2-4.1.3", "2-4.2"]);

        let hubs = ctx
            .locator()
            .find(None, 0x05E3, &ProductFilter::Any)
            .unwrap();
        assert_eq!(hubs.len(), 2);
    }

    #[test]
    fn test_filter_display() {
        assert_eq!(ProductFilter::Any.to_string(), "any");
        assert_eq!(ProductFilter::only([0x6010, 0x6001]).to_string(), "[6001, 6010]");
    }
}
