//! USB topology snapshot.
//!
//! A host backend hands out the attached devices as a tree of [`UsbNode`]s.
//! Hubs own their children; the virtual root is a hub without a device of
//! its own.

use std::collections::BTreeSet;
use std::fmt;

/// Physical position of a device: bus plus the hub ports leading to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DeviceLocation {
    pub bus_id: String,
    pub port_chain: Vec<u8>,
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bus_id)?;
        for (i, port) in self.port_chain.iter().enumerate() {
            let sep = if i == 0 { '-' } else { '.' };
            write!(f, "{sep}{port}")?;
        }
        Ok(())
    }
}

/// Descriptor-level identity of an attached device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Product string, if the host stack could read it.
    pub product: Option<String>,
    /// `bcdDevice` release number.
    pub device_version: u16,
    pub location: DeviceLocation,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Default::default()
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)?;
        if !self.location.bus_id.is_empty() {
            write!(f, " @ {}", self.location)?;
        }
        if let Some(product) = &self.product {
            write!(f, " \"{product}\"")?;
        }
        Ok(())
    }
}

/// A device in the topology together with the backend handle used to open it.
#[derive(Debug, Clone)]
pub struct UsbDevice<D> {
    pub identity: DeviceIdentity,
    pub handle: D,
}

impl<D> UsbDevice<D> {
    pub fn new(identity: DeviceIdentity, handle: D) -> Self {
        Self { identity, handle }
    }
}

/// Node of the device tree.
#[derive(Debug, Clone)]
pub enum UsbNode<D> {
    Device(UsbDevice<D>),
    Hub {
        /// `None` for the virtual root hub.
        hub: Option<UsbDevice<D>>,
        children: Vec<UsbNode<D>>,
    },
}

impl<D> UsbNode<D> {
    pub fn virtual_root(children: Vec<UsbNode<D>>) -> Self {
        UsbNode::Hub {
            hub: None,
            children,
        }
    }

    pub fn device(&self) -> Option<&UsbDevice<D>> {
        match self {
            UsbNode::Device(device) => Some(device),
            UsbNode::Hub { hub, .. } => hub.as_ref(),
        }
    }

    pub fn children(&self) -> &[UsbNode<D>] {
        match self {
            UsbNode::Device(_) => &[],
            UsbNode::Hub { children, .. } => children,
        }
    }

    /// Number of real devices in this subtree.
    pub fn device_count(&self) -> usize {
        let own = usize::from(self.device().is_some());
        own + self.children().iter().map(UsbNode::device_count).sum::<usize>()
    }
}

/// Builds the device tree from a flat enumeration.
///
/// Parents are found by port chain: a device at `1-2.3` hangs below the
/// device at `1-2` on the same bus. A device with an empty port chain is
/// that bus's root hub. Devices whose parent was not enumerated are
/// attached to the virtual root.
pub fn build_topology<D>(
    mut devices: Vec<UsbDevice<D>>,
    is_hub: impl Fn(&UsbDevice<D>) -> bool,
) -> UsbNode<D> {
    devices.sort_by(|a, b| a.identity.location.cmp(&b.identity.location));

    let mut slots: Vec<Option<(UsbDevice<D>, bool)>> = devices
        .into_iter()
        .map(|d| {
            let hub = is_hub(&d);
            Some((d, hub))
        })
        .collect();

    let buses: BTreeSet<String> = slots
        .iter()
        .flatten()
        .map(|(d, _)| d.identity.location.bus_id.clone())
        .collect();

    let mut roots = Vec::new();
    for bus in &buses {
        let root_hub = slots.iter().position(|s| {
            s.as_ref().is_some_and(|(d, _)| {
                d.identity.location.bus_id == *bus && d.identity.location.port_chain.is_empty()
            })
        });

        match root_hub.and_then(|i| slots[i].take()) {
            Some((hub, _)) => {
                let children = take_children(&mut slots, bus, &[]);
                roots.push(UsbNode::Hub {
                    hub: Some(hub),
                    children,
                });
            }
            None => roots.extend(take_children(&mut slots, bus, &[])),
        }
    }

    // Orphans: the shortest remaining chain first, each with its own subtree.
    let depth = |s: &Option<(UsbDevice<D>, bool)>| {
        s.as_ref()
            .map(|(d, _)| d.identity.location.port_chain.len())
    };
    while let Some(i) = (0..slots.len())
        .filter(|&i| slots[i].is_some())
        .min_by_key(|&i| depth(&slots[i]))
    {
        if let Some(node) = take_node(&mut slots, i) {
            roots.push(node);
        }
    }

    UsbNode::virtual_root(roots)
}

fn take_children<D>(
    slots: &mut [Option<(UsbDevice<D>, bool)>],
    bus: &str,
    prefix: &[u8],
) -> Vec<UsbNode<D>> {
    let direct: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter_map(|(i, s)| {
            let (d, _) = s.as_ref()?;
            let loc = &d.identity.location;
            let is_child = loc.bus_id == bus
                && loc.port_chain.len() == prefix.len() + 1
                && loc.port_chain.starts_with(prefix);
            is_child.then_some(i)
        })
        .collect();

    direct
        .into_iter()
        .filter_map(|i| take_node(slots, i))
        .collect()
}

fn take_node<D>(slots: &mut [Option<(UsbDevice<D>, bool)>], i: usize) -> Option<UsbNode<D>> {
    let (device, is_hub) = slots[i].take()?;
    let bus = device.identity.location.bus_id.clone();
    let chain = device.identity.location.port_chain.clone();
    let children = take_children(slots, &bus, &chain);

    if is_hub || !children.is_empty() {
        Some(UsbNode::Hub {
            hub: Some(device),
            children,
        })
    } else {
        Some(UsbNode::Device(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(bus: &str, chain: &[u8], vid: u16, pid: u16) -> UsbDevice<u32> {
        let identity = DeviceIdentity {
            vendor_id: vid,
            product_id: pid,
            location: DeviceLocation {
                bus_id: bus.to_string(),
                port_chain: chain.to_vec(),
            },
            ..Default::default()
        };
        UsbDevice::new(identity, pid as u32)
    }

    #[test]
    fn test_location_display() {
        let loc = DeviceLocation {
            bus_id: "3".into(),
            port_chain: vec![1, 4, 2],
        };
        assert_eq!(loc.to_string(), "3-1.4.2");
    }

    #[test]
    fn test_build_nested_hubs() {
        let devices = vec![
            dev("1", &[1, 2], 0x0403, 0x6001),
            dev("1", &[1], 0x05E3, 0x0610),
            dev("1", &[2], 0x046D, 0xC52B),
            dev("2", &[1], 0x0403, 0x6010),
        ];
        let root = build_topology(devices, |d| d.identity.vendor_id == 0x05E3);

        assert_eq!(root.device_count(), 4);
        assert!(root.device().is_none());

        let top = root.children();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].device().unwrap().identity.product_id, 0x0610);
        assert_eq!(top[0].children().len(), 1);
        assert_eq!(top[0].children()[0].device().unwrap().identity.product_id, 0x6001);
        assert_eq!(top[1].device().unwrap().identity.product_id, 0xC52B);
        assert_eq!(top[2].device().unwrap().identity.product_id, 0x6010);
    }

    #[test]
    fn test_root_hub_and_orphans() {
        let devices = vec![
            dev("1", &[], 0x1D6B, 0x0002),
            dev("1", &[3], 0x0403, 0x6001),
            // Parent 1-5 was not enumerated.
            dev("1", &[5, 1], 0x0403, 0x6014),
        ];
        let root = build_topology(devices, |_| false);

        assert_eq!(root.device_count(), 3);
        let top = root.children();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].device().unwrap().identity.product_id, 0x0002);
        assert_eq!(top[0].children().len(), 1);
        assert_eq!(top[1].device().unwrap().identity.product_id, 0x6014);
    }
}
