//! Bridge configuration file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::locator::ProductFilter;
use crate::protocol::{FTDI_VENDOR_ID, ModemLines, SUPPORTED_PIDS, SerialConfig};
use crate::topology::DeviceIdentity;

/// Device selection, serial settings and claim policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// USB vendor ID to search for.
    pub vendor_id: u16,
    /// Accepted product IDs. Empty means any product.
    pub product_ids: Vec<u16>,
    /// Substring the product string must contain, case-insensitive.
    pub product_name: Option<String>,
    /// Detach a bound kernel driver before claiming.
    pub detach_kernel_driver: bool,
    pub serial: SerialConfig,
    pub modem_lines: ModemLines,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            vendor_id: FTDI_VENDOR_ID,
            product_ids: SUPPORTED_PIDS.to_vec(),
            product_name: None,
            detach_kernel_driver: false,
            serial: SerialConfig::default(),
            modem_lines: ModemLines::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.serial.baud_rate == 0 {
            return Err(BridgeError::Config("baud_rate must be positive".into()));
        }
        if self.product_name.as_deref().is_some_and(str::is_empty) {
            return Err(BridgeError::Config("product_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn product_filter(&self) -> ProductFilter {
        if self.product_ids.is_empty() {
            ProductFilter::Any
        } else {
            ProductFilter::only(self.product_ids.iter().copied())
        }
    }

    /// Whether `identity` passes the product-name filter.
    ///
    /// A device whose product string could not be read never matches a
    /// configured name.
    pub fn matches_product_name(&self, identity: &DeviceIdentity) -> bool {
        let Some(wanted) = &self.product_name else {
            return true;
        };
        identity
            .product
            .as_deref()
            .is_some_and(|p| p.to_lowercase().contains(&wanted.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataBits, FlowControl, Parity, StopBits};

    #[test]
    fn test_parse_full() {
        let config: BridgeConfig = toml::from_str(
            r#"
            vendor_id = 1027
            product_ids = [24592]
            product_name = "Dual RS232"
            detach_kernel_driver = true

            [serial]
            baud_rate = 9600
            data_bits = 7
            stop_bits = "2"
            parity = "even"
            flow_control = "rts-cts"

            [modem_lines]
            dtr = true
            rts = false
            "#,
        )
        .unwrap();

        assert_eq!(config.vendor_id, 0x0403);
        assert_eq!(config.product_filter(), ProductFilter::only([0x6010]));
        assert!(config.detach_kernel_driver);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.data_bits, DataBits::Seven);
        assert_eq!(config.serial.stop_bits, StopBits::Two);
        assert_eq!(config.serial.parity, Parity::Even);
        assert_eq!(config.serial.flow_control, FlowControl::RtsCts);
        assert!(config.modem_lines.dtr);
        assert!(!config.modem_lines.rts);
    }

    #[test]
    fn test_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.product_filter(), ProductFilter::ftdi());
        assert!(!config.detach_kernel_driver);
        assert_eq!(config.serial, SerialConfig::default());
    }

    #[test]
    fn test_empty_product_list_means_any() {
        let config: BridgeConfig = toml::from_str("product_ids = []").unwrap();
        assert_eq!(config.product_filter(), ProductFilter::Any);
    }

    #[test]
    fn test_product_name_match() {
        let config = BridgeConfig {
            product_name: Some("ft232r".into()),
            ..Default::default()
        };
        let mut identity = DeviceIdentity::new(0x0403, 0x6001);
        assert!(!config.matches_product_name(&identity));

        identity.product = Some("FT232R USB UART".into());
        assert!(config.matches_product_name(&identity));
        assert!(BridgeConfig::default().matches_product_name(&DeviceIdentity::new(0, 0)));
    }

    #[test]
    fn test_validate() {
        let mut config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        config.serial.baud_rate = 0;
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("ftbridge-config-{}.toml", std::process::id()));
        let config = BridgeConfig {
            product_name: Some("UART".into()),
            serial: SerialConfig::new(57600),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = BridgeConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
