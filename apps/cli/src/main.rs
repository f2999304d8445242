use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ftbridge_core::{
    BridgeConfig, BridgeContext, DataBits, FlowControl, NusbHost, Parity, PortSession,
    ProductFilter, StopBits, UsbNode,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serial-over-USB bridge for FTDI UART chips", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List matching devices
    List {
        #[command(flatten)]
        select: Selection,

        /// Print the whole USB tree instead of matches only
        #[arg(long)]
        tree: bool,
    },
    /// Open a port, send bytes, print what comes back
    Exchange {
        #[command(flatten)]
        select: Selection,

        #[command(flatten)]
        serial: SerialOverrides,

        /// Bytes to send, in hex (e.g. "55 02" or "0x55,0x02")
        #[arg(long)]
        data: String,

        /// Number of reads after the write
        #[arg(long, default_value_t = 1)]
        reads: u32,

        /// Pause between reads, in milliseconds
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
}

#[derive(Args, Debug)]
struct Selection {
    /// Vendor ID, hex
    #[arg(long, value_parser = parse_id)]
    vid: Option<u16>,

    /// Product ID, hex; repeat for several
    #[arg(long = "pid", value_parser = parse_id)]
    pids: Vec<u16>,

    /// Case-insensitive substring of the product string
    #[arg(long)]
    product: Option<String>,
}

#[derive(Args, Debug)]
struct SerialOverrides {
    #[arg(long)]
    baud: Option<u32>,

    /// 5, 6, 7 or 8
    #[arg(long)]
    data_bits: Option<DataBits>,

    /// 1, 1.5 or 2
    #[arg(long)]
    stop_bits: Option<StopBits>,

    /// none, odd, even, mark or space
    #[arg(long)]
    parity: Option<Parity>,

    /// none, rts-cts, dtr-dsr or xon-xoff
    #[arg(long)]
    flow: Option<FlowControl>,
}

fn parse_id(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid USB id '{s}': {e}"))
}

/// Parses "55 02", "5502", "0x55,0x02" or "55:02".
fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in s.split(|c: char| c.is_whitespace() || c == ',' || c == ':') {
        let token = token.trim_start_matches("0x").trim_start_matches("0X");
        if token.is_empty() {
            continue;
        }
        if token.len() % 2 != 0 {
            bail!("odd number of hex digits in '{token}'");
        }
        for i in (0..token.len()).step_by(2) {
            let pair = token
                .get(i..i + 2)
                .with_context(|| format!("invalid hex '{token}'"))?;
            let byte =
                u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex '{pair}'"))?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn load_config(path: Option<&PathBuf>, select: &Selection) -> Result<BridgeConfig> {
    let mut config = match path {
        Some(path) => BridgeConfig::load_from_file(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(vid) = select.vid {
        config.vendor_id = vid;
    }
    if !select.pids.is_empty() {
        config.product_ids = select.pids.clone();
    }
    if select.product.is_some() {
        config.product_name = select.product.clone();
    }
    Ok(config)
}

fn apply_overrides(config: &mut BridgeConfig, serial: &SerialOverrides) {
    let s = &mut config.serial;
    if let Some(baud) = serial.baud {
        s.baud_rate = baud;
    }
    if let Some(bits) = serial.data_bits {
        s.data_bits = bits;
    }
    if let Some(stop) = serial.stop_bits {
        s.stop_bits = stop;
    }
    if let Some(parity) = serial.parity {
        s.parity = parity;
    }
    if let Some(flow) = serial.flow {
        s.flow_control = flow;
    }
}

fn print_tree<D>(node: &UsbNode<D>, depth: usize) {
    if let Some(device) = node.device() {
        println!("{:indent$}{}", "", device.identity, indent = depth * 2);
    }
    let next = if node.device().is_some() { depth + 1 } else { depth };
    for child in node.children() {
        print_tree(child, next);
    }
}

fn list(ctx: &BridgeContext<NusbHost>, config: &BridgeConfig, tree: bool) -> Result<()> {
    let root = ctx.topology()?;
    if tree {
        print_tree(&root, 0);
        return Ok(());
    }

    let filter: ProductFilter = config.product_filter();
    let devices = ctx.locator().find(Some(&root), config.vendor_id, &filter)?;
    let devices: Vec<_> = devices
        .into_iter()
        .filter(|d| config.matches_product_name(&d.identity))
        .collect();

    if devices.is_empty() {
        info!(vid = %format!("{:04X}", config.vendor_id), filter = %filter, "No matching devices");
    }
    for device in &devices {
        let chip = ftbridge_core::ChipType::from_bcd_device(device.identity.device_version);
        println!("{} [{}]", device.identity, chip);
    }
    Ok(())
}

fn exchange(
    ctx: &BridgeContext<NusbHost>,
    config: &BridgeConfig,
    data: &[u8],
    reads: u32,
    interval: Duration,
) -> Result<()> {
    let filter = config.product_filter();
    let device = ctx
        .locator()
        .find(None, config.vendor_id, &filter)?
        .into_iter()
        .find(|d| config.matches_product_name(&d.identity))
        .context("No matching device")?;
    info!(device = %device.identity, "Using device");

    let session = PortSession::bring_up(ctx, &device, &config.serial, config.modem_lines)?;

    let mut offset = 0;
    while offset < data.len() {
        let written = session.write(&data[offset..])?;
        if written == 0 {
            bail!("Device accepted no data after {offset} of {} bytes", data.len());
        }
        offset += written;
    }
    println!("TX {}", hex(data));

    for i in 0..reads {
        if i > 0 {
            thread::sleep(interval);
        }
        let frame = session.read_frame()?;
        if let Some(status) = frame.status
            && status.has_error()
        {
            warn!(status = ?status, "Line error reported");
        }
        if !frame.is_empty() {
            println!("RX {}", hex(&frame.payload));
        }
    }

    session.close();
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::List { select, tree } => {
            let config = load_config(cli.config.as_ref(), select)?;
            let ctx = BridgeContext::new(
                NusbHost::new().with_kernel_driver_detach(config.detach_kernel_driver),
            );
            list(&ctx, &config, *tree)
        }
        Commands::Exchange {
            select,
            serial,
            data,
            reads,
            interval_ms,
        } => {
            let mut config = load_config(cli.config.as_ref(), select)?;
            apply_overrides(&mut config, serial);
            config.validate()?;
            let bytes = parse_hex(data)?;

            let ctx = BridgeContext::new(
                NusbHost::new().with_kernel_driver_detach(config.detach_kernel_driver),
            );
            let result = exchange(
                &ctx,
                &config,
                &bytes,
                *reads,
                Duration::from_millis(*interval_ms),
            );
            ctx.shutdown();
            result
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_forms() {
        assert_eq!(parse_hex("55 02").unwrap(), vec![0x55, 0x02]);
        assert_eq!(parse_hex("5502").unwrap(), vec![0x55, 0x02]);
        assert_eq!(parse_hex("0x55,0x02").unwrap(), vec![0x55, 0x02]);
        assert_eq!(parse_hex("de:ad:BE:ef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(parse_hex("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_hex_rejects() {
        assert!(parse_hex("5").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("0403"), Ok(0x0403));
        assert_eq!(parse_id("0x6010"), Ok(0x6010));
        assert!(parse_id("xyz").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "ftbridge", "exchange", "--data", "55", "--pid", "6010", "--pid", "6001", "--baud",
            "9600", "--parity", "even", "--flow", "rts-cts",
        ]);
        let Commands::Exchange { select, serial, .. } = &cli.command else {
            panic!("expected exchange");
        };
        let mut config = load_config(None, select).unwrap();
        apply_overrides(&mut config, serial);

        assert_eq!(config.product_filter(), ProductFilter::only([0x6001, 0x6010]));
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.parity, Parity::Even);
        assert_eq!(config.serial.flow_control, FlowControl::RtsCts);
        assert_eq!(config.serial.data_bits, DataBits::Eight);
    }
}
