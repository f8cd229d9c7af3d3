use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use esclink_core::hex::{plan_flash, window_checksums};
use esclink_core::params::{self, GroupMapping, build_write_frame, parse_read_response};
use esclink_core::protocol::constants::{CMD_WRITE, DEFAULT_BLOCK_SIZE};
use esclink_core::protocol::{hex_upper, parse_frame};
use esclink_core::{FlashHandle, FlashOptions, FlashSession, HexImage, ProtocolConfig, SerialTransport};
use tracing::{error, info};

mod progress;

use progress::ProgressObserver;

/// Group A values used by `selftest`.
const SELFTEST_VALUES: [f64; 20] = [
    14.0, 60.0, 45.0, 665.0, 1000.0, 300.0, 5.0, 2500.0, 50.0, 25.0, 25.0, 2.0, 2.0, 200.0, 10.0,
    2400.0, 4450.0, 1500.0, 100.0, 115.0,
];

#[derive(Parser, Debug)]
#[command(author, version, about = "ESC serial configuration and flashing tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Protocol settings (TOML); built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read every parameter of a group
    Read {
        /// Serial port (e.g. /dev/ttyUSB0, COM3)
        #[arg(long)]
        port: String,
        group: String,
    },
    /// Write parameters of a group
    Write {
        #[arg(long)]
        port: String,
        /// Directory holding <GROUP>.toml parameter mappings
        #[arg(long, default_value = "mappings")]
        mapping_dir: PathBuf,
        group: String,
        /// KEY=VALUE pairs
        #[arg(required = true, value_parser = parse_assignment)]
        values: Vec<(String, f64)>,
    },
    /// Build the group A example frame and decode it again
    Selftest,
    /// Flash an Intel HEX image
    Flash {
        #[arg(long)]
        port: String,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        /// Step through the stages manually; replies are shown, not checked
        #[arg(long)]
        debug: bool,
        file: PathBuf,
    },
    /// Show blocks and checksums a flash of this image would use
    HexInfo {
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
        /// Also dump CRCs of fixed-size padded windows
        #[arg(long)]
        window: Option<usize>,
        file: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: tracing subscriber already installed");
    }

    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;

    match args.command {
        Command::Read { port, group } => report(read(&cfg, &port, &group)),
        Command::Write {
            port,
            mapping_dir,
            group,
            values,
        } => report(write(&cfg, &port, &mapping_dir, &group, values)),
        Command::Selftest => selftest(&cfg),
        Command::Flash {
            port,
            block_size,
            debug,
            file,
        } => flash(cfg, &port, block_size, debug, &file),
        Command::HexInfo {
            block_size,
            window,
            file,
        } => hex_info(&cfg, block_size, window, &file),
    }
}

fn load_config(path: Option<&Path>) -> Result<ProtocolConfig> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading protocol config");
            ProtocolConfig::load_from_file(path)
                .with_context(|| format!("loading config {}", path.display()))
        }
        None => Ok(ProtocolConfig::default()),
    }
}

/// Print `FAIL` on stdout for failed parameter commands.
fn report(result: Result<()>) -> Result<()> {
    if result.is_err() {
        println!("FAIL");
    }
    result
}

fn parse_assignment(arg: &str) -> Result<(String, f64), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", arg))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in `{}`", arg));
    }
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value in `{}`: {}", arg, e))?;
    Ok((key.to_string(), value))
}

fn open_port(port: &str, cfg: &ProtocolConfig) -> Result<SerialTransport> {
    SerialTransport::open(port, cfg).with_context(|| {
        let ports = SerialTransport::available_ports();
        if ports.is_empty() {
            format!("opening {} (no serial ports found)", port)
        } else {
            format!("opening {} (available: {})", port, ports.join(", "))
        }
    })
}

fn read(cfg: &ProtocolConfig, port: &str, group: &str) -> Result<()> {
    let transport = open_port(port, cfg)?;
    let response = params::read_group(&transport, group, cfg)?;
    if response.is_empty() {
        bail!("device returned no values for group {}", group);
    }
    for (key, value) in response.sorted() {
        println!("{} = {}", key, value);
    }
    Ok(())
}

fn write(
    cfg: &ProtocolConfig,
    port: &str,
    mapping_dir: &Path,
    group: &str,
    assignments: Vec<(String, f64)>,
) -> Result<()> {
    let mapping = GroupMapping::load(mapping_dir, group)?;
    let values: BTreeMap<String, f64> = assignments.into_iter().collect();
    // Reject out-of-range values before touching the port.
    params::validate_write(group, &values, &mapping)?;

    let transport = open_port(port, cfg)?;
    params::write_group(&transport, group, &values, &mapping, cfg)?;
    println!("OK");
    Ok(())
}

fn selftest_values() -> BTreeMap<String, f64> {
    SELFTEST_VALUES
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("A{}", i), *v))
        .collect()
}

fn selftest(cfg: &ProtocolConfig) -> Result<()> {
    let values = selftest_values();
    let frame = build_write_frame("A", &values, &GroupMapping::empty("A"), cfg);
    println!("Frame ({} bytes): {}", frame.len(), hex_upper(&frame));

    let payload = parse_frame(&frame, cfg)?;
    println!("Payload: {}", String::from_utf8_lossy(payload));

    // Present the body the way the device answers a READ.
    let prefix = format!("{}{}", cfg.tx_prefix(), CMD_WRITE);
    let body = payload
        .strip_prefix(prefix.as_bytes())
        .context("payload lacks the WRITE prefix")?;
    let mut reply = vec![cfg.rx_start];
    reply.extend_from_slice(body);

    let decoded = parse_read_response(&reply, cfg);
    for (key, value) in decoded.sorted() {
        println!("{} = {}", key, value);
    }
    if decoded.values != values {
        bail!("decoded values differ from the encoded ones");
    }
    println!("OK");
    Ok(())
}

fn flash(cfg: ProtocolConfig, port: &str, block_size: usize, debug: bool, file: &Path) -> Result<()> {
    let image =
        HexImage::from_file(file).with_context(|| format!("loading {}", file.display()))?;
    let transport = Arc::new(open_port(port, &cfg)?);

    let options = FlashOptions {
        block_size,
        debug_mode: debug,
        ..FlashOptions::default()
    };
    let observer = Arc::new(ProgressObserver::new(debug));
    let mut session = FlashSession::with_observer(cfg, options, observer);
    if debug {
        spawn_stepper(session.handle());
    }

    let report = session.run(transport, &image)?;
    println!(
        "Flashed {} bytes in {} blocks, total CRC {:04X}, {:.1}s ({})",
        report.bytes,
        report.blocks,
        report.accumulated,
        report.elapsed.as_secs_f64(),
        report.stats
    );
    Ok(())
}

/// Debug mode: Enter advances one step, `q` aborts.
fn spawn_stepper(handle: FlashHandle) {
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().eq_ignore_ascii_case("q") {
                handle.abort();
                break;
            }
            handle.advance();
        }
    });
}

fn hex_info(cfg: &ProtocolConfig, block_size: usize, window: Option<usize>, file: &Path) -> Result<()> {
    let image =
        HexImage::from_file(file).with_context(|| format!("loading {}", file.display()))?;
    println!("File:       {}", file.display());
    println!("Records:    {}", image.record_count());
    let (Some(min), Some(max)) = (image.min_address(), image.max_address()) else {
        println!("No data records");
        return Ok(());
    };
    println!("Data bytes: {}", image.data_len());
    println!(
        "Range:      {:08X}..={:08X} ({} bytes spanned)",
        min,
        max,
        image.total_span()
    );

    let plan = plan_flash(&image, block_size, cfg);
    println!(
        "Blocks:     {} (max {} bytes), {} erase sectors",
        plan.blocks.len(),
        block_size,
        plan.erase_sectors
    );
    for block in &plan.blocks {
        println!(
            "  #{:<4} {:08X} {:>5} bytes  CRC {:04X}  total {:04X}",
            block.index + 1,
            block.address,
            block.len,
            block.frame_checksum,
            block.accumulated
        );
    }
    println!("ENDCRC:     {:04X}", plan.end_checksum);

    if let Some(window) = window {
        println!();
        println!("Window CRCs ({} bytes, gaps padded with FF):", window);
        for w in window_checksums(&image, window) {
            println!(
                "  #{:<4} {:08X} {:>5}/{} present  CRC {:04X}  sum {:04X}",
                w.index + 1,
                w.address,
                w.present,
                window,
                w.crc,
                w.running_sum
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("A3=665").unwrap(), ("A3".to_string(), 665.0));
        assert_eq!(parse_assignment(" A0 = 1.5 ").unwrap(), ("A0".to_string(), 1.5));
        assert!(parse_assignment("A3").is_err());
        assert!(parse_assignment("=5").is_err());
        assert!(parse_assignment("A3=fast").is_err());
    }

    #[test]
    fn test_selftest_round_trip() {
        assert_eq!(selftest_values().len(), 20);
        selftest(&ProtocolConfig::default()).unwrap();
    }

    #[test]
    fn test_write_args() {
        let args = Args::try_parse_from([
            "esclink", "write", "--port", "COM3", "A", "A0=14", "A3=665",
        ])
        .unwrap();
        match args.command {
            Command::Write { group, values, .. } => {
                assert_eq!(group, "A");
                assert_eq!(values.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Args::try_parse_from(["esclink", "write", "--port", "COM3", "A", "A0"]).is_err());
    }
}
