//! esclink-core: serial configuration and firmware flashing for ESCs.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Frame codec, checksums, command payloads
//! - **Config**: Serial and framing settings, loaded from TOML
//! - **Params**: Parameter group read/write over the frame codec
//! - **Hex**: Intel HEX parsing, block splitting and diagnostics
//! - **Transport**: Serial port abstraction (serialport, mock) and frame reader
//! - **State**: Flash state machine and stage handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level flash orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use esclink_core::{FlashOptions, FlashSession, ProtocolConfig, SerialTransport};
//!
//! let protocol = ProtocolConfig::default();
//! let transport = Arc::new(SerialTransport::open("/dev/ttyUSB0", &protocol).unwrap());
//! let mut session = FlashSession::new(protocol, FlashOptions::default());
//! let report = session.flash_file(transport, "firmware.hex").expect("flash failed");
//! println!("Total CRC {:04X}", report.accumulated);
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod hex;
pub mod params;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{ConfigError, Parity, ProtocolConfig, StopBits};
pub use error::{ErrorKind, ErrorStats, FaultKind, FlashError, ProtocolFault};
pub use events::{FlashEvent, FlashObserver, LogLevel, NullObserver, PacketDirection, TracingObserver};
pub use hex::{DataBlock, HexError, HexImage};
pub use params::{GroupMapping, ParamDescriptor, ParamError, ReadResponse};
pub use protocol::{ChecksumAlgo, FrameError};
pub use session::{FlashHandle, FlashInput, FlashReport, FlashSession};
pub use state::{FlashOptions, FlashState, FlashTiming, Stage};
pub use transport::{MockTransport, SerialTransport, Transport, TransportError};
