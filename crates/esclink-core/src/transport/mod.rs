//! Transport layer module.

pub mod mock;
pub mod reader;
pub mod serial;
pub mod traits;

pub use mock::MockTransport;
pub use reader::{FrameReader, ReaderEvent};
pub use serial::SerialTransport;
pub use traits::{Transport, TransportError};
