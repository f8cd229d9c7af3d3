//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow a flash session without
//! tight coupling to the state machine.

use std::fmt;

use crate::error::{ErrorStats, ProtocolFault};
use crate::protocol::frame::hex_upper;
use crate::state::machine::{FlashState, Stage};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a flash session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// State changed.
    StateChanged { from: FlashState, to: FlashState },
    /// Overall progress, 0..=100.
    Progress { percent: u8, message: String },
    /// Frame written to or received from the transport.
    Packet {
        direction: PacketDirection,
        stage: Option<Stage>,
        data: Vec<u8>,
    },
    /// A reply was rejected; the stage will retry or fail.
    Fault {
        fault: ProtocolFault,
        stats: ErrorStats,
    },
    /// A reply matched what the stage expected.
    ReplyAccepted {
        stage: Stage,
        expected: String,
        actual: String,
    },
    /// A PROGRAM block was acknowledged.
    BlockAccepted {
        index: usize,
        total: usize,
        frame_checksum: u16,
        accumulated: u16,
    },
    /// Reply the device should send next (debug mode hint).
    ExpectedReply { text: String },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Session finished.
    Completed { success: bool, message: String },
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            FlashEvent::Progress { percent, message } => {
                tracing::info!(progress = %format!("{}%", percent), "{}", message);
            }
            FlashEvent::Packet {
                direction,
                stage,
                data,
            } => {
                tracing::debug!(
                    dir = %direction,
                    stage = ?stage,
                    len = data.len(),
                    "{}",
                    hex_upper(data)
                );
            }
            FlashEvent::Fault { fault, stats } => {
                tracing::warn!(stats = %stats, "{}", fault);
            }
            FlashEvent::ReplyAccepted {
                stage,
                expected,
                actual,
            } => {
                tracing::debug!(stage = %stage, expected = %expected, actual = %actual, "Reply accepted");
            }
            FlashEvent::BlockAccepted {
                index,
                total,
                frame_checksum,
                accumulated,
            } => {
                tracing::info!(
                    block = %format!("{}/{}", index + 1, total),
                    crc = %format!("{:04X}", frame_checksum),
                    total_crc = %format!("{:04X}", accumulated),
                    "Block accepted"
                );
            }
            FlashEvent::ExpectedReply { text } => {
                tracing::info!(expected = %text, "Waiting for reply");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Completed { success, message } => {
                if *success {
                    tracing::info!("{}", message);
                } else {
                    tracing::error!("{}", message);
                }
            }
        }
    }
}
