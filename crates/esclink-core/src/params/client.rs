//! Parameter exchanges over a transport.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::codec::{
    ParamError, ReadResponse, ack_matches, ack_payload, build_read_request, build_write_frame,
    parse_ack, parse_read_response, validate_write,
};
use super::mapping::GroupMapping;
use crate::config::ProtocolConfig;
use crate::protocol::assembler::FrameAssembler;
use crate::protocol::constants::CMD_EXIT;
use crate::protocol::frame::{build_frame, frame_checksum, hex_upper, parse_frame};
use crate::transport::{Transport, TransportError};

const READ_CHUNK: usize = 256;

/// Device frames assembled from the transport until a deadline.
struct FrameReceiver<'t, T: ?Sized> {
    transport: &'t T,
    assembler: FrameAssembler,
    pending: VecDeque<Vec<u8>>,
    deadline: Instant,
}

impl<'t, T: Transport + ?Sized> FrameReceiver<'t, T> {
    fn new(transport: &'t T, cfg: &ProtocolConfig) -> Self {
        Self {
            transport,
            assembler: FrameAssembler::new(cfg),
            pending: VecDeque::new(),
            deadline: Instant::now() + Duration::from_millis(cfg.timeout_ms as u64),
        }
    }

    /// Next complete frame, or `None` once the deadline passes.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if Instant::now() >= self.deadline {
                return Ok(None);
            }
            match self.transport.read(READ_CHUNK) {
                Ok(bytes) => self.pending.extend(self.assembler.extend(&bytes)),
                Err(TransportError::Timeout { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Read every parameter of `group`. The response frame is acknowledged
/// with its checksum.
#[instrument(skip(transport, cfg))]
pub fn read_group<T: Transport + ?Sized>(
    transport: &T,
    group: &str,
    cfg: &ProtocolConfig,
) -> Result<ReadResponse, ParamError> {
    transport.clear_input()?;
    transport.write(&build_read_request(group, cfg))?;

    let mut receiver = FrameReceiver::new(transport, cfg);
    while let Some(frame) = receiver.next_frame()? {
        let payload = parse_frame(&frame, cfg)?;
        if parse_ack(payload, cfg).is_some() {
            debug!("Skipping acknowledgment while waiting for values");
            continue;
        }
        let response = parse_read_response(payload, cfg);
        if response.skipped > 0 {
            warn!(skipped = response.skipped, "Dropped malformed segments");
        }
        acknowledge(transport, &frame, cfg)?;
        info!(values = response.values.len(), "Group read");
        return Ok(response);
    }
    Err(ParamError::NoResponse {
        timeout_ms: cfg.timeout_ms,
    })
}

/// Send `{tx}REPLY:<checksum>;` for a received frame.
fn acknowledge<T: Transport + ?Sized>(
    transport: &T,
    frame: &[u8],
    cfg: &ProtocolConfig,
) -> Result<(), TransportError> {
    let checksum = frame_checksum(frame, cfg.checksum);
    transport.write(&build_frame(&ack_payload(checksum, cfg), cfg))?;
    debug!(checksum = %hex_upper(checksum), "Acknowledged frame");
    Ok(())
}

/// Validate and write `values` to `group`, then wait for the device to
/// acknowledge the frame's checksum. Nothing is sent when any value fails
/// validation.
#[instrument(skip(transport, values, mapping, cfg))]
pub fn write_group<T: Transport + ?Sized>(
    transport: &T,
    group: &str,
    values: &BTreeMap<String, f64>,
    mapping: &GroupMapping,
    cfg: &ProtocolConfig,
) -> Result<(), ParamError> {
    validate_write(group, values, mapping)?;
    let frame = build_write_frame(group, values, mapping, cfg);
    transport.clear_input()?;
    transport.write(&frame)?;
    let sent = frame_checksum(&frame, cfg.checksum);

    let mut receiver = FrameReceiver::new(transport, cfg);
    while let Some(reply) = receiver.next_frame()? {
        let payload = parse_frame(&reply, cfg)?;
        let Some(data) = parse_ack(payload, cfg) else {
            debug!("Skipping non-acknowledgment frame");
            continue;
        };
        if !ack_matches(data, sent) {
            return Err(ParamError::AckMismatch {
                expected: hex_upper(sent),
                actual: hex_upper(data),
            });
        }
        info!(values = values.len(), checksum = %hex_upper(sent), "Group written");
        return Ok(());
    }
    Err(ParamError::NoResponse {
        timeout_ms: cfg.timeout_ms,
    })
}

/// Send `{tx}EXIT;` to leave configuration mode.
pub fn send_exit<T: Transport + ?Sized>(
    transport: &T,
    cfg: &ProtocolConfig,
) -> Result<(), TransportError> {
    let payload = format!("{}{};", cfg.tx_prefix(), CMD_EXIT);
    transport.write(&build_frame(payload.as_bytes(), cfg))?;
    debug!("Sent EXIT");
    Ok(())
}
