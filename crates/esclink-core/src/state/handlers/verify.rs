//! VERIFY stage: send the accumulated checksum, expect it back as hex.

use std::time::Instant;

use tracing::{debug, info};

use super::{HandlerContext, printable, retry};
use crate::error::{FaultKind, FlashError};
use crate::events::{FlashEvent, FlashObserver};
use crate::protocol::command::{verify_reply_digits, verify_reply_text, verify_request};
use crate::state::machine::{FlashState, Stage, TimerKind};
use crate::transport::Transport;

pub(super) fn enter<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    ctx.enter(FlashState::Verify, now);
    ctx.state.verify_retries = 0;

    for (row, chunk) in ctx.state.accepted_checksums.chunks(8).enumerate() {
        let line: Vec<String> = chunk.iter().map(|c| format!("{:04X}", c)).collect();
        debug!(row, "Block checksums: {}", line.join(" "));
    }
    let accumulated = ctx.state.accumulated;
    info!(total_crc = %format!("{:04X}", accumulated), "VERIFY: sending ENDCRC");

    send_request(ctx)?;
    ctx.progress(95, "Verifying");
    ctx.expect(verify_reply_text(accumulated, ctx.protocol));
    ctx.state
        .arm(now, ctx.timing.verify_timeout, TimerKind::ReplyTimeout);
    Ok(())
}

pub(super) fn send_request<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), FlashError> {
    let payload = verify_request(ctx.state.accumulated, ctx.protocol);
    ctx.send(&payload)
}

pub(super) fn on_reply<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    frame: &[u8],
    now: Instant,
) -> Result<(), FlashError> {
    let payload = match ctx.check_frame(frame) {
        Ok(payload) => payload,
        Err(fault) => return retry::after_fault(ctx, fault, now),
    };
    let expected = format!("{:04X}", ctx.state.accumulated);

    let fault = match verify_reply_digits(&payload, ctx.protocol) {
        None => ctx.fault(
            FaultKind::FormatError,
            verify_reply_text(ctx.state.accumulated, ctx.protocol),
            printable(&payload),
        ),
        Some(digits) if digits != expected => ctx.fault(FaultKind::DataMismatch, expected, digits),
        Some(digits) => {
            ctx.emit(FlashEvent::ReplyAccepted {
                stage: Stage::Verify,
                expected,
                actual: digits,
            });
            ctx.state.consecutive_errors = 0;
            ctx.succeed(now);
            return Ok(());
        }
    };
    retry::after_fault(ctx, fault, now)
}
