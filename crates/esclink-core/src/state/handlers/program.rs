//! PROGRAM stage: one frame per block, each acknowledged by an echo of the
//! frame's own checksum.
//!
//! The echoed checksum is added to the integrity accumulator only when the
//! block is acknowledged, so resends of a block never count twice.

use std::time::Instant;

use tracing::{debug, info};

use super::{HandlerContext, printable, retry};
use crate::error::{FaultKind, FlashError};
use crate::events::{FlashEvent, FlashObserver};
use crate::protocol::checksum::checksum_value;
use crate::protocol::command::{program_reply_echo, program_request, reply_prefix};
use crate::protocol::frame::hex_upper;
use crate::state::machine::{FlashState, Stage, TimerKind};
use crate::transport::Transport;

/// Start programming from the first block with a zeroed accumulator.
pub(super) fn begin<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    ctx.state.reset_accumulator();
    info!(blocks = ctx.state.blocks.len(), "PROGRAM: starting");
    send_block(ctx, now)
}

/// Enter PROGRAM for the current block, or move on to VERIFY.
fn send_block<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    ctx.enter(FlashState::Program, now);
    if ctx.state.current().is_none() {
        info!("PROGRAM: all blocks sent");
        return super::verify::enter(ctx, now);
    }

    send_request(ctx)?;
    let index = ctx.state.current_block;
    let total = ctx.state.blocks.len();
    ctx.progress(
        ctx.state.program_percent(),
        format!("Programming block {}/{}", index + 1, total),
    );
    ctx.expect(format!(
        "{}[{}];",
        printable(&reply_prefix(ctx.protocol)),
        hex_upper(&ctx.state.last_sent_checksum)
    ));
    ctx.state
        .arm(now, ctx.timing.program_retry_delay, TimerKind::Resend);
    Ok(())
}

pub(super) fn send_request<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), FlashError> {
    let Some(block) = ctx.state.current() else {
        return Ok(());
    };
    debug!(
        block = ctx.state.current_block,
        address = %format!("{:08X}", block.address),
        len = block.len(),
        "Sending block"
    );
    let payload = program_request(block, ctx.protocol);
    ctx.send(&payload)
}

/// Resend the current block with a fresh elapsed-time budget.
pub(super) fn restart_block<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    info!(
        block = ctx.state.current_block,
        retry = ctx.state.retry_count,
        "PROGRAM: restarting block"
    );
    ctx.state.restart_budget(now);
    send_request(ctx)?;
    ctx.state
        .arm(now, ctx.timing.program_retry_delay, TimerKind::Resend);
    Ok(())
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
    let sent = ctx.state.last_sent_checksum.clone();

    let fault = match program_reply_echo(&payload, ctx.protocol) {
        None => ctx.fault(
            FaultKind::FormatError,
            format!("{}[{}];", printable(&reply_prefix(ctx.protocol)), hex_upper(&sent)),
            printable(&payload),
        ),
        Some(echo) if echo != sent.as_slice() => {
            ctx.fault(FaultKind::DataMismatch, hex_upper(&sent), hex_upper(echo))
        }
        Some(_) => {
            ctx.emit(FlashEvent::ReplyAccepted {
                stage: Stage::Program,
                expected: hex_upper(&sent),
                actual: hex_upper(&sent),
            });
            return acknowledged(ctx, now);
        }
    };
    retry::after_fault(ctx, fault, now)
}

/// Count the block and move to the next one.
pub(super) fn acknowledged<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    let frame_checksum = checksum_value(&ctx.state.last_sent_checksum);
    let accumulated = ctx.state.accumulate(frame_checksum);
    ctx.state.consecutive_errors = 0;
    ctx.emit(FlashEvent::BlockAccepted {
        index: ctx.state.current_block,
        total: ctx.state.blocks.len(),
        frame_checksum,
        accumulated,
    });
    ctx.state.current_block += 1;
    send_block(ctx, now)
}
