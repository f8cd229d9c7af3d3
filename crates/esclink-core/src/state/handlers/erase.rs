//! ERASE stage: one request, a long reply timeout, counted retries.

use std::time::Instant;

use tracing::info;

use super::{HandlerContext, printable, retry};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver};
use crate::protocol::command::{erase_reply, erase_request, erase_sectors};
use crate::state::machine::{FlashState, Stage, TimerKind};
use crate::transport::Transport;

pub(super) fn enter<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    ctx.enter(FlashState::Erase, now);
    let total = ctx.state.total_bytes();
    let sectors = erase_sectors(total);
    info!(bytes = total, sectors, "ERASE: requesting erase");
    send_request(ctx)?;
    ctx.progress(10, format!("Erasing {} sectors", sectors));
    ctx.expect(printable(&erase_reply(ctx.protocol)));
    ctx.state.arm(now, ctx.timing.erase_timeout, TimerKind::ReplyTimeout);
    Ok(())
}

pub(super) fn send_request<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), FlashError> {
    let payload = erase_request(ctx.state.total_bytes(), ctx.protocol);
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
    let expected = erase_reply(ctx.protocol);
    if payload != expected {
        let fault = ctx.mismatch(&expected, &payload);
        return retry::after_fault(ctx, fault, now);
    }
    ctx.emit(FlashEvent::ReplyAccepted {
        stage: Stage::Erase,
        expected: printable(&expected),
        actual: printable(&payload),
    });
    acknowledged(ctx, now)
}

pub(super) fn acknowledged<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    info!("ERASE: done");
    ctx.state.consecutive_errors = 0;
    super::program::begin(ctx, now)
}
