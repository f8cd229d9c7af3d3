//! INIT stage: handshake, resent periodically until answered.

use std::time::Instant;

use tracing::info;

use super::{HandlerContext, printable, retry};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver};
use crate::protocol::command::{init_reply, init_request};
use crate::state::machine::{FlashState, Stage, TimerKind};
use crate::transport::Transport;

pub(super) fn enter<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    ctx.enter(FlashState::Init, now);
    info!("INIT: sending handshake");
    send_request(ctx)?;
    ctx.progress(5, "Waiting for device handshake");
    ctx.expect(printable(&init_reply(ctx.protocol)));
    ctx.state.arm(now, ctx.timing.init_retry_delay, TimerKind::Resend);
    Ok(())
}

pub(super) fn send_request<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), FlashError> {
    let payload = init_request(ctx.protocol);
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
    let expected = init_reply(ctx.protocol);
    if payload != expected {
        let fault = ctx.mismatch(&expected, &payload);
        return retry::after_fault(ctx, fault, now);
    }
    ctx.emit(FlashEvent::ReplyAccepted {
        stage: Stage::Init,
        expected: printable(&expected),
        actual: printable(&payload),
    });
    acknowledged(ctx, now)
}

pub(super) fn acknowledged<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    info!("INIT: device answered");
    ctx.state.consecutive_errors = 0;
    super::erase::enter(ctx, now)
}
