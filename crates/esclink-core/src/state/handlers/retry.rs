//! Retry disciplines.
//!
//! INIT and PROGRAM are bounded by elapsed time: a periodic timer resends
//! the request and the stage fails (INIT) or falls back to a counted retry
//! (PROGRAM) once its budget is spent. ERASE and VERIFY are bounded by
//! attempt counts, with a reply timeout and a delay before each resend.
//! The first rejected VERIFY reply, and the first ERASE reply failing its
//! checksum, are resent at once.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::HandlerContext;
use crate::error::{FaultKind, FlashError, ProtocolFault};
use crate::events::FlashObserver;
use crate::state::machine::{FlashTiming, Stage, TimerKind};
use crate::transport::Transport;

fn is_time_bounded(stage: Stage) -> bool {
    matches!(stage, Stage::Init | Stage::Program)
}

fn budget(timing: &FlashTiming, stage: Stage) -> Duration {
    match stage {
        Stage::Init => timing.init_timeout,
        Stage::Program => timing.program_timeout,
        Stage::Erase => timing.erase_timeout,
        Stage::Verify => timing.verify_timeout,
    }
}

fn resend_delay(timing: &FlashTiming, stage: Stage) -> Duration {
    match stage {
        Stage::Init => timing.init_retry_delay,
        Stage::Program => timing.program_retry_delay,
        Stage::Erase => timing.erase_retry_delay,
        Stage::Verify => timing.verify_retry_delay,
    }
}

/// Send the current stage's request again.
fn resend<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), FlashError> {
    match ctx.stage() {
        Stage::Init => super::init::send_request(ctx),
        Stage::Erase => super::erase::send_request(ctx),
        Stage::Program => super::program::send_request(ctx),
        Stage::Verify => super::verify::send_request(ctx),
    }
}

/// Periodic resend timer of a time-bounded stage.
pub(super) fn on_resend_timer<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    let stage = ctx.stage();
    let elapsed = ctx.state.stage_elapsed(now);
    if elapsed >= budget(ctx.timing, stage) {
        return budget_exhausted(ctx, stage, None, elapsed, now);
    }
    debug!(stage = %stage, elapsed_ms = elapsed.as_millis() as u64, "Periodic resend");
    resend(ctx)?;
    ctx.state
        .arm(now, resend_delay(ctx.timing, stage), TimerKind::Resend);
    Ok(())
}

fn budget_exhausted<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    stage: Stage,
    fault: Option<ProtocolFault>,
    elapsed: Duration,
    now: Instant,
) -> Result<(), FlashError> {
    let elapsed_ms = elapsed.as_millis() as u64;
    if stage == Stage::Program {
        warn!(
            block = ctx.state.current_block,
            elapsed_ms, "Block not acknowledged in time, falling back to counted retry"
        );
        return counted_retry(ctx, stage, fault, now);
    }
    Err(FlashError::TimeoutExceeded { stage, elapsed_ms })
}

/// A reply was rejected.
pub(super) fn after_fault<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    fault: ProtocolFault,
    now: Instant,
) -> Result<(), FlashError> {
    let stage = fault.stage;
    if !is_time_bounded(stage) {
        return counted_retry(ctx, stage, Some(fault), now);
    }

    // A spent budget hands the fault to the counted discipline, which does
    // its own counting.
    let elapsed = ctx.state.stage_elapsed(now);
    if elapsed >= budget(ctx.timing, stage) {
        return budget_exhausted(ctx, stage, Some(fault), elapsed, now);
    }

    ctx.state.consecutive_errors += 1;
    let count = ctx.state.consecutive_errors;
    if count >= ctx.timing.max_consecutive_errors {
        return Err(FlashError::ConsecutiveErrorLimitExceeded {
            stage,
            count,
            last_fault: Some(fault),
        });
    }

    warn!(stage = %stage, consecutive = count, "Resending after {}", fault.kind);
    resend(ctx)?;
    ctx.state
        .arm(now, resend_delay(ctx.timing, stage), TimerKind::Resend);
    Ok(())
}

/// No reply to ERASE or VERIFY within the stage timeout.
pub(super) fn on_reply_timeout<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    let stage = ctx.stage();
    warn!(stage = %stage, "No reply within {}ms", budget(ctx.timing, stage).as_millis());
    counted_retry(ctx, stage, None, now)
}

/// The delay after a counted retry elapsed: resend and wait for a reply.
pub(super) fn on_delayed_resend<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> Result<(), FlashError> {
    let stage = ctx.stage();
    debug!(stage = %stage, "Delayed resend");
    resend(ctx)?;
    ctx.state
        .arm(now, budget(ctx.timing, stage), TimerKind::ReplyTimeout);
    Ok(())
}

/// Count-bounded discipline shared by ERASE, VERIFY and the PROGRAM
/// fallback.
fn counted_retry<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    stage: Stage,
    fault: Option<ProtocolFault>,
    now: Instant,
) -> Result<(), FlashError> {
    let timing = ctx.timing;
    // VERIFY resends at once after any first fault; ERASE only after a
    // checksum failure.
    let immediate = match &fault {
        Some(_) if stage == Stage::Verify => true,
        Some(fault) => fault.kind == FaultKind::CrcMismatch,
        None => false,
    };

    let attempts = if stage == Stage::Verify {
        ctx.state.verify_retries += 1;
        let attempts = ctx.state.verify_retries;
        if attempts >= timing.max_verify_retries {
            return Err(FlashError::RetriesExhausted {
                stage,
                attempts,
                last_fault: fault,
            });
        }
        attempts
    } else {
        ctx.state.retry_count += 1;
        ctx.state.consecutive_errors += 1;
        let attempts = ctx.state.retry_count;
        let consecutive = ctx.state.consecutive_errors;
        if fault.is_some() && consecutive >= timing.max_consecutive_errors {
            return Err(FlashError::ConsecutiveErrorLimitExceeded {
                stage,
                count: consecutive,
                last_fault: fault,
            });
        }
        if attempts >= timing.max_retries || consecutive >= timing.max_consecutive_errors {
            return Err(FlashError::RetriesExhausted {
                stage,
                attempts,
                last_fault: fault.or_else(|| ctx.state.last_fault.clone()),
            });
        }
        attempts
    };

    if stage == Stage::Program {
        warn!(
            block = ctx.state.current_block,
            attempt = attempts,
            "Restarting block after {}ms",
            timing.program_fallback_delay.as_millis()
        );
        ctx.state
            .arm(now, timing.program_fallback_delay, TimerKind::RestartBlock);
        return Ok(());
    }

    if immediate && attempts == 1 {
        warn!(stage = %stage, "Rejected reply, resending immediately");
        resend(ctx)?;
        ctx.state
            .arm(now, budget(timing, stage), TimerKind::ReplyTimeout);
    } else {
        let delay = resend_delay(timing, stage);
        warn!(stage = %stage, attempt = attempts, "Retrying in {}ms", delay.as_millis());
        ctx.state.arm(now, delay, TimerKind::DelayedResend);
    }
    Ok(())
}
