//! Stage handlers - dispatch logic for replies, timers and debug steps.
//!
//! This module is split into submodules by stage:
//! - `init`: handshake
//! - `erase`: flash erase
//! - `program`: per-block programming and checksum accumulation
//! - `verify`: end-to-end ENDCRC check
//! - `retry`: the elapsed-time and count-bounded retry disciplines
//!
//! Every entry point takes the current instant so the machine can be
//! driven with simulated time.

mod erase;
mod init;
mod program;
mod retry;
mod verify;

use std::time::Instant;

use tracing::{debug, error, info};

use crate::config::ProtocolConfig;
use crate::error::{FaultKind, FlashError, ProtocolFault};
use crate::events::{FlashEvent, FlashObserver, LogLevel, PacketDirection};
use crate::protocol::command::is_device_reply;
use crate::protocol::frame::{FrameError, build_frame, frame_checksum, hex_upper, parse_frame};
use crate::state::machine::{FlashContext, FlashState, FlashTiming, Stage, TimerKind};
use crate::transport::Transport;

/// Result of handling one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Input acted on; the session continues.
    Continue,
    /// Input not applicable in the current state.
    Ignored,
    /// The session reached SUCCESS or FAILED.
    Finished,
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, T: Transport + ?Sized, O: FlashObserver + ?Sized> {
    pub transport: &'a T,
    pub observer: &'a O,
    pub protocol: &'a ProtocolConfig,
    pub timing: &'a FlashTiming,
    pub state: &'a mut FlashContext,
}

impl<'a, T: Transport + ?Sized, O: FlashObserver + ?Sized> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn progress(&self, percent: u8, message: impl Into<String>) {
        self.emit(FlashEvent::Progress {
            percent,
            message: message.into(),
        });
    }

    /// Debug-mode hint: the reply that would complete the current stage.
    pub(crate) fn expect(&self, reply: impl Into<String>) {
        if self.state.debug_mode {
            self.emit(FlashEvent::ExpectedReply { text: reply.into() });
        }
    }

    pub(crate) fn stage(&self) -> Stage {
        self.state.state.stage().unwrap_or(Stage::Init)
    }

    /// State transition with an event.
    pub(crate) fn goto(&mut self, next: FlashState) {
        let from = self.state.state;
        self.state.goto_state(next);
        self.emit(FlashEvent::StateChanged { from, to: next });
    }

    /// Enter a send state with a fresh retry counter and time budget.
    pub(crate) fn enter(&mut self, next: FlashState, now: Instant) {
        let from = self.state.state;
        self.state.enter_stage(next, now);
        self.emit(FlashEvent::StateChanged { from, to: next });
    }

    /// Frame and write a payload, remembering its checksum. Moves a send
    /// state to its waiting state.
    pub(crate) fn send(&mut self, payload: &[u8]) -> Result<(), FlashError> {
        let frame = build_frame(payload, self.protocol);
        self.transport.write(&frame)?;
        self.state.last_sent_checksum = frame_checksum(&frame, self.protocol.checksum).to_vec();
        self.emit(FlashEvent::Packet {
            direction: PacketDirection::Tx,
            stage: self.state.state.stage(),
            data: frame,
        });

        let waiting = match self.state.state {
            FlashState::Init => Some(FlashState::WaitInit),
            FlashState::Erase => Some(FlashState::WaitErase),
            FlashState::Program => Some(FlashState::WaitProgram),
            FlashState::Verify => Some(FlashState::WaitVerify),
            _ => None,
        };
        if let Some(waiting) = waiting {
            self.goto(waiting);
        }
        Ok(())
    }

    /// Record a rejected reply.
    pub(crate) fn fault(
        &mut self,
        kind: FaultKind,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> ProtocolFault {
        let fault = ProtocolFault {
            stage: self.stage(),
            kind,
            expected: expected.into(),
            actual: actual.into(),
        };
        self.state.stats.record(kind);
        self.state.last_fault = Some(fault.clone());
        self.emit(FlashEvent::Fault {
            fault: fault.clone(),
            stats: self.state.stats,
        });
        fault
    }

    /// Classify a reply that did not match `expected` exactly.
    pub(crate) fn mismatch(&mut self, expected: &[u8], payload: &[u8]) -> ProtocolFault {
        let kind = if is_device_reply(payload, self.protocol) {
            FaultKind::DataMismatch
        } else {
            FaultKind::FormatError
        };
        self.fault(kind, printable(expected), printable(payload))
    }

    /// Validate a received frame and return its payload.
    pub(crate) fn check_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>, ProtocolFault> {
        match parse_frame(frame, self.protocol) {
            Ok(payload) => Ok(payload.to_vec()),
            Err(FrameError::ChecksumMismatch { expected, actual }) => Err(self.fault(
                FaultKind::CrcMismatch,
                hex_upper(&expected),
                hex_upper(&actual),
            )),
            Err(FrameError::TooShort { actual, minimum }) => Err(self.fault(
                FaultKind::CrcMismatch,
                format!(">= {} bytes", minimum),
                format!("{} bytes", actual),
            )),
        }
    }

    /// Enter FAILED with `err`.
    pub(crate) fn fail(&mut self, err: FlashError) {
        if self.state.state.is_terminal() {
            return;
        }
        error!(state = %self.state.state, stats = %self.state.stats, "Flash failed: {}", err);
        let message = format!("Flash failed: {}", err);
        self.goto(FlashState::Failed);
        self.state.outcome = Some(Err(err));
        self.emit(FlashEvent::Completed {
            success: false,
            message,
        });
    }

    /// Enter SUCCESS.
    pub(crate) fn succeed(&mut self, now: Instant) {
        self.goto(FlashState::Success);
        self.state.outcome = Some(Ok(()));
        let elapsed = self
            .state
            .started
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        info!(
            blocks = self.state.blocks.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            stats = %self.state.stats,
            "Flash complete"
        );
        self.progress(100, "Flash complete");
        self.emit(FlashEvent::Completed {
            success: true,
            message: format!("Flash complete in {:.1}s", elapsed.as_secs_f64()),
        });
    }

    fn settle(&mut self, result: Result<(), FlashError>) -> HandleResult {
        if let Err(err) = result {
            self.fail(err);
        }
        if self.state.state.is_terminal() {
            HandleResult::Finished
        } else {
            HandleResult::Continue
        }
    }
}

/// Render a payload for fault messages: ASCII kept, other bytes as `\xNN`.
pub(crate) fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x20..=0x7E => (b as char).to_string(),
            _ => format!("\\x{:02X}", b),
        })
        .collect()
}

/// Begin a session: IDLE -> INIT, or FAILED when there is nothing to send.
pub fn start<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> HandleResult {
    if ctx.state.state != FlashState::Idle {
        return HandleResult::Ignored;
    }
    ctx.state.started = Some(now);
    let result = if ctx.state.blocks.is_empty() {
        Err(FlashError::EmptyImage)
    } else {
        info!(
            blocks = ctx.state.blocks.len(),
            bytes = ctx.state.total_bytes(),
            debug = ctx.state.debug_mode,
            "Starting flash"
        );
        init::enter(ctx, now)
    };
    ctx.settle(result)
}

/// Handle a frame assembled from the transport.
pub fn handle_frame<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    frame: &[u8],
    now: Instant,
) -> HandleResult {
    ctx.emit(FlashEvent::Packet {
        direction: PacketDirection::Rx,
        stage: ctx.state.state.stage(),
        data: frame.to_vec(),
    });

    if ctx.state.debug_mode {
        debug!("Debug mode, reply not evaluated");
        return HandleResult::Ignored;
    }
    if !ctx.state.state.awaits_reply() {
        debug!(state = %ctx.state.state, "Ignoring frame, no reply expected");
        return HandleResult::Ignored;
    }

    // A reply supersedes whatever timer was pending.
    ctx.state.cancel_timer();
    let result = match ctx.state.state {
        FlashState::WaitInit => init::on_reply(ctx, frame, now),
        FlashState::WaitErase => erase::on_reply(ctx, frame, now),
        FlashState::WaitProgram => program::on_reply(ctx, frame, now),
        FlashState::WaitVerify => verify::on_reply(ctx, frame, now),
        _ => return HandleResult::Ignored,
    };
    ctx.settle(result)
}

/// Handle the pending timer once its deadline has passed.
pub fn handle_timer<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> HandleResult {
    let Some(timer) = ctx.state.timer else {
        return HandleResult::Ignored;
    };
    if now < timer.deadline || ctx.state.state.is_terminal() {
        return HandleResult::Ignored;
    }
    ctx.state.cancel_timer();

    let result = match timer.kind {
        TimerKind::Resend => retry::on_resend_timer(ctx, now),
        TimerKind::ReplyTimeout => retry::on_reply_timeout(ctx, now),
        TimerKind::DelayedResend => retry::on_delayed_resend(ctx, now),
        TimerKind::RestartBlock => program::restart_block(ctx, now),
    };
    ctx.settle(result)
}

/// Debug mode: take the transition a successful reply would take.
pub fn advance<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    now: Instant,
) -> HandleResult {
    if !ctx.state.debug_mode {
        ctx.log(LogLevel::Warn, "Advance is only available in debug mode");
        return HandleResult::Ignored;
    }
    ctx.state.cancel_timer();
    let result = match ctx.state.state {
        FlashState::WaitInit => {
            ctx.log(LogLevel::Info, "Debug advance: INIT acknowledged");
            init::acknowledged(ctx, now)
        }
        FlashState::WaitErase => {
            ctx.log(LogLevel::Info, "Debug advance: ERASE acknowledged");
            erase::acknowledged(ctx, now)
        }
        FlashState::WaitProgram => {
            ctx.log(
                LogLevel::Info,
                format!("Debug advance: block {} acknowledged", ctx.state.current_block + 1),
            );
            program::acknowledged(ctx, now)
        }
        FlashState::WaitVerify => {
            ctx.log(LogLevel::Info, "Debug advance: VERIFY acknowledged");
            ctx.state.consecutive_errors = 0;
            ctx.succeed(now);
            Ok(())
        }
        other => {
            ctx.log(LogLevel::Debug, format!("Nothing to advance in {}", other));
            return HandleResult::Ignored;
        }
    };
    ctx.settle(result)
}

/// Stop the session: cancel the timer and fail with `UserAborted`.
pub fn abort<T: Transport + ?Sized, O: FlashObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    if ctx.state.state.is_terminal() {
        return HandleResult::Ignored;
    }
    ctx.state.cancel_timer();
    ctx.log(LogLevel::Warn, "Flash aborted by user");
    ctx.fail(FlashError::UserAborted);
    HandleResult::Finished
}

#[cfg(test)]
mod tests;
