//! State machine implementation for the flash protocol.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{ErrorStats, FlashError, ProtocolFault};
use crate::hex::DataBlock;
use crate::protocol::constants::DEFAULT_BLOCK_SIZE;

/// State of a flash session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashState {
    #[default]
    Idle,
    Init,
    WaitInit,
    Erase,
    WaitErase,
    Program,
    WaitProgram,
    Verify,
    WaitVerify,
    Success,
    Failed,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashState::Idle => write!(f, "IDLE"),
            FlashState::Init => write!(f, "INIT"),
            FlashState::WaitInit => write!(f, "WAIT_INIT"),
            FlashState::Erase => write!(f, "ERASE"),
            FlashState::WaitErase => write!(f, "WAIT_ERASE"),
            FlashState::Program => write!(f, "PROGRAM"),
            FlashState::WaitProgram => write!(f, "WAIT_PROGRAM"),
            FlashState::Verify => write!(f, "VERIFY"),
            FlashState::WaitVerify => write!(f, "WAIT_VERIFY"),
            FlashState::Success => write!(f, "SUCCESS"),
            FlashState::Failed => write!(f, "FAILED"),
        }
    }
}

impl FlashState {
    /// SUCCESS and FAILED end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlashState::Success | FlashState::Failed)
    }

    /// Whether a reply from the device is expected in this state.
    pub fn awaits_reply(&self) -> bool {
        matches!(
            self,
            FlashState::WaitInit
                | FlashState::WaitErase
                | FlashState::WaitProgram
                | FlashState::WaitVerify
        )
    }

    /// Protocol stage this state belongs to.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            FlashState::Init | FlashState::WaitInit => Some(Stage::Init),
            FlashState::Erase | FlashState::WaitErase => Some(Stage::Erase),
            FlashState::Program | FlashState::WaitProgram => Some(Stage::Program),
            FlashState::Verify | FlashState::WaitVerify => Some(Stage::Verify),
            _ => None,
        }
    }

    /// Transition table. FAILED is reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: FlashState) -> bool {
        use FlashState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Init)
                | (Init, WaitInit)
                | (WaitInit, Erase)
                | (Erase, WaitErase)
                | (WaitErase, Program)
                | (Program, WaitProgram)
                | (WaitProgram, Program)
                | (Program, Verify)
                | (Verify, WaitVerify)
                | (WaitVerify, Success)
        )
    }
}

/// One request/reply phase of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Erase,
    Program,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "INIT"),
            Stage::Erase => write!(f, "ERASE"),
            Stage::Program => write!(f, "PROGRAM"),
            Stage::Verify => write!(f, "VERIFY"),
        }
    }
}

/// Retry and timeout budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTiming {
    pub init_retry_delay: Duration,
    pub init_timeout: Duration,
    pub program_retry_delay: Duration,
    pub program_timeout: Duration,
    pub program_fallback_delay: Duration,
    pub erase_timeout: Duration,
    pub erase_retry_delay: Duration,
    pub verify_timeout: Duration,
    pub verify_retry_delay: Duration,
    pub max_retries: u32,
    pub max_consecutive_errors: u32,
    pub max_verify_retries: u32,
}

impl Default for FlashTiming {
    fn default() -> Self {
        Self {
            init_retry_delay: Duration::from_millis(50),
            init_timeout: Duration::from_millis(5000),
            program_retry_delay: Duration::from_millis(50),
            program_timeout: Duration::from_millis(2000),
            program_fallback_delay: Duration::from_millis(1000),
            erase_timeout: Duration::from_millis(10_000),
            erase_retry_delay: Duration::from_millis(1000),
            verify_timeout: Duration::from_millis(2000),
            verify_retry_delay: Duration::from_millis(500),
            max_retries: 20,
            max_consecutive_errors: 15,
            max_verify_retries: 30,
        }
    }
}

/// Session options chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOptions {
    pub block_size: usize,
    /// Send frames but never act on replies or timers; stages advance only
    /// through an explicit advance request.
    pub debug_mode: bool,
    pub timing: FlashTiming,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            debug_mode: false,
            timing: FlashTiming::default(),
        }
    }
}

/// What a pending deadline does when it elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Periodic resend in INIT or PROGRAM.
    Resend,
    /// No reply to ERASE or VERIFY in time.
    ReplyTimeout,
    /// Deferred resend after a counted retry.
    DelayedResend,
    /// Resend the current block with a fresh elapsed-time budget.
    RestartBlock,
}

/// The single pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub deadline: Instant,
    pub kind: TimerKind,
}

/// Runtime state of one flash session.
#[derive(Debug, Default)]
pub struct FlashContext {
    /// Current state.
    pub state: FlashState,
    pub blocks: Vec<DataBlock>,
    /// Index of the block being programmed.
    pub current_block: usize,
    /// Checksum trailer of the last frame written.
    pub last_sent_checksum: Vec<u8>,
    /// Wrapping sum of acknowledged PROGRAM frame checksums.
    pub accumulated: u16,
    /// Frame checksum of every acknowledged block, in order.
    pub accepted_checksums: Vec<u16>,
    /// Attempts in the current stage entry.
    pub retry_count: u32,
    /// Faults since the last successful acknowledgment.
    pub consecutive_errors: u32,
    pub verify_retries: u32,
    pub stats: ErrorStats,
    pub last_fault: Option<ProtocolFault>,
    pub stage_started: Option<Instant>,
    pub started: Option<Instant>,
    pub timer: Option<PendingTimer>,
    pub debug_mode: bool,
    /// Set when the session reaches a terminal state.
    pub outcome: Option<Result<(), FlashError>>,
}

impl FlashContext {
    pub fn new(blocks: Vec<DataBlock>, debug_mode: bool) -> Self {
        Self {
            blocks,
            debug_mode,
            ..Self::default()
        }
    }

    /// Transition to a new state. Any pending timer is dropped.
    pub fn goto_state(&mut self, new_state: FlashState) {
        debug_assert!(
            self.state.can_transition_to(new_state),
            "illegal transition {} -> {}",
            self.state,
            new_state
        );
        info!(from = %self.state, to = %new_state, "State transition");
        self.timer = None;
        self.state = new_state;
    }

    /// Enter a send state, resetting the per-entry retry counter and the
    /// elapsed-time budget.
    pub fn enter_stage(&mut self, state: FlashState, now: Instant) {
        self.goto_state(state);
        self.retry_count = 0;
        self.stage_started = Some(now);
    }

    /// Restart the elapsed-time budget without a state change.
    pub fn restart_budget(&mut self, now: Instant) {
        self.stage_started = Some(now);
    }

    pub fn stage_elapsed(&self, now: Instant) -> Duration {
        self.stage_started
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    /// Arm the single pending timer, replacing any previous one. No-op in
    /// debug mode.
    pub fn arm(&mut self, now: Instant, delay: Duration, kind: TimerKind) {
        if self.debug_mode {
            return;
        }
        debug!(?kind, delay_ms = delay.as_millis() as u64, "Timer armed");
        self.timer = Some(PendingTimer {
            deadline: now + delay,
            kind,
        });
    }

    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// When the pending timer fires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    /// Total bytes across all blocks.
    pub fn total_bytes(&self) -> usize {
        self.blocks.iter().map(DataBlock::len).sum()
    }

    pub fn current(&self) -> Option<&DataBlock> {
        self.blocks.get(self.current_block)
    }

    /// Reset the integrity accumulator; done once, when PROGRAM begins.
    pub fn reset_accumulator(&mut self) {
        self.accumulated = 0;
        self.accepted_checksums.clear();
        self.current_block = 0;
    }

    /// Add `frame_checksum` to the accumulator and return the new value.
    pub fn accumulate(&mut self, frame_checksum: u16) -> u16 {
        self.accumulated = self.accumulated.wrapping_add(frame_checksum);
        self.accepted_checksums.push(frame_checksum);
        self.accumulated
    }

    /// Program progress mapped onto 10..=90 percent.
    pub fn program_percent(&self) -> u8 {
        if self.blocks.is_empty() {
            return 90;
        }
        (10 + self.current_block * 80 / self.blocks.len()) as u8
    }
}
