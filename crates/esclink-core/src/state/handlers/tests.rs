use std::time::{Duration, Instant};

use super::*;
use crate::error::ErrorKind;
use crate::events::tests::RecordingObserver;
use crate::hex::{DataBlock, HexImage};
use crate::protocol::checksum::{checksum_bytes, checksum_value};
use crate::protocol::command::{program_request, reply_prefix, verify_request};
use crate::transport::MockTransport;

/// Drives the handlers with simulated time.
struct Harness {
    mock: MockTransport,
    observer: RecordingObserver,
    protocol: ProtocolConfig,
    timing: FlashTiming,
    state: FlashContext,
    now: Instant,
}

impl Harness {
    fn new(blocks: Vec<DataBlock>, debug_mode: bool) -> Self {
        Self {
            mock: MockTransport::new(),
            observer: RecordingObserver::default(),
            protocol: ProtocolConfig::default(),
            timing: FlashTiming::default(),
            state: FlashContext::new(blocks, debug_mode),
            now: Instant::now(),
        }
    }

    fn ctx(&mut self) -> HandlerContext<'_, MockTransport, RecordingObserver> {
        HandlerContext {
            transport: &self.mock,
            observer: &self.observer,
            protocol: &self.protocol,
            timing: &self.timing,
            state: &mut self.state,
        }
    }

    fn start(&mut self) -> HandleResult {
        let now = self.now;
        start(&mut self.ctx(), now)
    }

    fn reply_frame(&mut self, frame: &[u8]) -> HandleResult {
        let now = self.now;
        handle_frame(&mut self.ctx(), frame, now)
    }

    fn reply(&mut self, payload: &[u8]) -> HandleResult {
        let frame = build_frame(payload, &self.protocol);
        self.reply_frame(&frame)
    }

    /// A valid frame with a broken checksum.
    fn reply_corrupted(&mut self, payload: &[u8]) -> HandleResult {
        let mut frame = build_frame(payload, &self.protocol);
        if let Some(last) = frame.last_mut() {
            *last ^= 0xFF;
        }
        self.reply_frame(&frame)
    }

    /// Echo of the last frame's checksum, as the device sends it.
    fn echo(&self) -> Vec<u8> {
        let mut payload = reply_prefix(&self.protocol);
        payload.extend_from_slice(&self.state.last_sent_checksum);
        payload.push(b';');
        payload
    }

    fn ack_block(&mut self) -> HandleResult {
        let echo = self.echo();
        self.reply(&echo)
    }

    /// Jump to the pending deadline and handle it.
    fn fire(&mut self) -> HandleResult {
        let deadline = self.state.deadline().expect("no timer armed");
        self.now = deadline;
        let now = self.now;
        handle_timer(&mut self.ctx(), now)
    }

    fn advance(&mut self) -> HandleResult {
        let now = self.now;
        advance(&mut self.ctx(), now)
    }

    fn timer_kind(&self) -> Option<TimerKind> {
        self.state.timer.map(|t| t.kind)
    }

    fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.mock
            .get_writes()
            .iter()
            .map(|f| parse_frame(f, &self.protocol).unwrap().to_vec())
            .collect()
    }

    fn sent_with_prefix(&self, prefix: &[u8]) -> usize {
        self.sent_payloads()
            .iter()
            .filter(|p| p.starts_with(prefix))
            .count()
    }

    fn error(&self) -> &FlashError {
        match &self.state.outcome {
            Some(Err(e)) => e,
            other => panic!("expected failure, got {:?}", other),
        }
    }

    /// Run INIT and ERASE to the first PROGRAM frame.
    fn to_program(&mut self) {
        self.start();
        self.reply(b"#HEX;");
        self.reply(b"#HEX:ERASE;");
        assert_eq!(self.state.state, FlashState::WaitProgram);
    }

    /// Acknowledge every block and stop in WAIT_VERIFY.
    fn to_verify(&mut self) {
        self.to_program();
        while self.state.state == FlashState::WaitProgram {
            self.ack_block();
        }
        assert_eq!(self.state.state, FlashState::WaitVerify);
    }
}

fn image_blocks(len: u32, block_size: usize) -> Vec<DataBlock> {
    (0..len)
        .map(|i| (0x0800_0000 + i, (i * 7 % 251) as u8))
        .collect::<HexImage>()
        .data_blocks(block_size)
}

fn frame_checksum_of(block: &DataBlock, cfg: &ProtocolConfig) -> u16 {
    checksum_value(&checksum_bytes(&program_request(block, cfg), cfg.checksum))
}

#[test]
fn test_happy_path_two_blocks() {
    let blocks = image_blocks(4096, 2048);
    assert_eq!(blocks.len(), 2);
    let mut h = Harness::new(blocks.clone(), false);

    assert_eq!(h.start(), HandleResult::Continue);
    assert_eq!(h.state.state, FlashState::WaitInit);
    assert_eq!(h.sent_payloads()[0], b"!HEX;");

    h.reply(b"#HEX;");
    assert_eq!(h.state.state, FlashState::WaitErase);
    assert_eq!(h.sent_payloads()[1], b"!HEX:ESIZE2;");

    h.reply(b"#HEX:ERASE;");
    assert_eq!(h.state.state, FlashState::WaitProgram);
    assert_eq!(h.sent_payloads()[2], program_request(&blocks[0], &h.protocol));

    h.ack_block();
    assert_eq!(h.state.current_block, 1);
    h.ack_block();
    assert_eq!(h.state.state, FlashState::WaitVerify);

    let expected = blocks
        .iter()
        .map(|b| frame_checksum_of(b, &h.protocol))
        .fold(0u16, u16::wrapping_add);
    assert_eq!(h.state.accumulated, expected);
    assert_eq!(
        h.sent_payloads().last().unwrap(),
        &verify_request(expected, &h.protocol)
    );

    let result = h.reply(format!("#HEX:REPLY{:04X};", expected).as_bytes());
    assert_eq!(result, HandleResult::Finished);
    assert_eq!(h.state.state, FlashState::Success);
    assert!(matches!(h.state.outcome, Some(Ok(()))));
    assert_eq!(h.state.deadline(), None);

    // Late frames are dropped.
    assert_eq!(h.reply(b"#HEX;"), HandleResult::Ignored);
}

#[test]
fn test_progress_milestones() {
    let mut h = Harness::new(image_blocks(100, 2048), false);
    h.to_verify();
    let digits = format!("#HEX:REPLY{:04X};", h.state.accumulated);
    h.reply(digits.as_bytes());

    let percents: Vec<u8> = h
        .observer
        .events()
        .iter()
        .filter_map(|e| match e {
            FlashEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    for milestone in [5, 10, 95, 100] {
        assert!(percents.contains(&milestone), "missing {}%", milestone);
    }
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_init_resends_until_timeout() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.start();
    while h.state.timer.is_some() {
        assert_eq!(h.timer_kind(), Some(TimerKind::Resend));
        h.fire();
    }

    assert_eq!(h.mock.get_writes().len(), 100);
    assert!(matches!(
        h.error(),
        FlashError::TimeoutExceeded {
            stage: Stage::Init,
            elapsed_ms: 5000
        }
    ));
    assert_eq!(h.state.state, FlashState::Failed);
}

#[test]
fn test_init_wrong_reply_is_resent() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.start();
    h.reply(b"garbage;");
    h.reply(b"#HEX:ERASE;");

    assert_eq!(h.state.state, FlashState::WaitInit);
    assert_eq!(h.sent_with_prefix(b"!HEX;"), 3);
    assert_eq!(h.state.stats.format, 1);
    assert_eq!(h.state.stats.data, 1);
    assert_eq!(h.timer_kind(), Some(TimerKind::Resend));

    h.reply(b"#HEX;");
    assert_eq!(h.state.state, FlashState::WaitErase);
    assert_eq!(h.state.consecutive_errors, 0);
}

#[test]
fn test_erase_reply_timeouts_exhaust_retries() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.start();
    h.reply(b"#HEX;");
    while h.state.timer.is_some() {
        h.fire();
    }

    assert_eq!(h.sent_with_prefix(b"!HEX:ESIZE"), 15);
    let err = h.error();
    assert!(matches!(
        err,
        FlashError::RetriesExhausted {
            stage: Stage::Erase,
            attempts: 15,
            last_fault: None
        }
    ));
    assert_eq!(err.kind(), ErrorKind::TimeoutExceeded);
}

#[test]
fn test_erase_crc_failure_resends_immediately_once() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.start();
    h.reply(b"#HEX;");

    h.reply_corrupted(b"#HEX:ERASE;");
    assert_eq!(h.sent_with_prefix(b"!HEX:ESIZE"), 2);
    assert_eq!(h.timer_kind(), Some(TimerKind::ReplyTimeout));

    h.reply_corrupted(b"#HEX:ERASE;");
    assert_eq!(h.sent_with_prefix(b"!HEX:ESIZE"), 2);
    assert_eq!(h.timer_kind(), Some(TimerKind::DelayedResend));
    assert_eq!(h.state.stats.crc, 2);

    h.fire();
    assert_eq!(h.sent_with_prefix(b"!HEX:ESIZE"), 3);
    assert_eq!(h.timer_kind(), Some(TimerKind::ReplyTimeout));

    h.reply(b"#HEX:ERASE;");
    assert_eq!(h.state.state, FlashState::WaitProgram);
}

#[test]
fn test_erase_format_errors_hit_consecutive_limit() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.start();
    h.reply(b"#HEX;");
    for _ in 0..15 {
        h.reply(b"noise");
    }

    let err = h.error();
    assert!(matches!(
        err,
        FlashError::ConsecutiveErrorLimitExceeded {
            stage: Stage::Erase,
            count: 15,
            ..
        }
    ));
    assert_eq!(err.last_fault().unwrap().kind, FaultKind::FormatError);
}

#[test]
fn test_wrong_echo_hits_consecutive_limit() {
    let mut h = Harness::new(image_blocks(4096, 2048), false);
    h.to_program();

    for _ in 0..15 {
        let mut wrong = reply_prefix(&h.protocol);
        wrong.extend(h.state.last_sent_checksum.iter().map(|b| !b));
        wrong.push(b';');
        h.reply(&wrong);
    }

    let err = h.error();
    assert!(matches!(
        err,
        FlashError::ConsecutiveErrorLimitExceeded {
            stage: Stage::Program,
            count: 15,
            ..
        }
    ));
    assert_eq!(err.last_fault().unwrap().kind, FaultKind::DataMismatch);
    assert_eq!(h.state.current_block, 0);
    assert_eq!(h.state.accumulated, 0);
    assert_eq!(h.state.stats.data, 15);
    // Every fault resent the same block.
    assert_eq!(h.sent_with_prefix(b"!HEX:START"), 15);
}

#[test]
fn test_resent_block_counts_once() {
    let blocks = image_blocks(512, 2048);
    let mut h = Harness::new(blocks.clone(), false);
    h.to_program();

    h.fire();
    h.fire();
    assert_eq!(h.sent_with_prefix(b"!HEX:START"), 3);
    h.ack_block();

    assert_eq!(h.state.state, FlashState::WaitVerify);
    assert_eq!(h.state.accepted_checksums.len(), 1);
    assert_eq!(h.state.accumulated, frame_checksum_of(&blocks[0], &h.protocol));
}

#[test]
fn test_program_budget_falls_back_to_restart() {
    let mut h = Harness::new(image_blocks(4096, 2048), false);
    h.to_program();

    while h.timer_kind() == Some(TimerKind::Resend) {
        h.fire();
    }
    assert_eq!(h.timer_kind(), Some(TimerKind::RestartBlock));
    assert_eq!(h.state.retry_count, 1);
    assert_eq!(h.state.state, FlashState::WaitProgram);

    let before = h.sent_with_prefix(b"!HEX:START");
    h.fire();
    assert_eq!(h.sent_with_prefix(b"!HEX:START"), before + 1);
    assert_eq!(h.timer_kind(), Some(TimerKind::Resend));
    assert_eq!(h.state.stage_elapsed(h.now), Duration::ZERO);

    // The restarted block is still accepted normally.
    h.ack_block();
    assert_eq!(h.state.current_block, 1);
}

#[test]
fn test_late_program_fault_counts_once() {
    let mut h = Harness::new(image_blocks(4096, 2048), false);
    h.to_program();
    let consecutive = h.state.consecutive_errors;

    h.now += h.timing.program_timeout + Duration::from_millis(100);
    let mut wrong = reply_prefix(&h.protocol);
    wrong.extend(h.state.last_sent_checksum.iter().map(|b| !b));
    wrong.push(b';');
    h.reply(&wrong);

    assert_eq!(h.state.consecutive_errors, consecutive + 1);
    assert_eq!(h.state.retry_count, 1);
    assert_eq!(h.timer_kind(), Some(TimerKind::RestartBlock));
    assert_eq!(h.state.stats.data, 1);
}

#[test]
fn test_late_program_fault_keeps_fault_in_error() {
    let mut h = Harness::new(image_blocks(4096, 2048), false);
    h.timing.max_retries = 1;
    h.to_program();

    h.now += h.timing.program_timeout;
    let mut wrong = reply_prefix(&h.protocol);
    wrong.extend(h.state.last_sent_checksum.iter().map(|b| !b));
    wrong.push(b';');
    h.reply(&wrong);

    let err = h.error();
    assert!(matches!(
        err,
        FlashError::RetriesExhausted {
            stage: Stage::Program,
            attempts: 1,
            last_fault: Some(ProtocolFault {
                kind: FaultKind::DataMismatch,
                ..
            }),
        }
    ));
}

#[test]
fn test_verify_mismatch_resends_then_retries_after_delay() {
    let mut h = Harness::new(image_blocks(300, 2048), false);
    h.to_verify();
    let accumulated = h.state.accumulated;
    let sent = h.sent_with_prefix(b"!HEX:ENDCRC");

    // First mismatch resends at once.
    h.reply(format!("#HEX:REPLY{:04X};", accumulated ^ 1).as_bytes());
    assert_eq!(h.state.state, FlashState::WaitVerify);
    assert_eq!(h.sent_with_prefix(b"!HEX:ENDCRC"), sent + 1);
    assert_eq!(h.timer_kind(), Some(TimerKind::ReplyTimeout));
    assert_eq!(h.state.verify_retries, 1);
    assert_eq!(h.state.stats.data, 1);

    // Later ones wait the retry delay.
    h.reply(format!("#HEX:REPLY{:04X};", accumulated ^ 1).as_bytes());
    assert_eq!(h.sent_with_prefix(b"!HEX:ENDCRC"), sent + 1);
    assert_eq!(h.timer_kind(), Some(TimerKind::DelayedResend));
    assert_eq!(h.state.verify_retries, 2);

    h.fire();
    assert_eq!(h.sent_with_prefix(b"!HEX:ENDCRC"), sent + 2);

    let lower = format!("#HEX:REPLY{:04x};", accumulated);
    assert_eq!(h.reply(lower.as_bytes()), HandleResult::Finished);
    assert_eq!(h.state.state, FlashState::Success);
}

#[test]
fn test_verify_format_error_resends_immediately() {
    let mut h = Harness::new(image_blocks(300, 2048), false);
    h.to_verify();
    let sent = h.sent_with_prefix(b"!HEX:ENDCRC");

    h.reply(b"noise");
    assert_eq!(h.state.stats.format, 1);
    assert_eq!(h.sent_with_prefix(b"!HEX:ENDCRC"), sent + 1);
    assert_eq!(h.timer_kind(), Some(TimerKind::ReplyTimeout));
}

#[test]
fn test_debug_mode_advances_by_request() {
    let mut h = Harness::new(image_blocks(4096, 2048), true);
    h.start();
    assert_eq!(h.state.deadline(), None);

    // Replies are shown but never evaluated.
    assert_eq!(h.reply(b"#HEX;"), HandleResult::Ignored);
    assert_eq!(h.state.state, FlashState::WaitInit);

    let mut steps = 0;
    while h.advance() == HandleResult::Continue {
        assert_eq!(h.state.deadline(), None);
        steps += 1;
    }
    // ERASE, two blocks, VERIFY.
    assert_eq!(steps, 4);
    assert_eq!(h.state.state, FlashState::Success);
    assert_eq!(h.state.accepted_checksums.len(), 2);
    assert!(
        h.observer
            .events()
            .iter()
            .any(|e| matches!(e, FlashEvent::ExpectedReply { text } if text == "#HEX;"))
    );
}

#[test]
fn test_advance_ignored_outside_debug_mode() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.start();
    assert_eq!(h.advance(), HandleResult::Ignored);
    assert_eq!(h.state.state, FlashState::WaitInit);
}

#[test]
fn test_abort_stops_everything() {
    let mut h = Harness::new(image_blocks(4096, 2048), false);
    h.to_program();

    assert_eq!(abort(&mut h.ctx()), HandleResult::Finished);
    assert!(matches!(h.error(), FlashError::UserAborted));
    assert_eq!(h.state.deadline(), None);

    assert_eq!(h.ack_block(), HandleResult::Ignored);
    assert_eq!(abort(&mut h.ctx()), HandleResult::Ignored);
    let now = h.now + Duration::from_secs(10);
    assert_eq!(handle_timer(&mut h.ctx(), now), HandleResult::Ignored);
}

#[test]
fn test_empty_image_fails_without_writing() {
    let mut h = Harness::new(Vec::new(), false);
    assert_eq!(h.start(), HandleResult::Finished);
    assert!(matches!(h.error(), FlashError::EmptyImage));
    assert!(h.mock.get_writes().is_empty());
}

#[test]
fn test_write_failure_fails_session() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.mock.disconnect();
    assert_eq!(h.start(), HandleResult::Finished);
    assert_eq!(h.error().kind(), ErrorKind::Transport);
}

#[test]
fn test_timer_before_deadline_is_ignored() {
    let mut h = Harness::new(image_blocks(16, 2048), false);
    h.start();
    let early = h.now + Duration::from_millis(10);
    assert_eq!(handle_timer(&mut h.ctx(), early), HandleResult::Ignored);
    assert_eq!(h.mock.get_writes().len(), 1);
}

#[test]
fn test_printable() {
    assert_eq!(printable(b"#HEX;"), "#HEX;");
    assert_eq!(printable(&[b'#', 0x01, 0xFF]), "#\\x01\\xFF");
}
