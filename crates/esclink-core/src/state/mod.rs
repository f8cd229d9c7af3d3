//! Flash state machine and reply handlers.

pub mod handlers;
pub mod machine;

pub use handlers::{HandleResult, HandlerContext};
pub use machine::{FlashContext, FlashOptions, FlashState, FlashTiming, Stage, TimerKind};
