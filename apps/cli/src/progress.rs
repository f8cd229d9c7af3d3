//! Progress bar front end for flash sessions.

use esclink_core::{FlashEvent, FlashObserver, TracingObserver};
use indicatif::{ProgressBar, ProgressStyle};

/// Drives an `indicatif` bar from session events. Everything is also
/// forwarded to tracing with the bar suspended so log lines don't tear it.
pub struct ProgressObserver {
    bar: ProgressBar,
    debug_mode: bool,
}

impl ProgressObserver {
    pub fn new(debug_mode: bool) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar, debug_mode }
    }
}

impl FlashObserver for ProgressObserver {
    fn on_event(&self, event: &FlashEvent) {
        self.bar.suspend(|| TracingObserver.on_event(event));

        match event {
            FlashEvent::Progress { percent, message } => {
                self.bar.set_position(u64::from(*percent));
                self.bar.set_message(message.clone());
            }
            FlashEvent::ExpectedReply { text } if self.debug_mode => {
                self.bar.suspend(|| {
                    eprintln!("Expecting {} - press Enter to advance, q to abort", text)
                });
            }
            FlashEvent::Completed { success, message } => {
                if *success {
                    self.bar.finish_with_message(message.clone());
                } else {
                    self.bar.abandon_with_message(message.clone());
                }
            }
            _ => {}
        }
    }
}
