//! Progress reporting and cancellation for long-running analysis stages.
//! Loading a large trace container or attacking sixteen key bytes can take
//! minutes, so every such operation accepts a progress sink, and the CPA
//! attack additionally honours a cancellation token between key bytes.

use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receiver of progress updates for a named stage.
///
/// Implementations must be `Sync` because the CPA attack reports from
/// worker threads.
pub trait ProgressSink: Sync {
    /// Called with the number of completed units out of `total`.
    fn update(&self, stage: &str, done: usize, total: usize);
}

/// Discards all progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _stage: &str, _done: usize, _total: usize) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&str, usize, usize) + Sync,
{
    fn update(&self, stage: &str, done: usize, total: usize) {
        self(stage, done, total)
    }
}

const BAR_TEMPLATE: &str = "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} (ETA {eta})";

/// Terminal progress bar, cleared once the stage is done. Drawn on stderr
/// and hidden when stderr is not a terminal.
pub fn progress_bar() -> ProgressBar {
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::new(0)
        .with_style(style)
        .with_finish(ProgressFinish::AndClear)
}

impl ProgressSink for ProgressBar {
    fn update(&self, stage: &str, done: usize, total: usize) {
        if self.message() != stage {
            self.set_message(stage.to_string());
        }
        self.set_length(total as u64);
        self.set_position(done as u64);
    }
}

/// Shared flag used to stop a batch computation from launching further
/// tasks. Clones observe the same flag.
#[derive(Debug, Default, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Tasks already running are allowed to finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
