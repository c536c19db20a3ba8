//! Compile-time tunables. Overridable at runtime via [`crate::config::DmanConfig`].

use std::time::Duration;

/// Buffered-copy unit requested from the HTTP client per callback. Shapes
/// cancellation granularity: a `stop()` can be delayed by at most one chunk
/// of this size.
pub const LEN_CHECK: usize = 32 * 1024;

/// Minimum remaining eta a job must have before the splitter will cut it.
pub const MIN_CUT_ETA: Duration = Duration::from_secs(10);

/// Status aggregator tick interval.
pub const STAT_INTERVAL: Duration = Duration::from_millis(500);

/// Number of speed samples kept by the moving average.
pub const MOVING_AVG_LEN: usize = 5;

/// Eta reported when a job's speed sample is zero.
pub const LONG_TIME: Duration = Duration::from_secs(3 * 24 * 3600);

/// Default maximum concurrent workers for one download.
pub const DEFAULT_MAX_WORKERS: usize = 32;

/// Directory (sibling of the target file) holding part files and the
/// progress descriptor while a download is incomplete.
pub const PART_DIR_NAME: &str = ".dman";

/// Extension of the on-disk progress descriptor.
pub const PROGRESS_FILE_EXT: &str = "dman";

/// The runtime-resolved values of the tunables above, threaded into the
/// engine by whoever starts a download (normally derived from
/// [`crate::config::DmanConfig`]).
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    pub max_workers: usize,
    /// Buffer-size unit granted to a worker per permit (see `engine::worker`).
    pub len_check: usize,
    pub min_cut_eta: Duration,
    pub stat_interval: Duration,
    pub moving_avg_len: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            len_check: LEN_CHECK,
            min_cut_eta: MIN_CUT_ETA,
            stat_interval: STAT_INTERVAL,
            moving_avg_len: MOVING_AVG_LEN,
        }
    }
}
