use std::time::Duration;

/// Tuning knobs for the by-slice query driver.
///
/// All values are injected; nothing is read from the environment or from
/// config files.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Target upper bound on rows per query. The same value arms the
    /// same-timestamp safety rail in the deduplicator.
    pub buffer_size: usize,
    /// Upper bound on the idle sleep between live queries.
    pub refresh_interval: Duration,
    /// Forward queries refuse rows closer to the database clock than this,
    /// giving the database time to stabilize commit visibility.
    pub behind_current_time: Duration,
    /// Whether live queries may enter backtracking at all.
    pub backtracking_enabled: bool,
    /// Nominal span re-read by a backtracking query.
    pub backtracking_window: Duration,
    /// Visibility lag applied while backtracking.
    pub backtracking_behind_current_time: Duration,
    /// Consecutive empty queries before a live query flips into backtracking.
    pub backtracking_idle_threshold: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            refresh_interval: Duration::from_secs(3),
            behind_current_time: Duration::from_millis(100),
            backtracking_enabled: true,
            backtracking_window: Duration::from_secs(120),
            backtracking_behind_current_time: Duration::from_secs(10),
            backtracking_idle_threshold: 5,
        }
    }
}

impl QuerySettings {
    /// Forward/backtracking cursor gap that forces a backtracking round.
    pub fn half_backtracking_window(&self) -> Duration {
        self.backtracking_window / 2
    }

    /// Span of the very first backtracking query, which has no previous
    /// backtracking cursor to resume from.
    pub fn first_backtracking_window(&self) -> Duration {
        self.backtracking_window + self.backtracking_behind_current_time
    }
}
