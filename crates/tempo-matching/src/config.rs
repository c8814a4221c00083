// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching service tuning knobs.

use std::time::Duration;

/// Maximum requests queued on a task writer before submissions are rejected
/// with a service-busy error.
pub const OUTSTANDING_TASK_APPENDS_THRESHOLD: usize = 250;

/// Maximum number of appends committed in one batch.
pub const MAX_TASK_BATCH_SIZE: usize = 100;

/// Size of the task id block a task list lease covers.
pub const TASK_LIST_RANGE_SIZE: i64 = 100_000;

/// Per-task-list configuration.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Writer input queue capacity; the backpressure threshold.
    pub outstanding_task_appends_threshold: usize,
    /// Maximum appends per commit batch.
    pub max_task_batch_size: usize,
    /// Task id block size per lease epoch.
    pub range_size: i64,
    /// Tasks fetched per reader scan.
    pub read_batch_size: usize,
    /// How long the reader waits for a poller before skipping a task.
    pub dispatch_timeout: Duration,
    /// Reader wake-up interval when no new-task notification arrives.
    pub idle_scan_interval: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            outstanding_task_appends_threshold: OUTSTANDING_TASK_APPENDS_THRESHOLD,
            max_task_batch_size: MAX_TASK_BATCH_SIZE,
            range_size: TASK_LIST_RANGE_SIZE,
            read_batch_size: 100,
            dispatch_timeout: Duration::from_secs(10),
            idle_scan_interval: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_protocol_constants() {
        let config = MatchingConfig::default();
        assert_eq!(config.outstanding_task_appends_threshold, 250);
        assert_eq!(config.max_task_batch_size, 100);
        assert_eq!(config.range_size, 100_000);
    }
}
