//! Wall-clock budgeting for the waiting phases of one invocation.
//!
//! Every phase that waits (page results, searchable merge) recomputes its
//! budget from the same deadline, after setting aside time for the steps
//! that must still run once it is done.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::Settings;

/// Hard end of the current invocation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// `remaining` minus every reserved duration, or `None` when nothing is left.
pub fn compute_wait_budget(remaining: Duration, reserved: &[Duration]) -> Option<Duration> {
    let reserved: Duration = reserved.iter().sum();
    remaining
        .checked_sub(reserved)
        .filter(|budget| !budget.is_zero())
}

/// Fixed reservations for the steps after each waiting phase.
#[derive(Debug, Clone, Copy)]
pub struct Reserves {
    pub merge_searchable: Duration,
    pub return_results: Duration,
    pub output_wait_buffer: Duration,
}

impl Reserves {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            merge_searchable: settings.merge_searchable_duration,
            return_results: settings.return_results_duration,
            output_wait_buffer: settings.output_wait_buffer,
        }
    }

    /// Budget for waiting on page results.
    pub fn page_wait(&self, remaining: Duration, create_searchable: bool) -> Option<Duration> {
        let mut reserved = vec![self.return_results, self.output_wait_buffer];
        if create_searchable {
            reserved.push(self.merge_searchable);
        }
        compute_wait_budget(remaining, &reserved)
    }

    /// Budget for assembling and merging the searchable output.
    pub fn merge(&self, remaining: Duration) -> Option<Duration> {
        compute_wait_budget(remaining, &[self.return_results])
    }
}
