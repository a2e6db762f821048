//! Version-chain merging (garbage collection of acknowledged maps).
//!
//! - [`MergeScheduler`]: backs off while merges find nothing to fold and
//!   speeds up while they do.
//! - [`Merger`]: an acknowledger walk that settles each branch's
//!   acknowledged index and folds maps below the reader horizon into the
//!   branch's base state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fabric_error::Result;

use crate::acknowledger::{AckVisitor, Visit, WalkOutcome, Walker};
use crate::branch::Branch;
use crate::config::FabricConfig;
use crate::version_map::VersionMap;

/// Wait between merges once they stop folding anything.
pub const MERGE_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest wait between merges.
pub const MERGE_BUSY_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// MergeScheduler
// ---------------------------------------------------------------------------

/// Spacing of merge ticks, driven by what the previous tick achieved.
///
/// A tick that folded maps or ran out of budget halves the wait; an empty
/// tick doubles it. The wait stays within
/// [`MERGE_BUSY_INTERVAL`]..=[`MERGE_IDLE_INTERVAL`]. A backlog past the
/// trim threshold cuts an idle wait short.
#[derive(Debug, Clone)]
pub struct MergeScheduler {
    interval: Duration,
    next_due: Option<Instant>,
}

impl MergeScheduler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interval: MERGE_IDLE_INTERVAL,
            next_due: None,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a merge should run at `now` given `backlog` foldable maps
    /// (see [`merge_backlog`]).
    #[must_use]
    pub fn is_due(&self, now: Instant, backlog: usize) -> bool {
        match self.next_due {
            None => true,
            Some(due) => now >= due || (backlog > 0 && self.interval == MERGE_IDLE_INTERVAL),
        }
    }

    /// Account for a finished tick and schedule the next one.
    pub fn record(&mut self, now: Instant, result: &MergeTickResult) {
        self.interval = if result.maps_folded > 0 || result.budget_exhausted {
            (self.interval / 2).max(MERGE_BUSY_INTERVAL)
        } else {
            (self.interval * 2).min(MERGE_IDLE_INTERVAL)
        };
        self.next_due = Some(now + self.interval);
    }
}

impl Default for MergeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps held past `threshold`, summed over `branches`.
#[must_use]
pub fn merge_backlog(branches: &[Arc<Branch>], threshold: u32) -> usize {
    branches
        .iter()
        .map(|b| b.snapshot().version_map_count().saturating_sub(threshold as usize))
        .sum()
}

// ---------------------------------------------------------------------------
// Merger
// ---------------------------------------------------------------------------

/// Outcome of one [`Merger::tick`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeTickResult {
    pub branches_visited: u32,
    pub branches_merged: u32,
    pub maps_folded: usize,
    /// Whether the walker ran out of budget with branches left.
    pub budget_exhausted: bool,
}

#[derive(Debug)]
struct MergePass {
    threshold: u32,
    result: MergeTickResult,
}

impl AckVisitor for MergePass {
    fn visit_map(&mut self, _branch: &Arc<Branch>, _map: &Arc<VersionMap>) -> Result<Visit> {
        Ok(Visit::Done)
    }

    fn finish_branch(&mut self, branch: &Arc<Branch>) -> Result<()> {
        self.result.branches_visited += 1;
        branch.settle_acknowledged()?;
        let folded = branch.trim(self.threshold)?;
        if folded > 0 {
            self.result.branches_merged += 1;
            self.result.maps_folded += folded;
        }
        Ok(())
    }
}

/// Background merge of acknowledged version maps.
#[derive(Debug)]
pub struct Merger {
    walker: Walker,
    scheduler: MergeScheduler,
    threshold: u32,
}

impl Merger {
    #[must_use]
    pub fn new(config: &FabricConfig) -> Self {
        Self {
            walker: Walker::new(None, config),
            scheduler: MergeScheduler::new(),
            threshold: config.trim_threshold,
        }
    }

    #[must_use]
    pub const fn scheduler(&self) -> &MergeScheduler {
        &self.scheduler
    }

    /// Run one merge slice if the scheduler says it is due.
    pub fn maybe_tick(
        &mut self,
        branches: &[Arc<Branch>],
        now: Instant,
    ) -> Result<Option<MergeTickResult>> {
        if !self.scheduler.is_due(now, merge_backlog(branches, self.threshold)) {
            return Ok(None);
        }
        let result = self.tick(branches)?;
        self.scheduler.record(now, &result);
        Ok(Some(result))
    }

    /// Run one merge slice over `branches` unconditionally.
    pub fn tick(&mut self, branches: &[Arc<Branch>]) -> Result<MergeTickResult> {
        let mut pass = MergePass {
            threshold: self.threshold,
            result: MergeTickResult::default(),
        };
        let outcome = self.walker.run(branches, &mut pass)?;
        pass.result.budget_exhausted = outcome == WalkOutcome::Suspended;
        if pass.result.maps_folded > 0 {
            tracing::info!(
                branches_merged = pass.result.branches_merged,
                maps_folded = pass.result.maps_folded,
                "merge tick: folding batch complete"
            );
        }
        if pass.result.budget_exhausted {
            tracing::debug!(
                visited = pass.result.branches_visited,
                "merge tick: budget exhausted with branches left"
            );
        }
        Ok(pass.result)
    }
}
