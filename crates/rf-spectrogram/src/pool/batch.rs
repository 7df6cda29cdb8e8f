//! Static batch dispatcher
//!
//! Batches are partitioned by the caller ahead of time. Each one goes to the
//! head of the `available` queue if a unit is free, otherwise it waits in the
//! FIFO `pending` queue. No affinity, no priorities.

use super::control::Controller;
use super::{BatchCallback, BatchSubmission};
use crate::message::{UnitId, UnitReply};
use crate::task::{resolve, Assignment, CompletionTracker, TaskOutcome};

pub(crate) struct BatchJobState {
    pub tracker: CompletionTracker,
    pub on_complete: BatchCallback,
}

impl Controller {
    pub(super) fn submit_batches(&mut self, submission: BatchSubmission) {
        let BatchSubmission {
            job,
            tasks,
            on_complete,
        } = submission;

        self.batch_jobs.insert(
            job,
            BatchJobState {
                tracker: CompletionTracker::new(tasks.len()),
                on_complete,
            },
        );
        self.pending.extend(tasks);

        if !self.initialized && self.units.is_empty() {
            // Terminated between the caller's initialize and this submission
            self.initialize(None, None);
        }
        self.pump();
    }

    /// Account for one correlated batch reply: tracker, progress callback,
    /// then the batch's own resolution
    pub(super) fn finish_batch(&mut self, assignment: Assignment, reply: UnitReply, unit: UnitId) {
        let Some(state) = self.batch_jobs.get_mut(&assignment.job) else {
            assignment.abandon();
            return;
        };

        let percent = state.tracker.record();
        let outcome = match reply {
            UnitReply::BatchComplete(block) | UnitReply::BatchU8Complete(block) => {
                (state.on_complete)(&block, percent, unit);
                TaskOutcome::Completed(block)
            }
            UnitReply::Failed { message, .. } => {
                log::warn!(
                    "batch {} of job {} failed on unit {}: {}",
                    assignment.key,
                    assignment.job,
                    unit,
                    message
                );
                TaskOutcome::Failed(message)
            }
            UnitReply::Ready | UnitReply::TileComplete(_) => TaskOutcome::Cancelled,
        };

        if let Some(resolver) = &assignment.resolve {
            resolve(resolver, outcome);
        }

        if state.tracker.is_complete() {
            log::debug!(
                "batch job {} complete ({} batches)",
                assignment.job,
                state.tracker.total()
            );
            self.batch_jobs.remove(&assignment.job);
        }
    }
}
