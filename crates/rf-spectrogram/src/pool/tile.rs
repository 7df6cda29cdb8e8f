//! Tile work-stealing dispatcher
//!
//! Tiles cost different amounts, so nothing is pre-assigned: every free unit
//! is seeded with one tile, and a unit that finishes pulls the next pending
//! tile itself. A fast unit ends up doing more tiles than a slow one.
//!
//! Cancellation is checked only when a unit is about to receive a tile.
//! Tiles already running finish; their callbacks are skipped.

use crossbeam_channel::Sender;

use super::control::Controller;
use super::{TileCallback, TileJobOutcome, TileSubmission};
use crate::cancel::CancelToken;
use crate::message::UnitReply;
use crate::task::{CompletionTracker, JobId, TaskDescriptor, TileTask};

pub(crate) struct TileJobState {
    pub tracker: CompletionTracker,
    /// Tiles dispatched and not yet reported back
    pub in_flight: usize,
    pub on_tile: TileCallback,
    pub cancel: CancelToken,
    pub done: Sender<TileJobOutcome>,
}

impl Controller {
    pub(super) fn submit_tiles(&mut self, submission: TileSubmission) {
        let TileSubmission {
            job,
            tiles,
            on_tile,
            cancel,
            done,
        } = submission;

        self.tile_jobs.insert(
            job,
            TileJobState {
                tracker: CompletionTracker::new(tiles.len()),
                in_flight: 0,
                on_tile,
                cancel,
                done,
            },
        );
        self.pending.extend(
            tiles
                .into_iter()
                .map(|request| TaskDescriptor::Tile(TileTask { job, request })),
        );

        if !self.initialized && self.units.is_empty() {
            self.initialize(None, None);
        }
        self.pump();
    }

    /// May another tile of `job` be dispatched?
    pub(super) fn tile_admissible(&self, job: JobId) -> bool {
        self.tile_jobs
            .get(&job)
            .is_some_and(|state| !state.cancel.is_cancelled())
    }

    /// Drop every queued tile of `job`, releasing their buffers. The job
    /// itself is closed once nothing of it is still running.
    pub(super) fn discard_tiles(&mut self, job: JobId) {
        let before = self.pending.len();
        self.pending
            .retain(|task| !(task.is_tile() && task.job() == job));
        let discarded = before - self.pending.len();

        if let Some(state) = self.tile_jobs.get(&job) {
            log::debug!(
                "tile job {} cancelled: {} queued tiles discarded, {} in flight",
                job,
                discarded,
                state.in_flight
            );
            if state.in_flight == 0 {
                self.close_tile_job(job, TileJobOutcome::Cancelled);
            }
        }
    }

    /// Account for one correlated tile reply
    pub(super) fn finish_tile(&mut self, job: JobId, reply: UnitReply) {
        let Some(state) = self.tile_jobs.get_mut(&job) else {
            return;
        };

        state.in_flight = state.in_flight.saturating_sub(1);
        state.tracker.record();
        let cancelled = state.cancel.is_cancelled();

        match reply {
            UnitReply::TileComplete(image) if !cancelled => (state.on_tile)(image),
            UnitReply::TileComplete(image) => {
                log::debug!("tile {} landed after cancel, skipped", image.tile_index);
            }
            UnitReply::Failed { key, message, .. } => {
                log::warn!("tile {} of job {} failed: {}", key, job, message);
            }
            UnitReply::Ready | UnitReply::BatchComplete(_) | UnitReply::BatchU8Complete(_) => {}
        }

        if state.tracker.is_complete() {
            self.close_tile_job(job, TileJobOutcome::Completed);
        } else if cancelled {
            self.discard_tiles(job);
        }
    }

    fn close_tile_job(&mut self, job: JobId, outcome: TileJobOutcome) {
        if let Some(state) = self.tile_jobs.remove(&job) {
            log::debug!(
                "tile job {} closed: {:?} ({}/{} tiles)",
                job,
                outcome,
                state.tracker.completed(),
                state.tracker.total()
            );
            let _ = state.done.try_send(outcome);
        }
    }
}
