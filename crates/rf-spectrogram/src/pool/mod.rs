//! Spectrogram pool: public handle and job handles
//!
//! ```text
//! caller ──process_*──► command channel ──► control thread ──UnitRequest──► unit threads
//!   ▲                                           │  ▲                              │
//!   └──── BatchJob / TileJob ◄── resolutions ───┘  └──────── UnitReply ───────────┘
//! ```
//!
//! All pool bookkeeping lives on the control thread. The handle only sends
//! commands and waits on replies, so it can be shared between threads.

mod batch;
mod control;
mod tile;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::cancel::{CancelListener, CancelToken};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::kernel::{SpectrogramKernel, StftKernel};
use crate::message::{ColumnBlock, TileImage, UnitEnvelope, UnitId};
use crate::task::{
    batch_sample_range, BatchRange, BatchTask, JobId, Quantize, StftParams, TaskDescriptor,
    TaskOutcome, TileRequest,
};

use control::Controller;

/// Progress callback for batch jobs: `(block, percent_complete, unit_id)`
pub type BatchCallback = Box<dyn FnMut(&ColumnBlock, f64, UnitId) + Send>;

/// Streaming callback for tile jobs; takes ownership of the tile
pub type TileCallback = Box<dyn FnMut(TileImage) + Send>;

// ═══════════════════════════════════════════════════════════════════════════
// CONTROL PROTOCOL
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) struct BatchSubmission {
    pub job: JobId,
    pub tasks: Vec<TaskDescriptor>,
    pub on_complete: BatchCallback,
}

pub(crate) struct TileSubmission {
    pub job: JobId,
    pub tiles: Vec<TileRequest>,
    pub on_tile: TileCallback,
    pub cancel: CancelToken,
    pub done: Sender<TileJobOutcome>,
}

pub(crate) enum Command {
    Initialize {
        concurrency: Option<usize>,
        reply: Sender<PoolResult<()>>,
    },
    SubmitBatches(BatchSubmission),
    SubmitTiles(TileSubmission),
    Stats {
        reply: Sender<PoolStats>,
    },
    Terminate {
        reply: Sender<()>,
    },
    /// Terminate and stop the control thread
    Shutdown,
}

/// Everything the control thread reacts to
pub(crate) enum PoolEvent {
    Command(Command),
    Unit(UnitEnvelope),
}

// ═══════════════════════════════════════════════════════════════════════════
// STATS
// ═══════════════════════════════════════════════════════════════════════════

/// Per-unit snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStats {
    pub id: UnitId,
    pub busy: bool,
    /// Thread is gone, unit no longer receives work
    pub retired: bool,
    pub completed: u64,
}

/// Pool snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live units (retired ones excluded)
    pub total_units: usize,
    pub busy_units: usize,
    pub available_units: usize,
    pub queued_tasks: usize,
    pub initialized: bool,
    pub units: Vec<UnitStats>,
}

// ═══════════════════════════════════════════════════════════════════════════
// JOB HANDLES
// ═══════════════════════════════════════════════════════════════════════════

struct BatchSlot {
    rx: Receiver<TaskOutcome<ColumnBlock>>,
    outcome: Option<TaskOutcome<ColumnBlock>>,
}

/// Pending result of `process_batches`. Outcomes come back in the order the
/// batches were given, whatever order they finished in.
pub struct BatchJob {
    job: JobId,
    slots: Vec<BatchSlot>,
}

impl BatchJob {
    pub fn id(&self) -> JobId {
        self.job
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Block until every batch has settled
    pub fn wait(self) -> Vec<TaskOutcome<ColumnBlock>> {
        self.slots
            .into_iter()
            .map(|slot| match slot.outcome {
                Some(outcome) => outcome,
                None => slot.rx.recv().unwrap_or(TaskOutcome::Cancelled),
            })
            .collect()
    }

    /// Like [`wait`](Self::wait) with a deadline. `None` on timeout. Outcomes
    /// stay in the handle, so later calls (and `wait`) see them again.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Vec<TaskOutcome<ColumnBlock>>> {
        let deadline = Instant::now() + timeout;
        for slot in self.slots.iter_mut().filter(|s| s.outcome.is_none()) {
            match slot.rx.recv_deadline(deadline) {
                Ok(outcome) => slot.outcome = Some(outcome),
                Err(RecvTimeoutError::Disconnected) => slot.outcome = Some(TaskOutcome::Cancelled),
                Err(RecvTimeoutError::Timeout) => return None,
            }
        }
        Some(
            self.slots
                .iter()
                .map(|s| s.outcome.clone().unwrap_or(TaskOutcome::Cancelled))
                .collect(),
        )
    }
}

/// How a tile job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileJobOutcome {
    /// Every tile was accounted for
    Completed,
    /// The cancel token fired first
    Cancelled,
    /// The pool was terminated under the job
    Terminated,
}

/// Pending result of `process_tiles`
pub struct TileJob {
    job: JobId,
    total: usize,
    done: Receiver<TileJobOutcome>,
    cancel: CancelToken,
    listener: CancelListener,
}

impl TileJob {
    pub fn id(&self) -> JobId {
        self.job
    }

    /// Number of tiles submitted
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fire this job's cancel token
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until all tiles are done or the token fires, whichever is first
    pub fn wait(self) -> TileJobOutcome {
        if let Ok(outcome) = self.done.try_recv() {
            return outcome;
        }
        select! {
            recv(self.done) -> outcome => outcome.unwrap_or(TileJobOutcome::Terminated),
            recv(self.listener.receiver()) -> _ => TileJobOutcome::Cancelled,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL HANDLE
// ═══════════════════════════════════════════════════════════════════════════

/// Owned spectrogram pool. Dropping it terminates the units and stops the
/// control thread.
///
/// Callbacks run on the control thread and must not call back into the
/// blocking methods of the pool they belong to; those calls fail with
/// [`PoolError::Reentrant`].
pub struct SpectrogramPool {
    tx: Sender<PoolEvent>,
    control: Option<JoinHandle<()>>,
    control_id: ThreadId,
    config: PoolConfig,
    next_job: AtomicU64,
}

impl SpectrogramPool {
    /// Start the control thread. Units are created lazily by
    /// [`initialize`](Self::initialize) or the first dispatch.
    pub fn new(config: PoolConfig, kernel: Arc<dyn SpectrogramKernel>) -> PoolResult<Self> {
        let (tx, rx) = unbounded::<PoolEvent>();
        let controller = Controller::new(config.clone(), kernel, tx.clone());

        let control = thread::Builder::new()
            .name("rf-spectro-control".into())
            .spawn(move || controller.run(rx))
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;
        let control_id = control.thread().id();

        Ok(Self {
            tx,
            control: Some(control),
            control_id,
            config,
            next_job: AtomicU64::new(1),
        })
    }

    /// Pool backed by the stock `realfft` kernel
    pub fn with_stft_kernel(config: PoolConfig) -> PoolResult<Self> {
        Self::new(config, Arc::new(StftKernel::new()))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn send(&self, command: Command) -> PoolResult<()> {
        self.tx
            .send(PoolEvent::Command(command))
            .map_err(|_| PoolError::ControlUnavailable)
    }

    fn check_not_control(&self) -> PoolResult<()> {
        if thread::current().id() == self.control_id {
            return Err(PoolError::Reentrant);
        }
        Ok(())
    }

    /// Create the execution units and wait until every one of them has
    /// answered the boot handshake. No-op when already initialized.
    ///
    /// `concurrency` overrides the configured unit count (0 = auto).
    pub fn initialize(&self, concurrency: Option<usize>) -> PoolResult<()> {
        self.check_not_control()?;
        let (reply, rx) = bounded(1);
        self.send(Command::Initialize { concurrency, reply })?;

        let Some(timeout_ms) = self.config.ready_timeout_ms else {
            return rx.recv().map_err(|_| PoolError::ControlUnavailable)?;
        };

        match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "execution units not ready after {} ms, tearing down",
                    timeout_ms
                );
                self.terminate()?;
                Err(PoolError::InitTimeout(timeout_ms))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PoolError::ControlUnavailable),
        }
    }

    /// Static batch dispatch, linear magnitudes.
    ///
    /// Each batch gets exactly the samples its columns need; batches are
    /// handed to free units in order and queued FIFO when none is free.
    pub fn process_batches<F>(
        &self,
        audio: &[f32],
        batches: &[BatchRange],
        stft: &StftParams,
        on_batch_complete: F,
    ) -> PoolResult<BatchJob>
    where
        F: FnMut(&ColumnBlock, f64, UnitId) + Send + 'static,
    {
        self.submit_batches(audio, batches, stft, None, Box::new(on_batch_complete))
    }

    /// Static batch dispatch, dB magnitudes quantized to `u8`
    pub fn process_batches_u8<F>(
        &self,
        audio: &[f32],
        batches: &[BatchRange],
        stft: &StftParams,
        quantize: Quantize,
        on_batch_complete: F,
    ) -> PoolResult<BatchJob>
    where
        F: FnMut(&ColumnBlock, f64, UnitId) + Send + 'static,
    {
        self.submit_batches(
            audio,
            batches,
            stft,
            Some(quantize),
            Box::new(on_batch_complete),
        )
    }

    fn submit_batches(
        &self,
        audio: &[f32],
        batches: &[BatchRange],
        stft: &StftParams,
        quantize: Option<Quantize>,
        on_complete: BatchCallback,
    ) -> PoolResult<BatchJob> {
        stft.validate()?;
        if let Some(quantize) = &quantize {
            quantize.validate()?;
        }
        if let Some(bad) = batches.iter().find(|b| b.is_empty()) {
            return Err(PoolError::InvalidBatch {
                start: bad.start,
                end: bad.end,
                reason: "empty column range".into(),
            });
        }

        self.initialize(None)?;

        let job = self.next_job.fetch_add(1, Ordering::Relaxed);
        let mut slots = Vec::with_capacity(batches.len());
        let tasks: Vec<TaskDescriptor> = batches
            .iter()
            .map(|&batch| {
                let (resolve, rx) = bounded(1);
                slots.push(BatchSlot { rx, outcome: None });

                let task = BatchTask {
                    job,
                    batch_start: batch.start,
                    batch_end: batch.end,
                    audio: audio[batch_sample_range(batch, audio.len(), stft)].to_vec(),
                    stft: stft.clone(),
                    resolve,
                };
                match quantize {
                    Some(quantize) => TaskDescriptor::BatchU8 { task, quantize },
                    None => TaskDescriptor::Batch(task),
                }
            })
            .collect();

        if !tasks.is_empty() {
            log::debug!("batch job {}: {} batches", job, tasks.len());
            self.send(Command::SubmitBatches(BatchSubmission {
                job,
                tasks,
                on_complete,
            }))?;
        }

        Ok(BatchJob { job, slots })
    }

    /// Work-stealing tile dispatch.
    ///
    /// Every free unit is seeded with one tile; a unit that finishes pulls
    /// the next pending tile unless `cancel` has fired. Tiles already running
    /// when the token fires finish, but their callbacks are skipped.
    pub fn process_tiles<F>(
        &self,
        tiles: Vec<TileRequest>,
        on_tile_complete: F,
        cancel: CancelToken,
    ) -> PoolResult<TileJob>
    where
        F: FnMut(TileImage) + Send + 'static,
    {
        for tile in &tiles {
            tile.validate()?;
        }

        self.initialize(None)?;

        let job = self.next_job.fetch_add(1, Ordering::Relaxed);
        let total = tiles.len();
        let (done, done_rx) = bounded(1);
        let listener = cancel.subscribe();

        if total == 0 {
            let _ = done.send(TileJobOutcome::Completed);
        } else {
            log::debug!("tile job {}: {} tiles", job, total);
            self.send(Command::SubmitTiles(TileSubmission {
                job,
                tiles,
                on_tile: Box::new(on_tile_complete),
                cancel: cancel.clone(),
                done,
            }))?;
        }

        Ok(TileJob {
            job,
            total,
            done: done_rx,
            cancel,
            listener,
        })
    }

    /// Snapshot of units and queue
    pub fn stats(&self) -> PoolResult<PoolStats> {
        self.check_not_control()?;
        let (reply, rx) = bounded(1);
        self.send(Command::Stats { reply })?;
        rx.recv().map_err(|_| PoolError::ControlUnavailable)
    }

    /// Cancel all queued work, stop every unit and reset to uninitialized.
    /// Every queued task has settled by the time this returns.
    pub fn terminate(&self) -> PoolResult<()> {
        self.check_not_control()?;
        let (reply, rx) = bounded(1);
        self.send(Command::Terminate { reply })?;
        rx.recv().map_err(|_| PoolError::ControlUnavailable)
    }

    /// Same as [`terminate`](Self::terminate)
    pub fn cleanup(&self) -> PoolResult<()> {
        self.terminate()
    }
}

impl Drop for SpectrogramPool {
    fn drop(&mut self) {
        let _ = self.tx.send(PoolEvent::Command(Command::Shutdown));
        // Dropped from inside a callback: the control thread exits on its own
        if thread::current().id() == self.control_id {
            return;
        }
        if let Some(handle) = self.control.take() {
            if handle.join().is_err() {
                log::error!("spectrogram control thread panicked");
            }
        }
    }
}
