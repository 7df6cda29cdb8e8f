//! Task definitions: batch ranges, tile requests, and the descriptors the
//! pool queues and dispatches

use std::ops::Range;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::kernel::WindowFunction;
use crate::message::{ColumnBlock, ReplyKind, UnitRequest};

/// Unique job identifier (one per dispatch call)
pub type JobId = u64;

// ═══════════════════════════════════════════════════════════════════════════════
// PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Half-open range of output columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRange {
    pub start: usize,
    pub end: usize,
}

impl BatchRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// STFT geometry shared by every task of a job
#[derive(Debug, Clone, PartialEq)]
pub struct StftParams {
    pub fft_size: usize,
    pub hop_size: usize,
    /// Window coefficients, `fft_size` long
    pub window: Arc<[f32]>,
}

impl StftParams {
    pub fn new(fft_size: usize, hop_size: usize, window: impl Into<Arc<[f32]>>) -> Self {
        Self {
            fft_size,
            hop_size,
            window: window.into(),
        }
    }

    /// Params with a generated window
    pub fn with_window(fft_size: usize, hop_size: usize, window: WindowFunction) -> Self {
        Self::new(fft_size, hop_size, window.coefficients(fft_size))
    }

    /// Number of magnitude bins per column
    pub fn bins(&self) -> usize {
        self.fft_size / 2
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.fft_size == 0 {
            return Err(PoolError::InvalidConfig("fft_size must be non-zero".into()));
        }
        if self.hop_size == 0 {
            return Err(PoolError::InvalidConfig("hop_size must be non-zero".into()));
        }
        if self.window.len() != self.fft_size {
            return Err(PoolError::InvalidConfig(format!(
                "window has {} coefficients, fft_size is {}",
                self.window.len(),
                self.fft_size
            )));
        }
        Ok(())
    }
}

/// dB window mapped onto 0..=255
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantize {
    pub db_floor: f32,
    pub db_range: f32,
}

impl Quantize {
    pub fn new(db_floor: f32, db_range: f32) -> Self {
        Self { db_floor, db_range }
    }

    pub fn validate(&self) -> PoolResult<()> {
        if !self.db_floor.is_finite() || !self.db_range.is_finite() || self.db_range <= 0.0 {
            return Err(PoolError::InvalidConfig(format!(
                "invalid dB window: floor {} range {}",
                self.db_floor, self.db_range
            )));
        }
        Ok(())
    }
}

impl Default for Quantize {
    fn default() -> Self {
        Self {
            db_floor: -120.0,
            db_range: 120.0,
        }
    }
}

/// One tile of the work-stealing path. Owns exactly the samples it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub tile_index: usize,
    pub audio: Vec<f32>,
    /// Columns in this tile (image width)
    pub num_time_slices: usize,
    pub stft: StftParams,
    pub quantize: Quantize,
}

impl TileRequest {
    pub fn validate(&self) -> PoolResult<()> {
        self.stft.validate()?;
        self.quantize.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLUMN MATH
// ═══════════════════════════════════════════════════════════════════════════════

/// Number of full STFT frames that fit in `samples`
pub fn column_count(samples: usize, fft_size: usize, hop_size: usize) -> usize {
    if fft_size == 0 || hop_size == 0 || samples < fft_size {
        return 0;
    }
    (samples - fft_size) / hop_size + 1
}

/// Input samples needed for a batch: `start*hop .. (end-1)*hop + fft`,
/// clamped to the buffer
pub fn batch_sample_range(batch: BatchRange, len: usize, stft: &StftParams) -> Range<usize> {
    let start = batch.start.saturating_mul(stft.hop_size).min(len);
    if batch.is_empty() {
        return start..start;
    }
    let end = (batch.end - 1)
        .saturating_mul(stft.hop_size)
        .saturating_add(stft.fft_size)
        .min(len);
    start..end.max(start)
}

/// Partition `total_columns` into ordered batches of `columns_per_batch`
/// (last batch may be shorter)
pub fn plan_batches(total_columns: usize, columns_per_batch: usize) -> Vec<BatchRange> {
    let step = columns_per_batch.max(1);
    (0..total_columns)
        .step_by(step)
        .map(|start| BatchRange::new(start, (start + step).min(total_columns)))
        .collect()
}

/// Carve `audio` into tiles of `tile_columns` columns each. Every tile gets
/// its own copy of the samples it covers.
pub fn plan_tiles(
    audio: &[f32],
    tile_columns: usize,
    stft: &StftParams,
    quantize: Quantize,
) -> Vec<TileRequest> {
    let total = column_count(audio.len(), stft.fft_size, stft.hop_size);
    plan_batches(total, tile_columns)
        .into_iter()
        .enumerate()
        .map(|(tile_index, columns)| TileRequest {
            tile_index,
            audio: audio[batch_sample_range(columns, audio.len(), stft)].to_vec(),
            num_time_slices: columns.len(),
            stft: stft.clone(),
            quantize,
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOMES & TRACKING
// ═══════════════════════════════════════════════════════════════════════════════

/// How a single task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// Did not run (pool terminated or job abandoned)
    Cancelled,
    /// Kernel failed on this task
    Failed(String),
}

impl<T> TaskOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Per-job completion counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionTracker {
    completed: usize,
    total: usize,
}

impl CompletionTracker {
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
        }
    }

    /// Count one finished task, returns percent complete
    pub fn record(&mut self) -> f64 {
        debug_assert!(self.completed < self.total, "task recorded twice");
        self.completed = (self.completed + 1).min(self.total);
        self.percent()
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DESCRIPTORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a batch result is delivered
pub(crate) type Resolver = Sender<TaskOutcome<ColumnBlock>>;

/// Deliver an outcome. The receiver may already be gone (job abandoned).
pub(crate) fn resolve(resolver: &Resolver, outcome: TaskOutcome<ColumnBlock>) {
    let _ = resolver.try_send(outcome);
}

pub(crate) struct BatchTask {
    pub job: JobId,
    pub batch_start: usize,
    pub batch_end: usize,
    pub audio: Vec<f32>,
    pub stft: StftParams,
    pub resolve: Resolver,
}

pub(crate) struct TileTask {
    pub job: JobId,
    pub request: TileRequest,
}

/// One queued unit of work
pub(crate) enum TaskDescriptor {
    Batch(BatchTask),
    BatchU8 { task: BatchTask, quantize: Quantize },
    Tile(TileTask),
}

/// What the control thread remembers about a dispatched task
pub(crate) struct Assignment {
    pub job: JobId,
    pub kind: ReplyKind,
    pub key: usize,
    pub resolve: Option<Resolver>,
}

impl Assignment {
    pub fn matches(&self, kind: ReplyKind, key: usize) -> bool {
        self.kind == kind && self.key == key
    }

    /// Settle a dispatched task that will never report back
    pub fn abandon(self) {
        if let Some(resolver) = self.resolve {
            resolve(&resolver, TaskOutcome::Cancelled);
        }
    }
}

impl TaskDescriptor {
    pub fn job(&self) -> JobId {
        match self {
            TaskDescriptor::Batch(task) | TaskDescriptor::BatchU8 { task, .. } => task.job,
            TaskDescriptor::Tile(tile) => tile.job,
        }
    }

    pub fn is_tile(&self) -> bool {
        matches!(self, TaskDescriptor::Tile(_))
    }

    /// Split into the request sent to a unit (audio moves with it) and the
    /// bookkeeping kept by the control thread
    pub fn into_dispatch(self) -> (UnitRequest, Assignment) {
        match self {
            TaskDescriptor::Batch(task) => {
                let assignment = Assignment {
                    job: task.job,
                    kind: ReplyKind::Batch,
                    key: task.batch_start,
                    resolve: Some(task.resolve),
                };
                let request = UnitRequest::ComputeBatch {
                    audio: task.audio,
                    batch_start: task.batch_start,
                    batch_end: task.batch_end,
                    stft: task.stft,
                };
                (request, assignment)
            }
            TaskDescriptor::BatchU8 { task, quantize } => {
                let assignment = Assignment {
                    job: task.job,
                    kind: ReplyKind::BatchU8,
                    key: task.batch_start,
                    resolve: Some(task.resolve),
                };
                let request = UnitRequest::ComputeBatchU8 {
                    audio: task.audio,
                    batch_start: task.batch_start,
                    batch_end: task.batch_end,
                    stft: task.stft,
                    quantize,
                };
                (request, assignment)
            }
            TaskDescriptor::Tile(tile) => {
                let assignment = Assignment {
                    job: tile.job,
                    kind: ReplyKind::Tile,
                    key: tile.request.tile_index,
                    resolve: None,
                };
                (UnitRequest::ComputeTile(tile.request), assignment)
            }
        }
    }

    /// Settle a task that never left the queue
    pub fn cancel(self) {
        match self {
            TaskDescriptor::Batch(task) | TaskDescriptor::BatchU8 { task, .. } => {
                resolve(&task.resolve, TaskOutcome::Cancelled);
            }
            TaskDescriptor::Tile(_) => {}
        }
    }
}
