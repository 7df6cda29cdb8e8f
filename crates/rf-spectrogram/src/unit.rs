//! Execution units
//!
//! One OS thread per unit. The thread owns nothing but its request
//! receiver and a handle to the kernel; every request brings its own audio,
//! which is dropped as soon as the kernel returns and before the reply is
//! posted back to the control thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::kernel::SpectrogramKernel;
use crate::message::{
    ColumnBlock, Magnitudes, ReplyKind, TileImage, UnitEnvelope, UnitId, UnitReply, UnitRequest,
};
use crate::pool::PoolEvent;
use crate::task::{Assignment, TaskDescriptor};

/// Control-side handle to one execution unit. The handle is the only writer
/// of the unit's request channel.
pub(crate) struct ExecutionUnit {
    pub id: UnitId,
    pub busy: bool,
    /// Replied to the boot handshake
    pub ready: bool,
    /// Tasks this unit completed (any outcome)
    pub completed: u64,
    /// Thread is gone; out of rotation for the rest of the generation
    pub retired: bool,
    tx: Option<Sender<UnitRequest>>,
    thread: Option<JoinHandle<()>>,
    assignment: Option<Assignment>,
}

impl ExecutionUnit {
    /// Spawn the unit thread. Replies go to `events` stamped with
    /// `generation`.
    pub fn spawn(
        id: UnitId,
        generation: u64,
        config: &PoolConfig,
        kernel: Arc<dyn SpectrogramKernel>,
        events: Sender<PoolEvent>,
    ) -> PoolResult<Self> {
        let (tx, rx) = unbounded::<UnitRequest>();

        let mut builder = thread::Builder::new().name(format!("{}-{}", config.unit_name_prefix, id));
        if let Some(stack) = config.unit_stack_size {
            builder = builder.stack_size(stack);
        }

        let thread = builder
            .spawn(move || unit_loop(id, generation, rx, events, kernel))
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            id,
            busy: false,
            ready: false,
            completed: 0,
            retired: false,
            tx: Some(tx),
            thread: Some(thread),
            assignment: None,
        })
    }

    fn send(&self, request: UnitRequest) -> bool {
        match &self.tx {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        }
    }

    pub fn boot(&self) -> bool {
        self.send(UnitRequest::Boot)
    }

    /// Hand a task to this unit. The task's audio moves into the request.
    /// If the unit thread is gone the bookkeeping is handed back unsettled.
    pub fn assign(&mut self, task: TaskDescriptor) -> Result<(), Assignment> {
        debug_assert!(!self.busy, "unit {} assigned while busy", self.id);

        let (request, assignment) = task.into_dispatch();
        log::debug!(
            "unit {} <- {:?} {} (job {})",
            self.id,
            assignment.kind,
            assignment.key,
            assignment.job
        );

        if !self.send(request) {
            log::error!(
                "unit {} is gone, dropping {:?} {}",
                self.id,
                assignment.kind,
                assignment.key
            );
            return Err(assignment);
        }

        self.busy = true;
        self.assignment = Some(assignment);
        Ok(())
    }

    /// Take the assignment if the reply matches it. Mismatches leave the
    /// unit untouched.
    pub fn complete(&mut self, kind: ReplyKind, key: usize) -> Option<Assignment> {
        if !self.assignment.as_ref().is_some_and(|a| a.matches(kind, key)) {
            return None;
        }
        self.busy = false;
        self.completed += 1;
        self.assignment.take()
    }

    /// Detach the in-flight assignment; late replies for it will no longer
    /// correlate
    pub fn detach(&mut self) -> Option<Assignment> {
        self.busy = false;
        self.assignment.take()
    }

    /// Stop the thread and wait for it. Detach first.
    pub fn shutdown(&mut self) {
        debug_assert!(self.assignment.is_none(), "shutdown before detach");

        if let Some(tx) = self.tx.take() {
            let _ = tx.send(UnitRequest::Shutdown);
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("unit {} thread panicked", self.id);
            }
        }
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        if let Some(assignment) = self.assignment.take() {
            assignment.abandon();
        }
        self.shutdown();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// UNIT THREAD
// ═══════════════════════════════════════════════════════════════════════════

fn unit_loop(
    id: UnitId,
    generation: u64,
    rx: Receiver<UnitRequest>,
    events: Sender<PoolEvent>,
    kernel: Arc<dyn SpectrogramKernel>,
) {
    while let Ok(request) = rx.recv() {
        let reply = match request {
            UnitRequest::Shutdown => break,
            UnitRequest::Boot => {
                if panic::catch_unwind(AssertUnwindSafe(|| kernel.warm_up())).is_err() {
                    log::warn!("unit {} kernel warm-up panicked", id);
                }
                UnitReply::Ready
            }
            UnitRequest::ComputeBatch {
                audio,
                batch_start,
                batch_end,
                stft,
            } => guarded(ReplyKind::Batch, batch_start, || {
                let data = kernel.magnitudes(&audio, batch_end - batch_start, &stft);
                UnitReply::BatchComplete(ColumnBlock {
                    batch_start,
                    batch_end,
                    bins: stft.bins(),
                    magnitudes: Magnitudes::Float(data),
                })
            }),
            UnitRequest::ComputeBatchU8 {
                audio,
                batch_start,
                batch_end,
                stft,
                quantize,
            } => guarded(ReplyKind::BatchU8, batch_start, || {
                let data = kernel.quantized(&audio, batch_end - batch_start, &stft, quantize);
                UnitReply::BatchU8Complete(ColumnBlock {
                    batch_start,
                    batch_end,
                    bins: stft.bins(),
                    magnitudes: Magnitudes::Quantized(data),
                })
            }),
            UnitRequest::ComputeTile(tile) => guarded(ReplyKind::Tile, tile.tile_index, || {
                let data = kernel.quantized(
                    &tile.audio,
                    tile.num_time_slices,
                    &tile.stft,
                    tile.quantize,
                );
                UnitReply::TileComplete(TileImage {
                    tile_index: tile.tile_index,
                    width: tile.num_time_slices,
                    height: tile.stft.bins(),
                    data,
                })
            }),
        };

        let envelope = UnitEnvelope {
            generation,
            unit: id,
            reply,
        };
        if events.send(PoolEvent::Unit(envelope)).is_err() {
            break;
        }
    }

    log::debug!("unit {} exiting", id);
}

/// Run the kernel, turning a panic into a `Failed` reply for this task
fn guarded(kind: ReplyKind, key: usize, compute: impl FnOnce() -> UnitReply) -> UnitReply {
    match panic::catch_unwind(AssertUnwindSafe(compute)) {
        Ok(reply) => reply,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::warn!("kernel failed on {:?} {}: {}", kind, key, message);
            UnitReply::Failed { kind, key, message }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}
