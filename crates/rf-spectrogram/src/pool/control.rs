//! Control thread: pool state, lifecycle, and the event loop
//!
//! Invariants kept here:
//! - every unit id is either in `available` or holds an assignment, never
//!   both and never neither (a unit whose thread died is retired and leaves
//!   rotation; once all are retired the pool terminates)
//! - replies are stamped with the generation they were spawned in; anything
//!   from an older generation is noise from a terminated pool

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::batch::BatchJobState;
use super::tile::TileJobState;
use super::{Command, PoolEvent, PoolStats, TileJobOutcome, UnitStats};
use crate::config::{resolve_concurrency, PoolConfig};
use crate::error::{PoolError, PoolResult};
use crate::kernel::SpectrogramKernel;
use crate::message::{ReplyKind, UnitEnvelope, UnitId, UnitReply};
use crate::task::{Assignment, JobId, TaskDescriptor};
use crate::unit::ExecutionUnit;

pub(crate) struct Controller {
    config: PoolConfig,
    kernel: Arc<dyn SpectrogramKernel>,
    /// Handed to every unit for its replies
    events: Sender<PoolEvent>,
    generation: u64,

    pub(super) units: Vec<ExecutionUnit>,
    pub(super) available: VecDeque<UnitId>,
    pub(super) pending: VecDeque<TaskDescriptor>,
    pub(super) initialized: bool,
    ready_waiters: Vec<Sender<PoolResult<()>>>,

    pub(super) batch_jobs: HashMap<JobId, BatchJobState>,
    pub(super) tile_jobs: HashMap<JobId, TileJobState>,
}

impl Controller {
    pub fn new(
        config: PoolConfig,
        kernel: Arc<dyn SpectrogramKernel>,
        events: Sender<PoolEvent>,
    ) -> Self {
        Self {
            config,
            kernel,
            events,
            generation: 0,
            units: Vec::new(),
            available: VecDeque::new(),
            pending: VecDeque::new(),
            initialized: false,
            ready_waiters: Vec::new(),
            batch_jobs: HashMap::new(),
            tile_jobs: HashMap::new(),
        }
    }

    /// Event loop. Returns on `Shutdown`, after terminating the units.
    pub fn run(mut self, rx: Receiver<PoolEvent>) {
        while let Ok(event) = rx.recv() {
            match event {
                PoolEvent::Unit(envelope) => self.on_unit_reply(envelope),
                PoolEvent::Command(Command::Shutdown) => break,
                PoolEvent::Command(command) => self.on_command(command),
            }
        }
        self.terminate();
        log::debug!("spectrogram control thread exiting");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Initialize { concurrency, reply } => self.initialize(concurrency, Some(reply)),
            Command::SubmitBatches(submission) => self.submit_batches(submission),
            Command::SubmitTiles(submission) => self.submit_tiles(submission),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Terminate { reply } => {
                self.terminate();
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Spawn units and send the boot handshake. Waiters are answered once
    /// every unit is ready.
    pub(super) fn initialize(
        &mut self,
        concurrency: Option<usize>,
        reply: Option<Sender<PoolResult<()>>>,
    ) {
        if self.initialized {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        if let Some(reply) = reply {
            self.ready_waiters.push(reply);
        }
        if !self.units.is_empty() {
            // Handshake already in flight
            return;
        }

        let count = concurrency
            .map(resolve_concurrency)
            .unwrap_or_else(|| self.config.resolved_concurrency());
        for id in 0..count {
            let unit = ExecutionUnit::spawn(
                id,
                self.generation,
                &self.config,
                Arc::clone(&self.kernel),
                self.events.clone(),
            );
            match unit {
                Ok(unit) => {
                    unit.boot();
                    self.available.push_back(id);
                    self.units.push(unit);
                }
                Err(e) => {
                    log::error!("failed to start execution unit {}: {}", id, e);
                    let waiters = std::mem::take(&mut self.ready_waiters);
                    self.terminate();
                    for waiter in waiters {
                        let _ = waiter.send(Err(e.clone()));
                    }
                    return;
                }
            }
        }

        log::info!("booting {} spectrogram units", count);
    }

    fn on_ready(&mut self, unit: UnitId) {
        if let Some(u) = self.units.get_mut(unit) {
            u.ready = true;
        }
        if self.initialized || !self.units.iter().all(|u| u.ready) {
            return;
        }

        self.initialized = true;
        log::info!("spectrogram pool ready ({} units)", self.units.len());
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.pump();
    }

    /// Settle everything, stop every unit, reset to uninitialized
    pub(super) fn terminate(&mut self) {
        let queued = self.pending.len();
        while let Some(task) = self.pending.pop_front() {
            task.cancel();
        }

        // Detach every unit before any of them is shut down
        let detached: Vec<Assignment> = self.units.iter_mut().filter_map(|u| u.detach()).collect();
        let in_flight = detached.len();
        for assignment in detached {
            assignment.abandon();
        }
        for unit in &mut self.units {
            unit.shutdown();
        }

        let had_units = !self.units.is_empty();
        self.units.clear();
        self.available.clear();
        self.batch_jobs.clear();
        for (_, job) in self.tile_jobs.drain() {
            let _ = job.done.try_send(TileJobOutcome::Terminated);
        }
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(PoolError::Terminated));
        }

        self.initialized = false;
        self.generation += 1;

        if had_units {
            log::info!(
                "spectrogram pool terminated ({} queued, {} in flight cancelled)",
                queued,
                in_flight
            );
        }
    }

    pub(super) fn stats(&self) -> PoolStats {
        PoolStats {
            total_units: self.units.iter().filter(|u| !u.retired).count(),
            busy_units: self.units.iter().filter(|u| u.busy).count(),
            available_units: self.available.len(),
            queued_tasks: self.pending.len(),
            initialized: self.initialized,
            units: self
                .units
                .iter()
                .map(|u| UnitStats {
                    id: u.id,
                    busy: u.busy,
                    retired: u.retired,
                    completed: u.completed,
                })
                .collect(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DISPATCH
    // ═══════════════════════════════════════════════════════════════════════

    /// Hand queued tasks to free units until one side runs out
    pub(super) fn pump(&mut self) {
        if !self.initialized {
            return;
        }
        while let Some(&unit) = self.available.front() {
            let Some(task) = self.next_task() else {
                break;
            };
            self.available.pop_front();
            self.dispatch(unit, task);
        }
    }

    /// Pop the next task worth running. Tiles of cancelled jobs are
    /// discarded here; this is the only place cancellation is observed.
    fn next_task(&mut self) -> Option<TaskDescriptor> {
        while let Some(task) = self.pending.pop_front() {
            if let TaskDescriptor::Tile(tile) = &task {
                let job = tile.job;
                if !self.tile_admissible(job) {
                    drop(task);
                    self.discard_tiles(job);
                    continue;
                }
            }
            return Some(task);
        }
        None
    }

    /// Assign `task` to `unit`, which must not be in `available`
    fn dispatch(&mut self, unit: UnitId, task: TaskDescriptor) {
        debug_assert!(!self.available.contains(&unit));

        if let TaskDescriptor::Tile(tile) = &task {
            if let Some(job) = self.tile_jobs.get_mut(&tile.job) {
                job.in_flight += 1;
            }
        }

        if let Err(lost) = self.units[unit].assign(task) {
            // Unit thread is gone: retire it and account for the task
            log::warn!("retiring unit {}", unit);
            self.units[unit].retired = true;
            self.settle_lost(lost, unit);

            if self.units.iter().all(|u| u.retired) {
                log::error!("every execution unit is gone, terminating pool");
                self.terminate();
            }
        }
    }

    /// A freed unit pulls the next pending task itself, or rejoins
    /// `available`
    fn release(&mut self, unit: UnitId) {
        match self.next_task() {
            Some(task) => self.dispatch(unit, task),
            None => self.available.push_back(unit),
        }
    }

    fn settle_lost(&mut self, lost: Assignment, unit: UnitId) {
        let reply = UnitReply::Failed {
            kind: lost.kind,
            key: lost.key,
            message: "execution unit unavailable".into(),
        };
        match lost.kind {
            ReplyKind::Batch | ReplyKind::BatchU8 => self.finish_batch(lost, reply, unit),
            ReplyKind::Tile => self.finish_tile(lost.job, reply),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REPLIES
    // ═══════════════════════════════════════════════════════════════════════

    fn on_unit_reply(&mut self, envelope: UnitEnvelope) {
        let UnitEnvelope {
            generation,
            unit,
            reply,
        } = envelope;

        if generation != self.generation {
            log::debug!("ignoring reply from unit {} of generation {}", unit, generation);
            return;
        }

        let Some((kind, key)) = reply.correlation() else {
            self.on_ready(unit);
            return;
        };

        let Some(assignment) = self.units.get_mut(unit).and_then(|u| u.complete(kind, key)) else {
            log::debug!("ignoring unmatched {:?} {} from unit {}", kind, key, unit);
            return;
        };

        match kind {
            ReplyKind::Batch | ReplyKind::BatchU8 => self.finish_batch(assignment, reply, unit),
            ReplyKind::Tile => self.finish_tile(assignment.job, reply),
        }

        self.release(unit);
    }
}
