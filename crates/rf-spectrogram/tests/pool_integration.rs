//! Spectrogram Pool Integration Tests
//!
//! Drives the public pool API end to end:
//! - Static batches: ordering, exactly-once completion, exact input slices
//! - Tiles: seeding of every unit, even split of equal-cost tiles,
//!   cooperative cancellation
//! - Lifecycle: boot timeout, terminate drains the queue, re-initialize,
//!   reentrancy guard

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use rf_spectrogram::{
    column_count, plan_batches, plan_tiles, BatchRange, CancelToken, Magnitudes, PoolConfig,
    PoolError, Quantize, SpectrogramKernel, SpectrogramPool, StftParams, TaskOutcome,
    TileJobOutcome, WindowFunction,
};

const FFT: usize = 64;
const HOP: usize = 16;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stft() -> StftParams {
    StftParams::with_window(FFT, HOP, WindowFunction::Hann)
}

/// Audio whose sample values are their own indices
fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| i as f32).collect()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEST KERNELS
// ═══════════════════════════════════════════════════════════════════════════════

/// Reports what it was given: bin 0 holds the first sample of each column,
/// bin 1 the length of the slice. Optionally sleeps a data-dependent amount
/// so batches finish out of order.
struct EchoKernel {
    jitter: bool,
    calls: AtomicUsize,
    threads: Mutex<HashSet<String>>,
}

impl EchoKernel {
    fn new(jitter: bool) -> Self {
        Self {
            jitter,
            calls: AtomicUsize::new(0),
            threads: Mutex::new(HashSet::new()),
        }
    }
}

impl SpectrogramKernel for EchoKernel {
    fn magnitudes(&self, audio: &[f32], columns: usize, stft: &StftParams) -> Vec<f32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(name) = thread::current().name() {
            self.threads.lock().insert(name.to_string());
        }
        if self.jitter {
            let first = audio.first().copied().unwrap_or(0.0) as u64;
            thread::sleep(Duration::from_millis((7 - first % 7) * 3));
        }

        let bins = stft.bins();
        let mut out = vec![0.0; columns * bins];
        for (column, dest) in out.chunks_exact_mut(bins).enumerate() {
            dest[0] = audio.get(column * stft.hop_size).copied().unwrap_or(-1.0);
            dest[1] = audio.len() as f32;
        }
        out
    }
}

/// Blocks every call until the gate sender is dropped
struct GatedKernel {
    gate: Receiver<()>,
    started: AtomicUsize,
}

impl GatedKernel {
    fn new() -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = unbounded();
        let kernel = Arc::new(Self {
            gate: rx,
            started: AtomicUsize::new(0),
        });
        (kernel, tx)
    }
}

impl SpectrogramKernel for GatedKernel {
    fn magnitudes(&self, _audio: &[f32], columns: usize, stft: &StftParams) -> Vec<f32> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _ = self.gate.recv();
        vec![0.5; columns * stft.bins()]
    }
}

/// Fixed cost per call. Records every key it is handed and how many calls
/// held the same key at once.
struct EvenCostKernel {
    cost: Duration,
    running: Mutex<HashSet<u32>>,
    seen: Mutex<Vec<u32>>,
    overlaps: AtomicUsize,
}

impl EvenCostKernel {
    fn new(cost: Duration) -> Self {
        Self {
            cost,
            running: Mutex::new(HashSet::new()),
            seen: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
        }
    }
}

impl SpectrogramKernel for EvenCostKernel {
    fn magnitudes(&self, audio: &[f32], columns: usize, stft: &StftParams) -> Vec<f32> {
        // Ramp audio: the first sample identifies the tile
        let key = audio.first().copied().unwrap_or(-1.0) as u32;
        if !self.running.lock().insert(key) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.seen.lock().push(key);

        thread::sleep(self.cost);

        self.running.lock().remove(&key);
        vec![0.0; columns * stft.bins()]
    }
}

/// Takes its time getting ready on every unit
struct SlowBootKernel {
    boot: Duration,
}

impl SpectrogramKernel for SlowBootKernel {
    fn warm_up(&self) {
        thread::sleep(self.boot);
    }

    fn magnitudes(&self, _audio: &[f32], columns: usize, stft: &StftParams) -> Vec<f32> {
        vec![0.0; columns * stft.bins()]
    }
}

struct PanickingKernel;

impl SpectrogramKernel for PanickingKernel {
    fn magnitudes(&self, _audio: &[f32], _columns: usize, _stft: &StftParams) -> Vec<f32> {
        panic!("kernel exploded");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATIC BATCHES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_batches_end_to_end_stft() {
    init_logger();
    let pool = SpectrogramPool::with_stft_kernel(PoolConfig::default().with_concurrency(4)).unwrap();

    let audio: Vec<f32> = (0..FFT + HOP * 99)
        .map(|i| (2.0 * std::f32::consts::PI * 8.0 * i as f32 / FFT as f32).sin())
        .collect();
    let total = column_count(audio.len(), FFT, HOP);
    assert_eq!(total, 100);
    let batches = plan_batches(total, 10);
    assert_eq!(batches.len(), 10);

    let job = pool.process_batches(&audio, &batches, &stft(), |_, _, _| {}).unwrap();
    let outcomes = job.wait();
    assert_eq!(outcomes.len(), 10);

    for (outcome, batch) in outcomes.iter().zip(&batches) {
        let block = outcome.completed().expect("batch should complete");
        assert_eq!((block.batch_start, block.batch_end), (batch.start, batch.end));
        assert_eq!(block.bins, FFT / 2);
        let data = block.magnitudes.as_f32().unwrap();
        assert_eq!(data.len(), 10 * FFT / 2);

        // Energy sits in bin 8 of every column
        for column in data.chunks_exact(FFT / 2) {
            let peak = column
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            assert_eq!(peak, Some(8));
        }
    }

    let stats = pool.stats().unwrap();
    assert!(stats.initialized);
    assert_eq!(stats.total_units, 4);
    assert_eq!(stats.available_units, 4);
    assert_eq!(stats.busy_units, 0);
    assert_eq!(stats.queued_tasks, 0);
    assert_eq!(stats.units.iter().map(|u| u.completed).sum::<u64>(), 10);
}

#[test]
fn test_batch_outcomes_keep_input_order() {
    init_logger();
    let kernel = Arc::new(EchoKernel::new(true));
    let pool = SpectrogramPool::new(PoolConfig::default().with_concurrency(3), kernel).unwrap();

    let audio = ramp(FFT + HOP * 41);
    let batches = plan_batches(42, 3);
    let finished = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&finished);
    let job = pool
        .process_batches(&audio, &batches, &stft(), move |block, percent, _| {
            sink.lock().push((block.batch_start, percent));
        })
        .unwrap();
    let outcomes = job.wait();

    let starts: Vec<usize> = outcomes
        .iter()
        .map(|o| o.completed().unwrap().batch_start)
        .collect();
    let expected: Vec<usize> = batches.iter().map(|b| b.start).collect();
    assert_eq!(starts, expected);

    // One callback per batch, progress strictly increasing up to 100
    let finished = finished.lock();
    assert_eq!(finished.len(), batches.len());
    let unique: HashSet<usize> = finished.iter().map(|(s, _)| *s).collect();
    assert_eq!(unique.len(), batches.len());
    assert!(finished.windows(2).all(|w| w[0].1 < w[1].1));
    assert!((finished.last().unwrap().1 - 100.0).abs() < 1e-9);
}

#[test]
fn test_each_batch_gets_exact_slice() {
    init_logger();
    let kernel = Arc::new(EchoKernel::new(false));
    let pool =
        SpectrogramPool::new(PoolConfig::default().with_concurrency(2), kernel.clone()).unwrap();

    let audio = ramp(FFT + HOP * 19);
    let batches = vec![
        BatchRange::new(0, 4),
        BatchRange::new(4, 11),
        BatchRange::new(11, 20),
    ];
    let outcomes = pool
        .process_batches(&audio, &batches, &stft(), |_, _, _| {})
        .unwrap()
        .wait();

    for (outcome, batch) in outcomes.iter().zip(&batches) {
        let block = outcome.completed().unwrap();
        let data = block.magnitudes.as_f32().unwrap();
        let expected_len = (batch.end - 1 - batch.start) * HOP + FFT;
        for (c, column) in data.chunks_exact(FFT / 2).enumerate() {
            // Column c of the slice starts at global column start + c
            assert_eq!(column[0], ((batch.start + c) * HOP) as f32);
            assert_eq!(column[1], expected_len as f32);
        }
    }

    // Nothing ran twice
    assert_eq!(kernel.calls.load(Ordering::SeqCst), batches.len());
}

#[test]
fn test_slice_clamped_at_end_of_buffer() {
    init_logger();
    let kernel = Arc::new(EchoKernel::new(false));
    let pool = SpectrogramPool::new(PoolConfig::default().with_concurrency(1), kernel).unwrap();

    // Buffer stops short of the last column's frame
    let audio = ramp(HOP * 10);
    let outcomes = pool
        .process_batches(&audio, &[BatchRange::new(8, 10)], &stft(), |_, _, _| {})
        .unwrap()
        .wait();

    let block = outcomes[0].completed().unwrap();
    let data = block.magnitudes.as_f32().unwrap();
    assert_eq!(data[0], (8 * HOP) as f32);
    assert_eq!(data[1], (HOP * 2) as f32);
}

#[test]
fn test_quantized_batches() {
    init_logger();
    let pool = SpectrogramPool::with_stft_kernel(PoolConfig::default().with_concurrency(2)).unwrap();

    let audio = vec![0.0; FFT + HOP * 15];
    let batches = plan_batches(16, 8);
    let outcomes = pool
        .process_batches_u8(&audio, &batches, &stft(), Quantize::default(), |block, _, _| {
            assert!(block.magnitudes.as_u8().is_some());
        })
        .unwrap()
        .wait();

    assert_eq!(outcomes.len(), 2);
    for outcome in outcomes {
        let block = outcome.into_option().unwrap();
        match block.magnitudes {
            // Silence sits on the dB floor
            Magnitudes::Quantized(bytes) => {
                assert_eq!(bytes.len(), 8 * FFT / 2);
                assert!(bytes.iter().all(|&b| b == 0));
            }
            Magnitudes::Float(_) => panic!("expected quantized output"),
        }
    }
}

#[test]
fn test_kernel_panic_fails_batch_only() {
    init_logger();
    let pool =
        SpectrogramPool::new(PoolConfig::default().with_concurrency(2), Arc::new(PanickingKernel))
            .unwrap();

    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&callbacks);
    let outcomes = pool
        .process_batches(&ramp(FFT * 4), &plan_batches(4, 1), &stft(), move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap()
        .wait();

    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        assert!(matches!(outcome, TaskOutcome::Failed(m) if m == "kernel exploded"));
    }
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);

    // Units survived
    let stats = pool.stats().unwrap();
    assert_eq!(stats.available_units, 2);
    assert_eq!(stats.busy_units, 0);
}

#[test]
fn test_empty_and_invalid_batches() {
    init_logger();
    let pool = SpectrogramPool::with_stft_kernel(PoolConfig::default().with_concurrency(1)).unwrap();

    let job = pool.process_batches(&[], &[], &stft(), |_, _, _| {}).unwrap();
    assert!(job.is_empty());
    assert!(job.wait().is_empty());

    let err = pool
        .process_batches(&ramp(256), &[BatchRange::new(3, 3)], &stft(), |_, _, _| {})
        .err();
    assert!(matches!(err, Some(PoolError::InvalidBatch { start: 3, end: 3, .. })));

    let bad = StftParams::new(64, 0, vec![1.0; 64]);
    let err = pool
        .process_batches(&ramp(256), &[BatchRange::new(0, 1)], &bad, |_, _, _| {})
        .err();
    assert!(matches!(err, Some(PoolError::InvalidConfig(_))));
}

// ═══════════════════════════════════════════════════════════════════════════════
// TILES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_tiles_seed_every_unit() {
    init_logger();
    let kernel = Arc::new(EchoKernel::new(false));
    let pool =
        SpectrogramPool::new(PoolConfig::default().with_concurrency(4), kernel.clone()).unwrap();
    pool.initialize(None).unwrap();

    let audio = ramp(FFT + HOP * 159);
    let tiles = plan_tiles(&audio, 20, &stft(), Quantize::default());
    assert_eq!(tiles.len(), 8);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let job = pool
        .process_tiles(
            tiles,
            move |tile| sink.lock().push((tile.tile_index, tile.width, tile.height)),
            CancelToken::new(),
        )
        .unwrap();
    assert_eq!(job.len(), 8);
    assert_eq!(job.wait(), TileJobOutcome::Completed);

    let mut seen = seen.lock().clone();
    seen.sort();
    let expected: Vec<_> = (0..8).map(|i| (i, 20, FFT / 2)).collect();
    assert_eq!(seen, expected);

    // Every unit was seeded with a tile
    let stats = pool.stats().unwrap();
    assert!(stats.units.iter().all(|u| u.completed >= 1));
    assert_eq!(stats.units.iter().map(|u| u.completed).sum::<u64>(), 8);

    let threads = kernel.threads.lock();
    assert_eq!(threads.len(), 4);
    assert!(threads.iter().all(|name| name.starts_with("rf-spectro-unit-")));
}

#[test]
fn test_equal_cost_tiles_split_evenly() {
    init_logger();
    let kernel = Arc::new(EvenCostKernel::new(Duration::from_millis(15)));
    let pool =
        SpectrogramPool::new(PoolConfig::default().with_concurrency(4), kernel.clone()).unwrap();
    pool.initialize(None).unwrap();

    let audio = ramp(FFT + HOP * 179);
    let tiles = plan_tiles(&audio, 10, &stft(), Quantize::default());
    assert_eq!(tiles.len(), 18);

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let job = pool
        .process_tiles(
            tiles,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            CancelToken::new(),
        )
        .unwrap();
    assert_eq!(job.wait(), TileJobOutcome::Completed);
    assert_eq!(delivered.load(Ordering::SeqCst), 18);

    // 18 tiles over 4 units: everyone does 4 or 5
    let stats = pool.stats().unwrap();
    let mut counts: Vec<u64> = stats.units.iter().map(|u| u.completed).collect();
    counts.sort();
    assert!(counts.iter().all(|&c| c == 4 || c == 5), "uneven split {:?}", counts);
    assert_eq!(counts.iter().sum::<u64>(), 18);

    // Each tile ran exactly once, never on two units at the same time
    let mut seen = kernel.seen.lock().clone();
    seen.sort();
    let expected: Vec<u32> = (0..18).map(|i| (i * 10 * HOP) as u32).collect();
    assert_eq!(seen, expected);
    assert_eq!(kernel.overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn test_tile_cancellation_stops_dispatch() {
    init_logger();
    let (kernel, gate) = GatedKernel::new();
    let pool =
        SpectrogramPool::new(PoolConfig::default().with_concurrency(2), kernel.clone()).unwrap();

    let audio = vec![0.1; FFT + HOP * 99];
    let tiles = plan_tiles(&audio, 10, &stft(), Quantize::default());
    assert_eq!(tiles.len(), 10);

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let cancel = CancelToken::new();
    let job = pool
        .process_tiles(
            tiles,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            cancel.clone(),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        kernel.started.load(Ordering::SeqCst) == 2
    }));

    cancel.cancel();
    assert_eq!(job.wait(), TileJobOutcome::Cancelled);
    drop(gate);

    // In-flight tiles finish, nothing else is dispatched
    assert!(wait_until(Duration::from_secs(5), || {
        pool.stats()
            .map(|s| s.busy_units == 0 && s.queued_tasks == 0)
            .unwrap_or(false)
    }));
    assert_eq!(kernel.started.load(Ordering::SeqCst), 2);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(cancel.listener_count(), 0);
}

#[test]
fn test_tiles_cancelled_before_submit() {
    init_logger();
    let kernel = Arc::new(EchoKernel::new(false));
    let pool =
        SpectrogramPool::new(PoolConfig::default().with_concurrency(2), kernel.clone()).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let tiles = plan_tiles(&ramp(FFT * 8), 4, &stft(), Quantize::default());
    let job = pool.process_tiles(tiles, |_| {}, cancel).unwrap();
    assert_eq!(job.wait(), TileJobOutcome::Cancelled);

    assert!(wait_until(Duration::from_secs(5), || {
        pool.stats().map(|s| s.queued_tasks == 0).unwrap_or(false)
    }));
    assert_eq!(kernel.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_empty_tile_job_completes() {
    init_logger();
    let pool = SpectrogramPool::with_stft_kernel(PoolConfig::default().with_concurrency(1)).unwrap();
    let job = pool.process_tiles(Vec::new(), |_| {}, CancelToken::new()).unwrap();
    assert!(job.is_empty());
    assert_eq!(job.wait(), TileJobOutcome::Completed);
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_terminate_cancels_queued_and_in_flight() {
    init_logger();
    let (kernel, gate) = GatedKernel::new();
    let pool =
        SpectrogramPool::new(PoolConfig::default().with_concurrency(1), kernel.clone()).unwrap();

    let job = pool
        .process_batches(&ramp(FFT * 8), &plan_batches(5, 1), &stft(), |_, _, _| {})
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        kernel.started.load(Ordering::SeqCst) == 1
    }));

    // Unit thread is parked in the kernel; let it go once terminate is joining
    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        drop(gate);
    });
    pool.terminate().unwrap();
    release.join().unwrap();

    let outcomes = job.wait();
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|o| *o == TaskOutcome::Cancelled));
    assert_eq!(kernel.started.load(Ordering::SeqCst), 1);

    let stats = pool.stats().unwrap();
    assert!(!stats.initialized);
    assert_eq!(stats.total_units, 0);
    assert_eq!(stats.queued_tasks, 0);
}

#[test]
fn test_terminate_ends_tile_job() {
    init_logger();
    let (kernel, gate) = GatedKernel::new();
    let pool = SpectrogramPool::new(PoolConfig::default().with_concurrency(1), kernel).unwrap();

    let tiles = plan_tiles(&ramp(FFT * 8), 2, &stft(), Quantize::default());
    let job = pool.process_tiles(tiles, |_| {}, CancelToken::new()).unwrap();

    drop(gate);
    pool.terminate().unwrap();
    assert!(matches!(
        job.wait(),
        TileJobOutcome::Terminated | TileJobOutcome::Completed
    ));
}

#[test]
fn test_ready_timeout_tears_pool_down() {
    init_logger();
    let kernel = Arc::new(SlowBootKernel {
        boot: Duration::from_millis(300),
    });
    let config = PoolConfig::default()
        .with_concurrency(2)
        .with_ready_timeout(Duration::from_millis(40));
    let pool = SpectrogramPool::new(config, kernel).unwrap();

    assert_eq!(pool.initialize(None), Err(PoolError::InitTimeout(40)));

    let stats = pool.stats().unwrap();
    assert!(!stats.initialized);
    assert_eq!(stats.total_units, 0);

    // Dispatch runs into the same wall
    let err = pool
        .process_batches(&ramp(FFT), &[BatchRange::new(0, 1)], &stft(), |_, _, _| {})
        .err();
    assert_eq!(err, Some(PoolError::InitTimeout(40)));
}

#[test]
fn test_ready_timeout_met() {
    init_logger();
    let kernel = Arc::new(SlowBootKernel {
        boot: Duration::from_millis(5),
    });
    let config = PoolConfig::default()
        .with_concurrency(2)
        .with_ready_timeout(Duration::from_secs(5));
    let pool = SpectrogramPool::new(config, kernel).unwrap();

    pool.initialize(None).unwrap();
    let outcomes = pool
        .process_batches(&ramp(FFT * 2), &plan_batches(4, 2), &stft(), |_, _, _| {})
        .unwrap()
        .wait();
    assert!(outcomes.iter().all(TaskOutcome::is_completed));
}

#[test]
fn test_reinitialize_after_terminate() {
    init_logger();
    let pool = SpectrogramPool::with_stft_kernel(PoolConfig::default().with_concurrency(2)).unwrap();
    pool.initialize(None).unwrap();
    pool.initialize(None).unwrap();
    assert_eq!(pool.stats().unwrap().total_units, 2);

    pool.terminate().unwrap();
    pool.cleanup().unwrap();
    assert!(!pool.stats().unwrap().initialized);

    // Dispatch brings the units back
    let outcomes = pool
        .process_batches(&ramp(FFT * 4), &plan_batches(8, 2), &stft(), |_, _, _| {})
        .unwrap()
        .wait();
    assert!(outcomes.iter().all(TaskOutcome::is_completed));

    pool.initialize(Some(3)).unwrap();
    assert_eq!(pool.stats().unwrap().total_units, 2);
    pool.terminate().unwrap();
    pool.initialize(Some(3)).unwrap();
    assert_eq!(pool.stats().unwrap().total_units, 3);
}

#[test]
fn test_blocking_call_from_callback_is_rejected() {
    init_logger();
    let pool = Arc::new(
        SpectrogramPool::with_stft_kernel(PoolConfig::default().with_concurrency(1)).unwrap(),
    );

    let (tx, rx) = bounded(1);
    let inner = Arc::clone(&pool);
    let job = pool
        .process_batches(&ramp(FFT), &[BatchRange::new(0, 1)], &stft(), move |_, _, _| {
            let _ = tx.try_send(inner.stats().err());
        })
        .unwrap();
    job.wait();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Some(PoolError::Reentrant)
    );
    assert!(pool.stats().is_ok());
}

#[test]
fn test_batch_wait_timeout() {
    init_logger();
    let (kernel, gate) = GatedKernel::new();
    let pool = SpectrogramPool::new(PoolConfig::default().with_concurrency(1), kernel).unwrap();

    let mut job = pool
        .process_batches(&ramp(FFT * 2), &plan_batches(2, 1), &stft(), |_, _, _| {})
        .unwrap();
    assert_eq!(job.len(), 2);
    assert!(job.wait_timeout(Duration::from_millis(20)).is_none());

    drop(gate);
    let outcomes = job.wait_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcomes.iter().all(TaskOutcome::is_completed));

    // Outcomes stay with the handle
    let again = job.wait_timeout(Duration::from_millis(1)).unwrap();
    assert_eq!(again, outcomes);
    assert_eq!(job.wait(), outcomes);
}
