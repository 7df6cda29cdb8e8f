//! RF-Spectrogram: Parallel Spectrogram Computation Pool
//!
//! Spreads STFT magnitude work over a fixed set of worker threads:
//! - Static batches: column ranges partitioned up front, FIFO when saturated
//! - Tiles: work-stealing, each free unit pulls the next tile itself
//! - Cooperative cancellation for tile jobs
//! - Terminate / re-initialize at any time
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       SpectrogramPool                            │
//! │                                                                  │
//! │  process_batches / process_tiles / stats / terminate             │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │              Control thread (rf-spectro-control)           │  │
//! │  │  available: [u0] [u2]      pending: [b5] [b6] [t3] ...     │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │        │ UnitRequest                          ▲ UnitReply        │
//! │        ▼                                      │                  │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐             │
//! │  │ unit 0   │ │ unit 1   │ │ unit 2   │ │ unit N   │ → kernel    │
//! │  └──────────┘ └──────────┘ └──────────┘ └──────────┘             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rf_spectrogram::{column_count, plan_batches, PoolConfig, SpectrogramPool, StftParams, WindowFunction};
//!
//! let pool = SpectrogramPool::with_stft_kernel(PoolConfig::default().with_concurrency(4))?;
//! let stft = StftParams::with_window(2048, 512, WindowFunction::Hann);
//!
//! let batches = plan_batches(column_count(audio.len(), 2048, 512), 64);
//! let job = pool.process_batches(&audio, &batches, &stft, |block, percent, unit| {
//!     log::info!("{}..{} from unit {} ({:.0}%)", block.batch_start, block.batch_end, unit, percent);
//! })?;
//! let blocks = job.wait();
//! ```

mod cancel;
mod config;
mod error;
mod kernel;
mod message;
mod pool;
mod task;
mod unit;

pub use cancel::CancelToken;
pub use config::{resolve_concurrency, PoolConfig};
pub use error::{PoolError, PoolResult};
pub use kernel::{hann_window, quantize_db, SpectrogramKernel, StftKernel, WindowFunction};
pub use message::{ColumnBlock, Magnitudes, TileImage, UnitId};
pub use pool::{
    BatchCallback, BatchJob, PoolStats, SpectrogramPool, TileCallback, TileJob, TileJobOutcome,
    UnitStats,
};
pub use task::{
    batch_sample_range, column_count, plan_batches, plan_tiles, BatchRange, CompletionTracker,
    JobId, Quantize, StftParams, TaskOutcome, TileRequest,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
