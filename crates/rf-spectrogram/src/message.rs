//! Messages exchanged between the control thread and execution units
//!
//! Every compute request carries its audio slice by value: once the request
//! is sent, the unit owns the samples and nothing on the control side can
//! read them again. Replies echo the identifying field of the request
//! (`batch_start` or `tile_index`) together with their kind, which is what
//! the control thread correlates on.

use crate::task::{Quantize, StftParams, TileRequest};

/// Stable index of an execution unit inside its pool
pub type UnitId = usize;

/// Magnitude payload of a finished batch
#[derive(Debug, Clone, PartialEq)]
pub enum Magnitudes {
    /// Linear magnitudes
    Float(Vec<f32>),
    /// dB magnitudes quantized to 0..=255
    Quantized(Vec<u8>),
}

impl Magnitudes {
    pub fn len(&self) -> usize {
        match self {
            Magnitudes::Float(values) => values.len(),
            Magnitudes::Quantized(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Magnitudes::Float(values) => Some(values),
            Magnitudes::Quantized(_) => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            Magnitudes::Quantized(values) => Some(values),
            Magnitudes::Float(_) => None,
        }
    }
}

/// Output of one batch: `batch_end - batch_start` columns of `bins` values,
/// column-major (`data[column * bins + bin]`)
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBlock {
    pub batch_start: usize,
    pub batch_end: usize,
    pub bins: usize,
    pub magnitudes: Magnitudes,
}

impl ColumnBlock {
    /// Number of columns in this block
    pub fn columns(&self) -> usize {
        self.batch_end - self.batch_start
    }
}

/// Output of one tile, `width` columns by `height` bins, column-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileImage {
    pub tile_index: usize,
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

/// Control thread → unit
pub(crate) enum UnitRequest {
    /// Boot handshake, answered with `Ready`
    Boot,
    ComputeBatch {
        audio: Vec<f32>,
        batch_start: usize,
        batch_end: usize,
        stft: StftParams,
    },
    ComputeBatchU8 {
        audio: Vec<f32>,
        batch_start: usize,
        batch_end: usize,
        stft: StftParams,
        quantize: Quantize,
    },
    ComputeTile(TileRequest),
    Shutdown,
}

/// Which kind of completion a reply is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    Batch,
    BatchU8,
    Tile,
}

/// Unit → control thread
#[derive(Debug)]
pub(crate) enum UnitReply {
    Ready,
    BatchComplete(ColumnBlock),
    BatchU8Complete(ColumnBlock),
    TileComplete(TileImage),
    /// Kernel panicked while computing the request identified by `kind`/`key`
    Failed {
        kind: ReplyKind,
        key: usize,
        message: String,
    },
}

impl UnitReply {
    /// Kind and echoed key, `None` for the boot handshake
    pub(crate) fn correlation(&self) -> Option<(ReplyKind, usize)> {
        match self {
            UnitReply::Ready => None,
            UnitReply::BatchComplete(block) => Some((ReplyKind::Batch, block.batch_start)),
            UnitReply::BatchU8Complete(block) => Some((ReplyKind::BatchU8, block.batch_start)),
            UnitReply::TileComplete(image) => Some((ReplyKind::Tile, image.tile_index)),
            UnitReply::Failed { kind, key, .. } => Some((*kind, *key)),
        }
    }
}

/// A reply stamped with its sender and the pool generation it belongs to
#[derive(Debug)]
pub(crate) struct UnitEnvelope {
    pub generation: u64,
    pub unit: UnitId,
    pub reply: UnitReply,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_correlation() {
        let block = ColumnBlock {
            batch_start: 10,
            batch_end: 20,
            bins: 4,
            magnitudes: Magnitudes::Float(vec![0.0; 40]),
        };
        assert_eq!(block.columns(), 10);

        let float = UnitReply::BatchComplete(block.clone());
        let quantized = UnitReply::BatchU8Complete(block);
        assert_eq!(float.correlation(), Some((ReplyKind::Batch, 10)));
        assert_eq!(quantized.correlation(), Some((ReplyKind::BatchU8, 10)));
        assert_eq!(UnitReply::Ready.correlation(), None);
    }

    #[test]
    fn test_magnitudes_accessors() {
        let m = Magnitudes::Quantized(vec![1, 2, 3]);
        assert_eq!(m.len(), 3);
        assert!(m.as_f32().is_none());
        assert_eq!(m.as_u8(), Some(&[1u8, 2, 3][..]));
    }
}
