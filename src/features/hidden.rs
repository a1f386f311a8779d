//! Encoder representations and the augmented representation map

use crate::autograd::Tensor;
use crate::error::{MultitaskError, Result};
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of representation a head consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RepresentationKind {
    /// Per-token, `[batch, seq_len, width]`
    Sequence,
    /// Per-sentence, `[batch, width]`
    Pooled,
    /// Token embedding matrix, `[vocab, width]`
    EmbedTable,
}

impl fmt::Display for RepresentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequence => "seq",
            Self::Pooled => "pooled",
            Self::EmbedTable => "embed_table",
        };
        f.write_str(s)
    }
}

/// A tensor together with its shape; the last dimension is the feature width
#[derive(Debug, Clone)]
pub struct Hidden {
    tensor: Tensor,
    shape: Vec<usize>,
}

impl Hidden {
    /// Wrap `tensor` with `shape`, checking the element count
    pub fn new(tensor: Tensor, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.len() < 2 || tensor.len() != expected {
            return Err(MultitaskError::shape("hidden", shape, vec![tensor.len()]));
        }
        Ok(Self { tensor, shape })
    }

    /// Constant representation from an ndarray (no gradient)
    pub fn from_array(values: ArrayD<f32>) -> Result<Self> {
        let shape = values.shape().to_vec();
        let data: Vec<f32> = values.iter().copied().collect();
        Self::new(Tensor::from_vec(data, false), shape)
    }

    /// Underlying flat tensor
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Full shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Leading (batch) dimension
    pub fn batch_size(&self) -> usize {
        self.shape[0]
    }

    /// Second dimension (sequence length for sequence representations)
    pub fn seq_len(&self) -> usize {
        self.shape[1]
    }

    /// Trailing (feature) dimension
    pub fn width(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }

    /// Number of feature rows (all dimensions but the last)
    pub fn rows(&self) -> usize {
        self.tensor.len() / self.width().max(1)
    }
}

/// Mapping from representation kind to value
///
/// Built from the encoder output each step. The feature-transfer step
/// returns an augmented copy; heads read it and never write.
#[derive(Debug, Clone, Default)]
pub struct Representations {
    entries: BTreeMap<RepresentationKind, Hidden>,
}

impl Representations {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, kind: RepresentationKind, hidden: Hidden) -> Self {
        self.insert(kind, hidden);
        self
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, kind: RepresentationKind, hidden: Hidden) {
        self.entries.insert(kind, hidden);
    }

    /// Entry by kind
    pub fn get(&self, kind: RepresentationKind) -> Result<&Hidden> {
        self.entries
            .get(&kind)
            .ok_or_else(|| MultitaskError::missing(kind.to_string()))
    }

    /// Whether an entry is present
    pub fn contains(&self, kind: RepresentationKind) -> bool {
        self.entries.contains_key(&kind)
    }
}
