//! # promptcache-kv
//!
//! Per-layer attention state storage for incremental prompt caching.
//!
//! Supports:
//! - **Append**: writes K/V blocks at the current offset, growing capacity in fixed steps
//! - **Trim**: discards the most recently written positions so the state can follow a
//!   shortened token prefix
//! - **Multi-layer**: [`LayerStates`] holds one buffer per transformer layer with a
//!   synchronized offset
//! - **Memory tracking**: byte accounting for both allocated and active memory
//!
//! # Memory Layout
//!
//! Keys:   `[batch, n_heads, capacity, key_dim]`
//! Values: `[batch, n_heads, capacity, value_dim]`
//!
//! Only positions `[0, offset)` on the sequence axis are reachable through the public API.

use std::fmt;

/// Default growth unit for buffer capacity, in sequence positions.
pub const DEFAULT_GROWTH_STEP: usize = 256;

/// Represents tensor shape: `[batch, n_heads, seq_len, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KVShape {
    pub batch: usize,
    pub n_heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
}

impl KVShape {
    pub fn new(batch: usize, n_heads: usize, seq_len: usize, head_dim: usize) -> Self {
        Self {
            batch,
            n_heads,
            seq_len,
            head_dim,
        }
    }

    pub fn total_elements(&self) -> usize {
        self.batch * self.n_heads * self.seq_len * self.head_dim
    }
}

impl fmt::Display for KVShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[batch:{}, heads:{}, seq:{}, dim:{}]",
            self.batch, self.n_heads, self.seq_len, self.head_dim
        )
    }
}

/// Error type for attention state operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("Slice holds {len} elements but shape {shape} needs {expected}")]
    SliceLength {
        len: usize,
        expected: usize,
        shape: KVShape,
    },

    #[error("Cannot trim {count} positions from a buffer holding {offset}")]
    InvalidTrim { count: usize, offset: usize },

    #[error("Layer count mismatch: expected {expected}, got {got}")]
    LayerCountMismatch { expected: usize, got: usize },
}

pub type KVResult<T> = Result<T, KVError>;

/// Borrowed key or value block, flattened row-major as `[batch, n_heads, seq_len, head_dim]`.
#[derive(Debug, Clone, Copy)]
pub struct KVSlice<'a> {
    data: &'a [f32],
    shape: KVShape,
}

impl<'a> KVSlice<'a> {
    /// Wrap `data` with its shape.
    ///
    /// # Errors
    /// - `SliceLength`: If `data.len()` does not equal the element count of `shape`
    pub fn new(data: &'a [f32], shape: KVShape) -> KVResult<Self> {
        let expected = shape.total_elements();
        if data.len() != expected {
            return Err(KVError::SliceLength {
                len: data.len(),
                expected,
                shape,
            });
        }
        Ok(Self { data, shape })
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    pub fn shape(&self) -> KVShape {
        self.shape
    }
}

/// Read-only view of a buffer lane covering positions `[0, len)`.
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a> {
    data: &'a [f32],
    shape: KVShape,
    capacity: usize,
}

impl<'a> StateView<'a> {
    /// Logical shape; `seq_len` is the buffer offset.
    pub fn shape(&self) -> KVShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.seq_len
    }

    pub fn is_empty(&self) -> bool {
        self.shape.seq_len == 0
    }

    /// The `head_dim` values at one `(batch, head, position)`.
    ///
    /// # Panics
    /// If any coordinate is out of range. Positions at or past `len()` are never reachable.
    pub fn position(&self, batch: usize, head: usize, pos: usize) -> &'a [f32] {
        assert!(
            batch < self.shape.batch && head < self.shape.n_heads && pos < self.shape.seq_len,
            "position ({batch}, {head}, {pos}) outside view {}",
            self.shape
        );
        let dim = self.shape.head_dim;
        let start = ((batch * self.shape.n_heads + head) * self.capacity + pos) * dim;
        &self.data[start..start + dim]
    }

    pub fn get(&self, batch: usize, head: usize, pos: usize, dim: usize) -> f32 {
        self.position(batch, head, pos)[dim]
    }

    /// Copy the view into a contiguous `[batch, n_heads, len, head_dim]` vector.
    pub fn to_vec(&self) -> Vec<f32> {
        let dim = self.shape.head_dim;
        let rows = self.shape.seq_len * dim;
        let mut out = Vec::with_capacity(self.shape.total_elements());
        for bh in 0..self.shape.batch * self.shape.n_heads {
            let start = bh * self.capacity * dim;
            out.extend_from_slice(&self.data[start..start + rows]);
        }
        out
    }
}

/// Allocation geometry, fixed by the first append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    batch: usize,
    n_heads: usize,
    key_dim: usize,
    value_dim: usize,
}

impl Layout {
    fn describe(&self) -> String {
        format!(
            "[batch:{}, heads:{}, key_dim:{}, value_dim:{}]",
            self.batch, self.n_heads, self.key_dim, self.value_dim
        )
    }
}

/// Single transformer layer's accumulated key and value state.
///
/// Starts unshaped; the first [`append`](Self::append) fixes batch, head count and
/// head dimensions. Capacity grows in multiples of the growth step.
///
/// # Invariants
/// - `offset <= capacity`
/// - `capacity % step == 0`
/// - Positions past `offset` hold zeros and are never exposed
#[derive(Debug, Clone)]
pub struct AttentionStateBuffer {
    keys: Vec<f32>,
    values: Vec<f32>,
    layout: Option<Layout>,
    capacity: usize,
    offset: usize,
    step: usize,
}

impl Default for AttentionStateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AttentionStateBuffer {
    /// Empty buffer growing by [`DEFAULT_GROWTH_STEP`] positions.
    pub fn new() -> Self {
        Self::with_step(DEFAULT_GROWTH_STEP)
    }

    /// Empty buffer growing by `step` positions.
    ///
    /// # Panics
    /// If `step == 0`.
    pub fn with_step(step: usize) -> Self {
        assert!(step > 0, "AttentionStateBuffer requires step > 0");
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            layout: None,
            capacity: 0,
            offset: 0,
            step,
        }
    }

    /// Number of valid positions written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Allocated positions on the sequence axis.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Logical key shape, `None` before the first append.
    pub fn key_shape(&self) -> Option<KVShape> {
        self.layout
            .map(|l| KVShape::new(l.batch, l.n_heads, self.offset, l.key_dim))
    }

    /// Logical value shape, `None` before the first append.
    pub fn value_shape(&self) -> Option<KVShape> {
        self.layout
            .map(|l| KVShape::new(l.batch, l.n_heads, self.offset, l.value_dim))
    }

    /// Append new keys and values at the current offset.
    ///
    /// Grows capacity to the smallest multiple of the step that holds the new end
    /// position when needed. Returns views over `[0, offset)` after the write.
    ///
    /// # Errors
    /// - `ShapeMismatch`: If keys and values disagree on batch, heads or sequence length,
    ///   or if they do not match the geometry fixed by an earlier append
    pub fn append(
        &mut self,
        keys: KVSlice<'_>,
        values: KVSlice<'_>,
    ) -> KVResult<(StateView<'_>, StateView<'_>)> {
        let (ks, vs) = (keys.shape(), values.shape());
        if ks.batch != vs.batch || ks.n_heads != vs.n_heads || ks.seq_len != vs.seq_len {
            return Err(KVError::ShapeMismatch {
                expected: format!("values matching keys {ks}"),
                got: vs.to_string(),
            });
        }

        let layout = Layout {
            batch: ks.batch,
            n_heads: ks.n_heads,
            key_dim: ks.head_dim,
            value_dim: vs.head_dim,
        };
        if let Some(existing) = self.layout {
            if existing != layout {
                return Err(KVError::ShapeMismatch {
                    expected: existing.describe(),
                    got: layout.describe(),
                });
            }
        }

        let new_len = ks.seq_len;
        let end = self.offset + new_len;
        if self.layout.is_none() || end > self.capacity {
            self.grow(layout, end);
        }

        let lanes = layout.batch * layout.n_heads;
        write_positions(
            &mut self.keys,
            keys.data(),
            lanes,
            self.capacity,
            self.offset,
            new_len,
            layout.key_dim,
        );
        write_positions(
            &mut self.values,
            values.data(),
            lanes,
            self.capacity,
            self.offset,
            new_len,
            layout.value_dim,
        );
        self.offset = end;
        self.assert_invariants();

        Ok(self.views_unchecked(layout))
    }

    /// Discard the most recently written `count` positions.
    ///
    /// Capacity is retained; the trimmed positions are zeroed.
    ///
    /// # Errors
    /// - `InvalidTrim`: If `count > offset`. `count == 0` is a no-op.
    pub fn trim(&mut self, count: usize) -> KVResult<()> {
        if count == 0 {
            return Ok(());
        }
        if count > self.offset {
            return Err(KVError::InvalidTrim {
                count,
                offset: self.offset,
            });
        }

        let new_offset = self.offset - count;
        if let Some(layout) = self.layout {
            let lanes = layout.batch * layout.n_heads;
            zero_positions(
                &mut self.keys,
                lanes,
                self.capacity,
                new_offset,
                self.offset,
                layout.key_dim,
            );
            zero_positions(
                &mut self.values,
                lanes,
                self.capacity,
                new_offset,
                self.offset,
                layout.value_dim,
            );
        }
        self.offset = new_offset;
        Ok(())
    }

    /// Read-only key and value views over `[0, offset)`, `None` before the first append.
    pub fn views(&self) -> Option<(StateView<'_>, StateView<'_>)> {
        self.layout.map(|layout| self.views_unchecked(layout))
    }

    /// Total memory allocated for K and V (in bytes).
    pub fn memory_bytes(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<f32>()
    }

    /// Memory used by positions `[0, offset)` (in bytes).
    pub fn active_memory_bytes(&self) -> usize {
        self.layout.map_or(0, |l| {
            let per_position = l.batch * l.n_heads * (l.key_dim + l.value_dim);
            self.offset * per_position * std::mem::size_of::<f32>()
        })
    }

    fn views_unchecked(&self, layout: Layout) -> (StateView<'_>, StateView<'_>) {
        let keys = StateView {
            data: &self.keys,
            shape: KVShape::new(layout.batch, layout.n_heads, self.offset, layout.key_dim),
            capacity: self.capacity,
        };
        let values = StateView {
            data: &self.values,
            shape: KVShape::new(layout.batch, layout.n_heads, self.offset, layout.value_dim),
            capacity: self.capacity,
        };
        (keys, values)
    }

    /// Reallocate to hold `end` positions, keeping only `[0, offset)` of the old content.
    fn grow(&mut self, layout: Layout, end: usize) {
        let new_capacity = end.div_ceil(self.step) * self.step;
        let lanes = layout.batch * layout.n_heads;

        let mut keys = vec![0.0; lanes * new_capacity * layout.key_dim];
        let mut values = vec![0.0; lanes * new_capacity * layout.value_dim];
        if self.layout.is_some() {
            copy_prefix(
                &self.keys,
                &mut keys,
                lanes,
                self.capacity,
                new_capacity,
                self.offset,
                layout.key_dim,
            );
            copy_prefix(
                &self.values,
                &mut values,
                lanes,
                self.capacity,
                new_capacity,
                self.offset,
                layout.value_dim,
            );
        }

        self.keys = keys;
        self.values = values;
        self.capacity = new_capacity;
        self.layout = Some(layout);
    }

    fn assert_invariants(&self) {
        assert!(
            self.offset <= self.capacity,
            "attention state offset {} exceeds capacity {}",
            self.offset,
            self.capacity
        );
        assert!(
            self.capacity % self.step == 0,
            "attention state capacity {} is not a multiple of step {}",
            self.capacity,
            self.step
        );
    }
}

fn write_positions(
    dst: &mut [f32],
    src: &[f32],
    lanes: usize,
    capacity: usize,
    offset: usize,
    len: usize,
    dim: usize,
) {
    let rows = len * dim;
    for lane in 0..lanes {
        let to = (lane * capacity + offset) * dim;
        let from = lane * rows;
        dst[to..to + rows].copy_from_slice(&src[from..from + rows]);
    }
}

fn zero_positions(
    dst: &mut [f32],
    lanes: usize,
    capacity: usize,
    from: usize,
    to: usize,
    dim: usize,
) {
    for lane in 0..lanes {
        let base = lane * capacity;
        dst[(base + from) * dim..(base + to) * dim].fill(0.0);
    }
}

fn copy_prefix(
    src: &[f32],
    dst: &mut [f32],
    lanes: usize,
    src_capacity: usize,
    dst_capacity: usize,
    len: usize,
    dim: usize,
) {
    let rows = len * dim;
    for lane in 0..lanes {
        let from = lane * src_capacity * dim;
        let to = lane * dst_capacity * dim;
        dst[to..to + rows].copy_from_slice(&src[from..from + rows]);
    }
}

/// Attention state for every layer of a model.
///
/// Ensures all layers can be trimmed together; the cache relies on every layer
/// sharing one offset that equals the cached token count.
#[derive(Debug, Clone)]
pub struct LayerStates {
    layers: Vec<AttentionStateBuffer>,
}

impl LayerStates {
    /// Create empty state for `n_layers` layers with the default growth step.
    pub fn new(n_layers: usize) -> Self {
        Self::with_step(n_layers, DEFAULT_GROWTH_STEP)
    }

    /// Create empty state for `n_layers` layers growing by `step` positions.
    ///
    /// # Panics
    /// If `n_layers == 0` or `step == 0`.
    pub fn with_step(n_layers: usize, step: usize) -> Self {
        assert!(n_layers > 0, "LayerStates requires n_layers > 0");
        let layers = (0..n_layers)
            .map(|_| AttentionStateBuffer::with_step(step))
            .collect();
        Self { layers }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, idx: usize) -> Option<&AttentionStateBuffer> {
        self.layers.get(idx)
    }

    /// Mutable access for the decode step, which appends layer by layer.
    pub fn layer_mut(&mut self, idx: usize) -> Option<&mut AttentionStateBuffer> {
        self.layers.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttentionStateBuffer> {
        self.layers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AttentionStateBuffer> {
        self.layers.iter_mut()
    }

    /// Whether every layer holds the same number of positions.
    pub fn is_synchronized(&self) -> bool {
        let first = self.layers[0].offset();
        self.layers.iter().all(|l| l.offset() == first)
    }

    /// Shared offset of all layers.
    ///
    /// # Panics
    /// If layers disagree; call [`reconcile`](Self::reconcile) after a failed step.
    pub fn offset(&self) -> usize {
        assert!(
            self.is_synchronized(),
            "layer offsets out of sync: {:?}",
            self.layers.iter().map(|l| l.offset()).collect::<Vec<_>>()
        );
        self.layers[0].offset()
    }

    /// Smallest offset across layers.
    pub fn min_offset(&self) -> usize {
        self.layers.iter().map(|l| l.offset()).min().unwrap_or(0)
    }

    /// Trim `count` positions from every layer.
    ///
    /// Validates all layers before mutating any.
    pub fn trim(&mut self, count: usize) -> KVResult<()> {
        for layer in &self.layers {
            if count > layer.offset() {
                return Err(KVError::InvalidTrim {
                    count,
                    offset: layer.offset(),
                });
            }
        }
        for layer in &mut self.layers {
            layer.trim(count)?;
        }
        Ok(())
    }

    /// Trim every layer down to `len` positions.
    pub fn truncate(&mut self, len: usize) -> KVResult<()> {
        for layer in &self.layers {
            if layer.offset() < len {
                return Err(KVError::InvalidTrim {
                    count: len,
                    offset: layer.offset(),
                });
            }
        }
        for layer in &mut self.layers {
            let excess = layer.offset() - len;
            layer.trim(excess)?;
        }
        Ok(())
    }

    /// Bring every layer back to the smallest layer offset and return it.
    ///
    /// Used after an interrupted step left some layers ahead of others.
    pub fn reconcile(&mut self) -> usize {
        let target = self.min_offset();
        for layer in &mut self.layers {
            let excess = layer.offset() - target;
            // excess <= offset by construction
            let _ = layer.trim(excess);
        }
        target
    }

    /// Largest allocated capacity across layers.
    pub fn capacity(&self) -> usize {
        self.layers.iter().map(|l| l.capacity()).max().unwrap_or(0)
    }

    /// Total memory across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.memory_bytes()).sum()
    }

    /// Active memory across all layers (based on offset).
    pub fn active_memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.active_memory_bytes()).sum()
    }
}
