//! Per-layer ShadowKV cache and the per-model stack that owns `L` of them.
//!
//! This is where [`cache::landmark`], [`cache::outlier`], [`cache::lowrank`],
//! [`cache::offload`], [`cache::retrieval`], [`cache::update`], and
//! [`cache::lifecycle`] are wired together behind the external interface of
//! §6: `prefill_kv_cache`, `build_low_rank`, `get_retrieval_position_ids`,
//! `fetch_values`, `fetch_keys`, `update`, `clear`, `to_device`.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView4};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::buffers::{ChunkId, Position, ResidentStore, ShapeError};
use crate::cache::landmark::{build_landmarks, chunk_ranges, split_local_tail, ChunkRange};
use crate::cache::lifecycle::{CacheState, Lifecycle, LifecycleError};
use crate::cache::lowrank::{reconstruct_rows, truncated_svd, LowRankError, LowRankFactors};
use crate::cache::offload::{OffloadError, ValueOffloadStore};
use crate::cache::retrieval::{affinity_scores, materialize_positions, reduce_group_max, softmax_rows, top_k_chunk_ids};
use crate::cache::update::{self, UpdateError};
use crate::config::ShadowConfig;
use crate::gpu::allocator::{AllocatorError, RegionLocation, VramRegionAllocator};
use crate::gpu::stream::{StreamContext, StreamError};
use crate::transfer::dma_scheduler::{DmaScheduler, StreamKind};
use crate::transfer::gpu_transfer::{GpuTransferEngine, GpuTransferError};

#[derive(Error, Debug)]
pub enum ShadowError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Offload(#[from] OffloadError),
    #[error(transparent)]
    LowRank(#[from] LowRankError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Transfer(#[from] GpuTransferError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("position {0} requested for reconstruction is neither resident nor indexed")]
    UnknownPosition(Position),
}

/// Cosine/sine rotation table for rotary positional embedding, indexed by
/// absolute position. Populated by the model-facing caller
/// ([`crate::inference::attention_kernel`]); the cache treats it opaquely.
pub struct CosSinCache {
    pub cos: Array2<f32>,
    pub sin: Array2<f32>,
}

/// The external collaborator contract from design notes §9:
/// `(U, SV, indices, cos_sin, rope_fn) → key_out`. The cache performs the
/// gather-matmul half ([`reconstruct_rows`]); the caller supplies the
/// rotation half so the portable choreography stays independent of any
/// particular RoPE implementation.
pub type RopeApplyFn<'a> = dyn Fn(ArrayView1<f32>, Position, &CosSinCache) -> Array1<f32> + 'a;

/// Per-`(batch, kv_head)` prefill-time state for one layer.
struct HeadState {
    resident: ResidentStore,
    offload: ValueOffloadStore,
    /// `[n_indexed_chunks, D]`; empty when in dense fallback.
    landmarks: Array2<f32>,
    /// Parallel to `landmarks` rows: absolute `[start, end)` of that chunk.
    landmark_index_map: Vec<ChunkRange>,
    /// Maps an indexed position to the chunk id (row of `landmarks`) it belongs to.
    indexed_chunk_of: BTreeMap<Position, ChunkId>,
    factors: Option<LowRankFactors>,
    /// Maps an indexed position to its row in `factors.sv`.
    position_to_sv_row: BTreeMap<Position, usize>,
    outlier_positions: Vec<Position>,
    local_tail_positions: Vec<Position>,
    /// Positions of the first candidate chunk, pinned resident as the
    /// attention-sink chunk (§2 item 5: the Value Offload Store holds
    /// "post-first-chunk, non-outlier value chunks") and so, like the local
    /// tail, never subject to offload or landmark-affinity eviction.
    sink_positions: Vec<Position>,
    dense_fallback: bool,
    prefill_len: usize,
    generated_len: usize,
}

impl HeadState {
    fn empty() -> Self {
        Self {
            resident: ResidentStore::new(),
            offload: ValueOffloadStore::new(0),
            landmarks: Array2::zeros((0, 0)),
            landmark_index_map: Vec::new(),
            indexed_chunk_of: BTreeMap::new(),
            factors: None,
            position_to_sv_row: BTreeMap::new(),
            outlier_positions: Vec::new(),
            local_tail_positions: Vec::new(),
            sink_positions: Vec::new(),
            dense_fallback: true,
            prefill_len: 0,
            generated_len: 0,
        }
    }

    fn all_resident_positions_sorted(&self) -> Vec<Position> {
        self.resident.positions().collect()
    }
}

/// The ShadowKV cache for one transformer layer, spanning all batches and
/// kv-heads. Owns every buffer described in §3; callers only ever borrow
/// reconstructed views for the duration of one attention call.
pub struct ShadowKvCache {
    layer_idx: usize,
    config: Arc<ShadowConfig>,
    head_dim: usize,
    lifecycle: Lifecycle,
    /// `[batch][kv_head]`.
    heads: Vec<Vec<HeadState>>,
}

impl ShadowKvCache {
    pub fn new(layer_idx: usize, config: Arc<ShadowConfig>, n_kv_heads: usize, head_dim: usize) -> Self {
        let heads = (0..config.batch_size)
            .map(|_| (0..n_kv_heads).map(|_| HeadState::empty()).collect())
            .collect();

        Self {
            layer_idx,
            config,
            head_dim,
            lifecycle: Lifecycle::default(),
            heads,
        }
    }

    pub fn state(&self) -> CacheState {
        self.lifecycle.state()
    }

    /// Builds all prefill-time structures (§4.1–§4.4) for this layer, then
    /// performs the low-rank factorization (§4.3). Called exactly once per
    /// layer in order.
    ///
    /// All three tensors are `[B, H_kv, N, D]`. `k_post_rope` is what gets
    /// stored verbatim for outlier and local-tail chunks; `k_pre_rope` is
    /// used only transiently, for landmark construction, outlier scoring,
    /// and factorization — it is never itself retained.
    pub fn prefill_kv_cache(
        &mut self,
        k_post_rope: ArrayView4<f32>,
        k_pre_rope: ArrayView4<f32>,
        v: ArrayView4<f32>,
    ) -> Result<(), ShadowError> {
        self.lifecycle.begin_prefill()?;

        let (b, h_kv, n, d) = k_post_rope.dim();
        if d != self.head_dim {
            return Err(ShapeError::HeadDim {
                expected: self.head_dim,
                got: d,
            }
            .into());
        }

        for batch in 0..b {
            for kv_head in 0..h_kv {
                let post = k_post_rope.slice(ndarray::s![batch, kv_head, .., ..]);
                let pre = k_pre_rope.slice(ndarray::s![batch, kv_head, .., ..]);
                let val = v.slice(ndarray::s![batch, kv_head, .., ..]);

                let state = self.build_head(batch, kv_head, n, post, pre, val)?;
                *self.head_mut(batch, kv_head)? = state;
            }
        }

        info!(
            layer = self.layer_idx,
            prefill_len = n,
            batches = b,
            kv_heads = h_kv,
            "prefill complete"
        );

        self.lifecycle.finish_prefill()?;
        Ok(())
    }

    fn build_head(
        &self,
        batch: usize,
        kv_head: usize,
        prefill_len: usize,
        k_post_rope: ndarray::ArrayView2<f32>,
        k_pre_rope: ndarray::ArrayView2<f32>,
        v: ndarray::ArrayView2<f32>,
    ) -> Result<HeadState, ShadowError> {
        let cfg = &self.config;
        let chunks = chunk_ranges(prefill_len, cfg.chunk_size);
        let (candidate, tail) = split_local_tail(&chunks, cfg.local_chunk);

        let mut resident = ResidentStore::new();
        let mut local_tail_positions = Vec::new();
        for &(start, end) in tail {
            for p in start..end {
                resident.insert(p, k_post_rope.row(p).to_owned(), v.row(p).to_owned());
                local_tail_positions.push(p);
            }
        }

        let dense_fallback = prefill_len <= (cfg.local_chunk + cfg.outlier_chunk) * cfg.chunk_size;
        if dense_fallback || candidate.is_empty() {
            for &(start, end) in candidate {
                for p in start..end {
                    resident.insert(p, k_post_rope.row(p).to_owned(), v.row(p).to_owned());
                }
            }
            debug!(
                layer = self.layer_idx,
                batch, kv_head, prefill_len, "prefill_len below admission floor; dense resident mode"
            );
            return Ok(HeadState {
                resident,
                offload: ValueOffloadStore::new(self.head_dim),
                landmarks: Array2::zeros((0, self.head_dim)),
                landmark_index_map: Vec::new(),
                indexed_chunk_of: BTreeMap::new(),
                factors: None,
                position_to_sv_row: BTreeMap::new(),
                outlier_positions: Vec::new(),
                local_tail_positions,
                sink_positions: Vec::new(),
                dense_fallback: true,
                prefill_len,
                generated_len: 0,
            });
        }

        // The first remaining candidate chunk is the attention-sink chunk
        // (§2 item 5): pinned resident like the local tail, excluded from
        // outlier scoring and landmark indexing so it can never be dropped
        // from a step's reconstruction set by top-k selection.
        let (&sink_chunk, candidate) = candidate.split_first().expect("non-empty candidate: checked above");
        let mut sink_positions = Vec::new();
        let (sink_start, sink_end) = sink_chunk;
        for p in sink_start..sink_end {
            resident.insert(p, k_post_rope.row(p).to_owned(), v.row(p).to_owned());
            sink_positions.push(p);
        }

        let candidate_landmarks = build_landmarks(k_pre_rope, candidate);
        let outlier_idx = crate::cache::outlier::select_outliers(
            k_pre_rope,
            candidate,
            candidate_landmarks.view(),
            cfg.outlier_chunk,
        );

        let mut outlier_positions = Vec::new();
        for &idx in &outlier_idx {
            let (start, end) = candidate[idx];
            for p in start..end {
                resident.insert(p, k_post_rope.row(p).to_owned(), v.row(p).to_owned());
                outlier_positions.push(p);
            }
        }

        let indexed_idx: Vec<usize> = (0..candidate.len()).filter(|i| !outlier_idx.contains(i)).collect();
        let landmark_index_map: Vec<ChunkRange> = indexed_idx.iter().map(|&i| candidate[i]).collect();
        let mut landmarks = candidate_landmarks.select(ndarray::Axis(0), &indexed_idx);
        for mut row in landmarks.rows_mut() {
            let rounded = cfg.dtype.cast_roundtrip(&row.to_owned());
            row.assign(&rounded);
        }

        let mut indexed_chunk_of = BTreeMap::new();
        let mut offload = ValueOffloadStore::new(self.head_dim);
        for (chunk_id, &(start, end)) in landmark_index_map.iter().enumerate() {
            offload.store(chunk_id, v.slice(ndarray::s![start..end, ..]))?;
            for p in start..end {
                indexed_chunk_of.insert(p, chunk_id);
            }
        }

        let mut head = HeadState {
            resident,
            offload,
            landmarks,
            landmark_index_map,
            indexed_chunk_of,
            factors: None,
            position_to_sv_row: BTreeMap::new(),
            outlier_positions,
            local_tail_positions,
            sink_positions,
            dense_fallback: false,
            prefill_len,
            generated_len: 0,
        };

        self.factorize_head(batch, kv_head, &mut head, k_pre_rope, k_post_rope, v);
        Ok(head)
    }

    /// Performs §4.3 factorization for one already-indexed head. On SVD
    /// non-convergence, falls back to dense resident mode for this head and
    /// emits a warning (§7 numeric failure policy) rather than failing the
    /// whole prefill.
    fn factorize_head(
        &self,
        batch: usize,
        kv_head: usize,
        head: &mut HeadState,
        k_pre_rope: ndarray::ArrayView2<f32>,
        k_post_rope: ndarray::ArrayView2<f32>,
        v: ndarray::ArrayView2<f32>,
    ) {
        if head.dense_fallback || head.landmark_index_map.is_empty() {
            return;
        }

        let indexed_positions: Vec<Position> = head
            .landmark_index_map
            .iter()
            .flat_map(|&(start, end)| start..end)
            .collect();

        let rows: Vec<_> = indexed_positions.iter().map(|&p| k_pre_rope.row(p)).collect();
        let keys_indexed = ndarray::stack(ndarray::Axis(0), &rows).expect("rows share head_dim width");

        match truncated_svd(keys_indexed.view(), self.config.rank, self.layer_idx, kv_head) {
            Ok(mut factors) => {
                // §4.3 numeric policy: factorization runs in f32; the stored
                // factors are down-cast to the configured working precision.
                for mut row in factors.u.rows_mut() {
                    let rounded = self.config.dtype.cast_roundtrip(&row.to_owned());
                    row.assign(&rounded);
                }
                for mut row in factors.sv.rows_mut() {
                    let rounded = self.config.dtype.cast_roundtrip(&row.to_owned());
                    row.assign(&rounded);
                }

                let mut position_to_sv_row = BTreeMap::new();
                for (row, &p) in indexed_positions.iter().enumerate() {
                    position_to_sv_row.insert(p, row);
                }
                head.factors = Some(factors);
                head.position_to_sv_row = position_to_sv_row;
            }
            Err(err) => {
                warn!(
                    layer = self.layer_idx,
                    batch, kv_head, error = %err,
                    "SVD failed to converge; falling back to dense resident mode for this head"
                );
                for &p in &indexed_positions {
                    head.resident.insert(p, k_post_rope.row(p).to_owned(), v.row(p).to_owned());
                }
                head.landmarks = Array2::zeros((0, self.head_dim));
                head.landmark_index_map.clear();
                head.indexed_chunk_of.clear();
                head.offload = ValueOffloadStore::new(self.head_dim);
                head.dense_fallback = true;
            }
        }
    }

    /// Explicit §4.3 entry point, re-derivable from fresh pre-RoPE keys
    /// without disturbing the indexing (outlier/local-tail/offload) already
    /// committed by `prefill_kv_cache`. Exposed separately because the
    /// external interface (§6) lists it as its own operation; `prefill_kv_cache`
    /// already calls it once as part of a normal prefill.
    pub fn build_low_rank(&mut self, k_pre_rope: ArrayView4<f32>, k_post_rope: ArrayView4<f32>, v: ArrayView4<f32>) -> Result<(), ShadowError> {
        let (b, h_kv, _, _) = k_pre_rope.dim();
        for batch in 0..b {
            for kv_head in 0..h_kv {
                let pre = k_pre_rope.slice(ndarray::s![batch, kv_head, .., ..]);
                let post = k_post_rope.slice(ndarray::s![batch, kv_head, .., ..]);
                let val = v.slice(ndarray::s![batch, kv_head, .., ..]);
                let mut head = std::mem::replace(self.head_mut(batch, kv_head)?, HeadState::empty());
                self.factorize_head(batch, kv_head, &mut head, pre, post, val);
                *self.head_mut(batch, kv_head)? = head;
            }
        }
        Ok(())
    }

    /// §4.5 steps 1–4 and step 7: affinity, group reduction, top-k selection,
    /// index materialisation, unioned with the generated-so-far range.
    /// `query_post_rope` is `[G, D]` for one `(batch, kv_head)`'s group of
    /// query heads.
    pub fn get_retrieval_position_ids(
        &mut self,
        batch: usize,
        kv_head: usize,
        query_post_rope: ndarray::ArrayView2<f32>,
    ) -> Result<Vec<Position>, ShadowError> {
        self.require_prefilled()?;
        // First retrieval call of a decode step moves Ready -> Decoding;
        // a step already in Decoding (a later layer/kv-head of the same
        // step) leaves the state untouched.
        if self.lifecycle.state() == CacheState::Ready {
            self.lifecycle.begin_decode()?;
        }
        let head = self.head(batch, kv_head)?;

        if head.dense_fallback {
            return Ok(head.all_resident_positions_sorted());
        }

        let mut affinity = affinity_scores(query_post_rope, head.landmarks.view());
        softmax_rows(&mut affinity);
        let reduced = reduce_group_max(affinity.view());

        let s_chunks = self.config.sparse_budget / self.config.chunk_size;
        let selected = top_k_chunk_ids(&reduced, s_chunks);

        // §4.5 step 7 / Testable Property #2: the reconstruction set must
        // carry every position generated so far this decode, not just the
        // prefill-time outlier/tail/sink/indexed positions, so a later
        // decode step can attend to an earlier step's own output.
        let generated = head.prefill_len..(head.prefill_len + head.generated_len);

        Ok(materialize_positions(
            &selected,
            &head.landmark_index_map,
            &head.local_tail_positions,
            &head.outlier_positions,
            &head.sink_positions,
            generated,
        ))
    }

    /// §4.5 step 5 (value stream): gather values for `positions`, ascending.
    pub fn fetch_values(&self, batch: usize, kv_head: usize, positions: &[Position]) -> Result<Array2<f32>, ShadowError> {
        self.require_prefilled()?;
        let head = self.head(batch, kv_head)?;
        let mut out = Array2::<f32>::zeros((positions.len(), self.head_dim));

        for (i, &p) in positions.iter().enumerate() {
            if let Some(entry) = head.resident.get(p) {
                out.row_mut(i).assign(&entry.value);
                continue;
            }
            let chunk_id = *head.indexed_chunk_of.get(&p).ok_or(ShadowError::UnknownPosition(p))?;
            let (start, _) = head.landmark_index_map[chunk_id];
            let chunk_rows = head.offload.gather(&[chunk_id])?;
            out.row_mut(i).assign(&chunk_rows.row(p - start));
        }

        Ok(out)
    }

    /// §4.5 step 5 (reconstruction stream): reconstruct + rotate keys for
    /// `positions`. Resident positions are returned verbatim (already
    /// post-RoPE); indexed positions are reconstructed via the stored
    /// `(U, SV)` pair and then rotated by `rope_apply`.
    pub fn fetch_keys(
        &self,
        batch: usize,
        kv_head: usize,
        positions: &[Position],
        cos_sin: &CosSinCache,
        rope_apply: &RopeApplyFn,
    ) -> Result<Array2<f32>, ShadowError> {
        self.require_prefilled()?;
        let head = self.head(batch, kv_head)?;
        let mut out = Array2::<f32>::zeros((positions.len(), self.head_dim));

        for (i, &p) in positions.iter().enumerate() {
            if let Some(entry) = head.resident.get(p) {
                out.row_mut(i).assign(&entry.key);
                continue;
            }
            let factors = head.factors.as_ref().ok_or(ShadowError::UnknownPosition(p))?;
            let row = *head.position_to_sv_row.get(&p).ok_or(ShadowError::UnknownPosition(p))?;
            let pre_rope = reconstruct_rows(factors, &[row]);
            let rotated = rope_apply(pre_rope.row(0), p, cos_sin);
            out.row_mut(i).assign(&rotated);
        }

        Ok(out)
    }

    /// §4.6 append: stores the newly generated step's raw `k`, `v` at the
    /// tail of the resident buffers.
    pub fn update(&mut self, batch: usize, kv_head: usize, k_new: ArrayView1<f32>, v_new: ArrayView1<f32>) -> Result<(), ShadowError> {
        self.require_prefilled()?;
        let max_length = self.config.max_length;
        let head = self.head_mut(batch, kv_head)?;
        head.generated_len = update::append(&mut head.resident, head.prefill_len, head.generated_len, max_length, k_new, v_new)?;
        if self.lifecycle.state() == CacheState::Decoding {
            self.lifecycle.finish_decode()?;
        }
        Ok(())
    }

    /// Returns the cache to `Uninitialised`, discarding per-head state while
    /// keeping the head grid's shape (batch/kv-head count) allocated.
    pub fn clear(&mut self) {
        for row in &mut self.heads {
            for head in row.iter_mut() {
                *head = HeadState::empty();
            }
        }
        self.lifecycle.clear();
    }

    /// For the offloaded variant: migrates pinned-host staging as needed.
    /// No-op in the CPU-only build; a CUDA build would route through
    /// [`crate::gpu::allocator`] and [`crate::transfer`].
    pub fn to_device(&self) -> Result<(), ShadowError> {
        debug!(layer = self.layer_idx, "to_device is a no-op without the cuda feature");
        Ok(())
    }

    pub fn prefill_len(&self, batch: usize, kv_head: usize) -> Result<usize, ShadowError> {
        Ok(self.head(batch, kv_head)?.prefill_len)
    }

    pub fn generated_len(&self, batch: usize, kv_head: usize) -> Result<usize, ShadowError> {
        Ok(self.head(batch, kv_head)?.generated_len)
    }

    pub fn is_dense_fallback(&self, batch: usize, kv_head: usize) -> Result<bool, ShadowError> {
        Ok(self.head(batch, kv_head)?.dense_fallback)
    }

    pub fn outlier_count(&self, batch: usize, kv_head: usize) -> Result<usize, ShadowError> {
        Ok(self.head(batch, kv_head)?.outlier_positions.len())
    }

    /// The absolute positions pinned resident as outliers at prefill (§4.2),
    /// fixed for the lifetime of the cache. Exposed so callers (and tests)
    /// can confirm a decode step's reconstruction set still carries them.
    pub fn outlier_positions(&self, batch: usize, kv_head: usize) -> Result<Vec<Position>, ShadowError> {
        Ok(self.head(batch, kv_head)?.outlier_positions.clone())
    }

    /// The absolute positions of the first candidate chunk, pinned resident
    /// as the attention-sink chunk at prefill (§2 item 5).
    pub fn sink_positions(&self, batch: usize, kv_head: usize) -> Result<Vec<Position>, ShadowError> {
        Ok(self.head(batch, kv_head)?.sink_positions.clone())
    }

    /// Rejects decode-shaped operations issued in `Uninitialised` or
    /// `Prefilling` (§4.5, §4.7).
    fn require_prefilled(&self) -> Result<(), ShadowError> {
        match self.lifecycle.state() {
            CacheState::Ready | CacheState::Decoding => Ok(()),
            other => Err(LifecycleError::DecodeBeforePrefill(other).into()),
        }
    }

    fn head(&self, batch: usize, kv_head: usize) -> Result<&HeadState, ShadowError> {
        self.heads
            .get(batch)
            .and_then(|row| row.get(kv_head))
            .ok_or(ShapeError::BatchOutOfRange {
                index: batch,
                size: self.heads.len(),
            }
            .into())
    }

    fn head_mut(&mut self, batch: usize, kv_head: usize) -> Result<&mut HeadState, ShadowError> {
        let n_batches = self.heads.len();
        self.heads
            .get_mut(batch)
            .and_then(|row| row.get_mut(kv_head))
            .ok_or(ShapeError::BatchOutOfRange {
                index: batch,
                size: n_batches,
            }
            .into())
    }
}

/// The per-model singleton: one [`ShadowKvCache`] per transformer layer, plus
/// the shared §5 stream choreography every layer's decode step drives.
///
/// A single `StreamContext`, `DmaScheduler`, and `GpuTransferEngine` are
/// shared across all layers: the copy and reconstruction streams, and the
/// device scratch region they stage into, are reused step over step and
/// layer over layer rather than duplicated per layer (§3: "the device
/// scratch buffer is overwritten each step").
pub struct ShadowKvStack {
    layers: Vec<ShadowKvCache>,
    stream: StreamContext,
    dma: DmaScheduler,
    transfer: GpuTransferEngine,
    value_scratch: RegionLocation,
    key_scratch: RegionLocation,
}

const DMA_MAX_CONCURRENT: usize = 4;

impl ShadowKvStack {
    pub fn new(config: Arc<ShadowConfig>, n_layers: usize, n_kv_heads: usize, head_dim: usize) -> Self {
        let layers = (0..n_layers)
            .map(|layer_idx| ShadowKvCache::new(layer_idx, config.clone(), n_kv_heads, head_dim))
            .collect();

        // One reconstruction-set's worth of positions, reused as the scratch
        // region's size for every (layer, kv_head) in turn (§3, §4.5).
        let scratch_positions = config.sparse_budget + (config.local_chunk + config.outlier_chunk) * config.chunk_size;
        let scratch_bytes = scratch_positions * head_dim * std::mem::size_of::<f32>();

        // Capacity is sized to exactly the two regions requested below, so
        // allocation can never fail here; construction-time exhaustion (§7)
        // is instead a concern of the real CUDA allocator this stands in for.
        let mut allocator = VramRegionAllocator::new(&[(0, scratch_bytes * 2)]);
        let value_scratch = allocator
            .allocate_region(0, "device_value_scratch", scratch_bytes)
            .expect("capacity sized exactly for the value scratch region");
        let key_scratch = allocator
            .allocate_region(0, "device_key_scratch", scratch_bytes)
            .expect("capacity sized exactly for the key scratch region");

        Self {
            layers,
            stream: StreamContext::new(),
            dma: DmaScheduler::new(DMA_MAX_CONCURRENT),
            transfer: GpuTransferEngine::new(1, scratch_bytes),
            value_scratch,
            key_scratch,
        }
    }

    pub fn layer(&self, idx: usize) -> &ShadowKvCache {
        &self.layers[idx]
    }

    pub fn layer_mut(&mut self, idx: usize) -> &mut ShadowKvCache {
        &mut self.layers[idx]
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn clear_all(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Begins one decode step's stream choreography (§4.7, §5, §9): every
    /// `(layer, kv_head)`'s value/key fetch for this step must record
    /// against the returned generation before [`Self::barrier`] will pass.
    pub fn begin_decode_step(&mut self) -> u64 {
        self.stream.begin_step()
    }

    /// Stages one `(layer, kv_head)`'s gathered value rows through the copy
    /// stream's DMA scheduler and host→device transfer engine, then records
    /// the value-stream-complete event for `generation` (§4.5 step 5, §5).
    pub async fn stage_value_stream(
        &mut self,
        generation: u64,
        positions: &[Position],
        values: &Array2<f32>,
    ) -> Result<(), ShadowError> {
        self.drain_dma(positions, StreamKind::Copy);
        let bytes: &[u8] = bytemuck::cast_slice(values.as_slice().expect("reconstruction rows are contiguous"));
        self.transfer.copy_to_device(bytes, &self.value_scratch, 0).await?;
        self.stream.record_value_stream(generation);
        Ok(())
    }

    /// Stages one `(layer, kv_head)`'s reconstructed key rows through the
    /// reconstruction stream's DMA scheduler and transfer engine, then
    /// records the key-stream-complete event for `generation`.
    pub async fn stage_key_stream(
        &mut self,
        generation: u64,
        positions: &[Position],
        keys: &Array2<f32>,
    ) -> Result<(), ShadowError> {
        self.drain_dma(positions, StreamKind::Reconstruction);
        let bytes: &[u8] = bytemuck::cast_slice(keys.as_slice().expect("reconstruction rows are contiguous"));
        self.transfer.copy_to_device(bytes, &self.key_scratch, 0).await?;
        self.stream.record_key_stream(generation);
        Ok(())
    }

    fn drain_dma(&mut self, positions: &[Position], stream: StreamKind) {
        self.dma.plan_step(positions, |_| None, stream);
        while self.dma.next().is_some() {
            self.dma.complete(true);
        }
    }

    /// The primary stream's explicit wait (§4.7, §9): must succeed before the
    /// attention kernel is allowed to read this step's device scratch.
    pub fn barrier(&self, generation: u64) -> Result<(), StreamError> {
        self.stream.barrier(generation)
    }

    pub fn dma_stats(&self) -> crate::transfer::dma_scheduler::DmaStats {
        self.dma.stats()
    }

    pub fn transfer_stats(&self) -> crate::transfer::gpu_transfer::TransferStats {
        self.transfer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn make_config(max_length: usize, sparse_budget: usize, rank: usize, chunk_size: usize, local_chunk: usize, outlier_chunk: usize) -> Arc<ShadowConfig> {
        Arc::new(ShadowConfig {
            max_length,
            batch_size: 1,
            sparse_budget,
            rank,
            chunk_size,
            local_chunk,
            outlier_chunk,
            device: "cpu".to_string(),
            dtype: crate::cache::dtype::StorageDtype::F32,
        })
    }

    fn identity_rope(row: ndarray::ArrayView1<f32>, _pos: Position, _cos_sin: &CosSinCache) -> Array1<f32> {
        row.to_owned()
    }

    #[test]
    fn dense_degenerate_mode_reconstructs_verbatim() {
        // prefill_len <= (T_local + K_outlier) * C -> dense fallback.
        let cfg = make_config(256, 256, 2, 8, 4, 0);
        let mut cache = ShadowKvCache::new(0, cfg, 1, 2);

        let n = 16; // <= (4+0)*8 = 32
        let k_post = Array4::<f32>::from_shape_fn((1, 1, n, 2), |(_, _, p, d)| (p * 2 + d) as f32);
        let v = k_post.clone();

        cache.prefill_kv_cache(k_post.view(), k_post.view(), v.view()).unwrap();
        assert!(cache.is_dense_fallback(0, 0).unwrap());

        let positions: Vec<usize> = (0..n).collect();
        let cos_sin = CosSinCache { cos: Array2::zeros((1, 1)), sin: Array2::zeros((1, 1)) };
        let keys = cache.fetch_keys(0, 0, &positions, &cos_sin, &identity_rope).unwrap();
        let values = cache.fetch_values(0, 0, &positions).unwrap();

        for p in 0..n {
            assert_eq!(keys.row(p), k_post.slice(ndarray::s![0, 0, p, ..]));
            assert_eq!(values.row(p), v.slice(ndarray::s![0, 0, p, ..]));
        }
    }

    #[test]
    fn local_tail_is_preserved_verbatim() {
        let cfg = make_config(2048, 256, 4, 8, 4, 2);
        let mut cache = ShadowKvCache::new(0, cfg, 1, 4);

        let n = 256; // large enough to avoid dense fallback
        let k_post = Array4::<f32>::from_shape_fn((1, 1, n, 4), |(_, _, p, d)| ((p * 4 + d) as f32).sin());
        let v = k_post.clone();

        cache.prefill_kv_cache(k_post.view(), k_post.view(), v.view()).unwrap();
        assert!(!cache.is_dense_fallback(0, 0).unwrap());

        // Last 32 positions (T_local=4, C=8) must be resident verbatim.
        let tail_positions: Vec<usize> = (n - 32..n).collect();
        let cos_sin = CosSinCache { cos: Array2::zeros((1, 1)), sin: Array2::zeros((1, 1)) };
        let keys = cache.fetch_keys(0, 0, &tail_positions, &cos_sin, &identity_rope).unwrap();

        for (i, &p) in tail_positions.iter().enumerate() {
            assert_eq!(keys.row(i), k_post.slice(ndarray::s![0, 0, p, ..]));
        }
    }

    #[test]
    fn append_then_fetch_returns_the_same_step_verbatim() {
        let cfg = make_config(2048, 256, 4, 8, 4, 2);
        let mut cache = ShadowKvCache::new(0, cfg, 1, 4);

        let n = 256;
        let k_post = Array4::<f32>::from_shape_fn((1, 1, n, 4), |(_, _, p, d)| ((p * 4 + d) as f32).cos());
        let v = k_post.clone();
        cache.prefill_kv_cache(k_post.view(), k_post.view(), v.view()).unwrap();

        let new_k = Array1::from(vec![9.0, 9.0, 9.0, 9.0]);
        let new_v = Array1::from(vec![7.0, 7.0, 7.0, 7.0]);
        cache.update(0, 0, new_k.view(), new_v.view()).unwrap();

        let cos_sin = CosSinCache { cos: Array2::zeros((1, 1)), sin: Array2::zeros((1, 1)) };
        let got_k = cache.fetch_keys(0, 0, &[n], &cos_sin, &identity_rope).unwrap();
        let got_v = cache.fetch_values(0, 0, &[n]).unwrap();
        assert_eq!(got_k.row(0), new_k.view());
        assert_eq!(got_v.row(0), new_v.view());
    }

    #[test]
    fn prefill_with_wrong_batch_extent_is_a_shape_error_not_a_panic() {
        // Cache was constructed for batch_size = 1; feed it a batch-2 tensor.
        let cfg = make_config(256, 256, 2, 8, 4, 0);
        let mut cache = ShadowKvCache::new(0, cfg, 1, 2);

        let n = 16;
        let k_post = Array4::<f32>::from_shape_fn((2, 1, n, 2), |(_, _, p, d)| (p * 2 + d) as f32);
        let v = k_post.clone();

        let err = cache.prefill_kv_cache(k_post.view(), k_post.view(), v.view());
        assert!(matches!(err, Err(ShadowError::Shape(ShapeError::BatchOutOfRange { .. }))));
    }

    #[test]
    fn decode_before_prefill_is_rejected() {
        let cfg = make_config(256, 256, 2, 8, 4, 0);
        let mut cache = ShadowKvCache::new(0, cfg, 1, 2);
        let q = Array2::<f32>::zeros((1, 2));
        let err = cache.get_retrieval_position_ids(0, 0, q.view());
        assert!(matches!(
            err,
            Err(ShadowError::Lifecycle(LifecycleError::DecodeBeforePrefill(CacheState::Uninitialised)))
        ));
    }

    #[tokio::test]
    async fn stack_barrier_rejects_until_both_streams_are_staged() {
        let cfg = make_config(256, 256, 2, 8, 4, 0);
        let mut stack = ShadowKvStack::new(cfg, 1, 1, 2);

        let generation = stack.begin_decode_step();
        assert!(stack.barrier(generation).is_err());

        let values = Array2::<f32>::zeros((1, 2));
        stack.stage_value_stream(generation, &[0], &values).await.unwrap();
        assert!(stack.barrier(generation).is_err(), "key stream not yet staged");

        let keys = Array2::<f32>::zeros((1, 2));
        stack.stage_key_stream(generation, &[0], &keys).await.unwrap();
        assert!(stack.barrier(generation).is_ok());
    }

    #[tokio::test]
    async fn stack_barrier_rejects_a_stale_prior_generation() {
        let cfg = make_config(256, 256, 2, 8, 4, 0);
        let mut stack = ShadowKvStack::new(cfg, 1, 1, 2);

        let step1 = stack.begin_decode_step();
        let rows = Array2::<f32>::zeros((1, 2));
        stack.stage_value_stream(step1, &[0], &rows).await.unwrap();
        stack.stage_key_stream(step1, &[0], &rows).await.unwrap();
        assert!(stack.barrier(step1).is_ok());

        let step2 = stack.begin_decode_step();
        // Neither stream has recorded for step2 yet.
        assert!(stack.barrier(step2).is_err());
    }
}
