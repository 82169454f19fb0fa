use crate::error::SplatError;
use crate::geom::CameraPose;
use glam::Vec3;

pub const DEFAULT_PRECISION_BITS: u8 = 16;
pub const MAX_PRECISION_BITS: u8 = 24;

pub(crate) const POS_FP_BITS: u32 = 6;
pub(crate) const AXIS_FP_BITS: u32 = 10;

/// Largest camera-relative coordinate magnitude for which the fixed-point
/// dot product stays inside an i32 accumulator: the three-term sum needs
/// `POS_FP_BITS + AXIS_FP_BITS` fractional bits plus two headroom bits.
pub const INTEGER_SAFE_EXTENT: f32 = (i32::MAX >> (POS_FP_BITS + AXIS_FP_BITS + 2)) as f32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    BackToFront,
    FrontToBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthMode {
    /// Fixed-point depth, fastest. Candidate sets whose extent risks
    /// overflowing the accumulator fall back to `Float` unless
    /// `require_integer` is set.
    #[default]
    Integer,
    Float,
}

#[derive(Debug, Clone, Copy)]
pub struct SortConfig {
    pub direction: SortDirection,
    pub depth_mode: DepthMode,
    /// Depth-map bucket count is `1 << precision_bits`.
    pub precision_bits: u8,
    /// Candidates with opacity below this are dropped from the ordering.
    pub alpha_threshold: Option<u8>,
    /// Surface `IntegerOverflowRisk` instead of silently falling back.
    pub require_integer: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            direction: SortDirection::BackToFront,
            depth_mode: DepthMode::Integer,
            precision_bits: DEFAULT_PRECISION_BITS,
            alpha_threshold: None,
            require_integer: false,
        }
    }
}

/// Strategy for producing per-splat depth, fixed at engine construction:
/// either computed on the CPU from positions, or handed in precomputed
/// from a device pass.
pub trait DepthSource {
    /// Depth of each candidate along the camera forward axis.
    fn float_depths(&self, pose: &CameraPose, candidates: &[u32], out: &mut Vec<f32>);

    /// Fixed-point depths with an i32 accumulator. Refuses candidate sets
    /// whose extent exceeds `INTEGER_SAFE_EXTENT`.
    fn integer_depths(
        &self,
        pose: &CameraPose,
        candidates: &[u32],
        out: &mut Vec<i32>,
    ) -> Result<(), SplatError>;
}

/// CPU depth path over the store's position column.
pub struct CameraDepth<'a> {
    positions: &'a [f32],
}

impl<'a> CameraDepth<'a> {
    pub fn new(positions: &'a [f32]) -> Self {
        Self { positions }
    }

    #[inline]
    fn point(&self, i: u32) -> Vec3 {
        let p = &self.positions[i as usize * 3..i as usize * 3 + 3];
        Vec3::new(p[0], p[1], p[2])
    }
}

impl DepthSource for CameraDepth<'_> {
    fn float_depths(&self, pose: &CameraPose, candidates: &[u32], out: &mut Vec<f32>) {
        out.clear();
        out.reserve(candidates.len());
        for &i in candidates {
            out.push((self.point(i) - pose.position).dot(pose.forward));
        }
    }

    fn integer_depths(
        &self,
        pose: &CameraPose,
        candidates: &[u32],
        out: &mut Vec<i32>,
    ) -> Result<(), SplatError> {
        let mut extent = 0.0f32;
        for &i in candidates {
            let rel = self.point(i) - pose.position;
            extent = extent.max(rel.abs().max_element());
        }
        if extent > INTEGER_SAFE_EXTENT {
            return Err(SplatError::IntegerOverflowRisk {
                extent,
                limit: INTEGER_SAFE_EXTENT,
            });
        }

        let pos_scale = (1i32 << POS_FP_BITS) as f32;
        let axis_scale = (1i32 << AXIS_FP_BITS) as f32;
        let ax = (pose.forward.x * axis_scale).round() as i32;
        let ay = (pose.forward.y * axis_scale).round() as i32;
        let az = (pose.forward.z * axis_scale).round() as i32;
        out.clear();
        out.reserve(candidates.len());
        for &i in candidates {
            let rel = self.point(i) - pose.position;
            let x = (rel.x * pos_scale).round() as i32;
            let y = (rel.y * pos_scale).round() as i32;
            let z = (rel.z * pos_scale).round() as i32;
            out.push(x * ax + y * ay + z * az);
        }
        Ok(())
    }
}

/// Hybrid depth path: per-splat depth was already computed on the graphics
/// device for the current view; the array is indexed by global splat index.
pub struct PrecomputedDepth<'a> {
    depths: &'a [f32],
}

impl<'a> PrecomputedDepth<'a> {
    pub fn new(depths: &'a [f32]) -> Self {
        Self { depths }
    }
}

impl DepthSource for PrecomputedDepth<'_> {
    fn float_depths(&self, _pose: &CameraPose, candidates: &[u32], out: &mut Vec<f32>) {
        out.clear();
        out.reserve(candidates.len());
        for &i in candidates {
            out.push(self.depths[i as usize]);
        }
    }

    fn integer_depths(
        &self,
        _pose: &CameraPose,
        candidates: &[u32],
        out: &mut Vec<i32>,
    ) -> Result<(), SplatError> {
        let mut extent = 0.0f32;
        for &i in candidates {
            extent = extent.max(self.depths[i as usize].abs());
        }
        if extent > INTEGER_SAFE_EXTENT {
            return Err(SplatError::IntegerOverflowRisk {
                extent,
                limit: INTEGER_SAFE_EXTENT,
            });
        }
        let scale = (1i32 << (POS_FP_BITS + AXIS_FP_BITS)) as f32;
        out.clear();
        out.reserve(candidates.len());
        for &i in candidates {
            out.push((self.depths[i as usize] * scale).round() as i32);
        }
        Ok(())
    }
}

/// Counting-sort ordering engine. One pass assigns every candidate to a
/// quantized depth bucket, a prefix sum turns bucket counts into offsets,
/// and a stable scatter emits the ordering, O(n) in the candidate count.
/// Scratch buffers persist across passes.
#[derive(Debug)]
pub struct SplatSorter {
    config: SortConfig,
    kept: Vec<u32>,
    float_depths: Vec<f32>,
    int_depths: Vec<i32>,
    buckets: Vec<u32>,
    counts: Vec<u32>,
}

impl SplatSorter {
    pub fn new(mut config: SortConfig) -> Self {
        config.precision_bits = config.precision_bits.clamp(1, MAX_PRECISION_BITS);
        Self {
            config,
            kept: Vec::new(),
            float_depths: Vec::new(),
            int_depths: Vec::new(),
            buckets: Vec::new(),
            counts: Vec::new(),
        }
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    pub fn set_config(&mut self, mut config: SortConfig) {
        config.precision_bits = config.precision_bits.clamp(1, MAX_PRECISION_BITS);
        self.config = config;
    }

    /// Produces a freshly allocated ordering of `candidates` for alpha
    /// compositing. `opacities` is the store's opacity column (one byte
    /// per splat, global-indexed) and is only consulted when the config
    /// carries an alpha threshold. An empty candidate set yields an empty
    /// ordering.
    pub fn sort<S: DepthSource>(
        &mut self,
        source: &S,
        pose: &CameraPose,
        candidates: &[u32],
        opacities: Option<&[u8]>,
    ) -> Result<Vec<u32>, SplatError> {
        self.kept.clear();
        let filtered = match (self.config.alpha_threshold, opacities) {
            (Some(threshold), Some(alpha)) => {
                self.kept
                    .extend(candidates.iter().copied().filter(|&i| alpha[i as usize] >= threshold));
                true
            }
            _ => false,
        };
        let kept: &[u32] = if filtered { &self.kept } else { candidates };
        if kept.is_empty() {
            return Ok(Vec::new());
        }

        match self.config.depth_mode {
            DepthMode::Float => {
                source.float_depths(pose, kept, &mut self.float_depths);
                Ok(sort_by_float_depths(
                    kept,
                    &self.float_depths,
                    &mut self.buckets,
                    &mut self.counts,
                    self.config.precision_bits,
                    self.config.direction,
                ))
            }
            DepthMode::Integer => {
                match source.integer_depths(pose, kept, &mut self.int_depths) {
                    Ok(()) => Ok(sort_by_int_depths(
                        kept,
                        &self.int_depths,
                        &mut self.counts,
                        self.config.precision_bits,
                        self.config.direction,
                    )),
                    Err(SplatError::IntegerOverflowRisk { extent, limit })
                        if !self.config.require_integer =>
                    {
                        tracing::warn!(
                            extent,
                            limit,
                            "candidate extent unsafe for integer depth, falling back to float mode"
                        );
                        source.float_depths(pose, kept, &mut self.float_depths);
                        Ok(sort_by_float_depths(
                            kept,
                            &self.float_depths,
                            &mut self.buckets,
                            &mut self.counts,
                            self.config.precision_bits,
                            self.config.direction,
                        ))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

fn sort_by_float_depths(
    kept: &[u32],
    depths: &[f32],
    buckets: &mut Vec<u32>,
    counts: &mut Vec<u32>,
    precision_bits: u8,
    direction: SortDirection,
) -> Vec<u32> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &d in depths {
        min = min.min(d);
        max = max.max(d);
    }
    if min >= max {
        return kept.to_vec();
    }

    let bucket_count = 1usize << precision_bits;
    let max_bucket = (bucket_count - 1) as u32;
    let inv_step = max_bucket as f32 / (max - min);
    vectorized::bucket_indices(depths, min, inv_step, buckets);
    scatter(kept, |i| buckets[i].min(max_bucket), counts, bucket_count, direction)
}

fn sort_by_int_depths(
    kept: &[u32],
    depths: &[i32],
    counts: &mut Vec<u32>,
    precision_bits: u8,
    direction: SortDirection,
) -> Vec<u32> {
    let mut min = i32::MAX;
    let mut max = i32::MIN;
    for &d in depths {
        min = min.min(d);
        max = max.max(d);
    }
    if min >= max {
        return kept.to_vec();
    }

    let bucket_count = 1usize << precision_bits;
    let max_code = (bucket_count - 1) as u64;
    let range = (max as i64 - min as i64) as u64;
    // Reciprocal multiply keeps the per-splat work division-free.
    let mult = (max_code << 32) / range;
    scatter(
        kept,
        |i| {
            let delta = (depths[i] as i64 - min as i64) as u64;
            ((delta * mult) >> 32) as u32
        },
        counts,
        bucket_count,
        direction,
    )
}

/// Counting-sort core: histogram, direction-aware prefix sum, stable
/// scatter of the kept indices.
fn scatter(
    kept: &[u32],
    bucket_of: impl Fn(usize) -> u32,
    counts: &mut Vec<u32>,
    bucket_count: usize,
    direction: SortDirection,
) -> Vec<u32> {
    counts.clear();
    counts.resize(bucket_count, 0);
    for i in 0..kept.len() {
        counts[bucket_of(i) as usize] += 1;
    }

    let mut acc = 0u32;
    match direction {
        SortDirection::BackToFront => {
            for b in (0..bucket_count).rev() {
                let c = counts[b];
                counts[b] = acc;
                acc += c;
            }
        }
        SortDirection::FrontToBack => {
            for b in 0..bucket_count {
                let c = counts[b];
                counts[b] = acc;
                acc += c;
            }
        }
    }

    let mut out = vec![0u32; kept.len()];
    for (i, &splat) in kept.iter().enumerate() {
        let b = bucket_of(i) as usize;
        out[counts[b] as usize] = splat;
        counts[b] += 1;
    }
    out
}

/// Bucket-index computation for the float path. On x86_64 the hot loop is
/// 8-wide under AVX2 with a 4-wide SSE2 baseline; elsewhere it is scalar.
mod vectorized {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            pub(super) fn bucket_indices(
                depths: &[f32],
                min: f32,
                inv_step: f32,
                out: &mut Vec<u32>,
            ) {
                out.clear();
                out.resize(depths.len(), 0);
                if is_x86_feature_detected!("avx2") {
                    unsafe { fill_avx2(depths, min, inv_step, out) }
                } else {
                    unsafe { fill_sse2(depths, min, inv_step, out) }
                }
            }

            unsafe fn fill_sse2(depths: &[f32], min: f32, inv_step: f32, out: &mut [u32]) {
                use std::arch::x86_64::*;
                let min_v = _mm_set1_ps(min);
                let step_v = _mm_set1_ps(inv_step);
                let lanes = depths.len() / 4 * 4;
                let mut i = 0;
                while i < lanes {
                    let d = _mm_loadu_ps(depths.as_ptr().add(i));
                    let scaled = _mm_mul_ps(_mm_sub_ps(d, min_v), step_v);
                    let idx = _mm_cvttps_epi32(scaled);
                    _mm_storeu_si128(out.as_mut_ptr().add(i) as *mut __m128i, idx);
                    i += 4;
                }
                fill_scalar(&depths[lanes..], min, inv_step, &mut out[lanes..]);
            }

            #[target_feature(enable = "avx2")]
            unsafe fn fill_avx2(depths: &[f32], min: f32, inv_step: f32, out: &mut [u32]) {
                use std::arch::x86_64::*;
                let min_v = _mm256_set1_ps(min);
                let step_v = _mm256_set1_ps(inv_step);
                let lanes = depths.len() / 8 * 8;
                let mut i = 0;
                while i < lanes {
                    let d = _mm256_loadu_ps(depths.as_ptr().add(i));
                    let scaled = _mm256_mul_ps(_mm256_sub_ps(d, min_v), step_v);
                    let idx = _mm256_cvttps_epi32(scaled);
                    _mm256_storeu_si256(out.as_mut_ptr().add(i) as *mut __m256i, idx);
                    i += 8;
                }
                fill_scalar(&depths[lanes..], min, inv_step, &mut out[lanes..]);
            }

            fn fill_scalar(depths: &[f32], min: f32, inv_step: f32, out: &mut [u32]) {
                for (o, &d) in out.iter_mut().zip(depths) {
                    *o = ((d - min) * inv_step) as u32;
                }
            }
        } else {
            pub(super) fn bucket_indices(
                depths: &[f32],
                min: f32,
                inv_step: f32,
                out: &mut Vec<u32>,
            ) {
                out.clear();
                out.reserve(depths.len());
                for &d in depths {
                    out.push(((d - min) * inv_step) as u32);
                }
            }
        }
    }
}
