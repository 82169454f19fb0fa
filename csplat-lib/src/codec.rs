use crate::common::{normalize_quat, sh_floats_for_degree};
use crate::error::SplatError;
use crate::store::{SectionData, SplatStore};
use foldhash::{HashMap, HashMapExt};
use std::io::{Cursor, Write};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zstd::stream::{decode_all, Encoder};

pub const MAGIC: u32 = 0x4C505343; // 'CSPL'
pub const VERSION: u32 = 1;

const U16_MAX_CODE: u32 = u16::MAX as u32;
const U8_MAX_CODE: u32 = u8::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    /// Original precision retained.
    Uncompressed,
    /// Position/scale/rotation/harmonics as 16-bit codes.
    Quantized,
    /// As `Quantized` with harmonics squeezed to 8-bit codes.
    QuantizedSh,
}

impl CompressionLevel {
    pub fn from_u8(v: u8) -> Result<Self, SplatError> {
        match v {
            0 => Ok(Self::Uncompressed),
            1 => Ok(Self::Quantized),
            2 => Ok(Self::QuantizedSh),
            other => Err(SplatError::MalformedInput(format!(
                "unknown compression level {}",
                other
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Uncompressed => 0,
            Self::Quantized => 1,
            Self::QuantizedSh => 2,
        }
    }

    fn sh_max_code(self) -> u32 {
        match self {
            Self::QuantizedSh => U8_MAX_CODE,
            _ => U16_MAX_CODE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeConfig {
    pub level: CompressionLevel,
    /// Splats with opacity below this are dropped during encode and
    /// cannot be recovered by decode.
    pub alpha_threshold: u8,
    /// Target harmonics degree; clamped to what the store carries.
    pub sh_degree: u8,
    /// Edge length of the coarse grid cells used for spatial bucketing.
    pub block_size: f32,
    /// Splats per quantization bucket.
    pub bucket_size: u32,
    pub scene_center: [f32; 3],
    pub zstd_level: u32,
    pub zstd_workers: u32,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Uncompressed,
            alpha_threshold: 1,
            sh_degree: 0,
            block_size: 5.0,
            bucket_size: 256,
            scene_center: [0.0; 3],
            zstd_level: 3,
            zstd_workers: 1,
        }
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
struct FileHeader {
    magic: u32,
    version: u32,
    splat_count: u32,
    section_count: u32,
    bucket_size: u32,
    block_size: f32,
    scene_center: [f32; 3],
    sh_degree: u8,
    level: u8,
    reserved: [u8; 2],
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
struct SectionHeader {
    splat_count: u32,
    bucket_count: u32,
    bounds_min: [f32; 3],
    bounds_max: [f32; 3],
}

/// Affine dequantization frame of one bucket: `value = center + code * step`
/// per component. Decoding depends on nothing outside the bucket.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default)]
#[repr(C)]
struct BucketHeader {
    count: u32,
    pos_center: [f32; 3],
    pos_step: [f32; 3],
    scale_center: [f32; 3],
    scale_step: [f32; 3],
    rot_center: [f32; 4],
    rot_step: [f32; 4],
    sh_center: f32,
    sh_step: f32,
}

#[inline]
fn quant_frame(min: f32, max: f32, max_code: u32) -> (f32, f32) {
    let step = (max - min) / max_code as f32;
    if step.is_finite() && step > 0.0 {
        (min, step)
    } else {
        (min, 0.0)
    }
}

#[inline]
fn quant_code(v: f32, center: f32, step: f32, max_code: u32) -> u32 {
    if step <= 0.0 {
        return 0;
    }
    (((v - center) / step).round() as i64).clamp(0, max_code as i64) as u32
}

#[inline]
fn dequant(code: u32, center: f32, step: f32) -> f32 {
    center + code as f32 * step
}

/// Orders the surviving splats of one section so spatially adjacent splats
/// land in the same bucket: survivors are binned into a coarse grid of
/// `block_size` cells around the scene center, and cells are emitted in
/// sorted key order.
fn spatial_order(
    positions: &[f32],
    survivors: Vec<u32>,
    center: [f32; 3],
    block_size: f32,
) -> Vec<u32> {
    let inv = 1.0 / block_size.max(f32::MIN_POSITIVE);
    let mut cells: HashMap<[i32; 3], Vec<u32>> = HashMap::new();
    for &i in &survivors {
        let p = &positions[i as usize * 3..i as usize * 3 + 3];
        let key = [
            ((p[0] - center[0]) * inv).floor() as i32,
            ((p[1] - center[1]) * inv).floor() as i32,
            ((p[2] - center[2]) * inv).floor() as i32,
        ];
        cells.entry(key).or_default().push(i);
    }
    let mut keys: Vec<[i32; 3]> = cells.keys().copied().collect();
    keys.sort_unstable();
    let mut ordered = Vec::with_capacity(survivors.len());
    for key in keys {
        ordered.extend_from_slice(&cells[&key]);
    }
    ordered
}

fn push_u16_codes(out: &mut Vec<u8>, values: impl Iterator<Item = u32>) {
    for v in values {
        out.extend_from_slice(&(v as u16).to_le_bytes());
    }
}

fn push_u8_codes(out: &mut Vec<u8>, values: impl Iterator<Item = u32>) {
    for v in values {
        out.push(v as u8);
    }
}

/// Serializes the store into the compact splat format and wraps the image
/// in a zstd frame.
pub fn encode(store: &SplatStore, config: &EncodeConfig) -> Result<Vec<u8>, SplatError> {
    let sh_degree = config.sh_degree.min(store.sh_degree());
    let sh_len = sh_floats_for_degree(sh_degree);
    let bucket_size = config.bucket_size.max(1) as usize;

    // Survivors per section; sections emptied by the alpha threshold are
    // dropped from the stream entirely.
    let mut section_orders = Vec::new();
    for section in store.sections() {
        let survivors: Vec<u32> = section
            .range()
            .map(|i| i as u32)
            .filter(|&i| store.colors()[i as usize * 4 + 3] >= config.alpha_threshold)
            .collect();
        if survivors.is_empty() {
            continue;
        }
        section_orders.push(spatial_order(
            store.positions(),
            survivors,
            config.scene_center,
            config.block_size,
        ));
    }
    let total: usize = section_orders.iter().map(|o| o.len()).sum();

    let header = FileHeader {
        magic: MAGIC,
        version: VERSION,
        splat_count: total as u32,
        section_count: section_orders.len() as u32,
        bucket_size: bucket_size as u32,
        block_size: config.block_size,
        scene_center: config.scene_center,
        sh_degree,
        level: config.level.as_u8(),
        reserved: [0; 2],
    };
    let mut raw = Vec::with_capacity(std::mem::size_of::<FileHeader>() + total * 32);
    raw.extend_from_slice(header.as_bytes());

    for order in &section_orders {
        let mut bounds_min = [f32::INFINITY; 3];
        let mut bounds_max = [f32::NEG_INFINITY; 3];
        for &i in order {
            let p = &store.positions()[i as usize * 3..i as usize * 3 + 3];
            for a in 0..3 {
                bounds_min[a] = bounds_min[a].min(p[a]);
                bounds_max[a] = bounds_max[a].max(p[a]);
            }
        }
        let bucket_count = order.len().div_ceil(bucket_size);
        let section_header = SectionHeader {
            splat_count: order.len() as u32,
            bucket_count: bucket_count as u32,
            bounds_min,
            bounds_max,
        };
        raw.extend_from_slice(section_header.as_bytes());

        for bucket in order.chunks(bucket_size) {
            encode_bucket(store, bucket, config.level, sh_len, &mut raw);
        }
    }

    compress_zstd(&raw, config.zstd_level, config.zstd_workers)
}

fn encode_bucket(
    store: &SplatStore,
    bucket: &[u32],
    level: CompressionLevel,
    sh_len: usize,
    out: &mut Vec<u8>,
) {
    let mut header = BucketHeader {
        count: bucket.len() as u32,
        ..BucketHeader::default()
    };

    if level != CompressionLevel::Uncompressed {
        let mut pos_min = [f32::INFINITY; 3];
        let mut pos_max = [f32::NEG_INFINITY; 3];
        let mut scale_min = [f32::INFINITY; 3];
        let mut scale_max = [f32::NEG_INFINITY; 3];
        let mut rot_min = [f32::INFINITY; 4];
        let mut rot_max = [f32::NEG_INFINITY; 4];
        let mut sh_min = f32::INFINITY;
        let mut sh_max = f32::NEG_INFINITY;
        for &i in bucket {
            let i = i as usize;
            for a in 0..3 {
                let p = store.positions()[i * 3 + a];
                pos_min[a] = pos_min[a].min(p);
                pos_max[a] = pos_max[a].max(p);
                let s = store.scales()[i * 3 + a];
                scale_min[a] = scale_min[a].min(s);
                scale_max[a] = scale_max[a].max(s);
            }
            for a in 0..4 {
                let r = store.rotations()[i * 4 + a];
                rot_min[a] = rot_min[a].min(r);
                rot_max[a] = rot_max[a].max(r);
            }
            for &v in &store.sh()[i * sh_len..(i + 1) * sh_len] {
                sh_min = sh_min.min(v);
                sh_max = sh_max.max(v);
            }
        }
        for a in 0..3 {
            (header.pos_center[a], header.pos_step[a]) =
                quant_frame(pos_min[a], pos_max[a], U16_MAX_CODE);
            (header.scale_center[a], header.scale_step[a]) =
                quant_frame(scale_min[a], scale_max[a], U16_MAX_CODE);
        }
        for a in 0..4 {
            (header.rot_center[a], header.rot_step[a]) =
                quant_frame(rot_min[a], rot_max[a], U16_MAX_CODE);
        }
        if sh_len > 0 {
            (header.sh_center, header.sh_step) = quant_frame(sh_min, sh_max, level.sh_max_code());
        }
    }
    out.extend_from_slice(header.as_bytes());

    match level {
        CompressionLevel::Uncompressed => {
            for &i in bucket {
                let i = i as usize;
                out.extend_from_slice(bytemuck::cast_slice(&store.positions()[i * 3..i * 3 + 3]));
            }
            for &i in bucket {
                let i = i as usize;
                out.extend_from_slice(bytemuck::cast_slice(&store.scales()[i * 3..i * 3 + 3]));
            }
            for &i in bucket {
                let i = i as usize;
                out.extend_from_slice(bytemuck::cast_slice(&store.rotations()[i * 4..i * 4 + 4]));
            }
            for &i in bucket {
                let i = i as usize;
                out.extend_from_slice(&store.colors()[i * 4..i * 4 + 4]);
            }
            for &i in bucket {
                let i = i as usize;
                out.extend_from_slice(bytemuck::cast_slice(
                    &store.sh()[i * sh_len..(i + 1) * sh_len],
                ));
            }
        }
        CompressionLevel::Quantized | CompressionLevel::QuantizedSh => {
            push_u16_codes(
                out,
                bucket.iter().flat_map(|&i| {
                    let i = i as usize;
                    (0..3).map(move |a| (i, a))
                }).map(|(i, a)| {
                    quant_code(
                        store.positions()[i * 3 + a],
                        header.pos_center[a],
                        header.pos_step[a],
                        U16_MAX_CODE,
                    )
                }),
            );
            push_u16_codes(
                out,
                bucket.iter().flat_map(|&i| {
                    let i = i as usize;
                    (0..3).map(move |a| (i, a))
                }).map(|(i, a)| {
                    quant_code(
                        store.scales()[i * 3 + a],
                        header.scale_center[a],
                        header.scale_step[a],
                        U16_MAX_CODE,
                    )
                }),
            );
            push_u16_codes(
                out,
                bucket.iter().flat_map(|&i| {
                    let i = i as usize;
                    (0..4).map(move |a| (i, a))
                }).map(|(i, a)| {
                    quant_code(
                        store.rotations()[i * 4 + a],
                        header.rot_center[a],
                        header.rot_step[a],
                        U16_MAX_CODE,
                    )
                }),
            );
            for &i in bucket {
                let i = i as usize;
                out.extend_from_slice(&store.colors()[i * 4..i * 4 + 4]);
            }
            let sh_codes = bucket.iter().flat_map(|&i| {
                let i = i as usize;
                store.sh()[i * sh_len..(i + 1) * sh_len].iter().map(|&v| {
                    quant_code(v, header.sh_center, header.sh_step, level.sh_max_code())
                })
            });
            if level == CompressionLevel::QuantizedSh {
                push_u8_codes(out, sh_codes);
            } else {
                push_u16_codes(out, sh_codes);
            }
        }
    }
}

/// Reconstructs a store from a compact splat buffer. Failure leaves no
/// partial state behind; rotations are renormalized after dequantization.
pub fn decode(buffer: &[u8]) -> Result<SplatStore, SplatError> {
    let data = decompress_zstd(buffer)?;
    let (header, mut rest) = FileHeader::read_from_prefix(data.as_slice())
        .map_err(|_| SplatError::MalformedInput("buffer shorter than the file header".to_string()))?;
    if header.magic != MAGIC {
        return Err(SplatError::MalformedInput("invalid magic number".to_string()));
    }
    if header.version != VERSION {
        return Err(SplatError::MalformedInput(format!(
            "unsupported format version {}",
            header.version
        )));
    }
    let level = CompressionLevel::from_u8(header.level)?;
    if header.sh_degree > 2 {
        return Err(SplatError::MalformedInput(format!(
            "unsupported harmonics degree {}",
            header.sh_degree
        )));
    }
    let sh_len = sh_floats_for_degree(header.sh_degree);

    let mut store = SplatStore::new(header.sh_degree);
    let mut decoded_total = 0usize;
    for _ in 0..header.section_count {
        let (section, tail) = SectionHeader::read_from_prefix(rest)
            .map_err(|_| SplatError::MalformedInput("truncated section header".to_string()))?;
        rest = tail;
        let mut data = SectionData::with_capacity(section.splat_count as usize, header.sh_degree);
        let mut remaining = section.splat_count as usize;
        for _ in 0..section.bucket_count {
            let (bucket, tail) = BucketHeader::read_from_prefix(rest)
                .map_err(|_| SplatError::MalformedInput("truncated bucket header".to_string()))?;
            rest = tail;
            let count = bucket.count as usize;
            if count > remaining {
                return Err(SplatError::MalformedInput(
                    "bucket counts exceed the section splat count".to_string(),
                ));
            }
            remaining -= count;
            rest = decode_bucket(&bucket, level, sh_len, count, rest, &mut data)?;
        }
        if remaining != 0 {
            return Err(SplatError::MalformedInput(
                "section ends before its declared splat count".to_string(),
            ));
        }
        decoded_total += section.splat_count as usize;
        store.append_section(data)?;
    }
    if decoded_total != header.splat_count as usize {
        return Err(SplatError::MalformedInput(format!(
            "decoded {} splats, header declares {}",
            decoded_total, header.splat_count
        )));
    }
    Ok(store)
}

fn decode_bucket<'a>(
    header: &BucketHeader,
    level: CompressionLevel,
    sh_len: usize,
    count: usize,
    mut rest: &'a [u8],
    data: &mut SectionData,
) -> Result<&'a [u8], SplatError> {
    let take = |rest: &mut &'a [u8], len: usize, what: &str| -> Result<&'a [u8], SplatError> {
        if rest.len() < len {
            return Err(SplatError::MalformedInput(format!(
                "truncated {} payload, need {} bytes, have {}",
                what,
                len,
                rest.len()
            )));
        }
        let (head, tail) = rest.split_at(len);
        *rest = tail;
        Ok(head)
    };
    let read_f32s = |bytes: &[u8], out: &mut Vec<f32>| {
        out.extend(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
    };

    match level {
        CompressionLevel::Uncompressed => {
            read_f32s(take(&mut rest, count * 12, "position")?, &mut data.positions);
            read_f32s(take(&mut rest, count * 12, "scale")?, &mut data.scales);
            read_f32s(take(&mut rest, count * 16, "rotation")?, &mut data.rotations);
            data.colors
                .extend_from_slice(take(&mut rest, count * 4, "color")?);
            read_f32s(take(&mut rest, count * sh_len * 4, "harmonics")?, &mut data.sh);
        }
        CompressionLevel::Quantized | CompressionLevel::QuantizedSh => {
            let base = data.rotations.len();
            let pos = take(&mut rest, count * 6, "position")?;
            for (n, b) in pos.chunks_exact(2).enumerate() {
                let a = n % 3;
                let code = u16::from_le_bytes([b[0], b[1]]) as u32;
                data.positions
                    .push(dequant(code, header.pos_center[a], header.pos_step[a]));
            }
            let scales = take(&mut rest, count * 6, "scale")?;
            for (n, b) in scales.chunks_exact(2).enumerate() {
                let a = n % 3;
                let code = u16::from_le_bytes([b[0], b[1]]) as u32;
                data.scales
                    .push(dequant(code, header.scale_center[a], header.scale_step[a]));
            }
            let rots = take(&mut rest, count * 8, "rotation")?;
            for (n, b) in rots.chunks_exact(2).enumerate() {
                let a = n % 4;
                let code = u16::from_le_bytes([b[0], b[1]]) as u32;
                data.rotations
                    .push(dequant(code, header.rot_center[a], header.rot_step[a]));
            }
            // Quantization can denormalize the quaternion.
            for q in data.rotations[base..].chunks_exact_mut(4) {
                normalize_quat(q);
            }
            data.colors
                .extend_from_slice(take(&mut rest, count * 4, "color")?);
            if level == CompressionLevel::QuantizedSh {
                let sh = take(&mut rest, count * sh_len, "harmonics")?;
                data.sh.extend(
                    sh.iter()
                        .map(|&b| dequant(b as u32, header.sh_center, header.sh_step)),
                );
            } else {
                let sh = take(&mut rest, count * sh_len * 2, "harmonics")?;
                data.sh.extend(sh.chunks_exact(2).map(|b| {
                    dequant(
                        u16::from_le_bytes([b[0], b[1]]) as u32,
                        header.sh_center,
                        header.sh_step,
                    )
                }));
            }
        }
    }
    Ok(rest)
}

fn compress_zstd(data: &[u8], level: u32, workers: u32) -> Result<Vec<u8>, SplatError> {
    let mut encoder = Encoder::new(Vec::new(), level as i32)
        .map_err(|e| SplatError::ZstdCompress(format!("Encoder creation failed: {}", e)))?;
    encoder
        .multithread(workers)
        .map_err(|e| SplatError::ZstdCompress(format!("Setting multithread failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| SplatError::ZstdCompress(format!("Writing data failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SplatError::ZstdCompress(format!("Finalizing compression failed: {}", e)))
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, SplatError> {
    decode_all(Cursor::new(data))
        .map_err(|e| SplatError::ZstdDecompress(format!("Decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SplatStore;

    fn test_store(sh_degree: u8, splats: &[([f32; 3], u8)]) -> SplatStore {
        let sh_len = sh_floats_for_degree(sh_degree);
        let mut data = SectionData::with_capacity(splats.len(), sh_degree);
        for (n, (p, alpha)) in splats.iter().enumerate() {
            let sh: Vec<f32> = (0..sh_len).map(|k| (n * sh_len + k) as f32 * 0.01 - 0.1).collect();
            data.push_splat(
                *p,
                [0.05 + n as f32 * 0.01, 0.06, 0.07],
                [0.1, 0.2, -0.3, 0.9],
                [n as u8 * 10, 100, 200, *alpha],
                &sh,
            );
        }
        let mut store = SplatStore::new(sh_degree);
        store.append_section(data).expect("append");
        store
    }

    #[test]
    fn level0_round_trip_is_exact() {
        let store = test_store(
            1,
            &[([0.5, -1.5, 3.25], 255), ([10.0, 2.0, -4.0], 128), ([-3.0, 7.5, 0.0], 17)],
        );
        let config = EncodeConfig {
            sh_degree: 1,
            ..EncodeConfig::default()
        };
        let bytes = encode(&store, &config).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded.total_count(), 3);
        assert_eq!(decoded.sh_degree(), 1);

        // Spatial bucketing may reorder splats; match them by color tag.
        for i in 0..3 {
            let orig = store.get(i).expect("orig");
            let found = (0..3)
                .map(|j| decoded.get(j).expect("decoded"))
                .find(|s| s.color == orig.color)
                .expect("splat survives");
            assert_eq!(found.position, orig.position);
            assert_eq!(found.scale, orig.scale);
            assert_eq!(found.rotation, orig.rotation);
            assert_eq!(found.sh, orig.sh);
        }
    }

    #[test]
    fn level1_drops_low_alpha_and_stays_within_the_error_bound() {
        let store = test_store(
            0,
            &[([0.0, 0.0, 0.0], 255), ([1.0, 2.0, 3.0], 0), ([4.0, 5.0, 6.0], 200)],
        );
        let config = EncodeConfig {
            level: CompressionLevel::Quantized,
            alpha_threshold: 1,
            ..EncodeConfig::default()
        };
        let bytes = encode(&store, &config).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded.total_count(), 2, "one splat under the alpha threshold");

        // One bucket spans the survivors, so the per-axis frame step is
        // the survivor min/max range over 16-bit codes.
        let steps = [4.0f32 / 65535.0, 5.0 / 65535.0, 6.0 / 65535.0];
        for j in 0..2 {
            let s = decoded.get(j).expect("splat");
            let orig = if s.color[0] == 0 {
                store.get(0).expect("orig")
            } else {
                store.get(2).expect("orig")
            };
            for a in 0..3 {
                assert!(
                    (s.position[a] - orig.position[a]).abs() <= steps[a] * 0.5 + 1e-6,
                    "position error past the quantization bound"
                );
            }
            let norm: f32 = s.rotation.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "rotation must decode unit length");
        }
    }

    #[test]
    fn level2_squeezes_harmonics_to_one_byte() {
        let store = test_store(2, &[([0.0; 3], 255), ([1.0, 1.0, 1.0], 255)]);
        let config = EncodeConfig {
            level: CompressionLevel::QuantizedSh,
            sh_degree: 2,
            ..EncodeConfig::default()
        };
        let bytes = encode(&store, &config).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded.sh_degree(), 2);
        assert_eq!(decoded.sh().len(), 2 * 24);

        let sh_min = store.sh().iter().copied().fold(f32::INFINITY, f32::min);
        let sh_max = store.sh().iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let step = (sh_max - sh_min) / 255.0;
        for (a, b) in store.sh().iter().zip(decoded.sh()) {
            assert!((a - b).abs() <= step * 0.5 + 1e-6);
        }
    }

    #[test]
    fn sections_survive_the_round_trip_independently() {
        let mut store = SplatStore::new(0);
        for section in 0..3 {
            let mut data = SectionData::with_capacity(4, 0);
            for n in 0..4 {
                data.push_splat(
                    [section as f32 * 100.0 + n as f32, 0.0, 0.0],
                    [0.1; 3],
                    [0.0, 0.0, 0.0, 1.0],
                    [section, n, 0, 255],
                    &[],
                );
            }
            store.append_section(data).expect("append");
        }
        let bytes = encode(&store, &EncodeConfig::default()).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded.sections().len(), 3);
        assert_eq!(decoded.total_count(), 12);
        for s in decoded.sections() {
            assert_eq!(s.count(), 4);
        }
    }

    #[test]
    fn truncated_buffers_are_malformed_not_fatal() {
        let store = test_store(0, &[([0.0; 3], 255), ([1.0; 3], 255)]);
        let bytes = encode(&store, &EncodeConfig::default()).expect("encode");
        let inner = decompress_zstd(&bytes).expect("zstd layer intact");
        let clipped = compress_zstd(&inner[..inner.len() - 8], 3, 1).expect("recompress");
        let err = decode(&clipped).expect_err("truncated");
        assert!(matches!(err, SplatError::MalformedInput(_)));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut inner = Vec::new();
        inner.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        inner.resize(64, 0);
        let bytes = compress_zstd(&inner, 3, 1).expect("compress");
        let err = decode(&bytes).expect_err("bad magic");
        assert!(matches!(err, SplatError::MalformedInput(_)));
    }

    #[test]
    fn garbage_outer_frame_fails_in_the_zstd_layer() {
        let err = decode(&[1, 2, 3, 4, 5]).expect_err("not zstd");
        assert!(matches!(err, SplatError::ZstdDecompress(_)));
    }

    #[test]
    fn bucket_boundaries_do_not_leak_state() {
        // Two buckets with very different value ranges; each must decode
        // from its own frame.
        let splats: Vec<([f32; 3], u8)> = (0..6)
            .map(|n| {
                let offset = if n < 3 { 0.0 } else { 1000.0 };
                ([offset + n as f32, 0.0, 0.0], 255)
            })
            .collect();
        let store = test_store(0, &splats);
        let config = EncodeConfig {
            level: CompressionLevel::Quantized,
            bucket_size: 3,
            block_size: 10.0,
            ..EncodeConfig::default()
        };
        let bytes = encode(&store, &config).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded.total_count(), 6);
        let mut xs: Vec<f32> = (0..6).map(|i| decoded.position(i).x).collect();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let expected = [0.0f32, 1.0, 2.0, 1003.0, 1004.0, 1005.0];
        for (x, e) in xs.iter().zip(expected) {
            assert!((x - e).abs() < 0.1, "decoded {} expected {}", x, e);
        }
    }
}
