//! Turns raw `.ply`/`.splat` byte streams into canonical section attribute
//! arrays, honoring an alpha-removal threshold and a target harmonics
//! degree. The renderer-facing layout is what `SectionData` documents:
//! linear scales, xyzw rotations, RGBA bytes with opacity in A.

use crate::common::{clamp_u8, degree_for_coeffs, inv_sigmoid, sh_coeffs_for_degree, sigmoid, SH_C0};
use crate::error::SplatError;
use crate::store::{SectionData, SplatStore};
use foldhash::{HashMap, HashMapExt};
use std::io::Write;

/// Bytes per record of the flat `.splat` format: position and scale as
/// f32 triples, RGBA color bytes, then the rotation packed one byte per
/// component.
const SPLAT_RECORD_BYTES: usize = 32;

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            Some(&buffer[start..start + pos])
        }
        None => {
            *offset = buffer.len();
            Some(&buffer[start..])
        }
    }
}

#[inline(always)]
fn idx_of(hm: &HashMap<&str, usize>, name: &str) -> Result<usize, SplatError> {
    hm.get(name)
        .cloned()
        .ok_or_else(|| SplatError::ParseSplat(format!("Missing required field: {}", name)))
}

#[inline(always)]
fn field_f32(data: &[u8], field_name: &str) -> Result<f32, SplatError> {
    Ok(f32::from_le_bytes(data.try_into().map_err(|e| {
        SplatError::ParseSplat(format!("Byte conversion error for {}: {}", field_name, e))
    })?))
}

/// Parses a binary little-endian PLY splat stream into one section.
/// Splats whose opacity maps below `alpha_threshold` are excluded here,
/// at load time; they are never clamped. Harmonics beyond `target_degree`
/// are discarded.
pub fn parse_ply(
    raw_data: &[u8],
    alpha_threshold: u8,
    target_degree: u8,
) -> Result<SectionData, SplatError> {
    let mut offset = 0;

    let line1 = next_line(raw_data, &mut offset)
        .ok_or_else(|| SplatError::ParseSplat("No 'ply' line".to_string()))?;
    if line1 != b"ply" {
        return Err(SplatError::ParseSplat(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let line2 = next_line(raw_data, &mut offset)
        .ok_or_else(|| SplatError::ParseSplat("Missing format line".to_string()))?;
    if line2 != b"format binary_little_endian 1.0" {
        return Err(SplatError::ParseSplat(
            "Unsupported .ply format (only binary_little_endian 1.0 is supported)".to_string(),
        ));
    }

    let line3 = next_line(raw_data, &mut offset)
        .ok_or_else(|| SplatError::ParseSplat("Missing 'element vertex' line".to_string()))?;
    if !line3.starts_with(b"element vertex ") {
        return Err(SplatError::ParseSplat(
            "Missing 'element vertex' definition".to_string(),
        ));
    }
    let num_str = &line3[b"element vertex ".len()..];
    let num_points: usize = {
        let s = std::str::from_utf8(num_str)
            .map_err(|e| SplatError::ParseSplat(format!("UTF-8 error: {}", e)))?
            .trim();
        s.parse()
            .map_err(|e| SplatError::ParseSplat(format!("Parse error: {}", e)))?
    };
    if num_points == 0 {
        return Ok(SectionData::default());
    }

    let mut field_names = Vec::new();
    loop {
        let line = match next_line(raw_data, &mut offset) {
            Some(l) => l,
            None => {
                return Err(SplatError::ParseSplat(
                    "No 'end_header' found before EOF".to_string(),
                ))
            }
        };
        if line.starts_with(b"end_header") {
            break;
        }
        if !line.starts_with(b"property float ") {
            return Err(SplatError::ParseSplat(format!(
                "Unsupported property line: {:?}",
                line
            )));
        }
        field_names.push(&line[b"property float ".len()..]);
    }

    let mut field_map: HashMap<&str, usize> = HashMap::with_capacity(field_names.len());
    for (i, &f_bytes) in field_names.iter().enumerate() {
        let s = std::str::from_utf8(f_bytes)
            .map_err(|e| SplatError::ParseSplat(format!("UTF-8 error in field name: {}", e)))?;
        field_map.insert(s, i);
    }

    let ix = idx_of(&field_map, "x")?;
    let iy = idx_of(&field_map, "y")?;
    let iz = idx_of(&field_map, "z")?;
    let is0 = idx_of(&field_map, "scale_0")?;
    let is1 = idx_of(&field_map, "scale_1")?;
    let is2 = idx_of(&field_map, "scale_2")?;
    let ir0 = idx_of(&field_map, "rot_0")?;
    let ir1 = idx_of(&field_map, "rot_1")?;
    let ir2 = idx_of(&field_map, "rot_2")?;
    let ir3 = idx_of(&field_map, "rot_3")?;
    let iop = idx_of(&field_map, "opacity")?;
    let ic0 = idx_of(&field_map, "f_dc_0")?;
    let ic1 = idx_of(&field_map, "f_dc_1")?;
    let ic2 = idx_of(&field_map, "f_dc_2")?;

    // Optional spherical harmonics: f_rest_0 to f_rest_44 (up to degree 3
    // in the file; anything past degree 2 is discarded below).
    let mut sh_idx = Vec::new();
    for i in 0..45 {
        let nm = format!("f_rest_{}", i);
        if let Some(&found) = field_map.get(nm.as_str()) {
            sh_idx.push(found);
        } else {
            break;
        }
    }
    if sh_idx.len() % 3 != 0 {
        return Err(SplatError::ParseSplat(
            "Incomplete spherical harmonics fields".to_string(),
        ));
    }
    let file_coeffs = sh_idx.len() / 3;
    let coeffs = sh_coeffs_for_degree(degree_for_coeffs(file_coeffs).min(target_degree))
        .min(file_coeffs);

    let fields_per_vertex = field_names.len();
    let expected_bytes = num_points
        .checked_mul(fields_per_vertex)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| SplatError::ParseSplat("Overflow in byte calculation".to_string()))?;
    if raw_data.len() < offset + expected_bytes {
        return Err(SplatError::ParseSplat(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected_bytes,
            raw_data.len() - offset
        )));
    }

    let data = &raw_data[offset..offset + expected_bytes];
    let mut section = SectionData::with_capacity(num_points, degree_for_coeffs(coeffs));

    // PLY stores harmonics channel-major; the section layout is
    // coefficient-major RGB.
    let sh_indices: Vec<_> = (0..coeffs)
        .map(|j| (sh_idx[j], sh_idx[j + file_coeffs], sh_idx[j + 2 * file_coeffs]))
        .collect();
    let mut sh = Vec::with_capacity(coeffs * 3);

    let mut cursor = 0;
    for _ in 0..num_points {
        let vertex = &data[cursor..cursor + fields_per_vertex * 4];
        cursor += fields_per_vertex * 4;

        let opacity = clamp_u8(sigmoid(field_f32(&vertex[iop * 4..(iop + 1) * 4], "opacity")?) * 255.0);
        if opacity < alpha_threshold {
            continue;
        }

        let position = [
            field_f32(&vertex[ix * 4..(ix + 1) * 4], "x")?,
            field_f32(&vertex[iy * 4..(iy + 1) * 4], "y")?,
            field_f32(&vertex[iz * 4..(iz + 1) * 4], "z")?,
        ];
        // Scales are stored in log space; the renderer wants standard
        // deviations.
        let scale = [
            field_f32(&vertex[is0 * 4..(is0 + 1) * 4], "scale_0")?.exp(),
            field_f32(&vertex[is1 * 4..(is1 + 1) * 4], "scale_1")?.exp(),
            field_f32(&vertex[is2 * 4..(is2 + 1) * 4], "scale_2")?.exp(),
        ];
        // rot_0 is w; the section layout is xyzw.
        let mut rotation = [
            field_f32(&vertex[ir1 * 4..(ir1 + 1) * 4], "rot_1")?,
            field_f32(&vertex[ir2 * 4..(ir2 + 1) * 4], "rot_2")?,
            field_f32(&vertex[ir3 * 4..(ir3 + 1) * 4], "rot_3")?,
            field_f32(&vertex[ir0 * 4..(ir0 + 1) * 4], "rot_0")?,
        ];
        crate::common::normalize_quat(&mut rotation);

        let color = [
            clamp_u8((0.5 + SH_C0 * field_f32(&vertex[ic0 * 4..(ic0 + 1) * 4], "f_dc_0")?) * 255.0),
            clamp_u8((0.5 + SH_C0 * field_f32(&vertex[ic1 * 4..(ic1 + 1) * 4], "f_dc_1")?) * 255.0),
            clamp_u8((0.5 + SH_C0 * field_f32(&vertex[ic2 * 4..(ic2 + 1) * 4], "f_dc_2")?) * 255.0),
            opacity,
        ];

        sh.clear();
        for &(r_idx, g_idx, b_idx) in &sh_indices {
            sh.push(field_f32(&vertex[r_idx * 4..(r_idx + 1) * 4], "sh_r")?);
            sh.push(field_f32(&vertex[g_idx * 4..(g_idx + 1) * 4], "sh_g")?);
            sh.push(field_f32(&vertex[b_idx * 4..(b_idx + 1) * 4], "sh_b")?);
        }

        section.push_splat(position, scale, rotation, color, &sh);
    }

    Ok(section)
}

/// Harmonics degree a parsed section actually carries, which may be lower
/// than the requested target when the file had fewer coefficients.
pub fn sh_degree_of(section: &SectionData) -> u8 {
    let count = section.positions.len() / 3;
    if count == 0 {
        return 0;
    }
    degree_for_coeffs(section.sh.len() / count / 3)
}

/// Parses the flat 32-byte-record `.splat` format into one section. The
/// format carries no harmonics.
pub fn parse_splat_stream(raw_data: &[u8], alpha_threshold: u8) -> Result<SectionData, SplatError> {
    if raw_data.len() % SPLAT_RECORD_BYTES != 0 {
        return Err(SplatError::ParseSplat(format!(
            ".splat stream length {} is not a multiple of the record size",
            raw_data.len()
        )));
    }
    let count = raw_data.len() / SPLAT_RECORD_BYTES;
    let mut section = SectionData::with_capacity(count, 0);
    for record in raw_data.chunks_exact(SPLAT_RECORD_BYTES) {
        let opacity = record[27];
        if opacity < alpha_threshold {
            continue;
        }
        let f = |at: usize| f32::from_le_bytes(record[at..at + 4].try_into().unwrap());
        let position = [f(0), f(4), f(8)];
        let scale = [f(12), f(16), f(20)];
        let color = [record[24], record[25], record[26], opacity];
        // Rotation bytes are wxyz mapped onto [0, 255].
        let unpack = |b: u8| (b as f32 - 128.0) / 128.0;
        let mut rotation = [
            unpack(record[29]),
            unpack(record[30]),
            unpack(record[31]),
            unpack(record[28]),
        ];
        crate::common::normalize_quat(&mut rotation);
        section.push_splat(position, scale, rotation, color, &[]);
    }
    Ok(section)
}

/// Writes the store back out as a binary little-endian PLY stream, the
/// inverse of `parse_ply`'s attribute mapping.
pub fn export_ply(store: &SplatStore) -> Result<Vec<u8>, SplatError> {
    let num_points = store.total_count();
    let coeffs = sh_coeffs_for_degree(store.sh_degree());

    let mut output = Vec::new();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", num_points).map_err(SplatError::IoError)?;
    output.extend_from_slice(b"property float x\nproperty float y\nproperty float z\n");
    output.extend_from_slice(
        b"property float f_dc_0\nproperty float f_dc_1\nproperty float f_dc_2\n",
    );
    for i in 0..(coeffs * 3) {
        writeln!(output, "property float f_rest_{}", i).map_err(SplatError::IoError)?;
    }
    output.extend_from_slice(
        b"property float opacity\n\
          property float scale_0\nproperty float scale_1\nproperty float scale_2\n\
          property float rot_0\nproperty float rot_1\nproperty float rot_2\nproperty float rot_3\n\
          end_header\n",
    );

    let point_size = (3 + 3 + coeffs * 3 + 1 + 3 + 4) * 4;
    output.reserve(num_points * point_size);

    let mut sh_coeffs = Vec::with_capacity(coeffs * 3);
    for i in 0..num_points {
        let splat = store.get(i).expect("index below total_count");

        output.extend_from_slice(bytemuck::cast_slice(&splat.position));

        let f_dc = splat.color[..3]
            .iter()
            .map(|&c| (c as f32 / 255.0 - 0.5) / SH_C0)
            .collect::<Vec<f32>>();
        output.extend_from_slice(bytemuck::cast_slice(&f_dc));

        // Back to channel-major for the PLY layout.
        sh_coeffs.clear();
        for channel in 0..3 {
            for j in 0..coeffs {
                sh_coeffs.push(splat.sh[j * 3 + channel]);
            }
        }
        output.extend_from_slice(bytemuck::cast_slice(&sh_coeffs));

        let alpha = (splat.color[3] as f32 / 255.0).clamp(1.0 / 512.0, 1.0 - 1.0 / 512.0);
        output.extend_from_slice(bytemuck::bytes_of(&inv_sigmoid(alpha)));

        let log_scale = splat.scale.map(|s| s.max(f32::MIN_POSITIVE).ln());
        output.extend_from_slice(bytemuck::cast_slice(&log_scale));

        let rot = [
            splat.rotation[3],
            splat.rotation[0],
            splat.rotation[1],
            splat.rotation[2],
        ];
        output.extend_from_slice(bytemuck::cast_slice(&rot));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ply(opacity_logits: &[f32]) -> Vec<u8> {
        let mut header = String::from(
            "ply\nformat binary_little_endian 1.0\n",
        );
        header.push_str(&format!("element vertex {}\n", opacity_logits.len()));
        for name in [
            "x", "y", "z", "scale_0", "scale_1", "scale_2", "rot_0", "rot_1", "rot_2", "rot_3",
            "opacity", "f_dc_0", "f_dc_1", "f_dc_2",
        ] {
            header.push_str(&format!("property float {}\n", name));
        }
        header.push_str("end_header\n");

        let mut raw = header.into_bytes();
        for (n, &logit) in opacity_logits.iter().enumerate() {
            #[rustfmt::skip]
            let floats = [
                n as f32, 0.1, 0.2,
                -2.0, -2.5, -3.0,
                1.0, 0.0, 0.0, 0.0,
                logit,
                0.2, 0.3, 0.4,
            ];
            for f in floats {
                raw.extend_from_slice(&f.to_le_bytes());
            }
        }
        raw
    }

    #[test]
    fn parses_a_minimal_ply_vertex() {
        let raw = test_ply(&[0.5]);
        let section = parse_ply(&raw, 1, 0).expect("parse");
        let mut store = SplatStore::new(0);
        store.append_section(section).expect("append");
        let splat = store.get(0).expect("splat");
        assert_eq!(splat.position, [0.0, 0.1, 0.2]);
        // exp of the log scales.
        assert!((splat.scale[0] - (-2.0f32).exp()).abs() < 1e-6);
        // Identity quaternion lands as xyzw.
        assert_eq!(splat.rotation, [0.0, 0.0, 0.0, 1.0]);
        // sigmoid(0.5) * 255.
        assert_eq!(splat.color[3], 159);
    }

    #[test]
    fn alpha_threshold_drops_splats_at_load_time() {
        // sigmoid(-6) * 255 rounds to 1; a threshold of 10 drops it.
        let raw = test_ply(&[0.5, -6.0, 2.0]);
        let section = parse_ply(&raw, 10, 0).expect("parse");
        assert_eq!(section.positions.len() / 3, 2);
    }

    #[test]
    fn zero_vertex_ply_parses_empty() {
        let data =
            b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header";
        let section = parse_ply(data, 1, 0).expect("parse");
        assert!(section.positions.is_empty());
    }

    #[test]
    fn truncated_ply_is_rejected() {
        let mut raw = test_ply(&[0.5]);
        raw.truncate(raw.len() - 4);
        let err = parse_ply(&raw, 1, 0).expect_err("short buffer");
        assert!(matches!(err, SplatError::ParseSplat(_)));
    }

    #[test]
    fn ply_export_round_trips_through_parse() {
        let raw = test_ply(&[0.5, 1.5]);
        let section = parse_ply(&raw, 1, 0).expect("parse");
        let mut store = SplatStore::new(0);
        store.append_section(section).expect("append");

        let exported = export_ply(&store).expect("export");
        let reparsed = parse_ply(&exported, 1, 0).expect("reparse");
        let mut store2 = SplatStore::new(0);
        store2.append_section(reparsed).expect("append");

        assert_eq!(store2.total_count(), 2);
        for i in 0..2 {
            let a = store.get(i).expect("a");
            let b = store2.get(i).expect("b");
            assert_eq!(a.position, b.position);
            assert_eq!(a.color, b.color);
            for (x, y) in a.scale.iter().zip(b.scale) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn splat_stream_records_decode() {
        let mut raw = Vec::new();
        for (z, alpha) in [(1.0f32, 255u8), (2.0, 0)] {
            raw.extend_from_slice(&0.5f32.to_le_bytes());
            raw.extend_from_slice(&1.5f32.to_le_bytes());
            raw.extend_from_slice(&z.to_le_bytes());
            for s in [0.1f32, 0.2, 0.3] {
                raw.extend_from_slice(&s.to_le_bytes());
            }
            raw.extend_from_slice(&[200, 150, 100, alpha]);
            raw.extend_from_slice(&[255, 128, 128, 128]); // identity-ish wxyz
        }
        let section = parse_splat_stream(&raw, 1).expect("parse");
        assert_eq!(section.positions.len() / 3, 1, "transparent record dropped");
        assert_eq!(section.positions[..3], [0.5, 1.5, 1.0]);
        assert_eq!(section.colors[..4], [200, 150, 100, 255]);
        // w byte 255 dominates; xyz bytes sit at the midpoint.
        assert!(section.rotations[3] > 0.99);
    }

    #[test]
    fn splat_stream_rejects_ragged_lengths() {
        let err = parse_splat_stream(&[0u8; 33], 1).expect_err("ragged");
        assert!(matches!(err, SplatError::ParseSplat(_)));
    }
}
